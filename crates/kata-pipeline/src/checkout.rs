use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use kata_core::AppPaths;

use crate::error::PipelineError;

/// Brings an app's working tree to a given revision.
///
/// Uses Pin<Box<dyn Future>> for dyn-compatibility.
pub trait SourceSync: Send + Sync {
    fn sync<'a>(
        &'a self,
        paths: &'a AppPaths,
        rev: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
}

/// Git working trees cloned from the app's bare repository.
#[derive(Debug, Clone)]
pub struct GitCheckout {
    binary: String,
}

impl GitCheckout {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, PipelineError> {
        let command = args.first().copied().unwrap_or_default().to_string();
        // Hooks run with GIT_DIR pointing at the bare repo.
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .current_dir(cwd)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .env_remove("GIT_INDEX_FILE")
            .output()
            .await
            .map_err(|e| PipelineError::Git {
                command: command.clone(),
                message: format!("failed to run {}: {e}", self.binary),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(PipelineError::Git {
                command,
                message: format!("stdout: {stdout}\nstderr: {stderr}"),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Create the bare repository and its post-receive hook if missing.
    pub async fn init_bare(&self, paths: &AppPaths, hook_script: &str) -> Result<PathBuf, PipelineError> {
        let hook = paths.repo.join("hooks").join("post-receive");
        if hook.exists() {
            return Ok(hook);
        }
        std::fs::create_dir_all(&paths.repo)?;
        self.git(&paths.repo, &["init", "--quiet", "--bare"]).await?;
        if let Some(parent) = hook.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&hook, hook_script)?;
        make_executable(&hook)?;
        tracing::info!(app = %paths.name, repo = %paths.repo.display(), "Created repository");
        Ok(hook)
    }
}

/// The post-receive hook that hands pushes back to `kata git-hook`.
pub fn hook_script(root: &Path, kata_exe: &Path, app: &str) -> String {
    format!(
        "#!/usr/bin/env bash\nset -e; set -o pipefail;\ncat | KATA_ROOT=\"{}\" \"{}\" git-hook {app}\n",
        root.display(),
        kata_exe.display()
    )
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o700);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

impl SourceSync for GitCheckout {
    fn sync<'a>(
        &'a self,
        paths: &'a AppPaths,
        rev: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            if !paths.code.exists() {
                let parent = paths.code.parent().unwrap_or(Path::new("."));
                std::fs::create_dir_all(parent)?;
                let repo = paths.repo.to_string_lossy().into_owned();
                let code = paths.code.to_string_lossy().into_owned();
                self.git(parent, &["clone", "--quiet", &repo, &code]).await?;
                tracing::info!(app = %paths.name, "Cloned working tree");
            }
            self.git(&paths.code, &["fetch", "--quiet"]).await?;
            self.git(&paths.code, &["reset", "--hard", "--quiet", rev]).await?;
            self.git(
                &paths.code,
                &["submodule", "update", "--init", "--recursive", "--quiet"],
            )
            .await?;
            tracing::info!(app = %paths.name, rev = %rev, "Checked out revision");
            Ok(())
        })
    }
}
