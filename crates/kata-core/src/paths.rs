use std::path::{Path, PathBuf};

use crate::error::CoreError;

/// File name of the per-app manifest at the checkout root.
pub const MANIFEST_FILE: &str = "kata.yaml";
const MANIFEST_FALLBACK: &str = "kata.yml";

/// Generated descriptor, relative to the app's code directory.
pub const DESCRIPTOR_FILE: &str = ".kata-compose.yaml";

/// Persisted deployment mode, relative to the app's code directory.
pub const MODE_FILE: &str = ".kata-mode";

/// Operator override file inside the app's config directory.
pub const OVERRIDE_FILE: &str = "ENV";

/// Snapshot of the last deployed app-wide environment inside the env directory.
pub const LIVE_ENV_FILE: &str = "LIVE_ENV";

/// Host-wide directory layout under the kata root.
///
/// ```text
/// root/
///   apps/<app>/     -- git checkout (code), descriptor, mode file
///   data/<app>/     -- persistent app data
///   config/<app>/   -- operator config, ENV override file
///   envs/<app>/     -- runtime dependency environment, LIVE_ENV
///   logs/<app>/     -- logs
///   repos/<app>/    -- bare git repository receiving pushes
///   locks/          -- advisory lock files
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.root.join("envs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Lock serializing every proxy reconciliation on this host.
    pub fn proxy_lock(&self) -> PathBuf {
        self.locks_dir().join("proxy.lock")
    }

    /// Every top-level directory `setup` creates.
    pub fn all_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.apps_dir(),
            self.data_dir(),
            self.config_dir(),
            self.envs_dir(),
            self.logs_dir(),
            self.repos_dir(),
            self.locks_dir(),
        ]
    }

    /// Paths for one app. The name must already be sanitized.
    pub fn app(&self, name: &str) -> AppPaths {
        AppPaths {
            name: name.to_string(),
            code: self.apps_dir().join(name),
            data: self.data_dir().join(name),
            config: self.config_dir().join(name),
            env: self.envs_dir().join(name),
            logs: self.logs_dir().join(name),
            repo: self.repos_dir().join(name),
            lock: self.locks_dir().join(format!("app-{name}.lock")),
        }
    }

    /// Sorted names of apps that have a code directory.
    pub fn list_apps(&self) -> Result<Vec<String>, CoreError> {
        let dir = self.apps_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir()
                && let Some(name) = path.file_name()
            {
                names.push(name.to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// The canonical per-app directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub name: String,
    pub code: PathBuf,
    pub data: PathBuf,
    pub config: PathBuf,
    pub env: PathBuf,
    pub logs: PathBuf,
    pub repo: PathBuf,
    pub lock: PathBuf,
}

impl AppPaths {
    /// The manifest path, preferring `kata.yaml` over `kata.yml`.
    pub fn manifest(&self) -> PathBuf {
        let primary = self.code.join(MANIFEST_FILE);
        let fallback = self.code.join(MANIFEST_FALLBACK);
        if !primary.exists() && fallback.exists() {
            fallback
        } else {
            primary
        }
    }

    pub fn descriptor(&self) -> PathBuf {
        self.code.join(DESCRIPTOR_FILE)
    }

    pub fn mode_file(&self) -> PathBuf {
        self.code.join(MODE_FILE)
    }

    pub fn override_file(&self) -> PathBuf {
        self.config.join(OVERRIDE_FILE)
    }

    pub fn live_env_file(&self) -> PathBuf {
        self.env.join(LIVE_ENV_FILE)
    }

    /// Create every directory an app needs at runtime (not the code checkout).
    pub fn create_runtime_dirs(&self) -> Result<(), CoreError> {
        for dir in [&self.data, &self.config, &self.env, &self.logs] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Reduce an app name to lowercase alphanumerics, `_` and `-`, starting with
/// an alphanumeric.
///
/// The result doubles as the compose project and stack name, so two distinct
/// app directories can never share one.
pub fn sanitize_app_name(raw: &str) -> Result<String, CoreError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
        .collect();
    let cleaned = cleaned.trim_start_matches(['_', '-']).to_string();
    if cleaned.is_empty() {
        return Err(CoreError::InvalidAppName(raw.to_string()));
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitizes_app_names() {
        assert_eq!(sanitize_app_name("my-app").unwrap(), "my-app");
        assert_eq!(sanitize_app_name("/my app!").unwrap(), "myapp");
        assert_eq!(sanitize_app_name("'blog.v2'").unwrap(), "blogv2");
        assert_eq!(sanitize_app_name("../etc").unwrap(), "etc");
        assert_eq!(sanitize_app_name("Blog").unwrap(), "blog");
        assert_eq!(sanitize_app_name("_private").unwrap(), "private");
        assert!(sanitize_app_name("-_.").is_err());
        assert!(sanitize_app_name("///").is_err());
        assert!(sanitize_app_name("").is_err());
    }

    #[test]
    fn distinct_app_names_stay_distinct() {
        // Names that only differ in punctuation must not map to the same
        // project, so everything kept is already a valid project name.
        for raw in ["blog-v2", "blog_v2", "blogv2"] {
            let name = sanitize_app_name(raw).unwrap();
            assert_eq!(name, raw);
            assert!(name.chars().all(|c| c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || c == '_'
                || c == '-'));
        }
    }

    #[test]
    fn app_paths_follow_layout() {
        let layout = HostLayout::new(PathBuf::from("/srv/kata"));
        let app = layout.app("blog");
        assert_eq!(app.code, PathBuf::from("/srv/kata/apps/blog"));
        assert_eq!(app.data, PathBuf::from("/srv/kata/data/blog"));
        assert_eq!(app.override_file(), PathBuf::from("/srv/kata/config/blog/ENV"));
        assert_eq!(
            app.descriptor(),
            PathBuf::from("/srv/kata/apps/blog/.kata-compose.yaml")
        );
        assert_eq!(app.lock, PathBuf::from("/srv/kata/locks/app-blog.lock"));
    }

    #[test]
    fn manifest_falls_back_to_yml() {
        let tmp = TempDir::new().unwrap();
        let layout = HostLayout::new(tmp.path().to_path_buf());
        let app = layout.app("site");
        std::fs::create_dir_all(&app.code).unwrap();
        assert!(app.manifest().ends_with("kata.yaml"));

        std::fs::write(app.code.join("kata.yml"), "services: {}").unwrap();
        assert!(app.manifest().ends_with("kata.yml"));
    }

    #[test]
    fn lists_apps_sorted() {
        let tmp = TempDir::new().unwrap();
        let layout = HostLayout::new(tmp.path().to_path_buf());
        assert!(layout.list_apps().unwrap().is_empty());

        std::fs::create_dir_all(layout.app("zeta").code).unwrap();
        std::fs::create_dir_all(layout.app("alpha").code).unwrap();
        assert_eq!(layout.list_apps().unwrap(), vec!["alpha", "zeta"]);
    }
}
