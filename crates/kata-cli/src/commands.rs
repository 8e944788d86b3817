//! Command handlers. Each one maps to a subcommand in `main.rs`.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use kata_core::env::{load_override_file, render_override_file};
use kata_core::manifest::split_assignment;
use kata_core::{AppPaths, DeploymentMode, HostLayout, sanitize_app_name};
use kata_pipeline::{
    DeployReport, DeploymentPipeline, GitCheckout, KataConfig, PipelineError, Trigger, default_root,
    deploy_target, hook_script, parse_hook_input,
};
use kata_proxy::{HttpAdminClient, ProxyReconciler};
use kata_runtime::{BackendError, CliBackend, LogOptions};
use kata_secrets::{SecretValue, SecretsManager};

/// Everything a command needs: the layout, the host config and the live clients.
pub struct Host {
    root: PathBuf,
    layout: HostLayout,
    config: KataConfig,
    backend: CliBackend,
    admin: HttpAdminClient,
    git: GitCheckout,
}

impl Host {
    pub fn load() -> Result<Self> {
        let root = default_root();
        let config = KataConfig::load(&root)
            .with_context(|| format!("failed to load configuration from {}", root.display()))?;
        let backend = CliBackend::new(config.runtime.binary.clone())
            .with_compose_args(config.runtime.compose_args.clone())
            .with_timeout(config.runtime_timeout());
        let admin = HttpAdminClient::new(&config.proxy.admin_url, config.proxy_timeout())?;
        let git = GitCheckout::new(config.git.binary.clone());
        tracing::debug!(root = %root.display(), proxy = %admin.base_url(), "Loaded host configuration");
        Ok(Self {
            layout: HostLayout::new(root.clone()),
            root,
            config,
            backend,
            admin,
            git,
        })
    }

    fn pipeline(&self) -> DeploymentPipeline<'_> {
        DeploymentPipeline::new(self.layout.clone(), &self.backend, &self.admin, &self.git)
            .with_ambient(std::env::vars().collect())
            .with_lock_wait(self.config.lock_wait())
    }

    /// Paths for an app that has been pushed at least once.
    fn existing(&self, raw: &str) -> Result<AppPaths> {
        let name = sanitize_app_name(raw)?;
        let paths = self.layout.app(&name);
        if !paths.code.is_dir() {
            bail!("app '{name}' not found");
        }
        Ok(paths)
    }

    fn app_mode(&self, paths: &AppPaths) -> Result<DeploymentMode> {
        Ok(self
            .pipeline()
            .mode(&paths.name)?
            .unwrap_or(DeploymentMode::SingleHost))
    }

    pub fn apps(&self) -> Result<()> {
        for name in self.layout.list_apps()? {
            let marker = if self.layout.app(&name).descriptor().exists() {
                "*"
            } else {
                " "
            };
            println!("{marker}{name}");
        }
        Ok(())
    }

    pub async fn deploy(&self, app: &str) -> Result<()> {
        let name = sanitize_app_name(app)?;
        let report = self.pipeline().deploy(&name, Trigger::Manual).await?;
        print_report(&report);
        Ok(())
    }

    pub async fn restart(&self, app: &str) -> Result<()> {
        let name = sanitize_app_name(app)?;
        let report = self.pipeline().deploy(&name, Trigger::Restart).await?;
        print_report(&report);
        Ok(())
    }

    pub async fn stop(&self, app: &str) -> Result<()> {
        let paths = self.existing(app)?;
        let output = self.pipeline().stop(&paths.name).await?;
        print!("{}", output.stdout);
        println!("-----> {} stopped", paths.name);
        Ok(())
    }

    pub async fn logs(
        &self,
        app: &str,
        service: Option<&str>,
        tail: Option<usize>,
        follow: bool,
    ) -> Result<()> {
        let paths = self.existing(app)?;
        let output = self
            .pipeline()
            .logs(&paths.name, service, LogOptions { tail, follow })
            .await?;
        print!("{}", output.stdout);
        eprint!("{}", output.stderr);
        Ok(())
    }

    pub async fn ps(&self, app: &str) -> Result<()> {
        let paths = self.existing(app)?;
        let output = self.pipeline().ps(&paths.name).await?;
        print!("{}", output.stdout);
        Ok(())
    }

    /// Exits with the command's own status when it fails.
    pub async fn run(&self, app: &str, service: Option<&str>, command: &[String]) -> Result<()> {
        let paths = self.existing(app)?;
        match self.pipeline().exec(&paths.name, service, command).await {
            Ok(_) => Ok(()),
            Err(PipelineError::Backend(BackendError::Failed { status, .. })) if status > 0 => {
                std::process::exit(status)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove(&self, app: &str, wipe: bool) -> Result<()> {
        let name = sanitize_app_name(app)?;
        let paths = self.layout.app(&name);
        if !paths.code.exists() && !paths.repo.exists() {
            bail!("app '{name}' not found");
        }
        self.pipeline().destroy(&name, wipe).await?;
        println!("-----> {name} removed");
        if !wipe {
            println!("Data kept in {} and {}", paths.data.display(), paths.config.display());
        }
        Ok(())
    }

    fn overrides(&self, paths: &AppPaths) -> Result<BTreeMap<String, String>> {
        let entries = load_override_file(&paths.override_file())?;
        Ok(entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect())
    }

    fn write_overrides(&self, paths: &AppPaths, entries: &BTreeMap<String, String>) -> Result<()> {
        std::fs::create_dir_all(&paths.config)?;
        std::fs::write(paths.override_file(), render_override_file(entries))?;
        println!("Run `kata restart {}` to apply.", paths.name);
        Ok(())
    }

    pub fn config(&self, app: &str) -> Result<()> {
        let paths = self.existing(app)?;
        print!("{}", render_override_file(&self.overrides(&paths)?));
        Ok(())
    }

    pub fn config_get(&self, app: &str, key: &str) -> Result<()> {
        let paths = self.existing(app)?;
        if let Some(value) = self.overrides(&paths)?.get(key) {
            println!("{value}");
        }
        Ok(())
    }

    pub fn config_set(&self, app: &str, assignments: &[String]) -> Result<()> {
        let paths = self.existing(app)?;
        let mut entries = self.overrides(&paths)?;
        for assignment in assignments {
            let (key, value) = split_assignment(assignment);
            if key.is_empty() || !assignment.contains('=') {
                bail!("expected KEY=VALUE, got '{assignment}'");
            }
            println!("Setting {key} for '{}'", paths.name);
            entries.insert(key, value);
        }
        self.write_overrides(&paths, &entries)
    }

    pub fn config_unset(&self, app: &str, keys: &[String]) -> Result<()> {
        let paths = self.existing(app)?;
        let mut entries = self.overrides(&paths)?;
        for key in keys {
            if entries.remove(key).is_some() {
                println!("Unsetting {key} for '{}'", paths.name);
            }
        }
        self.write_overrides(&paths, &entries)
    }

    pub fn config_live(&self, app: &str) -> Result<()> {
        let paths = self.existing(app)?;
        let live = paths.live_env_file();
        if !live.exists() {
            bail!("app '{}' has not been deployed", paths.name);
        }
        print!("{}", std::fs::read_to_string(live)?);
        Ok(())
    }

    pub fn manifest(&self, app: &str) -> Result<()> {
        let paths = self.existing(app)?;
        let manifest = paths.manifest();
        let content = std::fs::read_to_string(&manifest)
            .with_context(|| format!("failed to read {}", manifest.display()))?;
        print!("{content}");
        Ok(())
    }

    pub fn descriptor(&self, app: &str) -> Result<()> {
        let paths = self.existing(app)?;
        let descriptor = paths.descriptor();
        if !descriptor.exists() {
            bail!("app '{}' has no descriptor yet; deploy it first", paths.name);
        }
        print!("{}", std::fs::read_to_string(descriptor)?);
        Ok(())
    }

    pub async fn routing(&self, app: &str) -> Result<()> {
        let paths = self.existing(app)?;
        let reconciler = ProxyReconciler::new(&self.admin, self.layout.proxy_lock());
        match reconciler.section(&paths.name).await? {
            Some(section) => println!("{}", serde_json::to_string_pretty(&section)?),
            None => println!("No routing for '{}'", paths.name),
        }
        Ok(())
    }

    pub fn mode(&self, app: &str) -> Result<()> {
        let paths = self.existing(app)?;
        match self.pipeline().mode(&paths.name)? {
            Some(mode) => println!("{mode}"),
            None => println!("unset (decided on first deploy)"),
        }
        Ok(())
    }

    pub async fn set_mode(&self, app: &str, mode: &str) -> Result<()> {
        let paths = self.existing(app)?;
        let mode: DeploymentMode = mode.parse()?;
        let change = self.pipeline().set_mode(&paths.name, mode).await?;
        println!("-----> {} mode set to {}", paths.name, change.mode);
        if change.redeploy_required {
            println!("Run `kata deploy {}` to move the running stack.", paths.name);
        }
        Ok(())
    }

    pub async fn secrets_list(&self, app: &str) -> Result<()> {
        let paths = self.existing(app)?;
        let mode = self.app_mode(&paths)?;
        for name in SecretsManager::new(&self.backend, &paths.name, mode).list().await? {
            println!("{name}");
        }
        Ok(())
    }

    pub async fn secrets_set(&self, app: &str, name: &str, value: Option<String>) -> Result<()> {
        let paths = self.existing(app)?;
        let mode = self.app_mode(&paths)?;
        let value = match value {
            Some(value) => value,
            None => {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("failed to read secret from stdin")?;
                buf.trim_end_matches(['\r', '\n']).to_string()
            }
        };
        SecretsManager::new(&self.backend, &paths.name, mode)
            .set(name, &SecretValue::new(value))
            .await?;
        println!("-----> Secret '{name}' stored for '{}'", paths.name);
        Ok(())
    }

    pub async fn secrets_remove(&self, app: &str, name: &str) -> Result<()> {
        let paths = self.existing(app)?;
        let mode = self.app_mode(&paths)?;
        SecretsManager::new(&self.backend, &paths.name, mode)
            .remove(name)
            .await?;
        println!("-----> Secret '{name}' removed from '{}'", paths.name);
        Ok(())
    }

    pub fn setup(&self) -> Result<()> {
        for dir in self.layout.all_dirs() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        println!("Host layout ready under {}", self.root.display());
        Ok(())
    }

    /// Post-receive hook: deploy the pushed revision of the deploy branch.
    pub async fn git_hook(&self, app: &str) -> Result<()> {
        let name = sanitize_app_name(app)?;
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("failed to read hook input")?;
        let updates = parse_hook_input(&input)?;
        let deploy_ref = self.config.deploy_ref();
        let Some(target) = deploy_target(&updates, &deploy_ref) else {
            tracing::info!(app = %name, deploy_ref = %deploy_ref, "No update for deploy branch");
            return Ok(());
        };
        let report = self
            .pipeline()
            .deploy(&name, Trigger::Push { rev: target.new.clone() })
            .await?;
        print_report(&report);
        Ok(())
    }

    /// Entry point for SSH pushes and fetches.
    pub async fn git_shell(&self, command: &str, app: &str) -> Result<()> {
        let name = sanitize_app_name(app)?;
        let paths = self.layout.app(&name);
        if command == "git-receive-pack" {
            let exe = std::env::current_exe().context("failed to locate the kata binary")?;
            self.git
                .init_bare(&paths, &hook_script(&self.root, &exe, &name))
                .await?;
        } else if !paths.repo.is_dir() {
            bail!("app '{name}' not found");
        }

        let status = tokio::process::Command::new("git-shell")
            .arg("-c")
            .arg(format!("{command} '{name}'"))
            .current_dir(self.layout.repos_dir())
            .status()
            .await
            .context("failed to run git-shell")?;
        if !status.success() {
            bail!("{command} exited with {status}");
        }
        Ok(())
    }
}

fn print_report(report: &DeployReport) {
    print!("{}", report.output.stdout);
    eprint!("{}", report.output.stderr);
    println!(
        "-----> {} is up ({}, routing {}, {} ms)",
        report.app, report.mode, report.routing, report.elapsed_ms
    );
}
