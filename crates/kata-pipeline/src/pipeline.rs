//! The deployment pipeline: `received -> resolved -> generated -> routed -> started`.
//!
//! Each run holds the app's lock from `resolved` through `started`. Nothing
//! is rolled back on failure; the error names the step that failed.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use kata_core::{
    AppManifest, AppPaths, DependencyDigests, DeploymentMode, DescriptorGenerator,
    EnvironmentResolver, HostLayout, Identity, LockGuard, ModeChange, ModeResolution,
    ModeSelector, ModeStore, ResolvedEnvironment,
};
use kata_proxy::{ProxyAdmin, ProxyReconciler};
use kata_runtime::{BackendOutput, ContainerBackend, LogOptions, StackRef};
use kata_secrets::SecretsManager;

use crate::checkout::SourceSync;
use crate::error::PipelineError;
use crate::types::{DeployReport, PipelineState, Trigger};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Everything the `resolved` step produces.
struct Resolved {
    manifest: AppManifest,
    env: ResolvedEnvironment,
    mode: ModeResolution,
}

pub struct DeploymentPipeline<'a> {
    layout: HostLayout,
    backend: &'a dyn ContainerBackend,
    admin: &'a dyn ProxyAdmin,
    source: &'a dyn SourceSync,
    ambient: BTreeMap<String, String>,
    lock_wait: Duration,
}

impl<'a> DeploymentPipeline<'a> {
    pub fn new(
        layout: HostLayout,
        backend: &'a dyn ContainerBackend,
        admin: &'a dyn ProxyAdmin,
        source: &'a dyn SourceSync,
    ) -> Self {
        Self {
            layout,
            backend,
            admin,
            source,
            ambient: BTreeMap::new(),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Fallback values for `$VAR` references (normally the operator's environment).
    pub fn with_ambient(mut self, ambient: BTreeMap<String, String>) -> Self {
        self.ambient = ambient;
        self
    }

    /// How long to wait for the app and proxy locks.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    fn reconciler(&self) -> ProxyReconciler<'a> {
        ProxyReconciler::new(self.admin, self.layout.proxy_lock()).with_lock_wait(self.lock_wait)
    }

    fn stack(paths: &AppPaths, mode: DeploymentMode) -> StackRef {
        StackRef {
            app: paths.name.clone(),
            mode,
            descriptor: paths.descriptor(),
            working_dir: paths.code.clone(),
        }
    }

    /// Run the pipeline once for `app`.
    pub async fn deploy(&self, app: &str, trigger: Trigger) -> Result<DeployReport, PipelineError> {
        let started_at = Instant::now();
        let paths = self.layout.app(app);
        tracing::info!(app = %app, trigger = %trigger, state = %PipelineState::Received, "Pipeline transition");

        let result = self.run(&paths, &trigger, started_at).await;
        if let Err(e) = &result {
            tracing::error!(
                app = %app,
                state = %PipelineState::Failed,
                failed_at = %e.state().unwrap_or(PipelineState::Received),
                kind = %e.kind(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %e,
                "Pipeline transition"
            );
        }
        result
    }

    async fn run(
        &self,
        paths: &AppPaths,
        trigger: &Trigger,
        started_at: Instant,
    ) -> Result<DeployReport, PipelineError> {
        let app = paths.name.as_str();
        let transition = |state: PipelineState| {
            tracing::info!(
                app = %app,
                state = %state,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Pipeline transition"
            );
        };

        let _app_lock = LockGuard::acquire(&paths.lock, self.lock_wait)
            .await
            .map_err(|e| PipelineError::at(app, PipelineState::Resolved)(e.into()))?;

        let resolved = self
            .resolve(paths, trigger)
            .await
            .map_err(PipelineError::at(app, PipelineState::Resolved))?;
        transition(PipelineState::Resolved);

        let previous_descriptor = std::fs::read_to_string(paths.descriptor()).ok();
        let descriptor = self
            .generate(paths, &resolved)
            .map_err(PipelineError::at(app, PipelineState::Generated))?;
        transition(PipelineState::Generated);

        let routing = self
            .reconciler()
            .apply(app, resolved.manifest.routing.as_ref(), &resolved.env)
            .await
            .map_err(|e| PipelineError::at(app, PipelineState::Routed)(e.into()))?;
        transition(PipelineState::Routed);

        let stack = Self::stack(paths, resolved.mode.mode);
        let unchanged = previous_descriptor.as_deref() == Some(descriptor.as_str());
        let output = match trigger {
            Trigger::Restart if unchanged => self.backend.restart(&stack).await,
            _ => self.backend.up(&stack).await,
        }
        .map_err(|e| PipelineError::at(app, PipelineState::Started)(e.into()))?;

        std::fs::write(paths.live_env_file(), resolved.env.to_env_file())
            .map_err(|e| PipelineError::at(app, PipelineState::Started)(e.into()))?;
        transition(PipelineState::Started);

        Ok(DeployReport {
            app: app.to_string(),
            mode: resolved.mode.mode,
            mode_source: resolved.mode.source,
            routing,
            output,
            elapsed_ms: started_at.elapsed().as_millis() as u64,
        })
    }

    async fn resolve(&self, paths: &AppPaths, trigger: &Trigger) -> Result<Resolved, PipelineError> {
        match trigger {
            Trigger::Push { rev } => {
                paths.create_runtime_dirs()?;
                self.source.sync(paths, rev).await?;
            }
            Trigger::Restart | Trigger::Manual => {
                if !paths.code.is_dir() {
                    return Err(PipelineError::AppNotFound(paths.name.clone()));
                }
                paths.create_runtime_dirs()?;
            }
        }

        let manifest = AppManifest::load(&paths.name, &paths.manifest())?;
        let identity = Identity::from_owner(self.layout.root())?;
        let env = EnvironmentResolver::new(paths.clone(), identity)
            .with_ambient(self.ambient.clone())
            .resolve(&manifest)?;

        let store = ModeStore::new(paths.mode_file());
        let mode = ModeSelector::new(self.backend)
            .resolve_mode(&store, manifest.mode_override)
            .await?;
        tracing::info!(app = %paths.name, mode = %mode.mode, source = %mode.source, "Deployment mode");

        if mode.mode == DeploymentMode::Clustered && manifest.uses_secrets() {
            let missing = SecretsManager::new(self.backend, &paths.name, mode.mode)
                .missing(&manifest)
                .await?;
            if !missing.is_empty() {
                tracing::warn!(app = %paths.name, missing = ?missing, "Secrets not yet created");
            }
        }

        Ok(Resolved { manifest, env, mode })
    }

    fn generate(&self, paths: &AppPaths, resolved: &Resolved) -> Result<String, PipelineError> {
        let digests = DependencyDigests::compute(&paths.code)?;
        let generator = DescriptorGenerator::new(paths);
        let descriptor =
            generator.generate(&resolved.manifest, &resolved.env, resolved.mode.mode, &digests)?;
        let yaml = descriptor.to_yaml()?;
        let path = generator.write(&descriptor)?;
        tracing::debug!(app = %paths.name, path = %path.display(), "Wrote descriptor");
        Ok(yaml)
    }

    /// The persisted mode, if the app has been deployed before.
    pub fn mode(&self, app: &str) -> Result<Option<DeploymentMode>, PipelineError> {
        Ok(ModeStore::new(self.layout.app(app).mode_file()).load()?)
    }

    /// Persist a new mode. The running stack changes on the next deploy.
    pub async fn set_mode(&self, app: &str, mode: DeploymentMode) -> Result<ModeChange, PipelineError> {
        let paths = self.layout.app(app);
        if !paths.code.is_dir() {
            return Err(PipelineError::AppNotFound(app.to_string()));
        }
        let _app_lock = LockGuard::acquire(&paths.lock, self.lock_wait).await?;
        let change = ModeSelector::new(self.backend)
            .set_mode(&ModeStore::new(paths.mode_file()), mode)
            .await?;
        tracing::info!(
            app = %app,
            mode = %change.mode,
            redeploy_required = change.redeploy_required,
            "Deployment mode changed"
        );
        Ok(change)
    }

    /// Stop the app's containers. Routing is left in place.
    pub async fn stop(&self, app: &str) -> Result<BackendOutput, PipelineError> {
        let paths = self.layout.app(app);
        let mode = self
            .mode(app)?
            .ok_or_else(|| PipelineError::AppNotFound(app.to_string()))?;
        let _app_lock = LockGuard::acquire(&paths.lock, self.lock_wait).await?;
        let output = self.backend.stop(&Self::stack(&paths, mode)).await?;
        tracing::info!(app = %app, mode = %mode, "Stopped");
        Ok(output)
    }

    /// Stack of an app that has been deployed at least once, with its manifest.
    fn deployed(&self, app: &str) -> Result<(StackRef, AppManifest), PipelineError> {
        let paths = self.layout.app(app);
        if !paths.code.is_dir() {
            return Err(PipelineError::AppNotFound(app.to_string()));
        }
        let mode = self
            .mode(app)?
            .ok_or_else(|| PipelineError::NotDeployed(app.to_string()))?;
        let manifest = AppManifest::load(app, &paths.manifest())?;
        Ok((Self::stack(&paths, mode), manifest))
    }

    fn known_service(app: &str, manifest: &AppManifest, service: &str) -> Result<(), PipelineError> {
        if manifest.service(service).is_none() {
            return Err(PipelineError::UnknownService {
                app: app.to_string(),
                service: service.to_string(),
            });
        }
        Ok(())
    }

    /// Containers (single-host) or tasks (clustered) of the app's stack.
    pub async fn ps(&self, app: &str) -> Result<BackendOutput, PipelineError> {
        let (stack, _) = self.deployed(app)?;
        Ok(self.backend.ps(&stack).await?)
    }

    /// Log output of one service, or of every service when `service` is `None`.
    pub async fn logs(
        &self,
        app: &str,
        service: Option<&str>,
        options: LogOptions,
    ) -> Result<BackendOutput, PipelineError> {
        let (stack, manifest) = self.deployed(app)?;
        if let Some(service) = service {
            Self::known_service(app, &manifest, service)?;
        }
        Ok(self.backend.logs(&stack, service, options).await?)
    }

    /// Run a command inside a running service container, attached to the
    /// terminal. Defaults to the manifest's first service.
    pub async fn exec(
        &self,
        app: &str,
        service: Option<&str>,
        command: &[String],
    ) -> Result<BackendOutput, PipelineError> {
        if command.is_empty() {
            return Err(PipelineError::Config("no command given".into()));
        }
        let (stack, manifest) = self.deployed(app)?;
        let service = match service {
            Some(name) => {
                Self::known_service(app, &manifest, name)?;
                name.to_string()
            }
            None => manifest
                .services
                .first()
                .map(|(name, _)| name.clone())
                .ok_or_else(|| PipelineError::NotDeployed(app.to_string()))?,
        };
        tracing::info!(app = %app, service = %service, mode = %stack.mode, "Running command in service");
        Ok(self.backend.exec(&stack, &service, command).await?)
    }

    /// Remove routing and the stack, then the app's directories.
    ///
    /// Data and config survive unless `wipe` is set.
    pub async fn destroy(&self, app: &str, wipe: bool) -> Result<(), PipelineError> {
        let paths = self.layout.app(app);
        let _app_lock = LockGuard::acquire(&paths.lock, self.lock_wait).await?;

        let outcome = self.reconciler().remove(app).await?;
        tracing::info!(app = %app, outcome = %outcome, "Routing removed");

        // Without a mode file nothing was ever started.
        if let Some(mode) = self.mode(app)?
            && (mode == DeploymentMode::Clustered || paths.descriptor().exists())
        {
            self.backend.down(&Self::stack(&paths, mode)).await?;
        }

        let mut doomed = vec![&paths.code, &paths.repo, &paths.env, &paths.logs];
        if wipe {
            doomed.extend([&paths.data, &paths.config]);
        }
        for dir in doomed {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
                tracing::info!(app = %app, path = %dir.display(), "Removed directory");
            }
        }
        if !wipe {
            for dir in [&paths.data, &paths.config] {
                if dir.exists() {
                    tracing::info!(app = %app, path = %dir.display(), "Preserved directory");
                }
            }
        }
        Ok(())
    }
}
