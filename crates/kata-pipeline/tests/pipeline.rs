use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use kata_core::{AppPaths, DeploymentMode, ErrorKind, HostLayout, LockGuard, ModeSource};
use kata_pipeline::{DeploymentPipeline, PipelineError, PipelineState, SourceSync, Trigger};
use kata_proxy::{MemoryAdminClient, ReconcileOutcome};
use kata_runtime::{BackendCall, LogOptions, StubBackend};
use serde_json::json;
use tempfile::TempDir;

const REV: &str = "1111111111111111111111111111111111111111";

const ROUTED_MANIFEST: &str = r#"
environment:
  PORT: 8000
services:
  web:
    image: ghcr.io/example/web:latest
    command: serve --port $PORT
routing:
  listen: [":$PORT"]
  routes:
    - handle:
        - handler: reverse_proxy
          upstreams:
            - dial: "127.0.0.1:$PORT"
"#;

/// Writes a fixed manifest into the checkout instead of talking to git.
struct FixtureSync {
    manifest: String,
    revs: Mutex<Vec<String>>,
}

impl FixtureSync {
    fn new(manifest: &str) -> Self {
        Self {
            manifest: manifest.to_string(),
            revs: Mutex::new(Vec::new()),
        }
    }
}

impl SourceSync for FixtureSync {
    fn sync<'a>(
        &'a self,
        paths: &'a AppPaths,
        rev: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            std::fs::create_dir_all(&paths.code)?;
            std::fs::write(paths.code.join("kata.yaml"), &self.manifest)?;
            self.revs.lock().unwrap().push(rev.to_string());
            Ok(())
        })
    }
}

struct Host {
    tmp: TempDir,
    backend: StubBackend,
    admin: MemoryAdminClient,
    source: FixtureSync,
}

impl Host {
    fn new(manifest: &str) -> Self {
        Self {
            tmp: TempDir::new().unwrap(),
            backend: StubBackend::new(),
            admin: MemoryAdminClient::default(),
            source: FixtureSync::new(manifest),
        }
    }

    fn layout(&self) -> HostLayout {
        HostLayout::new(self.tmp.path().to_path_buf())
    }

    fn pipeline(&self) -> DeploymentPipeline<'_> {
        DeploymentPipeline::new(self.layout(), &self.backend, &self.admin, &self.source)
            .with_lock_wait(Duration::from_millis(200))
    }

    fn push(&self) -> Trigger {
        Trigger::Push { rev: REV.into() }
    }
}

#[tokio::test]
async fn push_deploys_routes_and_starts() {
    let host = Host::new(ROUTED_MANIFEST);
    let paths = host.layout().app("myapp");
    std::fs::create_dir_all(&paths.config).unwrap();
    std::fs::write(paths.override_file(), "PORT=9000\n").unwrap();

    let report = host.pipeline().deploy("myapp", host.push()).await.unwrap();

    assert_eq!(report.mode, DeploymentMode::SingleHost);
    assert_eq!(report.mode_source, ModeSource::Detected);
    assert_eq!(report.routing, ReconcileOutcome::Applied);
    assert_eq!(*host.source.revs.lock().unwrap(), vec![REV.to_string()]);

    let doc = host.admin.document();
    assert_eq!(doc["apps"]["http"]["servers"]["myapp"]["listen"], json!([":9000"]));

    let descriptor = std::fs::read_to_string(paths.descriptor()).unwrap();
    assert!(descriptor.contains("serve --port 9000"));

    let live = std::fs::read_to_string(paths.live_env_file()).unwrap();
    assert!(live.lines().any(|l| l == "PORT=9000"));
    assert_eq!(std::fs::read_to_string(paths.mode_file()).unwrap(), "single-host\n");

    assert_eq!(
        host.backend.calls(),
        vec![BackendCall::Up {
            app: "myapp".into(),
            mode: DeploymentMode::SingleHost
        }]
    );
}

#[tokio::test]
async fn secrets_in_single_host_fail_before_side_effects() {
    let host = Host::new("services:\n  web: {image: nginx, secrets: [db_password]}\n");

    let err = host.pipeline().deploy("myapp", host.push()).await.unwrap_err();

    assert_eq!(err.state(), Some(PipelineState::Generated));
    assert_eq!(err.kind(), ErrorKind::Mode);
    assert!(host.backend.calls().is_empty());
    assert_eq!(host.admin.fetch_count(), 0);
    assert_eq!(host.admin.load_count(), 0);
}

#[tokio::test]
async fn invalid_manifest_fails_at_resolved() {
    let host = Host::new("services:\n  web: {command: run}\n");
    let err = host.pipeline().deploy("myapp", host.push()).await.unwrap_err();
    assert_eq!(err.state(), Some(PipelineState::Resolved));
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn manual_deploy_of_unknown_app_fails() {
    let host = Host::new(ROUTED_MANIFEST);
    let err = host.pipeline().deploy("ghost", Trigger::Manual).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(matches!(
        err,
        PipelineError::Step { ref source, .. } if matches!(**source, PipelineError::AppNotFound(_))
    ));
}

#[tokio::test]
async fn restart_with_unchanged_descriptor_restarts() {
    let host = Host::new(ROUTED_MANIFEST);
    let pipeline = host.pipeline();
    pipeline.deploy("myapp", host.push()).await.unwrap();

    let report = pipeline.deploy("myapp", Trigger::Restart).await.unwrap();
    assert_eq!(report.routing, ReconcileOutcome::Unchanged);
    assert_eq!(report.mode_source, ModeSource::Loaded);
    assert_eq!(
        host.backend.calls().last(),
        Some(&BackendCall::Restart {
            app: "myapp".into(),
            mode: DeploymentMode::SingleHost
        })
    );
    assert_eq!(host.admin.load_count(), 1);
}

#[tokio::test]
async fn restart_after_config_change_recreates() {
    let host = Host::new(ROUTED_MANIFEST);
    let pipeline = host.pipeline();
    pipeline.deploy("myapp", host.push()).await.unwrap();

    let paths = host.layout().app("myapp");
    std::fs::write(paths.override_file(), "PORT=9100\n").unwrap();
    let report = pipeline.deploy("myapp", Trigger::Restart).await.unwrap();

    assert_eq!(report.routing, ReconcileOutcome::Applied);
    assert!(matches!(host.backend.calls().last(), Some(BackendCall::Up { .. })));
}

#[tokio::test]
async fn backend_failure_is_reported_at_started() {
    let host = Host::new(ROUTED_MANIFEST);
    host.backend.set_failing(true);

    let err = host.pipeline().deploy("myapp", host.push()).await.unwrap_err();
    assert_eq!(err.state(), Some(PipelineState::Started));
    assert_eq!(err.kind(), ErrorKind::Backend);
    // Routing is applied before the backend is asked to start.
    assert_eq!(host.admin.load_count(), 1);
    assert!(!host.layout().app("myapp").live_env_file().exists());
}

#[tokio::test]
async fn proxy_outage_stops_before_start() {
    let host = Host::new(ROUTED_MANIFEST);
    host.admin.set_unreachable(true);

    let err = host.pipeline().deploy("myapp", host.push()).await.unwrap_err();
    assert_eq!(err.state(), Some(PipelineState::Routed));
    assert_eq!(err.kind(), ErrorKind::Proxy);
    assert!(host.backend.calls().is_empty());
}

#[tokio::test]
async fn held_app_lock_fails_fast() {
    let host = Host::new(ROUTED_MANIFEST);
    let paths = host.layout().app("myapp");
    let _held = LockGuard::acquire(&paths.lock, Duration::ZERO).await.unwrap();

    let err = host.pipeline().deploy("myapp", host.push()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lock);
    assert!(host.source.revs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn destroy_removes_routing_stack_and_code() {
    let host = Host::new(ROUTED_MANIFEST);
    let pipeline = host.pipeline();
    pipeline.deploy("myapp", host.push()).await.unwrap();
    let paths = host.layout().app("myapp");

    pipeline.destroy("myapp", false).await.unwrap();

    assert!(host.admin.document()["apps"]["http"]["servers"].get("myapp").is_none());
    assert!(host.backend.calls().contains(&BackendCall::Down {
        app: "myapp".into(),
        mode: DeploymentMode::SingleHost
    }));
    assert!(!paths.code.exists());
    assert!(!paths.env.exists());
    assert!(paths.data.exists());
    assert!(paths.config.exists());
}

#[tokio::test]
async fn destroy_with_wipe_removes_data() {
    let host = Host::new(ROUTED_MANIFEST);
    let pipeline = host.pipeline();
    pipeline.deploy("myapp", host.push()).await.unwrap();
    let paths = host.layout().app("myapp");

    pipeline.destroy("myapp", true).await.unwrap();
    assert!(!paths.data.exists());
    assert!(!paths.config.exists());
}

#[tokio::test]
async fn set_mode_requires_cluster_and_leaves_stack_alone() {
    let host = Host::new(ROUTED_MANIFEST);
    let pipeline = host.pipeline();
    pipeline.deploy("myapp", host.push()).await.unwrap();
    let calls_before = host.backend.calls().len();

    let err = pipeline
        .set_mode("myapp", DeploymentMode::Clustered)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Mode);
    assert_eq!(pipeline.mode("myapp").unwrap(), Some(DeploymentMode::SingleHost));
    assert_eq!(host.backend.calls().len(), calls_before);
}

#[tokio::test]
async fn clustered_deploy_uses_cluster_backend() {
    let mut host = Host::new(
        "services:\n  web: {image: nginx, secrets: [db_password]}\nmodeOverride: clustered\n",
    );
    host.backend = StubBackend::new().with_cluster(true);

    let report = host.pipeline().deploy("myapp", host.push()).await.unwrap();
    assert_eq!(report.mode, DeploymentMode::Clustered);
    assert_eq!(report.mode_source, ModeSource::Overridden);
    assert_eq!(report.routing, ReconcileOutcome::Unchanged);

    let descriptor =
        std::fs::read_to_string(host.layout().app("myapp").descriptor()).unwrap();
    assert!(descriptor.contains("myapp.db_password"));
    assert!(!descriptor.contains(":/config"));
}

#[tokio::test]
async fn stop_leaves_routing_in_place() {
    let host = Host::new(ROUTED_MANIFEST);
    let pipeline = host.pipeline();
    pipeline.deploy("myapp", host.push()).await.unwrap();

    pipeline.stop("myapp").await.unwrap();
    assert!(matches!(host.backend.calls().last(), Some(BackendCall::Stop { .. })));
    assert!(host.admin.document()["apps"]["http"]["servers"].get("myapp").is_some());
}

#[tokio::test]
async fn inspection_requires_a_deploy() {
    let host = Host::new(ROUTED_MANIFEST);
    let pipeline = host.pipeline();

    let err = pipeline.ps("ghost").await.unwrap_err();
    assert!(matches!(err, PipelineError::AppNotFound(_)));

    std::fs::create_dir_all(host.layout().app("myapp").code).unwrap();
    let err = pipeline
        .logs("myapp", None, LogOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotDeployed(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(host.backend.calls().is_empty());
}

#[tokio::test]
async fn logs_ps_and_exec_reach_the_deployed_stack() {
    let host = Host::new(ROUTED_MANIFEST);
    let pipeline = host.pipeline();
    pipeline.deploy("myapp", host.push()).await.unwrap();

    let options = LogOptions {
        tail: Some(20),
        follow: false,
    };
    pipeline.logs("myapp", Some("web"), options).await.unwrap();
    pipeline.ps("myapp").await.unwrap();
    let command = vec!["env".to_string()];
    pipeline.exec("myapp", None, &command).await.unwrap();

    let calls = host.backend.calls();
    assert_eq!(
        calls[calls.len() - 3..],
        [
            BackendCall::Logs {
                app: "myapp".into(),
                service: Some("web".into()),
                options,
            },
            BackendCall::Ps {
                app: "myapp".into(),
                mode: DeploymentMode::SingleHost,
            },
            BackendCall::Exec {
                app: "myapp".into(),
                service: "web".into(),
                command: command.clone(),
            },
        ]
    );
}

#[tokio::test]
async fn unknown_service_is_rejected_before_the_backend() {
    let host = Host::new(ROUTED_MANIFEST);
    let pipeline = host.pipeline();
    pipeline.deploy("myapp", host.push()).await.unwrap();
    let calls_before = host.backend.calls().len();

    let err = pipeline
        .logs("myapp", Some("db"), LogOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownService { ref service, .. } if service == "db"));

    let err = pipeline
        .exec("myapp", Some("db"), &["sh".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = pipeline.exec("myapp", None, &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(host.backend.calls().len(), calls_before);
}
