use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use kata_core::{ClusterProbe, CoreError, DeploymentMode};

use crate::backend::{BackendOutput, ContainerBackend, LogOptions, StackRef};
use crate::error::BackendError;

/// A call recorded by [`StubBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Up { app: String, mode: DeploymentMode },
    Restart { app: String, mode: DeploymentMode },
    Stop { app: String, mode: DeploymentMode },
    Down { app: String, mode: DeploymentMode },
    Logs {
        app: String,
        service: Option<String>,
        options: LogOptions,
    },
    Ps { app: String, mode: DeploymentMode },
    Exec {
        app: String,
        service: String,
        command: Vec<String>,
    },
    SecretCreate { name: String },
    SecretRemove { name: String },
}

/// In-memory backend for tests. Records every stack call and keeps
/// secrets in a map.
pub struct StubBackend {
    cluster: AtomicBool,
    failing: AtomicBool,
    calls: Mutex<Vec<BackendCall>>,
    secrets: Mutex<BTreeMap<String, String>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            cluster: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            secrets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_cluster(self, active: bool) -> Self {
        self.cluster.store(active, Ordering::SeqCst);
        self
    }

    /// Make every stack call fail with a non-zero status.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn secret(&self, name: &str) -> Option<String> {
        self.secrets.lock().ok()?.get(name).cloned()
    }

    fn record(&self, call: BackendCall) -> Result<BackendOutput, BackendError> {
        let label = format!("{call:?}");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Failed {
                command: label,
                status: 1,
                stdout: String::new(),
                stderr: "stub backend failure".into(),
            });
        }
        Ok(BackendOutput::default())
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterProbe for StubBackend {
    fn cluster_active<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CoreError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.cluster.load(Ordering::SeqCst)) })
    }
}

impl ContainerBackend for StubBackend {
    fn up<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(BackendCall::Up {
                app: stack.app.clone(),
                mode: stack.mode,
            })
        })
    }

    fn restart<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(BackendCall::Restart {
                app: stack.app.clone(),
                mode: stack.mode,
            })
        })
    }

    fn stop<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(BackendCall::Stop {
                app: stack.app.clone(),
                mode: stack.mode,
            })
        })
    }

    fn down<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(BackendCall::Down {
                app: stack.app.clone(),
                mode: stack.mode,
            })
        })
    }

    fn logs<'a>(
        &'a self,
        stack: &'a StackRef,
        service: Option<&'a str>,
        options: LogOptions,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(BackendCall::Logs {
                app: stack.app.clone(),
                service: service.map(str::to_string),
                options,
            })
        })
    }

    fn ps<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(BackendCall::Ps {
                app: stack.app.clone(),
                mode: stack.mode,
            })
        })
    }

    fn exec<'a>(
        &'a self,
        stack: &'a StackRef,
        service: &'a str,
        command: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(BackendCall::Exec {
                app: stack.app.clone(),
                service: service.to_string(),
                command: command.to_vec(),
            })
        })
    }

    fn secret_create<'a>(
        &'a self,
        name: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(BackendCall::SecretCreate {
                name: name.to_string(),
            })?;
            if let Ok(mut secrets) = self.secrets.lock() {
                secrets.insert(name.to_string(), value.to_string());
            }
            Ok(())
        })
    }

    fn secret_list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let secrets = self.secrets.lock().map(|s| s.clone()).unwrap_or_default();
            Ok(secrets
                .into_keys()
                .filter(|name| name.starts_with(prefix))
                .collect())
        })
    }

    fn secret_remove<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(BackendCall::SecretRemove {
                name: name.to_string(),
            })?;
            if let Ok(mut secrets) = self.secrets.lock() {
                secrets.remove(name);
            }
            Ok(())
        })
    }

    fn backend_name(&self) -> &str {
        "stub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn stack() -> StackRef {
        StackRef {
            app: "blog".into(),
            mode: DeploymentMode::SingleHost,
            descriptor: PathBuf::from("/tmp/.kata-compose.yaml"),
            working_dir: PathBuf::from("/tmp"),
        }
    }

    #[tokio::test]
    async fn records_calls_in_order() {
        let backend = StubBackend::new();
        backend.up(&stack()).await.unwrap();
        backend.stop(&stack()).await.unwrap();
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::Up {
                    app: "blog".into(),
                    mode: DeploymentMode::SingleHost
                },
                BackendCall::Stop {
                    app: "blog".into(),
                    mode: DeploymentMode::SingleHost
                },
            ]
        );
    }

    #[tokio::test]
    async fn failing_stub_still_records() {
        let backend = StubBackend::new();
        backend.set_failing(true);
        assert!(backend.up(&stack()).await.is_err());
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn stores_secrets_by_name() {
        let backend = StubBackend::new().with_cluster(true);
        assert!(backend.cluster_active().await.unwrap());
        backend.secret_create("blog.db", "pw").await.unwrap();
        backend.secret_create("other.db", "x").await.unwrap();
        assert_eq!(backend.secret_list("blog.").await.unwrap(), vec!["blog.db"]);
        backend.secret_remove("blog.db").await.unwrap();
        assert!(backend.secret("blog.db").is_none());
    }

    #[tokio::test]
    async fn records_inspection_calls() {
        let backend = StubBackend::new();
        let command = vec!["ls".to_string()];
        backend
            .logs(
                &stack(),
                Some("web"),
                LogOptions {
                    tail: Some(10),
                    follow: false,
                },
            )
            .await
            .unwrap();
        backend.ps(&stack()).await.unwrap();
        backend.exec(&stack(), "web", &command).await.unwrap();
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::Logs {
                    app: "blog".into(),
                    service: Some("web".into()),
                    options: LogOptions {
                        tail: Some(10),
                        follow: false
                    },
                },
                BackendCall::Ps {
                    app: "blog".into(),
                    mode: DeploymentMode::SingleHost
                },
                BackendCall::Exec {
                    app: "blog".into(),
                    service: "web".into(),
                    command,
                },
            ]
        );
    }
}
