use std::future::Future;
use std::io::IsTerminal;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use kata_core::{ClusterProbe, CoreError, DeploymentMode};
use tokio::io::AsyncWriteExt;

use crate::backend::{BackendOutput, ContainerBackend, LogOptions, StackRef};
use crate::error::BackendError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Drives the container engine's command-line client: `compose` for
/// single-host stacks, `stack` / `service` / `secret` for clustered ones.
#[derive(Debug, Clone)]
pub struct CliBackend {
    binary: String,
    compose_args: Vec<String>,
    timeout: Duration,
}

impl CliBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            compose_args: vec!["compose".into()],
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Arguments that select the compose tool, e.g. `["compose"]`.
    pub fn with_compose_args(mut self, args: Vec<String>) -> Self {
        self.compose_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// App names are already valid project names, so the app is the project.
    fn compose(&self, stack: &StackRef, tail: &[&str]) -> Vec<String> {
        let mut args = self.compose_args.clone();
        args.extend([
            "-p".to_string(),
            stack.app.clone(),
            "-f".to_string(),
            stack.descriptor.to_string_lossy().into_owned(),
        ]);
        args.extend(tail.iter().map(|s| s.to_string()));
        args
    }

    fn up_args(&self, stack: &StackRef) -> Vec<String> {
        match stack.mode {
            DeploymentMode::SingleHost => {
                self.compose(stack, &["up", "-d", "--build", "--remove-orphans"])
            }
            DeploymentMode::Clustered => vec![
                "stack".into(),
                "deploy".into(),
                "--prune".into(),
                "-c".into(),
                stack.descriptor.to_string_lossy().into_owned(),
                stack.app.clone(),
            ],
        }
    }

    fn stack_rm_args(stack: &StackRef) -> Vec<String> {
        vec!["stack".into(), "rm".into(), stack.app.clone()]
    }

    /// Cluster services are named `<stack>_<service>`.
    fn cluster_service(stack: &StackRef, service: &str) -> String {
        format!("{}_{}", stack.app, service)
    }

    fn logs_args(&self, stack: &StackRef, service: Option<&str>, options: LogOptions) -> Vec<String> {
        let mut args = match stack.mode {
            DeploymentMode::SingleHost => self.compose(stack, &["logs", "--no-color"]),
            DeploymentMode::Clustered => vec!["service".into(), "logs".into()],
        };
        if let Some(tail) = options.tail {
            args.extend(["--tail".to_string(), tail.to_string()]);
        }
        if options.follow {
            args.push("--follow".into());
        }
        match (stack.mode, service) {
            (DeploymentMode::SingleHost, Some(service)) => args.push(service.to_string()),
            (DeploymentMode::Clustered, Some(service)) => {
                args.push(Self::cluster_service(stack, service))
            }
            (_, None) => {}
        }
        args
    }

    fn ps_args(&self, stack: &StackRef) -> Vec<String> {
        match stack.mode {
            DeploymentMode::SingleHost => self.compose(stack, &["ps"]),
            DeploymentMode::Clustered => vec!["stack".into(), "ps".into(), stack.app.clone()],
        }
    }

    /// Single-host exec. `-T` disables the pseudo-terminal when stdin is not one.
    fn exec_args(&self, stack: &StackRef, service: &str, command: &[String], tty: bool) -> Vec<String> {
        let mut args = self.compose(stack, &["exec"]);
        if !tty {
            args.push("-T".into());
        }
        args.push(service.to_string());
        args.extend(command.iter().cloned());
        args
    }

    async fn run(
        &self,
        args: Vec<String>,
        stdin: Option<&str>,
        cwd: Option<&Path>,
    ) -> Result<BackendOutput, BackendError> {
        let command_line = format!("{} {}", self.binary, args.join(" "));
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(command = %command_line, "Running backend command");
        let mut child = cmd.spawn().map_err(|source| BackendError::Spawn {
            program: self.binary.clone(),
            source,
        })?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes()).await?;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackendError::Timeout {
                    command: command_line,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let status = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            return Err(BackendError::Failed {
                command: command_line,
                status,
                stdout,
                stderr,
            });
        }
        Ok(BackendOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// Run with the caller's stdio attached and no timeout.
    async fn run_attached(
        &self,
        args: Vec<String>,
        cwd: Option<&Path>,
    ) -> Result<BackendOutput, BackendError> {
        let command_line = format!("{} {}", self.binary, args.join(" "));
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(command = %command_line, "Running attached backend command");
        let status = cmd.status().await.map_err(|source| BackendError::Spawn {
            program: self.binary.clone(),
            source,
        })?;
        let code = status.code().unwrap_or(-1);
        if !status.success() {
            return Err(BackendError::Failed {
                command: command_line,
                status: code,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        Ok(BackendOutput {
            status: code,
            ..BackendOutput::default()
        })
    }

    /// IDs of the services in the app's cluster stack.
    async fn stack_services(&self, stack: &StackRef) -> Result<Vec<String>, BackendError> {
        let namespace = format!("label=com.docker.stack.namespace={}", stack.app);
        let listing = self
            .run(
                vec![
                    "service".into(),
                    "ls".into(),
                    "--filter".into(),
                    namespace,
                    "-q".into(),
                ],
                None,
                None,
            )
            .await?;
        Ok(listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn restart_clustered(&self, stack: &StackRef) -> Result<BackendOutput, BackendError> {
        let mut combined = BackendOutput::default();
        for id in self.stack_services(stack).await? {
            let out = self
                .run(
                    vec!["service".into(), "update".into(), "--force".into(), id],
                    None,
                    None,
                )
                .await?;
            combined = combined.merge(out);
        }
        Ok(combined)
    }

    /// `service logs` takes one service, so a whole-stack capture walks them all.
    async fn logs_clustered(
        &self,
        stack: &StackRef,
        options: LogOptions,
    ) -> Result<BackendOutput, BackendError> {
        if options.follow {
            return Err(BackendError::ServiceRequired {
                app: stack.app.clone(),
            });
        }
        let mut combined = BackendOutput::default();
        for id in self.stack_services(stack).await? {
            let mut args = vec!["service".to_string(), "logs".to_string()];
            if let Some(tail) = options.tail {
                args.extend(["--tail".to_string(), tail.to_string()]);
            }
            args.push(id);
            combined = combined.merge(self.run(args, None, None).await?);
        }
        Ok(combined)
    }

    /// Exec into the first task of a cluster service running on this node.
    async fn exec_clustered(
        &self,
        stack: &StackRef,
        service: &str,
        command: &[String],
    ) -> Result<BackendOutput, BackendError> {
        let filter = format!(
            "label=com.docker.swarm.service.name={}",
            Self::cluster_service(stack, service)
        );
        let listing = self
            .run(
                vec!["ps".into(), "-q".into(), "--filter".into(), filter],
                None,
                None,
            )
            .await?;
        let Some(container) = listing.stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Err(BackendError::NotRunning {
                service: service.to_string(),
            });
        };
        let mut args = vec!["exec".to_string(), "-i".to_string()];
        if std::io::stdin().is_terminal() {
            args.push("-t".into());
        }
        args.push(container.to_string());
        args.extend(command.iter().cloned());
        self.run_attached(args, None).await
    }
}

impl ClusterProbe for CliBackend {
    fn cluster_active<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let args = vec![
                "info".to_string(),
                "--format".to_string(),
                "{{.Swarm.LocalNodeState}}".to_string(),
            ];
            match self.run(args, None, None).await {
                Ok(out) => Ok(out.stdout.trim() == "active"),
                Err(BackendError::Failed { stderr, .. }) => {
                    tracing::debug!(stderr = %stderr.trim(), "Cluster probe reported failure");
                    Ok(false)
                }
                Err(e) => Err(CoreError::ClusterProbe(e.to_string())),
            }
        })
    }
}

impl ContainerBackend for CliBackend {
    fn up<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.run(self.up_args(stack), None, Some(stack.working_dir.as_path()))
                .await
        })
    }

    fn restart<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            match stack.mode {
                DeploymentMode::SingleHost => {
                    self.run(
                        self.compose(stack, &["restart"]),
                        None,
                        Some(stack.working_dir.as_path()),
                    )
                    .await
                }
                DeploymentMode::Clustered => self.restart_clustered(stack).await,
            }
        })
    }

    fn stop<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let args = match stack.mode {
                DeploymentMode::SingleHost => self.compose(stack, &["stop"]),
                DeploymentMode::Clustered => Self::stack_rm_args(stack),
            };
            self.run(args, None, Some(stack.working_dir.as_path())).await
        })
    }

    fn down<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let args = match stack.mode {
                DeploymentMode::SingleHost => self.compose(stack, &["down", "--remove-orphans"]),
                DeploymentMode::Clustered => Self::stack_rm_args(stack),
            };
            self.run(args, None, None).await
        })
    }

    fn logs<'a>(
        &'a self,
        stack: &'a StackRef,
        service: Option<&'a str>,
        options: LogOptions,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            if stack.mode == DeploymentMode::Clustered && service.is_none() {
                return self.logs_clustered(stack, options).await;
            }
            let args = self.logs_args(stack, service, options);
            let cwd = Some(stack.working_dir.as_path());
            if options.follow {
                self.run_attached(args, cwd).await
            } else {
                self.run(args, None, cwd).await
            }
        })
    }

    fn ps<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.run(self.ps_args(stack), None, Some(stack.working_dir.as_path()))
                .await
        })
    }

    fn exec<'a>(
        &'a self,
        stack: &'a StackRef,
        service: &'a str,
        command: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            match stack.mode {
                DeploymentMode::SingleHost => {
                    let tty = std::io::stdin().is_terminal();
                    self.run_attached(
                        self.exec_args(stack, service, command, tty),
                        Some(stack.working_dir.as_path()),
                    )
                    .await
                }
                DeploymentMode::Clustered => self.exec_clustered(stack, service, command).await,
            }
        })
    }

    fn secret_create<'a>(
        &'a self,
        name: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let args = vec![
                "secret".to_string(),
                "create".to_string(),
                name.to_string(),
                "-".to_string(),
            ];
            self.run(args, Some(value), None).await?;
            Ok(())
        })
    }

    fn secret_list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let args = vec![
                "secret".to_string(),
                "ls".to_string(),
                "--format".to_string(),
                "{{.Name}}".to_string(),
            ];
            let out = self.run(args, None, None).await?;
            let mut names: Vec<String> = out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|n| n.starts_with(prefix))
                .map(str::to_string)
                .collect();
            names.sort();
            Ok(names)
        })
    }

    fn secret_remove<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let args = vec!["secret".to_string(), "rm".to_string(), name.to_string()];
            self.run(args, None, None).await?;
            Ok(())
        })
    }

    fn backend_name(&self) -> &str {
        &self.binary
    }
}
