use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use kata_core::{ClusterProbe, DeploymentMode};

use crate::error::BackendError;

/// Everything a backend needs to address one app's stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRef {
    pub app: String,
    pub mode: DeploymentMode,
    /// The generated compose descriptor.
    pub descriptor: PathBuf,
    /// Directory the backend command runs in (the app checkout).
    pub working_dir: PathBuf,
}

/// Captured result of a successful backend invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl BackendOutput {
    /// Concatenate the output of several invocations.
    pub fn merge(mut self, other: BackendOutput) -> Self {
        self.status = other.status;
        self.stdout.push_str(&other.stdout);
        self.stderr.push_str(&other.stderr);
        self
    }
}

/// How much of a stack's log output to show.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Only the last `tail` lines of each service.
    pub tail: Option<usize>,
    /// Stream to the terminal until interrupted instead of capturing.
    pub follow: bool,
}

/// A container runtime that can run an app's stack in either mode.
///
/// Uses Pin<Box<dyn Future>> for dyn-compatibility. Every call is a
/// blocking round-trip: it resolves when the backend command exits.
/// Followed logs and `exec` are attached to the caller's terminal and
/// return an empty capture.
pub trait ContainerBackend: ClusterProbe {
    /// Create or update the stack from its descriptor.
    fn up<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>>;

    fn restart<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>>;

    /// Stop the stack's containers without removing state.
    fn stop<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>>;

    /// Remove the stack entirely.
    fn down<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>>;

    /// Log output of one service, or of the whole stack when `service` is `None`.
    fn logs<'a>(
        &'a self,
        stack: &'a StackRef,
        service: Option<&'a str>,
        options: LogOptions,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>>;

    /// Container or task listing for the stack.
    fn ps<'a>(
        &'a self,
        stack: &'a StackRef,
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>>;

    /// Run `command` inside a running container of `service`.
    fn exec<'a>(
        &'a self,
        stack: &'a StackRef,
        service: &'a str,
        command: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<BackendOutput, BackendError>> + Send + 'a>>;

    /// Create a cluster secret. Values are passed on stdin, never as arguments.
    fn secret_create<'a>(
        &'a self,
        name: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>>;

    /// Names of cluster secrets starting with `prefix`, sorted.
    fn secret_list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, BackendError>> + Send + 'a>>;

    fn secret_remove<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>>;

    /// Backend name for logging.
    fn backend_name(&self) -> &str;
}
