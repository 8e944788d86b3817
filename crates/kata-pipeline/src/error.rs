use kata_core::{CoreError, ErrorKind};
use kata_proxy::ProxyError;
use kata_runtime::BackendError;
use kata_secrets::SecretError;
use thiserror::Error;

use crate::types::PipelineState;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("app '{app}' failed at step '{state}'")]
    Step {
        app: String,
        state: PipelineState,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("app '{0}' not found")]
    AppNotFound(String),

    #[error("app '{0}' has not been deployed")]
    NotDeployed(String),

    #[error("app '{app}' has no service '{service}'")]
    UnknownService { app: String, service: String },

    #[error("invalid hook input on line {line}: {message}")]
    HookInput { line: usize, message: String },

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Attach the app and the step being attempted.
    pub fn at(app: &str, state: PipelineState) -> impl FnOnce(PipelineError) -> PipelineError {
        let app = app.to_string();
        move |source| PipelineError::Step {
            app,
            state,
            source: Box::new(source),
        }
    }

    /// The step a run failed at, if this error carries one.
    pub fn state(&self) -> Option<PipelineState> {
        match self {
            PipelineError::Step { state, .. } => Some(*state),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Step { source, .. } => source.kind(),
            PipelineError::Core(e) => e.kind(),
            PipelineError::Backend(e) => e.kind(),
            PipelineError::Proxy(e) => e.kind(),
            PipelineError::Secret(e) => e.kind(),
            PipelineError::Git { .. } => ErrorKind::Backend,
            PipelineError::AppNotFound(_)
            | PipelineError::NotDeployed(_)
            | PipelineError::UnknownService { .. }
            | PipelineError::HookInput { .. }
            | PipelineError::Config(_)
            | PipelineError::Io(_) => ErrorKind::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_errors_keep_inner_kind() {
        let inner = PipelineError::Core(CoreError::SecretsRequireCluster {
            service: "web".into(),
        });
        let err = PipelineError::at("blog", PipelineState::Generated)(inner);
        assert_eq!(err.kind(), ErrorKind::Mode);
        assert_eq!(err.state(), Some(PipelineState::Generated));
        assert_eq!(err.to_string(), "app 'blog' failed at step 'generated'");
    }

    #[test]
    fn classifies_plain_errors() {
        assert_eq!(
            PipelineError::AppNotFound("x".into()).kind(),
            ErrorKind::Validation
        );
        let git = PipelineError::Git {
            command: "fetch".into(),
            message: "boom".into(),
        };
        assert_eq!(git.kind(), ErrorKind::Backend);
    }
}
