use kata_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to run '{program}': {source}. Is it installed?")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with status {status}\nstdout: {stdout}\nstderr: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("'{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("following the logs of clustered app '{app}' needs a service name")]
    ServiceRequired { app: String },

    #[error("no running container for service '{service}' on this host")]
    NotRunning { service: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::ServiceRequired { .. } => ErrorKind::Validation,
            _ => ErrorKind::Backend,
        }
    }
}
