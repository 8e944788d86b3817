use kata_core::ErrorKind;
use kata_runtime::BackendError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("app '{app}' is not in clustered mode; secrets require a cluster backend")]
    RequiresCluster { app: String },

    #[error("invalid secret name '{0}' (use letters, digits, '_' or '-')")]
    InvalidName(String),

    #[error("secret not found: {name}")]
    NotFound { name: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SecretError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretError::RequiresCluster { .. } => ErrorKind::Mode,
            SecretError::Backend(_) => ErrorKind::Backend,
            SecretError::InvalidName(_) | SecretError::NotFound { .. } => ErrorKind::Validation,
        }
    }
}
