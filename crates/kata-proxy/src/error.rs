use kata_core::{CoreError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy admin API unreachable at {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("proxy admin API returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("proxy returned an unusable configuration document: {0}")]
    InvalidDocument(String),

    #[error("invalid routing section for app '{app}': {reason}")]
    InvalidSection { app: String, reason: String },

    #[error(transparent)]
    Lock(#[from] CoreError),
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::InvalidSection { .. } => ErrorKind::Validation,
            ProxyError::Lock(inner) => inner.kind(),
            _ => ErrorKind::Proxy,
        }
    }
}
