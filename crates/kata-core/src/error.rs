use std::path::PathBuf;

use thiserror::Error;

/// Coarse failure classes shared by every kata crate.
///
/// Each crate keeps its own error enum; `kind()` on those enums maps
/// onto this taxonomy so operators see a stable category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Mode,
    Backend,
    Proxy,
    Lock,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Mode => "mode",
            ErrorKind::Backend => "backend",
            ErrorKind::Proxy => "proxy",
            ErrorKind::Lock => "lock",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid app name '{0}'")]
    InvalidAppName(String),

    #[error("manifest not found in {0}")]
    ManifestNotFound(PathBuf),

    #[error("invalid manifest {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("invalid override file {path}:{line}: {message}")]
    InvalidOverride {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid mode file {path}: unknown mode '{value}'")]
    InvalidModeFile { path: PathBuf, value: String },

    #[error("unknown deployment mode '{0}' (expected 'single-host' or 'clustered')")]
    UnknownMode(String),

    #[error("service '{service}' uses unknown runtime '{runtime}'")]
    UnknownRuntime { service: String, runtime: String },

    #[error("app '{app}' declares routing but no listening port (set PORT or declare service ports)")]
    MissingPort { app: String },

    #[error("service '{service}' requests secrets, which require clustered mode")]
    SecretsRequireCluster { service: String },

    #[error("clustered mode requested but the container backend has no active cluster")]
    ClusterInactive,

    #[error("cluster probe failed: {0}")]
    ClusterProbe(String),

    #[error("lock {path} is held by another kata process (gave up after {waited_ms} ms)")]
    LockBusy { path: PathBuf, waited_ms: u64 },

    #[error("descriptor serialization failed: {0}")]
    Descriptor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::SecretsRequireCluster { .. } | CoreError::ClusterInactive => ErrorKind::Mode,
            CoreError::ClusterProbe(_) => ErrorKind::Backend,
            CoreError::LockBusy { .. } => ErrorKind::Lock,
            // Manifest, override, mode-file and local IO problems.
            _ => ErrorKind::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_errors_are_classified() {
        assert_eq!(CoreError::ClusterInactive.kind(), ErrorKind::Mode);
        let err = CoreError::SecretsRequireCluster {
            service: "web".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Mode);
        assert_eq!(
            err.to_string(),
            "service 'web' requests secrets, which require clustered mode"
        );
    }

    #[test]
    fn lock_busy_is_lock_kind() {
        let err = CoreError::LockBusy {
            path: PathBuf::from("/tmp/app.lock"),
            waited_ms: 250,
        };
        assert_eq!(err.kind(), ErrorKind::Lock);
        assert_eq!(ErrorKind::Lock.to_string(), "lock");
    }
}
