use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::CoreError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exclusive advisory lock on a file under the host's lock directory.
///
/// Released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Poll for the lock until `wait` elapses, then fail with `LockBusy`.
    pub async fn acquire(path: &Path, wait: Duration) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Acquired lock");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= wait {
                        return Err(CoreError::LockBusy {
                            path: path.to_path_buf(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL.min(wait)).await;
                }
                Err(e) => return Err(CoreError::Io(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn second_holder_times_out() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("locks/app-blog.lock");

        let _held = LockGuard::acquire(&path, Duration::from_millis(50)).await.unwrap();
        let err = LockGuard::acquire(&path, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::LockBusy { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Lock);
    }

    #[tokio::test]
    async fn released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("proxy.lock");

        let first = LockGuard::acquire(&path, Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.path(), path.as_path());
        drop(first);
        LockGuard::acquire(&path, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn waiter_gets_lock_once_released() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.lock");

        let held = LockGuard::acquire(&path, Duration::ZERO).await.unwrap();
        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move {
            LockGuard::acquire(&waiter_path, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }
}
