//! Fetch-modify-post reconciliation of one app's server block.
//!
//! Only `apps.http.servers.<app>` is ever written. Every cycle runs under
//! the host-wide proxy lock so concurrent deploys of different apps cannot
//! lose each other's updates.

use std::path::PathBuf;
use std::time::Duration;

use kata_core::expand::expand_json;
use kata_core::{LockGuard, ResolvedEnvironment};
use serde_json::{Map, Value};

use crate::admin::ProxyAdmin;
use crate::error::ProxyError;

/// Keys of a full proxy configuration. A server block never has them.
const TOP_LEVEL_KEYS: &[&str] = &["apps", "admin", "logging", "storage"];

/// Keys that mark an object as a server block.
const SERVER_KEYS: &[&str] = &["listen", "routes"];

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The app's server block was written.
    Applied,
    /// The app's server block was deleted.
    Removed,
    /// Nothing to change; no document was posted.
    Unchanged,
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::Removed => "removed",
            ReconcileOutcome::Unchanged => "unchanged",
        })
    }
}

/// Validate a routing section and expand `$VAR` references in its strings.
pub fn prepare_section(
    app: &str,
    section: &Value,
    env: &ResolvedEnvironment,
) -> Result<Value, ProxyError> {
    let invalid = |reason: String| ProxyError::InvalidSection {
        app: app.to_string(),
        reason,
    };
    let Value::Object(map) = section else {
        return Err(invalid("routing must be a single server object".into()));
    };
    if let Some(key) = TOP_LEVEL_KEYS.iter().find(|k| map.contains_key(**k)) {
        return Err(invalid(format!(
            "found top-level configuration key '{key}'; declare one server block, not a full proxy config"
        )));
    }
    if !SERVER_KEYS.iter().any(|k| map.contains_key(*k)) {
        return Err(invalid("a server block needs 'listen' or 'routes'".into()));
    }
    Ok(expand_json(section, &|name: &str| {
        env.app.get(name).cloned()
    }))
}

fn servers(document: &Value) -> Option<&Map<String, Value>> {
    document.pointer("/apps/http/servers")?.as_object()
}

/// The `apps.http.servers` object, created on demand.
fn servers_mut(document: &mut Value) -> Result<&mut Map<String, Value>, ProxyError> {
    if document.is_null() {
        *document = Value::Object(Map::new());
    }
    let mut node = document;
    for key in ["apps", "http", "servers"] {
        let map = node.as_object_mut().ok_or_else(|| {
            ProxyError::InvalidDocument(format!("expected an object above '{key}'"))
        })?;
        node = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    node.as_object_mut()
        .ok_or_else(|| ProxyError::InvalidDocument("'apps.http.servers' is not an object".into()))
}

/// Keeps the proxy's live configuration in line with each app's manifest.
pub struct ProxyReconciler<'a> {
    admin: &'a dyn ProxyAdmin,
    lock_path: PathBuf,
    lock_wait: Duration,
}

impl<'a> ProxyReconciler<'a> {
    /// `lock_path` is the host-wide reconciliation lock file.
    pub fn new(admin: &'a dyn ProxyAdmin, lock_path: PathBuf) -> Self {
        Self {
            admin,
            lock_path,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Make the live server block for `app` equal to `section`.
    ///
    /// `None` means the manifest declares no routing: an existing block is
    /// removed, otherwise nothing happens.
    pub async fn apply(
        &self,
        app: &str,
        section: Option<&Value>,
        env: &ResolvedEnvironment,
    ) -> Result<ReconcileOutcome, ProxyError> {
        let desired = section
            .map(|s| prepare_section(app, s, env))
            .transpose()?;

        let _guard = LockGuard::acquire(&self.lock_path, self.lock_wait).await?;
        let mut document = self.admin.fetch_config().await?;
        let current = servers(&document).and_then(|s| s.get(app)).cloned();

        let outcome = match (desired, current) {
            (None, None) => ReconcileOutcome::Unchanged,
            (Some(want), Some(have)) if want == have => ReconcileOutcome::Unchanged,
            (None, Some(_)) => {
                servers_mut(&mut document)?.remove(app);
                ReconcileOutcome::Removed
            }
            (Some(want), _) => {
                servers_mut(&mut document)?.insert(app.to_string(), want);
                ReconcileOutcome::Applied
            }
        };

        if outcome != ReconcileOutcome::Unchanged {
            self.admin.load_config(&document).await?;
        }
        tracing::info!(app = %app, outcome = %outcome, "Reconciled routing");
        Ok(outcome)
    }

    /// Delete the server block for `app` if present.
    pub async fn remove(&self, app: &str) -> Result<ReconcileOutcome, ProxyError> {
        let _guard = LockGuard::acquire(&self.lock_path, self.lock_wait).await?;
        let mut document = self.admin.fetch_config().await?;
        if servers(&document).is_none_or(|s| !s.contains_key(app)) {
            tracing::debug!(app = %app, "No routing to remove");
            return Ok(ReconcileOutcome::Unchanged);
        }
        servers_mut(&mut document)?.remove(app);
        self.admin.load_config(&document).await?;
        tracing::info!(app = %app, "Removed routing");
        Ok(ReconcileOutcome::Removed)
    }

    /// The live server block for `app`, for inspection. Takes no lock.
    pub async fn section(&self, app: &str) -> Result<Option<Value>, ProxyError> {
        let document = self.admin.fetch_config().await?;
        Ok(servers(&document).and_then(|s| s.get(app)).cloned())
    }
}
