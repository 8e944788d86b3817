use kata_core::{AppManifest, DeploymentMode, qualified_secret_name};
use kata_runtime::ContainerBackend;

use crate::error::SecretError;

/// A secret value on its way to the backend. Not printed by `Debug`.
#[derive(Clone)]
pub struct SecretValue {
    value: String,
}

impl SecretValue {
    pub fn new(value: String) -> Self {
        Self { value }
    }

    /// The raw value. Only handed to the backend over stdin.
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// Manages one app's cluster secrets, stored as `<app>.<name>`.
///
/// Every operation requires the app to be in clustered mode.
pub struct SecretsManager<'a> {
    backend: &'a dyn ContainerBackend,
    app: String,
    mode: DeploymentMode,
}

impl<'a> SecretsManager<'a> {
    pub fn new(backend: &'a dyn ContainerBackend, app: &str, mode: DeploymentMode) -> Self {
        Self {
            backend,
            app: app.to_string(),
            mode,
        }
    }

    fn require_cluster(&self) -> Result<(), SecretError> {
        if self.mode != DeploymentMode::Clustered {
            return Err(SecretError::RequiresCluster {
                app: self.app.clone(),
            });
        }
        Ok(())
    }

    fn prefix(&self) -> String {
        format!("{}.", self.app)
    }

    /// Short names (without the app prefix) of this app's secrets.
    pub async fn list(&self) -> Result<Vec<String>, SecretError> {
        self.require_cluster()?;
        let prefix = self.prefix();
        let names = self.backend.secret_list(&prefix).await?;
        Ok(names
            .into_iter()
            .filter_map(|n| n.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Create or replace a secret.
    pub async fn set(&self, name: &str, value: &SecretValue) -> Result<(), SecretError> {
        self.require_cluster()?;
        validate_name(name)?;
        let qualified = qualified_secret_name(&self.app, name);
        if self.list().await?.iter().any(|n| n == name) {
            self.backend.secret_remove(&qualified).await?;
        }
        self.backend.secret_create(&qualified, value.expose()).await?;
        tracing::info!(app = %self.app, secret = %name, "Secret stored");
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<(), SecretError> {
        self.require_cluster()?;
        validate_name(name)?;
        if !self.list().await?.iter().any(|n| n == name) {
            return Err(SecretError::NotFound {
                name: name.to_string(),
            });
        }
        self.backend
            .secret_remove(&qualified_secret_name(&self.app, name))
            .await?;
        tracing::info!(app = %self.app, secret = %name, "Secret removed");
        Ok(())
    }

    /// Secrets the manifest requests that the backend does not hold yet.
    pub async fn missing(&self, manifest: &AppManifest) -> Result<Vec<String>, SecretError> {
        self.require_cluster()?;
        let present = self.list().await?;
        let mut missing: Vec<String> = manifest
            .services
            .iter()
            .flat_map(|(_, spec)| spec.secrets.iter())
            .filter(|s| !present.contains(s))
            .cloned()
            .collect();
        missing.sort();
        missing.dedup();
        Ok(missing)
    }
}

fn validate_name(name: &str) -> Result<(), SecretError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SecretError::InvalidName(name.to_string()))
    }
}
