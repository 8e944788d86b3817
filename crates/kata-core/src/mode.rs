use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Which backend runs an app's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    SingleHost,
    Clustered,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::SingleHost => "single-host",
            DeploymentMode::Clustered => "clustered",
        }
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "single-host" => Ok(DeploymentMode::SingleHost),
            "clustered" => Ok(DeploymentMode::Clustered),
            other => Err(CoreError::UnknownMode(other.to_string())),
        }
    }
}

/// Asks the container backend whether a cluster is active on this host.
///
/// Uses Pin<Box<dyn Future>> for dyn-compatibility.
pub trait ClusterProbe: Send + Sync {
    fn cluster_active<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CoreError>> + Send + 'a>>;
}

/// The persisted per-app mode file.
#[derive(Debug, Clone)]
pub struct ModeStore {
    path: PathBuf,
}

impl ModeStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no mode has been recorded yet. Unknown content is an error.
    pub fn load(&self) -> Result<Option<DeploymentMode>, CoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        DeploymentMode::from_str(&raw)
            .map(Some)
            .map_err(|_| CoreError::InvalidModeFile {
                path: self.path.clone(),
                value: raw.trim().to_string(),
            })
    }

    pub fn save(&self, mode: DeploymentMode) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{mode}\n"))?;
        Ok(())
    }
}

/// Where a resolved mode came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSource {
    /// Read from the mode file.
    Loaded,
    /// Taken from the manifest's `modeOverride` and persisted.
    Overridden,
    /// Probed from the backend and persisted.
    Detected,
}

impl std::fmt::Display for ModeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ModeSource::Loaded => "loaded",
            ModeSource::Overridden => "overridden",
            ModeSource::Detected => "detected",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeResolution {
    pub mode: DeploymentMode,
    pub source: ModeSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub previous: Option<DeploymentMode>,
    pub mode: DeploymentMode,
    /// The running stack still uses the previous mode until the next deploy.
    pub redeploy_required: bool,
}

/// Decides and persists an app's deployment mode.
pub struct ModeSelector<'a, P: ClusterProbe + ?Sized> {
    probe: &'a P,
}

impl<'a, P: ClusterProbe + ?Sized> ModeSelector<'a, P> {
    pub fn new(probe: &'a P) -> Self {
        Self { probe }
    }

    /// Mode file first, then the manifest override, then the backend probe.
    /// Whatever is chosen on first resolution is persisted.
    pub async fn resolve_mode(
        &self,
        store: &ModeStore,
        manifest_override: Option<DeploymentMode>,
    ) -> Result<ModeResolution, CoreError> {
        if let Some(mode) = store.load()? {
            return Ok(ModeResolution {
                mode,
                source: ModeSource::Loaded,
            });
        }

        let resolution = match manifest_override {
            Some(mode) => ModeResolution {
                mode,
                source: ModeSource::Overridden,
            },
            None => {
                let mode = if self.probe.cluster_active().await? {
                    DeploymentMode::Clustered
                } else {
                    DeploymentMode::SingleHost
                };
                ModeResolution {
                    mode,
                    source: ModeSource::Detected,
                }
            }
        };
        store.save(resolution.mode)?;
        tracing::info!(
            path = %store.path().display(),
            mode = %resolution.mode,
            source = %resolution.source,
            "Persisted deployment mode"
        );
        Ok(resolution)
    }

    /// Validate and persist a new mode. Does not redeploy.
    pub async fn set_mode(
        &self,
        store: &ModeStore,
        mode: DeploymentMode,
    ) -> Result<ModeChange, CoreError> {
        let previous = store.load().unwrap_or(None);
        if mode == DeploymentMode::Clustered && !self.probe.cluster_active().await? {
            return Err(CoreError::ClusterInactive);
        }
        store.save(mode)?;
        Ok(ModeChange {
            previous,
            mode,
            redeploy_required: previous != Some(mode),
        })
    }
}

/// Probe with a fixed answer, for tests and offline tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe {
    pub active: bool,
}

impl ClusterProbe for StaticProbe {
    fn cluster_active<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CoreError>> + Send + 'a>> {
        let active = self.active;
        Box::pin(async move { Ok(active) })
    }
}
