use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::PipelineError;

/// File name of the host configuration inside the kata root.
pub const CONFIG_FILE: &str = "kata.toml";

/// Kata root: `KATA_ROOT`, else `~/.kata`.
pub fn default_root() -> PathBuf {
    if let Ok(root) = std::env::var("KATA_ROOT")
        && !root.trim().is_empty()
    {
        return PathBuf::from(root);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kata")
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KataConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_admin_url")]
    pub admin_url: String,
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
}

fn default_admin_url() -> String {
    "http://localhost:2019".into()
}
fn default_proxy_timeout() -> u64 {
    10
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            timeout_secs: default_proxy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Container engine client, e.g. `docker` or `podman`.
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_compose_args")]
    pub compose_args: Vec<String>,
    #[serde(default = "default_runtime_timeout")]
    pub timeout_secs: u64,
}

fn default_binary() -> String {
    "docker".into()
}
fn default_compose_args() -> Vec<String> {
    vec!["compose".into()]
}
fn default_runtime_timeout() -> u64 {
    600
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            compose_args: default_compose_args(),
            timeout_secs: default_runtime_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_wait")]
    pub wait_secs: u64,
}

fn default_lock_wait() -> u64 {
    10
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_lock_wait(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_branch")]
    pub deploy_branch: String,
    #[serde(default = "default_git_binary")]
    pub binary: String,
}

fn default_branch() -> String {
    "main".into()
}
fn default_git_binary() -> String {
    "git".into()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            deploy_branch: default_branch(),
            binary: default_git_binary(),
        }
    }
}

impl KataConfig {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// `<root>/kata.toml` if present, defaults otherwise, then environment overrides.
    pub fn load(root: &Path) -> Result<Self, PipelineError> {
        let path = root.join(CONFIG_FILE);
        let config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn with_env_overrides<F>(mut self, get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = get("KATA_PROXY_URL").filter(|u| !u.trim().is_empty()) {
            self.proxy.admin_url = url;
        }
        self
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.timeout_secs)
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.timeout_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.locks.wait_secs)
    }

    /// The deploy branch as a full ref name.
    pub fn deploy_ref(&self) -> String {
        let branch = self.git.deploy_branch.trim();
        if branch.starts_with("refs/") {
            branch.to_string()
        } else {
            format!("refs/heads/{branch}")
        }
    }
}
