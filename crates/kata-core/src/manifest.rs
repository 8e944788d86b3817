use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml_ng::{Mapping, Value};

use crate::error::CoreError;
use crate::mode::DeploymentMode;

/// Ordered `KEY -> value` pairs from an `environment:` block or override file.
///
/// Both the mapping form and the list form (`["KEY=VALUE", "BARE"]`)
/// normalize to this shape. Later entries win over earlier ones with the
/// same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawEnvBlock")]
pub struct EnvEntries(Vec<(String, String)>);

impl EnvEntries {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self(entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEnvBlock {
    Map(Mapping),
    List(Vec<String>),
}

impl TryFrom<RawEnvBlock> for EnvEntries {
    type Error = String;

    fn try_from(raw: RawEnvBlock) -> Result<Self, Self::Error> {
        let mut entries = Vec::new();
        match raw {
            RawEnvBlock::Map(map) => {
                for (key, value) in map {
                    let key = match key {
                        Value::String(k) => k,
                        other => return Err(format!("environment key {other:?} is not a string")),
                    };
                    let value = scalar_to_string(&value)
                        .ok_or_else(|| format!("environment value for '{key}' must be a scalar"))?;
                    entries.push((key, value));
                }
            }
            RawEnvBlock::List(items) => {
                for item in items {
                    entries.push(split_assignment(&item));
                }
            }
        }
        if let Some((key, _)) = entries.iter().find(|(k, _)| k.trim().is_empty()) {
            return Err(format!("environment entry with empty key ('{key}')"));
        }
        Ok(Self(entries))
    }
}

/// `KEY=VALUE` splits on the first `=`; a bare `KEY` means an empty value.
pub fn split_assignment(item: &str) -> (String, String) {
    match item.split_once('=') {
        Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
        None => (item.trim().to_string(), String::new()),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// A service command, either a shell string or an exec-form list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandSpec {
    /// Render as a single shell line (exec-form arguments are quoted).
    pub fn to_shell(&self) -> String {
        match self {
            CommandSpec::Shell(line) => line.clone(),
            CommandSpec::Exec(args) => args
                .iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// One entry of the manifest's `services:` mapping.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build: Option<Value>,
    /// Runtime shortcut (e.g. `python`) used when no image is given.
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub ports: Vec<Value>,
    #[serde(default)]
    pub volumes: Vec<Value>,
    #[serde(default)]
    pub environment: Option<EnvEntries>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ServiceSpec {
    pub fn environment(&self) -> EnvEntries {
        self.environment.clone().unwrap_or_default()
    }

    /// Container paths this service already mounts something at.
    pub fn mount_targets(&self) -> Vec<String> {
        self.volumes.iter().filter_map(volume_target).collect()
    }
}

/// Target path of a compose volume entry, short (`src:dst[:mode]`) or long form.
pub fn volume_target(volume: &Value) -> Option<String> {
    match volume {
        Value::String(spec) => {
            let parts: Vec<&str> = spec.split(':').collect();
            let target = match parts.len() {
                1 => parts[0],
                _ => parts[1],
            };
            Some(normalize_target(target))
        }
        Value::Mapping(map) => map
            .get("target")
            .and_then(Value::as_str)
            .map(normalize_target),
        _ => None,
    }
}

fn normalize_target(target: &str) -> String {
    let trimmed = target.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    environment: Option<EnvEntries>,
    #[serde(default)]
    services: Option<Mapping>,
    #[serde(default)]
    routing: Option<Value>,
    #[serde(default)]
    mode_override: Option<DeploymentMode>,
}

/// The parsed per-app manifest. Re-read on every deploy, never written.
#[derive(Debug, Clone, PartialEq)]
pub struct AppManifest {
    pub name: String,
    pub environment: EnvEntries,
    /// Services in declaration order.
    pub services: Vec<(String, ServiceSpec)>,
    /// One routing-server object, as JSON for the proxy API.
    pub routing: Option<serde_json::Value>,
    pub mode_override: Option<DeploymentMode>,
}

impl AppManifest {
    /// Load and validate the manifest of `app` from `path`.
    pub fn load(app: &str, path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Err(CoreError::ManifestNotFound(
                path.parent().unwrap_or(path).to_path_buf(),
            ));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(app, &content).map_err(|message| CoreError::InvalidManifest {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parse manifest text. Errors are plain messages; `load` attaches the path.
    pub fn parse(app: &str, content: &str) -> Result<Self, String> {
        let raw: RawManifest = serde_yaml_ng::from_str(content).map_err(|e| e.to_string())?;

        let mut services = Vec::new();
        for (key, value) in raw.services.unwrap_or_default() {
            let name = match key {
                Value::String(name) => name,
                other => return Err(format!("service name {other:?} is not a string")),
            };
            let spec: ServiceSpec = serde_yaml_ng::from_value(value)
                .map_err(|e| format!("service '{name}': {e}"))?;
            validate_service(&name, &spec)?;
            services.push((name, spec));
        }
        if services.is_empty() {
            return Err("at least one service must be declared under 'services'".into());
        }

        let routing = match raw.routing {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::to_value(&value).map_err(|e| format!("routing: {e}"))?,
            ),
        };

        Ok(Self {
            name: app.to_string(),
            environment: raw.environment.unwrap_or_default(),
            services,
            routing,
            mode_override: raw.mode_override,
        })
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }

    /// Whether any service asks for runtime secrets.
    pub fn uses_secrets(&self) -> bool {
        self.services.iter().any(|(_, s)| !s.secrets.is_empty())
    }

    pub fn declares_ports(&self) -> bool {
        self.services.iter().any(|(_, s)| !s.ports.is_empty())
    }
}

fn validate_service(name: &str, spec: &ServiceSpec) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("service names must not be empty".into());
    }
    let sources = [
        spec.image.is_some(),
        spec.build.is_some(),
        spec.runtime.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    match sources {
        1 => {}
        0 => {
            return Err(format!(
                "service '{name}' needs one of 'image', 'build' or 'runtime'"
            ));
        }
        _ => {
            return Err(format!(
                "service '{name}' may declare only one of 'image', 'build' or 'runtime'"
            ));
        }
    }
    if let Some(bad) = spec
        .secrets
        .iter()
        .find(|s| s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || "_-".contains(c)))
    {
        return Err(format!("service '{name}' has invalid secret name '{bad}'"));
    }
    Ok(())
}
