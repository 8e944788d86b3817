//! Compose descriptor generation.
//!
//! `generate` is a pure function of the manifest, the resolved environment,
//! the deployment mode and the dependency digests. Writing the result to disk
//! is a separate step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_yaml_ng::Value;
use sha2::{Digest, Sha256};

use crate::env::ResolvedEnvironment;
use crate::error::CoreError;
use crate::expand::expand;
use crate::manifest::{AppManifest, CommandSpec, ServiceSpec};
use crate::mode::DeploymentMode;
use crate::paths::AppPaths;

/// Container paths the canonical host directories are bound to.
pub const CODE_TARGET: &str = "/app";
pub const CONFIG_TARGET: &str = "/config";
pub const DATA_TARGET: &str = "/data";
pub const ENV_TARGET: &str = "/venv";

/// Marker recording the digest of the last dependency install.
pub const DEPS_MARKER: &str = "/venv/.kata-deps";

/// A runtime shortcut: base image plus dependency install recipe.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeProfile {
    pub name: &'static str,
    pub image: &'static str,
    pub dependency_file: &'static str,
    install: &'static str,
    default_command: &'static str,
    pub(crate) env: &'static [(&'static str, &'static str)],
}

const RUNTIMES: &[RuntimeProfile] = &[
    RuntimeProfile {
        name: "python",
        image: "python:3.12-slim",
        dependency_file: "requirements.txt",
        install: "([ -x /venv/bin/python ] || python -m venv /venv) && /venv/bin/pip install --no-cache-dir -r /app/requirements.txt",
        default_command: "python app.py",
        env: &[
            ("VIRTUAL_ENV", "/venv"),
            ("PATH", "/venv/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"),
            ("PYTHONUNBUFFERED", "1"),
        ],
    },
    RuntimeProfile {
        name: "nodejs",
        image: "node:20-slim",
        dependency_file: "package.json",
        install: "cp /app/package.json /venv/package.json && npm install --omit=dev --prefix /venv",
        default_command: "npm start",
        env: &[
            ("NODE_ENV", "production"),
            ("NODE_PATH", "/venv/node_modules"),
            ("PATH", "/venv/node_modules/.bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"),
        ],
    },
];

pub fn runtime_profile(name: &str) -> Option<&'static RuntimeProfile> {
    RUNTIMES.iter().find(|r| r.name == name)
}

/// SHA-256 digests of dependency files found in a checkout, keyed by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyDigests(BTreeMap<String, String>);

impl DependencyDigests {
    /// Hash every known runtime dependency file present in `code_dir`.
    pub fn compute(code_dir: &Path) -> Result<Self, CoreError> {
        let mut digests = BTreeMap::new();
        for profile in RUNTIMES {
            let path = code_dir.join(profile.dependency_file);
            if path.is_file() {
                let bytes = std::fs::read(&path)?;
                digests.insert(profile.dependency_file.to_string(), hex::encode(Sha256::digest(&bytes)));
            }
        }
        Ok(Self(digests))
    }

    pub fn insert(&mut self, file: &str, digest: &str) {
        self.0.insert(file.to_string(), digest.to_string());
    }

    pub fn get(&self, file: &str) -> Option<&str> {
        self.0.get(file).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartPolicy {
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployPolicy {
    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalSecret {
    pub external: bool,
    pub name: String,
}

/// One service entry of the generated compose document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComposeService {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployPolicy>,
    pub labels: BTreeMap<String, String>,
}

/// The generated compose document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Descriptor {
    pub services: BTreeMap<String, ComposeService>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, ExternalSecret>,
}

impl Descriptor {
    pub fn to_yaml(&self) -> Result<String, CoreError> {
        serde_yaml_ng::to_string(self).map_err(|e| CoreError::Descriptor(e.to_string()))
    }
}

/// Name of an app's secret inside the cluster backend.
///
/// Neither app names nor secret names may contain `.`, so the first `.`
/// always splits owner from secret.
pub fn qualified_secret_name(app: &str, secret: &str) -> String {
    format!("{app}.{secret}")
}

/// Compose interpolates `$` itself; values are already expanded.
fn escape(value: &str) -> String {
    value.replace('$', "$$")
}

fn escape_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(escape(s)),
        Value::Sequence(items) => Value::Sequence(items.iter().map(escape_value).collect()),
        Value::Mapping(map) => Value::Mapping(
            map.iter()
                .map(|(k, v)| (k.clone(), escape_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn expand_value(value: &Value, env: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(expand(s, |k| env.get(k).cloned())),
        Value::Sequence(items) => Value::Sequence(items.iter().map(|v| expand_value(v, env)).collect()),
        Value::Mapping(map) => Value::Mapping(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_value(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Turns an app's manifest into its compose descriptor.
pub struct DescriptorGenerator<'a> {
    paths: &'a AppPaths,
}

impl<'a> DescriptorGenerator<'a> {
    pub fn new(paths: &'a AppPaths) -> Self {
        Self { paths }
    }

    pub fn generate(
        &self,
        manifest: &AppManifest,
        env: &ResolvedEnvironment,
        mode: DeploymentMode,
        digests: &DependencyDigests,
    ) -> Result<Descriptor, CoreError> {
        if manifest.routing.is_some() && env.get("PORT").is_none() && !manifest.declares_ports() {
            return Err(CoreError::MissingPort {
                app: manifest.name.clone(),
            });
        }

        let mut descriptor = Descriptor::default();
        for (name, spec) in &manifest.services {
            if !spec.secrets.is_empty() && mode == DeploymentMode::SingleHost {
                return Err(CoreError::SecretsRequireCluster {
                    service: name.clone(),
                });
            }
            let service_env = env.service(name).cloned().unwrap_or_else(|| env.app.clone());
            let service = self.service(&manifest.name, name, spec, service_env, mode, digests)?;
            for secret in &spec.secrets {
                descriptor.secrets.insert(
                    secret.clone(),
                    ExternalSecret {
                        external: true,
                        name: qualified_secret_name(&manifest.name, secret),
                    },
                );
            }
            descriptor.services.insert(name.clone(), service);
        }
        Ok(descriptor)
    }

    fn service(
        &self,
        app: &str,
        name: &str,
        spec: &ServiceSpec,
        mut env: BTreeMap<String, String>,
        mode: DeploymentMode,
        digests: &DependencyDigests,
    ) -> Result<ComposeService, CoreError> {
        let lookup = |k: &str| env.get(k).cloned();
        let mut out = ComposeService {
            image: spec.image.as_deref().map(|i| escape(&expand(i, lookup))),
            build: spec.build.clone(),
            ports: spec.ports.iter().map(|p| escape_value(&expand_value(p, &env))).collect(),
            volumes: spec.volumes.iter().map(|v| escape_value(&expand_value(v, &env))).collect(),
            secrets: spec.secrets.clone(),
            depends_on: spec.depends_on.clone(),
            labels: BTreeMap::from([("kata.app".to_string(), app.to_string())]),
            ..Default::default()
        };
        let command = spec.command.as_ref().map(|c| match c {
            CommandSpec::Shell(line) => CommandSpec::Shell(expand(line, lookup)),
            CommandSpec::Exec(args) => {
                CommandSpec::Exec(args.iter().map(|a| expand(a, lookup)).collect())
            }
        });

        let command = match &spec.runtime {
            Some(runtime) => {
                let profile = runtime_profile(runtime).ok_or_else(|| CoreError::UnknownRuntime {
                    service: name.to_string(),
                    runtime: runtime.clone(),
                })?;
                out.image = Some(profile.image.to_string());
                out.working_dir = Some(CODE_TARGET.to_string());
                for (key, value) in profile.env {
                    env.entry(key.to_string()).or_insert_with(|| value.to_string());
                }
                let run = command
                    .map(|c| c.to_shell())
                    .unwrap_or_else(|| profile.default_command.to_string());
                Some(runtime_command(profile, digests.get(profile.dependency_file), &run))
            }
            None => command,
        };
        out.command = command.map(|c| match c {
            CommandSpec::Shell(line) => CommandSpec::Shell(escape(&line)),
            CommandSpec::Exec(args) => CommandSpec::Exec(args.iter().map(|a| escape(a)).collect()),
        });

        out.environment = env.iter().map(|(k, v)| (k.clone(), escape(v))).collect();

        let taken = spec.mount_targets();
        let mut binds = vec![(&self.paths.code, CODE_TARGET), (&self.paths.data, DATA_TARGET)];
        if mode == DeploymentMode::SingleHost {
            binds.push((&self.paths.config, CONFIG_TARGET));
        }
        binds.push((&self.paths.env, ENV_TARGET));
        for (host, target) in binds {
            if !taken.iter().any(|t| t == target) {
                out.volumes.push(Value::String(escape(&format!(
                    "{}:{target}",
                    host.display()
                ))));
            }
        }

        match mode {
            DeploymentMode::SingleHost => out.restart = Some("unless-stopped".into()),
            DeploymentMode::Clustered => {
                out.deploy = Some(DeployPolicy {
                    restart_policy: RestartPolicy {
                        condition: "any".into(),
                    },
                })
            }
        }
        Ok(out)
    }

    /// Serialize and overwrite the descriptor file.
    pub fn write(&self, descriptor: &Descriptor) -> Result<PathBuf, CoreError> {
        let path = self.paths.descriptor();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, descriptor.to_yaml()?)?;
        Ok(path)
    }
}

/// `sh -c` wrapper that installs dependencies only when the digest changed.
fn runtime_command(profile: &RuntimeProfile, digest: Option<&str>, run: &str) -> CommandSpec {
    let script = match digest {
        Some(digest) => format!(
            "if [ \"$(cat {DEPS_MARKER} 2>/dev/null)\" != \"{digest}\" ]; then {install} && echo {digest} > {DEPS_MARKER}; fi; exec {run}",
            install = profile.install,
        ),
        None => format!("exec {run}"),
    };
    CommandSpec::Exec(vec!["sh".into(), "-c".into(), script])
}
