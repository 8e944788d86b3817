//! Layered environment resolution.
//!
//! Layers, lowest to highest precedence: base identity/path variables, the
//! manifest `environment:` block, the operator override file, and finally
//! each service's own `environment:` entries. Services with a `runtime:`
//! get the runtime's variables directly above the base layer, so `$PATH`
//! in later layers extends the runtime's search path.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::CoreError;
use crate::descriptor::runtime_profile;
use crate::expand::expand;
use crate::manifest::{AppManifest, EnvEntries, split_assignment};
use crate::paths::AppPaths;

/// Owner ids exported as `PUID` / `PGID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    /// Take the ids from the owner of `root` (the kata root directory).
    #[cfg(unix)]
    pub fn from_owner(root: &Path) -> Result<Self, CoreError> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::metadata(root)?;
        Ok(Self {
            uid: meta.uid(),
            gid: meta.gid(),
        })
    }

    #[cfg(not(unix))]
    pub fn from_owner(root: &Path) -> Result<Self, CoreError> {
        std::fs::metadata(root)?;
        Ok(Self { uid: 0, gid: 0 })
    }
}

/// Result of resolution: one app-wide map plus one merged map per service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnvironment {
    pub app: BTreeMap<String, String>,
    pub services: BTreeMap<String, BTreeMap<String, String>>,
}

impl ResolvedEnvironment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.app.get(key).map(String::as_str)
    }

    pub fn service(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.services.get(name)
    }

    /// The app-wide map as sorted `KEY=VALUE` lines.
    pub fn to_env_file(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.app {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// Builds the [`ResolvedEnvironment`] for one app.
pub struct EnvironmentResolver {
    paths: AppPaths,
    identity: Identity,
    ambient: BTreeMap<String, String>,
}

impl EnvironmentResolver {
    pub fn new(paths: AppPaths, identity: Identity) -> Self {
        Self {
            paths,
            identity,
            ambient: BTreeMap::new(),
        }
    }

    /// Fallback values for `$VAR` references the layers do not define.
    pub fn with_ambient(mut self, ambient: BTreeMap<String, String>) -> Self {
        self.ambient = ambient;
        self
    }

    /// Resolve using the override file on disk.
    pub fn resolve(&self, manifest: &AppManifest) -> Result<ResolvedEnvironment, CoreError> {
        let overrides = load_override_file(&self.paths.override_file())?;
        Ok(self.resolve_with_overrides(manifest, &overrides))
    }

    /// Resolve with explicit override entries. Touches no files.
    pub fn resolve_with_overrides(
        &self,
        manifest: &AppManifest,
        overrides: &EnvEntries,
    ) -> ResolvedEnvironment {
        let mut app = self.base_layer();
        self.apply_layer(&mut app, &manifest.environment);
        self.apply_layer(&mut app, overrides);

        let mut services = BTreeMap::new();
        for (name, spec) in &manifest.services {
            let mut merged = match spec.runtime.as_deref().and_then(runtime_profile) {
                Some(profile) => {
                    let mut layered = self.base_layer();
                    for (key, value) in profile.env {
                        layered.insert(key.to_string(), value.to_string());
                    }
                    self.apply_layer(&mut layered, &manifest.environment);
                    self.apply_layer(&mut layered, overrides);
                    layered
                }
                None => app.clone(),
            };
            self.apply_layer(&mut merged, &spec.environment());
            services.insert(name.clone(), merged);
        }

        tracing::debug!(
            app = %self.paths.name,
            vars = app.len(),
            services = services.len(),
            "Resolved environment"
        );
        ResolvedEnvironment { app, services }
    }

    fn base_layer(&self) -> BTreeMap<String, String> {
        let p = &self.paths;
        let display = |path: &Path| path.to_string_lossy().into_owned();
        BTreeMap::from([
            ("APP".to_string(), p.name.clone()),
            ("PUID".to_string(), self.identity.uid.to_string()),
            ("PGID".to_string(), self.identity.gid.to_string()),
            ("APP_ROOT".to_string(), display(&p.code)),
            ("DATA_ROOT".to_string(), display(&p.data)),
            ("CONFIG_ROOT".to_string(), display(&p.config)),
            ("ENV_ROOT".to_string(), display(&p.env)),
            ("LOG_ROOT".to_string(), display(&p.logs)),
        ])
    }

    fn apply_layer(&self, target: &mut BTreeMap<String, String>, layer: &EnvEntries) {
        for (key, raw) in layer.iter() {
            // Lookup sees the map before this key is written, so `$KEY`
            // inside its own value yields the lower layer's value.
            let value = expand(raw, |name| {
                target
                    .get(name)
                    .or_else(|| self.ambient.get(name))
                    .cloned()
            });
            target.insert(key.to_string(), value);
        }
    }
}

/// Read `KEY=VALUE` lines; a missing file is an empty layer.
pub fn load_override_file(path: &Path) -> Result<EnvEntries, CoreError> {
    if !path.exists() {
        return Ok(EnvEntries::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_override_file(path, &content)
}

pub fn parse_override_file(path: &Path, content: &str) -> Result<EnvEntries, CoreError> {
    let mut entries = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, value) = split_assignment(trimmed);
        if key.is_empty() {
            return Err(CoreError::InvalidOverride {
                path: path.to_path_buf(),
                line: idx + 1,
                message: "empty variable name".into(),
            });
        }
        entries.push((key, value));
    }
    Ok(EnvEntries::new(entries))
}

/// Render override entries back to file form, one `KEY=VALUE` per line.
pub fn render_override_file(entries: &BTreeMap<String, String>) -> String {
    entries
        .iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::HostLayout;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn resolver() -> EnvironmentResolver {
        let layout = HostLayout::new(PathBuf::from("/srv/kata"));
        EnvironmentResolver::new(layout.app("myapp"), Identity { uid: 1000, gid: 1000 })
    }

    fn manifest(yaml: &str) -> AppManifest {
        AppManifest::parse("myapp", yaml).unwrap()
    }

    fn overrides(pairs: &[(&str, &str)]) -> EnvEntries {
        EnvEntries::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn override_file_beats_manifest() {
        let m = manifest("environment:\n  PORT: 8000\nservices:\n  web: {image: a}\n");
        let env = resolver().resolve_with_overrides(&m, &overrides(&[("PORT", "9000")]));
        assert_eq!(env.get("PORT"), Some("9000"));
        assert_eq!(env.service("web").unwrap()["PORT"], "9000");
    }

    #[test]
    fn service_entries_win_for_that_service_only() {
        let m = manifest(
            "environment:\n  PORT: 8000\nservices:\n  web:\n    image: a\n    environment: {PORT: 7000}\n  worker: {image: b}\n",
        );
        let env = resolver().resolve_with_overrides(&m, &overrides(&[("PORT", "9000")]));
        assert_eq!(env.service("web").unwrap()["PORT"], "7000");
        assert_eq!(env.service("worker").unwrap()["PORT"], "9000");
        assert_eq!(env.get("PORT"), Some("9000"));
    }

    #[test]
    fn base_layer_is_lowest() {
        let m = manifest("environment:\n  APP: renamed\nservices:\n  web: {image: a}\n");
        let env = resolver().resolve_with_overrides(&m, &EnvEntries::default());
        assert_eq!(env.get("APP"), Some("renamed"));
        assert_eq!(env.get("PUID"), Some("1000"));
        assert_eq!(env.get("DATA_ROOT"), Some("/srv/kata/data/myapp"));
        assert_eq!(env.get("LOG_ROOT"), Some("/srv/kata/logs/myapp"));
    }

    #[test]
    fn references_resolve_against_earlier_values() {
        let m = manifest(
            "environment:\n  HOST: 0.0.0.0\n  BIND: $HOST:${PORT}\n  LOGS: $LOG_ROOT/app.log\nservices:\n  web: {image: a}\n",
        );
        let env = resolver().resolve_with_overrides(&m, &overrides(&[("PORT", "9000")]));
        // PORT arrives in a later layer, so it stays literal.
        assert_eq!(env.get("BIND"), Some("0.0.0.0:${PORT}"));
        assert_eq!(env.get("LOGS"), Some("/srv/kata/logs/myapp/app.log"));
    }

    #[test]
    fn self_reference_sees_lower_layer() {
        let m = manifest("environment:\n  PATH: /opt/bin\nservices:\n  web: {image: a}\n");
        let env = resolver().resolve_with_overrides(&m, &overrides(&[("PATH", "$PATH:/extra")]));
        assert_eq!(env.get("PATH"), Some("/opt/bin:/extra"));

        let m = manifest("environment:\n  LOOP: x$LOOP\nservices:\n  web: {image: a}\n");
        let env = resolver().resolve_with_overrides(&m, &EnvEntries::default());
        assert_eq!(env.get("LOOP"), Some("x$LOOP"));
    }

    #[test]
    fn ambient_is_only_a_fallback() {
        let ambient = BTreeMap::from([
            ("HOME".to_string(), "/home/kata".to_string()),
            ("PORT".to_string(), "1".to_string()),
        ]);
        let m = manifest(
            "environment:\n  PORT: 8000\n  CACHE: $HOME/.cache\n  URL: http://x:$PORT\nservices:\n  web: {image: a}\n",
        );
        let env = resolver()
            .with_ambient(ambient)
            .resolve_with_overrides(&m, &EnvEntries::default());
        assert_eq!(env.get("CACHE"), Some("/home/kata/.cache"));
        assert_eq!(env.get("URL"), Some("http://x:8000"));
        assert!(env.get("HOME").is_none());
    }

    #[test]
    fn runtime_path_survives_path_extension() {
        let ambient = BTreeMap::from([("PATH".to_string(), "/host/bin".to_string())]);
        let m = manifest(
            "environment:\n  PATH: $PATH:/opt/tools\nservices:\n  web: {runtime: python}\n  proxy: {image: nginx}\n",
        );
        let env = resolver()
            .with_ambient(ambient)
            .resolve_with_overrides(&m, &EnvEntries::default());

        let web = &env.service("web").unwrap()["PATH"];
        assert!(web.starts_with("/venv/bin:"), "{web}");
        assert!(web.ends_with(":/opt/tools"));
        assert_eq!(env.service("web").unwrap()["VIRTUAL_ENV"], "/venv");
        assert_eq!(env.service("proxy").unwrap()["PATH"], "/host/bin:/opt/tools");
        assert_eq!(env.get("PATH"), Some("/host/bin:/opt/tools"));
        assert!(env.get("VIRTUAL_ENV").is_none());
    }

    #[test]
    fn runtime_variables_yield_to_explicit_values() {
        let m = manifest(
            "environment:\n  NODE_ENV: development\nservices:\n  web: {runtime: nodejs}\n",
        );
        let env = resolver().resolve_with_overrides(&m, &overrides(&[("NODE_PATH", "/deps")]));
        let web = env.service("web").unwrap();
        assert_eq!(web["NODE_ENV"], "development");
        assert_eq!(web["NODE_PATH"], "/deps");
        assert!(web["PATH"].starts_with("/venv/node_modules/.bin:"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let m = manifest("environment:\n  A: 1\n  B: $A\nservices:\n  web: {image: a}\n");
        let r = resolver();
        let first = r.resolve_with_overrides(&m, &EnvEntries::default());
        let second = r.resolve_with_overrides(&m, &EnvEntries::default());
        assert_eq!(first, second);
        assert_eq!(first.to_env_file(), second.to_env_file());
    }

    #[test]
    fn parses_override_file() {
        let content = "# comment\n\nPORT = 9000\nBARE\nURL=http://a=b\n";
        let entries = parse_override_file(Path::new("ENV"), content).unwrap();
        let pairs: Vec<(&str, &str)> = entries.iter().collect();
        assert_eq!(pairs, vec![("PORT", "9000"), ("BARE", ""), ("URL", "http://a=b")]);
    }

    #[test]
    fn override_with_empty_key_names_line() {
        let err = parse_override_file(Path::new("/c/ENV"), "A=1\n=oops\n").unwrap_err();
        match err {
            CoreError::InvalidOverride { line, .. } => assert_eq!(line, 2),
            other => panic!("expected InvalidOverride, got {other:?}"),
        }
    }

    #[test]
    fn resolve_reads_override_file() {
        let tmp = TempDir::new().unwrap();
        let layout = HostLayout::new(tmp.path().to_path_buf());
        let paths = layout.app("myapp");
        std::fs::create_dir_all(&paths.config).unwrap();
        std::fs::write(paths.override_file(), "PORT=9000\n").unwrap();

        let identity = Identity::from_owner(tmp.path()).unwrap();
        let m = manifest("environment:\n  PORT: 8000\nservices:\n  web: {image: a}\n");
        let env = EnvironmentResolver::new(paths, identity).resolve(&m).unwrap();
        assert_eq!(env.get("PORT"), Some("9000"));
        assert_eq!(env.get("PUID"), Some(identity.uid.to_string().as_str()));
    }

    #[test]
    fn missing_override_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_override_file(&tmp.path().join("ENV")).unwrap().is_empty());
    }

    #[test]
    fn renders_override_file_sorted() {
        let entries = BTreeMap::from([
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "1".to_string()),
        ]);
        assert_eq!(render_override_file(&entries), "A=1\nB=2\n");
    }
}
