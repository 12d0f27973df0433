use anyhow::{Context, Result};
use authz_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment prefix for overrides, e.g. `AUTHZ__ENGINE__MAX_HIERARCHY_DEPTH=4`
pub const ENV_PREFIX: &str = "AUTHZ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Model file (`.conf` text or `.json` structured model)
    pub model: PathBuf,
    /// CSV policy file backing the enforcer
    pub policy: PathBuf,
    /// Objects that exist without appearing in any policy row
    #[serde(default)]
    pub known_objects: Vec<String>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: PathBuf::from("model.conf"),
            policy: PathBuf::from("policy.csv"),
            known_objects: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional YAML file plus environment overrides.
    /// Relative paths are resolved against the settings file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let defaults = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("model", defaults.model.to_string_lossy().to_string())?
            .set_default("policy", defaults.policy.to_string_lossy().to_string())?;

        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let cfg = builder
            .build()
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let mut settings: Settings = cfg
            .try_deserialize()
            .context("settings do not match the expected shape")?;

        let base = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        settings.model = resolve(&base, &settings.model);
        settings.policy = resolve(&base, &settings.policy);

        Ok(settings)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}
