use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::record::{FieldCase, Identity};

/// Environment variables that override identity and sidecar settings
pub const ENV_OVERRIDES: [&str; 8] = [
    "POE_SIDECAR_URL",
    "POE_SERVICE_NAME",
    "POE_SERVICE_NAMESPACE",
    "POE_POD_NAME",
    "POE_POD_UID",
    "POE_IMAGE_DIGEST",
    "POE_CODE_VERSION",
    "POE_CODE_HASH",
];

/// Main PoE configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub log_level: LogLevel,
    pub sidecar: SidecarConfig,
    pub identity: Identity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Collector endpoint records are POSTed to
    pub url: String,
    /// Bound on establishing the connection
    pub connect_timeout_ms: u64,
    /// Advisory deadline for the whole background send
    pub deadline_ms: u64,
    /// Bound on each stage after connecting: request write, body write, response head (null waits forever)
    pub release_timeout_ms: Option<u64>,
    /// Wire field naming
    pub field_case: FieldCase,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8089/prove".to_string(),
            connect_timeout_ms: 2000,
            deadline_ms: 3000,
            release_timeout_ms: Some(10_000),
            field_case: FieldCase::Camel,
        }
    }
}

impl SidecarConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn release_timeout(&self) -> Option<Duration> {
        self.release_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration with fallback chain, then apply environment overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file(config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_file(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Check POE_CONFIG env var
        if let Ok(env_path) = std::env::var("POE_CONFIG") {
            let path = Self::expand_path(Path::new(&env_path));
            if path.exists() {
                match Self::load_from_file(&path) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from POE_CONFIG: {}", e);
                    }
                }
            }
        }

        // Try POE_DIR/poe.yaml, then ~/.config/poe/poe.yaml
        let path = Self::poe_dir().join("poe.yaml");
        if path.exists() {
            match Self::load_from_file(&path) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", path.display(), e);
                }
            }
        }

        // Try ./poe.yaml (for development)
        let local_config = PathBuf::from("poe.yaml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load local config: {}", e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment). Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("POE_SIDECAR_URL") {
            self.sidecar.url = url;
        }
        if let Some(name) = get("POE_SERVICE_NAME") {
            self.identity.service_name = name;
        }

        let optional = [
            ("POE_SERVICE_NAMESPACE", &mut self.identity.service_namespace),
            ("POE_POD_NAME", &mut self.identity.pod_name),
            ("POE_POD_UID", &mut self.identity.pod_uid),
            ("POE_IMAGE_DIGEST", &mut self.identity.image_digest),
            ("POE_CODE_VERSION", &mut self.identity.code_version),
            ("POE_CODE_HASH", &mut self.identity.code_hash),
        ];
        for (key, field) in optional {
            if let Some(value) = get(key) {
                *field = Some(value);
            }
        }
    }

    /// Get the PoE directory (where poe.yaml lives)
    pub fn poe_dir() -> PathBuf {
        std::env::var("POE_DIR")
            .map(|dir| Self::expand_path(Path::new(&dir)))
            .unwrap_or_else(|_| dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("poe"))
    }

    /// Expand a path that may contain ~ or env vars
    pub fn expand_path(path: &Path) -> PathBuf {
        let path_str = path.to_string_lossy();
        let expanded = shellexpand::full(&path_str).unwrap_or_else(|_| path_str.clone());
        PathBuf::from(expanded.as_ref())
    }
}
