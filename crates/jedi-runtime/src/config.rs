//! Runtime configuration loaded from YAML.
//!
//! ```yaml
//! backend: unix
//! admission:
//!   max_processes: 64
//!   poll_interval: 100ms
//! ```

use std::path::Path;
use std::time::Duration;

use jedi_common::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};

use crate::admission::{DEFAULT_MAX_PROCESSES, DEFAULT_POLL_INTERVAL};

/// Which backend the registry installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Host,
    Unix,
}

impl std::str::FromStr for BackendKind {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(BackendKind::Host),
            "unix" => Ok(BackendKind::Unix),
            other => Err(RuntimeError::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Admission control options for the native backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_processes: default_max_processes(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_max_processes() -> usize {
    DEFAULT_MAX_PROCESSES
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

impl RuntimeConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            RuntimeError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> RuntimeResult<Self> {
        let config: RuntimeConfig = serde_yaml::from_str(content)
            .map_err(|e| RuntimeError::Config(format!("Failed to parse YAML configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.admission.max_processes == 0 {
            return Err(RuntimeError::Config(
                "admission.max_processes must be greater than 0".to_string(),
            ));
        }
        if self.admission.poll_interval.is_zero() {
            return Err(RuntimeError::Config(
                "admission.poll_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let invalid = || format!("Invalid duration: {}", s);
        // "ms" before "s" since "ms" ends with 's'
        if let Some(num) = s.strip_suffix("ms") {
            num.trim().parse().map(Duration::from_millis).map_err(|_| invalid())
        } else if let Some(num) = s.strip_suffix('s') {
            num.trim().parse().map(Duration::from_secs).map_err(|_| invalid())
        } else if let Some(num) = s.strip_suffix('m') {
            num.trim()
                .parse::<u64>()
                .map(|mins| Duration::from_secs(mins * 60))
                .map_err(|_| invalid())
        } else {
            Err(format!("Duration must end with 's', 'ms', or 'm': {}", s))
        }
    }
}
