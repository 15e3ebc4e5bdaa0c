//! convoy.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{duration_or, parse_duration};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConvoyConfig {
    pub deploy: DeploySettings,
    pub health: HealthSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploySettings {
    /// Bound on every supervision, launcher, and artifact call.
    pub collaborator_timeout: String,
    /// First delay before retrying a failed collaborator call.
    pub retry_base: String,
    /// Upper bound for the retry backoff.
    pub retry_max: String,
    /// Capacity of the event bus.
    pub event_buffer: usize,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            collaborator_timeout: "10s".to_string(),
            retry_base: "1s".to_string(),
            retry_max: "60s".to_string(),
            event_buffer: 1024,
        }
    }
}

impl DeploySettings {
    pub fn collaborator_timeout(&self) -> Duration {
        duration_or(&self.collaborator_timeout, Duration::from_secs(10))
    }

    pub fn retry_base(&self) -> Duration {
        duration_or(&self.retry_base, Duration::from_secs(1))
    }

    pub fn retry_max(&self) -> Duration {
        duration_or(&self.retry_max, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    /// Bound on task listing and kill calls made by health monitors.
    pub collaborator_timeout: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            collaborator_timeout: "5s".to_string(),
        }
    }
}

impl HealthSettings {
    pub fn collaborator_timeout(&self) -> Duration {
        duration_or(&self.collaborator_timeout, Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info,convoyd=debug,convoy=debug".to_string(),
            json: false,
        }
    }
}

impl ConvoyConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: ConvoyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (key, value) in [
            ("deploy.collaborator_timeout", &self.deploy.collaborator_timeout),
            ("deploy.retry_base", &self.deploy.retry_base),
            ("deploy.retry_max", &self.deploy.retry_max),
            ("health.collaborator_timeout", &self.health.collaborator_timeout),
        ] {
            if parse_duration(value)?.is_zero() {
                anyhow::bail!("{key} must be greater than zero");
            }
        }
        if self.deploy.retry_base() > self.deploy.retry_max() {
            anyhow::bail!("deploy.retry_base must not exceed deploy.retry_max");
        }
        Ok(())
    }
}
