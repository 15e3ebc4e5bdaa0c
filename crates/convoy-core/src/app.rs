//! Application definitions as read from the declared-state store.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{duration_or, parse_duration};
use crate::error::{CoreError, CoreResult};
use crate::ids::{AppId, Version};

/// Desired state of one application version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSpec {
    pub id: AppId,
    pub version: Version,
    /// Desired number of running instances.
    #[serde(default)]
    pub instances: u32,
    /// Applications that must settle before this one starts.
    #[serde(default)]
    pub dependencies: BTreeSet<AppId>,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckSpec>,
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,
    /// Artifact URIs that must be resolvable before the version can start.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl AppSpec {
    pub fn new(id: AppId, version: impl Into<Version>, instances: u32) -> Self {
        Self {
            id,
            version: version.into(),
            instances,
            dependencies: BTreeSet::new(),
            health_checks: Vec::new(),
            upgrade_strategy: UpgradeStrategy::default(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: AppId) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn with_health_check(mut self, check: HealthCheckSpec) -> Self {
        self.health_checks.push(check);
        self
    }

    pub fn with_minimum_health_capacity(mut self, capacity: f64) -> Self {
        self.upgrade_strategy.minimum_health_capacity = capacity;
        self
    }

    pub fn with_artifact(mut self, uri: impl Into<String>) -> Self {
        self.artifacts.push(uri.into());
        self
    }

    /// Validate value ranges that serde cannot express.
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |reason: String| CoreError::InvalidSpec {
            app_id: self.id.to_string(),
            reason,
        };

        let capacity = self.upgrade_strategy.minimum_health_capacity;
        if !(0.0..=1.0).contains(&capacity) {
            return Err(invalid(format!(
                "minimum_health_capacity must be within [0, 1], got {capacity}"
            )));
        }
        for (index, check) in self.health_checks.iter().enumerate() {
            check
                .validate()
                .map_err(|e| invalid(format!("health check {index}: {e}")))?;
        }
        Ok(())
    }
}

/// Capacity bounds applied while replacing one version by another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeStrategy {
    /// Fraction of the old instance count kept available during an upgrade.
    #[serde(default = "default_capacity")]
    pub minimum_health_capacity: f64,
}

fn default_capacity() -> f64 {
    1.0
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: default_capacity(),
        }
    }
}

/// Protocol used by a health check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthProtocol {
    #[default]
    Http,
    Tcp,
}

/// Health check parameters for an application version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub protocol: HealthProtocol,
    /// HTTP path to probe. Ignored for TCP checks.
    #[serde(default = "default_path")]
    pub path: String,
    /// Index into the task's port list.
    #[serde(default)]
    pub port_index: usize,
    /// Failures are not escalated for this long after task start.
    #[serde(default = "default_grace_period")]
    pub grace_period: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Consecutive failures before the task is killed. Zero disables kills.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_grace_period() -> String {
    "300s".to_string()
}

fn default_interval() -> String {
    "60s".to_string()
}

fn default_timeout() -> String {
    "20s".to_string()
}

fn default_max_failures() -> u32 {
    3
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            protocol: HealthProtocol::default(),
            path: default_path(),
            port_index: 0,
            grace_period: default_grace_period(),
            interval: default_interval(),
            timeout: default_timeout(),
            max_consecutive_failures: default_max_failures(),
        }
    }
}

impl HealthCheckSpec {
    pub fn http(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn tcp() -> Self {
        Self {
            protocol: HealthProtocol::Tcp,
            ..Self::default()
        }
    }

    pub fn grace_period(&self) -> Duration {
        duration_or(&self.grace_period, Duration::from_secs(300))
    }

    pub fn interval(&self) -> Duration {
        duration_or(&self.interval, Duration::from_secs(60))
    }

    pub fn timeout(&self) -> Duration {
        duration_or(&self.timeout, Duration::from_secs(20))
    }

    fn validate(&self) -> CoreResult<()> {
        parse_duration(&self.grace_period)?;
        parse_duration(&self.timeout)?;
        if parse_duration(&self.interval)?.is_zero() {
            return Err(CoreError::InvalidDuration(self.interval.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str) -> AppSpec {
        AppSpec::new(AppId::new(id).unwrap(), "v1", 3)
    }

    #[test]
    fn defaults_follow_full_capacity() {
        let spec = app("/web");
        assert_eq!(spec.upgrade_strategy.minimum_health_capacity, 1.0);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn capacity_out_of_range_is_rejected() {
        let spec = app("/web").with_minimum_health_capacity(1.5);
        assert!(matches!(spec.validate(), Err(CoreError::InvalidSpec { .. })));

        let spec = app("/web").with_minimum_health_capacity(f64::NAN);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn health_check_durations() {
        let check = HealthCheckSpec {
            interval: "500ms".to_string(),
            grace_period: "0s".to_string(),
            ..HealthCheckSpec::http("/healthz")
        };
        assert_eq!(check.interval(), Duration::from_millis(500));
        assert_eq!(check.grace_period(), Duration::ZERO);
        assert_eq!(check.timeout(), Duration::from_secs(20));

        let zero = HealthCheckSpec {
            interval: "0s".to_string(),
            ..HealthCheckSpec::tcp()
        };
        assert!(app("/web").with_health_check(zero).validate().is_err());
    }

    #[test]
    fn parses_from_toml() {
        let spec: AppSpec = toml::from_str(
            r#"
id = "/prod/api"
version = "2024-06-01"
instances = 4
dependencies = ["/prod/db"]
artifacts = ["https://artifacts.local/api.tar.gz"]

[upgrade_strategy]
minimum_health_capacity = 0.5

[[health_checks]]
protocol = "tcp"
max_consecutive_failures = 0
"#,
        )
        .unwrap();

        assert_eq!(spec.instances, 4);
        assert_eq!(spec.upgrade_strategy.minimum_health_capacity, 0.5);
        assert_eq!(spec.health_checks[0].protocol, HealthProtocol::Tcp);
        assert_eq!(spec.health_checks[0].max_consecutive_failures, 0);
        assert_eq!(spec.health_checks[0].interval, "60s");
        assert!(spec.dependencies.contains(&AppId::new("/prod/db").unwrap()));
    }
}
