//! Identifiers for applications, tasks, versions, and deployments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Path-like application identifier, e.g. `/prod/payments/api`.
///
/// Segments are lowercase ASCII alphanumerics, `-` and `.`, and never start
/// or end with `-`. Underscores are reserved for task id encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId(String);

impl AppId {
    pub fn new(path: impl AsRef<str>) -> CoreResult<Self> {
        let path = path.as_ref();
        let invalid = |reason: &str| CoreError::InvalidAppId {
            id: path.to_string(),
            reason: reason.to_string(),
        };

        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| invalid("must be absolute"))?;
        if rest.is_empty() {
            return Err(invalid("root is not an application"));
        }
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
            {
                return Err(invalid("segments allow only [a-z0-9.-]"));
            }
            if segment.starts_with('-') || segment.ends_with('-') {
                return Err(invalid("segments must not start or end with '-'"));
            }
        }
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id with `/` replaced by `_`, usable inside other identifiers.
    pub fn safe_path(&self) -> String {
        self.0.trim_start_matches('/').replace('/', "_")
    }

    fn from_safe_path(safe: &str) -> Option<Self> {
        Self::new(format!("/{}", safe.replace('_', "/"))).ok()
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AppId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AppId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AppId> for String {
    fn from(id: AppId) -> Self {
        id.0
    }
}

/// Identifier of a single task instance.
///
/// Ids minted by [`TaskId::for_app`] embed the owning app so the app can be
/// recovered with [`TaskId::app_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh task id for `app`: `<safe path>.<uuid>`.
    pub fn for_app(app: &AppId) -> Self {
        Self(format!("{}.{}", app.safe_path(), Uuid::new_v4()))
    }

    /// The app this task belongs to, if the id follows the minted format.
    pub fn app_id(&self) -> Option<AppId> {
        let (safe, _) = self.0.rsplit_once('.')?;
        AppId::from_safe_path(safe)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version tag of an application definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

impl From<String> for Version {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

/// Generated identifier of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(Uuid);

impl DeploymentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_nested_paths() {
        let id = AppId::new("/prod/payments/api-v2").unwrap();
        assert_eq!(id.as_str(), "/prod/payments/api-v2");
        assert_eq!(id.safe_path(), "prod_payments_api-v2");
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["prod/api", "/", "/prod//api", "/Prod", "/-api", "/api_x", "/api/"] {
            assert!(AppId::new(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn task_id_recovers_app() {
        let app = AppId::new("/prod/db.primary").unwrap();
        let task = TaskId::for_app(&app);
        assert!(task.as_str().starts_with("prod_db.primary."));
        assert_eq!(task.app_id(), Some(app));
    }

    #[test]
    fn foreign_task_id_has_no_app() {
        assert_eq!(TaskId::new("no-dot-here").app_id(), None);
    }

    #[test]
    fn app_id_deserializes_with_validation() {
        let ok: AppId = serde_json::from_str("\"/web\"").unwrap();
        assert_eq!(ok.as_str(), "/web");
        assert!(serde_json::from_str::<AppId>("\"web\"").is_err());
    }
}
