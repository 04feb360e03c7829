//! Resource management: descriptor validation and the reservation contract
//!
//! The engine never provisions compute itself; a resource manager validates
//! the user's resource description and drives a reservation through the
//! runtime system. The contract is abstract, with a local implementation
//! whose provisioning is immediate.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EngineError;

/// Allocation lifecycle states reported by a resource manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    New,
    Pending,
    Active,
    Done,
    Failed,
    Canceled,
}

/// A validated resource request
///
/// `resource`, `walltime` (minutes) and `cores` are mandatory; `cpus` is
/// accepted as an alias for `cores` on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescription {
    pub resource: String,
    pub walltime: i64,
    pub cores: i64,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default, rename = "access_schema")]
    pub access_schema: Option<String>,
    #[serde(default)]
    pub gpus: Option<i64>,
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "str",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "dict",
    }
}

fn require_str(
    desc: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<String>, EngineError> {
    match desc.get(key) {
        None => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(EngineError::type_mismatch("str", json_type_name(other))),
    }
}

fn require_int(
    desc: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<i64>, EngineError> {
    match desc.get(key) {
        None => Ok(None),
        Some(serde_json::Value::Number(n)) if n.is_i64() || n.is_u64() => {
            Ok(Some(n.as_i64().unwrap_or(i64::MAX)))
        }
        Some(other) => Err(EngineError::type_mismatch("int", json_type_name(other))),
    }
}

impl ResourceDescription {
    /// Parse and validate a description from a JSON value
    pub fn from_value(value: &serde_json::Value) -> Result<Self, EngineError> {
        let desc = value
            .as_object()
            .ok_or_else(|| EngineError::type_mismatch("dict", json_type_name(value)))?;

        let resource = require_str(desc, "resource")?
            .ok_or_else(|| EngineError::missing("resource description", "resource"))?;
        let walltime = require_int(desc, "walltime")?
            .ok_or_else(|| EngineError::missing("resource description", "walltime"))?;
        let cores = match require_int(desc, "cores")? {
            Some(cores) => cores,
            // 'cpus' is the alias some toolchains emit
            None => require_int(desc, "cpus")?
                .ok_or_else(|| EngineError::missing("resource description", "cores"))?,
        };

        Ok(Self {
            resource,
            walltime,
            cores,
            project: require_str(desc, "project")?,
            queue: require_str(desc, "queue")?,
            access_schema: require_str(desc, "access_schema")?,
            gpus: require_int(desc, "gpus")?,
        })
    }

    /// Parse a description from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self, EngineError> {
        let value: serde_json::Value = serde_yaml::from_str(text)
            .map_err(|e| EngineError::value("resource description", e.to_string()))?;
        Self::from_value(&value)
    }

    /// Parse a description from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::value(
                "resource description",
                format!("cannot read {}: {}", path.as_ref().display(), e),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Semantic checks beyond shape: positive walltime and cores
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.resource.trim().is_empty() {
            return Err(EngineError::missing("resource description", "resource"));
        }
        if self.walltime <= 0 {
            return Err(EngineError::value(
                "resource description",
                format!("walltime must be positive, got {}", self.walltime),
            ));
        }
        if self.cores <= 0 {
            return Err(EngineError::value(
                "resource description",
                format!("cores must be positive, got {}", self.cores),
            ));
        }
        if let Some(gpus) = self.gpus
            && gpus < 0
        {
            return Err(EngineError::value(
                "resource description",
                format!("gpus must be non-negative, got {}", gpus),
            ));
        }
        Ok(())
    }
}

/// The reservation contract the application manager drives
///
/// `submit_reservation` is synchronous with respect to accepting the request;
/// provisioning is asynchronous and observable via `allocation_state`.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// The description this manager was built from
    fn description(&self) -> &ResourceDescription;

    /// Files staged once per reservation, shared by all tasks
    fn shared_data(&self) -> &[String];

    /// Validate the description; must precede `populate`
    fn validate(&mut self) -> Result<(), EngineError>;

    /// Derive internal parameters from the validated description
    fn populate(&mut self) -> Result<(), EngineError>;

    /// Place the resource request
    async fn submit_reservation(&mut self) -> Result<(), EngineError>;

    /// Tear down the reservation, acquired or pending
    async fn cancel_reservation(&mut self) -> Result<(), EngineError>;

    /// Current allocation state
    fn allocation_state(&self) -> AllocationState;

    /// States in which the allocation no longer accepts work
    fn completed_states(&self) -> Vec<AllocationState> {
        vec![
            AllocationState::Done,
            AllocationState::Failed,
            AllocationState::Canceled,
        ]
    }
}

/// Resource manager for local execution
///
/// Accepts any description and treats the reservation as granted the moment
/// it is submitted.
pub struct LocalResourceManager {
    description: ResourceDescription,
    shared_data: Vec<String>,
    state: AllocationState,
    validated: bool,
    populated: bool,
}

impl LocalResourceManager {
    pub fn new(description: ResourceDescription) -> Self {
        Self {
            description,
            shared_data: Vec::new(),
            state: AllocationState::New,
            validated: false,
            populated: false,
        }
    }

    /// Set the files staged once per reservation
    pub fn set_shared_data(&mut self, data: Vec<String>) {
        self.shared_data = data;
    }
}

#[async_trait]
impl ResourceManager for LocalResourceManager {
    fn description(&self) -> &ResourceDescription {
        &self.description
    }

    fn shared_data(&self) -> &[String] {
        &self.shared_data
    }

    fn validate(&mut self) -> Result<(), EngineError> {
        debug!(resource = %self.description.resource, "validating resource description");
        self.description.validate()?;
        self.validated = true;
        Ok(())
    }

    fn populate(&mut self) -> Result<(), EngineError> {
        if !self.validated {
            return Err(EngineError::value(
                "resource manager",
                "resource description not validated",
            ));
        }
        self.populated = true;
        debug!(
            cores = self.description.cores,
            walltime = self.description.walltime,
            "resource manager populated"
        );
        Ok(())
    }

    async fn submit_reservation(&mut self) -> Result<(), EngineError> {
        if !self.populated {
            return Err(EngineError::value(
                "resource manager",
                "resource manager not populated",
            ));
        }
        self.state = AllocationState::Pending;
        // Local resources are granted immediately
        self.state = AllocationState::Active;
        info!(resource = %self.description.resource, "resource reservation active");
        Ok(())
    }

    async fn cancel_reservation(&mut self) -> Result<(), EngineError> {
        self.state = AllocationState::Canceled;
        info!(resource = %self.description.resource, "resource reservation canceled");
        Ok(())
    }

    fn allocation_state(&self) -> AllocationState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_full() {
        let desc = ResourceDescription::from_value(&json!({
            "resource": "xsede.stampede",
            "walltime": 120,
            "cores": 64,
            "project": "TG-abcxyz",
            "queue": "normal",
            "access_schema": "ssh",
            "gpus": 4,
        }))
        .unwrap();

        assert_eq!(desc.resource, "xsede.stampede");
        assert_eq!(desc.walltime, 120);
        assert_eq!(desc.cores, 64);
        assert_eq!(desc.project.as_deref(), Some("TG-abcxyz"));
        assert_eq!(desc.gpus, Some(4));
    }

    #[test]
    fn test_cpus_alias() {
        let desc = ResourceDescription::from_value(&json!({
            "resource": "local.localhost",
            "walltime": 15,
            "cpus": 2,
        }))
        .unwrap();
        assert_eq!(desc.cores, 2);
    }

    #[test]
    fn test_missing_mandatory_key() {
        let err = ResourceDescription::from_value(&json!({
            "resource": "local.localhost",
            "cores": 2,
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Missing { ref attribute, .. } if attribute == "walltime"
        ));
    }

    #[test]
    fn test_wrong_types() {
        let err = ResourceDescription::from_value(&json!({
            "resource": "local.localhost",
            "walltime": "fifteen",
            "cores": 2,
        }))
        .unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));

        let err = ResourceDescription::from_value(&json!(["not", "a", "dict"])).unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_semantic_validation() {
        let mut desc = ResourceDescription::from_value(&json!({
            "resource": "local.localhost",
            "walltime": 15,
            "cores": 2,
        }))
        .unwrap();
        assert!(desc.validate().is_ok());

        desc.walltime = 0;
        assert!(matches!(desc.validate().unwrap_err(), EngineError::Value { .. }));
    }

    #[test]
    fn test_from_yaml() {
        let desc = ResourceDescription::from_yaml_str(
            "resource: local.localhost\nwalltime: 15\ncores: 2\nqueue: debug\n",
        )
        .unwrap();
        assert_eq!(desc.queue.as_deref(), Some("debug"));

        assert!(ResourceDescription::from_yaml_str(": not yaml :").is_err());
    }

    #[tokio::test]
    async fn test_local_manager_lifecycle() {
        let desc = ResourceDescription::from_value(&json!({
            "resource": "local.localhost",
            "walltime": 15,
            "cores": 2,
        }))
        .unwrap();
        let mut rm = LocalResourceManager::new(desc);
        assert_eq!(rm.allocation_state(), AllocationState::New);

        rm.validate().unwrap();
        rm.populate().unwrap();
        rm.submit_reservation().await.unwrap();
        assert_eq!(rm.allocation_state(), AllocationState::Active);

        rm.cancel_reservation().await.unwrap();
        assert_eq!(rm.allocation_state(), AllocationState::Canceled);
        assert!(rm.completed_states().contains(&AllocationState::Canceled));
    }

    #[tokio::test]
    async fn test_populate_requires_validation() {
        let desc = ResourceDescription::from_value(&json!({
            "resource": "local.localhost",
            "walltime": 15,
            "cores": 2,
        }))
        .unwrap();
        let mut rm = LocalResourceManager::new(desc);

        assert!(rm.populate().is_err());
        assert!(rm.submit_reservation().await.is_err());
    }

    #[test]
    fn test_shared_data() {
        let desc = ResourceDescription::from_value(&json!({
            "resource": "local.localhost",
            "walltime": 15,
            "cores": 2,
        }))
        .unwrap();
        let mut rm = LocalResourceManager::new(desc);
        assert!(rm.shared_data().is_empty());

        rm.set_shared_data(vec!["topology.dat".to_string()]);
        assert_eq!(rm.shared_data(), ["topology.dat".to_string()]);
    }
}
