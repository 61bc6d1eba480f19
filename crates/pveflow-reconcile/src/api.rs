//! Hypervisor API seam
//!
//! Everything the engine needs from the remote side. `pveflow-pve` provides
//! the HTTP implementation; tests use an in-memory fake.

use crate::error::Result;
use async_trait::async_trait;
use pveflow_core::{InstanceIdentity, InstanceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Creates an instance and returns its id. The id is allocated remotely
    /// when the request carries none.
    async fn create_instance(&self, node: &str, request: &CreateRequest) -> Result<u32>;

    /// Clones `source` and returns the new instance id. The caller waits for
    /// the config lock to clear.
    async fn clone_instance(
        &self,
        source: &InstanceIdentity,
        request: &CloneRequest,
        retries: u32,
    ) -> Result<u32>;

    /// Fails with `NotFound` when the instance does not exist.
    async fn get_instance(&self, id: &InstanceIdentity) -> Result<ObservedConfig>;

    async fn get_instance_status(&self, id: &InstanceIdentity) -> Result<InstanceStatus>;

    async fn update_instance(&self, id: &InstanceIdentity, request: &UpdateRequest) -> Result<()>;

    async fn move_disk(&self, id: &InstanceIdentity, request: &MoveDiskRequest) -> Result<()>;

    async fn resize_disk(&self, id: &InstanceIdentity, request: &ResizeDiskRequest) -> Result<()>;

    async fn migrate_instance(&self, id: &InstanceIdentity, request: &MigrateRequest)
    -> Result<()>;

    async fn start_instance(&self, id: &InstanceIdentity, timeout: Duration) -> Result<()>;

    async fn shutdown_instance(&self, id: &InstanceIdentity, request: &ShutdownRequest)
    -> Result<()>;

    async fn stop_instance(&self, id: &InstanceIdentity, timeout: Duration) -> Result<()>;

    async fn reboot_instance(&self, id: &InstanceIdentity, timeout: Duration) -> Result<()>;
}

/// Remote configuration as returned by the API, values kept as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservedConfig(BTreeMap<String, serde_json::Value>);

impl ObservedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// String form of a value; numbers and booleans are stringified.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            _ => None,
        }
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.0.get(key)? {
            serde_json::Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f as u64))
                .and_then(|v| u32::try_from(v).ok()),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Number(n) => n.as_u64().map(|v| v != 0),
            serde_json::Value::String(s) => Some(pveflow_core::wire::decode_bool(s)),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl From<BTreeMap<String, serde_json::Value>> for ObservedConfig {
    fn from(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub status: RunState,
    /// Config lock held by an in-flight task, e.g. `clone`
    #[serde(default)]
    pub lock: Option<String>,
}

impl InstanceStatus {
    pub fn running() -> Self {
        Self {
            status: RunState::Running,
            lock: None,
        }
    }

    pub fn stopped() -> Self {
        Self {
            status: RunState::Stopped,
            lock: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunState::Running
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub kind: InstanceKind,
    pub vm_id: Option<u32>,
    /// Parameters in remote form (`cores`, `scsi0`, `net0`, ...)
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneRequest {
    pub new_id: Option<u32>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub pool_id: Option<String>,
    pub target_datastore: Option<String>,
    pub full: bool,
}

/// Partial update: parameters to set plus parameters to delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub set: BTreeMap<String, String>,
    pub delete: Vec<String>,
}

impl UpdateRequest {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.delete.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveDiskRequest {
    pub interface: String,
    pub target_datastore: String,
    pub delete_original: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeDiskRequest {
    pub interface: String,
    pub size_gib: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateRequest {
    pub target_node: String,
    pub with_local_disks: bool,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// Hard-stop once `timeout` passes without a clean shutdown
    pub force_stop: bool,
    pub timeout: Duration,
}

/// Retry configuration for idempotent reads
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}
