//! Canonical instance model
//!
//! Both sides of a reconciliation pass are expressed in these types: the
//! normalizer builds the desired [`CanonicalConfig`] and the reader in
//! `pveflow-reconcile` projects the remote configuration into the same shape.

mod cloud_init;
mod cpu;
mod disk;
mod memory;
mod network;

pub use cloud_init::*;
pub use cpu::*;
pub use disk::*;
pub use memory::*;
pub use network::*;

use crate::field::Field;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Which API collection an instance lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    #[default]
    Vm,
    Container,
}

impl InstanceKind {
    /// Path segment under `/nodes/{node}/`.
    pub fn api_collection(&self) -> &'static str {
        match self {
            InstanceKind::Vm => "qemu",
            InstanceKind::Container => "lxc",
        }
    }
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceKind::Vm => write!(f, "vm"),
            InstanceKind::Container => write!(f, "container"),
        }
    }
}

/// Where an instance lives on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub node: String,
    pub vm_id: u32,
    #[serde(default)]
    pub kind: InstanceKind,
}

impl InstanceIdentity {
    pub fn new(node: impl Into<String>, vm_id: u32) -> Self {
        Self {
            node: node.into(),
            vm_id,
            kind: InstanceKind::Vm,
        }
    }

    pub fn with_kind(mut self, kind: InstanceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Same instance on another node.
    pub fn on_node(&self, node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            vm_id: self.vm_id,
            kind: self.kind,
        }
    }
}

impl std::fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.kind.api_collection(), self.vm_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupPolicy {
    pub order: Option<u32>,
    pub up_delay: Option<u32>,
    pub down_delay: Option<u32>,
}

impl StartupPolicy {
    pub fn is_empty(&self) -> bool {
        self.order.is_none() && self.up_delay.is_none() && self.down_delay.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleFlags {
    pub started: Field<bool>,
    pub template: Field<bool>,
    pub on_boot: Field<bool>,
}

/// QEMU guest agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub enabled: bool,
    pub trim: bool,
    pub agent_type: String,
}

/// Template or instance a new instance is cloned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSource {
    /// Defaults to the target node when unset
    pub node: Option<String>,
    pub vm_id: u32,
    pub datastore_id: Option<String>,
    pub full: bool,
    pub retries: u32,
}

/// Operating system definition required by custom creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingSystem {
    pub os_type: String,
    /// Container template volume, e.g. `local:vztmpl/debian-12.tar.zst`
    pub template_file_id: Option<String>,
}

/// Typed configuration of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalConfig {
    pub name: Field<String>,
    pub description: Field<String>,
    pub tags: Field<BTreeSet<String>>,
    pub cpu: Field<CpuConfig>,
    pub memory: Field<MemoryConfig>,
    /// Keyed by interface name. An empty desired map leaves disks unmanaged.
    pub disks: BTreeMap<String, StorageDevice>,
    pub networks: Field<Vec<NetworkDevice>>,
    /// `None` leaves cloud-init unmanaged on the desired side.
    pub cloud_init: Option<CloudInitConfig>,
    pub startup: Field<Option<StartupPolicy>>,
    pub lifecycle: LifecycleFlags,
    pub boot_order: Field<Vec<String>>,
    pub bios: Field<String>,
    pub machine: Field<String>,
    pub keyboard_layout: Field<String>,
    pub os_type: Field<String>,
    pub acpi: Field<bool>,
    pub tablet_device: Field<bool>,
    pub protection: Field<bool>,
    pub scsi_hardware: Field<String>,
    pub agent: Field<AgentConfig>,
}

/// Output of the normalizer: a desired configuration plus placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredInstance {
    pub node: String,
    pub vm_id: Option<u32>,
    pub kind: InstanceKind,
    pub pool_id: Option<String>,
    pub clone: Option<CloneSource>,
    pub operating_system: Option<OperatingSystem>,
    pub config: CanonicalConfig,
}

impl DesiredInstance {
    /// Identity once the instance id is known.
    pub fn identity(&self, vm_id: u32) -> InstanceIdentity {
        InstanceIdentity {
            node: self.node.clone(),
            vm_id,
            kind: self.kind,
        }
    }

    pub fn is_clone(&self) -> bool {
        self.clone.is_some()
    }
}
