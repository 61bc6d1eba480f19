//! User-facing instance definition
//!
//! Mirrors the declarative document loaded by the CLI. Every field is
//! optional; presence is what the normalizer turns into provenance.

use crate::model::{InstanceKind, SpeedLimits};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawInstance {
    pub node_name: String,
    pub vm_id: Option<u32>,
    pub kind: InstanceKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub pool_id: Option<String>,

    pub started: Option<bool>,
    pub template: Option<bool>,
    pub on_boot: Option<bool>,

    pub bios: Option<String>,
    pub machine: Option<String>,
    pub keyboard_layout: Option<String>,
    pub scsi_hardware: Option<String>,
    pub acpi: Option<bool>,
    pub tablet_device: Option<bool>,
    pub protection: Option<bool>,
    pub boot_order: Option<Vec<String>>,

    pub clone: Option<RawClone>,
    pub operating_system: Option<RawOperatingSystem>,
    pub cpu: Option<RawCpu>,
    pub memory: Option<RawMemory>,
    pub agent: Option<RawAgent>,
    pub startup: Option<RawStartup>,
    pub disks: Vec<RawDisk>,
    pub efi_disk: Option<RawEfiDisk>,
    pub tpm_state: Option<RawTpmState>,
    pub network_devices: Option<Vec<RawNetworkDevice>>,
    pub initialization: Option<RawInitialization>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawClone {
    pub vm_id: u32,
    pub node_name: Option<String>,
    pub datastore_id: Option<String>,
    pub full: Option<bool>,
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawOperatingSystem {
    #[serde(rename = "type")]
    pub os_type: Option<String>,
    pub template_file_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawCpu {
    pub architecture: Option<String>,
    pub cores: Option<u32>,
    pub sockets: Option<u32>,
    pub units: Option<u32>,
    pub flags: Option<Vec<String>>,
    #[serde(rename = "type")]
    pub cpu_type: Option<String>,
    pub hotplugged: Option<u32>,
    pub limit: Option<u32>,
    pub numa: Option<bool>,
}

impl RawCpu {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawMemory {
    pub dedicated: Option<u32>,
    pub floating: Option<u32>,
    pub shared: Option<u32>,
}

impl RawMemory {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawAgent {
    pub enabled: Option<bool>,
    pub trim: Option<bool>,
    #[serde(rename = "type")]
    pub agent_type: Option<String>,
}

impl RawAgent {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawStartup {
    pub order: Option<u32>,
    pub up_delay: Option<u32>,
    pub down_delay: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawDisk {
    pub interface: String,
    pub datastore_id: Option<String>,
    /// GiB
    pub size: Option<u64>,
    pub file_format: Option<String>,
    pub file_id: Option<String>,
    pub cache: Option<String>,
    pub discard: Option<String>,
    pub ssd: Option<bool>,
    pub iothread: Option<bool>,
    pub backup: Option<bool>,
    pub speed: Option<SpeedLimits>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawEfiDisk {
    pub datastore_id: Option<String>,
    pub file_format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawTpmState {
    pub datastore_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawNetworkDevice {
    pub enabled: Option<bool>,
    pub bridge: Option<String>,
    pub model: Option<String>,
    pub mac_address: Option<String>,
    pub vlan_id: Option<u16>,
    pub rate_limit: Option<f64>,
    pub mtu: Option<u16>,
    pub firewall: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawInitialization {
    pub datastore_id: Option<String>,
    pub interface: Option<String>,
    pub dns: Option<RawDns>,
    pub ip_config: Vec<RawIpConfig>,
    pub user_account: Option<RawUserAccount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawDns {
    pub domain: Option<String>,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawIpConfig {
    pub ipv4: Option<RawAddress>,
    pub ipv6: Option<RawAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawAddress {
    pub address: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawUserAccount {
    pub username: Option<String>,
    pub password: Option<String>,
    pub keys: Vec<String>,
}
