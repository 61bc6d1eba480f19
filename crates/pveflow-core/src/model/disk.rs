use crate::error::{CoreError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static INTERFACE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(ide|sata|scsi|virtio)(\d+)$").expect("valid regex"));

pub const EFI_DISK_INTERFACE: &str = "efidisk0";
pub const TPM_STATE_INTERFACE: &str = "tpmstate0";
/// Root volume of a container.
pub const ROOT_FS_INTERFACE: &str = "rootfs";

/// Storage bus family. Fixed for an interface once the instance exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusFamily {
    Ide,
    Sata,
    Scsi,
    Virtio,
}

impl BusFamily {
    /// Highest slot index the hypervisor accepts on this bus.
    pub fn max_slot(&self) -> u32 {
        match self {
            BusFamily::Ide => 3,
            BusFamily::Sata => 5,
            BusFamily::Scsi => 30,
            BusFamily::Virtio => 15,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            BusFamily::Ide => "ide",
            BusFamily::Sata => "sata",
            BusFamily::Scsi => "scsi",
            BusFamily::Virtio => "virtio",
        }
    }

    /// All interface names on this bus in slot order.
    pub fn interfaces(&self) -> impl Iterator<Item = String> + '_ {
        (0..=self.max_slot()).map(move |i| format!("{}{}", self.prefix(), i))
    }
}

/// Splits `scsi1` into its bus family and slot, rejecting out-of-range slots.
pub fn parse_interface(name: &str) -> Result<(BusFamily, u32)> {
    let caps = INTERFACE_PATTERN
        .captures(name)
        .ok_or_else(|| CoreError::InvalidInterface(name.to_string()))?;

    let family = match &caps[1] {
        "ide" => BusFamily::Ide,
        "sata" => BusFamily::Sata,
        "scsi" => BusFamily::Scsi,
        _ => BusFamily::Virtio,
    };
    let slot: u32 = caps[2]
        .parse()
        .map_err(|_| CoreError::InvalidInterface(name.to_string()))?;

    if slot > family.max_slot() {
        return Err(CoreError::InvalidInterface(name.to_string()));
    }
    Ok((family, slot))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskClass {
    #[default]
    Data,
    Efi,
    TpmState,
}

impl DiskClass {
    pub fn for_interface(name: &str) -> Result<Self> {
        match name {
            EFI_DISK_INTERFACE => Ok(DiskClass::Efi),
            TPM_STATE_INTERFACE => Ok(DiskClass::TpmState),
            other => parse_interface(other).map(|_| DiskClass::Data),
        }
    }
}

/// Per-disk throughput limits. MB/s for bandwidth, operations/s for iops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedLimits {
    pub read_mbps: Option<u32>,
    pub write_mbps: Option<u32>,
    pub read_burstable_mbps: Option<u32>,
    pub write_burstable_mbps: Option<u32>,
    pub iops_read: Option<u32>,
    pub iops_write: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDevice {
    pub interface: String,
    pub class: DiskClass,
    pub datastore_id: String,
    /// Path inside the datastore; `None` until the volume is allocated
    pub path_in_datastore: Option<String>,
    pub size_gib: u64,
    pub format: Option<String>,
    pub file_id: Option<String>,
    pub cache: Option<String>,
    pub discard: Option<String>,
    pub ssd: bool,
    pub iothread: bool,
    pub backup: bool,
    pub speed: SpeedLimits,
}

impl StorageDevice {
    pub fn new(interface: impl Into<String>, datastore_id: impl Into<String>, size_gib: u64) -> Self {
        Self {
            interface: interface.into(),
            class: DiskClass::Data,
            datastore_id: datastore_id.into(),
            path_in_datastore: None,
            size_gib,
            format: None,
            file_id: None,
            cache: None,
            discard: None,
            ssd: false,
            iothread: false,
            backup: true,
            speed: SpeedLimits::default(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path_in_datastore = Some(path.into());
        self
    }

    pub fn bus(&self) -> Option<BusFamily> {
        parse_interface(&self.interface).ok().map(|(family, _)| family)
    }

    /// Volume id as the hypervisor writes it in the `file` position.
    pub fn file_volume(&self) -> String {
        match &self.path_in_datastore {
            Some(path) => format!("{}:{}", self.datastore_id, path),
            None => format!("{}:{}", self.datastore_id, self.size_gib),
        }
    }

    /// Whether the allocated volume belongs to `vm_id`.
    pub fn is_owned_by(&self, vm_id: u32) -> bool {
        let Some(path) = &self.path_in_datastore else {
            return false;
        };
        let prefix = format!("vm-{}-", vm_id);
        path.starts_with(&prefix) || path.starts_with(&format!("{}/{}", vm_id, prefix))
    }

    /// Compares the tunable options, ignoring placement and size.
    pub fn same_options(&self, other: &StorageDevice) -> bool {
        self.cache == other.cache
            && self.discard == other.discard
            && self.ssd == other.ssd
            && self.iothread == other.iothread
            && self.backup == other.backup
            && self.speed == other.speed
    }
}
