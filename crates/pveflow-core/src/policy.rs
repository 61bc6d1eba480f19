//! Provider-side defaults
//!
//! Values used by the normalizer for anything the user leaves out. They are
//! distinct from the hypervisor's own defaults (see the reader in
//! `pveflow-reconcile`); the planner relies on that distinction.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultPolicy {
    pub cpu_architecture: String,
    pub cpu_cores: u32,
    pub cpu_sockets: u32,
    pub cpu_units: u32,
    pub cpu_type: String,
    pub cpu_limit: u32,
    pub cpu_numa: bool,

    pub memory_dedicated_mb: u32,
    pub memory_floating_mb: u32,
    pub memory_shared_mb: u32,

    pub bios: String,
    pub machine: String,
    pub keyboard_layout: String,
    pub os_type: String,
    pub acpi: bool,
    pub tablet_device: bool,
    pub protection: bool,
    pub scsi_hardware: String,
    pub on_boot: bool,
    pub started: bool,
    pub template: bool,

    pub agent_enabled: bool,
    pub agent_trim: bool,
    pub agent_type: String,

    pub disk_datastore_id: String,
    pub disk_size_gib: u64,
    pub disk_backup: bool,
    pub efi_disk_datastore_id: String,

    pub network_bridge: String,
    pub network_model: String,

    pub cloud_init_datastore_id: String,

    pub clone_full: bool,
    pub clone_retries: u32,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self {
            cpu_architecture: "x86_64".to_string(),
            cpu_cores: 1,
            cpu_sockets: 1,
            cpu_units: 1024,
            cpu_type: "qemu64".to_string(),
            cpu_limit: 0,
            cpu_numa: false,

            memory_dedicated_mb: 512,
            memory_floating_mb: 0,
            memory_shared_mb: 0,

            bios: "seabios".to_string(),
            machine: String::new(),
            keyboard_layout: "en-us".to_string(),
            os_type: "other".to_string(),
            acpi: true,
            tablet_device: true,
            protection: false,
            scsi_hardware: "virtio-scsi-pci".to_string(),
            on_boot: true,
            started: true,
            template: false,

            agent_enabled: false,
            agent_trim: false,
            agent_type: "virtio".to_string(),

            disk_datastore_id: "local-lvm".to_string(),
            disk_size_gib: 8,
            disk_backup: true,
            efi_disk_datastore_id: "local-lvm".to_string(),

            network_bridge: "vmbr0".to_string(),
            network_model: "virtio".to_string(),

            cloud_init_datastore_id: "local-lvm".to_string(),

            clone_full: true,
            clone_retries: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = DefaultPolicy::default();
        assert_eq!(policy.cpu_cores, 1);
        assert_eq!(policy.cpu_type, "qemu64");
        assert_eq!(policy.memory_dedicated_mb, 512);
        assert_eq!(policy.keyboard_layout, "en-us");
        assert!(policy.started);
    }

    #[test]
    fn test_partial_override() {
        let yaml = "cpu_cores: 2\nnetwork_bridge: vmbr1\n";
        let policy: DefaultPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.cpu_cores, 2);
        assert_eq!(policy.network_bridge, "vmbr1");
        assert_eq!(policy.cpu_sockets, 1);
        assert_eq!(policy.bios, "seabios");
    }
}
