//! Remote state reader
//!
//! Projects the remote configuration into a [`CanonicalConfig`]. Anything the
//! API omits is filled with the hypervisor's documented default and tagged
//! [`Field::RemoteDefault`], never with the provider default.

use crate::api::{HypervisorApi, InstanceStatus, ObservedConfig};
use crate::error::{ReconcileError, Result};
use pveflow_core::model::{
    AgentConfig, BusFamily, CanonicalConfig, CloudInitConfig, CloudInitDns, CpuConfig,
    InstanceIdentity, InstanceKind, IpConfig, LifecycleFlags, MemoryConfig, NetworkDevice,
    StorageDevice, UserAccount, EFI_DISK_INTERFACE, MAX_NETWORK_SLOTS, ROOT_FS_INTERFACE,
    TPM_STATE_INTERFACE, is_cloud_init_volume,
};
use pveflow_core::{wire, Field};
use std::collections::{BTreeMap, BTreeSet};

/// Buses scanned for drives, in cloud-init discovery order.
const DRIVE_BUSES: &[BusFamily] = &[
    BusFamily::Ide,
    BusFamily::Sata,
    BusFamily::Scsi,
    BusFamily::Virtio,
];

const MAX_IP_CONFIGS: usize = 32;

mod remote_default {
    pub const CORES: u32 = 1;
    pub const SOCKETS: u32 = 1;
    pub const CPU_UNITS: u32 = 1024;
    pub const CPU_LIMIT: u32 = 0;
    pub const CPU_TYPE: &str = "kvm64";
    pub const MEMORY_MB: u32 = 512;
    pub const BALLOON_MB: u32 = 0;
    pub const BIOS: &str = "seabios";
    pub const OS_TYPE: &str = "other";
    pub const SCSI_HARDWARE: &str = "lsi";
}

/// Observed side of a pass.
#[derive(Debug, Clone)]
pub struct Observed {
    pub identity: InstanceIdentity,
    pub config: CanonicalConfig,
    pub status: InstanceStatus,
    /// Bus slots holding any drive, cdrom media included
    pub occupied_slots: BTreeSet<String>,
}

impl Observed {
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }
}

/// Reads configuration and status of `id`.
///
/// `NotFound` is propagated untouched so the caller can treat the instance
/// as deleted.
pub async fn read_observed<A: HypervisorApi + ?Sized>(
    api: &A,
    id: &InstanceIdentity,
) -> Result<Observed> {
    tracing::debug!("Reading remote configuration of {}", id);
    let raw = api.get_instance(id).await?;
    let status = api.get_instance_status(id).await?;
    let (config, occupied_slots) = project(&raw, id, &status)?;

    Ok(Observed {
        identity: id.clone(),
        config,
        status,
        occupied_slots,
    })
}

/// Pure projection of a remote configuration.
pub fn project(
    raw: &ObservedConfig,
    id: &InstanceIdentity,
    status: &InstanceStatus,
) -> Result<(CanonicalConfig, BTreeSet<String>)> {
    let (disks, cloud_init, occupied, networks) = match id.kind {
        InstanceKind::Vm => {
            let (disks, cloud_init, occupied) = read_drives(raw, id.vm_id)?;
            (disks, cloud_init, occupied, read_networks(raw)?)
        }
        InstanceKind::Container => {
            let (networks, ip_configs) = read_container_networks(raw)?;
            let init = CloudInitConfig {
                dns: read_dns(raw),
                ip_configs,
                ..CloudInitConfig::new(String::new())
            };
            (read_rootfs(raw)?, Some(init), BTreeSet::new(), networks)
        }
    };

    let name_key = match id.kind {
        InstanceKind::Vm => "name",
        InstanceKind::Container => "hostname",
    };

    let config = CanonicalConfig {
        name: Field::from_remote(raw.get_str(name_key), String::new()),
        description: Field::from_remote(
            raw.get_str("description")
                .map(|d| d.trim_end_matches(['\n', '\r']).to_string()),
            String::new(),
        ),
        tags: Field::from_remote(raw.get_str("tags").map(|t| wire::decode_tags(&t)), BTreeSet::new()),
        cpu: read_cpu(raw),
        memory: read_memory(raw, id.kind),
        disks,
        networks,
        cloud_init,
        startup: Field::from_remote(
            raw.get_str("startup").map(|s| Some(wire::decode_startup(&s))),
            None,
        ),
        lifecycle: LifecycleFlags {
            started: Field::Explicit(status.is_running()),
            template: Field::from_remote(raw.get_bool("template"), false),
            on_boot: Field::from_remote(raw.get_bool("onboot"), false),
        },
        boot_order: Field::from_remote(
            raw.get_str("boot").map(|b| wire::decode_boot_order(&b)),
            Vec::new(),
        ),
        bios: Field::from_remote(raw.get_str("bios"), remote_default::BIOS.to_string()),
        machine: Field::from_remote(raw.get_str("machine"), String::new()),
        keyboard_layout: Field::from_remote(raw.get_str("keyboard"), String::new()),
        os_type: Field::from_remote(raw.get_str("ostype"), remote_default::OS_TYPE.to_string()),
        acpi: Field::from_remote(raw.get_bool("acpi"), true),
        tablet_device: Field::from_remote(raw.get_bool("tablet"), true),
        protection: Field::from_remote(raw.get_bool("protection"), false),
        scsi_hardware: Field::from_remote(
            raw.get_str("scsihw"),
            remote_default::SCSI_HARDWARE.to_string(),
        ),
        agent: Field::from_remote(
            raw.get_str("agent").map(|a| wire::decode_agent(&a)),
            AgentConfig {
                enabled: false,
                trim: false,
                agent_type: "virtio".to_string(),
            },
        ),
    };

    Ok((config, occupied))
}

fn read_cpu(raw: &ObservedConfig) -> Field<CpuConfig> {
    const KEYS: &[&str] = &["arch", "cores", "sockets", "cpuunits", "cpu", "vcpus", "cpulimit", "numa"];

    let (cpu_type, flags) = match raw.get_str("cpu") {
        Some(value) => {
            let (cpu_type, flags) = wire::decode_cpu_emulation(&value);
            (Field::Explicit(cpu_type), Field::Explicit(flags))
        }
        None => (
            Field::RemoteDefault(remote_default::CPU_TYPE.to_string()),
            Field::RemoteDefault(Vec::new()),
        ),
    };

    let cpu = CpuConfig {
        architecture: Field::from_remote(raw.get_str("arch"), String::new()),
        cores: Field::from_remote(raw.get_u32("cores"), remote_default::CORES),
        sockets: Field::from_remote(raw.get_u32("sockets"), remote_default::SOCKETS),
        units: Field::from_remote(raw.get_u32("cpuunits"), remote_default::CPU_UNITS),
        flags,
        cpu_type,
        hotplugged: Field::from_remote(raw.get_u32("vcpus").map(Some), None),
        limit: Field::from_remote(raw.get_u32("cpulimit"), remote_default::CPU_LIMIT),
        numa: Field::from_remote(raw.get_bool("numa"), false),
    };

    if KEYS.iter().any(|k| raw.contains(k)) {
        Field::Explicit(cpu)
    } else {
        Field::RemoteDefault(cpu)
    }
}

fn read_memory(raw: &ObservedConfig, kind: InstanceKind) -> Field<MemoryConfig> {
    let floating_key = match kind {
        InstanceKind::Vm => "balloon",
        InstanceKind::Container => "swap",
    };
    let memory = MemoryConfig {
        dedicated_mb: Field::from_remote(raw.get_u32("memory"), remote_default::MEMORY_MB),
        floating_mb: Field::from_remote(raw.get_u32(floating_key), remote_default::BALLOON_MB),
        shared_mb: Field::from_remote(
            raw.get_str("ivshmem").and_then(|v| wire::decode_shared_memory(&v)),
            0,
        ),
    };

    if ["memory", floating_key, "ivshmem"].iter().any(|k| raw.contains(k)) {
        Field::Explicit(memory)
    } else {
        Field::RemoteDefault(memory)
    }
}

type DriveScan = (
    BTreeMap<String, StorageDevice>,
    Option<CloudInitConfig>,
    BTreeSet<String>,
);

fn read_drives(raw: &ObservedConfig, vm_id: u32) -> Result<DriveScan> {
    let mut disks = BTreeMap::new();
    let mut cloud_init = None;
    let mut occupied = BTreeSet::new();

    let bus_slots = DRIVE_BUSES.iter().flat_map(|bus| bus.interfaces());
    for interface in bus_slots {
        let Some(value) = raw.get_str(&interface) else {
            continue;
        };
        occupied.insert(interface.clone());

        let drive = wire::decode_drive(&interface, &value).map_err(|e| decode_error(&interface, e))?;
        if drive.is_cdrom() {
            if cloud_init.is_none() && is_cloud_init_volume(&drive.volume, vm_id) {
                tracing::debug!("Found cloud-init drive of {} at {}", vm_id, interface);
                cloud_init = Some(read_cloud_init(raw, &interface, &drive.device.datastore_id));
            }
            continue;
        }
        disks.insert(interface, drive.device);
    }

    for interface in [EFI_DISK_INTERFACE, TPM_STATE_INTERFACE] {
        if let Some(value) = raw.get_str(interface) {
            let drive = wire::decode_drive(interface, &value).map_err(|e| decode_error(interface, e))?;
            disks.insert(interface.to_string(), drive.device);
        }
    }

    Ok((disks, cloud_init, occupied))
}

fn read_rootfs(raw: &ObservedConfig) -> Result<BTreeMap<String, StorageDevice>> {
    let mut disks = BTreeMap::new();
    if let Some(value) = raw.get_str(ROOT_FS_INTERFACE) {
        let drive = wire::decode_drive(ROOT_FS_INTERFACE, &value)
            .map_err(|e| decode_error(ROOT_FS_INTERFACE, e))?;
        disks.insert(ROOT_FS_INTERFACE.to_string(), drive.device);
    }
    Ok(disks)
}

fn read_dns(raw: &ObservedConfig) -> Option<CloudInitDns> {
    let domain = raw.get_str("searchdomain");
    let servers = raw.get_str("nameserver");
    (domain.is_some() || servers.is_some()).then(|| CloudInitDns {
        domain,
        servers: servers
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

fn read_cloud_init(raw: &ObservedConfig, interface: &str, datastore_id: &str) -> CloudInitConfig {
    let dns = read_dns(raw);

    let last_ip = (0..MAX_IP_CONFIGS)
        .rev()
        .find(|i| raw.contains(&format!("ipconfig{}", i)));
    let ip_configs = match last_ip {
        Some(last) => (0..=last)
            .map(|i| {
                raw.get_str(&format!("ipconfig{}", i))
                    .map(|v| wire::decode_ip_config(&v))
                    .unwrap_or_else(IpConfig::default)
            })
            .collect(),
        None => Vec::new(),
    };

    let username = raw.get_str("ciuser");
    let password = raw.get_str("cipassword");
    let keys = raw.get_str("sshkeys");
    let user_account =
        (username.is_some() || password.is_some() || keys.is_some()).then(|| UserAccount {
            username,
            password,
            keys: keys
                .map(|k| {
                    k.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        });

    CloudInitConfig {
        datastore_id: datastore_id.to_string(),
        interface: Some(interface.to_string()),
        dns,
        ip_configs,
        user_account,
    }
}

fn read_networks(raw: &ObservedConfig) -> Result<Field<Vec<NetworkDevice>>> {
    let Some(last) = (0..MAX_NETWORK_SLOTS)
        .rev()
        .find(|i| raw.contains(&format!("net{}", i)))
    else {
        return Ok(Field::RemoteDefault(Vec::new()));
    };

    let mut devices = Vec::with_capacity(last + 1);
    for slot in 0..=last {
        let key = format!("net{}", slot);
        let device = match raw.get_str(&key) {
            Some(value) => wire::decode_network_device(&value).map_err(|e| decode_error(&key, e))?,
            None => NetworkDevice::disabled(),
        };
        devices.push(device);
    }
    Ok(Field::Explicit(devices))
}

/// Container slots with their IP settings; gaps get a disabled device and
/// an empty IP config.
fn read_container_networks(raw: &ObservedConfig) -> Result<(Field<Vec<NetworkDevice>>, Vec<IpConfig>)> {
    let Some(last) = (0..MAX_NETWORK_SLOTS)
        .rev()
        .find(|i| raw.contains(&format!("net{}", i)))
    else {
        return Ok((Field::RemoteDefault(Vec::new()), Vec::new()));
    };

    let mut devices = Vec::with_capacity(last + 1);
    let mut ip_configs = Vec::with_capacity(last + 1);
    for slot in 0..=last {
        let key = format!("net{}", slot);
        let (device, ip) = match raw.get_str(&key) {
            Some(value) => wire::decode_container_network(&value).map_err(|e| decode_error(&key, e))?,
            None => (NetworkDevice::disabled(), IpConfig::default()),
        };
        devices.push(device);
        ip_configs.push(ip);
    }
    Ok((Field::Explicit(devices), ip_configs))
}

fn decode_error(key: &str, err: pveflow_core::CoreError) -> ReconcileError {
    ReconcileError::Api(format!("cannot decode remote `{}`: {}", key, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> InstanceIdentity {
        InstanceIdentity::new("pve1", 100)
    }

    fn project_vm(raw: &ObservedConfig) -> (CanonicalConfig, BTreeSet<String>) {
        project(raw, &id(), &InstanceStatus::running()).unwrap()
    }

    #[test]
    fn test_omitted_fields_use_remote_defaults() {
        let (config, _) = project_vm(&ObservedConfig::new());
        assert!(config.cpu.is_remote_default());
        assert_eq!(config.cpu.value().cpu_type, Field::RemoteDefault("kvm64".to_string()));
        assert_eq!(config.scsi_hardware, Field::RemoteDefault("lsi".to_string()));
        assert_eq!(config.keyboard_layout, Field::RemoteDefault(String::new()));
        assert_eq!(config.lifecycle.on_boot, Field::RemoteDefault(false));
        assert!(config.networks.is_remote_default());
        assert_eq!(config.lifecycle.started, Field::Explicit(true));
    }

    #[test]
    fn test_reported_fields_are_explicit() {
        let raw = ObservedConfig::new()
            .with("cores", 2)
            .with("cpu", "host,flags=+aes")
            .with("memory", "2048")
            .with("onboot", 1)
            .with("tags", "prod;web")
            .with("description", "managed\n");
        let (config, _) = project_vm(&raw);
        let cpu = config.cpu.value();
        assert!(config.cpu.is_explicit());
        assert_eq!(cpu.cores, Field::Explicit(2));
        assert_eq!(cpu.sockets, Field::RemoteDefault(1));
        assert_eq!(cpu.flags, Field::Explicit(vec!["+aes".to_string()]));
        assert_eq!(config.memory.value().dedicated_mb, Field::Explicit(2048));
        assert_eq!(config.lifecycle.on_boot, Field::Explicit(true));
        assert_eq!(config.tags.value().len(), 2);
        assert_eq!(config.description.value(), "managed");
    }

    #[test]
    fn test_drives_and_cloud_init_discovery() {
        let raw = ObservedConfig::new()
            .with("scsi0", "local-lvm:vm-100-disk-0,size=32G")
            .with("ide0", "local:iso/debian.iso,media=cdrom")
            .with("ide2", "local-lvm:vm-100-cloudinit,media=cdrom")
            .with("sata1", "fast:vm-100-cloudinit,media=cdrom")
            .with("efidisk0", "local-lvm:vm-100-disk-1,efitype=4m,size=528K")
            .with("ciuser", "ops")
            .with("ipconfig1", "ip=dhcp");
        let (config, occupied) = project_vm(&raw);

        assert_eq!(config.disks.len(), 2);
        assert_eq!(config.disks["scsi0"].size_gib, 32);
        assert!(config.disks.contains_key("efidisk0"));

        let init = config.cloud_init.unwrap();
        assert_eq!(init.interface.as_deref(), Some("ide2"));
        assert_eq!(init.datastore_id, "local-lvm");
        assert_eq!(init.ip_configs.len(), 2);
        assert!(init.ip_configs[0].is_empty());
        assert_eq!(init.user_account.unwrap().username.as_deref(), Some("ops"));

        assert!(occupied.contains("ide0"));
        assert!(occupied.contains("sata1"));
        assert!(!occupied.contains("efidisk0"));
    }

    #[test]
    fn test_foreign_cloud_init_drive_is_ignored() {
        let raw = ObservedConfig::new().with("ide2", "local-lvm:vm-9000-cloudinit,media=cdrom");
        let (config, occupied) = project_vm(&raw);
        assert!(config.cloud_init.is_none());
        assert!(occupied.contains("ide2"));
    }

    #[test]
    fn test_network_gaps_are_disabled_slots() {
        let raw = ObservedConfig::new()
            .with("net0", "virtio=BC:24:11:00:00:01,bridge=vmbr0")
            .with("net2", "e1000=BC:24:11:00:00:02,bridge=vmbr1,tag=5");
        let (config, _) = project_vm(&raw);
        let nets = config.networks.value();
        assert_eq!(nets.len(), 3);
        assert!(nets[0].enabled);
        assert!(!nets[1].enabled);
        assert_eq!(nets[2].vlan_id, Some(5));
    }

    #[test]
    fn test_malformed_value_is_api_error() {
        let raw = ObservedConfig::new().with("scsi0", "local-lvm:vm-100-disk-0,size=12X");
        let err = project(&raw, &id(), &InstanceStatus::stopped()).unwrap_err();
        assert!(matches!(err, ReconcileError::Api(_)));
    }

    #[test]
    fn test_container_reads_hostname_and_swap() {
        let raw = ObservedConfig::new()
            .with("hostname", "ct1")
            .with("swap", 256);
        let ct = InstanceIdentity::new("pve1", 200).with_kind(InstanceKind::Container);
        let (config, _) = project(&raw, &ct, &InstanceStatus::stopped()).unwrap();
        assert_eq!(config.name.value(), "ct1");
        assert_eq!(config.memory.value().floating_mb, Field::Explicit(256));
        assert!(config.networks.is_remote_default());
        assert_eq!(config.lifecycle.started, Field::Explicit(false));
    }

    #[test]
    fn test_container_rootfs_and_network_slots() {
        let raw = ObservedConfig::new()
            .with("rootfs", "local-lvm:vm-200-disk-0,size=8G")
            .with("mp0", "local-lvm:vm-200-disk-1,mp=/data,size=4G")
            .with("net0", "name=eth0,bridge=vmbr0,hwaddr=BC:24:11:00:00:09,ip=dhcp,type=veth")
            .with("net2", "name=eth2,bridge=vmbr1,ip=10.0.0.9/24,gw=10.0.0.1")
            .with("nameserver", "1.1.1.1 9.9.9.9");
        let ct = InstanceIdentity::new("pve1", 200).with_kind(InstanceKind::Container);
        let (config, occupied) = project(&raw, &ct, &InstanceStatus::running()).unwrap();

        assert_eq!(config.disks.len(), 1);
        assert_eq!(config.disks["rootfs"].size_gib, 8);
        assert!(config.disks["rootfs"].is_owned_by(200));
        assert!(occupied.is_empty());

        let nets = config.networks.value();
        assert_eq!(nets.len(), 3);
        assert_eq!(nets[0].model, "veth");
        assert!(!nets[1].enabled);
        assert_eq!(nets[2].bridge.as_deref(), Some("vmbr1"));

        let init = config.cloud_init.unwrap();
        assert_eq!(init.ip_configs.len(), 3);
        assert_eq!(init.ip_configs[0].ipv4_address.as_deref(), Some("dhcp"));
        assert!(init.ip_configs[1].is_empty());
        assert_eq!(init.ip_configs[2].ipv4_gateway.as_deref(), Some("10.0.0.1"));
        assert_eq!(init.dns.unwrap().servers.len(), 2);
    }
}
