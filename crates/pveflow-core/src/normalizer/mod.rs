//! Desired-state normalizer
//!
//! Resolves every optional value of a [`RawInstance`] to either the user's
//! value ([`Field::Explicit`]) or the policy default
//! ([`Field::ProviderDefault`]). Blocks that are absent or empty become a
//! provider-default block so the planner never mistakes "untouched" for
//! "set to the default".

pub mod raw;

pub use raw::*;

use crate::error::{CoreError, Result};
use crate::field::Field;
use crate::model::{
    parse_interface, AgentConfig, BusFamily, CanonicalConfig, CloneSource, CloudInitConfig,
    CloudInitDns, CpuConfig, DesiredInstance, DiskClass, InstanceKind, IpConfig, LifecycleFlags,
    MemoryConfig, NetworkDevice, OperatingSystem, StartupPolicy, StorageDevice, UserAccount,
    CONTAINER_NETWORK_MODEL, EFI_DISK_INTERFACE, MAX_NETWORK_SLOTS, ROOT_FS_INTERFACE,
    TPM_STATE_INTERFACE,
};
use crate::policy::DefaultPolicy;
use std::collections::{BTreeMap, BTreeSet};

/// Boot device priority used when no explicit order is given.
const BOOT_DISK_PRIORITY: &[&str] = &["sata0", "scsi0", "virtio0"];

/// Lowest and highest instance ids the hypervisor accepts.
const VM_ID_RANGE: std::ops::RangeInclusive<u32> = 100..=999_999_999;

pub struct Normalizer {
    policy: DefaultPolicy,
}

impl Normalizer {
    pub fn new(policy: DefaultPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DefaultPolicy {
        &self.policy
    }

    pub fn normalize(&self, raw: &RawInstance) -> Result<DesiredInstance> {
        if raw.node_name.trim().is_empty() {
            return Err(CoreError::Configuration("node_name is required".to_string()));
        }
        if let Some(id) = raw.vm_id
            && !VM_ID_RANGE.contains(&id)
        {
            return Err(CoreError::Configuration(format!(
                "vm_id {} is outside the accepted range {}-{}",
                id,
                VM_ID_RANGE.start(),
                VM_ID_RANGE.end()
            )));
        }

        let clone = raw.clone.as_ref().map(|c| CloneSource {
            node: c.node_name.clone(),
            vm_id: c.vm_id,
            datastore_id: c.datastore_id.clone(),
            full: c.full.unwrap_or(self.policy.clone_full),
            retries: c.retries.unwrap_or(self.policy.clone_retries),
        });
        let operating_system = self.operating_system(raw, clone.is_some())?;

        let disks = match raw.kind {
            InstanceKind::Vm => self.disks(raw)?,
            InstanceKind::Container => self.container_disks(raw)?,
        };
        let networks = self.networks(raw.network_devices.as_deref(), raw.kind)?;
        let cloud_init = match raw.kind {
            InstanceKind::Vm => self.cloud_init(raw.initialization.as_ref(), &disks)?,
            InstanceKind::Container => self.container_init(raw.initialization.as_ref())?,
        };
        let boot_order = match &raw.boot_order {
            Some(order) => Field::Explicit(order.clone()),
            None => Field::ProviderDefault(derive_boot_order(&disks, networks.value())),
        };

        let os_type = match &operating_system {
            Some(os) => Field::Explicit(os.os_type.clone()),
            None => Field::ProviderDefault(self.policy.os_type.clone()),
        };

        let config = CanonicalConfig {
            name: Field::from_user(raw.name.clone(), String::new()),
            description: Field::from_user(
                raw.description
                    .as_deref()
                    .map(|d| d.trim_end_matches(['\n', '\r']).to_string()),
                String::new(),
            ),
            tags: Field::from_user(
                raw.tags.as_ref().map(|tags| normalize_tags(tags)),
                BTreeSet::new(),
            ),
            cpu: self.cpu(raw.cpu.as_ref()),
            memory: self.memory(raw.memory.as_ref()),
            disks,
            networks,
            cloud_init,
            startup: match &raw.startup {
                Some(s) if *s != RawStartup::default() => Field::Explicit(Some(StartupPolicy {
                    order: s.order,
                    up_delay: s.up_delay,
                    down_delay: s.down_delay,
                })),
                _ => Field::ProviderDefault(None),
            },
            lifecycle: LifecycleFlags {
                started: Field::from_user(raw.started, self.policy.started),
                template: Field::from_user(raw.template, self.policy.template),
                on_boot: Field::from_user(raw.on_boot, self.policy.on_boot),
            },
            boot_order,
            bios: Field::from_user(raw.bios.clone(), self.policy.bios.clone()),
            machine: Field::from_user(raw.machine.clone(), self.policy.machine.clone()),
            keyboard_layout: Field::from_user(
                raw.keyboard_layout.clone(),
                self.policy.keyboard_layout.clone(),
            ),
            os_type,
            acpi: Field::from_user(raw.acpi, self.policy.acpi),
            tablet_device: Field::from_user(raw.tablet_device, self.policy.tablet_device),
            protection: Field::from_user(raw.protection, self.policy.protection),
            scsi_hardware: Field::from_user(
                raw.scsi_hardware.clone(),
                self.policy.scsi_hardware.clone(),
            ),
            agent: self.agent(raw.agent.as_ref()),
        };

        tracing::debug!(
            "Normalized instance on {} (clone: {}, disks: {}, networks: {})",
            raw.node_name,
            clone.is_some(),
            config.disks.len(),
            config.networks.value().len()
        );

        Ok(DesiredInstance {
            node: raw.node_name.clone(),
            vm_id: raw.vm_id,
            kind: raw.kind,
            pool_id: raw.pool_id.clone(),
            clone,
            operating_system,
            config,
        })
    }

    fn operating_system(&self, raw: &RawInstance, is_clone: bool) -> Result<Option<OperatingSystem>> {
        let os = raw.operating_system.as_ref().map(|os| OperatingSystem {
            os_type: os.os_type.clone().unwrap_or_else(|| self.policy.os_type.clone()),
            template_file_id: os.template_file_id.clone(),
        });

        if is_clone {
            return Ok(os);
        }
        let Some(os) = os else {
            return Err(CoreError::Configuration(
                "operating_system block is required when creating an instance without clone"
                    .to_string(),
            ));
        };
        if raw.kind == InstanceKind::Container && os.template_file_id.is_none() {
            return Err(CoreError::Configuration(
                "operating_system.template_file_id is required when creating a container"
                    .to_string(),
            ));
        }
        Ok(Some(os))
    }

    fn cpu(&self, raw: Option<&RawCpu>) -> Field<CpuConfig> {
        let p = &self.policy;
        let empty = RawCpu::default();
        let block = raw.unwrap_or(&empty);
        let cpu = CpuConfig {
            architecture: Field::from_user(block.architecture.clone(), p.cpu_architecture.clone()),
            cores: Field::from_user(block.cores, p.cpu_cores),
            sockets: Field::from_user(block.sockets, p.cpu_sockets),
            units: Field::from_user(block.units, p.cpu_units),
            flags: Field::from_user(block.flags.clone(), Vec::new()),
            cpu_type: Field::from_user(block.cpu_type.clone(), p.cpu_type.clone()),
            hotplugged: Field::from_user(block.hotplugged.map(Some), None),
            limit: Field::from_user(block.limit, p.cpu_limit),
            numa: Field::from_user(block.numa, p.cpu_numa),
        };
        if block.is_empty() {
            Field::ProviderDefault(cpu)
        } else {
            Field::Explicit(cpu)
        }
    }

    fn memory(&self, raw: Option<&RawMemory>) -> Field<MemoryConfig> {
        let p = &self.policy;
        let empty = RawMemory::default();
        let block = raw.unwrap_or(&empty);
        let memory = MemoryConfig {
            dedicated_mb: Field::from_user(block.dedicated, p.memory_dedicated_mb),
            floating_mb: Field::from_user(block.floating, p.memory_floating_mb),
            shared_mb: Field::from_user(block.shared, p.memory_shared_mb),
        };
        if block.is_empty() {
            Field::ProviderDefault(memory)
        } else {
            Field::Explicit(memory)
        }
    }

    fn agent(&self, raw: Option<&RawAgent>) -> Field<AgentConfig> {
        let p = &self.policy;
        match raw {
            Some(block) if !block.is_empty() => Field::Explicit(AgentConfig {
                enabled: block.enabled.unwrap_or(p.agent_enabled),
                trim: block.trim.unwrap_or(p.agent_trim),
                agent_type: block.agent_type.clone().unwrap_or_else(|| p.agent_type.clone()),
            }),
            _ => Field::ProviderDefault(AgentConfig {
                enabled: p.agent_enabled,
                trim: p.agent_trim,
                agent_type: p.agent_type.clone(),
            }),
        }
    }

    fn disks(&self, raw: &RawInstance) -> Result<BTreeMap<String, StorageDevice>> {
        let p = &self.policy;
        let mut disks = BTreeMap::new();

        for disk in &raw.disks {
            parse_interface(&disk.interface)?;
            let device = StorageDevice {
                interface: disk.interface.clone(),
                class: DiskClass::Data,
                datastore_id: disk
                    .datastore_id
                    .clone()
                    .unwrap_or_else(|| p.disk_datastore_id.clone()),
                path_in_datastore: None,
                size_gib: disk.size.unwrap_or(p.disk_size_gib),
                format: disk.file_format.clone(),
                file_id: disk.file_id.clone(),
                cache: disk.cache.clone(),
                discard: disk.discard.clone(),
                ssd: disk.ssd.unwrap_or(false),
                iothread: disk.iothread.unwrap_or(false),
                backup: disk.backup.unwrap_or(p.disk_backup),
                speed: disk.speed.clone().unwrap_or_default(),
            };
            insert_unique(&mut disks, device)?;
        }

        if let Some(efi) = &raw.efi_disk {
            let mut device = StorageDevice::new(
                EFI_DISK_INTERFACE,
                efi.datastore_id
                    .clone()
                    .unwrap_or_else(|| p.efi_disk_datastore_id.clone()),
                1,
            );
            device.class = DiskClass::Efi;
            device.format = efi.file_format.clone();
            insert_unique(&mut disks, device)?;
        }

        if let Some(tpm) = &raw.tpm_state {
            let mut device = StorageDevice::new(
                TPM_STATE_INTERFACE,
                tpm.datastore_id
                    .clone()
                    .unwrap_or_else(|| p.efi_disk_datastore_id.clone()),
                1,
            );
            device.class = DiskClass::TpmState;
            insert_unique(&mut disks, device)?;
        }

        Ok(disks)
    }

    /// Containers take one `rootfs` volume; mount points are not managed.
    fn container_disks(&self, raw: &RawInstance) -> Result<BTreeMap<String, StorageDevice>> {
        if raw.efi_disk.is_some() || raw.tpm_state.is_some() {
            return Err(CoreError::Configuration(
                "efi_disk and tpm_state are not available for containers".to_string(),
            ));
        }
        if raw.disks.len() > 1 {
            return Err(CoreError::Configuration(format!(
                "a container takes a single {} disk, got {}",
                ROOT_FS_INTERFACE,
                raw.disks.len()
            )));
        }

        let p = &self.policy;
        let mut disks = BTreeMap::new();
        for disk in &raw.disks {
            if disk.interface != ROOT_FS_INTERFACE {
                return Err(CoreError::Configuration(format!(
                    "container disk interface must be {}, got {}",
                    ROOT_FS_INTERFACE, disk.interface
                )));
            }
            let vm_only = [
                ("file_id", disk.file_id.is_some()),
                ("file_format", disk.file_format.is_some()),
                ("cache", disk.cache.is_some()),
                ("discard", disk.discard.is_some()),
                ("ssd", disk.ssd.is_some()),
                ("iothread", disk.iothread.is_some()),
                ("speed", disk.speed.is_some()),
            ];
            if let Some((option, _)) = vm_only.iter().find(|(_, set)| *set) {
                return Err(CoreError::Configuration(format!(
                    "disk option {} is not available for containers",
                    option
                )));
            }

            let mut device = StorageDevice::new(
                ROOT_FS_INTERFACE,
                disk.datastore_id
                    .clone()
                    .unwrap_or_else(|| p.disk_datastore_id.clone()),
                disk.size.unwrap_or(p.disk_size_gib),
            );
            device.backup = disk.backup.unwrap_or(p.disk_backup);
            disks.insert(device.interface.clone(), device);
        }
        Ok(disks)
    }

    fn networks(
        &self,
        raw: Option<&[RawNetworkDevice]>,
        kind: InstanceKind,
    ) -> Result<Field<Vec<NetworkDevice>>> {
        let Some(devices) = raw else {
            return Ok(Field::ProviderDefault(Vec::new()));
        };
        if devices.len() > MAX_NETWORK_SLOTS {
            return Err(CoreError::Configuration(format!(
                "at most {} network devices are supported, got {}",
                MAX_NETWORK_SLOTS,
                devices.len()
            )));
        }

        let p = &self.policy;
        let model = |d: &RawNetworkDevice| match kind {
            InstanceKind::Vm => Ok(d.model.clone().unwrap_or_else(|| p.network_model.clone())),
            InstanceKind::Container => match d.model.as_deref() {
                None | Some(CONTAINER_NETWORK_MODEL) => Ok(CONTAINER_NETWORK_MODEL.to_string()),
                Some(other) => Err(CoreError::Configuration(format!(
                    "container network devices are {}, got model {}",
                    CONTAINER_NETWORK_MODEL, other
                ))),
            },
        };
        let devices = devices
            .iter()
            .map(|d| -> Result<NetworkDevice> {
                Ok(NetworkDevice {
                    enabled: d.enabled.unwrap_or(true),
                    bridge: Some(d.bridge.clone().unwrap_or_else(|| p.network_bridge.clone())),
                    model: model(d)?,
                    mac_address: d.mac_address.clone(),
                    vlan_id: d.vlan_id,
                    rate_limit: d.rate_limit,
                    mtu: d.mtu,
                    firewall: d.firewall.unwrap_or(false),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Field::Explicit(devices))
    }

    fn cloud_init(
        &self,
        raw: Option<&RawInitialization>,
        disks: &BTreeMap<String, StorageDevice>,
    ) -> Result<Option<CloudInitConfig>> {
        let Some(init) = raw else {
            return Ok(None);
        };

        if let Some(interface) = &init.interface {
            let (family, _) = parse_interface(interface)?;
            if family == BusFamily::Virtio {
                return Err(CoreError::Configuration(format!(
                    "cloud-init drive cannot use {}: virtio does not support cdrom media",
                    interface
                )));
            }
            if disks.contains_key(interface) {
                return Err(CoreError::DuplicateInterface(interface.clone()));
            }
        }

        Ok(Some(CloudInitConfig {
            datastore_id: init
                .datastore_id
                .clone()
                .unwrap_or_else(|| self.policy.cloud_init_datastore_id.clone()),
            interface: init.interface.clone(),
            ..initialization_data(init)
        }))
    }

    /// Containers have no cloud-init drive. DNS and per-slot IP settings
    /// are plain config keys; the account is applied at creation only.
    fn container_init(&self, raw: Option<&RawInitialization>) -> Result<Option<CloudInitConfig>> {
        let Some(init) = raw else {
            return Ok(None);
        };
        if init.interface.is_some() || init.datastore_id.is_some() {
            return Err(CoreError::Configuration(
                "initialization.interface and initialization.datastore_id are not available for containers"
                    .to_string(),
            ));
        }
        if init.user_account.as_ref().is_some_and(|u| u.username.is_some()) {
            return Err(CoreError::Configuration(
                "a container account is always root; drop user_account.username".to_string(),
            ));
        }
        Ok(Some(initialization_data(init)))
    }
}

fn initialization_data(init: &RawInitialization) -> CloudInitConfig {
    CloudInitConfig {
        datastore_id: String::new(),
        interface: None,
        dns: init.dns.as_ref().map(|dns| CloudInitDns {
            domain: dns.domain.clone(),
            servers: dns.servers.clone(),
        }),
        ip_configs: init
            .ip_config
            .iter()
            .map(|ip| IpConfig {
                ipv4_address: ip.ipv4.as_ref().and_then(|a| a.address.clone()),
                ipv4_gateway: ip.ipv4.as_ref().and_then(|a| a.gateway.clone()),
                ipv6_address: ip.ipv6.as_ref().and_then(|a| a.address.clone()),
                ipv6_gateway: ip.ipv6.as_ref().and_then(|a| a.gateway.clone()),
            })
            .collect(),
        user_account: init.user_account.as_ref().map(|u| UserAccount {
            username: u.username.clone(),
            password: u.password.clone(),
            keys: u.keys.iter().map(|k| k.trim().to_string()).collect(),
        }),
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DefaultPolicy::default())
    }
}

fn insert_unique(disks: &mut BTreeMap<String, StorageDevice>, device: StorageDevice) -> Result<()> {
    if disks.contains_key(&device.interface) {
        return Err(CoreError::DuplicateInterface(device.interface));
    }
    disks.insert(device.interface.clone(), device);
    Ok(())
}

fn normalize_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// First disk by boot priority, then `net0` when any network device is enabled.
pub fn derive_boot_order(
    disks: &BTreeMap<String, StorageDevice>,
    networks: &[NetworkDevice],
) -> Vec<String> {
    let mut order = Vec::new();
    if let Some(disk) = BOOT_DISK_PRIORITY.iter().find(|i| disks.contains_key(**i)) {
        order.push(disk.to_string());
    }
    if networks.iter().any(|n| n.enabled) {
        order.push("net0".to_string());
    }
    order
}
