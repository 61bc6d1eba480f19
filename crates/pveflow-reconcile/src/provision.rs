//! Create and clone request building

use crate::api::{CloneRequest, CreateRequest};
use crate::cloud_init::plan_cloud_init;
use crate::error::{ReconcileError, Result};
use crate::intent::Operation;
use pveflow_core::model::{DesiredInstance, InstanceIdentity, InstanceKind, ROOT_FS_INTERFACE};
use pveflow_core::wire;
use std::collections::{BTreeMap, BTreeSet};

struct Params(BTreeMap<String, String>);

impl Params {
    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    fn set_non_empty(&mut self, key: &str, value: &str) {
        if !value.is_empty() {
            self.set(key, value);
        }
    }

    fn set_flag(&mut self, key: &str, value: bool) {
        self.set(key, wire::encode_bool(value));
    }
}

/// Full create body for a custom (non-clone) instance.
pub fn build_create_request(desired: &DesiredInstance) -> Result<CreateRequest> {
    let config = &desired.config;
    let mut params = Params(BTreeMap::new());

    let name_key = match desired.kind {
        InstanceKind::Vm => "name",
        InstanceKind::Container => "hostname",
    };
    params.set_non_empty(name_key, config.name.value());
    params.set_non_empty("description", config.description.value());
    if !config.tags.value().is_empty() {
        params.set("tags", wire::encode_tags(config.tags.value()));
    }
    if let Some(pool) = &desired.pool_id {
        params.set("pool", pool.clone());
    }
    params.set_flag("onboot", *config.lifecycle.on_boot.value());
    params.set_flag("protection", *config.protection.value());
    if let Some(startup) = config.startup.value().as_ref().filter(|s| !s.is_empty()) {
        params.set("startup", wire::encode_startup(startup));
    }

    let cpu = config.cpu.value();
    params.set("cores", cpu.cores.value().to_string());
    params.set("cpuunits", cpu.units.value().to_string());
    if *cpu.limit.value() > 0 {
        params.set("cpulimit", cpu.limit.value().to_string());
    }
    let memory = config.memory.value();
    params.set("memory", memory.dedicated_mb.value().to_string());

    match desired.kind {
        InstanceKind::Vm => {
            vm_params(&mut params, desired)?;
        }
        InstanceKind::Container => {
            container_params(&mut params, desired)?;
        }
    }

    Ok(CreateRequest {
        kind: desired.kind,
        vm_id: desired.vm_id,
        params: params.0,
    })
}

fn vm_params(params: &mut Params, desired: &DesiredInstance) -> Result<()> {
    let config = &desired.config;
    let cpu = config.cpu.value();
    let memory = config.memory.value();

    params.set("sockets", cpu.sockets.value().to_string());
    params.set(
        "cpu",
        wire::encode_cpu_emulation(cpu.cpu_type.value(), cpu.flags.value()),
    );
    params.set_flag("numa", *cpu.numa.value());
    // Only root may set the architecture, so it is sent when asked for.
    if cpu.architecture.is_explicit() {
        params.set_non_empty("arch", cpu.architecture.value());
    }
    if let Some(vcpus) = cpu.hotplug_count() {
        params.set("vcpus", vcpus.to_string());
    }

    params.set("balloon", memory.floating_mb.value().to_string());
    // The shared memory name embeds the id; with a remotely allocated id it
    // is added by the first update pass.
    if let Some(vm_id) = desired.vm_id
        && *memory.shared_mb.value() > 0
    {
        params.set(
            "ivshmem",
            wire::encode_shared_memory(*memory.shared_mb.value(), vm_id),
        );
    }

    params.set("bios", config.bios.value().clone());
    params.set_non_empty("machine", config.machine.value());
    params.set_non_empty("keyboard", config.keyboard_layout.value());
    params.set("ostype", config.os_type.value().clone());
    params.set_flag("acpi", *config.acpi.value());
    params.set_flag("tablet", *config.tablet_device.value());
    params.set("scsihw", config.scsi_hardware.value().clone());
    params.set("agent", wire::encode_agent(config.agent.value()));
    if !config.boot_order.value().is_empty() {
        params.set("boot", wire::encode_boot_order(config.boot_order.value()));
    }
    if *config.lifecycle.template.value() {
        params.set_flag("template", true);
    }

    for (interface, device) in &config.disks {
        params.set(interface, wire::encode_drive(device));
    }
    for (slot, device) in config.networks.value().iter().enumerate() {
        if device.enabled {
            params.set(&format!("net{}", slot), wire::encode_network_device(device));
        }
    }

    let cloud_init = plan_cloud_init(config.cloud_init.as_ref(), None, &BTreeSet::new());
    let cloud_init_ops = cloud_init.attach.into_iter().chain(cloud_init.updates);
    for intent in cloud_init_ops {
        if let Operation::FieldUpdate { param, value, .. } = intent.op {
            if params.0.contains_key(&param) {
                return Err(ReconcileError::Configuration(format!(
                    "cloud-init drive collides with {}",
                    param
                )));
            }
            params.set(&param, value);
        }
    }
    Ok(())
}

fn container_params(params: &mut Params, desired: &DesiredInstance) -> Result<()> {
    let config = &desired.config;
    let template = desired
        .operating_system
        .as_ref()
        .and_then(|os| os.template_file_id.clone())
        .ok_or_else(|| {
            ReconcileError::Configuration(
                "a container needs operating_system.template_file_id".to_string(),
            )
        })?;
    params.set("ostemplate", template);
    params.set("swap", config.memory.value().floating_mb.value().to_string());
    if let Some(root) = config.disks.get(ROOT_FS_INTERFACE) {
        params.set(ROOT_FS_INTERFACE, wire::encode_drive(root));
    }

    let init = config.cloud_init.as_ref();
    let ip_configs = init.map(|c| c.ip_configs.as_slice()).unwrap_or_default();
    for (slot, device) in config.networks.value().iter().enumerate() {
        if device.enabled {
            params.set(
                &format!("net{}", slot),
                wire::encode_container_network(slot, device, ip_configs.get(slot)),
            );
        }
    }

    if let Some(dns) = init.and_then(|c| c.dns.as_ref()) {
        if let Some(domain) = &dns.domain {
            params.set("searchdomain", domain.clone());
        }
        if !dns.servers.is_empty() {
            params.set("nameserver", dns.servers.join(" "));
        }
    }
    // Only creation accepts these; the remote never reports them back.
    if let Some(user) = init.and_then(|c| c.user_account.as_ref()) {
        if let Some(password) = &user.password {
            params.set("password", password.clone());
        }
        if !user.keys.is_empty() {
            params.set("ssh-public-keys", user.keys.join("\n"));
        }
    }
    Ok(())
}

/// Source identity and body of a clone.
///
/// The clone is created on the source node; a different desired node is
/// reached by the migration of the first update pass.
pub fn build_clone_request(desired: &DesiredInstance) -> Option<(InstanceIdentity, CloneRequest)> {
    let source = desired.clone.as_ref()?;
    let node = source.node.clone().unwrap_or_else(|| desired.node.clone());
    let identity = InstanceIdentity::new(node, source.vm_id).with_kind(desired.kind);
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    let request = CloneRequest {
        new_id: desired.vm_id,
        name: non_empty(desired.config.name.value()),
        description: non_empty(desired.config.description.value()),
        pool_id: desired.pool_id.clone(),
        target_datastore: source.datastore_id.clone(),
        full: source.full,
    };
    Some((identity, request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pveflow_core::{Normalizer, RawInstance};

    fn desired(yaml: &str) -> DesiredInstance {
        let raw: RawInstance = serde_yaml::from_str(yaml).unwrap();
        Normalizer::default().normalize(&raw).unwrap()
    }

    #[test]
    fn test_vm_create_body() {
        let desired = desired(
            r#"
node_name: pve1
vm_id: 120
name: db
tags: [db]
operating_system:
  type: l26
cpu:
  cores: 4
memory:
  dedicated: 4096
disks:
  - interface: scsi0
    size: 40
    iothread: true
network_devices:
  - bridge: vmbr0
initialization:
  user_account:
    username: ops
  dns:
    servers: [1.1.1.1, 8.8.8.8]
"#,
        );
        let request = build_create_request(&desired).unwrap();
        let p = &request.params;

        assert_eq!(request.vm_id, Some(120));
        assert_eq!(p["name"], "db");
        assert_eq!(p["cores"], "4");
        assert_eq!(p["memory"], "4096");
        assert_eq!(p["cpu"], "qemu64");
        assert_eq!(p["scsi0"], "local-lvm:40,iothread=1");
        assert_eq!(p["net0"], "model=virtio,bridge=vmbr0");
        assert_eq!(p["boot"], "order=scsi0;net0");
        assert_eq!(p["ide2"], "local-lvm:cloudinit,media=cdrom");
        assert_eq!(p["ciuser"], "ops");
        assert_eq!(p["nameserver"], "1.1.1.1 8.8.8.8");
        assert_eq!(p["ostype"], "l26");
        assert!(!p.contains_key("arch"));
        assert!(!p.contains_key("vcpus"));
        assert!(!p.contains_key("template"));
    }

    #[test]
    fn test_container_create_body() {
        let desired = desired(
            r#"
node_name: pve1
kind: container
name: ct1
operating_system:
  template_file_id: local:vztmpl/debian-12.tar.zst
disks:
  - interface: rootfs
    datastore_id: fast
    size: 16
memory:
  dedicated: 1024
  floating: 512
network_devices:
  - bridge: vmbr0
  - enabled: false
  - bridge: vmbr1
    vlan_id: 40
initialization:
  dns:
    domain: lan
  ip_config:
    - ipv4:
        address: dhcp
  user_account:
    password: secret
    keys: ["ssh-ed25519 AAAA ops@host"]
"#,
        );
        let request = build_create_request(&desired).unwrap();
        let p = &request.params;
        assert_eq!(request.vm_id, None);
        assert_eq!(p["hostname"], "ct1");
        assert_eq!(p["ostemplate"], "local:vztmpl/debian-12.tar.zst");
        assert_eq!(p["rootfs"], "fast:16");
        assert_eq!(p["swap"], "512");
        assert_eq!(p["net0"], "name=eth0,bridge=vmbr0,ip=dhcp");
        assert_eq!(p["net2"], "name=eth2,bridge=vmbr1,tag=40");
        assert!(!p.contains_key("net1"));
        assert_eq!(p["searchdomain"], "lan");
        assert_eq!(p["password"], "secret");
        assert_eq!(p["ssh-public-keys"], "ssh-ed25519 AAAA ops@host");
        assert!(!p.contains_key("bios"));
        assert!(!p.contains_key("ide2"));
    }

    #[test]
    fn test_clone_request() {
        let desired = desired(
            "node_name: pve2\nvm_id: 130\nname: web\nclone:\n  vm_id: 9000\n  node_name: pve1\n  datastore_id: fast\n",
        );
        let (source, request) = build_clone_request(&desired).unwrap();
        assert_eq!(source, InstanceIdentity::new("pve1", 9000));
        assert_eq!(request.new_id, Some(130));
        assert_eq!(request.name.as_deref(), Some("web"));
        assert_eq!(request.target_datastore.as_deref(), Some("fast"));
        assert!(request.full);
        assert_eq!(request.description, None);
    }

    #[test]
    fn test_custom_instance_has_no_clone_request() {
        let desired = desired("node_name: pve1\noperating_system: {}\n");
        assert!(build_clone_request(&desired).is_none());
    }
}
