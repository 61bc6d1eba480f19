//! Proxmox property-string codec
//!
//! The remote API describes most devices as comma-separated `key=value`
//! lists with an optional leading positional value, e.g.
//! `local-lvm:vm-100-disk-0,size=32G,iothread=1` or
//! `virtio=BC:24:11:2E:3F:01,bridge=vmbr0,firewall=1`.

use crate::error::{CoreError, Result};
use crate::model::{
    AgentConfig, DiskClass, IpConfig, NetworkDevice, SpeedLimits, StartupPolicy, StorageDevice,
    CONTAINER_NETWORK_MODEL,
};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const KIB: f64 = 1024.0;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Network models whose name doubles as the MAC address key.
const NETWORK_MODELS: &[&str] = &["virtio", "e1000", "e1000e", "rtl8139", "vmxnet3"];

/// Parsed `head,key=value,...` string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyString {
    pub head: Option<String>,
    pairs: Vec<(String, String)>,
}

impl PropertyString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_head(head: impl Into<String>) -> Self {
        Self {
            head: Some(head.into()),
            pairs: Vec::new(),
        }
    }

    pub fn parse(input: &str) -> Self {
        let mut parsed = Self::new();
        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some((key, value)) => parsed.pairs.push((key.to_string(), value.to_string())),
                None if parsed.head.is_none() && parsed.pairs.is_empty() => {
                    parsed.head = Some(part.to_string())
                }
                None => {}
            }
        }
        parsed
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn push(&mut self, key: &str, value: impl fmt::Display) -> &mut Self {
        self.pairs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn push_opt<T: fmt::Display>(&mut self, key: &str, value: Option<T>) -> &mut Self {
        if let Some(v) = value {
            self.push(key, v);
        }
        self
    }

    /// Pushes `key=1` only when `flag` is set.
    pub fn push_flag(&mut self, key: &str, flag: bool) -> &mut Self {
        if flag {
            self.push(key, "1");
        }
        self
    }
}

impl fmt::Display for PropertyString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        if let Some(head) = &self.head {
            write!(f, "{}", head)?;
            first = false;
        }
        for (key, value) in &self.pairs {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

pub fn decode_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

pub fn encode_bool(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

/// Parses a size such as `32G`, `512M` or `528K` into bytes, rounding up.
///
/// A bare number is bytes.
pub fn parse_disk_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || CoreError::invalid_value("size", input, "expected a number with an optional K/M/G/T suffix");

    let (number, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let exponent = match c.to_ascii_uppercase() {
                'K' => 1,
                'M' => 2,
                'G' => 3,
                'T' => 4,
                _ => return Err(invalid()),
            };
            (&trimmed[..trimmed.len() - 1], KIB.powi(exponent))
        }
        _ => (trimmed, 1.0),
    };

    let value: f64 = number.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok((value * multiplier).ceil() as u64)
}

/// Bytes to whole GiB, rounding up.
pub fn bytes_to_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

/// A drive entry as read from the remote configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedDrive {
    /// Raw volume id, e.g. `local-lvm:vm-100-disk-0` or `none`
    pub volume: String,
    pub media: Option<String>,
    pub device: StorageDevice,
}

impl DecodedDrive {
    pub fn is_cdrom(&self) -> bool {
        self.media.as_deref() == Some("cdrom")
    }
}

pub fn decode_drive(interface: &str, value: &str) -> Result<DecodedDrive> {
    let props = PropertyString::parse(value);
    let volume = props
        .get("file")
        .map(str::to_string)
        .or_else(|| props.head.clone())
        .ok_or_else(|| CoreError::invalid_value(interface, value, "missing volume"))?;

    let (datastore_id, path) = match volume.split_once(':') {
        Some((store, path)) => (store.to_string(), Some(path.to_string())),
        None => (volume.clone(), None),
    };

    let size_gib = match props.get("size") {
        Some(size) => bytes_to_gib(parse_disk_size(size)?),
        None => 0,
    };

    let class = match interface {
        crate::model::EFI_DISK_INTERFACE => DiskClass::Efi,
        crate::model::TPM_STATE_INTERFACE => DiskClass::TpmState,
        _ => DiskClass::Data,
    };

    let parse_u32 = |key: &str| props.get(key).and_then(|v| v.parse::<f64>().ok()).map(|v| v as u32);

    let device = StorageDevice {
        interface: interface.to_string(),
        class,
        datastore_id,
        path_in_datastore: path,
        size_gib,
        format: props.get("format").map(str::to_string),
        file_id: None,
        cache: props.get("cache").map(str::to_string),
        discard: props.get("discard").map(str::to_string),
        ssd: props.get("ssd").is_some_and(decode_bool),
        iothread: props.get("iothread").is_some_and(decode_bool),
        backup: props.get("backup").is_none_or(decode_bool),
        speed: SpeedLimits {
            read_mbps: parse_u32("mbps_rd"),
            write_mbps: parse_u32("mbps_wr"),
            read_burstable_mbps: parse_u32("mbps_rd_max"),
            write_burstable_mbps: parse_u32("mbps_wr_max"),
            iops_read: parse_u32("iops_rd"),
            iops_write: parse_u32("iops_wr"),
        },
    };

    Ok(DecodedDrive {
        volume,
        media: props.get("media").map(str::to_string),
        device,
    })
}

/// Encodes a drive for an update or create call.
///
/// Unallocated devices use the `STORE:SIZE` allocation form, or
/// `STORE:0,import-from=FILE` when an import source is set.
pub fn encode_drive(device: &StorageDevice) -> String {
    let mut props = match (&device.path_in_datastore, &device.file_id) {
        (Some(_), _) => PropertyString::with_head(device.file_volume()),
        (None, Some(file_id)) => {
            let mut p = PropertyString::with_head(format!("{}:0", device.datastore_id));
            p.push("import-from", file_id);
            p
        }
        (None, None) => PropertyString::with_head(format!("{}:{}", device.datastore_id, device.size_gib)),
    };

    if device.class != DiskClass::Data {
        props.push_opt("format", device.format.as_deref());
        return props.to_string();
    }

    props
        .push_opt("format", device.format.as_deref())
        .push_opt("cache", device.cache.as_deref())
        .push_opt("discard", device.discard.as_deref())
        .push_flag("ssd", device.ssd)
        .push_flag("iothread", device.iothread);
    if !device.backup {
        props.push("backup", "0");
    }
    props
        .push_opt("mbps_rd", device.speed.read_mbps)
        .push_opt("mbps_wr", device.speed.write_mbps)
        .push_opt("mbps_rd_max", device.speed.read_burstable_mbps)
        .push_opt("mbps_wr_max", device.speed.write_burstable_mbps)
        .push_opt("iops_rd", device.speed.iops_read)
        .push_opt("iops_wr", device.speed.iops_write);
    props.to_string()
}

pub fn decode_network_device(value: &str) -> Result<NetworkDevice> {
    let props = PropertyString::parse(value);
    let mut device = NetworkDevice::disabled();
    device.enabled = true;

    for (key, val) in props.pairs() {
        match key.as_str() {
            "model" => device.model = val.clone(),
            "macaddr" => device.mac_address = Some(val.clone()),
            "bridge" => device.bridge = Some(val.clone()),
            "tag" => {
                device.vlan_id = Some(
                    val.parse()
                        .map_err(|_| CoreError::invalid_value("tag", val, "expected a VLAN id"))?,
                )
            }
            "rate" => {
                device.rate_limit = Some(
                    val.parse()
                        .map_err(|_| CoreError::invalid_value("rate", val, "expected MB/s"))?,
                )
            }
            "mtu" => {
                device.mtu = Some(
                    val.parse()
                        .map_err(|_| CoreError::invalid_value("mtu", val, "expected a number"))?,
                )
            }
            "firewall" => device.firewall = decode_bool(val),
            model if NETWORK_MODELS.contains(&model) => {
                device.model = model.to_string();
                device.mac_address = Some(val.clone());
            }
            _ => {}
        }
    }

    if device.model.is_empty() {
        return Err(CoreError::invalid_value("net", value, "missing network model"));
    }
    Ok(device)
}

pub fn encode_network_device(device: &NetworkDevice) -> String {
    let mut props = PropertyString::new();
    props
        .push("model", &device.model)
        .push_opt("bridge", device.bridge.as_deref())
        .push_opt("macaddr", device.mac_address.as_deref())
        .push_opt("tag", device.vlan_id)
        .push_opt("rate", device.rate_limit)
        .push_opt("mtu", device.mtu)
        .push_flag("firewall", device.firewall);
    props.to_string()
}

fn parse_prop<T: FromStr>(props: &PropertyString, key: &str, expected: &str) -> Result<Option<T>> {
    props
        .get(key)
        .map(|v| v.parse().map_err(|_| CoreError::invalid_value(key, v, expected)))
        .transpose()
}

/// Container `netN` value: the device and the IP settings of its guest
/// interface, which containers keep on the slot itself.
pub fn decode_container_network(value: &str) -> Result<(NetworkDevice, IpConfig)> {
    let props = PropertyString::parse(value);
    if props.get("name").is_none() {
        return Err(CoreError::invalid_value("net", value, "missing interface name"));
    }

    let device = NetworkDevice {
        enabled: true,
        bridge: props.get("bridge").map(str::to_string),
        model: props.get("type").unwrap_or(CONTAINER_NETWORK_MODEL).to_string(),
        mac_address: props.get("hwaddr").map(str::to_string),
        vlan_id: parse_prop(&props, "tag", "expected a VLAN id")?,
        rate_limit: parse_prop(&props, "rate", "expected MB/s")?,
        mtu: parse_prop(&props, "mtu", "expected a number")?,
        firewall: props.get("firewall").is_some_and(decode_bool),
    };
    Ok((device, decode_ip_config(value)))
}

/// The guest interface of slot N is always named `ethN`.
pub fn encode_container_network(slot: usize, device: &NetworkDevice, ip: Option<&IpConfig>) -> String {
    let mut props = PropertyString::new();
    props
        .push("name", format!("eth{}", slot))
        .push_opt("bridge", device.bridge.as_deref())
        .push_opt("hwaddr", device.mac_address.as_deref());
    if let Some(ip) = ip {
        props
            .push_opt("ip", ip.ipv4_address.as_deref())
            .push_opt("gw", ip.ipv4_gateway.as_deref())
            .push_opt("ip6", ip.ipv6_address.as_deref())
            .push_opt("gw6", ip.ipv6_gateway.as_deref());
    }
    props
        .push_opt("tag", device.vlan_id)
        .push_opt("rate", device.rate_limit)
        .push_opt("mtu", device.mtu)
        .push_flag("firewall", device.firewall);
    props.to_string()
}

pub fn decode_ip_config(value: &str) -> IpConfig {
    let props = PropertyString::parse(value);
    IpConfig {
        ipv4_address: props.get("ip").map(str::to_string),
        ipv4_gateway: props.get("gw").map(str::to_string),
        ipv6_address: props.get("ip6").map(str::to_string),
        ipv6_gateway: props.get("gw6").map(str::to_string),
    }
}

pub fn encode_ip_config(config: &IpConfig) -> String {
    let mut props = PropertyString::new();
    props
        .push_opt("ip", config.ipv4_address.as_deref())
        .push_opt("gw", config.ipv4_gateway.as_deref())
        .push_opt("ip6", config.ipv6_address.as_deref())
        .push_opt("gw6", config.ipv6_gateway.as_deref());
    props.to_string()
}

/// `cpu` parameter: emulated type plus optional `flags=+a;-b`.
pub fn decode_cpu_emulation(value: &str) -> (String, Vec<String>) {
    let props = PropertyString::parse(value);
    let cpu_type = props
        .get("cputype")
        .map(str::to_string)
        .or_else(|| props.head.clone())
        .unwrap_or_default();
    let flags = props
        .get("flags")
        .map(|f| {
            f.split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    (cpu_type, flags)
}

pub fn encode_cpu_emulation(cpu_type: &str, flags: &[String]) -> String {
    let mut props = PropertyString::with_head(cpu_type);
    if !flags.is_empty() {
        props.push("flags", flags.join(";"));
    }
    props.to_string()
}

pub fn decode_startup(value: &str) -> StartupPolicy {
    let props = PropertyString::parse(value);
    let num = |key: &str| props.get(key).and_then(|v| v.parse().ok());
    StartupPolicy {
        order: num("order"),
        up_delay: num("up"),
        down_delay: num("down"),
    }
}

pub fn encode_startup(policy: &StartupPolicy) -> String {
    let mut props = PropertyString::new();
    props
        .push_opt("order", policy.order)
        .push_opt("up", policy.up_delay)
        .push_opt("down", policy.down_delay);
    props.to_string()
}

pub fn decode_agent(value: &str) -> AgentConfig {
    let props = PropertyString::parse(value);
    let enabled = props
        .get("enabled")
        .or(props.head.as_deref())
        .is_some_and(decode_bool);
    AgentConfig {
        enabled,
        trim: props.get("fstrim_cloned_disks").is_some_and(decode_bool),
        agent_type: props.get("type").unwrap_or("virtio").to_string(),
    }
}

pub fn encode_agent(agent: &AgentConfig) -> String {
    let mut props = PropertyString::new();
    props
        .push("enabled", encode_bool(agent.enabled))
        .push("fstrim_cloned_disks", encode_bool(agent.trim))
        .push("type", &agent.agent_type);
    props.to_string()
}

/// `boot` parameter. Legacy letter orders (`cdn`) decode as empty.
pub fn decode_boot_order(value: &str) -> Vec<String> {
    PropertyString::parse(value)
        .get("order")
        .map(|order| {
            order
                .split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn encode_boot_order(order: &[String]) -> String {
    format!("order={}", order.join(";"))
}

pub fn decode_tags(value: &str) -> BTreeSet<String> {
    value
        .split([';', ',', ' '])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn encode_tags(tags: &BTreeSet<String>) -> String {
    tags.iter().cloned().collect::<Vec<_>>().join(";")
}

/// `ivshmem` parameter; returns the shared memory size in MiB.
pub fn decode_shared_memory(value: &str) -> Option<u32> {
    PropertyString::parse(value)
        .get("size")
        .and_then(|v| v.parse().ok())
}

pub fn encode_shared_memory(size_mb: u32, vm_id: u32) -> String {
    format!("size={},name=pveflow-{}", size_mb, vm_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_string_parse() {
        let props = PropertyString::parse("local-lvm:vm-100-disk-0,size=32G,iothread=1");
        assert_eq!(props.head.as_deref(), Some("local-lvm:vm-100-disk-0"));
        assert_eq!(props.get("size"), Some("32G"));
        assert_eq!(props.get("iothread"), Some("1"));
        assert_eq!(props.get("ssd"), None);
    }

    #[test]
    fn test_property_string_display() {
        let mut props = PropertyString::with_head("qemu64");
        props.push("flags", "+aes");
        assert_eq!(props.to_string(), "qemu64,flags=+aes");

        let mut no_head = PropertyString::new();
        no_head.push("order", 1).push("up", 30);
        assert_eq!(no_head.to_string(), "order=1,up=30");
    }

    #[test]
    fn test_parse_disk_size() {
        assert_eq!(parse_disk_size("32G").unwrap(), 32 * GIB);
        assert_eq!(parse_disk_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_disk_size("1T").unwrap(), 1024 * GIB);
        assert_eq!(parse_disk_size("528K").unwrap(), 528 * 1024);
        assert_eq!(parse_disk_size("4096").unwrap(), 4096);
        assert!(parse_disk_size("12X").is_err());
        assert!(parse_disk_size("G").is_err());
    }

    #[test]
    fn test_bytes_to_gib_rounds_up() {
        assert_eq!(bytes_to_gib(32 * GIB), 32);
        assert_eq!(bytes_to_gib(parse_disk_size("1.5G").unwrap()), 2);
        assert_eq!(bytes_to_gib(parse_disk_size("528K").unwrap()), 1);
    }

    #[test]
    fn test_decode_drive() {
        let drive = decode_drive(
            "scsi0",
            "local-lvm:vm-100-disk-0,cache=writeback,discard=on,iothread=1,size=32G",
        )
        .unwrap();
        assert_eq!(drive.volume, "local-lvm:vm-100-disk-0");
        assert!(!drive.is_cdrom());
        assert_eq!(drive.device.datastore_id, "local-lvm");
        assert_eq!(drive.device.path_in_datastore.as_deref(), Some("vm-100-disk-0"));
        assert_eq!(drive.device.size_gib, 32);
        assert_eq!(drive.device.cache.as_deref(), Some("writeback"));
        assert!(drive.device.iothread);
        assert!(drive.device.backup);
        assert!(drive.device.is_owned_by(100));
    }

    #[test]
    fn test_decode_cdrom() {
        let drive = decode_drive("ide2", "local-lvm:vm-100-cloudinit,media=cdrom").unwrap();
        assert!(drive.is_cdrom());
        let empty = decode_drive("ide3", "none,media=cdrom").unwrap();
        assert_eq!(empty.volume, "none");
    }

    #[test]
    fn test_decode_efidisk() {
        let drive = decode_drive("efidisk0", "local-lvm:vm-100-disk-1,efitype=4m,size=528K").unwrap();
        assert_eq!(drive.device.class, DiskClass::Efi);
        assert_eq!(drive.device.size_gib, 1);
    }

    #[test]
    fn test_encode_drive_forms() {
        let mut disk = StorageDevice::new("scsi0", "local-lvm", 32);
        disk.iothread = true;
        assert_eq!(encode_drive(&disk), "local-lvm:32,iothread=1");

        disk.file_id = Some("local:iso/jammy.img".to_string());
        assert_eq!(encode_drive(&disk), "local-lvm:0,import-from=local:iso/jammy.img,iothread=1");

        let existing = StorageDevice {
            backup: false,
            ..StorageDevice::new("virtio0", "fast", 10).with_path("vm-100-disk-0")
        };
        assert_eq!(encode_drive(&existing), "fast:vm-100-disk-0,backup=0");
    }

    #[test]
    fn test_decode_network_device() {
        let dev = decode_network_device("virtio=BC:24:11:2E:3F:01,bridge=vmbr0,firewall=1,tag=20").unwrap();
        assert_eq!(dev.model, "virtio");
        assert_eq!(dev.mac_address.as_deref(), Some("BC:24:11:2E:3F:01"));
        assert_eq!(dev.bridge.as_deref(), Some("vmbr0"));
        assert_eq!(dev.vlan_id, Some(20));
        assert!(dev.firewall);
        assert!(dev.enabled);

        assert!(decode_network_device("bridge=vmbr0").is_err());
    }

    #[test]
    fn test_encode_network_device() {
        let mut dev = NetworkDevice::new("virtio", "vmbr0");
        dev.mtu = Some(1400);
        dev.rate_limit = Some(12.5);
        assert_eq!(encode_network_device(&dev), "model=virtio,bridge=vmbr0,rate=12.5,mtu=1400");
    }

    #[test]
    fn test_container_network() {
        let (device, ip) = decode_container_network(
            "name=eth0,bridge=vmbr0,hwaddr=BC:24:11:00:00:07,ip=10.0.0.7/24,gw=10.0.0.1,tag=30,type=veth",
        )
        .unwrap();
        assert_eq!(device.model, "veth");
        assert_eq!(device.bridge.as_deref(), Some("vmbr0"));
        assert_eq!(device.mac_address.as_deref(), Some("BC:24:11:00:00:07"));
        assert_eq!(device.vlan_id, Some(30));
        assert_eq!(ip.ipv4_address.as_deref(), Some("10.0.0.7/24"));
        assert_eq!(ip.ipv4_gateway.as_deref(), Some("10.0.0.1"));

        assert_eq!(
            encode_container_network(1, &device, Some(&ip)),
            "name=eth1,bridge=vmbr0,hwaddr=BC:24:11:00:00:07,ip=10.0.0.7/24,gw=10.0.0.1,tag=30"
        );
        assert!(decode_container_network("bridge=vmbr0").is_err());
    }

    #[test]
    fn test_ip_config() {
        let config = decode_ip_config("ip=10.0.0.5/24,gw=10.0.0.1,ip6=auto");
        assert_eq!(config.ipv4_address.as_deref(), Some("10.0.0.5/24"));
        assert_eq!(config.ipv6_address.as_deref(), Some("auto"));
        assert_eq!(encode_ip_config(&config), "ip=10.0.0.5/24,gw=10.0.0.1,ip6=auto");
    }

    #[test]
    fn test_cpu_emulation() {
        let (cpu_type, flags) = decode_cpu_emulation("host,flags=+aes;-pcid");
        assert_eq!(cpu_type, "host");
        assert_eq!(flags, vec!["+aes", "-pcid"]);
        assert_eq!(encode_cpu_emulation("qemu64", &[]), "qemu64");
    }

    #[test]
    fn test_agent() {
        assert!(decode_agent("1").enabled);
        let agent = decode_agent("enabled=1,fstrim_cloned_disks=1,type=isa");
        assert!(agent.trim);
        assert_eq!(agent.agent_type, "isa");
        assert!(!decode_agent("0").enabled);
    }

    #[test]
    fn test_boot_order() {
        assert_eq!(decode_boot_order("order=scsi0;net0"), vec!["scsi0", "net0"]);
        assert!(decode_boot_order("cdn").is_empty());
        assert_eq!(encode_boot_order(&["sata0".to_string()]), "order=sata0");
    }

    #[test]
    fn test_tags_are_order_insensitive() {
        assert_eq!(decode_tags("web;prod"), decode_tags("prod,web"));
        assert_eq!(encode_tags(&decode_tags("b;a")), "a;b");
    }
}
