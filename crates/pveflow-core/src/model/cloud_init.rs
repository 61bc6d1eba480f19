use serde::{Deserialize, Serialize};

/// Slot used when neither the user nor the instance names one.
pub const DEFAULT_CLOUD_INIT_INTERFACE: &str = "ide2";

/// Masked value the hypervisor returns in place of a stored password.
pub const MASKED_PASSWORD: &str = "**********";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitConfig {
    pub datastore_id: String,
    /// Bus slot of the drive. `None` on the desired side keeps the existing slot.
    pub interface: Option<String>,
    pub dns: Option<CloudInitDns>,
    pub ip_configs: Vec<IpConfig>,
    pub user_account: Option<UserAccount>,
}

impl CloudInitConfig {
    pub fn new(datastore_id: impl Into<String>) -> Self {
        Self {
            datastore_id: datastore_id.into(),
            interface: None,
            dns: None,
            ip_configs: Vec::new(),
            user_account: None,
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitDns {
    pub domain: Option<String>,
    pub servers: Vec<String>,
}

/// One `ipconfigN` entry. Addresses are CIDR strings or `dhcp` / `auto`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub ipv4_address: Option<String>,
    pub ipv4_gateway: Option<String>,
    pub ipv6_address: Option<String>,
    pub ipv6_gateway: Option<String>,
}

impl IpConfig {
    pub fn is_empty(&self) -> bool {
        self.ipv4_address.is_none()
            && self.ipv4_gateway.is_none()
            && self.ipv6_address.is_none()
            && self.ipv6_gateway.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub username: Option<String>,
    pub password: Option<String>,
    pub keys: Vec<String>,
}

/// Whether `volume` is the generated cloud-init image of `vm_id`.
pub fn is_cloud_init_volume(volume: &str, vm_id: u32) -> bool {
    volume.contains(&format!("vm-{}-cloudinit", vm_id))
}
