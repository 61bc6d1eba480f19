use serde::{Deserialize, Serialize};

/// Highest `netN` slot the hypervisor accepts.
pub const MAX_NETWORK_SLOTS: usize = 32;

/// The only device type a container network slot takes.
pub const CONTAINER_NETWORK_MODEL: &str = "veth";

/// One network slot. The slot index is the position in the device list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub enabled: bool,
    pub bridge: Option<String>,
    pub model: String,
    /// `None` lets the hypervisor assign one
    pub mac_address: Option<String>,
    pub vlan_id: Option<u16>,
    /// MB/s
    pub rate_limit: Option<f64>,
    pub mtu: Option<u16>,
    pub firewall: bool,
}

impl NetworkDevice {
    pub fn new(model: impl Into<String>, bridge: impl Into<String>) -> Self {
        Self {
            enabled: true,
            bridge: Some(bridge.into()),
            model: model.into(),
            mac_address: None,
            vlan_id: None,
            rate_limit: None,
            mtu: None,
            firewall: false,
        }
    }

    /// Placeholder for an interior gap in the observed slot list.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            bridge: None,
            model: String::new(),
            mac_address: None,
            vlan_id: None,
            rate_limit: None,
            mtu: None,
            firewall: false,
        }
    }

    /// Whether `observed` already satisfies this desired device.
    ///
    /// A desired device without a MAC address accepts whatever address the
    /// hypervisor assigned.
    pub fn satisfied_by(&self, observed: &NetworkDevice) -> bool {
        if self.enabled != observed.enabled {
            return false;
        }
        if !self.enabled {
            return true;
        }
        let mac_matches = match &self.mac_address {
            Some(mac) => observed
                .mac_address
                .as_deref()
                .is_some_and(|o| o.eq_ignore_ascii_case(mac)),
            None => true,
        };
        mac_matches
            && self.bridge == observed.bridge
            && self.model == observed.model
            && self.vlan_id == observed.vlan_id
            && self.rate_limit == observed.rate_limit
            && self.mtu == observed.mtu
            && self.firewall == observed.firewall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_mac_accepts_assigned() {
        let desired = NetworkDevice::new("virtio", "vmbr0");
        let mut observed = desired.clone();
        observed.mac_address = Some("BC:24:11:00:00:01".to_string());
        assert!(desired.satisfied_by(&observed));
    }

    #[test]
    fn test_mac_compare_is_case_insensitive() {
        let mut desired = NetworkDevice::new("virtio", "vmbr0");
        desired.mac_address = Some("bc:24:11:00:00:01".to_string());
        let mut observed = desired.clone();
        observed.mac_address = Some("BC:24:11:00:00:01".to_string());
        assert!(desired.satisfied_by(&observed));
    }

    #[test]
    fn test_bridge_change_is_not_satisfied() {
        let desired = NetworkDevice::new("virtio", "vmbr1");
        let observed = NetworkDevice::new("virtio", "vmbr0");
        assert!(!desired.satisfied_by(&observed));
    }

    #[test]
    fn test_disabled_slots_match() {
        let desired = NetworkDevice {
            bridge: Some("vmbr0".to_string()),
            ..NetworkDevice::disabled()
        };
        assert!(desired.satisfied_by(&NetworkDevice::disabled()));
    }
}
