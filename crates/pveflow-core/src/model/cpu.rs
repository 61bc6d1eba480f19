use crate::field::Field;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuConfig {
    pub architecture: Field<String>,
    pub cores: Field<u32>,
    pub sockets: Field<u32>,
    pub units: Field<u32>,
    pub flags: Field<Vec<String>>,
    pub cpu_type: Field<String>,
    /// `None` or `Some(0)` means no vCPU hotplug
    pub hotplugged: Field<Option<u32>>,
    /// 0 means unlimited
    pub limit: Field<u32>,
    pub numa: Field<bool>,
}

impl CpuConfig {
    /// Hotplugged vCPU count, with 0 folded into "not configured".
    pub fn hotplug_count(&self) -> Option<u32> {
        self.hotplugged.value().filter(|n| *n > 0)
    }
}
