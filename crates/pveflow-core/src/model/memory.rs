use crate::field::Field;
use serde::{Deserialize, Serialize};

/// Memory sizes in MiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub dedicated_mb: Field<u32>,
    /// Balloon target; 0 disables ballooning
    pub floating_mb: Field<u32>,
    /// ivshmem size; 0 removes the device
    pub shared_mb: Field<u32>,
}
