//! Planned mutations and their results

use serde::{Deserialize, Serialize};

/// One remote mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Set `param` to `value`. `field` is the canonical field path for diagnostics.
    FieldUpdate {
        field: String,
        param: String,
        value: String,
    },
    /// Remove `param` from the configuration.
    DeviceDelete { param: String },
    DiskMove {
        interface: String,
        target_datastore: String,
        delete_original: bool,
    },
    DiskResize { interface: String, size_gib: u64 },
    Reboot,
    Shutdown,
    Start,
    Stop,
    Migrate { target_node: String },
}

impl Operation {
    /// Config mutations that go through a single update call.
    pub fn is_config_change(&self) -> bool {
        matches!(
            self,
            Operation::FieldUpdate { .. } | Operation::DeviceDelete { .. }
        )
    }

    pub fn is_disk_operation(&self) -> bool {
        matches!(self, Operation::DiskMove { .. } | Operation::DiskResize { .. })
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Operation::Reboot
                | Operation::Shutdown
                | Operation::Start
                | Operation::Stop
                | Operation::Migrate { .. }
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::FieldUpdate { field, param, value } => {
                write!(f, "update {} ({}={})", field, param, value)
            }
            Operation::DeviceDelete { param } => write!(f, "delete {}", param),
            Operation::DiskMove {
                interface,
                target_datastore,
                ..
            } => write!(f, "move disk {} to {}", interface, target_datastore),
            Operation::DiskResize {
                interface,
                size_gib,
            } => write!(f, "resize disk {} to {}G", interface, size_gib),
            Operation::Reboot => write!(f, "reboot"),
            Operation::Shutdown => write!(f, "shutdown"),
            Operation::Start => write!(f, "start"),
            Operation::Stop => write!(f, "stop"),
            Operation::Migrate { target_node } => write!(f, "migrate to {}", target_node),
        }
    }
}

/// Why an intent was planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Desired value differs from observed
    Drift,
    /// Device present in desired, absent in observed
    Create,
    /// Observed slot beyond the desired count
    Prune,
    /// Desired slot explicitly disabled
    Disabled,
    /// Desired value removed
    Cleared,
    CloudInitDetach,
    CloudInitAttach,
    DiskMigration,
    DiskGrowth,
    NodeChange,
    /// Opens or closes a stopped window for non-hot-swappable changes
    StoppedWindow,
    /// Aligns the power state with the desired `started` flag
    PowerState,
    RestartRequired,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Drift => write!(f, "drift"),
            Reason::Create => write!(f, "create"),
            Reason::Prune => write!(f, "prune"),
            Reason::Disabled => write!(f, "disabled"),
            Reason::Cleared => write!(f, "cleared"),
            Reason::CloudInitDetach => write!(f, "cloud-init detach"),
            Reason::CloudInitAttach => write!(f, "cloud-init attach"),
            Reason::DiskMigration => write!(f, "disk migration"),
            Reason::DiskGrowth => write!(f, "disk growth"),
            Reason::NodeChange => write!(f, "node change"),
            Reason::StoppedWindow => write!(f, "stopped window"),
            Reason::PowerState => write!(f, "power state"),
            Reason::RestartRequired => write!(f, "restart required"),
        }
    }
}

/// What an intent needs to have succeeded before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    #[default]
    None,
    /// The shutdown that opened the stopped window
    StoppedWindow,
    /// Every config update of the pass
    ConfigApplied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub op: Operation,
    pub reason: Reason,
    #[serde(default)]
    pub dependency: Dependency,
}

impl Intent {
    pub fn new(op: Operation, reason: Reason) -> Self {
        Self {
            op,
            reason,
            dependency: Dependency::None,
        }
    }

    pub fn update(
        field: impl Into<String>,
        param: impl Into<String>,
        value: impl Into<String>,
        reason: Reason,
    ) -> Self {
        Self::new(
            Operation::FieldUpdate {
                field: field.into(),
                param: param.into(),
                value: value.into(),
            },
            reason,
        )
    }

    pub fn delete(param: impl Into<String>, reason: Reason) -> Self {
        Self::new(
            Operation::DeviceDelete {
                param: param.into(),
            },
            reason,
        )
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependency = dependency;
        self
    }

    /// Remote parameter touched by a config change.
    pub fn param(&self) -> Option<&str> {
        match &self.op {
            Operation::FieldUpdate { param, .. } | Operation::DeviceDelete { param } => {
                Some(param.as_str())
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.op, self.reason)
    }
}

/// Ordered intents of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub intents: Vec<Intent>,
    pub reboot_required: bool,
    pub has_changes: bool,
}

impl Plan {
    pub fn new(intents: Vec<Intent>, reboot_required: bool) -> Self {
        let has_changes = !intents.is_empty();
        Self {
            intents,
            reboot_required,
            has_changes,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, intent: Intent) {
        self.intents.push(intent);
        self.has_changes = true;
    }

    pub fn extend(&mut self, intents: impl IntoIterator<Item = Intent>) {
        self.intents.extend(intents);
        self.has_changes = !self.intents.is_empty();
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.intents.iter().map(|i| &i.op)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in self.operations() {
            match op {
                Operation::FieldUpdate { .. } => summary.update += 1,
                Operation::DeviceDelete { .. } => summary.delete += 1,
                Operation::DiskMove { .. } | Operation::DiskResize { .. } => summary.disk += 1,
                _ => summary.lifecycle += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub update: usize,
    pub delete: usize,
    pub disk: usize,
    pub lifecycle: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to update, {} to delete, {} disk operations, {} lifecycle operations",
            self.update, self.delete, self.disk, self.lifecycle
        )
    }
}

/// Result of applying a plan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    pub succeeded: Vec<IntentResult>,
    pub failed: Vec<IntentResult>,
    /// Not attempted because a dependency failed or the pass was aborted
    pub skipped: Vec<IntentResult>,
    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl ApplyResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn add_success(&mut self, intent: &Intent) {
        self.succeeded.push(IntentResult {
            intent: intent.to_string(),
            message: String::new(),
        });
    }

    pub fn add_failure(&mut self, intent: &Intent, error: impl std::fmt::Display) {
        self.failed.push(IntentResult {
            intent: intent.to_string(),
            message: error.to_string(),
        });
    }

    pub fn add_skipped(&mut self, intent: &Intent, why: impl Into<String>) {
        self.skipped.push(IntentResult {
            intent: intent.to_string(),
            message: why.into(),
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_new() {
        assert!(!Plan::new(vec![], false).has_changes);
        let plan = Plan::new(vec![Intent::new(Operation::Start, Reason::PowerState)], false);
        assert!(plan.has_changes);
    }

    #[test]
    fn test_plan_summary() {
        let plan = Plan::new(
            vec![
                Intent::update("cpu.cores", "cores", "4", Reason::Drift),
                Intent::delete("net1", Reason::Prune),
                Intent::new(
                    Operation::DiskResize {
                        interface: "scsi0".into(),
                        size_gib: 64,
                    },
                    Reason::DiskGrowth,
                ),
                Intent::new(Operation::Reboot, Reason::RestartRequired),
            ],
            true,
        );
        let summary = plan.summary();
        assert_eq!(summary.update, 1);
        assert_eq!(summary.delete, 1);
        assert_eq!(summary.disk, 1);
        assert_eq!(summary.lifecycle, 1);
        assert_eq!(
            summary.to_string(),
            "1 to update, 1 to delete, 1 disk operations, 1 lifecycle operations"
        );
    }

    #[test]
    fn test_intent_display() {
        let intent = Intent::update("cpu.cores", "cores", "4", Reason::Drift);
        assert_eq!(intent.to_string(), "update cpu.cores (cores=4) [drift]");
        assert_eq!(intent.param(), Some("cores"));
    }

    #[test]
    fn test_apply_result() {
        let intent = Intent::new(Operation::Start, Reason::PowerState);
        let mut result = ApplyResult::new();
        result.add_success(&intent);
        assert!(result.is_success());
        result.add_skipped(&intent, "shutdown failed");
        assert!(!result.is_success());
    }
}
