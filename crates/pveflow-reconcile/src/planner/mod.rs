//! Diff & operation planner
//!
//! Compares a desired [`CanonicalConfig`] against the observed one and
//! produces the intents of one pass. Field groups are diffed here; disks and
//! the cloud-init drive are delegated to their managers and everything is
//! ordered by [`lifecycle::schedule`](crate::lifecycle::schedule).

mod fields;
mod networks;

use crate::cloud_init::{plan_cloud_init, plan_container_dns};
use crate::disk::plan_disks;
use crate::error::ReconcileError;
use crate::intent::{Intent, Plan};
use crate::lifecycle::{schedule, ScheduleInput};
use crate::reader::Observed;
use fields::DiffBuilder;
use pveflow_core::model::{CanonicalConfig, DesiredInstance, InstanceKind};

/// What the planner needs to know about the instance besides its config.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub vm_id: u32,
    pub kind: InstanceKind,
    /// The instance was just cloned; blocks the user left empty keep the
    /// values inherited from the source.
    pub clone_provenance: bool,
}

/// Field-level changes of one pass.
#[derive(Debug, Clone, Default)]
pub struct ConfigDiff {
    pub intents: Vec<Intent>,
    pub reboot_required: bool,
    pub errors: Vec<ReconcileError>,
}

pub fn diff_config(
    desired: &CanonicalConfig,
    observed: &CanonicalConfig,
    ctx: &PlanContext,
) -> ConfigDiff {
    let mut b = DiffBuilder::new(ctx);

    fields::diff_general(&mut b, desired, observed);
    fields::diff_cpu(&mut b, &desired.cpu, &observed.cpu);
    fields::diff_memory(&mut b, &desired.memory, &observed.memory);
    match ctx.kind {
        InstanceKind::Vm => {
            fields::diff_machine(&mut b, desired, observed);
            networks::diff_networks(&mut b, &desired.networks, &observed.networks);
        }
        InstanceKind::Container => networks::diff_container_networks(
            &mut b,
            &desired.networks,
            &observed.networks,
            desired.cloud_init.as_ref().map(|c| c.ip_configs.as_slice()),
            observed
                .cloud_init
                .as_ref()
                .map(|c| c.ip_configs.as_slice())
                .unwrap_or_default(),
        ),
    }

    ConfigDiff {
        intents: b.intents,
        reboot_required: b.reboot_required,
        errors: b.errors,
    }
}

/// Planned pass plus the policy violations found while planning.
#[derive(Debug, Clone, Default)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub errors: Vec<ReconcileError>,
}

impl PlanOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Plans one full pass for an existing instance.
pub fn plan_pass(desired: &DesiredInstance, observed: &Observed, clone_provenance: bool) -> PlanOutcome {
    let ctx = PlanContext {
        vm_id: observed.identity.vm_id,
        kind: observed.identity.kind,
        clone_provenance,
    };
    let diff = diff_config(&desired.config, &observed.config, &ctx);
    let mut errors = diff.errors;

    let cloud_init = match ctx.kind {
        InstanceKind::Vm => plan_cloud_init(
            desired.config.cloud_init.as_ref(),
            observed.config.cloud_init.as_ref(),
            &observed.occupied_slots,
        ),
        InstanceKind::Container => plan_container_dns(
            desired.config.cloud_init.as_ref(),
            observed.config.cloud_init.as_ref(),
        ),
    };
    let (disks, disk_errors) = plan_disks(&desired.config.disks, &observed.config.disks, ctx.vm_id);
    errors.extend(disk_errors);

    let migrate_to = (desired.node != observed.identity.node).then(|| desired.node.clone());
    let reboot_required = diff.reboot_required || cloud_init.reboot_required || disks.reboot_required;
    let template =
        *desired.config.lifecycle.template.value() || *observed.config.lifecycle.template.value();

    let plan = schedule(ScheduleInput {
        config: diff.intents,
        cloud_init,
        disks,
        migrate_to,
        reboot_required,
        was_running: observed.is_running(),
        want_started: *desired.config.lifecycle.started.value(),
        template,
    });

    tracing::debug!(
        "Planned {} for {} ({} errors)",
        plan.summary(),
        observed.identity,
        errors.len()
    );
    PlanOutcome { plan, errors }
}
