//! Reconciliation driver
//!
//! Runs one pass against one instance: read, plan, execute the intents in
//! order, then re-read to confirm convergence. Errors are collected for the
//! whole pass; an intent whose dependency failed is skipped, and a timeout
//! or a failed migration aborts whatever is left. Nothing is rolled back
//! since the next pass resumes from the new observed state.

use crate::api::{
    HypervisorApi, InstanceStatus, MigrateRequest, MoveDiskRequest, ResizeDiskRequest,
    UpdateRequest,
};
use crate::error::{ReconcileError, Result};
use crate::intent::{ApplyResult, Dependency, Intent, Operation, Plan, Reason};
use crate::lifecycle::{with_deadline, wait_for_config_unlock, LifecycleController, PollConfig};
use crate::planner::{plan_pass, PlanOutcome};
use crate::provision::{build_clone_request, build_create_request};
use crate::reader::{read_observed, Observed};
use chrono::{DateTime, Utc};
use pveflow_core::model::{DesiredInstance, InstanceIdentity};
use std::time::{Duration, Instant};

const ABORTED_BY_TIMEOUT: &str = "pass aborted after a timeout";

/// Deadlines of remote operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub create: Duration,
    pub clone: Duration,
    pub migrate: Duration,
    pub start: Duration,
    pub shutdown: Duration,
    pub stop: Duration,
    pub reboot: Duration,
    pub move_disk: Duration,
    pub resize_disk: Duration,
    /// Plain config updates
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        let long = Duration::from_secs(1800);
        Self {
            create: long,
            clone: long,
            migrate: long,
            start: long,
            shutdown: long,
            stop: Duration::from_secs(300),
            reboot: long,
            move_disk: long,
            resize_disk: long,
            request: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The instance was provisioned in this pass
    Created,
    Applied,
    NoChanges,
    /// The instance no longer exists remotely
    Deleted,
}

impl std::fmt::Display for PassOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassOutcome::Created => write!(f, "created"),
            PassOutcome::Applied => write!(f, "applied"),
            PassOutcome::NoChanges => write!(f, "no changes"),
            PassOutcome::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PassReport {
    pub identity: InstanceIdentity,
    pub outcome: PassOutcome,
    pub plan: Plan,
    pub apply: ApplyResult,
    pub errors: Vec<ReconcileError>,
    /// A fresh read planned no further changes
    pub converged: bool,
    pub started_at: DateTime<Utc>,
}

impl PassReport {
    fn deleted(identity: InstanceIdentity, started_at: DateTime<Utc>) -> Self {
        Self {
            identity,
            outcome: PassOutcome::Deleted,
            plan: Plan::empty(),
            apply: ApplyResult::new(),
            errors: Vec::new(),
            converged: true,
            started_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Surfaces every error of the pass as one.
    pub fn into_result(self) -> Result<Self> {
        match ReconcileError::aggregate(self.errors.clone()) {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Result of executing a plan.
#[derive(Debug, Clone)]
pub struct Execution {
    pub apply: ApplyResult,
    /// Where the instance lives after the plan, migrations included
    pub identity: InstanceIdentity,
    pub errors: Vec<ReconcileError>,
}

pub struct Reconciler<A: HypervisorApi> {
    api: A,
    timeouts: Timeouts,
    poll_interval: Duration,
}

impl<A: HypervisorApi> Reconciler<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            timeouts: Timeouts::default(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Reads and plans without mutating anything. `None` when the instance
    /// does not exist.
    pub async fn plan(
        &self,
        desired: &DesiredInstance,
        identity: &InstanceIdentity,
        clone_provenance: bool,
    ) -> Result<Option<(Observed, PlanOutcome)>> {
        match read_observed(&self.api, identity).await {
            Ok(observed) => {
                let outcome = plan_pass(desired, &observed, clone_provenance);
                Ok(Some((observed, outcome)))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates or updates the instance described by `desired`.
    ///
    /// An instance is created when `desired` names no id or the named id
    /// does not exist on the desired node.
    pub async fn apply(&self, desired: &DesiredInstance) -> Result<PassReport> {
        if let Some(vm_id) = desired.vm_id {
            let identity = desired.identity(vm_id);
            match self.api.get_instance_status(&identity).await {
                Ok(_) => return self.reconcile(desired, &identity).await,
                Err(e) if e.is_not_found() => {
                    tracing::debug!("{} does not exist yet", identity);
                }
                Err(e) => return Err(e),
            }
        }
        self.create(desired).await
    }

    /// Provisions the instance, then runs the first update pass.
    pub async fn create(&self, desired: &DesiredInstance) -> Result<PassReport> {
        let started_at = Utc::now();
        let identity = self.provision(desired).await?;
        let mut report = self
            .run_pass(desired, identity, desired.is_clone(), started_at)
            .await?;
        report.outcome = PassOutcome::Created;
        Ok(report)
    }

    /// Update pass against an existing instance.
    ///
    /// Instances declared as clones keep inherited values for every block
    /// the user left empty, in this pass and all later ones.
    pub async fn reconcile(
        &self,
        desired: &DesiredInstance,
        identity: &InstanceIdentity,
    ) -> Result<PassReport> {
        self.run_pass(desired, identity.clone(), desired.is_clone(), Utc::now())
            .await
    }

    /// Creates or clones the instance and returns where it landed.
    pub async fn provision(&self, desired: &DesiredInstance) -> Result<InstanceIdentity> {
        if let Some((source, request)) = build_clone_request(desired) {
            let retries = desired.clone.as_ref().map_or(1, |c| c.retries);
            tracing::info!("Cloning {} (full: {})", source, request.full);
            let vm_id = with_deadline(
                format!("clone of {}", source),
                self.timeouts.clone,
                self.api.clone_instance(&source, &request, retries),
            )
            .await?;

            let identity = InstanceIdentity {
                vm_id,
                ..source.clone()
            };
            let poll = PollConfig::new(self.poll_interval, self.timeouts.clone);
            wait_for_config_unlock(&self.api, &identity, &poll).await?;
            tracing::info!("Cloned {} into {}", source, identity);
            return Ok(identity);
        }

        let request = build_create_request(desired)?;
        tracing::info!(
            "Creating {} on {} ({} parameters)",
            desired.kind,
            desired.node,
            request.params.len()
        );
        let vm_id = with_deadline(
            format!("create on {}", desired.node),
            self.timeouts.create,
            self.api.create_instance(&desired.node, &request),
        )
        .await?;
        let identity = desired.identity(vm_id);
        tracing::info!("Created {}", identity);
        Ok(identity)
    }

    async fn run_pass(
        &self,
        desired: &DesiredInstance,
        identity: InstanceIdentity,
        clone_provenance: bool,
        started_at: DateTime<Utc>,
    ) -> Result<PassReport> {
        tracing::info!("Reconciling {}", identity);
        let observed = match read_observed(&self.api, &identity).await {
            Ok(observed) => observed,
            Err(e) if e.is_not_found() => {
                tracing::info!("{} no longer exists", identity);
                return Ok(PassReport::deleted(identity, started_at));
            }
            Err(e) => return Err(e),
        };

        let PlanOutcome { plan, mut errors } = plan_pass(desired, &observed, clone_provenance);
        if !plan.has_changes {
            tracing::info!("{}: no changes", identity);
            return Ok(PassReport {
                identity,
                outcome: PassOutcome::NoChanges,
                plan,
                apply: ApplyResult::new(),
                converged: errors.is_empty(),
                errors,
                started_at,
            });
        }

        tracing::info!("{}: {}", identity, plan.summary());
        let execution = self.execute(&identity, &plan, &observed.status).await;
        errors.extend(execution.errors);
        let identity = execution.identity;

        let converged = if errors.is_empty() {
            self.confirm(desired, &identity, clone_provenance, &mut errors)
                .await
        } else {
            false
        };

        tracing::info!(
            "{}: {} succeeded, {} failed, {} skipped in {}ms",
            identity,
            execution.apply.succeeded.len(),
            execution.apply.failed.len(),
            execution.apply.skipped.len(),
            execution.apply.duration_ms
        );

        Ok(PassReport {
            identity,
            outcome: PassOutcome::Applied,
            plan,
            apply: execution.apply,
            errors,
            converged,
            started_at,
        })
    }

    async fn confirm(
        &self,
        desired: &DesiredInstance,
        identity: &InstanceIdentity,
        clone_provenance: bool,
        errors: &mut Vec<ReconcileError>,
    ) -> bool {
        match self.plan(desired, identity, clone_provenance).await {
            Ok(Some((_, outcome))) if !outcome.plan.has_changes => true,
            Ok(Some((_, outcome))) => {
                tracing::warn!(
                    "{} has not converged: {}",
                    identity,
                    outcome.plan.summary()
                );
                false
            }
            Ok(None) => {
                errors.push(ReconcileError::NotFound(identity.to_string()));
                false
            }
            Err(e) => {
                errors.push(e);
                false
            }
        }
    }

    /// Executes `plan` in order.
    ///
    /// Consecutive config changes with the same dependency go out as one
    /// update call; cloud-init detaches always go out on their own so a slot
    /// can be freed and reused within one pass.
    pub async fn execute(
        &self,
        identity: &InstanceIdentity,
        plan: &Plan,
        status: &InstanceStatus,
    ) -> Execution {
        let timer = Instant::now();
        let mut identity = identity.clone();
        let mut lifecycle = LifecycleController::from_status(status, self.poll_interval);
        let mut apply = ApplyResult::new();
        let mut errors = Vec::new();

        let mut window_failed = false;
        let mut config_failed = false;
        let mut aborted: Option<&str> = None;

        let intents = &plan.intents;
        let mut i = 0;
        while i < intents.len() {
            let intent = &intents[i];

            if let Some(why) = aborted {
                apply.add_skipped(intent, why);
                i += 1;
                continue;
            }
            let blocked = match intent.dependency {
                Dependency::None => false,
                Dependency::StoppedWindow => window_failed,
                Dependency::ConfigApplied => config_failed,
            };
            if blocked {
                tracing::warn!("Skipping {}: its dependency failed", intent);
                apply.add_skipped(intent, "dependency failed");
                i += 1;
                continue;
            }

            if intent.op.is_config_change() {
                let end = config_batch_end(intents, i);
                let batch = &intents[i..end];
                match self.update(&identity, batch).await {
                    Ok(()) => batch.iter().for_each(|b| apply.add_success(b)),
                    Err(e) => {
                        batch.iter().for_each(|b| apply.add_failure(b, &e));
                        config_failed = true;
                        if e.is_timeout() {
                            aborted = Some(ABORTED_BY_TIMEOUT);
                        }
                        errors.push(e);
                    }
                }
                i = end;
                continue;
            }

            match self.run_operation(&mut identity, &mut lifecycle, intent).await {
                Ok(()) => apply.add_success(intent),
                Err(e) => {
                    apply.add_failure(intent, &e);
                    if intent.op == Operation::Shutdown && intent.reason == Reason::StoppedWindow {
                        window_failed = true;
                    }
                    // The instance may be on either node now.
                    if matches!(intent.op, Operation::Migrate { .. }) {
                        aborted = Some("pass aborted after a failed migration");
                    } else if e.is_timeout() {
                        aborted = Some(ABORTED_BY_TIMEOUT);
                    }
                    errors.push(e);
                }
            }
            i += 1;
        }

        apply.duration_ms = timer.elapsed().as_millis() as u64;
        Execution {
            apply,
            identity,
            errors,
        }
    }

    async fn update(&self, identity: &InstanceIdentity, batch: &[Intent]) -> Result<()> {
        let mut request = UpdateRequest::default();
        for intent in batch {
            match &intent.op {
                Operation::FieldUpdate { param, value, .. } => {
                    request.set.insert(param.clone(), value.clone());
                }
                Operation::DeviceDelete { param } => request.delete.push(param.clone()),
                _ => {}
            }
        }
        tracing::debug!(
            "Updating {}: set {:?}, delete {:?}",
            identity,
            request.set.keys().collect::<Vec<_>>(),
            request.delete
        );
        with_deadline(
            format!("update of {}", identity),
            self.timeouts.request,
            self.api.update_instance(identity, &request),
        )
        .await
    }

    async fn run_operation(
        &self,
        identity: &mut InstanceIdentity,
        lifecycle: &mut LifecycleController,
        intent: &Intent,
    ) -> Result<()> {
        tracing::debug!("{}: {}", identity, intent);
        let t = &self.timeouts;
        match &intent.op {
            Operation::Start => lifecycle.start(&self.api, identity, t.start).await,
            Operation::Shutdown => lifecycle.shutdown(&self.api, identity, t.shutdown).await,
            Operation::Stop => lifecycle.stop(&self.api, identity, t.stop).await,
            Operation::Reboot => lifecycle
                .reboot(&self.api, identity, t.reboot)
                .await
                .map(|_| ()),
            Operation::Migrate { target_node } => {
                let request = MigrateRequest {
                    target_node: target_node.clone(),
                    with_local_disks: true,
                    online: lifecycle.is_running(),
                };
                with_deadline(
                    format!("migration of {}", identity),
                    t.migrate,
                    self.api.migrate_instance(identity, &request),
                )
                .await?;
                *identity = identity.on_node(target_node.clone());
                Ok(())
            }
            Operation::DiskMove {
                interface,
                target_datastore,
                delete_original,
            } => {
                let request = MoveDiskRequest {
                    interface: interface.clone(),
                    target_datastore: target_datastore.clone(),
                    delete_original: *delete_original,
                };
                with_deadline(
                    format!("move of {} on {}", interface, identity),
                    t.move_disk,
                    self.api.move_disk(identity, &request),
                )
                .await
            }
            Operation::DiskResize {
                interface,
                size_gib,
            } => {
                let request = ResizeDiskRequest {
                    interface: interface.clone(),
                    size_gib: *size_gib,
                };
                with_deadline(
                    format!("resize of {} on {}", interface, identity),
                    t.resize_disk,
                    self.api.resize_disk(identity, &request),
                )
                .await
            }
            Operation::FieldUpdate { .. } | Operation::DeviceDelete { .. } => {
                self.update(identity, std::slice::from_ref(intent)).await
            }
        }
    }
}

/// End (exclusive) of the update batch starting at `start`.
fn config_batch_end(intents: &[Intent], start: usize) -> usize {
    let first = &intents[start];
    let detach = first.reason == Reason::CloudInitDetach;
    intents[start..]
        .iter()
        .position(|i| {
            !i.op.is_config_change()
                || i.dependency != first.dependency
                || (i.reason == Reason::CloudInitDetach) != detach
        })
        .map_or(intents.len(), |offset| start + offset)
}
