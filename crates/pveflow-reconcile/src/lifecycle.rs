//! Lifecycle controller
//!
//! Power transitions with status polling, plus the sequencer that orders a
//! pass's intents around them.

use crate::api::{HypervisorApi, InstanceStatus, RunState, ShutdownRequest};
use crate::cloud_init::CloudInitPlan;
use crate::disk::DiskPlan;
use crate::error::{ReconcileError, Result};
use crate::intent::{Dependency, Intent, Operation, Plan, Reason};
use pveflow_core::InstanceIdentity;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::Stopped => write!(f, "stopped"),
            PowerState::Starting => write!(f, "starting"),
            PowerState::Running => write!(f, "running"),
            PowerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Fixed-interval polling bounded by an overall timeout.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1800),
        }
    }
}

/// Runs a one-shot remote call under `timeout`.
pub async fn with_deadline<T>(
    what: impl std::fmt::Display,
    timeout: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Timeout(format!(
            "{} did not complete within {}s",
            what,
            timeout.as_secs()
        ))),
    }
}

/// Time left to the hard stop after a graceful shutdown gives up.
const FORCE_STOP_RESERVE: Duration = Duration::from_secs(30);

/// Graceful part of a shutdown deadline; at most a quarter of it is held
/// back for the hard stop.
pub fn graceful_shutdown_timeout(deadline: Duration) -> Duration {
    deadline.saturating_sub(FORCE_STOP_RESERVE.min(deadline / 4))
}

/// Polls until the instance reports `target`.
///
/// Transient API errors are retried until the deadline; anything else fails
/// immediately.
pub async fn wait_for_status<A: HypervisorApi + ?Sized>(
    api: &A,
    id: &InstanceIdentity,
    target: RunState,
    poll: &PollConfig,
) -> Result<()> {
    poll_status(api, id, poll, &format!("reach {}", target), |s| s.status == target).await
}

/// Polls until no task holds the config lock.
pub async fn wait_for_config_unlock<A: HypervisorApi + ?Sized>(
    api: &A,
    id: &InstanceIdentity,
    poll: &PollConfig,
) -> Result<()> {
    poll_status(api, id, poll, "release its config lock", |s| s.lock.is_none()).await
}

async fn poll_status<A: HypervisorApi + ?Sized>(
    api: &A,
    id: &InstanceIdentity,
    poll: &PollConfig,
    goal: &str,
    done: impl Fn(&InstanceStatus) -> bool,
) -> Result<()> {
    let deadline = Instant::now() + poll.timeout;
    loop {
        match api.get_instance_status(id).await {
            Ok(status) if done(&status) => return Ok(()),
            Ok(status) => tracing::debug!(
                "Waiting for {} to {} (status: {}, lock: {:?})",
                id,
                goal,
                status.status,
                status.lock
            ),
            Err(e) if e.is_transient() => {
                tracing::debug!("Transient error while polling {}: {}", id, e)
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReconcileError::Timeout(format!(
                "{} did not {} within {}s",
                id,
                goal,
                poll.timeout.as_secs()
            )));
        }
        tokio::time::sleep(poll.interval.min(deadline - now)).await;
    }
}

/// Power state machine of one instance.
#[derive(Debug, Clone)]
pub struct LifecycleController {
    state: PowerState,
    poll_interval: Duration,
}

impl LifecycleController {
    pub fn new(state: PowerState, poll_interval: Duration) -> Self {
        Self {
            state,
            poll_interval,
        }
    }

    pub fn from_status(status: &InstanceStatus, poll_interval: Duration) -> Self {
        let state = if status.is_running() {
            PowerState::Running
        } else {
            PowerState::Stopped
        };
        Self::new(state, poll_interval)
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == PowerState::Running
    }

    fn transition(&mut self, id: &InstanceIdentity, next: PowerState) {
        tracing::info!("{}: {} -> {}", id, self.state, next);
        self.state = next;
    }

    /// Starts the instance and waits until it runs.
    pub async fn start<A: HypervisorApi + ?Sized>(
        &mut self,
        api: &A,
        id: &InstanceIdentity,
        timeout: Duration,
    ) -> Result<()> {
        if self.state == PowerState::Running {
            return Ok(());
        }
        let before = self.state;
        self.transition(id, PowerState::Starting);
        let result = self
            .settle(api, id, timeout, RunState::Running, api.start_instance(id, timeout))
            .await;
        self.finish(id, result, PowerState::Running, before)
    }

    /// Graceful shutdown that hard-stops when the graceful part of
    /// `timeout` passes. The whole transition stays within `timeout`.
    pub async fn shutdown<A: HypervisorApi + ?Sized>(
        &mut self,
        api: &A,
        id: &InstanceIdentity,
        timeout: Duration,
    ) -> Result<()> {
        if self.state == PowerState::Stopped {
            return Ok(());
        }
        let request = ShutdownRequest {
            force_stop: true,
            timeout: graceful_shutdown_timeout(timeout),
        };
        let before = self.state;
        self.transition(id, PowerState::Stopping);
        let result = self
            .settle(api, id, timeout, RunState::Stopped, api.shutdown_instance(id, &request))
            .await;
        self.finish(id, result, PowerState::Stopped, before)
    }

    /// Immediate hard stop.
    pub async fn stop<A: HypervisorApi + ?Sized>(
        &mut self,
        api: &A,
        id: &InstanceIdentity,
        timeout: Duration,
    ) -> Result<()> {
        if self.state == PowerState::Stopped {
            return Ok(());
        }
        let before = self.state;
        self.transition(id, PowerState::Stopping);
        let result = self
            .settle(api, id, timeout, RunState::Stopped, api.stop_instance(id, timeout))
            .await;
        self.finish(id, result, PowerState::Stopped, before)
    }

    /// Reboots a running instance. Returns `false` when it was not running.
    pub async fn reboot<A: HypervisorApi + ?Sized>(
        &mut self,
        api: &A,
        id: &InstanceIdentity,
        timeout: Duration,
    ) -> Result<bool> {
        if self.state != PowerState::Running {
            tracing::info!("{} is {}, skipping reboot", id, self.state);
            return Ok(false);
        }
        let result = self
            .settle(api, id, timeout, RunState::Running, api.reboot_instance(id, timeout))
            .await;
        self.finish(id, result, PowerState::Running, PowerState::Running)
            .map(|_| true)
    }

    async fn settle<A: HypervisorApi + ?Sized>(
        &self,
        api: &A,
        id: &InstanceIdentity,
        timeout: Duration,
        target: RunState,
        call: impl Future<Output = Result<()>>,
    ) -> Result<()> {
        let started_at = Instant::now();
        with_deadline(format!("{} on {}", target, id), timeout, call).await?;
        let remaining = timeout.saturating_sub(started_at.elapsed());
        wait_for_status(api, id, target, &PollConfig::new(self.poll_interval, remaining)).await
    }

    fn finish(
        &mut self,
        id: &InstanceIdentity,
        result: Result<()>,
        reached: PowerState,
        before: PowerState,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.transition(id, reached);
                Ok(())
            }
            Err(e) => {
                self.transition(id, before);
                Err(e)
            }
        }
    }
}

/// Everything the sequencer orders.
#[derive(Debug, Clone, Default)]
pub struct ScheduleInput {
    /// Field, network and disk attachment updates
    pub config: Vec<Intent>,
    pub cloud_init: CloudInitPlan,
    pub disks: DiskPlan,
    pub migrate_to: Option<String>,
    pub reboot_required: bool,
    pub was_running: bool,
    pub want_started: bool,
    pub template: bool,
}

/// Orders a pass:
///
/// 1. migrate
/// 2. shutdown when a running instance needs a stopped window
/// 3. cloud-init detach, config updates, disk moves, disk resizes
/// 4. power-state alignment
/// 5. reboot when a restart is still owed
pub fn schedule(input: ScheduleInput) -> Plan {
    let ScheduleInput {
        config,
        cloud_init,
        disks,
        migrate_to,
        reboot_required,
        was_running,
        want_started,
        template,
    } = input;
    let mut intents = Vec::new();

    if let Some(target_node) = migrate_to {
        intents.push(Intent::new(Operation::Migrate { target_node }, Reason::NodeChange));
    }

    let needs_window = (cloud_init.relocation || !disks.moves.is_empty()) && !template;
    let window_open = needs_window && was_running;
    let window_dep = if window_open {
        intents.push(Intent::new(Operation::Shutdown, Reason::StoppedWindow));
        Dependency::StoppedWindow
    } else {
        Dependency::None
    };

    intents.extend(cloud_init.detach.into_iter().map(|i| i.depends_on(window_dep)));
    intents.extend(cloud_init.attach.map(|i| i.depends_on(window_dep)));
    intents.extend(cloud_init.updates);
    intents.extend(config);
    intents.extend(disks.updates);
    intents.extend(disks.moves.into_iter().map(|i| i.depends_on(window_dep)));
    intents.extend(disks.resizes);

    let mut cycled = false;
    if !template {
        if window_open {
            cycled = true;
            if want_started {
                intents.push(
                    Intent::new(Operation::Start, Reason::StoppedWindow)
                        .depends_on(Dependency::StoppedWindow),
                );
            }
        } else if was_running && !want_started {
            cycled = true;
            intents.push(Intent::new(Operation::Shutdown, Reason::PowerState));
        } else if !was_running && want_started {
            cycled = true;
            intents.push(Intent::new(Operation::Start, Reason::PowerState));
        }
    }

    if reboot_required && !template && was_running && want_started && !cycled {
        intents.push(
            Intent::new(Operation::Reboot, Reason::RestartRequired)
                .depends_on(Dependency::ConfigApplied),
        );
    }

    Plan::new(intents, reboot_required)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(plan: &Plan) -> Vec<Operation> {
        plan.operations().cloned().collect()
    }

    fn cores_update() -> Intent {
        Intent::update("cpu.cores", "cores", "4", Reason::Drift)
    }

    #[test]
    fn test_running_restart_becomes_reboot() {
        let plan = schedule(ScheduleInput {
            config: vec![cores_update()],
            reboot_required: true,
            was_running: true,
            want_started: true,
            ..Default::default()
        });
        assert_eq!(ops(&plan), vec![cores_update().op, Operation::Reboot]);
        assert_eq!(plan.intents[1].dependency, Dependency::ConfigApplied);
    }

    #[test]
    fn test_stopped_instance_gets_no_reboot() {
        let plan = schedule(ScheduleInput {
            config: vec![cores_update()],
            reboot_required: true,
            was_running: false,
            want_started: false,
            ..Default::default()
        });
        assert_eq!(ops(&plan), vec![cores_update().op]);
        assert!(plan.reboot_required);
    }

    #[test]
    fn test_start_subsumes_reboot() {
        let plan = schedule(ScheduleInput {
            config: vec![cores_update()],
            reboot_required: true,
            was_running: false,
            want_started: true,
            ..Default::default()
        });
        assert_eq!(ops(&plan), vec![cores_update().op, Operation::Start]);
    }

    #[test]
    fn test_disk_move_opens_stopped_window() {
        let mv = Intent::new(
            Operation::DiskMove {
                interface: "scsi0".into(),
                target_datastore: "fast".into(),
                delete_original: true,
            },
            Reason::DiskMigration,
        );
        let resize = Intent::new(
            Operation::DiskResize {
                interface: "scsi0".into(),
                size_gib: 64,
            },
            Reason::DiskGrowth,
        );
        let plan = schedule(ScheduleInput {
            disks: DiskPlan {
                moves: vec![mv.clone()],
                resizes: vec![resize.clone()],
                ..Default::default()
            },
            was_running: true,
            want_started: true,
            reboot_required: true,
            ..Default::default()
        });
        assert_eq!(
            ops(&plan),
            vec![Operation::Shutdown, mv.op, resize.op, Operation::Start]
        );
        assert_eq!(plan.intents[1].dependency, Dependency::StoppedWindow);
        assert_eq!(plan.intents[3].dependency, Dependency::StoppedWindow);
    }

    #[test]
    fn test_migrate_comes_first() {
        let plan = schedule(ScheduleInput {
            migrate_to: Some("pve2".into()),
            config: vec![cores_update()],
            was_running: false,
            want_started: false,
            ..Default::default()
        });
        assert_eq!(
            ops(&plan),
            vec![
                Operation::Migrate {
                    target_node: "pve2".into()
                },
                cores_update().op
            ]
        );
    }

    #[test]
    fn test_templates_are_never_powered() {
        let plan = schedule(ScheduleInput {
            config: vec![cores_update()],
            reboot_required: true,
            was_running: false,
            want_started: true,
            template: true,
            ..Default::default()
        });
        assert_eq!(ops(&plan), vec![cores_update().op]);
    }

    #[test]
    fn test_graceful_shutdown_leaves_room_for_hard_stop() {
        assert_eq!(
            graceful_shutdown_timeout(Duration::from_secs(1800)),
            Duration::from_secs(1770)
        );
        assert_eq!(
            graceful_shutdown_timeout(Duration::from_secs(60)),
            Duration::from_secs(45)
        );
        assert!(graceful_shutdown_timeout(Duration::from_millis(200)) < Duration::from_millis(200));
    }

    #[test]
    fn test_want_stopped_shuts_down() {
        let plan = schedule(ScheduleInput {
            reboot_required: true,
            config: vec![cores_update()],
            was_running: true,
            want_started: false,
            ..Default::default()
        });
        assert_eq!(ops(&plan), vec![cores_update().op, Operation::Shutdown]);
    }
}
