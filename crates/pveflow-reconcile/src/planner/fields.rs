//! Per-field comparison of scalar settings and blocks

use crate::error::ReconcileError;
use crate::intent::{Intent, Reason};
use crate::planner::PlanContext;
use pveflow_core::model::{CanonicalConfig, CpuConfig, InstanceKind, MemoryConfig};
use pveflow_core::{wire, Field};

/// Collects intents and the restart flag while walking field groups.
pub(crate) struct DiffBuilder<'a> {
    ctx: &'a PlanContext,
    pub intents: Vec<Intent>,
    pub reboot_required: bool,
    pub errors: Vec<ReconcileError>,
}

impl<'a> DiffBuilder<'a> {
    pub fn new(ctx: &'a PlanContext) -> Self {
        Self {
            ctx,
            intents: Vec::new(),
            reboot_required: false,
            errors: Vec::new(),
        }
    }

    /// Whether a whole desired block is skipped because the clone already carries it.
    pub fn skip_block<T>(&self, desired: &Field<T>) -> bool {
        self.ctx.clone_provenance && desired.is_provider_default()
    }

    /// Emits an update (or a delete when `encode` yields `None`) if `desired`
    /// differs from `observed`.
    pub fn compare<T: PartialEq>(
        &mut self,
        field: &str,
        param: &str,
        desired: &Field<T>,
        observed: &Field<T>,
        restart: bool,
        encode: impl FnOnce(&T) -> Option<String>,
    ) {
        if self.skip_block(desired) || !desired.differs_from(observed) {
            return;
        }
        let intent = match encode(desired.value()) {
            Some(value) => Intent::update(field, param, value, Reason::Drift),
            None => Intent::delete(param, Reason::Cleared),
        };
        tracing::debug!("Planned {}", intent);
        self.intents.push(intent);
        if restart {
            self.reboot_required = true;
        }
    }

    /// Pushes a device change that only takes effect on restart.
    pub fn push_restart(&mut self, intent: Intent) {
        tracing::debug!("Planned {}", intent);
        self.intents.push(intent);
        self.reboot_required = true;
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn non_zero(value: u32) -> Option<String> {
    (value > 0).then(|| value.to_string())
}

fn flag(value: &bool) -> Option<String> {
    Some(wire::encode_bool(*value))
}

pub(crate) fn diff_general(b: &mut DiffBuilder<'_>, desired: &CanonicalConfig, observed: &CanonicalConfig) {
    let name_param = match b.ctx.kind {
        InstanceKind::Vm => "name",
        InstanceKind::Container => "hostname",
    };
    b.compare("name", name_param, &desired.name, &observed.name, false, |v| non_empty(v));
    b.compare(
        "description",
        "description",
        &desired.description,
        &observed.description,
        false,
        |v| non_empty(v),
    );
    b.compare("tags", "tags", &desired.tags, &observed.tags, false, |v| {
        (!v.is_empty()).then(|| wire::encode_tags(v))
    });
    b.compare(
        "on_boot",
        "onboot",
        &desired.lifecycle.on_boot,
        &observed.lifecycle.on_boot,
        false,
        flag,
    );
    b.compare(
        "protection",
        "protection",
        &desired.protection,
        &observed.protection,
        false,
        flag,
    );
    b.compare("startup", "startup", &desired.startup, &observed.startup, false, |v| {
        v.as_ref()
            .filter(|s| !s.is_empty())
            .map(wire::encode_startup)
    });
    diff_template(b, desired, observed);
}

/// Template conversion is one-way.
fn diff_template(b: &mut DiffBuilder<'_>, desired: &CanonicalConfig, observed: &CanonicalConfig) {
    let want = &desired.lifecycle.template;
    let have = &observed.lifecycle.template;
    if b.skip_block(want) || !want.differs_from(have) {
        return;
    }
    if *want.value() {
        b.intents
            .push(Intent::update("template", "template", "1", Reason::Drift));
    } else {
        b.errors.push(ReconcileError::UnsupportedOperation(
            "a template cannot be converted back into a regular instance".to_string(),
        ));
    }
}

pub(crate) fn diff_cpu(b: &mut DiffBuilder<'_>, desired: &Field<CpuConfig>, observed: &Field<CpuConfig>) {
    if b.skip_block(desired) {
        return;
    }
    let (want, have) = (desired.value(), observed.value());
    let vm = b.ctx.kind == InstanceKind::Vm;

    b.compare("cpu.cores", "cores", &want.cores, &have.cores, vm, |v| Some(v.to_string()));
    b.compare("cpu.units", "cpuunits", &want.units, &have.units, false, |v| Some(v.to_string()));
    b.compare("cpu.limit", "cpulimit", &want.limit, &have.limit, false, |v| non_zero(*v));
    if !vm {
        return;
    }

    b.compare("cpu.sockets", "sockets", &want.sockets, &have.sockets, true, |v| Some(v.to_string()));
    b.compare(
        "cpu.architecture",
        "arch",
        &want.architecture,
        &have.architecture,
        true,
        |v| non_empty(v),
    );

    let want_emulation = want.cpu_type.clone().zip(want.flags.clone());
    let have_emulation = have.cpu_type.clone().zip(have.flags.clone());
    b.compare("cpu.type", "cpu", &want_emulation, &have_emulation, true, |(t, f)| {
        Some(wire::encode_cpu_emulation(t, f))
    });

    let want_hotplug = want.hotplugged.clone().map(|v| v.filter(|n| *n > 0));
    let have_hotplug = have.hotplugged.clone().map(|v| v.filter(|n| *n > 0));
    b.compare("cpu.hotplugged", "vcpus", &want_hotplug, &have_hotplug, true, |v| {
        v.map(|n| n.to_string())
    });
    b.compare("cpu.numa", "numa", &want.numa, &have.numa, true, flag);
}

pub(crate) fn diff_memory(
    b: &mut DiffBuilder<'_>,
    desired: &Field<MemoryConfig>,
    observed: &Field<MemoryConfig>,
) {
    if b.skip_block(desired) {
        return;
    }
    let (want, have) = (desired.value(), observed.value());
    let vm = b.ctx.kind == InstanceKind::Vm;
    let vm_id = b.ctx.vm_id;

    b.compare("memory.dedicated", "memory", &want.dedicated_mb, &have.dedicated_mb, vm, |v| {
        Some(v.to_string())
    });
    let floating_param = if vm { "balloon" } else { "swap" };
    b.compare(
        "memory.floating",
        floating_param,
        &want.floating_mb,
        &have.floating_mb,
        false,
        |v| Some(v.to_string()),
    );
    if vm {
        b.compare("memory.shared", "ivshmem", &want.shared_mb, &have.shared_mb, true, |v| {
            (*v > 0).then(|| wire::encode_shared_memory(*v, vm_id))
        });
    }
}

/// Machine-level settings of virtual machines.
pub(crate) fn diff_machine(b: &mut DiffBuilder<'_>, desired: &CanonicalConfig, observed: &CanonicalConfig) {
    b.compare("bios", "bios", &desired.bios, &observed.bios, true, |v| Some(v.clone()));
    b.compare("machine", "machine", &desired.machine, &observed.machine, true, |v| non_empty(v));
    b.compare(
        "keyboard_layout",
        "keyboard",
        &desired.keyboard_layout,
        &observed.keyboard_layout,
        true,
        |v| non_empty(v),
    );
    b.compare("os_type", "ostype", &desired.os_type, &observed.os_type, true, |v| Some(v.clone()));
    b.compare("acpi", "acpi", &desired.acpi, &observed.acpi, true, flag);
    b.compare(
        "tablet_device",
        "tablet",
        &desired.tablet_device,
        &observed.tablet_device,
        true,
        flag,
    );
    b.compare(
        "scsi_hardware",
        "scsihw",
        &desired.scsi_hardware,
        &observed.scsi_hardware,
        true,
        |v| Some(v.clone()),
    );
    b.compare("agent", "agent", &desired.agent, &observed.agent, true, |v| {
        Some(wire::encode_agent(v))
    });

    // A derived order only means something when disks are managed.
    let derived_without_disks = desired.boot_order.is_provider_default() && desired.disks.is_empty();
    if !derived_without_disks {
        b.compare(
            "boot_order",
            "boot",
            &desired.boot_order,
            &observed.boot_order,
            true,
            |v| (!v.is_empty()).then(|| wire::encode_boot_order(v)),
        );
    }
}
