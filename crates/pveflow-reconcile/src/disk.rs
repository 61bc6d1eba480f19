//! Disk relocation manager
//!
//! Turns the difference between two disk maps into moves, resizes and
//! attachment updates. Disks are never shrunk or deleted here, and only
//! volumes owned by the instance are moved or resized.

use crate::error::ReconcileError;
use crate::intent::{Intent, Operation, Reason};
use pveflow_core::model::{DiskClass, StorageDevice};
use pveflow_core::wire;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskPlan {
    /// New attachments and option changes, applied with the config update
    pub updates: Vec<Intent>,
    pub moves: Vec<Intent>,
    pub resizes: Vec<Intent>,
    pub reboot_required: bool,
}

impl DiskPlan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.moves.is_empty() && self.resizes.is_empty()
    }
}

/// Plans disk changes of instance `vm_id`.
///
/// An empty desired map leaves disks unmanaged. A policy violation only
/// drops the change of the disk it concerns; the plan for every other disk
/// is returned alongside all violations found.
pub fn plan_disks(
    desired: &BTreeMap<String, StorageDevice>,
    observed: &BTreeMap<String, StorageDevice>,
    vm_id: u32,
) -> (DiskPlan, Vec<ReconcileError>) {
    let mut plan = DiskPlan::default();
    let mut errors = Vec::new();
    if desired.is_empty() {
        return (plan, errors);
    }

    for (interface, have) in observed {
        if !desired.contains_key(interface) {
            errors.push(ReconcileError::UnsupportedOperation(format!(
                "disk {} ({}) is not in the desired configuration; \
                 disk deletion must be performed explicitly outside this flow",
                interface,
                have.file_volume()
            )));
        }
    }

    for (interface, want) in desired {
        let Some(have) = observed.get(interface) else {
            plan.updates.push(Intent::update(
                format!("disks.{}", interface),
                interface,
                wire::encode_drive(want),
                Reason::Create,
            ));
            plan.reboot_required = true;
            continue;
        };

        let moving = want.datastore_id != have.datastore_id;
        let size_changes = want.size_gib != have.size_gib;

        if want.size_gib < have.size_gib {
            errors.push(ReconcileError::UnsupportedOperation(format!(
                "shrinking disk {} from {}G to {}G is not supported",
                interface, have.size_gib, want.size_gib
            )));
        } else if size_changes && want.class != DiskClass::Data {
            errors.push(ReconcileError::UnsupportedOperation(format!(
                "resizing {} is not supported",
                interface
            )));
        } else if size_changes {
            if have.is_owned_by(vm_id) {
                plan.resizes.push(Intent::new(
                    Operation::DiskResize {
                        interface: interface.clone(),
                        size_gib: want.size_gib,
                    },
                    Reason::DiskGrowth,
                ));
            } else {
                errors.push(ReconcileError::ownership("resize", have.file_volume(), vm_id));
            }
        }

        if moving {
            if have.is_owned_by(vm_id) {
                plan.moves.push(Intent::new(
                    Operation::DiskMove {
                        interface: interface.clone(),
                        target_datastore: want.datastore_id.clone(),
                        delete_original: true,
                    },
                    Reason::DiskMigration,
                ));
            } else {
                errors.push(ReconcileError::ownership("move", have.file_volume(), vm_id));
            }
        }

        if want.class == DiskClass::Data && !want.same_options(have) {
            let updated = StorageDevice {
                cache: want.cache.clone(),
                discard: want.discard.clone(),
                ssd: want.ssd,
                iothread: want.iothread,
                backup: want.backup,
                speed: want.speed.clone(),
                ..have.clone()
            };
            plan.updates.push(Intent::update(
                format!("disks.{}", interface),
                interface,
                wire::encode_drive(&updated),
                Reason::Drift,
            ));
            plan.reboot_required = true;
        }
    }

    (plan, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disks(devices: Vec<StorageDevice>) -> BTreeMap<String, StorageDevice> {
        devices.into_iter().map(|d| (d.interface.clone(), d)).collect()
    }

    fn owned(interface: &str, store: &str, size: u64) -> StorageDevice {
        StorageDevice::new(interface, store, size).with_path("vm-100-disk-0")
    }

    fn clean(
        desired: &BTreeMap<String, StorageDevice>,
        observed: &BTreeMap<String, StorageDevice>,
    ) -> DiskPlan {
        let (plan, errors) = plan_disks(desired, observed, 100);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        plan
    }

    #[test]
    fn test_equal_maps_plan_nothing() {
        let observed = disks(vec![owned("scsi0", "local-lvm", 32)]);
        let desired = disks(vec![StorageDevice::new("scsi0", "local-lvm", 32)]);
        let plan = clean(&desired, &observed);
        assert!(plan.is_empty());
        assert!(!plan.reboot_required);
    }

    #[test]
    fn test_shrink_is_rejected_without_resize() {
        let observed = disks(vec![owned("scsi0", "local-lvm", 32)]);
        let desired = disks(vec![StorageDevice::new("scsi0", "local-lvm", 16)]);
        let (plan, errors) = plan_disks(&desired, &observed, 100);
        assert!(plan.is_empty());
        assert!(matches!(&errors[..], [ReconcileError::UnsupportedOperation(msg)] if msg.contains("shrinking")));
    }

    #[test]
    fn test_grow_emits_resize() {
        let observed = disks(vec![owned("scsi0", "local-lvm", 32)]);
        let desired = disks(vec![StorageDevice::new("scsi0", "local-lvm", 64)]);
        let plan = clean(&desired, &observed);
        assert_eq!(
            plan.resizes[0].op,
            Operation::DiskResize {
                interface: "scsi0".to_string(),
                size_gib: 64
            }
        );
        assert!(plan.moves.is_empty());
    }

    #[test]
    fn test_move_requires_ownership() {
        let desired = disks(vec![StorageDevice::new("scsi0", "fast", 32)]);

        let mine = disks(vec![owned("scsi0", "local-lvm", 32)]);
        let plan = clean(&desired, &mine);
        assert_eq!(
            plan.moves[0].op,
            Operation::DiskMove {
                interface: "scsi0".to_string(),
                target_datastore: "fast".to_string(),
                delete_original: true
            }
        );

        let foreign = disks(vec![
            StorageDevice::new("scsi0", "local-lvm", 32).with_path("base-9000-disk-0/vm-100-disk-0"),
        ]);
        let (plan, errors) = plan_disks(&desired, &foreign, 100);
        assert!(plan.moves.is_empty());
        assert!(matches!(&errors[..], [ReconcileError::Ownership { action, .. }] if action == "move"));
    }

    #[test]
    fn test_resize_of_foreign_volume_is_rejected() {
        let observed = disks(vec![StorageDevice::new("scsi0", "local-lvm", 32).with_path("vm-9000-disk-0")]);
        let desired = disks(vec![StorageDevice::new("scsi0", "local-lvm", 40)]);
        let (plan, errors) = plan_disks(&desired, &observed, 100);
        assert!(plan.resizes.is_empty());
        assert!(matches!(&errors[..], [ReconcileError::Ownership { action, .. }] if action == "resize"));
    }

    #[test]
    fn test_missing_desired_disk_is_not_deleted() {
        let observed = disks(vec![owned("scsi0", "local-lvm", 32), owned("scsi1", "local-lvm", 8)]);
        let desired = disks(vec![StorageDevice::new("scsi0", "local-lvm", 32)]);
        let (plan, errors) = plan_disks(&desired, &observed, 100);
        assert!(plan.is_empty());
        assert!(matches!(&errors[..], [ReconcileError::UnsupportedOperation(msg)] if msg.contains("scsi1")));
    }

    #[test]
    fn test_all_violations_are_reported() {
        let observed = disks(vec![owned("scsi0", "local-lvm", 32), owned("scsi1", "local-lvm", 8)]);
        let desired = disks(vec![StorageDevice::new("scsi0", "local-lvm", 16)]);
        let (_, errors) = plan_disks(&desired, &observed, 100);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_violation_keeps_changes_of_other_disks() {
        let observed = disks(vec![owned("scsi0", "local-lvm", 32)]);
        let desired = disks(vec![
            StorageDevice::new("scsi0", "local-lvm", 16),
            StorageDevice::new("scsi1", "local-lvm", 8),
        ]);
        let (plan, errors) = plan_disks(&desired, &observed, 100);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            plan.updates,
            vec![Intent::update("disks.scsi1", "scsi1", "local-lvm:8", Reason::Create)]
        );
        assert!(plan.resizes.is_empty());
        assert!(plan.reboot_required);
    }

    #[test]
    fn test_efi_move_with_size_change_is_rejected() {
        let mut have = owned("efidisk0", "local-lvm", 1);
        have.class = DiskClass::Efi;
        let mut want = StorageDevice::new("efidisk0", "fast", 2);
        want.class = DiskClass::Efi;
        let (_, errors) = plan_disks(&disks(vec![want]), &disks(vec![have]), 100);
        assert!(matches!(&errors[..], [ReconcileError::UnsupportedOperation(_)]));
    }

    #[test]
    fn test_new_disk_is_attached() {
        let observed = disks(vec![owned("scsi0", "local-lvm", 32)]);
        let desired = disks(vec![
            StorageDevice::new("scsi0", "local-lvm", 32),
            StorageDevice::new("scsi1", "fast", 100),
        ]);
        let plan = clean(&desired, &observed);
        assert_eq!(
            plan.updates,
            vec![Intent::update("disks.scsi1", "scsi1", "fast:100", Reason::Create)]
        );
        assert!(plan.reboot_required);
    }

    #[test]
    fn test_option_change_reencodes_existing_volume() {
        let observed = disks(vec![owned("scsi0", "local-lvm", 32)]);
        let mut want = StorageDevice::new("scsi0", "local-lvm", 32);
        want.iothread = true;
        want.discard = Some("on".to_string());
        let plan = clean(&disks(vec![want]), &observed);
        assert_eq!(
            plan.updates,
            vec![Intent::update(
                "disks.scsi0",
                "scsi0",
                "local-lvm:vm-100-disk-0,discard=on,iothread=1",
                Reason::Drift
            )]
        );
        assert!(plan.reboot_required);
    }

    #[test]
    fn test_empty_desired_leaves_disks_unmanaged() {
        let observed = disks(vec![owned("scsi0", "local-lvm", 32)]);
        let plan = clean(&BTreeMap::new(), &observed);
        assert!(plan.is_empty());
    }
}
