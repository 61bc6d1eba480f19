//! Cloud-init drive placement
//!
//! The cloud-init image sits on a cdrom bus slot that cannot be swapped while
//! the instance runs. Moving it to another slot or datastore is a detach
//! followed by an attach inside a stopped window opened by the scheduler.

use crate::intent::{Intent, Reason};
use pveflow_core::model::{
    CloudInitConfig, CloudInitDns, IpConfig, UserAccount, DEFAULT_CLOUD_INIT_INTERFACE,
    MASKED_PASSWORD,
};
use pveflow_core::wire;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudInitPlan {
    /// Drive has to be (re)attached, which needs a stopped instance
    pub relocation: bool,
    pub detach: Vec<Intent>,
    pub attach: Option<Intent>,
    /// User, DNS and IP settings
    pub updates: Vec<Intent>,
    pub reboot_required: bool,
}

impl CloudInitPlan {
    pub fn is_empty(&self) -> bool {
        self.detach.is_empty() && self.attach.is_none() && self.updates.is_empty()
    }
}

/// Plans placement and data of the cloud-init drive.
///
/// `occupied` lists every bus slot holding a drive on the observed side.
pub fn plan_cloud_init(
    desired: Option<&CloudInitConfig>,
    observed: Option<&CloudInitConfig>,
    occupied: &BTreeSet<String>,
) -> CloudInitPlan {
    let mut plan = CloudInitPlan::default();
    let Some(want) = desired else {
        return plan;
    };

    let existing_slot = observed.and_then(|o| o.interface.as_deref());
    let target_slot = want
        .interface
        .as_deref()
        .or(existing_slot)
        .unwrap_or(DEFAULT_CLOUD_INIT_INTERFACE);

    let datastore_changes = observed.is_some_and(|o| o.datastore_id != want.datastore_id);
    plan.relocation = existing_slot != Some(target_slot) || datastore_changes;

    if plan.relocation {
        if let Some(slot) = existing_slot {
            plan.detach.push(Intent::delete(slot, Reason::CloudInitDetach));
        }
        if existing_slot != Some(target_slot) && occupied.contains(target_slot) {
            plan.detach.push(Intent::delete(target_slot, Reason::CloudInitDetach));
        }
        plan.attach = Some(Intent::update(
            "cloud_init.interface",
            target_slot,
            format!("{}:cloudinit,media=cdrom", want.datastore_id),
            Reason::CloudInitAttach,
        ));
        tracing::debug!(
            "Relocating cloud-init drive {:?} -> {} on {}",
            existing_slot,
            target_slot,
            want.datastore_id
        );
    }

    let empty = CloudInitConfig::new(String::new());
    let have = observed.unwrap_or(&empty);
    if let Some(user) = &want.user_account {
        diff_user(&mut plan.updates, user, have.user_account.as_ref());
    }
    if let Some(dns) = &want.dns {
        diff_dns(&mut plan.updates, dns, have.dns.as_ref());
    }
    diff_ip_configs(&mut plan.updates, &want.ip_configs, &have.ip_configs);

    plan.reboot_required = plan.relocation || !plan.updates.is_empty();
    plan
}

/// Containers keep DNS settings as plain config keys. IP settings travel
/// with their network slot and are planned there.
pub fn plan_container_dns(
    desired: Option<&CloudInitConfig>,
    observed: Option<&CloudInitConfig>,
) -> CloudInitPlan {
    let mut plan = CloudInitPlan::default();
    if let Some(dns) = desired.and_then(|d| d.dns.as_ref()) {
        diff_dns(&mut plan.updates, dns, observed.and_then(|o| o.dns.as_ref()));
    }
    plan.reboot_required = !plan.updates.is_empty();
    plan
}

fn set_or_delete(
    updates: &mut Vec<Intent>,
    field: &str,
    param: &str,
    want: Option<String>,
    have: Option<String>,
) {
    if want == have {
        return;
    }
    match want {
        Some(value) => updates.push(Intent::update(field, param, value, Reason::Drift)),
        None => updates.push(Intent::delete(param, Reason::Cleared)),
    }
}

fn diff_user(updates: &mut Vec<Intent>, want: &UserAccount, have: Option<&UserAccount>) {
    let empty = UserAccount::default();
    let have = have.unwrap_or(&empty);

    set_or_delete(
        updates,
        "cloud_init.user_account.username",
        "ciuser",
        want.username.clone(),
        have.username.clone(),
    );

    // The stored password is masked on read; only a missing one is drift.
    let password_known = have.password.is_some() || want.password.is_none();
    let stored_is_masked = have.password.as_deref() == Some(MASKED_PASSWORD);
    if !(password_known && (stored_is_masked || want.password == have.password)) {
        set_or_delete(
            updates,
            "cloud_init.user_account.password",
            "cipassword",
            want.password.clone(),
            have.password.clone(),
        );
    }

    let keys = |k: &[String]| (!k.is_empty()).then(|| k.join("\n"));
    set_or_delete(
        updates,
        "cloud_init.user_account.keys",
        "sshkeys",
        keys(want.keys.as_slice()),
        keys(have.keys.as_slice()),
    );
}

fn diff_dns(updates: &mut Vec<Intent>, want: &CloudInitDns, have: Option<&CloudInitDns>) {
    let empty = CloudInitDns::default();
    let have = have.unwrap_or(&empty);
    set_or_delete(
        updates,
        "cloud_init.dns.domain",
        "searchdomain",
        want.domain.clone(),
        have.domain.clone(),
    );
    let servers = |s: &[String]| (!s.is_empty()).then(|| s.join(" "));
    set_or_delete(
        updates,
        "cloud_init.dns.servers",
        "nameserver",
        servers(want.servers.as_slice()),
        servers(have.servers.as_slice()),
    );
}

fn diff_ip_configs(updates: &mut Vec<Intent>, want: &[IpConfig], have: &[IpConfig]) {
    let encode = |c: Option<&IpConfig>| {
        c.filter(|c| !c.is_empty())
            .map(wire::encode_ip_config)
    };
    for i in 0..want.len().max(have.len()) {
        set_or_delete(
            updates,
            &format!("cloud_init.ip_config[{}]", i),
            &format!("ipconfig{}", i),
            encode(want.get(i)),
            encode(have.get(i)),
        );
    }
}
