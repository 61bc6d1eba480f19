use crate::intent::{Intent, Reason};
use crate::planner::fields::DiffBuilder;
use pveflow_core::model::{IpConfig, NetworkDevice};
use pveflow_core::{wire, Field};

/// Slot-keyed network diff.
///
/// A network list the user never declared is left alone. Disabled slots and
/// observed slots beyond the desired count each become one delete.
pub(crate) fn diff_networks(
    b: &mut DiffBuilder<'_>,
    desired: &Field<Vec<NetworkDevice>>,
    observed: &Field<Vec<NetworkDevice>>,
) {
    diff_slots(
        b,
        desired,
        observed,
        |_, want, have| want.satisfied_by(have),
        |_, device| wire::encode_network_device(device),
    );
}

/// Container slots also carry the IP settings of their guest interface.
///
/// Without an `initialization` block the observed IP settings are kept.
pub(crate) fn diff_container_networks(
    b: &mut DiffBuilder<'_>,
    desired: &Field<Vec<NetworkDevice>>,
    observed: &Field<Vec<NetworkDevice>>,
    want_ips: Option<&[IpConfig]>,
    have_ips: &[IpConfig],
) {
    let empty = IpConfig::default();
    let have_ip = |slot: usize| have_ips.get(slot).unwrap_or(&empty);
    let want_ip = |slot: usize| match want_ips {
        Some(ips) => ips.get(slot).unwrap_or(&empty),
        None => have_ip(slot),
    };

    diff_slots(
        b,
        desired,
        observed,
        |slot, want, have| want.satisfied_by(have) && want_ip(slot) == have_ip(slot),
        |slot, device| wire::encode_container_network(slot, device, Some(want_ip(slot))),
    );
}

fn diff_slots(
    b: &mut DiffBuilder<'_>,
    desired: &Field<Vec<NetworkDevice>>,
    observed: &Field<Vec<NetworkDevice>>,
    satisfied: impl Fn(usize, &NetworkDevice, &NetworkDevice) -> bool,
    encode: impl Fn(usize, &NetworkDevice) -> String,
) {
    if desired.is_provider_default() {
        return;
    }
    let (want, have) = (desired.value(), observed.value());

    for (slot, device) in want.iter().enumerate() {
        let param = format!("net{}", slot);
        let current = have.get(slot).filter(|d| d.enabled);

        let intent = match (device.enabled, current) {
            (false, Some(_)) => Intent::delete(&param, Reason::Disabled),
            (false, None) => continue,
            (true, None) => Intent::update(
                format!("network_devices[{}]", slot),
                &param,
                encode(slot, device),
                Reason::Create,
            ),
            (true, Some(current)) if satisfied(slot, device, current) => continue,
            (true, Some(current)) => {
                let mut updated = device.clone();
                if updated.mac_address.is_none() {
                    updated.mac_address = current.mac_address.clone();
                }
                Intent::update(
                    format!("network_devices[{}]", slot),
                    &param,
                    encode(slot, &updated),
                    Reason::Drift,
                )
            }
        };
        b.push_restart(intent);
    }

    for (slot, device) in have.iter().enumerate().skip(want.len()) {
        if device.enabled {
            b.push_restart(Intent::delete(format!("net{}", slot), Reason::Prune));
        }
    }
}
