use crate::constants::{MAX_IFACE_NAME_LEN, TAP_NAME_PREFIX};

const ORDINAL_SECONDARY_PREFIX: &str = "net";

/// Name of the tap device created for a pod interface.
///
/// Ordinal names (`net1`) map to `tap1`. Any other name keeps everything
/// after its three character prefix, so `eth0` maps to `tap0` and the hashed
/// `pod16477688c0e` maps to `tap16477688c0e`.
pub fn tap_device_name(pod_iface_name: &str) -> String {
    let suffix = match ordinal_index(pod_iface_name) {
        Some(index) => index,
        None => pod_iface_name.get(3..).unwrap_or_default(),
    };
    let mut name = format!("{}{}", TAP_NAME_PREFIX, suffix);
    truncate_iface_name(&mut name);
    name
}

fn ordinal_index(name: &str) -> Option<&str> {
    name.strip_prefix(ORDINAL_SECONDARY_PREFIX)
        .filter(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

fn truncate_iface_name(name: &mut String) {
    if name.len() <= MAX_IFACE_NAME_LEN {
        return;
    }
    let mut end = MAX_IFACE_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
}
