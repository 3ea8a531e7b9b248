// Fabric: Virtual Topology Binding for Network Test Beds
// Copyright (C) 2021  Tibor Schneider
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! # Identifier Derivation
//!
//! Deterministic, collision-resistant names for bridges, veth ends and temporary interfaces.
//! Linux limits interface names to 15 bytes, so every derived name must fit that budget no matter
//! how long the vm-set or VM host names grow.

use crate::{Error, Result};
use md5::{Digest, Md5};

/// Maximum length of a Linux interface name, in bytes.
pub const MAX_INTF_LEN: usize = 15;

/// Name of the management port inside the PTF container and the netns.
pub const MGMT_PORT_NAME: &str = "mgmt";

/// Name of the backplane port inside the PTF container.
pub const BP_PORT_NAME: &str = "backplane";

const FINGERPRINT_LEN: usize = 6;
const TEMP_SUFFIX: &str = "_t";

/// Derive an interface or bridge name of at most [`MAX_INTF_LEN`] bytes.
///
/// The name has the shape `<leading>-<host>-<index>` where `<leading>` is the first
/// `-`-separated token of the template, truncated to whatever space `-<host>-<index>` leaves.
///
/// ```
/// # use fabric::names::adaptive_name;
/// assert_eq!(adaptive_name("inje", "vms7-6", 21), "inje-vms7-6-21");
/// assert_eq!(adaptive_name("inje", "vms21-1", 121), "inj-vms21-1-121");
/// assert_eq!(adaptive_name("inje", "vms121-1", 121), "in-vms121-1-121");
/// ```
pub fn adaptive_name(template: &str, host: &str, index: usize) -> String {
    let host_index = format!("-{}-{}", host, index);
    let leading_len = MAX_INTF_LEN.saturating_sub(host_index.len());
    let leading: String = template
        .split('-')
        .next()
        .unwrap_or("")
        .chars()
        .take(leading_len)
        .collect();
    format!("{}{}", leading, host_index)
}

/// Derive a temporary interface name for `interface_name`, unique per vm set.
///
/// Several invocations for different vm sets may run concurrently on one host, and their final
/// interface names (`eth0`, `mgmt`, ...) are only unique *inside* their target namespace. The
/// temporary name used before migration therefore mixes in a fingerprint of the owning PTF
/// container name. `reserved` bytes are subtracted from the budget when the caller needs room for
/// a VLAN sub-interface suffix on top of the temporary name.
pub fn adaptive_temporary_name(
    vm_set_name: &str,
    interface_name: &str,
    reserved: usize,
) -> Result<String> {
    let budget = MAX_INTF_LEN.saturating_sub(reserved);
    if budget < FINGERPRINT_LEN + TEMP_SUFFIX.len() {
        return Err(Error::InvalidConfig(format!(
            "Requested length is too short to get temporary interface name for {}",
            interface_name
        )));
    }
    let ptf_name = ptf_container_name(vm_set_name);
    if interface_name.len() <= budget - TEMP_SUFFIX.len() - FINGERPRINT_LEN {
        Ok(format!(
            "{}{}{}",
            fingerprint(&ptf_name, FINGERPRINT_LEN),
            interface_name,
            TEMP_SUFFIX
        ))
    } else {
        Ok(format!(
            "{}{}",
            fingerprint(&format!("{}{}", ptf_name, interface_name), FINGERPRINT_LEN),
            TEMP_SUFFIX
        ))
    }
}

/// First `digits` hex characters of the MD5 digest of `name`.
pub fn fingerprint(name: &str, digits: usize) -> String {
    let mut hasher = Md5::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..digits.min(hex.len())].to_string()
}

/// Per-VM front-panel OVS bridge: `br-<vm>-<idx>`.
pub fn fp_bridge_name(vm: &str, fp_index: usize) -> String {
    adaptive_name("br", vm, fp_index)
}

/// Regex matching all front-panel bridges of one VM.
pub fn fp_bridge_regex(vm: &str) -> String {
    format!(r"br-{}-[0-9]+", vm)
}

/// Front-panel tap of a VM: `<vm>-t<idx>`.
pub fn vm_tap_name(vm: &str, fp_index: usize) -> String {
    format!("{}-t{}", vm, fp_index)
}

/// Backplane tap of a VM: `<vm>-back`.
pub fn vm_backplane_tap_name(vm: &str) -> String {
    format!("{}-back", vm)
}

/// Injected front-panel port (root-namespace end): `inje-<vm_set>-<ptf_index>`.
pub fn injected_iface_name(vm_set_name: &str, ptf_index: usize) -> String {
    adaptive_name("inje", vm_set_name, ptf_index)
}

/// Mux-cable host-facing port: `muxy-<vm_set>-<idx>`.
pub fn muxy_iface_name(vm_set_name: &str, host_ifindex: usize) -> String {
    adaptive_name("muxy", vm_set_name, host_ifindex)
}

/// Active-active host-facing port: `iaa-<vm_set>-<idx>`.
pub fn active_active_iface_name(vm_set_name: &str, host_ifindex: usize) -> String {
    adaptive_name("iaa", vm_set_name, host_ifindex)
}

/// Simulated server-NIC port of an active-active cable: `nic-<vm_set>-<idx>`.
pub fn nic_iface_name(vm_set_name: &str, host_ifindex: usize) -> String {
    adaptive_name("nic", vm_set_name, host_ifindex)
}

/// Mux-cable bridge: `mbr-<vm_set>-<idx>`.
pub fn muxy_bridge_name(vm_set_name: &str, host_ifindex: usize) -> String {
    adaptive_name("mbr", vm_set_name, host_ifindex)
}

/// Active-active cable bridge: `baa-<vm_set>-<idx>`.
pub fn active_active_bridge_name(vm_set_name: &str, host_ifindex: usize) -> String {
    adaptive_name("baa", vm_set_name, host_ifindex)
}

/// Network namespace of a vm set: `ns-<vm_set>`.
pub fn netns_name(vm_set_name: &str) -> String {
    format!("ns-{}", vm_set_name)
}

/// Interface name inside the netns or the PTF container: `eth<idx>`.
pub fn eth_iface_name(index: usize) -> String {
    format!("eth{}", index)
}

/// PTF container name: `ptf_<vm_set>`.
pub fn ptf_container_name(vm_set_name: &str) -> String {
    format!("ptf_{}", vm_set_name)
}

/// Root-namespace end of the PTF management veth: `ptf-<vm_set>-m`.
pub fn ptf_mgmt_iface_name(vm_set_name: &str) -> String {
    format!("ptf-{}-m", vm_set_name)
}

/// Root-namespace end of the netns management veth: `ns-<vm_set>-m`.
pub fn netns_mgmt_iface_name(vm_set_name: &str) -> String {
    format!("ns-{}-m", vm_set_name)
}

/// Root-namespace end of the PTF backplane veth: `ptf-<vm_set>-b`.
pub fn ptf_backplane_iface_name(vm_set_name: &str) -> String {
    format!("ptf-{}-b", vm_set_name)
}

/// Backplane bridge of a vm set: `br-b-<vm_set>`.
pub fn backplane_bridge_name(vm_set_name: &str) -> String {
    format!("br-b-{}", vm_set_name)
}

/// Device-interconnect bridge: `bic-<vm_set>-<link>`.
pub fn interconnect_bridge_name(vm_set_name: &str, link_index: &str) -> String {
    format!("bic-{}-{}", vm_set_name, link_index)
}

/// Virtual-chassis inband bridge: `br-<vm_set>-inb`.
pub fn vs_chassis_inband_bridge_name(vm_set_name: &str) -> String {
    format!("br-{}-inb", vm_set_name)
}

/// Virtual-chassis midplane bridge: `br-<vm_set>-mid`.
pub fn vs_chassis_midplane_bridge_name(vm_set_name: &str) -> String {
    format!("br-{}-mid", vm_set_name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn adaptive_name_within_budget() {
        assert_eq!(adaptive_name("inje", "vms7-6", 21), "inje-vms7-6-21");
        assert_eq!(adaptive_name("muxy", "vms7-6", 3), "muxy-vms7-6-3");
        // full templates also work, only the leading token matters
        assert_eq!(adaptive_name("br-%s-%d", "vms7-6", 0), "br-vms7-6-0");
    }

    #[test]
    fn adaptive_name_truncates_leading_token() {
        let name = adaptive_name("inje", "vms121-1", 121);
        assert_eq!(name, "in-vms121-1-121");
        assert_eq!(name.len(), MAX_INTF_LEN);
        assert!(name.ends_with("-vms121-1-121"));
    }

    #[test]
    fn temporary_name_is_deterministic() {
        let a = adaptive_temporary_name("vms7-6", "eth4", 0).unwrap();
        let b = adaptive_temporary_name("vms7-6", "eth4", 0).unwrap();
        assert_eq!(a, b);
        assert!(a.len() <= MAX_INTF_LEN);
        assert!(a.ends_with("eth4_t"));
    }

    #[test]
    fn temporary_name_differs_per_interface() {
        let a = adaptive_temporary_name("vms7-6", "eth4", 0).unwrap();
        let b = adaptive_temporary_name("vms7-6", "eth5", 0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn temporary_name_differs_per_vm_set() {
        let a = adaptive_temporary_name("vms7-6", "eth4", 0).unwrap();
        let b = adaptive_temporary_name("vms7-7", "eth4", 0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn temporary_name_hashes_long_interfaces() {
        // too long to keep the original name next to the fingerprint
        let name = adaptive_temporary_name("vms7-6", "eth100500", 0).unwrap();
        assert_eq!(name.len(), FINGERPRINT_LEN + TEMP_SUFFIX.len());
        assert!(name.ends_with(TEMP_SUFFIX));
    }

    #[test]
    fn temporary_name_respects_reserved_space() {
        let name = adaptive_temporary_name("vms7-6", "eth4", 3).unwrap();
        assert!(name.len() <= MAX_INTF_LEN - 3);
    }

    #[test]
    fn temporary_name_budget_too_small() {
        assert!(adaptive_temporary_name("vms7-6", "eth4", 10).is_err());
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let f = fingerprint("ptf_vms7-6", 6);
        assert_eq!(f.len(), 6);
        assert_eq!(f, fingerprint("ptf_vms7-6", 6));
        assert!(f.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derived_names_fit_the_limit() {
        for name in &[
            fp_bridge_name("vms121-121", 3),
            injected_iface_name("longsets", 999),
            muxy_bridge_name("longsets", 999),
            active_active_bridge_name("longsets", 999),
            nic_iface_name("longsets", 999),
        ] {
            assert!(name.len() <= MAX_INTF_LEN, "{} too long", name);
        }
    }
}
