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

//! # Declarative Topology Model
//!
//! The topology description maps logical VM names, VM-to-VM links, host-facing interfaces and
//! DUT-to-DUT interconnects onto port references. It is deserialized fresh on every invocation
//! and validated before any network object is touched.

use crate::{Error, Result};

use regex::Regex;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// # Port Reference
///
/// Addresses one logical port: vlan `vlan_index` on DUT `dut_index`, visible in the PTF container
/// as port `ptf_index`. The legacy single-DUT form is a bare integer `v`, equivalent to
/// `(0, v, v)`; the multi-DUT form is the string `"<dut>.<vlan>@<ptf>"` where `@<ptf>` is
/// optional and defaults to the vlan index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    /// Index into the DUT name list.
    pub dut_index: usize,
    /// Front-panel vlan index on that DUT.
    pub vlan_index: usize,
    /// Port index inside the PTF container.
    pub ptf_index: usize,
    qualified: bool,
    explicit_ptf: bool,
}

impl PortRef {
    /// The legacy single-DUT form: vlan `v` on DUT 0, PTF port `v`.
    pub fn single(vlan_index: usize) -> Self {
        Self {
            dut_index: 0,
            vlan_index,
            ptf_index: vlan_index,
            qualified: false,
            explicit_ptf: false,
        }
    }

    /// Whether the reference was written in the multi-DUT `"d.v[@p]"` form.
    pub fn is_qualified(&self) -> bool {
        self.qualified
    }

    /// Whether the PTF index was given explicitly with `@p`.
    pub fn has_explicit_ptf(&self) -> bool {
        self.explicit_ptf
    }

    /// Key identifying the physical port, used for duplicate detection.
    pub fn key(&self) -> (usize, usize) {
        (self.dut_index, self.vlan_index)
    }
}

impl FromStr for PortRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let re = Regex::new(r"^(\d+)\.(\d+)(?:@(\d+))?$").unwrap();
        let caps = re.captures(s.trim()).ok_or_else(|| {
            Error::InvalidTopology(format!(
                "port reference must have the format '<dut>.<vlan>[@<ptf>]', got: {}",
                s
            ))
        })?;
        let dut_index: usize = caps[1].parse().unwrap();
        let vlan_index: usize = caps[2].parse().unwrap();
        let (ptf_index, explicit_ptf) = match caps.get(3) {
            Some(p) => (p.as_str().parse().unwrap(), true),
            None => (vlan_index, false),
        };
        Ok(Self {
            dut_index,
            vlan_index,
            ptf_index,
            qualified: true,
            explicit_ptf,
        })
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.dut_index, self.vlan_index, self.ptf_index)
    }
}

impl<'de> Deserialize<'de> for PortRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        struct PortRefVisitor;

        impl<'de> Visitor<'de> for PortRefVisitor {
            type Value = PortRef;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or a '<dut>.<vlan>[@<ptf>]' string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> core::result::Result<PortRef, E> {
                Ok(PortRef::single(v as usize))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> core::result::Result<PortRef, E> {
                if v < 0 {
                    return Err(E::custom("port reference cannot be negative"));
                }
                Ok(PortRef::single(v as usize))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> core::result::Result<PortRef, E> {
                PortRef::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(PortRefVisitor)
    }
}

/// # Host-facing interface
///
/// Either a single uplink to one DUT, or the two legs of a dual-ToR Y-cable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostInterface {
    /// One port on one DUT.
    Port(PortRef),
    /// Two ports, one per ToR, forming one logical host interface.
    Dual(PortRef, PortRef),
}

impl HostInterface {
    /// The first (or only) leg of the interface.
    pub fn first(&self) -> &PortRef {
        match self {
            HostInterface::Port(p) => p,
            HostInterface::Dual(a, _) => a,
        }
    }

    /// All legs of the interface.
    pub fn ports(&self) -> Vec<&PortRef> {
        match self {
            HostInterface::Port(p) => vec![p],
            HostInterface::Dual(a, b) => vec![a, b],
        }
    }

    /// Whether this is a dual-ToR interface.
    pub fn is_dual(&self) -> bool {
        matches!(self, HostInterface::Dual(_, _))
    }

    /// PTF-side index of the interface.
    ///
    /// A bare integer or an explicit `@p` wins; a qualified reference without `@p` falls back to
    /// the position of the interface in the host-interface list (no gaps assumed).
    pub fn host_ifindex(&self, position: usize) -> usize {
        let first = self.first();
        if !first.qualified || first.explicit_ptf {
            first.ptf_index
        } else {
            position
        }
    }
}

impl<'de> Deserialize<'de> for HostInterface {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        struct HostInterfaceVisitor;

        fn from_ports<E: de::Error>(
            ports: Vec<PortRef>,
        ) -> core::result::Result<HostInterface, E> {
            match ports.len() {
                1 => Ok(HostInterface::Port(ports[0])),
                2 => Ok(HostInterface::Dual(ports[0], ports[1])),
                n => Err(E::custom(format!(
                    "a host interface consists of one or two ports, got {}",
                    n
                ))),
            }
        }

        impl<'de> Visitor<'de> for HostInterfaceVisitor {
            type Value = HostInterface;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer, a '<dut>.<vlan>[@<ptf>]' string (optionally comma separated) or a list of ports")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> core::result::Result<HostInterface, E> {
                Ok(HostInterface::Port(PortRef::single(v as usize)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> core::result::Result<HostInterface, E> {
                if v < 0 {
                    return Err(E::custom("host interface cannot be negative"));
                }
                Ok(HostInterface::Port(PortRef::single(v as usize)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> core::result::Result<HostInterface, E> {
                let ports = v
                    .split(',')
                    .map(|p| PortRef::from_str(p).map_err(E::custom))
                    .collect::<core::result::Result<Vec<_>, E>>()?;
                from_ports(ports)
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> core::result::Result<HostInterface, A::Error> {
                let mut ports = Vec::new();
                while let Some(port) = seq.next_element::<PortRef>()? {
                    ports.push(port);
                }
                from_ports(ports)
            }
        }

        deserializer.deserialize_any(HostInterfaceVisitor)
    }
}

/// Attributes of one logical VM (or DPU) in the topology.
#[derive(Debug, Clone, Deserialize)]
pub struct VmAttrs {
    /// Front-panel ports of the VM, in front-panel order.
    pub vlans: Vec<PortRef>,
    /// Index of the VM relative to `vm_base`.
    pub vm_offset: usize,
}

/// A direct VM-to-VM link wired through a dedicated bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct VmLink {
    /// Offset of the first endpoint VM.
    pub start_vm_offset: usize,
    /// Port index on the first endpoint VM.
    pub start_vm_port_idx: usize,
    /// Offset of the second endpoint VM.
    pub end_vm_offset: usize,
    /// Port index on the second endpoint VM.
    pub end_vm_port_idx: usize,
    /// When set to 1, the link is wired through an OVS bridge instead of a plain bridge.
    #[serde(default)]
    pub use_ovs: u8,
}

impl VmLink {
    /// Whether the link is wired through OVS.
    pub fn uses_ovs(&self) -> bool {
        self.use_ovs == 1
    }
}

/// A VM-to-VM link with injected PTF ports, always wired through an OVS bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct OvsLink {
    /// Offset of the first endpoint VM.
    pub start_vm_offset: usize,
    /// Port index on the first endpoint VM.
    pub start_vm_port_idx: usize,
    /// Offset of the second endpoint VM.
    pub end_vm_offset: usize,
    /// Port index on the second endpoint VM.
    pub end_vm_port_idx: usize,
    /// Injected ports attached to the link bridge.
    pub vlans: Vec<PortRef>,
}

/// One named vlan group of a back-end ToR vlan configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VlanGroup {
    /// The 802.1Q vlan id.
    pub id: u64,
    /// Host interfaces that are members of the vlan.
    pub intfs: Vec<u64>,
}

/// The `vlan_configs` section of the DUT properties.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VlanConfigs {
    /// Name of the vlan configuration in effect.
    #[serde(default)]
    pub default_vlan_config: Option<String>,
    /// Named vlan configurations: config name -> vlan name -> group.
    #[serde(flatten)]
    pub configs: BTreeMap<String, BTreeMap<String, VlanGroup>>,
}

/// DUT-wide properties of the topology.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DutProperties {
    /// Back-end ToR vlan configurations.
    #[serde(default)]
    pub vlan_configs: Option<VlanConfigs>,
    /// Separator between a port name and its vlan sub-interface id.
    #[serde(default)]
    pub sub_interface_separator: Option<String>,
}

/// Per-VM property overrides supplied by the environment (not part of the topology file).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmProperties {
    /// Role of the DUT this VM neighbors (e.g. `BackEndToRRouter`).
    #[serde(default)]
    pub dut_type: Option<String>,
    /// Role of the VM itself.
    #[serde(default)]
    pub device_type: Option<String>,
    /// Separator for vlan sub-interfaces on the injected ports of this VM.
    #[serde(default)]
    pub sub_interface_separator: Option<String>,
    /// Vlan id for vlan sub-interfaces on the injected ports of this VM.
    #[serde(default)]
    pub sub_interface_vlan_id: Option<String>,
}

/// Simulated NIC addresses of one active-active host interface, produced by the external
/// mux-facts generator.
#[derive(Debug, Clone, Deserialize)]
pub struct MuxCableFact {
    /// IPv4 address (with prefix length) of the simulated SoC.
    pub soc_ipv4: String,
}

/// Device type requiring vlan sub-interfaces on host and injected ports.
pub const BACKEND_TOR_TYPE: &str = "BackEndToRRouter";
/// Neighbor device type requiring vlan sub-interfaces on injected ports.
pub const BACKEND_LEAF_TYPE: &str = "BackEndLeafRouter";
/// Default separator between port name and vlan sub-interface id.
pub const SUB_INTERFACE_SEPARATOR: &str = ".";
/// Default vlan id of vlan sub-interfaces.
pub const SUB_INTERFACE_VLAN_ID: &str = "10";

/// # Declarative topology
///
/// The full topology description, deserialized from the topology file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Topology {
    /// Logical VM name -> attributes.
    #[serde(rename = "VMs", default)]
    pub vms: BTreeMap<String, VmAttrs>,
    /// Logical DPU name -> attributes (DPU testbeds only).
    #[serde(rename = "DPUs", default)]
    pub dpus: BTreeMap<String, VmAttrs>,
    /// Direct VM-to-VM links.
    #[serde(rename = "VM_LINKs", default)]
    pub vm_links: BTreeMap<String, VmLink>,
    /// VM-to-VM links with injected PTF ports.
    #[serde(rename = "OVS_LINKs", default)]
    pub ovs_links: BTreeMap<String, OvsLink>,
    /// Host-facing interfaces, in PTF port order.
    #[serde(default)]
    pub host_interfaces: Vec<HostInterface>,
    /// Host interfaces which are administratively disabled on the DUT.
    #[serde(default)]
    pub disabled_host_interfaces: Vec<HostInterface>,
    /// The subset of `host_interfaces` emulating active-active dual uplinks.
    #[serde(default)]
    pub host_interfaces_active_active: Vec<HostInterface>,
    /// DUT-to-DUT direct links: link index -> the two endpoint ports.
    #[serde(default)]
    pub devices_interconnect_interfaces: BTreeMap<String, Vec<PortRef>>,
    /// DUT-wide properties.
    #[serde(rename = "DUT", default)]
    pub dut: Option<DutProperties>,
}

impl Topology {
    /// Parse a topology from its JSON representation.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Build the interface -> vlan-id map of the default vlan configuration.
    ///
    /// Required for back-end ToR topologies, where every enabled host port gets a vlan
    /// sub-interface inside the PTF container.
    pub fn vlan_ids(&self) -> Result<BTreeMap<String, String>> {
        let vlan_configs = self
            .dut
            .as_ref()
            .and_then(|d| d.vlan_configs.as_ref())
            .ok_or_else(|| Error::InvalidTopology("Topology has no vlan configs.".to_string()))?;
        let default = vlan_configs
            .default_vlan_config
            .as_ref()
            .ok_or_else(|| Error::InvalidTopology("Topology has no default vlan config.".to_string()))?;
        let config = vlan_configs.configs.get(default).ok_or_else(|| {
            Error::InvalidTopology(format!(
                "Topology has no definition for default vlan config {}",
                default
            ))
        })?;
        let mut vlan_ids = BTreeMap::new();
        for vlan in config.values() {
            for intf in &vlan.intfs {
                vlan_ids.insert(intf.to_string(), vlan.id.to_string());
            }
        }
        Ok(vlan_ids)
    }

    /// Separator between port name and vlan sub-interface id for host ports.
    pub fn sub_interface_separator(&self) -> &str {
        self.dut
            .as_ref()
            .and_then(|d| d.sub_interface_separator.as_deref())
            .unwrap_or(SUB_INTERFACE_SEPARATOR)
    }
}

fn check_port_form(port: &PortRef, is_multi_duts: bool, what: &str) -> Result<()> {
    if is_multi_duts && !port.is_qualified() {
        return Err(Error::InvalidTopology(format!(
            "{} should be a list of strings of format '<dut>.<vlan>[@<ptf>]'",
            what
        )));
    }
    if !is_multi_duts && port.is_qualified() {
        return Err(Error::InvalidTopology(format!(
            "{} should be a list of non-negative integers",
            what
        )));
    }
    Ok(())
}

/// Validate the topology before anything is created on the host.
///
/// Checks the form of every port reference against the single/multi DUT mode, and rejects any
/// vlan or host port that is referenced twice anywhere in `host_interfaces` or a VM vlan list.
/// Returns whether host interfaces and VMs are declared.
pub fn check_topo(topo: &Topology, is_multi_duts: bool) -> Result<(bool, bool)> {
    let mut all_intfs: HashSet<(usize, usize)> = HashSet::new();
    let mut hostif_exists = false;
    let mut vms_exists = false;

    if !topo.host_interfaces.is_empty() {
        for intf in &topo.host_interfaces {
            for port in intf.ports() {
                check_port_form(port, is_multi_duts, "topo['host_interfaces']")?;
                if !all_intfs.insert(port.key()) {
                    return Err(Error::InvalidTopology(format!(
                        "topo['host_interfaces'] double use of host interface: {}",
                        port
                    )));
                }
            }
        }
        hostif_exists = true;
    }

    if !topo.vms.is_empty() {
        for (hostname, attrs) in &topo.vms {
            for vlan in &attrs.vlans {
                check_port_form(
                    vlan,
                    is_multi_duts,
                    &format!("topo['VMs'][{}]['vlans']", hostname),
                )?;
                if !all_intfs.insert(vlan.key()) {
                    return Err(Error::InvalidTopology(format!(
                        "topo['VMs'][{}]['vlans'] double use of vlan: {}",
                        hostname, vlan
                    )));
                }
            }
        }
        vms_exists = true;
    }

    Ok((hostif_exists, vms_exists))
}

/// Validate the device-interconnect links; returns whether any are declared.
pub fn check_devices_interconnect(topo: &Topology, is_multi_duts: bool) -> Result<bool> {
    let mut all_vlans: HashSet<(usize, usize)> = HashSet::new();
    if topo.devices_interconnect_interfaces.is_empty() {
        return Ok(false);
    }
    for (key, vlans) in &topo.devices_interconnect_interfaces {
        for vlan in vlans {
            check_port_form(
                vlan,
                is_multi_duts,
                &format!("topo['devices_interconnect_interfaces'][{}]", key),
            )?;
            if !all_vlans.insert(vlan.key()) {
                return Err(Error::InvalidTopology(format!(
                    "topo['devices_interconnect_interfaces'][{}] double use of vlan: {}",
                    key, vlan
                )));
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_port_ref() {
        let p: PortRef = "1.2@3".parse().unwrap();
        assert_eq!((p.dut_index, p.vlan_index, p.ptf_index), (1, 2, 3));
        assert!(p.is_qualified());
        assert!(p.has_explicit_ptf());

        let p: PortRef = "0.5".parse().unwrap();
        assert_eq!((p.dut_index, p.vlan_index, p.ptf_index), (0, 5, 5));
        assert!(!p.has_explicit_ptf());

        let p = PortRef::single(5);
        assert_eq!((p.dut_index, p.vlan_index, p.ptf_index), (0, 5, 5));
        assert!(!p.is_qualified());
    }

    #[test]
    fn port_ref_display_roundtrip() {
        let p: PortRef = "1.2@3".parse().unwrap();
        assert_eq!(p.to_string(), "1.2@3");
        let q: PortRef = p.to_string().parse().unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn reject_malformed_port_ref() {
        assert!("1-2".parse::<PortRef>().is_err());
        assert!("1.2@".parse::<PortRef>().is_err());
        assert!("a.b".parse::<PortRef>().is_err());
    }

    #[test]
    fn deserialize_host_interfaces() {
        let topo: Topology = serde_json::from_str(
            r#"{"host_interfaces": [1, "0.2@7", "0.3@8,1.3@8", ["0.4@9", "1.4@9"]]}"#,
        )
        .unwrap();
        assert_eq!(topo.host_interfaces.len(), 4);
        assert!(matches!(topo.host_interfaces[0], HostInterface::Port(_)));
        assert!(matches!(topo.host_interfaces[2], HostInterface::Dual(_, _)));
        assert!(matches!(topo.host_interfaces[3], HostInterface::Dual(_, _)));
    }

    #[test]
    fn host_ifindex_resolution() {
        // bare integer: the vlan index is the PTF index
        let hi: HostInterface = serde_json::from_str("7").unwrap();
        assert_eq!(hi.host_ifindex(0), 7);
        // explicit @p
        let hi: HostInterface = serde_json::from_str(r#""0.2@9""#).unwrap();
        assert_eq!(hi.host_ifindex(0), 9);
        // qualified without @p: position in the list
        let hi: HostInterface = serde_json::from_str(r#""0.2""#).unwrap();
        assert_eq!(hi.host_ifindex(4), 4);
    }

    #[test]
    fn duplicate_vlan_between_vms() {
        let topo: Topology = serde_json::from_str(
            r#"{"VMs": {
                "ARISTA01T1": {"vlans": [0, 1], "vm_offset": 0},
                "ARISTA02T1": {"vlans": [1, 2], "vm_offset": 1}
            }}"#,
        )
        .unwrap();
        assert!(check_topo(&topo, false).is_err());
    }

    #[test]
    fn duplicate_vlan_between_vm_and_host_interface() {
        let topo: Topology = serde_json::from_str(
            r#"{
                "host_interfaces": [0, 1],
                "VMs": {"ARISTA01T1": {"vlans": [1, 2], "vm_offset": 0}}
            }"#,
        )
        .unwrap();
        assert!(check_topo(&topo, false).is_err());
    }

    #[test]
    fn valid_topo_reports_sections() {
        let topo: Topology = serde_json::from_str(
            r#"{
                "host_interfaces": [0, 1],
                "VMs": {"ARISTA01T1": {"vlans": [2, 3], "vm_offset": 0}}
            }"#,
        )
        .unwrap();
        assert_eq!(check_topo(&topo, false).unwrap(), (true, true));
        let empty = Topology::default();
        assert_eq!(check_topo(&empty, false).unwrap(), (false, false));
    }

    #[test]
    fn multi_dut_requires_qualified_ports() {
        let topo: Topology =
            serde_json::from_str(r#"{"host_interfaces": [0, 1]}"#).unwrap();
        assert!(check_topo(&topo, true).is_err());
        let topo: Topology =
            serde_json::from_str(r#"{"host_interfaces": ["0.0@0", "1.0@1"]}"#).unwrap();
        assert!(check_topo(&topo, true).is_ok());
    }

    #[test]
    fn interconnect_duplicates_rejected() {
        let topo: Topology = serde_json::from_str(
            r#"{"devices_interconnect_interfaces": {"0": ["0.51@51", "1.51@51"], "1": ["0.51@51", "1.52@52"]}}"#,
        )
        .unwrap();
        assert!(check_devices_interconnect(&topo, true).is_err());
    }

    #[test]
    fn interconnect_detection() {
        let topo = Topology::default();
        assert!(!check_devices_interconnect(&topo, true).unwrap());
        let topo: Topology = serde_json::from_str(
            r#"{"devices_interconnect_interfaces": {"0": ["0.51@51", "1.51@51"]}}"#,
        )
        .unwrap();
        assert!(check_devices_interconnect(&topo, true).unwrap());
    }

    #[test]
    fn vlan_ids_from_default_config() {
        let topo: Topology = serde_json::from_str(
            r#"{"DUT": {"vlan_configs": {
                "default_vlan_config": "one_vlan_a",
                "one_vlan_a": {"Vlan1000": {"id": 1000, "intfs": [0, 1, 2]}},
                "two_vlan_a": {"Vlan100": {"id": 100, "intfs": [0, 1]},
                               "Vlan200": {"id": 200, "intfs": [2]}}
            }}}"#,
        )
        .unwrap();
        let ids = topo.vlan_ids().unwrap();
        assert_eq!(ids.get("0"), Some(&"1000".to_string()));
        assert_eq!(ids.get("2"), Some(&"1000".to_string()));
    }

    #[test]
    fn vlan_ids_require_default_config() {
        let topo: Topology = serde_json::from_str(
            r#"{"DUT": {"vlan_configs": {"one_vlan_a": {"Vlan1000": {"id": 1000, "intfs": [0]}}}}}"#,
        )
        .unwrap();
        assert!(topo.vlan_ids().is_err());
    }

    #[test]
    fn vm_link_ovs_flag() {
        let topo: Topology = serde_json::from_str(
            r#"{"VM_LINKs": {
                "link1": {"start_vm_offset": 0, "start_vm_port_idx": 5,
                          "end_vm_offset": 1, "end_vm_port_idx": 5},
                "link2": {"start_vm_offset": 0, "start_vm_port_idx": 6,
                          "end_vm_offset": 1, "end_vm_port_idx": 6, "use_ovs": 1}
            }}"#,
        )
        .unwrap();
        assert!(!topo.vm_links["link1"].uses_ovs());
        assert!(topo.vm_links["link2"].uses_ovs());
    }
}
