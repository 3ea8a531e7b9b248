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

//! # Topology Orchestrator
//!
//! Sequences the fabric operations according to the requested lifecycle command. There is no
//! explicit state tracking: the state lives in what exists on the host, every operation is
//! idempotent, and a retried invocation converges. The orchestrator only decides *which*
//! operations run, in *which* order, validating the declarative inputs before the first one.

use crate::topology::{check_devices_interconnect, check_topo, MuxCableFact, Topology, VmProperties};
use crate::vm_topology::{InitParams, VmTopology, DEFAULT_MTU, NUM_FP_VLANS_PER_FP, VM_SET_NAME_MAX_LEN};
use crate::worker::Worker;
use crate::{Error, Result};

use crate::names::netns_mgmt_iface_name;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The requested lifecycle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopoCommand {
    /// Create the per-VM front-panel bridges.
    Create,
    /// Wire the whole topology: management, front-panel, backplane, host ports, netns.
    Bind,
    /// Rebind the topology in place onto a different vm set layout.
    Renumber,
    /// Tear down everything `bind` created.
    Unbind,
    /// Destroy the per-VM front-panel bridges.
    Destroy,
    /// Re-enable the VM-facing forwarding on all front-panel bridges.
    ConnectVms,
    /// Replace the VM-facing forwarding by a drop rule, leaving the rest of the wiring intact.
    DisconnectVms,
}

impl TopoCommand {
    fn mode(&self) -> &'static str {
        match self {
            TopoCommand::Create => "create",
            TopoCommand::Bind => "bind",
            TopoCommand::Renumber => "renumber",
            TopoCommand::Unbind => "unbind",
            TopoCommand::Destroy => "destroy",
            TopoCommand::ConnectVms => "connect-vms",
            TopoCommand::DisconnectVms => "disconnect-vms",
        }
    }
}

impl FromStr for TopoCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(TopoCommand::Create),
            "bind" => Ok(TopoCommand::Bind),
            "renumber" => Ok(TopoCommand::Renumber),
            "unbind" => Ok(TopoCommand::Unbind),
            "destroy" => Ok(TopoCommand::Destroy),
            "connect-vms" => Ok(TopoCommand::ConnectVms),
            "disconnect-vms" => Ok(TopoCommand::DisconnectVms),
            other => Err(Error::InvalidConfig(format!(
                "Unknown command: {} (expected one of create, bind, renumber, unbind, destroy, connect-vms, disconnect-vms)",
                other
            ))),
        }
    }
}

impl fmt::Display for TopoCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode())
    }
}

/// All parameters of one engine invocation.
#[derive(Debug, Clone)]
pub struct Params {
    /// The lifecycle command to perform.
    pub cmd: TopoCommand,
    /// Name of the vm set; used in every derived interface name.
    pub vm_set_name: Option<String>,
    /// The declarative topology.
    pub topo: Topology,
    /// VM hostnames available on this host, in order.
    pub vm_names: Vec<String>,
    /// Restrict the operation to a single VM (parallel per-VM invocations).
    pub current_vm_name: Option<String>,
    /// The VM considered logical offset 0.
    pub vm_base: Option<String>,
    /// Per-VM property overrides.
    pub vm_properties: BTreeMap<String, VmProperties>,
    /// IPv4 address (with prefix length) of the PTF management port.
    pub ptf_mgmt_ip_addr: Option<String>,
    /// IPv6 address (with prefix length) of the PTF management port.
    pub ptf_mgmt_ipv6_addr: Option<String>,
    /// IPv4 default gateway of the PTF management port.
    pub ptf_mgmt_ip_gw: Option<String>,
    /// IPv6 default gateway of the PTF management port.
    pub ptf_mgmt_ipv6_gw: Option<String>,
    /// Additional addresses of the PTF management port.
    pub ptf_extra_mgmt_ip_addr: Vec<String>,
    /// IPv4 address of the PTF backplane port.
    pub ptf_bp_ip_addr: Option<String>,
    /// IPv6 address of the PTF backplane port.
    pub ptf_bp_ipv6_addr: Option<String>,
    /// Name of the host management bridge.
    pub mgmt_bridge: Option<String>,
    /// IPv4 address of the netns management port.
    pub netns_mgmt_ip_addr: Option<String>,
    /// DUT name -> front-panel vlan index -> OS interface name.
    pub duts_fp_ports: BTreeMap<String, BTreeMap<String, String>>,
    /// Management ports of the DUTs (empty strings are skipped).
    pub duts_mgmt_port: Vec<String>,
    /// Midplane ports per DUT (virtual chassis only).
    pub duts_midplane_ports: BTreeMap<String, Vec<String>>,
    /// Inband ports per DUT (virtual chassis only).
    pub duts_inband_ports: BTreeMap<String, Vec<String>>,
    /// Ordered DUT names.
    pub duts_name: Vec<String>,
    /// Pid of the PTF container, resolved externally; `None` if not running.
    pub ptf_pid: Option<u32>,
    /// MTU for front-panel ports, 0 leaves the MTU untouched.
    pub fp_mtu: u32,
    /// Number of front-panel bridges provisioned per VM.
    pub max_fp_num: usize,
    /// Simulated NIC addresses per active-active host interface.
    pub mux_cable_facts: BTreeMap<String, MuxCableFact>,
    /// The topology declares DPUs instead of VMs.
    pub is_dpu: bool,
    /// The DUTs form a KVM-based virtual chassis.
    pub is_vs_chassis: bool,
    /// Defer flow programming to batched background invocations.
    pub batch_mode: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            cmd: TopoCommand::Create,
            vm_set_name: None,
            topo: Topology::default(),
            vm_names: Vec::new(),
            current_vm_name: None,
            vm_base: None,
            vm_properties: BTreeMap::new(),
            ptf_mgmt_ip_addr: None,
            ptf_mgmt_ipv6_addr: None,
            ptf_mgmt_ip_gw: None,
            ptf_mgmt_ipv6_gw: None,
            ptf_extra_mgmt_ip_addr: Vec::new(),
            ptf_bp_ip_addr: None,
            ptf_bp_ipv6_addr: None,
            mgmt_bridge: None,
            netns_mgmt_ip_addr: None,
            duts_fp_ports: BTreeMap::new(),
            duts_mgmt_port: Vec::new(),
            duts_midplane_ports: BTreeMap::new(),
            duts_inband_ports: BTreeMap::new(),
            duts_name: Vec::new(),
            ptf_pid: None,
            fp_mtu: DEFAULT_MTU,
            max_fp_num: NUM_FP_VLANS_PER_FP,
            mux_cable_facts: BTreeMap::new(),
            is_dpu: false,
            is_vs_chassis: false,
            batch_mode: false,
        }
    }
}

fn require<'a>(param: &'a Option<String>, name: &'static str, mode: &'static str) -> Result<&'a str> {
    param
        .as_deref()
        .ok_or(Error::MissingParameter(name, mode))
}

/// `vm_set_name` ends up inside interface names, so it is restricted to 8 characters.
pub fn check_vm_set_name(vm_set_name: &str) -> Result<()> {
    if vm_set_name.len() > VM_SET_NAME_MAX_LEN {
        return Err(Error::InvalidConfig(format!(
            "vm_set_name can't be longer than {} characters: {} ({})",
            VM_SET_NAME_MAX_LEN,
            vm_set_name,
            vm_set_name.len()
        )));
    }
    Ok(())
}

/// Run one lifecycle command over the topology.
pub fn run(params: &Params, worker: Worker) -> Result<()> {
    let mut net = VmTopology::new(
        params.vm_names.clone(),
        params.vm_properties.clone(),
        params.fp_mtu,
        params.max_fp_num,
        params.topo.clone(),
        worker,
        params.current_vm_name.clone(),
        params.is_dpu,
        params.is_vs_chassis,
    );

    match params.cmd {
        TopoCommand::Create => net.create_bridges(),
        TopoCommand::Destroy => net.destroy_bridges(),
        TopoCommand::Bind => bind(params, &mut net),
        TopoCommand::Renumber => renumber(params, &mut net),
        TopoCommand::Unbind => unbind(params, &mut net),
        TopoCommand::ConnectVms => connect_vms(params, &mut net, false),
        TopoCommand::DisconnectVms => connect_vms(params, &mut net, true),
    }
}

/// Validate the common bind-family inputs and initialize the resolved topology.
fn init_topology(
    params: &Params,
    net: &mut VmTopology,
    mode: &'static str,
    check_bridge: bool,
) -> Result<(bool, bool, bool)> {
    let vm_set_name = require(&params.vm_set_name, "vm_set_name", mode)?;
    check_vm_set_name(vm_set_name)?;

    let is_multi_duts = params.duts_name.len() > 1;
    let (hostif_exists, vms_exists) = check_topo(&params.topo, is_multi_duts)?;
    let interconnect_exists = check_devices_interconnect(&params.topo, is_multi_duts)?;

    let vm_base = if vms_exists {
        Some(require(&params.vm_base, "vm_base", mode)?.to_string())
    } else {
        None
    };

    net.init(InitParams {
        vm_set_name: vm_set_name.to_string(),
        vm_base,
        duts_fp_ports: params.duts_fp_ports.clone(),
        duts_name: params.duts_name.clone(),
        ptf_pid: params.ptf_pid,
        check_bridge,
        mux_cable_facts: params.mux_cable_facts.clone(),
    })?;

    Ok((hostif_exists, vms_exists, interconnect_exists))
}

fn bind(params: &Params, net: &mut VmTopology) -> Result<()> {
    let mode = "bind";
    let (hostif_exists, vms_exists, interconnect_exists) =
        init_topology(params, net, mode, true)?;

    let mgmt_bridge = require(&params.mgmt_bridge, "mgmt_bridge", mode)?;
    let ptf_mgmt_ip_addr = require(&params.ptf_mgmt_ip_addr, "ptf_mgmt_ip_addr", mode)?;
    let ptf_bp_ip_addr = require(&params.ptf_bp_ip_addr, "ptf_bp_ip_addr", mode)?;

    net.add_mgmt_port_to_ptf(
        mgmt_bridge,
        ptf_mgmt_ip_addr,
        params.ptf_mgmt_ip_gw.as_deref(),
        params.ptf_mgmt_ipv6_addr.as_deref(),
        params.ptf_mgmt_ipv6_gw.as_deref(),
        &params.ptf_extra_mgmt_ip_addr,
    )?;

    for dut_mgmt_port in &params.duts_mgmt_port {
        if !dut_mgmt_port.is_empty() {
            net.bind_mgmt_port(mgmt_bridge, dut_mgmt_port)?;
        }
    }

    if vms_exists {
        net.add_injected_fp_ports_to_ptf()?;
        net.add_injected_ovs_ports_to_ptf()?;
        net.bind_fp_ports(false, params.batch_mode)?;
        net.bind_vm_backplane()?;
        net.add_bp_port_to_ptf(ptf_bp_ip_addr, params.ptf_bp_ipv6_addr.as_deref())?;
        if params.is_vs_chassis {
            net.bind_vs_chassis_ports(&params.duts_midplane_ports, &params.duts_inband_ports)?;
        }
    }

    if net.netns().is_some() {
        net.add_network_namespace()?;
        // arp_filter prevents arp flux between the uplinks of the netns
        net.enable_arp_filter_netns()?;
        net.add_mgmt_port_to_netns(
            mgmt_bridge,
            params.netns_mgmt_ip_addr.as_deref(),
            params.ptf_mgmt_ip_gw.as_deref(),
        )?;
        net.enable_netns_loopback()?;
    }

    if hostif_exists {
        net.add_host_ports()?;
    }

    if net.netns().is_some() {
        net.setup_netns_source_routing()?;
    }

    if interconnect_exists {
        net.bind_devices_interconnect()?;
    }

    Ok(())
}

fn unbind(params: &Params, net: &mut VmTopology) -> Result<()> {
    let mode = "unbind";
    let (hostif_exists, vms_exists, interconnect_exists) =
        init_topology(params, net, mode, false)?;

    for dut_mgmt_port in &params.duts_mgmt_port {
        if !dut_mgmt_port.is_empty() {
            net.unbind_mgmt_port(dut_mgmt_port)?;
        }
    }

    if vms_exists {
        net.unbind_vm_backplane()?;
        net.unbind_fp_ports(params.batch_mode)?;
        net.remove_injected_fp_ports_from_ptf()?;
        if params.is_vs_chassis {
            net.unbind_vs_chassis_ports(&params.duts_midplane_ports, &params.duts_inband_ports)?;
        }
    }

    if hostif_exists {
        net.remove_host_ports()?;
    }

    net.remove_ptf_mgmt_port()?;
    net.remove_ptf_backplane_port()?;

    if net.netns().is_some() {
        net.unbind_mgmt_port(&netns_mgmt_iface_name(net.vm_set_name()))?;
        net.delete_network_namespace()?;
    }

    if interconnect_exists {
        net.unbind_devices_interconnect()?;
    }

    Ok(())
}

fn renumber(params: &Params, net: &mut VmTopology) -> Result<()> {
    let mode = "renumber";
    let (hostif_exists, vms_exists, interconnect_exists) =
        init_topology(params, net, mode, true)?;

    let mgmt_bridge = require(&params.mgmt_bridge, "mgmt_bridge", mode)?;
    let ptf_mgmt_ip_addr = require(&params.ptf_mgmt_ip_addr, "ptf_mgmt_ip_addr", mode)?;
    let ptf_bp_ip_addr = require(&params.ptf_bp_ip_addr, "ptf_bp_ip_addr", mode)?;

    net.add_mgmt_port_to_ptf(
        mgmt_bridge,
        ptf_mgmt_ip_addr,
        params.ptf_mgmt_ip_gw.as_deref(),
        params.ptf_mgmt_ipv6_addr.as_deref(),
        params.ptf_mgmt_ipv6_gw.as_deref(),
        &params.ptf_extra_mgmt_ip_addr,
    )?;

    if net.netns().is_some() {
        net.unbind_mgmt_port(&netns_mgmt_iface_name(net.vm_set_name()))?;
        net.delete_network_namespace()?;
    }

    if vms_exists {
        net.unbind_fp_ports(params.batch_mode)?;
        if params.is_vs_chassis {
            net.unbind_vs_chassis_ports(&params.duts_midplane_ports, &params.duts_inband_ports)?;
        }
        net.add_injected_fp_ports_to_ptf()?;
        net.add_injected_ovs_ports_to_ptf()?;
        net.bind_fp_ports(false, params.batch_mode)?;
        net.bind_vm_backplane()?;
        net.add_bp_port_to_ptf(ptf_bp_ip_addr, params.ptf_bp_ipv6_addr.as_deref())?;
        if params.is_vs_chassis {
            net.bind_vs_chassis_ports(&params.duts_midplane_ports, &params.duts_inband_ports)?;
        }
    }

    if net.netns().is_some() {
        net.add_network_namespace()?;
        net.enable_arp_filter_netns()?;
        net.add_mgmt_port_to_netns(
            mgmt_bridge,
            params.netns_mgmt_ip_addr.as_deref(),
            params.ptf_mgmt_ip_gw.as_deref(),
        )?;
        net.enable_netns_loopback()?;
    }

    if hostif_exists {
        net.add_host_ports()?;
    }

    if net.netns().is_some() {
        net.setup_netns_source_routing()?;
    }

    if interconnect_exists {
        net.bind_devices_interconnect()?;
    }

    Ok(())
}

fn connect_vms(params: &Params, net: &mut VmTopology, disconnect: bool) -> Result<()> {
    let mode = if disconnect { "disconnect-vms" } else { "connect-vms" };
    let (_, vms_exists, _) = init_topology(params, net, mode, true)?;

    if vms_exists {
        net.bind_fp_ports(disconnect, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!("create".parse::<TopoCommand>().unwrap(), TopoCommand::Create);
        assert_eq!("bind".parse::<TopoCommand>().unwrap(), TopoCommand::Bind);
        assert_eq!(
            "connect-vms".parse::<TopoCommand>().unwrap(),
            TopoCommand::ConnectVms
        );
        assert_eq!(
            "disconnect-vms".parse::<TopoCommand>().unwrap(),
            TopoCommand::DisconnectVms
        );
        assert!("rebind".parse::<TopoCommand>().is_err());
    }

    #[test]
    fn command_display_roundtrip() {
        for cmd in &[
            TopoCommand::Create,
            TopoCommand::Bind,
            TopoCommand::Renumber,
            TopoCommand::Unbind,
            TopoCommand::Destroy,
            TopoCommand::ConnectVms,
            TopoCommand::DisconnectVms,
        ] {
            assert_eq!(cmd.to_string().parse::<TopoCommand>().unwrap(), *cmd);
        }
    }

    #[test]
    fn vm_set_name_length() {
        assert!(check_vm_set_name("vms7-6").is_ok());
        assert!(check_vm_set_name("eight888").is_ok());
        assert!(check_vm_set_name("ninechars").is_err());
    }

    #[test]
    fn missing_parameters_are_reported() {
        let params = Params {
            cmd: TopoCommand::Bind,
            ..Params::default()
        };
        let worker = Worker::new(false, 1);
        match run(&params, worker) {
            Err(Error::MissingParameter(name, mode)) => {
                assert_eq!(name, "vm_set_name");
                assert_eq!(mode, "bind");
            }
            x => panic!("unexpected result: {:?}", x),
        }
    }

    #[test]
    fn bind_requires_vm_base_with_vms() {
        let topo: Topology = serde_json::from_str(
            r#"{"VMs": {"ARISTA01T1": {"vlans": [0], "vm_offset": 0}}}"#,
        )
        .unwrap();
        let params = Params {
            cmd: TopoCommand::Bind,
            vm_set_name: Some("vms7-6".to_string()),
            topo,
            vm_names: vec!["VM0100".to_string()],
            ..Params::default()
        };
        let worker = Worker::new(false, 1);
        match run(&params, worker) {
            Err(Error::MissingParameter(name, _)) => assert_eq!(name, "vm_base"),
            x => panic!("unexpected result: {:?}", x),
        }
    }
}
