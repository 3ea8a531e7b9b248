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

//! Command-line front end of the topology binding engine.

use fabric::orchestrator::{self, Params, TopoCommand};
use fabric::topology::{MuxCableFact, Topology, VmProperties};
use fabric::worker::{default_worker_count, BufferedLogger, Worker};
use fabric::vm_topology::{DEFAULT_MTU, NUM_FP_VLANS_PER_FP};

use clap::Parser;
use log::*;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

/// Build and tear down the virtual fabric connecting emulated neighbor VMs, devices under test
/// and the PTF test container.
#[derive(Parser, Debug)]
#[clap(name = "fabric", version)]
struct CommandLineArguments {
    /// Lifecycle command: create, bind, renumber, unbind, destroy, connect-vms, disconnect-vms
    cmd: String,

    /// Name of the vm set (at most 8 characters, used in interface names)
    #[clap(long)]
    vm_set_name: Option<String>,

    /// Path to the topology JSON file
    #[clap(long)]
    topo: Option<PathBuf>,

    /// VM hostnames available on this host, in order
    #[clap(long, use_value_delimiter = true)]
    vm_names: Vec<String>,

    /// Restrict the operation to a single VM
    #[clap(long)]
    current_vm_name: Option<String>,

    /// The VM considered logical offset 0
    #[clap(long)]
    vm_base: Option<String>,

    /// Path to the per-VM properties JSON file
    #[clap(long)]
    vm_properties: Option<PathBuf>,

    /// IPv4 address (with prefix length) of the PTF management port
    #[clap(long)]
    ptf_mgmt_ip_addr: Option<String>,

    /// IPv6 address (with prefix length) of the PTF management port
    #[clap(long)]
    ptf_mgmt_ipv6_addr: Option<String>,

    /// IPv4 default gateway of the PTF management port
    #[clap(long)]
    ptf_mgmt_ip_gw: Option<String>,

    /// IPv6 default gateway of the PTF management port
    #[clap(long)]
    ptf_mgmt_ipv6_gw: Option<String>,

    /// Additional addresses of the PTF management port
    #[clap(long, use_value_delimiter = true)]
    ptf_extra_mgmt_ip_addr: Vec<String>,

    /// IPv4 address of the PTF backplane port
    #[clap(long)]
    ptf_bp_ip_addr: Option<String>,

    /// IPv6 address of the PTF backplane port
    #[clap(long)]
    ptf_bp_ipv6_addr: Option<String>,

    /// Name of the host management bridge
    #[clap(long)]
    mgmt_bridge: Option<String>,

    /// IPv4 address of the netns management port
    #[clap(long)]
    netns_mgmt_ip_addr: Option<String>,

    /// Path to the DUT front-panel port map JSON file
    #[clap(long)]
    duts_fp_ports: Option<PathBuf>,

    /// Management ports of the DUTs
    #[clap(long, use_value_delimiter = true)]
    duts_mgmt_port: Vec<String>,

    /// Path to the DUT midplane port map JSON file (virtual chassis)
    #[clap(long)]
    duts_midplane_ports: Option<PathBuf>,

    /// Path to the DUT inband port map JSON file (virtual chassis)
    #[clap(long)]
    duts_inband_ports: Option<PathBuf>,

    /// Ordered DUT names
    #[clap(long, use_value_delimiter = true)]
    duts_name: Vec<String>,

    /// Pid of the PTF container (resolved by the container runtime)
    #[clap(long)]
    ptf_pid: Option<u32>,

    /// MTU for front-panel ports, 0 leaves the MTU untouched
    #[clap(long, default_value_t = DEFAULT_MTU)]
    fp_mtu: u32,

    /// Number of front-panel bridges provisioned per VM
    #[clap(long, default_value_t = NUM_FP_VLANS_PER_FP)]
    max_fp_num: usize,

    /// Path to the mux-cable facts JSON file (active-active host interfaces)
    #[clap(long)]
    mux_cable_facts: Option<PathBuf>,

    /// The topology declares DPUs instead of VMs
    #[clap(long)]
    is_dpu: bool,

    /// The DUTs form a KVM-based virtual chassis
    #[clap(long)]
    is_vs_chassis: bool,

    /// Run all per-port operations sequentially instead of on the worker pool
    #[clap(long)]
    sequential: bool,

    /// Worker pool size
    #[clap(long, default_value_t = default_worker_count())]
    workers: usize,

    /// Defer flow programming to batched background invocations
    #[clap(long)]
    batch_mode: bool,
}

fn read_json<T>(path: &Option<PathBuf>) -> Result<T, Box<dyn Error>>
where
    T: DeserializeOwned + Default,
{
    match path {
        Some(path) => Ok(serde_json::from_str(&fs::read_to_string(path)?)?),
        None => Ok(T::default()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // run clap
    let args = CommandLineArguments::parse();

    // initialize the logger, wrapped into the per-task buffering sink
    let mut builder = pretty_env_logger::formatted_builder();
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let logger = builder.build();
    let level = logger.filter();
    let log_buffer = BufferedLogger::new(Box::new(logger));
    BufferedLogger::install(log_buffer.clone(), level);

    let cmd: TopoCommand = args.cmd.parse()?;
    let topo: Topology = read_json(&args.topo)?;
    let vm_properties: BTreeMap<String, VmProperties> = read_json(&args.vm_properties)?;
    let duts_fp_ports: BTreeMap<String, BTreeMap<String, String>> =
        read_json(&args.duts_fp_ports)?;
    let duts_midplane_ports: BTreeMap<String, Vec<String>> =
        read_json(&args.duts_midplane_ports)?;
    let duts_inband_ports: BTreeMap<String, Vec<String>> = read_json(&args.duts_inband_ports)?;
    let mux_cable_facts: BTreeMap<String, MuxCableFact> = read_json(&args.mux_cable_facts)?;

    let params = Params {
        cmd,
        vm_set_name: args.vm_set_name,
        topo,
        vm_names: args.vm_names,
        current_vm_name: args.current_vm_name,
        vm_base: args.vm_base,
        vm_properties,
        ptf_mgmt_ip_addr: args.ptf_mgmt_ip_addr,
        ptf_mgmt_ipv6_addr: args.ptf_mgmt_ipv6_addr,
        ptf_mgmt_ip_gw: args.ptf_mgmt_ip_gw,
        ptf_mgmt_ipv6_gw: args.ptf_mgmt_ipv6_gw,
        ptf_extra_mgmt_ip_addr: args.ptf_extra_mgmt_ip_addr,
        ptf_bp_ip_addr: args.ptf_bp_ip_addr,
        ptf_bp_ipv6_addr: args.ptf_bp_ipv6_addr,
        mgmt_bridge: args.mgmt_bridge,
        netns_mgmt_ip_addr: args.netns_mgmt_ip_addr,
        duts_fp_ports,
        duts_mgmt_port: args.duts_mgmt_port,
        duts_midplane_ports,
        duts_inband_ports,
        duts_name: args.duts_name,
        ptf_pid: args.ptf_pid,
        fp_mtu: args.fp_mtu,
        max_fp_num: args.max_fp_num,
        mux_cable_facts,
        is_dpu: args.is_dpu,
        is_vs_chassis: args.is_vs_chassis,
        batch_mode: args.batch_mode,
    };

    let worker = Worker::new(!args.sequential, args.workers).with_log_buffer(log_buffer);

    info!("Performing {} for vm set {:?}", params.cmd, params.vm_set_name);
    // the worker shuts down (and flushes all task buffers) when the topology is dropped
    let result = orchestrator::run(&params, worker);

    match result {
        Ok(()) => {
            info!("{} completed", params.cmd);
            Ok(())
        }
        Err(e) => {
            error!("{} failed: {}", params.cmd, e);
            Err(e.into())
        }
    }
}
