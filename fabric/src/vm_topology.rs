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

//! # Fabric Operations
//!
//! This module holds the main datastructure, [`VmTopology`], which wires the declarative topology
//! onto the host: per-port OVS bridges between DUT, VM and PTF container, veth pairs into the PTF
//! container and the active-active network namespace, the VM backplane, dual-ToR cables and the
//! policy routing of the namespace. Every operation is idempotent: it observes the live system
//! state first and only issues the commands needed to reach the desired state, so a repeated
//! invocation (or the in-place rebind of `renumber`) converges instead of failing.

use crate::names::*;
use crate::topology::*;
use crate::worker::Worker;
use crate::{Error, Result};

use log::*;
use netcmd::{fire_and_forget, join_batch, BatchProcess, Cmd};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::Mutex;
use std::time::Duration;

/// MTU value meaning "leave the interface MTU untouched".
pub const DEFAULT_MTU: u32 = 0;
/// Default number of front-panel ports provisioned per VM.
pub const NUM_FP_VLANS_PER_FP: usize = 4;
/// `vm_set_name` is embedded in interface names, so it is restricted.
pub const VM_SET_NAME_MAX_LEN: usize = 8;
/// Timeout for joining batched flow-programming processes.
pub const BATCH_TIMEOUT: Duration = netcmd::DEFAULT_BATCH_TIMEOUT;

const OVS_BIND_RETRIES: usize = 10;
const OVS_LINK_MTU: u32 = 9000;
const RT_TABLE_FILEPATH: &str = "/etc/iproute2/rt_tables";
const RT_SLOT_START: usize = 100;
const RT_SLOT_MAX: usize = 252;

/// Where a command should be executed: the root namespace, a container's network namespace
/// (entered by pid) or a named network namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// The root network namespace.
    Host,
    /// The network namespace of the process with this pid.
    Container(u32),
    /// A named network namespace.
    Netns(&'a str),
}

impl<'a> Scope<'a> {
    fn wrap(&self, cmdline: &str) -> String {
        match self {
            Scope::Host => cmdline.to_string(),
            Scope::Container(pid) => format!("nsenter -t {} -n {}", pid, cmdline),
            Scope::Netns(netns) => format!("ip netns exec {} {}", netns, cmdline),
        }
    }
}

/// Check if the interface exists in the given scope.
///
/// The probe runs with retries since interface creation is only eventually consistent; a failing
/// probe is the signal "absent", never conflated with a broken check (see [`intf_not_exists`]).
pub fn intf_exists(intf: &str, scope: Scope) -> bool {
    Cmd::new(scope.wrap(&format!("ifconfig -a {}", intf)))
        .retry(3)
        .run()
        .is_ok()
}

/// Check if the interface does not exist in the given scope.
///
/// Uses the negative-retry mode: the probe command is *expected* to fail.
pub fn intf_not_exists(intf: &str, scope: Scope) -> bool {
    Cmd::new(scope.wrap(&format!("ifconfig -a {}", intf)))
        .retry(3)
        .negative()
        .run()
        .is_ok()
}

/// Check if the address is already configured on the interface.
pub fn ip_exists(intf: &str, ip_addr: &str, scope: Scope, ipv6: bool) -> bool {
    let addr_cmd = if ipv6 { "ip -6 addr show" } else { "ip addr show" };
    match Cmd::new(scope.wrap(&format!("{} dev {}", addr_cmd, intf)))
        .retry(3)
        .run()
    {
        Ok(out) => out.contains(ip_addr),
        Err(_) => false,
    }
}

/// Check if a default route through the gateway exists.
pub fn route_exists(gateway: &str, scope: Scope, ipv6: bool) -> bool {
    let route_cmd = if ipv6 {
        "ip -6 route show default"
    } else {
        "ip route show default"
    };
    match Cmd::new(scope.wrap(route_cmd)).retry(3).run() {
        Ok(out) => out.contains(gateway),
        Err(_) => false,
    }
}

/// Bring an interface up.
pub fn iface_up(iface: &str, scope: Scope) -> Result<String> {
    iface_updown(iface, "up", scope)
}

/// Bring an interface down.
pub fn iface_down(iface: &str, scope: Scope) -> Result<String> {
    iface_updown(iface, "down", scope)
}

fn iface_updown(iface: &str, state: &str, scope: Scope) -> Result<String> {
    let out = match scope {
        // an interface may legitimately be gone already on the host side
        Scope::Host => Cmd::new(format!("ip link set {} {} || true", iface, state))
            .shell()
            .run()?,
        _ => Cmd::new(scope.wrap(&format!("ip link set {} {}", iface, state))).run()?,
    };
    Ok(out)
}

/// Disable tx offload on an interface (required on the backplane port, whose checksums are
/// computed nowhere on the virtual path).
pub fn iface_disable_txoff(iface: &str, pid: Option<u32>) -> Result<String> {
    let cmdline = format!("ethtool -K {} tx off", iface);
    match pid {
        Some(pid) => Ok(Cmd::new(Scope::Container(pid).wrap(&cmdline)).run()?),
        None => Ok(Cmd::new(cmdline).run()?),
    }
}

/// List the ports attached to an OVS bridge (empty if the bridge does not exist).
pub fn get_ovs_br_ports(bridge: &str) -> Result<HashSet<String>> {
    let out = Cmd::new(format!("ovs-vsctl list-ports {} || true", bridge))
        .shell()
        .run()?;
    Ok(out
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect())
}

/// Return the OVS bridge a port is attached to, if any.
pub fn get_ovs_bridge_by_port(port: &str) -> Option<String> {
    match Cmd::new(format!("ovs-vsctl port-to-br {}", port)).run() {
        Ok(out) => Some(out.trim_end().to_string()),
        Err(_) => None,
    }
}

/// Map interface names to OVS port numbers on a bridge.
///
/// A freshly attached port can take a few seconds to show up in `ovs-ofctl show`, so the query is
/// retried with a linear backoff until every interface in `required` is present.
pub fn get_ovs_port_bindings(
    bridge: &str,
    required: &[&str],
) -> Result<HashMap<String, String>> {
    let re = Regex::new(r"^\s+(\S+)\((\S+)\):\s+addr:.+$").unwrap();
    for retries in 0..OVS_BIND_RETRIES {
        let out = Cmd::new(format!("ovs-ofctl show {}", bridge)).run()?;
        let mut result = HashMap::new();
        for line in out.lines() {
            if let Some(caps) = re.captures(line) {
                result.insert(caps[2].to_string(), caps[1].to_string());
            }
        }
        if required.iter().all(|intf| result.contains_key(*intf)) {
            return Ok(result);
        }
        std::thread::sleep(Duration::from_secs((2 * retries + 1) as u64));
    }
    Err(Error::PortBindingNotFound(
        bridge.to_string(),
        required.first().unwrap_or(&"?").to_string(),
    ))
}

/// Parse `brctl show` into (bridge -> members, member -> bridge).
pub fn brctl_show(
    bridge: Option<&str>,
) -> (HashMap<String, Vec<String>>, HashMap<String, String>) {
    let mut br_to_ifs: HashMap<String, Vec<String>> = HashMap::new();
    let mut if_to_br: HashMap<String, String> = HashMap::new();

    let cmdline = match bridge {
        Some(b) => format!("brctl show {}", b),
        None => "brctl show".to_string(),
    };
    let out = match Cmd::new(&cmdline).run() {
        Ok(out) => out,
        Err(_) => {
            error!("!!! Failed to run {}", cmdline);
            return (br_to_ifs, if_to_br);
        }
    };

    let mut cur_br: Option<String> = None;
    for row in out.lines().skip(1) {
        if row.is_empty() {
            continue;
        }
        let terms: Vec<&str> = row.split_whitespace().collect();
        if !row.starts_with(char::is_whitespace) {
            let br = terms[0].to_string();
            br_to_ifs.insert(br.clone(), Vec::new());
            if terms.len() > 3 {
                br_to_ifs.get_mut(&br).unwrap().push(terms[3].to_string());
                if_to_br.insert(terms[3].to_string(), br.clone());
            }
            cur_br = Some(br);
        } else if let Some(br) = &cur_br {
            br_to_ifs.get_mut(br).unwrap().push(terms[0].to_string());
            if_to_br.insert(terms[0].to_string(), br.clone());
        }
    }

    (br_to_ifs, if_to_br)
}

/// An IPv4 interface address with prefix length, e.g. `192.168.0.5/24`.
///
/// Used to derive the subnet route and gateway for the policy routing of active-active ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNet {
    addr: [u8; 4],
    prefix_len: u32,
}

impl IpNet {
    /// Parse an address of the shape `X.X.X.X/X`.
    ///
    /// ```
    /// # use fabric::vm_topology::IpNet;
    /// let addr = IpNet::try_from_str("192.168.0.5/24").unwrap();
    /// assert_eq!(addr.network().to_string(), "192.168.0.0/24");
    /// assert_eq!(addr.gateway(), "192.168.0.1");
    /// ```
    pub fn try_from_str(s: impl AsRef<str>) -> Result<Self> {
        let error = || Error::InvalidConfig(format!("Invalid IP string: {}", s.as_ref()));
        let parts: Vec<&str> = s.as_ref().split('/').collect();
        if parts.len() != 2 {
            return Err(error());
        }
        let ip_parts: Vec<&str> = parts[0].split('.').collect();
        if ip_parts.len() != 4 {
            return Err(error());
        }
        let mut addr = [0u8; 4];
        for (i, p) in ip_parts.iter().enumerate() {
            addr[i] = p.parse().map_err(|_| error())?;
        }
        let prefix_len: u32 = parts[1].parse().map_err(|_| error())?;
        if prefix_len > 32 {
            return Err(error());
        }
        Ok(Self { addr, prefix_len })
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    fn addr_u32(&self) -> u32 {
        u32::from_be_bytes(self.addr)
    }

    /// The network this address belongs to.
    pub fn network(&self) -> IpNet {
        IpNet {
            addr: (self.addr_u32() & self.mask()).to_be_bytes(),
            prefix_len: self.prefix_len,
        }
    }

    /// The first usable address of the network, used as the emulated gateway.
    pub fn gateway(&self) -> String {
        let gw = ((self.addr_u32() & self.mask()) + 1).to_be_bytes();
        format!("{}.{}.{}.{}", gw[0], gw[1], gw[2], gw[3])
    }

    /// The bare address, without the prefix length.
    pub fn address(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.addr[0], self.addr[1], self.addr[2], self.addr[3]
        )
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}/{}",
            self.addr[0], self.addr[1], self.addr[2], self.addr[3], self.prefix_len
        )
    }
}

static BATCH_DIR_ID: AtomicUsize = AtomicUsize::new(0);

/// Collects the background processes and flow files of one batched bind/unbind pass.
pub struct BatchContext {
    processes: Mutex<Vec<BatchProcess>>,
    tmpdir: PathBuf,
    counter: AtomicUsize,
}

impl BatchContext {
    /// Create a fresh context with its own directory for flow files.
    pub fn new() -> Result<Self> {
        let tmpdir = std::env::temp_dir().join(format!(
            "fabric-batch-{}-{}",
            process::id(),
            BATCH_DIR_ID.fetch_add(1, Relaxed)
        ));
        fs::create_dir_all(&tmpdir)?;
        Ok(Self {
            processes: Mutex::new(Vec::new()),
            tmpdir,
            counter: AtomicUsize::new(0),
        })
    }

    /// Write the flow rules of one bridge to a file and return its path.
    fn write_flow_file(&self, rules: &[String]) -> Result<PathBuf> {
        let path = self
            .tmpdir
            .join(format!("flows-{}", self.counter.fetch_add(1, Relaxed)));
        let mut file = fs::File::create(&path)?;
        for rule in rules {
            writeln!(file, "{}", rule)?;
        }
        Ok(path)
    }

    fn push(&self, process: BatchProcess) {
        self.processes.lock().unwrap().push(process);
    }

    /// Join every background process, then remove the flow files. All processes are joined
    /// before any failure is reported.
    pub fn finish(self, timeout: Duration) -> Result<()> {
        let processes = self.processes.into_inner().unwrap();
        let result = join_batch(processes, timeout);
        fs::remove_dir_all(&self.tmpdir).ok();
        Ok(result?)
    }
}

/// The layered rule set from the DUT port toward the VM and PTF ports.
///
/// Narrow protocol-aware allow rules (BGP, SSH, IP-in-IP, OSPF, BFD, ICMP, fragments, SNMP, DNS)
/// outrank the default-route fallback toward the PTF and the final catch-all, so the VM only
/// sees the control-plane traffic it needs while the PTF sees everything.
fn fp_flow_rules(dut_id: &str, vm_id: &str, injected_id: &str) -> Vec<String> {
    let both = format!("{},{}", vm_id, injected_id);
    vec![
        format!("table=0,priority=10,tcp,in_port={},tp_src=179,action=output:{}", dut_id, both),
        format!("table=0,priority=10,tcp,in_port={},tp_dst=179,action=output:{}", dut_id, both),
        format!("table=0,priority=10,tcp,in_port={},tp_dst=22,action=output:{}", dut_id, both),
        format!("table=0,priority=10,tcp,in_port={},tp_src=22,action=output:{}", dut_id, both),
        format!("table=0,priority=10,tcp6,in_port={},tp_src=179,action=output:{}", dut_id, both),
        format!("table=0,priority=10,tcp6,in_port={},tp_dst=179,action=output:{}", dut_id, both),
        format!("table=0,priority=10,tcp6,in_port={},tp_dst=22,action=output:{}", dut_id, both),
        format!("table=0,priority=10,tcp6,in_port={},tp_src=22,action=output:{}", dut_id, both),
        format!("table=0,priority=10,ip,in_port={},nw_proto=4,action=output:{}", dut_id, both),
        format!("table=0,priority=8,ip,in_port={},nw_frag=yes,action=output:{}", dut_id, both),
        format!("table=0,priority=8,ipv6,in_port={},nw_frag=yes,action=output:{}", dut_id, both),
        format!("table=0,priority=8,icmp,in_port={},action=output:{}", dut_id, both),
        format!("table=0,priority=8,icmp6,in_port={},action=output:{}", dut_id, both),
        format!("table=0,priority=8,udp,in_port={},udp_src=161,action=output:{}", dut_id, both),
        format!("table=0,priority=8,udp,in_port={},udp_src=53,action=output:{}", dut_id, vm_id),
        format!("table=0,priority=8,udp6,in_port={},udp_src=161,action=output:{}", dut_id, both),
        format!("table=0,priority=6,udp6,in_port={},udp_dst=4784,action=output:{}", dut_id, injected_id),
        format!("table=0,priority=5,ip,in_port={},action=output:{}", dut_id, injected_id),
        format!("table=0,priority=5,ipv6,in_port={},action=output:{}", dut_id, both),
        format!("table=0,priority=3,in_port={},action=output:{}", dut_id, both),
        format!("table=0,priority=10,ip,in_port={},nw_proto=89,action=output:{}", dut_id, both),
        format!("table=0,priority=10,ipv6,in_port={},nw_proto=89,action=output:{}", dut_id, both),
        format!("table=0,priority=10,udp,in_port={},udp_dst=3784,action=output:{}", dut_id, both),
        format!("table=0,priority=10,udp6,in_port={},udp_dst=3784,action=output:{}", dut_id, both),
        format!("table=0,priority=10,udp,in_port={},udp_src=49152,udp_dst=3784,action=output:{}", dut_id, both),
        format!("table=0,priority=10,udp6,in_port={},udp_src=49152,udp_dst=3784,action=output:{}", dut_id, both),
    ]
}

/// Parameters for [`VmTopology::init`].
#[derive(Debug, Clone, Default)]
pub struct InitParams {
    /// Name of the vm set (restricted to [`VM_SET_NAME_MAX_LEN`] characters).
    pub vm_set_name: String,
    /// First VM of the set (logical offset 0); required when VMs are declared.
    pub vm_base: Option<String>,
    /// DUT name -> front-panel vlan index (as string) -> OS interface name.
    pub duts_fp_ports: BTreeMap<String, BTreeMap<String, String>>,
    /// Ordered DUT names.
    pub duts_name: Vec<String>,
    /// Pid of the PTF container, resolved externally; `None` if not running.
    pub ptf_pid: Option<u32>,
    /// Verify that enough per-VM bridges exist for every declared vlan.
    pub check_bridge: bool,
    /// Simulated NIC addresses per active-active host interface.
    pub mux_cable_facts: BTreeMap<String, MuxCableFact>,
}

/// # VM Topology
///
/// The resolved topology plus all fabric operations. Created once per invocation; `create` and
/// `destroy` only need [`VmTopology::new`], everything else also needs [`VmTopology::init`].
pub struct VmTopology {
    vm_names: Vec<String>,
    vm_properties: BTreeMap<String, VmProperties>,
    fp_mtu: u32,
    max_fp_num: usize,
    topo: Topology,
    worker: Worker,
    current_vm_name: Option<String>,
    is_dpu: bool,
    is_vs_chassis: bool,

    // resolved by init
    vm_set_name: String,
    duts_name: Vec<String>,
    duts_fp_ports: BTreeMap<String, BTreeMap<String, String>>,
    pid: Option<u32>,
    vm_base_index: usize,
    vms: BTreeMap<String, VmAttrs>,
    is_multi_duts: bool,
    is_cable: bool,
    netns: Option<String>,
    mux_cable_facts: BTreeMap<String, MuxCableFact>,
    bp_bridge: String,
    vlan_ids: BTreeMap<String, String>,
    dut_type: Option<String>,
}

impl VmTopology {
    /// Create a new topology handle from the environment facts.
    pub fn new(
        vm_names: Vec<String>,
        vm_properties: BTreeMap<String, VmProperties>,
        fp_mtu: u32,
        max_fp_num: usize,
        topo: Topology,
        worker: Worker,
        current_vm_name: Option<String>,
        is_dpu: bool,
        is_vs_chassis: bool,
    ) -> Self {
        Self {
            vm_names,
            vm_properties,
            fp_mtu,
            max_fp_num,
            topo,
            worker,
            current_vm_name,
            is_dpu,
            is_vs_chassis,
            vm_set_name: String::new(),
            duts_name: Vec::new(),
            duts_fp_ports: BTreeMap::new(),
            pid: None,
            vm_base_index: 0,
            vms: BTreeMap::new(),
            is_multi_duts: false,
            is_cable: false,
            netns: None,
            mux_cable_facts: BTreeMap::new(),
            bp_bridge: String::new(),
            vlan_ids: BTreeMap::new(),
            dut_type: None,
        }
    }

    /// Resolve the topology against the vm set and the live host state.
    pub fn init(&mut self, params: InitParams) -> Result<()> {
        self.vm_set_name = params.vm_set_name;
        self.duts_name = params.duts_name;
        self.duts_fp_ports = params.duts_fp_ports;
        self.pid = params.ptf_pid;
        self.mux_cable_facts = params.mux_cable_facts;

        let declared: Vec<(&String, &VmAttrs)> = if self.is_dpu {
            self.topo.dpus.iter().collect()
        } else {
            self.topo.vms.iter().collect()
        };

        self.vms = BTreeMap::new();
        if !declared.is_empty() {
            let vm_base = params.vm_base.as_ref().ok_or_else(|| {
                Error::InvalidConfig("vm_base is required when VMs are declared".to_string())
            })?;
            self.vm_base_index = self
                .vm_names
                .iter()
                .position(|n| n == vm_base)
                .ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "VM_base \"{}\" should be present in current vm_names: {:?}",
                        vm_base, self.vm_names
                    ))
                })?;
            for (name, attrs) in declared {
                if let Some(current) = &self.current_vm_name {
                    let expected = self.vm_names.get(self.vm_base_index + attrs.vm_offset);
                    if expected.map(|n| n == current).unwrap_or(false) {
                        self.vms.insert(name.clone(), attrs.clone());
                        break;
                    }
                } else if self.vm_base_index + attrs.vm_offset < self.vm_names.len() {
                    self.vms.insert(name.clone(), attrs.clone());
                }
            }
        }

        if params.check_bridge {
            self.check_fp_bridges()?;
        }

        self.is_multi_duts = self.duts_name.len() > 1;
        // a cable topology has two ToRs and no VMs at all
        self.is_cable = self.duts_name.len() > 1 && self.topo.vms.is_empty();

        if !self.topo.host_interfaces_active_active.is_empty() {
            self.netns = Some(netns_name(&self.vm_set_name));
        } else {
            self.netns = None;
        }

        self.bp_bridge = backplane_bridge_name(&self.vm_set_name);

        if self.is_vs_chassis {
            if vs_chassis_midplane_bridge_name(&self.vm_set_name).len() > MAX_INTF_LEN {
                return Err(Error::InvalidConfig(
                    "The length of the VS chassis midplane bridge name is too long.".to_string(),
                ));
            }
            if vs_chassis_inband_bridge_name(&self.vm_set_name).len() > MAX_INTF_LEN {
                return Err(Error::InvalidConfig(
                    "The length of the VS chassis inband bridge name is too long.".to_string(),
                ));
            }
        }

        self.dut_type = self
            .vm_properties
            .values()
            .find_map(|p| p.dut_type.clone());

        if self.dut_type.as_deref() == Some(BACKEND_TOR_TYPE) {
            self.vlan_ids = self.topo.vlan_ids()?;
        }

        Ok(())
    }

    /// The netns of the vm set, if an active-active group exists.
    pub fn netns(&self) -> Option<&str> {
        self.netns.as_deref()
    }

    /// The name of the vm set.
    pub fn vm_set_name(&self) -> &str {
        &self.vm_set_name
    }

    fn pid(&self) -> Result<u32> {
        self.pid.ok_or_else(|| {
            Error::InvalidConfig(format!(
                "PTF container {} is not running",
                ptf_container_name(&self.vm_set_name)
            ))
        })
    }

    fn netns_name(&self) -> Result<&str> {
        self.netns.as_deref().ok_or_else(|| {
            Error::InvalidConfig("no network namespace for this vm set".to_string())
        })
    }

    fn vm_name(&self, offset: usize) -> Result<&str> {
        self.vm_names
            .get(self.vm_base_index + offset)
            .map(|s| s.as_str())
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "vm_offset {} is outside of the vm name list",
                    offset
                ))
            })
    }

    fn dut_fp_port(&self, port: &PortRef) -> Result<Option<&String>> {
        let dut_name = self.duts_name.get(port.dut_index).ok_or_else(|| {
            Error::InvalidTopology(format!("no DUT with index {}", port.dut_index))
        })?;
        Ok(self
            .duts_fp_ports
            .get(dut_name)
            .and_then(|ports| ports.get(&port.vlan_index.to_string())))
    }

    fn required_dut_fp_port(&self, port: &PortRef) -> Result<&String> {
        self.dut_fp_port(port)?.ok_or_else(|| {
            Error::InvalidTopology(format!("no front-panel port mapped for {}", port))
        })
    }

    /// Verify that every VM has at least as many front-panel bridges as declared vlans.
    fn check_fp_bridges(&self) -> Result<()> {
        let intf_names: Vec<String> = fs::read_dir("/sys/class/net")?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        for (hostname, attrs) in &self.vms {
            let vm_name = self.vm_name(attrs.vm_offset)?;
            let re = Regex::new(&fp_bridge_regex(vm_name)).unwrap();
            let num_intfs = intf_names.iter().filter(|i| re.is_match(i)).count();
            if attrs.vlans.len() > num_intfs {
                return Err(Error::InvalidTopology(format!(
                    "Wrong vlans parameter for hostname {}, vm {}. Too many vlans. Maximum is {}",
                    hostname, vm_name, num_intfs
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------------------------
    // bridge lifecycle
    // ------------------------------------------------------------------------------------------

    /// Create the per-VM front-panel bridges for every VM on this host.
    pub fn create_bridges(&self) -> Result<()> {
        for vm in &self.vm_names {
            for fp_num in 0..self.max_fp_num {
                self.create_ovs_bridge(&fp_bridge_name(vm, fp_num), self.fp_mtu)?;
            }
        }
        Ok(())
    }

    /// Destroy the per-VM front-panel bridges for every VM on this host.
    pub fn destroy_bridges(&self) -> Result<()> {
        for vm in &self.vm_names {
            for fp_num in 0..self.max_fp_num {
                self.destroy_ovs_bridge(&fp_bridge_name(vm, fp_num))?;
            }
        }
        Ok(())
    }

    fn create_ovs_bridge(&self, bridge_name: &str, mtu: u32) -> Result<()> {
        info!("=== Create bridge {} with mtu {} ===", bridge_name, mtu);
        Cmd::new(format!("ovs-vsctl --may-exist add-br {}", bridge_name)).run()?;
        if mtu != DEFAULT_MTU {
            Cmd::new(format!("ifconfig {} mtu {}", bridge_name, mtu)).run()?;
        }
        Cmd::new(format!("ifconfig {} up", bridge_name)).run()?;
        Ok(())
    }

    fn destroy_ovs_bridge(&self, bridge_name: &str) -> Result<()> {
        info!("=== Destroy bridge {} ===", bridge_name);
        Cmd::new(format!("ovs-vsctl --if-exists del-br {}", bridge_name)).run()?;
        Ok(())
    }

    // ------------------------------------------------------------------------------------------
    // veth pairs into the PTF container and the netns
    // ------------------------------------------------------------------------------------------

    /// Inject the front-panel veth pairs of every VM into the PTF container.
    pub fn add_injected_fp_ports_to_ptf(&self) -> Result<()> {
        for (vm, attrs) in &self.vms {
            for vlan in &attrs.vlans {
                let ext_if = injected_iface_name(&self.vm_set_name, vlan.ptf_index);
                let int_if = eth_iface_name(vlan.ptf_index);
                let properties = self.vm_properties.get(vm).cloned().unwrap_or_default();
                let device_type = properties.device_type.as_deref();
                if device_type == Some(BACKEND_TOR_TYPE) || device_type == Some(BACKEND_LEAF_TYPE)
                {
                    let separator = properties
                        .sub_interface_separator
                        .unwrap_or_else(|| SUB_INTERFACE_SEPARATOR.to_string());
                    let vlan_id = properties
                        .sub_interface_vlan_id
                        .unwrap_or_else(|| SUB_INTERFACE_VLAN_ID.to_string());
                    self.add_veth_if_to_ptf(&ext_if, &int_if, Some((&separator, &vlan_id)))?;
                } else {
                    self.add_veth_if_to_ptf(&ext_if, &int_if, None)?;
                }
            }
        }
        Ok(())
    }

    /// Inject the veth pairs of all OVS links into the PTF container.
    pub fn add_injected_ovs_ports_to_ptf(&self) -> Result<()> {
        for attrs in self.topo.ovs_links.values() {
            for vlan in &attrs.vlans {
                let ext_if = injected_iface_name(&self.vm_set_name, vlan.ptf_index);
                let int_if = eth_iface_name(vlan.ptf_index);
                self.add_veth_if_to_ptf(&ext_if, &int_if, None)?;
            }
        }
        Ok(())
    }

    /// Attach the management port to the PTF container and configure its addresses.
    pub fn add_mgmt_port_to_ptf(
        &self,
        mgmt_bridge: &str,
        mgmt_ip: &str,
        mgmt_gw: Option<&str>,
        mgmt_ipv6: Option<&str>,
        mgmt_gw_v6: Option<&str>,
        extra_mgmt_ip: &[String],
    ) -> Result<()> {
        let pid = self.pid()?;
        if intf_not_exists(MGMT_PORT_NAME, Scope::Container(pid)) {
            self.add_br_if_to_ptf(
                mgmt_bridge,
                &ptf_mgmt_iface_name(&self.vm_set_name),
                MGMT_PORT_NAME,
            )?;
        }
        self.add_ip_to_ptf_if(
            MGMT_PORT_NAME,
            mgmt_ip,
            mgmt_ipv6,
            mgmt_gw,
            mgmt_gw_v6,
            extra_mgmt_ip,
        )
    }

    /// Attach the backplane port to the PTF container and configure its addresses.
    pub fn add_bp_port_to_ptf(&self, bp_ip: &str, bp_ipv6: Option<&str>) -> Result<()> {
        self.add_br_if_to_ptf(
            &self.bp_bridge,
            &ptf_backplane_iface_name(&self.vm_set_name),
            BP_PORT_NAME,
        )?;
        self.add_ip_to_ptf_if(BP_PORT_NAME, bp_ip, bp_ipv6, None, None, &[])?;
        iface_disable_txoff(BP_PORT_NAME, Some(self.pid()?))?;
        Ok(())
    }

    /// Create a veth pair from a bridge into the PTF container.
    fn add_br_if_to_ptf(&self, bridge: &str, ext_if: &str, int_if: &str) -> Result<()> {
        let pid = self.pid()?;
        // unique suffix on the internal end, so concurrent vm sets cannot collide
        let tmp_int_if = format!(
            "{}{}",
            int_if,
            fingerprint(ext_if, MAX_INTF_LEN - int_if.len())
        );
        info!(
            "=== For veth pair, add {} to bridge {}, set {} to PTF container, tmp intf {}",
            ext_if, bridge, int_if, tmp_int_if
        );
        if intf_not_exists(ext_if, Scope::Host) {
            Cmd::new(format!(
                "ip link add {} type veth peer name {}",
                ext_if, tmp_int_if
            ))
            .run()?;
        }

        let (_, if_to_br) = brctl_show(Some(bridge));
        if !if_to_br.contains_key(ext_if) {
            Cmd::new(format!("brctl addif {} {}", bridge, ext_if)).run()?;
        }

        iface_up(ext_if, Scope::Host)?;

        if intf_exists(&tmp_int_if, Scope::Host)
            && intf_not_exists(&tmp_int_if, Scope::Container(pid))
        {
            Cmd::new(format!("ip link set dev {} netns {}", tmp_int_if, pid)).run()?;
            Cmd::new(
                Scope::Container(pid)
                    .wrap(&format!("ip link set dev {} name {}", tmp_int_if, int_if)),
            )
            .run()?;
        }

        iface_up(int_if, Scope::Container(pid))?;
        Ok(())
    }

    /// Create a veth pair from a bridge into the netns.
    fn add_br_if_to_netns(&self, bridge: &str, ext_if: &str, int_if: &str) -> Result<()> {
        let netns = self.netns_name()?.to_string();
        let tmp_int_if = format!(
            "{}{}",
            int_if,
            fingerprint(ext_if, MAX_INTF_LEN - int_if.len())
        );
        info!(
            "=== For veth pair, add {} to bridge {}, set {} to netns, tmp intf {}",
            ext_if, bridge, int_if, tmp_int_if
        );
        if intf_not_exists(ext_if, Scope::Host) {
            Cmd::new(format!(
                "ip link add {} type veth peer name {}",
                ext_if, tmp_int_if
            ))
            .run()?;
        }

        let (_, if_to_br) = brctl_show(Some(bridge));
        if !if_to_br.contains_key(ext_if) {
            Cmd::new(format!("brctl addif {} {}", bridge, ext_if)).run()?;
        }

        iface_up(ext_if, Scope::Host)?;

        if intf_exists(&tmp_int_if, Scope::Host)
            && intf_not_exists(&tmp_int_if, Scope::Netns(&netns))
        {
            Cmd::new(format!("ip link set dev {} netns {}", tmp_int_if, netns)).run()?;
            Cmd::new(
                Scope::Netns(&netns)
                    .wrap(&format!("ip link set dev {} name {}", tmp_int_if, int_if)),
            )
            .run()?;
        }

        iface_up(int_if, Scope::Netns(&netns))?;
        Ok(())
    }

    /// Configure addresses and default routes on a PTF container interface.
    fn add_ip_to_ptf_if(
        &self,
        int_if: &str,
        mgmt_ip: &str,
        mgmt_ipv6: Option<&str>,
        mgmt_gw: Option<&str>,
        mgmt_gw_v6: Option<&str>,
        extra_mgmt_ip: &[String],
    ) -> Result<()> {
        let pid = self.pid()?;
        let scope = Scope::Container(pid);
        if !intf_exists(int_if, scope) {
            return Ok(());
        }
        if !ip_exists(int_if, mgmt_ip, scope, false) {
            Cmd::new(scope.wrap(&format!("ip addr add {} dev {}", mgmt_ip, int_if))).run()?;
        }
        for ip_addr in extra_mgmt_ip {
            if !ip_addr.is_empty() && !ip_exists(int_if, ip_addr, scope, false) {
                Cmd::new(scope.wrap(&format!("ip addr add {} dev {}", ip_addr, int_if))).run()?;
            }
        }
        if let Some(gw) = mgmt_gw {
            if !route_exists(gw, scope, false) {
                Cmd::new(scope.wrap(&format!("ip route add default via {} dev {}", gw, int_if)))
                    .run()?;
            }
        }
        if let Some(ipv6) = mgmt_ipv6 {
            if !ip_exists(int_if, ipv6, scope, true) {
                Cmd::new(scope.wrap(&format!("ip -6 addr add {} dev {}", ipv6, int_if))).run()?;
            }
            if let Some(gw_v6) = mgmt_gw_v6 {
                if !route_exists(gw_v6, scope, true) {
                    Cmd::new(
                        scope.wrap(&format!("ip -6 route add default via {} dev {}", gw_v6, int_if)),
                    )
                    .run()?;
                }
            }
        }
        Ok(())
    }

    /// Configure addresses and default routes on a netns interface.
    fn add_ip_to_netns_if(
        &self,
        int_if: &str,
        ip_addr: &str,
        ipv6_addr: Option<&str>,
        default_gw: Option<&str>,
        default_gw_v6: Option<&str>,
    ) -> Result<()> {
        let netns = self.netns_name()?.to_string();
        let scope = Scope::Netns(&netns);
        if !intf_exists(int_if, scope) {
            return Ok(());
        }
        Cmd::new(scope.wrap(&format!("ip addr flush dev {}", int_if))).run()?;
        Cmd::new(scope.wrap(&format!("ip addr add {} dev {}", ip_addr, int_if))).run()?;
        if let Some(gw) = default_gw {
            Cmd::new(scope.wrap("ip route flush default")).run()?;
            Cmd::new(scope.wrap(&format!("ip route add default via {} dev {}", gw, int_if)))
                .run()?;
        }
        if let Some(ipv6) = ipv6_addr {
            Cmd::new(scope.wrap(&format!("ip -6 addr flush dev {}", int_if))).run()?;
            Cmd::new(scope.wrap(&format!("ip -6 addr add {} dev {}", ipv6, int_if))).run()?;
            if let Some(gw_v6) = default_gw_v6 {
                Cmd::new(scope.wrap("ip -6 route flush default")).run()?;
                Cmd::new(
                    scope.wrap(&format!("ip -6 route add default via {} dev {}", gw_v6, int_if)),
                )
                .run()?;
            }
        }
        Ok(())
    }

    /// Move a DUT port into the PTF container under its PTF name.
    fn add_dut_if_to_ptf(&self, iface_name: &str, dut_iface: &str) -> Result<()> {
        info!(
            "=== Add DUT interface {} to PTF container as {} ===",
            dut_iface, iface_name
        );
        let pid = self.pid()?;
        let scope = Scope::Container(pid);
        if intf_exists(dut_iface, Scope::Host)
            && intf_not_exists(dut_iface, scope)
            && intf_not_exists(iface_name, scope)
        {
            Cmd::new(format!("ip link set dev {} netns {}", dut_iface, pid)).run()?;
        }
        if intf_exists(dut_iface, scope) && intf_not_exists(iface_name, scope) {
            Cmd::new(scope.wrap(&format!("ip link set dev {} name {}", dut_iface, iface_name)))
                .run()?;
        }
        iface_up(iface_name, scope)?;
        Ok(())
    }

    /// Create a vlan sub-interface on a PTF port (back-end ToR topologies).
    fn add_dut_vlan_subif_to_ptf(
        &self,
        iface_name: &str,
        vlan_separator: &str,
        vlan_id: &str,
    ) -> Result<()> {
        let pid = self.pid()?;
        let scope = Scope::Container(pid);
        if intf_not_exists(iface_name, scope) {
            return Err(Error::InvalidConfig(format!(
                "Interface {} not present in the PTF container",
                iface_name
            )));
        }
        let vlan_sub_iface = format!("{}{}{}", iface_name, vlan_separator, vlan_id);
        Cmd::new(scope.wrap(&format!(
            "ip link add link {} name {} type vlan id {}",
            iface_name, vlan_sub_iface, vlan_id
        )))
        .run()?;
        Cmd::new(scope.wrap(&format!("ip link set {} up", vlan_sub_iface))).run()?;
        Ok(())
    }

    /// Give a PTF port back to the root namespace under its DUT name.
    fn remove_dut_if_from_ptf(&self, iface_name: &str, dut_iface: &str) -> Result<()> {
        info!(
            "=== Restore PTF interface {} as dut interface {} ===",
            iface_name, dut_iface
        );
        let pid = match self.pid {
            Some(pid) => pid,
            None => return Ok(()),
        };
        let scope = Scope::Container(pid);
        if intf_exists(iface_name, scope) {
            iface_down(iface_name, scope)?;
            if intf_not_exists(dut_iface, scope) {
                Cmd::new(scope.wrap(&format!("ip link set dev {} name {}", iface_name, dut_iface)))
                    .run()?;
            }
        }
        if intf_not_exists(dut_iface, Scope::Host) && intf_exists(dut_iface, scope) {
            Cmd::new(scope.wrap(&format!("ip link set dev {} netns 1", dut_iface))).run()?;
        }
        Ok(())
    }

    /// Remove the vlan sub-interface of a PTF port.
    fn remove_dut_vlan_subif_from_ptf(
        &self,
        iface_name: &str,
        vlan_separator: &str,
        vlan_id: &str,
    ) -> Result<()> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return Ok(()),
        };
        let scope = Scope::Container(pid);
        let vlan_sub_iface = format!("{}{}{}", iface_name, vlan_separator, vlan_id);
        if intf_exists(&vlan_sub_iface, scope) {
            iface_down(&vlan_sub_iface, scope)?;
            Cmd::new(scope.wrap(&format!("ip link del {}", vlan_sub_iface))).run()?;
        }
        Ok(())
    }

    /// Create a veth pair `(ext_if, int_if)` and move `int_if` into the PTF container.
    ///
    /// The internal end is created under a collision-resistant temporary name and renamed only
    /// after it arrived inside the container, so concurrent invocations for different vm sets
    /// never fight over a shared final name. With `vlan_subintf`, a vlan sub-interface rides
    /// along through the same two-phase migration.
    fn add_veth_if_to_ptf(
        &self,
        ext_if: &str,
        int_if: &str,
        vlan_subintf: Option<(&str, &str)>,
    ) -> Result<()> {
        info!(
            "=== Create veth pair {}/{}, set {} to PTF container namespace ===",
            ext_if, int_if, int_if
        );
        let pid = self.pid()?;
        let scope = Scope::Container(pid);

        let reserved = vlan_subintf
            .map(|(sep, id)| sep.len() + id.len())
            .unwrap_or(0);
        let t_int_if = adaptive_temporary_name(&self.vm_set_name, int_if, reserved)?;
        let sub_names = vlan_subintf.map(|(sep, id)| {
            (
                format!("{}{}{}", int_if, sep, id),
                format!("{}{}{}", t_int_if, sep, id),
            )
        });

        if intf_exists(&t_int_if, Scope::Host) {
            Cmd::new(format!("ip link del dev {}", t_int_if)).run()?;
        }

        if intf_not_exists(ext_if, Scope::Host) {
            Cmd::new(format!(
                "ip link add {} type veth peer name {}",
                ext_if, t_int_if
            ))
            .run()?;
            if let Some((_, vlan_id)) = vlan_subintf {
                Cmd::new(format!("vconfig add {} {}", t_int_if, vlan_id)).run()?;
            }
        }

        if self.fp_mtu != DEFAULT_MTU {
            Cmd::new(format!("ip link set dev {} mtu {}", ext_if, self.fp_mtu)).run()?;
            // fix up whichever end currently holds the internal interface
            if intf_exists(&t_int_if, Scope::Host) {
                Cmd::new(format!("ip link set dev {} mtu {}", t_int_if, self.fp_mtu)).run()?;
            } else if intf_exists(&t_int_if, scope) {
                Cmd::new(scope.wrap(&format!("ip link set dev {} mtu {}", t_int_if, self.fp_mtu)))
                    .run()?;
            } else if intf_exists(int_if, scope) {
                Cmd::new(scope.wrap(&format!("ip link set dev {} mtu {}", int_if, self.fp_mtu)))
                    .run()?;
            }
            if let Some((int_sub_if, t_int_sub_if)) = &sub_names {
                if intf_exists(t_int_sub_if, Scope::Host) {
                    Cmd::new(format!("ip link set dev {} mtu {}", t_int_sub_if, self.fp_mtu))
                        .run()?;
                } else if intf_exists(t_int_sub_if, scope) {
                    Cmd::new(
                        scope.wrap(&format!("ip link set dev {} mtu {}", t_int_sub_if, self.fp_mtu)),
                    )
                    .run()?;
                } else if intf_exists(int_sub_if, scope) {
                    Cmd::new(
                        scope.wrap(&format!("ip link set dev {} mtu {}", int_sub_if, self.fp_mtu)),
                    )
                    .run()?;
                }
            }
        }

        iface_up(ext_if, Scope::Host)?;

        if intf_exists(&t_int_if, Scope::Host)
            && intf_not_exists(&t_int_if, scope)
            && intf_not_exists(int_if, scope)
        {
            Cmd::new(format!("ip link set dev {} netns {}", t_int_if, pid)).run()?;
        }
        if let Some((int_sub_if, t_int_sub_if)) = &sub_names {
            if intf_exists(t_int_sub_if, Scope::Host)
                && intf_not_exists(t_int_sub_if, scope)
                && intf_not_exists(int_sub_if, scope)
            {
                Cmd::new(format!("ip link set dev {} netns {}", t_int_sub_if, pid)).run()?;
            }
        }

        if intf_exists(&t_int_if, scope) && intf_not_exists(int_if, scope) {
            Cmd::new(scope.wrap(&format!("ip link set dev {} name {}", t_int_if, int_if)))
                .run()?;
        }
        if let Some((int_sub_if, t_int_sub_if)) = &sub_names {
            if intf_exists(t_int_sub_if, scope) && intf_not_exists(int_sub_if, scope) {
                Cmd::new(
                    scope.wrap(&format!("ip link set dev {} name {}", t_int_sub_if, int_sub_if)),
                )
                .run()?;
            }
        }

        iface_up(int_if, scope)?;
        if let Some((int_sub_if, _)) = &sub_names {
            iface_up(int_sub_if, scope)?;
        }
        Ok(())
    }

    /// Create a veth pair `(ext_if, int_if)` and move `int_if` into the netns.
    fn add_veth_if_to_netns(&self, ext_if: &str, int_if: &str) -> Result<()> {
        let netns = self.netns_name()?.to_string();
        info!(
            "=== Create veth pair {}/{}, set {} to netns {} ===",
            ext_if, int_if, int_if, netns
        );
        let scope = Scope::Netns(&netns);

        let t_int_if = adaptive_temporary_name(&self.vm_set_name, int_if, 0)?;

        if intf_exists(&t_int_if, Scope::Host) {
            Cmd::new(format!("ip link del dev {}", t_int_if)).run()?;
        }

        if intf_not_exists(ext_if, Scope::Host) {
            Cmd::new(format!(
                "ip link add {} type veth peer name {}",
                ext_if, t_int_if
            ))
            .run()?;
        }

        if self.fp_mtu != DEFAULT_MTU {
            Cmd::new(format!("ip link set dev {} mtu {}", ext_if, self.fp_mtu)).run()?;
            if intf_exists(&t_int_if, Scope::Host) {
                Cmd::new(format!("ip link set dev {} mtu {}", t_int_if, self.fp_mtu)).run()?;
            } else if intf_exists(&t_int_if, scope) {
                Cmd::new(scope.wrap(&format!("ip link set dev {} mtu {}", t_int_if, self.fp_mtu)))
                    .run()?;
            } else if intf_exists(int_if, scope) {
                Cmd::new(scope.wrap(&format!("ip link set dev {} mtu {}", int_if, self.fp_mtu)))
                    .run()?;
            }
        }

        iface_up(ext_if, Scope::Host)?;

        if intf_exists(&t_int_if, Scope::Host)
            && intf_not_exists(&t_int_if, scope)
            && intf_not_exists(int_if, scope)
        {
            Cmd::new(format!("ip link set dev {} netns {}", t_int_if, netns)).run()?;
        }

        if intf_exists(&t_int_if, scope) && intf_not_exists(int_if, scope) {
            Cmd::new(scope.wrap(&format!("ip link set dev {} name {}", t_int_if, int_if)))
                .run()?;
        }

        iface_up(int_if, scope)?;
        Ok(())
    }

    /// Remove a veth pair from the PTF container.
    ///
    /// The internal end is renamed back to its temporary name and moved to the root namespace
    /// first, so a half-bound container never holds a final name that a re-bind would fight over.
    fn remove_veth_if_from_ptf(&self, ext_if: &str, int_if: &str, tmp_name: &str) -> Result<()> {
        info!(
            "=== Cleanup port, int_if: {}, ext_if: {}, tmp_name: {} ===",
            int_if, ext_if, tmp_name
        );
        if let Some(pid) = self.pid {
            let scope = Scope::Container(pid);
            if intf_exists(int_if, scope) {
                iface_down(int_if, scope)?;
                Cmd::new(scope.wrap(&format!("ip link set dev {} name {}", int_if, tmp_name)))
                    .run()?;
                Cmd::new(scope.wrap(&format!("ip link set dev {} netns 1", tmp_name))).run()?;
            }
        }
        if intf_exists(ext_if, Scope::Host) {
            Cmd::new(format!("ip link delete dev {} || true", ext_if))
                .shell()
                .run()?;
        }
        Ok(())
    }

    /// Remove the PTF management veth pair.
    pub fn remove_ptf_mgmt_port(&self) -> Result<()> {
        let ext_if = ptf_mgmt_iface_name(&self.vm_set_name);
        let tmp_name = format!(
            "{}{}",
            MGMT_PORT_NAME,
            fingerprint(&ext_if, MAX_INTF_LEN - MGMT_PORT_NAME.len())
        );
        self.remove_veth_if_from_ptf(&ext_if, MGMT_PORT_NAME, &tmp_name)
    }

    /// Remove the PTF backplane veth pair.
    pub fn remove_ptf_backplane_port(&self) -> Result<()> {
        let ext_if = ptf_backplane_iface_name(&self.vm_set_name);
        let tmp_name = format!(
            "{}{}",
            BP_PORT_NAME,
            fingerprint(&ext_if, MAX_INTF_LEN - BP_PORT_NAME.len())
        );
        self.remove_veth_if_from_ptf(&ext_if, BP_PORT_NAME, &tmp_name)
    }

    /// Remove every injected front-panel veth pair from the PTF container.
    pub fn remove_injected_fp_ports_from_ptf(&self) -> Result<()> {
        for (vm, attrs) in &self.vms {
            for vlan in &attrs.vlans {
                let ext_if = injected_iface_name(&self.vm_set_name, vlan.ptf_index);
                let int_if = eth_iface_name(vlan.ptf_index);
                let properties = self.vm_properties.get(vm).cloned().unwrap_or_default();
                let device_type = properties.device_type.as_deref();
                if device_type == Some(BACKEND_TOR_TYPE) || device_type == Some(BACKEND_LEAF_TYPE)
                {
                    continue;
                }
                let tmp_name = format!(
                    "{}{}",
                    int_if,
                    fingerprint(&ext_if, MAX_INTF_LEN - int_if.len())
                );
                self.remove_veth_if_from_ptf(&ext_if, &int_if, &tmp_name)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------------------------
    // management ports
    // ------------------------------------------------------------------------------------------

    /// Attach a DUT management port to the management bridge.
    pub fn bind_mgmt_port(&self, br_name: &str, mgmt_port: &str) -> Result<()> {
        info!("=== Bind mgmt port {} to bridge {} ===", mgmt_port, br_name);
        let (_, if_to_br) = brctl_show(Some(br_name));
        if !if_to_br.contains_key(mgmt_port) {
            Cmd::new(format!("brctl addif {} {}", br_name, mgmt_port)).run()?;
        }
        Ok(())
    }

    /// Detach a DUT management port from whatever bridge holds it.
    pub fn unbind_mgmt_port(&self, mgmt_port: &str) -> Result<()> {
        let (_, if_to_br) = brctl_show(None);
        if let Some(bridge) = if_to_br.get(mgmt_port) {
            Cmd::new(format!("brctl delif {} {}", bridge, mgmt_port)).run()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------------------------
    // device interconnects
    // ------------------------------------------------------------------------------------------

    /// Wire every declared DUT-to-DUT interconnect link.
    pub fn bind_devices_interconnect(&self) -> Result<()> {
        for (link_index, vlans) in &self.topo.devices_interconnect_interfaces {
            let bridge = interconnect_bridge_name(&self.vm_set_name, link_index);
            self.create_ovs_bridge(&bridge, self.fp_mtu)?;
            let (first, last) = interconnect_endpoints(link_index, vlans)?;
            let vlan1_iface = self.required_dut_fp_port(first)?.clone();
            let vlan2_iface = self.required_dut_fp_port(last)?.clone();
            self.bind_devices_interconnect_ports(&bridge, &vlan1_iface, &vlan2_iface)?;
        }
        Ok(())
    }

    /// Tear down every declared DUT-to-DUT interconnect link.
    pub fn unbind_devices_interconnect(&self) -> Result<()> {
        for (link_index, vlans) in &self.topo.devices_interconnect_interfaces {
            let bridge = interconnect_bridge_name(&self.vm_set_name, link_index);
            let (first, last) = interconnect_endpoints(link_index, vlans)?;
            let vlan1_iface = self.required_dut_fp_port(first)?.clone();
            let vlan2_iface = self.required_dut_fp_port(last)?.clone();
            self.unbind_ovs_port(&bridge, &vlan1_iface)?;
            self.unbind_ovs_port(&bridge, &vlan2_iface)?;
            self.destroy_ovs_bridge(&bridge)?;
        }
        Ok(())
    }

    /// Attach both endpoint ports to the interconnect bridge and install the pair flows.
    fn bind_devices_interconnect_ports(
        &self,
        br_name: &str,
        vlan1_iface: &str,
        vlan2_iface: &str,
    ) -> Result<()> {
        let ports = get_ovs_br_ports(br_name)?;
        if !ports.contains(vlan1_iface) {
            Cmd::new(format!("ovs-vsctl --may-exist add-port {} {}", br_name, vlan1_iface))
                .run()?;
        }
        if !ports.contains(vlan2_iface) {
            Cmd::new(format!("ovs-vsctl --may-exist add-port {} {}", br_name, vlan2_iface))
                .run()?;
        }
        let bindings = get_ovs_port_bindings(br_name, &[vlan1_iface, vlan2_iface])?;
        let vlan1_id = &bindings[vlan1_iface];
        let vlan2_id = &bindings[vlan2_iface];
        // clear old bindings
        Cmd::new(format!("ovs-ofctl del-flows {}", br_name)).run()?;
        Cmd::new(format!(
            "ovs-ofctl add-flow {} table=0,in_port={},action=output:{}",
            br_name, vlan1_id, vlan2_id
        ))
        .run()?;
        Cmd::new(format!(
            "ovs-ofctl add-flow {} table=0,in_port={},action=output:{}",
            br_name, vlan2_id, vlan1_id
        ))
        .run()?;
        Ok(())
    }

    // ------------------------------------------------------------------------------------------
    // front-panel ports
    // ------------------------------------------------------------------------------------------

    /// Bind the front-panel ports of every VM across DUT, VM and PTF.
    ///
    /// The per-port binds are independent and fan out over the worker pool. With `batch_mode`,
    /// flow installation is deferred to one background `add-flows` process per bridge, all joined
    /// at the end of the pass.
    pub fn bind_fp_ports(&self, disconnect_vm: bool, batch_mode: bool) -> Result<()> {
        let mut bind_args: Vec<(String, String, String, String)> = Vec::new();
        for attrs in self.vms.values() {
            let vm_name = self.vm_name(attrs.vm_offset)?;
            for (idx, vlan) in attrs.vlans.iter().enumerate() {
                let br_name = fp_bridge_name(vm_name, idx);
                let vm_iface = vm_tap_name(vm_name, idx);
                let injected_iface = injected_iface_name(&self.vm_set_name, vlan.ptf_index);
                let dut_iface = match self.dut_fp_port(vlan)? {
                    Some(iface) => iface.clone(),
                    None => continue,
                };
                bind_args.push((br_name, dut_iface, injected_iface, vm_iface));
            }
        }

        let batch = if batch_mode {
            Some(BatchContext::new()?)
        } else {
            None
        };
        self.worker.map(
            |(br_name, dut_iface, injected_iface, vm_iface)| {
                self.bind_ovs_ports(
                    &br_name,
                    &dut_iface,
                    &injected_iface,
                    &vm_iface,
                    disconnect_vm,
                    batch.as_ref(),
                )
            },
            bind_args,
        )?;
        if let Some(batch) = batch {
            batch.finish(BATCH_TIMEOUT)?;
        }

        for (link, attrs) in &self.topo.vm_links {
            info!("Create VM link for {}", link);
            let br_name = format!("br_{}", link.to_lowercase());
            let port1 = vm_tap_name(self.vm_name(attrs.start_vm_offset)?, attrs.start_vm_port_idx);
            let port2 = vm_tap_name(self.vm_name(attrs.end_vm_offset)?, attrs.end_vm_port_idx);
            if attrs.uses_ovs() {
                self.create_ovs_bridge(&br_name, self.fp_mtu)?;
                self.bind_devices_interconnect_ports(&br_name, &port1, &port2)?;
            } else {
                self.bind_vm_link(&br_name, &port1, &port2)?;
            }
        }

        for (link, attrs) in &self.topo.ovs_links {
            info!("Create OVS link for {}", link);
            let br_name = format!("br_{}", link.to_lowercase());
            let port1 = vm_tap_name(self.vm_name(attrs.start_vm_offset)?, attrs.start_vm_port_idx);
            let port2 = vm_tap_name(self.vm_name(attrs.end_vm_offset)?, attrs.end_vm_port_idx);
            self.create_ovs_bridge(&br_name, OVS_LINK_MTU)?;
            for vlan in &attrs.vlans {
                let injected_iface = injected_iface_name(&self.vm_set_name, vlan.ptf_index);
                self.bind_ovs_ports(&br_name, &port1, &injected_iface, &port2, disconnect_vm, None)?;
            }
        }

        Ok(())
    }

    /// Unbind the front-panel ports of every VM.
    pub fn unbind_fp_ports(&self, batch_mode: bool) -> Result<()> {
        info!("=== unbind front panel ports ===");
        let mut unbind_args: Vec<(String, String)> = Vec::new();
        for attrs in self.vms.values() {
            let vm_name = self.vm_name(attrs.vm_offset)?;
            for (idx, _) in attrs.vlans.iter().enumerate() {
                unbind_args.push((fp_bridge_name(vm_name, idx), vm_tap_name(vm_name, idx)));
            }
        }

        let batch = if batch_mode {
            Some(BatchContext::new()?)
        } else {
            None
        };
        self.worker.map(
            |(br_name, vm_iface)| self.unbind_ovs_ports(&br_name, &vm_iface, batch.as_ref()),
            unbind_args,
        )?;
        if let Some(batch) = batch {
            batch.finish(BATCH_TIMEOUT)?;
        }

        for (link, attrs) in &self.topo.vm_links {
            info!("Remove VM link for {}", link);
            let br_name = format!("br_{}", link.to_lowercase());
            let port1 = vm_tap_name(self.vm_name(attrs.start_vm_offset)?, attrs.start_vm_port_idx);
            let port2 = vm_tap_name(self.vm_name(attrs.end_vm_offset)?, attrs.end_vm_port_idx);
            if attrs.uses_ovs() {
                self.unbind_ovs_port(&br_name, &port1)?;
                self.unbind_ovs_port(&br_name, &port2)?;
                self.destroy_ovs_bridge(&br_name)?;
            } else {
                self.unbind_vm_link(&br_name, &port1, &port2)?;
            }
        }

        for (link, attrs) in &self.topo.ovs_links {
            info!("Remove OVS link for {}", link);
            let br_name = format!("br_{}", link.to_lowercase());
            let port1 = vm_tap_name(self.vm_name(attrs.start_vm_offset)?, attrs.start_vm_port_idx);
            let port2 = vm_tap_name(self.vm_name(attrs.end_vm_offset)?, attrs.end_vm_port_idx);
            for vlan in &attrs.vlans {
                let injected_iface = injected_iface_name(&self.vm_set_name, vlan.ptf_index);
                self.unbind_ovs_port(&br_name, &port1)?;
                self.unbind_ovs_port(&br_name, &port2)?;
                self.unbind_ovs_port(&br_name, &injected_iface)?;
            }
            self.destroy_ovs_bridge(&br_name)?;
        }

        Ok(())
    }

    /// Bind DUT, injected and VM port under one OVS bridge and program the flows.
    ///
    /// ```text
    ///                            +----------------------+
    ///                            |                      +---- dut_iface
    ///     PTF (injected_iface) --+ OVS bridge (br_name) |
    ///                            |                      +---- vm_iface
    ///                            +----------------------+
    /// ```
    fn bind_ovs_ports(
        &self,
        br_name: &str,
        dut_iface: &str,
        injected_iface: &str,
        vm_iface: &str,
        disconnect_vm: bool,
        batch: Option<&BatchContext>,
    ) -> Result<()> {
        // steal the ports from any other bridge first
        for iface in &[injected_iface, dut_iface, vm_iface] {
            if let Some(br) = get_ovs_bridge_by_port(iface) {
                if br != br_name {
                    Cmd::new(format!("ovs-vsctl --if-exists del-port {} {}", br, iface)).run()?;
                }
            }
        }

        let ports = get_ovs_br_ports(br_name)?;
        for iface in &[injected_iface, dut_iface, vm_iface] {
            if !ports.contains(*iface) {
                Cmd::new(format!("ovs-vsctl --may-exist add-port {} {}", br_name, iface)).run()?;
            }
        }

        let bindings = get_ovs_port_bindings(br_name, &[dut_iface])?;
        let dut_id = bindings.get(dut_iface).ok_or_else(|| {
            Error::PortBindingNotFound(br_name.to_string(), dut_iface.to_string())
        })?;
        let injected_id = bindings.get(injected_iface).ok_or_else(|| {
            Error::PortBindingNotFound(br_name.to_string(), injected_iface.to_string())
        })?;
        let vm_id = bindings.get(vm_iface).ok_or_else(|| {
            Error::PortBindingNotFound(br_name.to_string(), vm_iface.to_string())
        })?;

        // clear old bindings
        Cmd::new(format!("ovs-ofctl del-flows {}", br_name)).run()?;

        if disconnect_vm {
            // drop packets from the VM, the DUT still reaches the PTF
            Cmd::new(format!(
                "ovs-ofctl add-flow {} table=0,in_port={},action=drop",
                br_name, vm_id
            ))
            .run()?;
            Cmd::new(format!(
                "ovs-ofctl add-flow {} table=0,in_port={},action=output:{}",
                br_name, dut_id, injected_id
            ))
            .run()?;
        } else {
            Cmd::new(format!(
                "ovs-ofctl add-flow {} table=0,in_port={},action=output:{}",
                br_name, vm_id, dut_id
            ))
            .run()?;
            let rules = fp_flow_rules(dut_id, vm_id, injected_id);
            match batch {
                Some(batch) => {
                    let path = batch.write_flow_file(&rules)?;
                    batch.push(fire_and_forget(format!(
                        "ovs-ofctl add-flows {} {}",
                        br_name,
                        path.display()
                    ))?);
                }
                None => {
                    for rule in &rules {
                        Cmd::new(format!("ovs-ofctl add-flow {} {}", br_name, rule)).run()?;
                    }
                }
            }
        }

        // the PTF always reaches the DUT
        Cmd::new(format!(
            "ovs-ofctl add-flow {} table=0,in_port={},action=output:{}",
            br_name, injected_id, dut_id
        ))
        .run()?;
        Ok(())
    }

    /// Unbind all ports except the VM port from an OVS bridge.
    fn unbind_ovs_ports(
        &self,
        br_name: &str,
        vm_port: &str,
        batch: Option<&BatchContext>,
    ) -> Result<()> {
        if !intf_exists(br_name, Scope::Host) {
            return Ok(());
        }
        let ports = get_ovs_br_ports(br_name)?;
        let to_remove: Vec<&String> = ports.iter().filter(|p| p.as_str() != vm_port).collect();
        match batch {
            Some(batch) if !to_remove.is_empty() => {
                let compound: Vec<String> = to_remove
                    .iter()
                    .map(|p| format!("--if-exists del-port {} {}", br_name, p))
                    .collect();
                batch.push(fire_and_forget(format!(
                    "ovs-vsctl -- {}",
                    compound.join(" -- ")
                ))?);
            }
            _ => {
                for port in to_remove {
                    Cmd::new(format!("ovs-vsctl --if-exists del-port {} {}", br_name, port))
                        .run()?;
                }
            }
        }
        Ok(())
    }

    /// Unbind a single port from an OVS bridge.
    fn unbind_ovs_port(&self, br_name: &str, port: &str) -> Result<()> {
        if intf_exists(br_name, Scope::Host) && get_ovs_br_ports(br_name)?.contains(port) {
            Cmd::new(format!("ovs-vsctl --if-exists del-port {} {}", br_name, port)).run()?;
        }
        Ok(())
    }

    /// Wire two VM taps together over a plain bridge.
    fn bind_vm_link(&self, br_name: &str, port1: &str, port2: &str) -> Result<()> {
        if intf_not_exists(br_name, Scope::Host) {
            Cmd::new(format!("brctl addbr {}", br_name)).run()?;
        }
        iface_up(br_name, Scope::Host)?;

        // the taps may still be attached to their fp bridges
        for port in &[port1, port2] {
            if let Some(br) = get_ovs_bridge_by_port(port) {
                Cmd::new(format!("ovs-vsctl --if-exists del-port {} {}", br, port)).run()?;
            }
        }

        let (br_to_ifs, _) = brctl_show(None);
        let members = br_to_ifs.get(br_name).cloned().unwrap_or_default();
        for port in &[port1, port2] {
            if !members.iter().any(|m| m.as_str() == *port) {
                Cmd::new(format!("brctl addif {} {}", br_name, port)).run()?;
            }
        }
        iface_up(port1, Scope::Host)?;
        iface_up(port2, Scope::Host)?;
        Ok(())
    }

    /// Remove a plain VM link bridge.
    fn unbind_vm_link(&self, br_name: &str, port1: &str, port2: &str) -> Result<()> {
        let (_, if_to_br) = brctl_show(None);
        if if_to_br.contains_key(port1) {
            Cmd::new(format!("brctl delif {} {}", br_name, port1)).run()?;
        }
        if if_to_br.contains_key(port2) {
            Cmd::new(format!("brctl delif {} {}", br_name, port2)).run()?;
        }
        Cmd::new(format!("brctl delbr {} || true", br_name)).shell().run()?;
        Ok(())
    }

    // ------------------------------------------------------------------------------------------
    // backplane
    // ------------------------------------------------------------------------------------------

    /// Attach the backplane tap of every VM to the backplane bridge.
    pub fn bind_vm_backplane(&self) -> Result<()> {
        if intf_not_exists(&self.bp_bridge, Scope::Host) {
            Cmd::new(format!("brctl addbr {}", self.bp_bridge)).run()?;
        }
        iface_up(&self.bp_bridge, Scope::Host)?;

        for attrs in self.vms.values() {
            let vm_name = self.vm_name(attrs.vm_offset)?;
            let bp_port_name = vm_backplane_tap_name(vm_name);
            let (br_to_ifs, _) = brctl_show(None);
            let members = br_to_ifs.get(&self.bp_bridge).cloned().unwrap_or_default();
            if !members.iter().any(|m| m == &bp_port_name) {
                Cmd::new(format!("brctl addif {} {}", self.bp_bridge, bp_port_name)).run()?;
            }
            iface_up(&bp_port_name, Scope::Host)?;
        }
        Ok(())
    }

    /// Remove the backplane bridge.
    pub fn unbind_vm_backplane(&self) -> Result<()> {
        if intf_exists(&self.bp_bridge, Scope::Host) {
            iface_down(&self.bp_bridge, Scope::Host)?;
            Cmd::new(format!("brctl delbr {} || true", self.bp_bridge))
                .shell()
                .run()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------------------------
    // virtual chassis
    // ------------------------------------------------------------------------------------------

    /// Create the inband and midplane bridges of a virtual chassis and attach the DUT ports.
    pub fn bind_vs_chassis_ports(
        &self,
        duts_midplane_ports: &BTreeMap<String, Vec<String>>,
        duts_inband_ports: &BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        let inband_br = vs_chassis_inband_bridge_name(&self.vm_set_name);
        let midplane_br = vs_chassis_midplane_bridge_name(&self.vm_set_name);
        self.create_ovs_bridge(&inband_br, self.fp_mtu)?;
        self.create_ovs_bridge(&midplane_br, self.fp_mtu)?;

        for ports in duts_midplane_ports.values() {
            self.bind_vs_dut_ports(&midplane_br, ports)?;
        }
        for ports in duts_inband_ports.values() {
            self.bind_vs_dut_ports(&inband_br, ports)?;
        }
        Ok(())
    }

    /// Detach the virtual-chassis ports and destroy both bridges.
    pub fn unbind_vs_chassis_ports(
        &self,
        duts_midplane_ports: &BTreeMap<String, Vec<String>>,
        duts_inband_ports: &BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        let inband_br = vs_chassis_inband_bridge_name(&self.vm_set_name);
        let midplane_br = vs_chassis_midplane_bridge_name(&self.vm_set_name);
        for ports in duts_midplane_ports.values() {
            self.unbind_vs_dut_ports(&midplane_br, ports)?;
        }
        for ports in duts_inband_ports.values() {
            self.unbind_vs_dut_ports(&inband_br, ports)?;
        }
        self.destroy_ovs_bridge(&inband_br)?;
        self.destroy_ovs_bridge(&midplane_br)?;
        Ok(())
    }

    fn bind_vs_dut_ports(&self, br_name: &str, dut_ports: &[String]) -> Result<()> {
        let br_ports = get_ovs_br_ports(br_name)?;
        for port in dut_ports {
            if let Some(br) = get_ovs_bridge_by_port(port) {
                if br != br_name {
                    Cmd::new(format!("ovs-vsctl --if-exists del-port {} {}", br, port)).run()?;
                }
            }
            if !br_ports.contains(port) {
                Cmd::new(format!("ovs-vsctl --may-exist add-port {} {}", br_name, port)).run()?;
            }
        }
        Ok(())
    }

    fn unbind_vs_dut_ports(&self, br_name: &str, dut_ports: &[String]) -> Result<()> {
        if intf_exists(br_name, Scope::Host) {
            let br_ports = get_ovs_br_ports(br_name)?;
            for port in dut_ports {
                if br_ports.contains(port) {
                    Cmd::new(format!("ovs-vsctl --if-exists del-port {} {}", br_name, port))
                        .run()?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------------------------
    // host ports and dual-ToR cables
    // ------------------------------------------------------------------------------------------

    /// Attach every host-facing port to the PTF container.
    ///
    /// Single-uplink ports are injected directly; dual-ToR ports get a Y-cable bridge with the
    /// host-facing end injected into the container (and, for active-active ports, a simulated
    /// NIC end into the netns).
    pub fn add_host_ports(&self) -> Result<()> {
        let items: Vec<(usize, HostInterface)> = self
            .topo
            .host_interfaces
            .iter()
            .cloned()
            .enumerate()
            .collect();
        self.worker
            .map(|(i, intf)| self.add_host_port(i, &intf), items)
    }

    fn add_host_port(&self, position: usize, intf: &HostInterface) -> Result<()> {
        if self.is_multi_duts && !self.is_cable {
            match intf {
                HostInterface::Dual(upper, lower) => {
                    let host_ifindex = intf.host_ifindex(position);
                    let is_active_active =
                        self.topo.host_interfaces_active_active.contains(intf);
                    let dual_if = if is_active_active {
                        active_active_iface_name(&self.vm_set_name, host_ifindex)
                    } else {
                        muxy_iface_name(&self.vm_set_name, host_ifindex)
                    };
                    let ptf_if = eth_iface_name(host_ifindex);
                    self.add_veth_if_to_ptf(&dual_if, &ptf_if, None)?;

                    let nic_if = if is_active_active {
                        let nic_if = nic_iface_name(&self.vm_set_name, host_ifindex);
                        let ns_if = eth_iface_name(host_ifindex);
                        self.add_veth_if_to_netns(&nic_if, &ns_if)?;
                        let soc_ipv4 = self.mux_cable_fact(host_ifindex)?.soc_ipv4.clone();
                        self.add_ip_to_netns_if(&ns_if, &soc_ipv4, None, None, None)?;
                        Some(nic_if)
                    } else {
                        None
                    };

                    let upper_tor_if = self.required_dut_fp_port(upper)?.clone();
                    let lower_tor_if = self.required_dut_fp_port(lower)?.clone();
                    self.create_dualtor_cable(
                        host_ifindex,
                        &dual_if,
                        &upper_tor_if,
                        &lower_tor_if,
                        0,
                        nic_if.as_deref(),
                    )?;
                }
                HostInterface::Port(port) => {
                    let host_ifindex = intf.host_ifindex(position);
                    let fp_port = self.required_dut_fp_port(port)?.clone();
                    self.add_dut_if_to_ptf(&eth_iface_name(host_ifindex), &fp_port)?;
                }
            }
        } else if self.is_multi_duts && self.is_cable {
            // in a cable topology some ports may not be wired at all, only inject the ones
            // which have a mapped front-panel port
            if let HostInterface::Dual(upper, lower) = intf {
                for port in &[upper, lower] {
                    if let Some(fp_port) = self.dut_fp_port(port)? {
                        let fp_port = fp_port.clone();
                        self.add_dut_if_to_ptf(&eth_iface_name(port.ptf_index), &fp_port)?;
                    }
                }
            }
        } else {
            let port = intf.first();
            let fp_port = self.required_dut_fp_port(port)?.clone();
            let ptf_if = eth_iface_name(port.ptf_index);
            self.add_dut_if_to_ptf(&ptf_if, &fp_port)?;
            // only create sub interfaces for enabled ports of a back-end ToR
            if self.dut_type.as_deref() == Some(BACKEND_TOR_TYPE)
                && !self.topo.disabled_host_interfaces.contains(intf)
            {
                let separator = self.topo.sub_interface_separator().to_string();
                let vlan_id = self
                    .vlan_ids
                    .get(&port.vlan_index.to_string())
                    .cloned()
                    .ok_or_else(|| {
                        Error::InvalidTopology(format!(
                            "no vlan id configured for host interface {}",
                            port
                        ))
                    })?;
                self.add_dut_vlan_subif_to_ptf(&ptf_if, &separator, &vlan_id)?;
            }
        }
        Ok(())
    }

    /// Remove every host-facing port from the PTF container.
    pub fn remove_host_ports(&self) -> Result<()> {
        info!("=== Remove host ports ===");
        let items: Vec<(usize, HostInterface)> = self
            .topo
            .host_interfaces
            .iter()
            .cloned()
            .enumerate()
            .collect();
        self.worker
            .map(|(i, intf)| self.remove_host_port(i, &intf), items)
    }

    fn remove_host_port(&self, position: usize, intf: &HostInterface) -> Result<()> {
        if self.is_multi_duts && !self.is_cable {
            match intf {
                HostInterface::Dual(_, _) => {
                    let host_ifindex = intf.host_ifindex(position);
                    let is_active_active =
                        self.topo.host_interfaces_active_active.contains(intf);
                    self.remove_dualtor_cable(host_ifindex, is_active_active)?;
                }
                HostInterface::Port(port) => {
                    let host_ifindex = intf.host_ifindex(position);
                    let fp_port = self.required_dut_fp_port(port)?.clone();
                    self.remove_dut_if_from_ptf(&eth_iface_name(host_ifindex), &fp_port)?;
                }
            }
        } else if self.is_multi_duts && self.is_cable {
            if let HostInterface::Dual(upper, lower) = intf {
                for port in &[upper, lower] {
                    if let Some(fp_port) = self.dut_fp_port(port)? {
                        let fp_port = fp_port.clone();
                        self.remove_dut_if_from_ptf(&eth_iface_name(port.ptf_index), &fp_port)?;
                    }
                }
            }
        } else {
            let port = intf.first();
            let fp_port = self.required_dut_fp_port(port)?.clone();
            let ptf_if = eth_iface_name(port.ptf_index);
            self.remove_dut_if_from_ptf(&ptf_if, &fp_port)?;
            if self.dut_type.as_deref() == Some(BACKEND_TOR_TYPE) {
                let separator = self.topo.sub_interface_separator().to_string();
                if let Some(vlan_id) = self.vlan_ids.get(&port.vlan_index.to_string()).cloned() {
                    self.remove_dut_vlan_subif_from_ptf(&ptf_if, &separator, &vlan_id)?;
                }
            }
        }
        Ok(())
    }

    fn mux_cable_fact(&self, host_ifindex: usize) -> Result<&MuxCableFact> {
        self.mux_cable_facts
            .get(&host_ifindex.to_string())
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "no mux cable facts for host interface {}",
                    host_ifindex
                ))
            })
    }

    /// Create the Y-cable bridge of one dual-ToR host interface.
    ///
    /// ```text
    /// active/standby:                        active/active:
    ///                 +------------+                         +------------+
    ///                 |            +-- upper  PTF (host) ----+            +-- upper
    /// PTF (host_if) --+ OVS bridge |                         | OVS bridge |
    ///                 |            +-- lower  netns (nic) ---+            +-- lower
    ///                 +------------+                         +------------+
    /// ```
    ///
    /// The host-facing port always reaches both ToR legs; only the active leg may forward back,
    /// which is what lets a test driver switch the active side by reprogramming one flow.
    fn create_dualtor_cable(
        &self,
        host_ifindex: usize,
        host_if: &str,
        upper_if: &str,
        lower_if: &str,
        active_if_index: usize,
        nic_if: Option<&str>,
    ) -> Result<()> {
        let br_name = match nic_if {
            Some(_) => active_active_bridge_name(&self.vm_set_name, host_ifindex),
            None => muxy_bridge_name(&self.vm_set_name, host_ifindex),
        };

        self.create_ovs_bridge(&br_name, self.fp_mtu)?;

        for intf in &[host_if, upper_if, lower_if] {
            if let Some(br) = get_ovs_bridge_by_port(intf) {
                if br != br_name {
                    Cmd::new(format!("ovs-vsctl --if-exists del-port {} {}", br, intf)).run()?;
                }
            }
        }

        let ports = get_ovs_br_ports(&br_name)?;
        let mut to_attach = vec![host_if, upper_if, lower_if];
        if let Some(nic_if) = nic_if {
            to_attach.push(nic_if);
        }
        for intf in &to_attach {
            if !ports.contains(*intf) {
                Cmd::new(format!("ovs-vsctl --may-exist add-port {} {}", br_name, intf)).run()?;
            }
        }

        let mut required = vec![upper_if, lower_if];
        if let Some(nic_if) = nic_if {
            required.push(nic_if);
        }
        let bindings = get_ovs_port_bindings(&br_name, &required)?;
        let host_id = bindings.get(host_if).ok_or_else(|| {
            Error::PortBindingNotFound(br_name.clone(), host_if.to_string())
        })?;
        let upper_id = &bindings[upper_if];
        let lower_id = &bindings[lower_if];

        // clear old bindings
        Cmd::new(format!("ovs-ofctl del-flows {}", br_name)).run()?;

        if nic_if.is_some() {
            // the flow program of the simulated smart NIC is driven by the test cases themselves
            return Ok(());
        }

        Cmd::new(format!(
            "ovs-ofctl add-flow {} table=0,in_port={},action=output:{},{}",
            br_name, host_id, upper_id, lower_id
        ))
        .run()?;
        let active_id = if active_if_index == 0 { upper_id } else { lower_id };
        Cmd::new(format!(
            "ovs-ofctl add-flow {} table=0,in_port={},action=output:{}",
            br_name, active_id, host_id
        ))
        .run()?;
        Ok(())
    }

    /// Destroy the Y-cable bridge of one dual-ToR host interface.
    fn remove_dualtor_cable(&self, host_ifindex: usize, is_active_active: bool) -> Result<()> {
        let br_name = if is_active_active {
            active_active_bridge_name(&self.vm_set_name, host_ifindex)
        } else {
            muxy_bridge_name(&self.vm_set_name, host_ifindex)
        };
        self.destroy_ovs_bridge(&br_name)
    }

    // ------------------------------------------------------------------------------------------
    // network namespace
    // ------------------------------------------------------------------------------------------

    /// Create the network namespace of the vm set (replacing any stale one).
    pub fn add_network_namespace(&self) -> Result<()> {
        self.delete_network_namespace()?;
        Cmd::new(format!("ip netns add {}", self.netns_name()?)).run()?;
        Ok(())
    }

    /// Delete the network namespace of the vm set if it exists.
    pub fn delete_network_namespace(&self) -> Result<()> {
        let netns = self.netns_name()?;
        if PathBuf::from(format!("/var/run/netns/{}", netns)).exists() {
            Cmd::new(format!("ip netns delete {}", netns)).run()?;
        }
        Ok(())
    }

    /// Enable ARP filtering in the netns, preventing arp flux between its uplinks.
    pub fn enable_arp_filter_netns(&self) -> Result<()> {
        Cmd::new(
            Scope::Netns(self.netns_name()?).wrap("sysctl -w net.ipv4.conf.all.arp_filter=1"),
        )
        .run()?;
        Ok(())
    }

    /// Bring up the loopback device in the netns.
    pub fn enable_netns_loopback(&self) -> Result<()> {
        Cmd::new(Scope::Netns(self.netns_name()?).wrap("ifconfig lo up")).run()?;
        Ok(())
    }

    /// Attach the management port to the netns and configure its address.
    pub fn add_mgmt_port_to_netns(
        &self,
        mgmt_bridge: &str,
        mgmt_ip: Option<&str>,
        mgmt_gw: Option<&str>,
    ) -> Result<()> {
        let netns = self.netns_name()?.to_string();
        if intf_not_exists(MGMT_PORT_NAME, Scope::Netns(&netns)) {
            self.add_br_if_to_netns(
                mgmt_bridge,
                &netns_mgmt_iface_name(&self.vm_set_name),
                MGMT_PORT_NAME,
            )?;
        }
        if let Some(mgmt_ip) = mgmt_ip {
            self.add_ip_to_netns_if(MGMT_PORT_NAME, mgmt_ip, None, mgmt_gw, None)?;
        }
        Ok(())
    }

    /// Install policy-based source routing for every active-active host interface.
    ///
    /// Destination-based routing cannot decide between two equally valid uplinks, so each port
    /// gets its own numbered routing table (slot `100 + index`), selected by incoming interface
    /// and by source address, holding the subnet route and a default route via the emulated
    /// gateway. Routing tables are visible to every namespace, but the entries written inside
    /// the netns are private to it; the name registry entry is shared and appended only once.
    pub fn setup_netns_source_routing(&self) -> Result<()> {
        let netns = self.netns_name()?.to_string();
        let rt_tables = read_rt_tables()?;

        for (i, intf) in self.topo.host_interfaces.iter().enumerate() {
            let is_active_active = self.topo.host_interfaces_active_active.contains(intf);
            if !(self.is_multi_duts && !self.is_cable && intf.is_dual() && is_active_active) {
                continue;
            }
            let host_ifindex = intf.host_ifindex(i);
            let ns_if = eth_iface_name(host_ifindex);
            if !intf_exists(&ns_if, Scope::Netns(&netns)) {
                return Err(Error::MissingNetnsInterface(ns_if, netns));
            }
            let rt_slot = RT_SLOT_START + host_ifindex;
            if rt_slot > RT_SLOT_MAX {
                return Err(Error::RoutingTableExhausted(rt_slot));
            }
            let rt_name = ns_if.clone();
            let ns_if_addr = IpNet::try_from_str(&self.mux_cable_fact(host_ifindex)?.soc_ipv4)?;
            let gateway_addr = ns_if_addr.gateway();
            if !rt_tables.contains_key(&rt_slot) {
                // register the table under the interface name
                append_rt_table(rt_slot, &rt_name)?;
            }
            let scope = Scope::Netns(&netns);
            Cmd::new(scope.wrap(&format!("ip rule add iif {} table {}", ns_if, rt_name))).run()?;
            Cmd::new(scope.wrap(&format!(
                "ip rule add from {} table {}",
                ns_if_addr.address(),
                rt_name
            )))
            .run()?;
            // flushing an empty routing table fails, which is fine here
            Cmd::new(scope.wrap(&format!("ip route flush table {}", rt_name)))
                .ignore_errors()
                .run()?;
            Cmd::new(scope.wrap(&format!(
                "ip route add {} dev {} table {}",
                ns_if_addr.network(),
                ns_if,
                rt_name
            )))
            .run()?;
            Cmd::new(scope.wrap(&format!(
                "ip route add default via {} dev {} table {}",
                gateway_addr, ns_if, rt_name
            )))
            .run()?;
        }
        Ok(())
    }
}

fn interconnect_endpoints<'a>(
    link_index: &str,
    vlans: &'a [PortRef],
) -> Result<(&'a PortRef, &'a PortRef)> {
    match (vlans.first(), vlans.last()) {
        (Some(first), Some(last)) => Ok((first, last)),
        _ => Err(Error::InvalidTopology(format!(
            "devices_interconnect_interfaces[{}] needs two endpoints",
            link_index
        ))),
    }
}

/// Parse the routing-table name registry: numeric id -> name.
fn read_rt_tables() -> Result<BTreeMap<usize, String>> {
    let mut rt_tables = BTreeMap::new();
    let content = fs::read_to_string(RT_TABLE_FILEPATH)?;
    for line in content.lines() {
        if line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() == 2 {
            if let Ok(id) = fields[0].parse::<usize>() {
                rt_tables.insert(id, fields[1].to_string());
            }
        }
    }
    Ok(rt_tables)
}

/// Append one entry to the routing-table name registry.
fn append_rt_table(slot: usize, name: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(RT_TABLE_FILEPATH)?;
    writeln!(file, "{}\t{}", slot, name)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;

    fn topology(json: &str) -> Topology {
        serde_json::from_str(json).unwrap()
    }

    fn vm_topology(vm_names: &[&str], topo: Topology) -> VmTopology {
        VmTopology::new(
            vm_names.iter().map(|s| s.to_string()).collect(),
            BTreeMap::new(),
            DEFAULT_MTU,
            NUM_FP_VLANS_PER_FP,
            topo,
            Worker::new(false, 1),
            None,
            false,
            false,
        )
    }

    #[test]
    fn init_requires_known_vm_base() {
        let topo = topology(r#"{"VMs": {"ARISTA01T1": {"vlans": [0], "vm_offset": 0}}}"#);
        let mut net = vm_topology(&["VM0100"], topo);
        let result = net.init(InitParams {
            vm_set_name: "vms7-6".to_string(),
            vm_base: Some("VM9999".to_string()),
            duts_name: vec!["dut0".to_string()],
            ..InitParams::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn init_selects_vms_in_range() {
        let topo = topology(
            r#"{"VMs": {
                "ARISTA01T1": {"vlans": [0], "vm_offset": 0},
                "ARISTA02T1": {"vlans": [1], "vm_offset": 1},
                "ARISTA03T1": {"vlans": [2], "vm_offset": 2}
            }}"#,
        );
        let mut net = vm_topology(&["VM0100", "VM0101"], topo);
        net.init(InitParams {
            vm_set_name: "vms7-6".to_string(),
            vm_base: Some("VM0100".to_string()),
            duts_name: vec!["dut0".to_string()],
            ..InitParams::default()
        })
        .unwrap();
        // the third VM does not fit into the vm name list and is skipped
        assert_eq!(net.vms.len(), 2);
        assert!(net.vms.contains_key("ARISTA01T1"));
        assert!(net.vms.contains_key("ARISTA02T1"));
        assert!(net.netns().is_none());
    }

    #[test]
    fn init_derives_netns_for_active_active() {
        let topo = topology(
            r#"{
                "host_interfaces": [["0.1@1", "1.1@1"]],
                "host_interfaces_active_active": [["0.1@1", "1.1@1"]]
            }"#,
        );
        let mut net = vm_topology(&[], topo);
        net.init(InitParams {
            vm_set_name: "vms7-6".to_string(),
            duts_name: vec!["dut0".to_string(), "dut1".to_string()],
            ..InitParams::default()
        })
        .unwrap();
        assert_eq!(net.netns(), Some("ns-vms7-6"));
        assert!(net.is_multi_duts);
        assert!(net.is_cable);
    }

    #[test]
    fn init_backend_tor_requires_vlan_config() {
        let topo = topology(r#"{"host_interfaces": [0, 1]}"#);
        let vm_properties = btreemap! {
            "ARISTA01T1".to_string() => VmProperties {
                dut_type: Some(BACKEND_TOR_TYPE.to_string()),
                ..VmProperties::default()
            },
        };
        let mut net = VmTopology::new(
            vec!["VM0100".to_string()],
            vm_properties,
            DEFAULT_MTU,
            NUM_FP_VLANS_PER_FP,
            topo,
            Worker::new(false, 1),
            None,
            false,
            false,
        );
        let result = net.init(InitParams {
            vm_set_name: "vms7-6".to_string(),
            duts_name: vec!["dut0".to_string()],
            ..InitParams::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn scope_wraps_commands() {
        assert_eq!(Scope::Host.wrap("ip link show"), "ip link show");
        assert_eq!(
            Scope::Container(4242).wrap("ip link show"),
            "nsenter -t 4242 -n ip link show"
        );
        assert_eq!(
            Scope::Netns("ns-vms7-6").wrap("ip link show"),
            "ip netns exec ns-vms7-6 ip link show"
        );
    }

    #[test]
    fn ip_net_network_and_gateway() {
        let addr = IpNet::try_from_str("192.168.100.5/26").unwrap();
        assert_eq!(addr.network().to_string(), "192.168.100.0/26");
        assert_eq!(addr.gateway(), "192.168.100.1");
        assert_eq!(addr.address(), "192.168.100.5");
    }

    #[test]
    fn ip_net_rejects_malformed() {
        assert!(IpNet::try_from_str("192.168.0.5").is_err());
        assert!(IpNet::try_from_str("192.168.0/24").is_err());
        assert!(IpNet::try_from_str("192.168.0.5/33").is_err());
        assert!(IpNet::try_from_str("a.b.c.d/24").is_err());
    }

    #[test]
    fn flow_rules_protocol_layering() {
        let rules = fp_flow_rules("1", "2", "3");
        assert_eq!(rules.len(), 26);
        // BGP toward both VM and PTF at priority 10
        assert!(rules
            .contains(&"table=0,priority=10,tcp,in_port=1,tp_src=179,action=output:2,3".to_string()));
        // DNS source only toward the VM
        assert!(rules
            .contains(&"table=0,priority=8,udp,in_port=1,udp_src=53,action=output:2".to_string()));
        // the default-route fallback goes to the PTF only
        assert!(rules.contains(&"table=0,priority=5,ip,in_port=1,action=output:3".to_string()));
        // catch-all at the lowest priority
        assert!(rules.contains(&"table=0,priority=3,in_port=1,action=output:2,3".to_string()));
        // BFD control packets
        assert!(rules
            .contains(&"table=0,priority=10,udp,in_port=1,udp_dst=3784,action=output:2,3".to_string()));
        // BFD echo toward the PTF only
        assert!(rules
            .contains(&"table=0,priority=6,udp6,in_port=1,udp_dst=4784,action=output:3".to_string()));
    }

    #[test]
    fn flow_rules_have_no_whitespace() {
        // rules are passed as single command-line words and written to add-flows files
        for rule in fp_flow_rules("1", "2", "3") {
            assert!(!rule.contains(char::is_whitespace), "{}", rule);
        }
    }

    #[test]
    fn flow_rules_priorities_cover_protocols() {
        let rules = fp_flow_rules("10", "20", "30").join("\n");
        for pat in &[
            "tp_src=179",
            "tp_dst=179",
            "tp_src=22",
            "tp_dst=22",
            "nw_proto=4",
            "nw_proto=89",
            "udp_src=161",
            "udp_src=53",
            "udp_dst=3784",
            "udp_dst=4784",
            "nw_frag=yes",
            "icmp",
            "icmp6",
        ] {
            assert!(rules.contains(pat), "missing {}", pat);
        }
    }

    #[test]
    fn batch_context_collects_flow_files() {
        let batch = BatchContext::new().unwrap();
        let rules = fp_flow_rules("1", "2", "3");
        let path = batch.write_flow_file(&rules).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), rules.len());
        batch.finish(Duration::from_secs(5)).unwrap();
        assert!(!path.exists());
    }
}
