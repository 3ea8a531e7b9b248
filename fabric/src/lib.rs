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

//! # Virtual Topology Binding Engine
//!
//! This library builds an isolated virtual network fabric out of Linux bridges, veth pairs,
//! network namespaces and OVS flow tables, so that protocol tests can exercise the front-panel
//! ports of a device under test as if they were wired to real neighbors and real hosts.
//!
//! ## Structure
//!
//! - **[`topology`]**: the declarative topology model — VMs, VM-to-VM links, host-facing ports,
//!   device interconnects — with the validation that runs before anything touches the host.
//! - **[`names`]**: deterministic derivation of length-bounded, collision-resistant interface and
//!   bridge names.
//! - **[`vm_topology`]**: the fabric operations. See the main structure
//!   [`VmTopology`](vm_topology::VmTopology).
//! - **[`orchestrator`]**: sequences the fabric operations according to the requested lifecycle
//!   command (`create`, `bind`, `renumber`, `unbind`, `destroy`, `connect-vms`,
//!   `disconnect-vms`).
//! - **[`worker`]**: the bounded worker pool that fans independent per-port operations out over
//!   threads while keeping their log output grouped per task.
//!
//! Shell access to the OS network stack goes exclusively through the `netcmd` crate.

#![deny(missing_docs)]

pub mod error;
pub mod names;
pub mod orchestrator;
pub mod topology;
pub mod vm_topology;
pub mod worker;

pub use error::{Error, Result};
pub use vm_topology::VmTopology;
pub use worker::Worker;
