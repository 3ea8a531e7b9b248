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

//! Module containing all error types

use thiserror::Error;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Error propagated from the shell command gateway
    #[error("Command Error: {0}")]
    Command(#[from] netcmd::Error),
    /// The declarative topology is malformed or inconsistent
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
    /// The supplied parameters cannot describe a valid fabric (e.g. a name over budget)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A required parameter is missing for the requested command
    #[error("Parameter {0} is required in {1} mode")]
    MissingParameter(&'static str, &'static str),
    /// Cannot deserialize an input document
    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// IO Error
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    /// All numbered routing-table slots are in use
    #[error("Kernel only supports up to 252 additional routing tables (requested slot {0})")]
    RoutingTableExhausted(usize),
    /// An interface which must already exist inside a namespace is absent
    #[error("Interface {0} does not exist in netns {1}")]
    MissingNetnsInterface(String, String),
    /// The OVS port number of an attached interface never became visible
    #[error("Cannot find port binding for {1} on bridge {0}")]
    PortBindingNotFound(String, String),
    /// A pooled task could not be completed
    #[error("Worker Error: {0}")]
    WorkerError(String),
}

/// Main result type
pub type Result<T> = core::result::Result<T, Error>;
