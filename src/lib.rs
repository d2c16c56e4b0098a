// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The query-serving core of an authoritative DNS server.
//!
//! This crate owns the path from a received datagram to an
//! authoritative response: the DNS wire codec
//! ([`message`]), the zone store and its lock-free snapshot
//! publication ([`zone`]), the query-processing layer ([`layer`],
//! [`server`]), the batched UDP pipeline ([`net`]), the DNS-over-QUIC
//! demultiplexer ([`quic`]), and the outbound requestor used for
//! NOTIFY ([`requestor`], [`notify`]).
//!
//! Everything around that path — zone loading, configuration parsing,
//! the daemon lifecycle — belongs to the enclosing process, which
//! hands the core pre-bound sockets and filled-in configuration
//! structures ([`config`]) and receives [`ErrorCode`]s back. The core
//! never exits the process.

pub mod class;
pub mod config;
pub mod layer;
pub mod message;
pub mod name;
pub mod net;
pub mod notify;
pub mod quic;
pub mod requestor;
pub mod rr;
pub mod server;
pub mod thread;
pub mod zone;

use std::fmt;
use std::io;

/// The coarse result codes the core reports to the enclosing process.
///
/// The enclosing process owns policy: the core classifies, reports,
/// and keeps serving wherever that is sound (per-query errors never
/// surface here at all; the pipeline answers or drops and moves on).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    Ok,
    InvalidArgument,
    OutOfMemory,
    Network,
    Protocol,
}

impl ErrorCode {
    /// Classifies an I/O error.
    pub fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::InvalidArgument,
            io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Network,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Ok => f.write_str("OK"),
            Self::InvalidArgument => f.write_str("INVALID_ARGUMENT"),
            Self::OutOfMemory => f.write_str("OUT_OF_MEMORY"),
            Self::Network => f.write_str("NETWORK"),
            Self::Protocol => f.write_str("PROTOCOL"),
        }
    }
}

impl From<zone::Error> for ErrorCode {
    /// Zone-construction failures are startup-time invariant
    /// violations (missing apex SOA and friends).
    fn from(_: zone::Error) -> Self {
        Self::InvalidArgument
    }
}

impl From<requestor::Error> for ErrorCode {
    fn from(error: requestor::Error) -> Self {
        match error {
            requestor::Error::NoAddresses => Self::InvalidArgument,
            requestor::Error::Io(ref e) => Self::from_io(e),
            requestor::Error::Timeout => Self::Network,
            requestor::Error::LayerFailed | requestor::Error::Refused => Self::Protocol,
        }
    }
}
