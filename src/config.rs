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

//! Configuration structures consumed by the serving core.
//!
//! The enclosing process owns configuration parsing; these are the
//! plain-data structures it fills in (directly or via serde) and hands
//! to the core, together with the already-bound sockets. Configuration
//! is immutable at steady state; reconfiguration builds new values and
//! restarts the affected workers.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Settings for the datagram pipeline workers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// The maximum number of datagrams received and sent per batch.
    pub batch_size: usize,

    /// The poll timeout in milliseconds. Bounded so cancellation is
    /// observed promptly.
    pub poll_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            poll_timeout_ms: 1000,
        }
    }
}

impl PipelineConfig {
    /// The poll timeout as a [`Duration`], clamped to at most one
    /// second.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.min(1000))
    }
}

/// Settings for the QUIC workers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuicConfig {
    /// The configured capacity of the per-worker connection table.
    /// Rounded up to the next power of two.
    pub table_capacity: usize,

    /// Idle timeout in milliseconds after which a connection is swept.
    pub idle_timeout_ms: u64,

    /// Path to the PEM-encoded server certificate chain.
    pub cert_file: Option<PathBuf>,

    /// Path to the PEM-encoded server private key.
    pub key_file: Option<PathBuf>,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            table_capacity: 100,
            idle_timeout_ms: 30_000,
            cert_file: None,
            key_file: None,
        }
    }
}

impl QuicConfig {
    /// The idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Settings for the outbound requestor.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestorConfig {
    /// Per-attempt timeout in milliseconds; each address of a remote
    /// gets its own attempt.
    pub attempt_timeout_ms: u64,

    /// Use TCP fast open for outbound TCP exchanges.
    pub tcp_fast_open: bool,
}

impl Default for RequestorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 5000,
            tcp_fast_open: false,
        }
    }
}

impl RequestorConfig {
    /// The per-attempt timeout as a [`Duration`].
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.batch_size, 64);
        assert_eq!(pipeline.poll_timeout(), Duration::from_secs(1));

        let quic = QuicConfig::default();
        assert_eq!(quic.table_capacity, 100);

        let requestor = RequestorConfig::default();
        assert_eq!(requestor.attempt_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn poll_timeout_is_clamped() {
        let config = PipelineConfig {
            poll_timeout_ms: 30_000,
            ..Default::default()
        };
        assert_eq!(config.poll_timeout(), Duration::from_secs(1));
    }
}
