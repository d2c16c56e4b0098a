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

//! The per-worker QUIC connection table.
//!
//! Incoming datagrams are demultiplexed to connection state by their
//! destination connection ID. The table is a power-of-two array of
//! buckets with chaining; the hash is an xor-fold of the ID's 8-byte
//! chunks plus a fold of the trailing bytes. Each worker thread owns
//! its own table, so no locking is involved anywhere here.

use std::time::{Duration, Instant};

use slab::Slab;

use super::conn::Connection;
use super::packet::ConnectionId;

/// The table: chained buckets over a slab of connections.
pub struct ConnectionTable {
    buckets: Box<[Option<usize>]>,
    conns: Slab<Connection>,
    mask: u64,
}

impl ConnectionTable {
    /// Creates a table sized to the next power of two at or above
    /// `capacity`.
    pub fn new(capacity: usize) -> Self {
        let size = capacity.max(1).next_power_of_two();
        Self {
            buckets: vec![None; size].into_boxed_slice(),
            conns: Slab::with_capacity(size),
            mask: (size - 1) as u64,
        }
    }

    /// Returns the number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Returns whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Finds the connection keyed by `dcid`.
    pub fn find_mut(&mut self, dcid: &ConnectionId) -> Option<&mut Connection> {
        let mut cursor = self.buckets[(hash_cid(dcid) & self.mask) as usize];
        while let Some(index) = cursor {
            if self.conns[index].dcid() == dcid {
                return self.conns.get_mut(index);
            }
            cursor = self.conns[index].next;
        }
        None
    }

    /// Inserts a connection keyed by its DCID, returning a reference
    /// to the stored state. The caller has already checked that no
    /// entry with this DCID exists.
    pub fn insert(&mut self, conn: Connection) -> &mut Connection {
        let bucket = (hash_cid(conn.dcid()) & self.mask) as usize;
        let index = self.conns.insert(conn);
        self.conns[index].next = self.buckets[bucket];
        self.buckets[bucket] = Some(index);
        &mut self.conns[index]
    }

    /// Removes the connection keyed by `dcid`, if present.
    pub fn remove(&mut self, dcid: &ConnectionId) -> Option<Connection> {
        let bucket = (hash_cid(dcid) & self.mask) as usize;
        let mut prev: Option<usize> = None;
        let mut cursor = self.buckets[bucket];
        while let Some(index) = cursor {
            if self.conns[index].dcid() == dcid {
                let next = self.conns[index].next;
                match prev {
                    Some(prev_index) => self.conns[prev_index].next = next,
                    None => self.buckets[bucket] = next,
                }
                return Some(self.conns.remove(index));
            }
            prev = Some(index);
            cursor = self.conns[index].next;
        }
        None
    }

    /// Removes every connection idle for at least `idle_timeout`, plus
    /// any the peer has closed. Returns the number removed.
    pub fn sweep(&mut self, now: Instant, idle_timeout: Duration) -> usize {
        let mut expired = Vec::new();
        for (_, conn) in self.conns.iter() {
            if conn.is_closed() || now.duration_since(conn.last_activity()) >= idle_timeout {
                expired.push(*conn.dcid());
            }
        }
        for dcid in &expired {
            self.remove(dcid);
        }
        expired.len()
    }
}

/// Hashes a connection ID: xor-fold of 8-byte chunks, with the
/// trailing bytes folded in from the high end.
fn hash_cid(cid: &ConnectionId) -> u64 {
    let bytes = cid.as_slice();
    let mut hash = 0u64;
    let mut chunks = bytes.chunks_exact(8);
    for chunk in &mut chunks {
        hash ^= u64::from_le_bytes(chunk.try_into().unwrap());
    }
    let mut shift = 7usize;
    for &octet in chunks.remainder() {
        hash ^= (octet as u64) << (shift * 8);
        shift -= 1;
    }
    hash
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(dcid: &[u8]) -> Connection {
        Connection::for_tests(ConnectionId::from_slice(dcid).unwrap())
    }

    #[test]
    fn insert_find_remove() {
        let mut table = ConnectionTable::new(100);
        // Capacity rounds up to a power of two.
        assert_eq!(table.buckets.len(), 128);

        table.insert(test_conn(b"alpha"));
        table.insert(test_conn(b"beta"));
        assert_eq!(table.len(), 2);

        let alpha = ConnectionId::from_slice(b"alpha").unwrap();
        let beta = ConnectionId::from_slice(b"beta").unwrap();
        let missing = ConnectionId::from_slice(b"gamma").unwrap();
        assert!(table.find_mut(&alpha).is_some());
        assert!(table.find_mut(&beta).is_some());
        assert!(table.find_mut(&missing).is_none());

        assert!(table.remove(&alpha).is_some());
        assert!(table.find_mut(&alpha).is_none());
        assert!(table.find_mut(&beta).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn chains_survive_collisions() {
        // A single-bucket table forces every entry into one chain.
        let mut table = ConnectionTable::new(1);
        assert_eq!(table.buckets.len(), 1);
        for i in 0..8u8 {
            table.insert(test_conn(&[i; 9]));
        }
        assert_eq!(table.len(), 8);
        for i in 0..8u8 {
            let dcid = ConnectionId::from_slice(&[i; 9]).unwrap();
            assert!(table.find_mut(&dcid).is_some(), "entry {} lost", i);
        }
        // Remove from the middle of the chain.
        let dcid = ConnectionId::from_slice(&[4; 9]).unwrap();
        assert!(table.remove(&dcid).is_some());
        assert!(table.find_mut(&dcid).is_none());
        assert_eq!(table.len(), 7);
    }

    #[test]
    fn sweep_expires_idle_connections() {
        let mut table = ConnectionTable::new(4);
        table.insert(test_conn(b"old"));
        std::thread::sleep(Duration::from_millis(20));
        table.insert(test_conn(b"fresh"));

        let removed = table.sweep(Instant::now(), Duration::from_millis(15));
        assert_eq!(removed, 1);
        let fresh = ConnectionId::from_slice(b"fresh").unwrap();
        let old = ConnectionId::from_slice(b"old").unwrap();
        assert!(table.find_mut(&fresh).is_some());
        assert!(table.find_mut(&old).is_none());
    }
}
