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

//! Lock-free publication of zone snapshots.
//!
//! The [`ZoneDb`] holds the currently published [`ZoneSet`] behind an
//! atomically swappable pointer. Readers take a [`Lease`] before
//! looking anything up and hold it for the duration of one query; the
//! lease pins the snapshot that was current when it was taken, so a
//! query observes a single consistent zone version even if a writer
//! installs a new one mid-query.
//!
//! Publication is swap-then-wait: [`ZoneDb::publish`] installs the new
//! snapshot (readers arriving afterward see it immediately), then
//! blocks until the grace event — the moment every lease taken against
//! the old snapshot has been released — before the old snapshot is
//! reclaimed. Readers never block and never spin on a lock: taking a
//! lease is one atomic pointer load plus a reference-count increment.
//! A plain reader-writer lock is deliberately not used here, because
//! it would let a writer stall readers.
//!
//! Two rules keep the grace wait short, and the datagram pipeline
//! enforces both: a lease is taken only after a datagram has been
//! read, and released before the response send is issued. A lease must
//! never be held across a blocking syscall.

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use log::warn;

use super::set::ZoneSet;

/// How long the writer sleeps between checks while waiting for the
/// grace event.
const GRACE_POLL_INTERVAL: Duration = Duration::from_micros(50);

/// How long the writer waits before logging that the grace event is
/// overdue. Leases are scoped to single queries, so a wait this long
/// means a reader is violating the no-blocking-under-lease rule.
const GRACE_COMPLAINT_INTERVAL: Duration = Duration::from_secs(1);

////////////////////////////////////////////////////////////////////////
// ZONE DATABASE                                                      //
////////////////////////////////////////////////////////////////////////

/// The shared handle through which workers read, and the reload path
/// replaces, the served zone data.
pub struct ZoneDb {
    current: ArcSwap<ZoneSet>,

    /// Serializes writers, so that two concurrent publications cannot
    /// interleave their swap and grace phases.
    writer: Mutex<()>,
}

impl ZoneDb {
    /// Creates a new `ZoneDb` initially serving `initial`.
    pub fn new(initial: ZoneSet) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
        }
    }

    /// Takes a read-side lease on the currently published snapshot.
    ///
    /// This is wait-free: one atomic load and one reference-count
    /// increment. The returned [`Lease`] pins the snapshot until it is
    /// dropped.
    pub fn lease(&self) -> Lease {
        Lease {
            set: self.current.load_full(),
        }
    }

    /// Publishes `next` as the current snapshot and waits for the
    /// grace event before reclaiming the previous one.
    ///
    /// Only writers block here; readers that arrive during the wait
    /// are already being served the new snapshot.
    pub fn publish(&self, next: ZoneSet) {
        let _writer = self.writer.lock().unwrap();
        let old = self.current.swap(Arc::new(next));
        wait_for_grace(&old);
        // Dropping `old` here is the reclamation; no reader can still
        // observe it.
    }
}

/// Blocks until `old` has no holders other than the caller.
fn wait_for_grace(old: &Arc<ZoneSet>) {
    let started = Instant::now();
    let mut complained = false;
    while Arc::strong_count(old) > 1 {
        thread::sleep(GRACE_POLL_INTERVAL);
        if !complained && started.elapsed() >= GRACE_COMPLAINT_INTERVAL {
            warn!(
                "zone snapshot grace period exceeds {:?}; a reader is holding a lease too long",
                GRACE_COMPLAINT_INTERVAL,
            );
            complained = true;
        }
    }
}

////////////////////////////////////////////////////////////////////////
// READ-SIDE LEASES                                                   //
////////////////////////////////////////////////////////////////////////

/// A read-side lease: a pinned reference to one published [`ZoneSet`].
///
/// Dropping the lease releases the pin. Leases are intended to span a
/// single query; see the module documentation for the rules on holding
/// them.
pub struct Lease {
    set: Arc<ZoneSet>,
}

impl Deref for Lease {
    type Target = ZoneSet;

    fn deref(&self) -> &ZoneSet {
        &self.set
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
