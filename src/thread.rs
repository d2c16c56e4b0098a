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

//! Worker thread management.
//!
//! A [`WorkerGroup`] spawns named worker threads and shuts them down
//! cooperatively: shutdown raises a shared cancellation flag, and
//! workers check it at the top of each loop iteration (their poll
//! timeouts are bounded, so the check comes around promptly). Joining
//! waits for in-flight work to complete; nothing is interrupted
//! mid-query.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{error, info};

/// A group of worker threads sharing one cancellation flag.
pub struct WorkerGroup {
    cancel: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerGroup {
    /// Creates a new, empty group.
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the group's cancellation flag, for handing to code that
    /// runs worker loops directly.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Returns whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Spawns a named worker executing `task`. The task receives the
    /// cancellation flag and is expected to return once it observes
    /// the flag set. An `Err` return from the task is logged; worker
    /// errors never take down the process.
    pub fn spawn<F>(&self, name: String, task: F) -> io::Result<()>
    where
        F: FnOnce(&AtomicBool) -> io::Result<()> + Send + 'static,
    {
        if self.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "worker group is shutting down",
            ));
        }
        let cancel = self.cancel.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(e) = task(&cancel) {
                error!("worker {} exited with error: {}", name, e);
            }
        })?;
        self.workers.lock().unwrap().push(handle);
        Ok(())
    }

    /// Requests shutdown and waits for every worker to finish.
    pub fn shut_down(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        info!("waiting for {} workers to finish", workers.len());
        for handle in workers {
            if handle.join().is_err() {
                error!("a worker panicked during shutdown");
            }
        }
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.shut_down();
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[test]
    fn shutdown_is_cooperative() {
        let group = WorkerGroup::new();
        let iterations = Arc::new(AtomicUsize::new(0));
        let iterations_clone = iterations.clone();
        group
            .spawn("test worker".to_owned(), move |cancel| {
                while !cancel.load(Ordering::Relaxed) {
                    iterations_clone.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        group.shut_down();
        assert!(iterations.load(Ordering::Relaxed) > 0);
        // Spawning after shutdown fails.
        assert!(group.spawn("late".to_owned(), |_| Ok(())).is_err());
    }
}
