//! Pending cache-file bindings.
//!
//! OPEN works in two halves. The handler reserves a slot and sends its number
//! to the daemon; before replying, the daemon deposits the cache-file it opened
//! into that slot through [`BindingTable::deposit`]. The handler then takes the
//! cache-file out and checks that the depositing process is the one the daemon
//! named in its reply.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cache_file::CacheFile;
use crate::protocol::BindingRef;

enum Slot {
    Pending,
    Filled {
        pid: u32,
        file: Arc<dyn CacheFile>,
    },
}

/// A cache-file handed over by the daemon.
pub struct Deposit {
    /// Process that performed the deposit.
    pub pid: u32,
    pub file: Arc<dyn CacheFile>,
}

/// Table of reserved binding slots.
#[derive(Default)]
pub struct BindingTable {
    slots: Mutex<FxHashMap<u32, Slot>>,
    next: AtomicU32,
}

impl BindingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a slot. The slot is released when the guard drops.
    pub fn assign(&self) -> BindingGuard<'_> {
        let mut slots = self.slots.lock();
        let id = loop {
            let candidate = self.next.fetch_add(1, Ordering::Relaxed);
            if !slots.contains_key(&candidate) {
                break candidate;
            }
        };
        slots.insert(id, Slot::Pending);
        BindingGuard {
            table: self,
            id: BindingRef(id),
        }
    }

    /// Fills a reserved slot. Fails with EINVAL for unknown or already filled slots.
    pub fn deposit(
        &self,
        binding: BindingRef,
        pid: u32,
        file: Arc<dyn CacheFile>,
    ) -> Result<(), Errno> {
        let mut slots = self.slots.lock();
        match slots.get_mut(&binding.0) {
            Some(slot) if matches!(slot, Slot::Pending) => {
                *slot = Slot::Filled { pid, file };
                Ok(())
            }
            _ => {
                debug!(binding = binding.0, pid, "deposit into an unknown slot");
                Err(Errno::EINVAL)
            }
        }
    }

    /// Number of reserved slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reserved slot, released on drop on every path.
pub struct BindingGuard<'a> {
    table: &'a BindingTable,
    id: BindingRef,
}

impl BindingGuard<'_> {
    #[must_use]
    pub fn id(&self) -> BindingRef {
        self.id
    }

    /// Takes the deposited cache-file out of the slot, if any.
    pub fn take(&self) -> Option<Deposit> {
        let mut slots = self.table.slots.lock();
        match slots.insert(self.id.0, Slot::Pending) {
            Some(Slot::Filled { pid, file }) => Some(Deposit { pid, file }),
            _ => None,
        }
    }
}

impl Drop for BindingGuard<'_> {
    fn drop(&mut self) {
        self.table.slots.lock().remove(&self.id.0);
    }
}
