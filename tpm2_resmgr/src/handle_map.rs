// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-connection mapping from virtual transient handles to saved-context
//! entries.

use crate::broker::SavedContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tpm2_proto::is_transient;
use tpm2_proto::tpm20::TRANSIENT_HANDLE_FIRST;
use tpm2_proto::tpm20::TRANSIENT_HANDLE_LAST;

/// Default per-connection transient object quota.
pub const TRANSIENT_OBJECT_LIMIT_DEFAULT: usize = 27;

/// Error returned when binding a virtual handle that is already bound.
#[derive(Debug, Error)]
#[error("virtual handle {vhandle:#010x} is already mapped")]
pub struct AlreadyMapped {
    /// The offending virtual handle.
    pub vhandle: u32,
}

#[derive(Debug)]
struct EntryState {
    phandle: u32,
    context: SavedContext,
}

/// Binding of one virtual handle to its current physical handle and its
/// latest saved context.
///
/// Entries are shared between the owning [`HandleMap`] and the dispatch
/// worker's per-command touched list. The virtual handle is immutable for
/// the entry's lifetime; the physical handle and context are mutated only
/// by the dispatch worker. A `phandle` of 0 means the context is currently
/// swapped out of the TPM.
#[derive(Debug)]
pub struct HandleMapEntry {
    vhandle: u32,
    state: Mutex<EntryState>,
}

impl HandleMapEntry {
    /// Creates an entry for a freshly created object: loaded at `phandle`,
    /// no saved context yet.
    pub fn new(phandle: u32, vhandle: u32) -> Arc<Self> {
        Arc::new(Self {
            vhandle,
            state: Mutex::new(EntryState {
                phandle,
                context: SavedContext::default(),
            }),
        })
    }

    /// The stable virtual handle clients address this object by.
    pub fn vhandle(&self) -> u32 {
        self.vhandle
    }

    /// The physical handle the TPM currently has the object loaded at, or 0
    /// when it is swapped out.
    pub fn phandle(&self) -> u32 {
        self.state.lock().phandle
    }

    /// Records the physical handle assigned by a context load.
    pub fn set_phandle(&self, phandle: u32) {
        self.state.lock().phandle = phandle;
    }

    /// The latest saved context.
    pub fn context(&self) -> SavedContext {
        self.state.lock().context.clone()
    }

    /// Replaces the saved context and releases the physical slot in one
    /// step, after a successful save+flush.
    pub fn store_context(&self, context: SavedContext) {
        let mut state = self.state.lock();
        state.context = context;
        state.phandle = 0;
    }
}

#[derive(Debug)]
struct MapInner {
    entries: HashMap<u32, Arc<HandleMapEntry>>,
    next_vhandle: u32,
}

/// One connection's map of virtualized transient objects.
///
/// Written by the dispatch worker while a command from the owning
/// connection is in flight; the interior mutex lets connection teardown
/// observe the map from other threads.
#[derive(Debug)]
pub struct HandleMap {
    inner: Mutex<MapInner>,
    capacity: usize,
}

impl HandleMap {
    /// Creates an empty map holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MapInner {
                entries: HashMap::new(),
                next_vhandle: TRANSIENT_HANDLE_FIRST,
            }),
            capacity,
        }
    }

    /// Binds `vhandle` to `entry`. Fails if the handle is already bound.
    pub fn insert(&self, vhandle: u32, entry: Arc<HandleMapEntry>) -> Result<(), AlreadyMapped> {
        debug_assert!(is_transient(vhandle));
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&vhandle) {
            return Err(AlreadyMapped { vhandle });
        }
        inner.entries.insert(vhandle, entry);
        Ok(())
    }

    /// Looks up the entry bound to `vhandle`.
    pub fn vlookup(&self, vhandle: u32) -> Option<Arc<HandleMapEntry>> {
        self.inner.lock().entries.get(&vhandle).cloned()
    }

    /// Drops the binding for `vhandle`, returning the entry if one was
    /// bound.
    pub fn remove(&self, vhandle: u32) -> Option<Arc<HandleMapEntry>> {
        self.inner.lock().entries.remove(&vhandle)
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when the per-connection quota is reached.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// The virtual handles currently bound, in no particular order.
    pub fn vhandles(&self) -> Vec<u32> {
        self.inner.lock().entries.keys().copied().collect()
    }

    /// Allocates a fresh virtual handle in the transient range.
    ///
    /// The cursor advances monotonically and skips handles still live in
    /// the map, so a value is never reissued while its entry exists. Freed
    /// values may be skipped permanently; allocation stays O(1). Returns
    /// `None` once the 24-bit index space is exhausted, which callers treat
    /// as fatal.
    pub fn next_vhandle(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        while inner.next_vhandle <= TRANSIENT_HANDLE_LAST {
            let vhandle = inner.next_vhandle;
            inner.next_vhandle += 1;
            if !inner.entries.contains_key(&vhandle) {
                return Some(vhandle);
            }
        }
        None
    }

    #[cfg(test)]
    fn set_next_vhandle(&self, vhandle: u32) {
        self.inner.lock().next_vhandle = vhandle;
    }
}
