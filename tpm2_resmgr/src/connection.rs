// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-client connection state.

use crate::handle_map::HandleMap;
use crate::handle_map::TRANSIENT_OBJECT_LIMIT_DEFAULT;

/// State the resource manager tracks for one client connection.
///
/// Commands and responses hold their connection by `Arc`, so a connection
/// outlives any in-flight command that references it.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    transient_map: HandleMap,
}

impl Connection {
    /// Creates a connection whose transient map holds at most
    /// `max_transient_objects` entries.
    pub fn new(id: u64, max_transient_objects: usize) -> Self {
        Self {
            id,
            transient_map: HandleMap::new(max_transient_objects),
        }
    }

    /// Creates a connection with the default transient object quota.
    pub fn with_default_quota(id: u64) -> Self {
        Self::new(id, TRANSIENT_OBJECT_LIMIT_DEFAULT)
    }

    /// Identifier assigned by the connection manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// This connection's map of virtualized transient objects.
    pub fn transient_map(&self) -> &HandleMap {
        &self.transient_map
    }
}
