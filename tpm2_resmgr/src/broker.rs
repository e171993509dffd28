// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between the resource manager core and the component that owns
//! the raw channel to the TPM device.

use crate::command::Tpm2Command;
use tpm2_proto::TssRc;

/// An opaque saved object context produced by the TPM's context-save
/// operation.
///
/// The blob round-trips through [`AccessBroker::context_load`] to reattach
/// the object to the current TPM session. The resource manager replaces it
/// whole on every save and never looks inside.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SavedContext(Vec<u8>);

impl SavedContext {
    /// Wraps a marshalled context blob.
    pub fn new(blob: Vec<u8>) -> Self {
        Self(blob)
    }

    /// True until the object has been saved at least once.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw blob.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SavedContext {
    // Context blobs wrap key material; log only the length.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedContext")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Synchronous access to the single TPM device behind this process.
///
/// All three calls block until the TPM round-trip completes. An `Err`
/// carries the response code the broker observed; the caller turns it into
/// a synthesized response so clients always see standard TPM framing.
pub trait AccessBroker: Send + Sync {
    /// Sends a command whose handle slots already hold physical handles and
    /// returns the raw response buffer.
    fn send_command(&self, command: &Tpm2Command) -> Result<Vec<u8>, TssRc>;

    /// Loads a saved context into a fresh transient slot, returning the
    /// physical handle the TPM assigned to it.
    fn context_load(&self, context: &SavedContext) -> Result<u32, TssRc>;

    /// Saves the object at `phandle` and flushes it from the TPM in one
    /// step, returning the new context blob.
    fn context_saveflush(&self, phandle: u32) -> Result<SavedContext, TssRc>;
}
