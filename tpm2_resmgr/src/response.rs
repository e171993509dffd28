// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed wrapper around a TPM 2.0 response buffer.

use crate::connection::Connection;
use crate::wire::read_u32_at;
use crate::wire::write_u32_at;
use std::sync::Arc;
use tpm2_proto::HEADER_SIZE;
use tpm2_proto::ResponseHeader;
use tpm2_proto::TpmaCc;
use tpm2_proto::TssRc;
use tpm2_proto::tpm20::TPM_ST_NO_SESSIONS;
use zerocopy::IntoBytes;

// Offset of the response code within the fixed header.
const RESPONSE_CODE_OFFSET: usize = 6;

/// A TPM 2.0 response on its way back to a client connection.
///
/// Carries the attributes of the originating command, which tell the
/// resource manager whether a new object handle follows the header.
pub struct Tpm2Response {
    connection: Arc<Connection>,
    attributes: TpmaCc,
    buffer: Vec<u8>,
}

impl Tpm2Response {
    /// Wraps a response buffer the access broker produced for a command
    /// with attributes `attributes`.
    pub fn new(connection: Arc<Connection>, buffer: Vec<u8>, attributes: TpmaCc) -> Self {
        Self {
            connection,
            attributes,
            buffer,
        }
    }

    /// Synthesizes a bare response carrying `rc`, laid out exactly like a
    /// TPM-originated error so clients parse both identically.
    pub fn from_rc(connection: Arc<Connection>, rc: TssRc) -> Self {
        let header = ResponseHeader {
            tag: TPM_ST_NO_SESSIONS.into(),
            size: (HEADER_SIZE as u32).into(),
            response_code: rc.0.into(),
        };
        Self {
            connection,
            attributes: TpmaCc::new(),
            buffer: header.as_bytes().to_vec(),
        }
    }

    /// The connection this response belongs to.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The response code, or a layered general failure if the buffer is too
    /// short to carry one.
    pub fn response_code(&self) -> TssRc {
        read_u32_at(&self.buffer, RESPONSE_CODE_OFFSET)
            .map(TssRc)
            .unwrap_or(TssRc::resmgr(TssRc::BASE_RC_GENERAL_FAILURE))
    }

    /// True when the response carries an object handle: the command
    /// reported one, the TPM succeeded, and the buffer actually holds it.
    pub fn has_handle(&self) -> bool {
        self.attributes.r_handle()
            && self.response_code().is_success()
            && self.buffer.len() >= HEADER_SIZE + 4
    }

    /// The handle following the header, when [`Self::has_handle`] holds.
    pub fn handle(&self) -> Option<u32> {
        if !self.has_handle() {
            return None;
        }
        read_u32_at(&self.buffer, HEADER_SIZE)
    }

    /// Overwrites the response handle in place.
    pub fn set_handle(&mut self, handle: u32) -> bool {
        self.has_handle() && write_u32_at(&mut self.buffer, HEADER_SIZE, handle)
    }

    /// The raw response bytes, with any rewrites applied.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::fmt::Debug for Tpm2Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tpm2Response")
            .field("connection", &self.connection.id())
            .field("rc", &self.response_code())
            .field("size", &self.buffer.len())
            .finish()
    }
}
