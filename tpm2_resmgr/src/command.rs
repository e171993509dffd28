// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed wrapper around a TPM 2.0 command buffer.

use crate::connection::Connection;
use crate::wire::read_u32_at;
use crate::wire::write_u32_at;
use std::sync::Arc;
use thiserror::Error;
use tpm2_proto::CommandCode;
use tpm2_proto::CommandHeader;
use tpm2_proto::HEADER_SIZE;
use tpm2_proto::TpmaCc;
use tpm2_proto::command_attributes;
use zerocopy::FromBytes;

/// Error produced when a client buffer cannot be framed as a TPM command.
#[derive(Debug, Error)]
pub enum CommandParseError {
    /// Buffer shorter than the fixed command header.
    #[error("command buffer of {0} bytes is shorter than the header")]
    Truncated(usize),
    /// The header's size field disagrees with the buffer length.
    #[error("command header claims {claimed} bytes but the buffer holds {actual}")]
    SizeMismatch {
        /// Size the header claims.
        claimed: u32,
        /// Bytes actually received.
        actual: usize,
    },
}

/// A TPM 2.0 command in flight from a client connection.
///
/// Owns the raw buffer. The resource manager rewrites handle-area slots in
/// place before the command reaches the TPM, so the bytes a broker sees may
/// differ from the bytes the client sent.
pub struct Tpm2Command {
    connection: Arc<Connection>,
    code: CommandCode,
    attributes: TpmaCc,
    buffer: Vec<u8>,
}

impl Tpm2Command {
    /// Frames `buffer` as a command arriving on `connection`.
    ///
    /// Command codes outside the attribute table are given zero-handle
    /// attributes and pass through the manager untouched; rejecting junk is
    /// the codec front-end's job.
    pub fn new(connection: Arc<Connection>, buffer: Vec<u8>) -> Result<Self, CommandParseError> {
        let (header, _) = CommandHeader::read_from_prefix(buffer.as_slice())
            .map_err(|_| CommandParseError::Truncated(buffer.len()))?;
        if header.size.get() as usize != buffer.len() {
            return Err(CommandParseError::SizeMismatch {
                claimed: header.size.get(),
                actual: buffer.len(),
            });
        }
        let code = CommandCode(header.command_code.get());
        let attributes = command_attributes(code)
            .unwrap_or_else(|| TpmaCc::new().with_command_index(code.0 as u16));
        Ok(Self {
            connection,
            code,
            attributes,
            buffer,
        })
    }

    /// The connection this command arrived on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The command code from the header.
    pub fn command_code(&self) -> CommandCode {
        self.code
    }

    /// The attributes resolved for the command code.
    pub fn attributes(&self) -> TpmaCc {
        self.attributes
    }

    /// Number of handles in the handle area.
    pub fn handle_count(&self) -> usize {
        self.attributes.c_handles() as usize
    }

    /// Reads handle slot `index`, if the command has one and the buffer is
    /// long enough to hold it.
    pub fn handle(&self, index: usize) -> Option<u32> {
        if index >= self.handle_count() {
            return None;
        }
        read_u32_at(&self.buffer, HEADER_SIZE + 4 * index)
    }

    /// Overwrites handle slot `index` in place.
    pub fn set_handle(&mut self, index: usize, handle: u32) -> bool {
        index < self.handle_count() && write_u32_at(&mut self.buffer, HEADER_SIZE + 4 * index, handle)
    }

    /// For FlushContext, the target handle. It travels as the first
    /// parameter rather than in the handle area.
    pub fn flush_handle(&self) -> Option<u32> {
        read_u32_at(&self.buffer, HEADER_SIZE)
    }

    /// The raw command bytes, with any rewrites applied.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::fmt::Debug for Tpm2Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tpm2Command")
            .field("connection", &self.connection.id())
            .field("code", &self.code)
            .field("size", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2_proto::tpm20::TPM_ST_NO_SESSIONS;
    use zerocopy::IntoBytes;

    fn connection() -> Arc<Connection> {
        Arc::new(Connection::with_default_quota(1))
    }

    fn command_buffer(code: CommandCode, handles: &[u32]) -> Vec<u8> {
        let size = (HEADER_SIZE + 4 * handles.len()) as u32;
        let header = CommandHeader {
            tag: TPM_ST_NO_SESSIONS.into(),
            size: size.into(),
            command_code: code.0.into(),
        };
        let mut buffer = header.as_bytes().to_vec();
        for handle in handles {
            buffer.extend_from_slice(&handle.to_be_bytes());
        }
        buffer
    }

    #[test]
    fn parse_and_accessors() {
        let buffer = command_buffer(CommandCode::READ_PUBLIC, &[0x8000_0000]);
        let command = Tpm2Command::new(connection(), buffer).unwrap();
        assert_eq!(command.command_code(), CommandCode::READ_PUBLIC);
        assert_eq!(command.handle_count(), 1);
        assert_eq!(command.handle(0), Some(0x8000_0000));
        assert_eq!(command.handle(1), None);
    }

    #[test]
    fn rejects_short_buffer() {
        let err = Tpm2Command::new(connection(), vec![0x80, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, CommandParseError::Truncated(3)));
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut buffer = command_buffer(CommandCode::GET_RANDOM, &[]);
        buffer.push(0);
        let err = Tpm2Command::new(connection(), buffer).unwrap_err();
        assert!(matches!(
            err,
            CommandParseError::SizeMismatch {
                claimed: 10,
                actual: 11
            }
        ));
    }

    #[test]
    fn rewrites_handle_slot() {
        let buffer = command_buffer(CommandCode::START_AUTH_SESSION, &[0x8000_0000, 0x4000_0007]);
        let mut command = Tpm2Command::new(connection(), buffer).unwrap();
        assert!(command.set_handle(0, 0x8000_0002));
        assert_eq!(command.handle(0), Some(0x8000_0002));
        assert_eq!(command.handle(1), Some(0x4000_0007));
        assert!(!command.set_handle(2, 0));
    }

    #[test]
    fn flush_handle_reads_parameter_area() {
        let buffer = command_buffer(CommandCode::FLUSH_CONTEXT, &[]);
        let command = Tpm2Command::new(connection(), buffer).unwrap();
        // FlushContext has no handle-area slots; a well-formed command
        // carries the target as a parameter.
        assert_eq!(command.handle_count(), 0);
        assert_eq!(command.flush_handle(), None);

        let mut buffer = command_buffer(CommandCode::FLUSH_CONTEXT, &[]);
        buffer.extend_from_slice(&0x80AB_CDEFu32.to_be_bytes());
        buffer[5] = (HEADER_SIZE + 4) as u8;
        let command = Tpm2Command::new(connection(), buffer).unwrap();
        assert_eq!(command.flush_handle(), Some(0x80AB_CDEF));
    }

    #[test]
    fn unknown_code_passes_through() {
        let buffer = command_buffer(CommandCode(0x0000_9999), &[]);
        let command = Tpm2Command::new(connection(), buffer).unwrap();
        assert_eq!(command.handle_count(), 0);
        assert!(!command.attributes().r_handle());
    }
}
