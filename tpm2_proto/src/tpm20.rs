// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 2.0 wire-level definitions (TPM 2.0 Library Specification, Part 2).
//!
//! Only the subset a resource manager needs: enough of the handle, command
//! code, and response code vocabulary to discriminate transient objects,
//! count command handles, and synthesize standard-layout error responses.

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::big_endian::U16;
use zerocopy::byteorder::big_endian::U32;

/// Shift that recovers the type byte from a 32-bit handle (`HR_SHIFT`).
pub const HR_SHIFT: u32 = 24;

/// First handle in the transient object range.
pub const TRANSIENT_HANDLE_FIRST: u32 = 0x8000_0000;

/// Last handle in the transient object range.
pub const TRANSIENT_HANDLE_LAST: u32 = 0x80FF_FFFF;

/// The type byte of a TPM 2.0 handle (`TPM_HT`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HandleType(pub u8);

impl HandleType {
    /// PCR handles.
    pub const PCR: Self = Self(0x00);
    /// NV index handles.
    pub const NV_INDEX: Self = Self(0x01);
    /// HMAC or loaded session handles.
    pub const HMAC_SESSION: Self = Self(0x02);
    /// Policy or saved session handles.
    pub const POLICY_SESSION: Self = Self(0x03);
    /// Permanent handles (hierarchies, the password session, ...).
    pub const PERMANENT: Self = Self(0x40);
    /// Transient object handles.
    pub const TRANSIENT: Self = Self(0x80);
    /// Persistent object handles.
    pub const PERSISTENT: Self = Self(0x81);

    /// Returns the type of `handle`.
    pub const fn of(handle: u32) -> Self {
        Self((handle >> HR_SHIFT) as u8)
    }
}

/// Returns true if `handle` falls in the transient object range.
pub const fn is_transient(handle: u32) -> bool {
    HandleType::of(handle).0 == HandleType::TRANSIENT.0
}

/// A TPM 2.0 command code (`TPM_CC`).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct CommandCode(pub u32);

impl CommandCode {
    /// TPM2_EvictControl.
    pub const EVICT_CONTROL: Self = Self(0x0000_0120);
    /// TPM2_NV_UndefineSpace.
    pub const NV_UNDEFINE_SPACE: Self = Self(0x0000_0122);
    /// TPM2_CreatePrimary.
    pub const CREATE_PRIMARY: Self = Self(0x0000_0131);
    /// TPM2_Startup.
    pub const STARTUP: Self = Self(0x0000_0144);
    /// TPM2_Shutdown.
    pub const SHUTDOWN: Self = Self(0x0000_0145);
    /// TPM2_Create.
    pub const CREATE: Self = Self(0x0000_0153);
    /// TPM2_Load.
    pub const LOAD: Self = Self(0x0000_0157);
    /// TPM2_Sign.
    pub const SIGN: Self = Self(0x0000_015D);
    /// TPM2_Unseal.
    pub const UNSEAL: Self = Self(0x0000_015E);
    /// TPM2_ContextLoad.
    pub const CONTEXT_LOAD: Self = Self(0x0000_0161);
    /// TPM2_ContextSave.
    pub const CONTEXT_SAVE: Self = Self(0x0000_0162);
    /// TPM2_FlushContext.
    pub const FLUSH_CONTEXT: Self = Self(0x0000_0165);
    /// TPM2_LoadExternal.
    pub const LOAD_EXTERNAL: Self = Self(0x0000_0167);
    /// TPM2_ReadPublic.
    pub const READ_PUBLIC: Self = Self(0x0000_0173);
    /// TPM2_StartAuthSession.
    pub const START_AUTH_SESSION: Self = Self(0x0000_0176);
    /// TPM2_GetCapability.
    pub const GET_CAPABILITY: Self = Self(0x0000_017A);
    /// TPM2_GetRandom.
    pub const GET_RANDOM: Self = Self(0x0000_017B);
    /// TPM2_PCR_Read.
    pub const PCR_READ: Self = Self(0x0000_017E);

    /// True for command codes that load a new transient object into the TPM
    /// on success. This is the set the per-connection object quota guards.
    pub const fn creates_transient_object(&self) -> bool {
        matches!(
            *self,
            Self::CREATE_PRIMARY | Self::LOAD | Self::LOAD_EXTERNAL
        )
    }
}

impl std::fmt::Debug for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::EVICT_CONTROL => f.write_str("TPM2_EvictControl"),
            Self::NV_UNDEFINE_SPACE => f.write_str("TPM2_NV_UndefineSpace"),
            Self::CREATE_PRIMARY => f.write_str("TPM2_CreatePrimary"),
            Self::STARTUP => f.write_str("TPM2_Startup"),
            Self::SHUTDOWN => f.write_str("TPM2_Shutdown"),
            Self::CREATE => f.write_str("TPM2_Create"),
            Self::LOAD => f.write_str("TPM2_Load"),
            Self::SIGN => f.write_str("TPM2_Sign"),
            Self::UNSEAL => f.write_str("TPM2_Unseal"),
            Self::CONTEXT_LOAD => f.write_str("TPM2_ContextLoad"),
            Self::CONTEXT_SAVE => f.write_str("TPM2_ContextSave"),
            Self::FLUSH_CONTEXT => f.write_str("TPM2_FlushContext"),
            Self::LOAD_EXTERNAL => f.write_str("TPM2_LoadExternal"),
            Self::READ_PUBLIC => f.write_str("TPM2_ReadPublic"),
            Self::START_AUTH_SESSION => f.write_str("TPM2_StartAuthSession"),
            Self::GET_CAPABILITY => f.write_str("TPM2_GetCapability"),
            Self::GET_RANDOM => f.write_str("TPM2_GetRandom"),
            Self::PCR_READ => f.write_str("TPM2_PCR_Read"),
            Self(code) => write!(f, "TPM_CC({code:#010x})"),
        }
    }
}

/// TPM 2.0 command code attributes (`TPMA_CC`).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TpmaCc {
    /// Low 16 bits of the associated command code.
    #[bits(16)]
    pub command_index: u16,
    #[bits(6)]
    pub _reserved0: u8,
    /// The command may write to NV.
    pub nv: bool,
    /// The command could flush any number of loaded contexts.
    pub extensive: bool,
    /// The command flushes any transient object named in its handle area.
    pub flushed: bool,
    /// Number of handles in the handle area.
    #[bits(3)]
    pub c_handles: u8,
    /// The response carries a handle.
    pub r_handle: bool,
    /// The command is vendor-defined.
    pub v: bool,
    #[bits(2)]
    pub _reserved1: u8,
}

/// Returns the command attributes for `code`, for the command codes this
/// crate knows about.
///
/// A deployed daemon learns these from the TPM via GetCapability; a fixed
/// table covers the command set the resource manager must special-case.
pub fn command_attributes(code: CommandCode) -> Option<TpmaCc> {
    let (c_handles, r_handle) = match code {
        CommandCode::EVICT_CONTROL => (2, false),
        CommandCode::NV_UNDEFINE_SPACE => (2, false),
        CommandCode::CREATE_PRIMARY => (1, true),
        CommandCode::STARTUP | CommandCode::SHUTDOWN => (0, false),
        CommandCode::CREATE => (1, false),
        CommandCode::LOAD => (1, true),
        CommandCode::SIGN | CommandCode::UNSEAL => (1, false),
        CommandCode::CONTEXT_LOAD => (0, true),
        CommandCode::CONTEXT_SAVE => (1, false),
        // The flush target travels in the parameter area, not the handle
        // area.
        CommandCode::FLUSH_CONTEXT => (0, false),
        CommandCode::LOAD_EXTERNAL => (0, true),
        CommandCode::READ_PUBLIC => (1, false),
        CommandCode::START_AUTH_SESSION => (2, true),
        CommandCode::GET_CAPABILITY | CommandCode::GET_RANDOM | CommandCode::PCR_READ => (0, false),
        _ => return None,
    };
    Some(
        TpmaCc::new()
            .with_command_index(code.0 as u16)
            .with_c_handles(c_handles)
            .with_r_handle(r_handle),
    )
}

/// A TSS2 response code: a TPM response code, possibly tagged with the
/// layer of the stack that produced it.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct TssRc(pub u32);

impl TssRc {
    /// The operation succeeded.
    pub const SUCCESS: Self = Self(0);

    /// Base of format-zero "version 1" response codes (`RC_VER1`).
    pub const RC_VER1: u32 = 0x100;
    /// Base of format-one response codes (`RC_FMT1`).
    pub const RC_FMT1: u32 = 0x080;
    /// Out of object memory (`TPM_RC_OBJECT_MEMORY`).
    pub const TPM_RC_OBJECT_MEMORY: u32 = Self::RC_VER1 + 0x002;
    /// The handle is not correct for the use (`TPM_RC_HANDLE`).
    pub const TPM_RC_HANDLE: u32 = Self::RC_FMT1 + 0x00B;
    /// Modifier: the offending value was a parameter (`TPM_RC_P`).
    pub const TPM_RC_P: u32 = 0x040;
    /// Modifier: first handle or parameter (`TPM_RC_1`).
    pub const TPM_RC_1: u32 = 0x100;
    /// Catch-all failure in a TSS2 component
    /// (`TSS2_BASE_RC_GENERAL_FAILURE`).
    pub const BASE_RC_GENERAL_FAILURE: u32 = 9;

    /// Bit position of the TSS2 layer indicator.
    pub const LAYER_SHIFT: u32 = 16;
    /// The resource manager's TSS2 layer.
    pub const RESMGR_LAYER: u32 = 11 << Self::LAYER_SHIFT;

    /// Rejection synthesized when a connection's transient object quota is
    /// exhausted.
    pub const RESMGR_OBJECT_MEMORY: Self = Self::resmgr(Self::TPM_RC_OBJECT_MEMORY);
    /// Rejection synthesized when FlushContext names a transient handle the
    /// resource manager never issued: handle error, parameter, first.
    pub const RESMGR_BAD_FLUSH_HANDLE: Self =
        Self::resmgr(Self::TPM_RC_HANDLE + Self::TPM_RC_P + Self::TPM_RC_1);

    /// Tags `rc` with the resource manager layer so clients can attribute
    /// the failure.
    pub const fn resmgr(rc: u32) -> Self {
        Self(Self::RESMGR_LAYER | rc)
    }

    /// True for `TPM_RC_SUCCESS`.
    pub const fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for TssRc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TssRc({:#010x})", self.0)
    }
}

impl std::fmt::Display for TssRc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Tag for a command or response with no attached sessions
/// (`TPM_ST_NO_SESSIONS`).
pub const TPM_ST_NO_SESSIONS: u16 = 0x8001;
/// Tag for a command or response with attached sessions
/// (`TPM_ST_SESSIONS`).
pub const TPM_ST_SESSIONS: u16 = 0x8002;

/// Size in bytes of the fixed header on every command and response.
pub const HEADER_SIZE: usize = 10;

/// Most handles a TPM 2.0 command can carry in its handle area.
pub const MAX_COMMAND_HANDLES: usize = 3;

/// Fixed header at the front of every TPM 2.0 command.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct CommandHeader {
    /// Session tag.
    pub tag: U16,
    /// Total size of the command, header included.
    pub size: U32,
    /// The command code.
    pub command_code: U32,
}

/// Fixed header at the front of every TPM 2.0 response.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ResponseHeader {
    /// Session tag.
    pub tag: U16,
    /// Total size of the response, header included.
    pub size: U32,
    /// The response code.
    pub response_code: U32,
}

static_assertions::const_assert_eq!(HEADER_SIZE, size_of::<CommandHeader>());
static_assertions::const_assert_eq!(HEADER_SIZE, size_of::<ResponseHeader>());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_type_discrimination() {
        assert_eq!(HandleType::of(0x8000_0001), HandleType::TRANSIENT);
        assert_eq!(HandleType::of(0x8100_0003), HandleType::PERSISTENT);
        assert_eq!(HandleType::of(0x0300_0000), HandleType::POLICY_SESSION);
        assert_eq!(HandleType::of(0x0200_0000), HandleType::HMAC_SESSION);
        assert_eq!(HandleType::of(0x4000_0001), HandleType::PERMANENT);
        assert_eq!(HandleType::of(0x0000_0007), HandleType::PCR);
    }

    #[test]
    fn transient_range() {
        assert!(is_transient(TRANSIENT_HANDLE_FIRST));
        assert!(is_transient(TRANSIENT_HANDLE_LAST));
        assert!(is_transient(0x80AB_CDEF));
        assert!(!is_transient(0x8100_0000));
        assert!(!is_transient(0x7FFF_FFFF));
        assert!(!is_transient(0));
    }

    #[test]
    fn attributes_table() {
        let create_primary = command_attributes(CommandCode::CREATE_PRIMARY).unwrap();
        assert_eq!(create_primary.c_handles(), 1);
        assert!(create_primary.r_handle());
        assert_eq!(create_primary.command_index(), 0x0131);

        let flush = command_attributes(CommandCode::FLUSH_CONTEXT).unwrap();
        assert_eq!(flush.c_handles(), 0);
        assert!(!flush.r_handle());

        let start_session = command_attributes(CommandCode::START_AUTH_SESSION).unwrap();
        assert_eq!(start_session.c_handles(), 2);
        assert!(start_session.r_handle());

        assert!(command_attributes(CommandCode(0x0000_9999)).is_none());
    }

    #[test]
    fn quota_guarded_set() {
        assert!(CommandCode::CREATE_PRIMARY.creates_transient_object());
        assert!(CommandCode::LOAD.creates_transient_object());
        assert!(CommandCode::LOAD_EXTERNAL.creates_transient_object());
        assert!(!CommandCode::CONTEXT_LOAD.creates_transient_object());
        assert!(!CommandCode::CREATE.creates_transient_object());
    }

    #[test]
    fn resmgr_rc_values() {
        assert_eq!(TssRc::RESMGR_OBJECT_MEMORY.0, 0x000B_0102);
        assert_eq!(TssRc::RESMGR_BAD_FLUSH_HANDLE.0, 0x000B_01CB);
        assert!(TssRc::SUCCESS.is_success());
        assert!(!TssRc::RESMGR_OBJECT_MEMORY.is_success());
    }

    #[test]
    fn header_round_trip() {
        let bytes = [0x80, 0x02, 0x00, 0x00, 0x00, 0x1B, 0x00, 0x00, 0x01, 0x31];
        let (header, rest) = CommandHeader::read_from_prefix(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(header.tag.get(), TPM_ST_SESSIONS);
        assert_eq!(header.size.get(), 0x1B);
        assert_eq!(header.command_code.get(), CommandCode::CREATE_PRIMARY.0);
        assert_eq!(header.as_bytes(), &bytes);
    }
}
