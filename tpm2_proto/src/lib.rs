// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 2.0 protocol vocabulary shared across the resource manager stack:
//! handle ranges, command codes and their attributes, response codes with
//! TSS2 layering, and the fixed command/response headers.

#![forbid(unsafe_code)]

pub mod tpm20;

pub use tpm20::CommandCode;
pub use tpm20::CommandHeader;
pub use tpm20::HEADER_SIZE;
pub use tpm20::HandleType;
pub use tpm20::MAX_COMMAND_HANDLES;
pub use tpm20::ResponseHeader;
pub use tpm20::TpmaCc;
pub use tpm20::TssRc;
pub use tpm20::command_attributes;
pub use tpm20::is_transient;
