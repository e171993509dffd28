// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Messages accepted by the resource manager's input queue.

use crate::command::Tpm2Command;

/// Control messages interleaved with commands on the input queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlCode {
    /// Re-check the cancel flag. Enqueued to wake a blocked dequeue when
    /// the process is shutting down.
    CheckCancel,
    /// Terminate the dispatch worker.
    Exit,
}

/// One unit of work for the dispatch worker.
pub enum Message {
    /// A client command to run through the pipeline.
    Command(Tpm2Command),
    /// A control message.
    Control(ControlCode),
}
