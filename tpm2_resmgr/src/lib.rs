// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A TPM 2.0 resource manager.
//!
//! The TPM can hold only a handful of loaded transient objects at once,
//! while clients expect unlimited handle space. This crate brokers between
//! the two: each client connection gets a private virtual handle space, and
//! the manager transparently context-saves and reloads transient objects
//! around every command so the physical TPM never overflows.
//!
//! [`ResourceManager`] owns the single dispatch worker that serializes all
//! TPM access. Clients enqueue [`Message`]s from any thread; responses come
//! back through the configured [`Sink`]. The raw TPM channel is reached
//! through the [`AccessBroker`] trait.

#![forbid(unsafe_code)]

pub mod broker;
pub mod command;
pub mod connection;
pub mod handle_map;
pub mod manager;
pub mod message;
pub mod response;
pub mod sink;
mod wire;

pub use broker::AccessBroker;
pub use broker::SavedContext;
pub use command::Tpm2Command;
pub use connection::Connection;
pub use handle_map::HandleMap;
pub use handle_map::HandleMapEntry;
pub use manager::ResourceManager;
pub use message::ControlCode;
pub use message::Message;
pub use response::Tpm2Response;
pub use sink::Sink;
pub use sink::Source;
