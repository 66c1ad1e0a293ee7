// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Wire codec interface.
//!
//! The binary serialization of [`Message`](super::Message) is an external
//! collaborator. Two codec generations exist on the wire: v2 (fixed header
//! layout) and v4 (per-field presence flags plus an optional shared string
//! table for repeated path/member names). The core is version-agnostic and
//! only cares about the in-memory message tree, so the whole surface is this
//! trait.
//!
//! Stream transports frame the packed bytes themselves; the in-process
//! transport bypasses packing entirely and hands the tree across directly.

use super::Message;
use crate::error::Result;

/// Codec generation negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecVersion {
    /// Fixed header layout.
    V2,
    /// Optional presence flags and shared string table.
    V4,
}

/// Opaque pack/unpack between bytes and the message tree.
pub trait WireCodec: Send + Sync {
    /// Codec generation implemented by this codec.
    fn version(&self) -> CodecVersion;

    /// Serialize a message.
    fn pack(&self, message: &Message) -> Result<Vec<u8>>;

    /// Deserialize a message.
    fn unpack(&self, bytes: &[u8]) -> Result<Message>;
}
