// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Client-facing message protocol: the typed envelope vocabulary and the
//! structural payload schemas behind it.
//!
//! Every frame on the client socket is one JSON envelope
//! `{id, type, timestamp, payload?, error?}`. The `type` field is drawn from
//! a closed vocabulary of `<domain>:<action>[:<status>]` strings; the schema
//! registry in [`payloads`] validates the payload shape for each type.

pub mod envelope;
pub mod payloads;

pub use envelope::{Envelope, ErrorDetail, InboundError, MessageType, Role};
pub use payloads::validate;

/// Protocol version advertised in `connection:established:success` and
/// `acp:initialize:success`.
pub const PROTOCOL_VERSION: u32 = 1;
