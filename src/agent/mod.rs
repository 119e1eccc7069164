// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent subprocess layer: process supervision, stderr classification, and
//! JSON-RPC correlation over the newline-delimited stdio pipe.

pub mod rpc;
pub mod stderr;
pub mod supervisor;

pub use rpc::{AgentNotice, RpcCorrelator, RpcError};
pub use stderr::StderrKind;
pub use supervisor::{AgentCommand, AgentError, AgentSupervisor, SessionCallbacks, SpawnSpec};
