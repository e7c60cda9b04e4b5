// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Collaboration tool server: exposes the shared context to agents as named
//! tools.
//!
//! The registry is an explicit table `name → tool` built once per workspace
//! by [`build_collab_registry`]; every tool is a unit struct implementing
//! [`CollabTool`] with the caller's identity delivered through [`ToolCtx`].
//! The same table serves two transports:
//! - in-process backends call through [`RegistryToolSet`] (the
//!   `worker_backend::ToolSet` seam);
//! - subprocess backends speak the sessioned JSON-RPC endpoint built by
//!   [`server::collab_router`], mounted by the daemon at `/mcp`.

mod registry;
pub mod server;
mod tool;
mod tools;
mod toolset;

pub use registry::{build_collab_registry, CollabRegistry, ToolOutcome};
pub use server::{collab_router, CollabServerState, SESSION_HEADER};
pub use tool::{CollabTool, ToolCtx};
pub use toolset::RegistryToolSet;
