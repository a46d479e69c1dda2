//! Server connection engine.
//!
//! Accepts sockets from any transport, validates the handshake, runs
//! operations through an [`Executor`] and streams their results back.
//!
//! # Close Codes
//!
//! | Condition | Code |
//! |-----------|------|
//! | No `connection_init` in time | 4408 |
//! | Second `connection_init` | 4429 |
//! | `on_connect` rejected | 4403 |
//! | `subscribe` before ack | 4401 |
//! | Duplicate operation id | 4409 |
//! | Malformed or unexpected message | 4400 |
//! | Internal failure | 4500 |
//! | Missed keep-alive pong | 1006 |
//! | Server disposed | 1001 |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Per-connection event loop |
//! | `core` | [`Server`] handle and accept loops |
//! | `options` | [`ServerOptions`], [`Executor`], [`ServerHooks`] |

// ============================================================================
// Submodules
// ============================================================================

mod connection;

/// Server handle.
pub mod core;

/// Configuration, executor and hooks.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use core::Server;
pub use options::{
    ConnectionContext, DEFAULT_CONNECTION_INIT_WAIT_TIMEOUT, DEFAULT_KEEP_ALIVE, DefaultHooks,
    Executor, HookError, OperationError, ResultStream, ServerHooks, ServerOptions,
};
