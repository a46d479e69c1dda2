//! Client connection engine.
//!
//! A [`Client`] multiplexes subscriptions over one connection that it opens
//! on demand, keeps alive, and re-establishes after recoverable failures.
//!
//! # Lifecycle
//!
//! | Mode | Connects | Disconnects |
//! |------|----------|-------------|
//! | Lazy (default) | First subscribe | `lazy_close_timeout` after the last subscriber leaves |
//! | Eager | [`Client::new`] | [`Client::dispose`] |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Client`] handle |
//! | `engine` | Background task owning the socket (internal) |
//! | `events` | [`ClientEvent`] and listeners |
//! | `options` | [`ClientOptions`] |
//! | `retry` | Reconnect classification and backoff |
//! | `subscriber` | [`SubscriptionSink`] and [`Subscription`] handles |

// ============================================================================
// Submodules
// ============================================================================

mod engine;

/// Client handle.
pub mod core;

/// Lifecycle events.
pub mod events;

/// Configuration.
pub mod options;

/// Reconnect policy.
pub mod retry;

/// Sinks and subscription handles.
pub mod subscriber;

// ============================================================================
// Re-exports
// ============================================================================

pub use core::Client;
pub use events::{ClientEvent, ClientEventKind, Listener};
pub use options::{ClientOptions, DEFAULT_LAZY_CLOSE_TIMEOUT, DEFAULT_RETRY_ATTEMPTS};
pub use retry::{default_retry_wait, default_should_retry};
pub use subscriber::{Subscription, SubscriptionEvent, SubscriptionSink};
