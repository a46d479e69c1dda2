//! Subscription sinks and handles.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SubscriptionError;
use crate::identifiers::OperationId;
use crate::protocol::SubscribePayload;

use super::engine::Command;

// ============================================================================
// SubscriptionSink
// ============================================================================

/// Receives the results of one subscription.
///
/// After `error` or `complete` no further calls are made.
pub trait SubscriptionSink: Send + 'static {
    /// One execution result.
    fn next(&mut self, value: Value);

    /// The subscription failed.
    fn error(&mut self, error: SubscriptionError);

    /// The subscription finished.
    fn complete(&mut self);
}

/// Items delivered to a channel-backed sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// One execution result.
    Next(Value),
    /// The subscription failed. Last item.
    Error(SubscriptionError),
    /// The subscription finished. Last item.
    Complete,
}

impl SubscriptionSink for mpsc::UnboundedSender<SubscriptionEvent> {
    fn next(&mut self, value: Value) {
        let _ = self.send(SubscriptionEvent::Next(value));
    }

    fn error(&mut self, error: SubscriptionError) {
        let _ = self.send(SubscriptionEvent::Error(error));
    }

    fn complete(&mut self) {
        let _ = self.send(SubscriptionEvent::Complete);
    }
}

// ============================================================================
// Subscriber
// ============================================================================

/// Engine-side record of one subscription.
pub(crate) struct Subscriber {
    pub(crate) id: OperationId,
    pub(crate) payload: SubscribePayload,
    pub(crate) sink: Box<dyn SubscriptionSink>,
    /// Shared with the [`Subscription`] handle.
    pub(crate) disposed: Arc<AtomicBool>,
}

impl Subscriber {
    /// Marks the subscriber finished so a later `dispose()` is a no-op.
    pub(crate) fn finish(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("query", &self.payload.query)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle of one subscription.
///
/// Dropping the handle does not stop the subscription; call
/// [`dispose`](Self::dispose).
#[derive(Debug, Clone)]
pub struct Subscription {
    id: OperationId,
    disposed: Arc<AtomicBool>,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub(crate) fn new(
        id: OperationId,
        disposed: Arc<AtomicBool>,
        command_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            disposed,
            command_tx,
        }
    }

    /// Returns the operation id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    /// Returns `true` once the subscription was disposed or finished.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stops the subscription and completes its sink.
    ///
    /// Sends `complete` to the server if the connection is acknowledged.
    /// Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.command_tx.send(Command::Unsubscribe(self.id.clone()));
    }
}

// ============================================================================
// Tests
// ============================================================================
