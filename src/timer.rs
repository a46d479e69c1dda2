//! Single-purpose timer slots for engine event loops.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Sleep, sleep};

/// One optional deadline that an event loop can select on.
///
/// Arming replaces any previous deadline. [`fired`](Self::fired) never
/// resolves while the slot is empty.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot(Option<Pin<Box<Sleep>>>);

impl TimerSlot {
    /// Arms the slot to fire after `duration`.
    pub(crate) fn arm(&mut self, duration: Duration) {
        self.0 = Some(Box::pin(sleep(duration)));
    }

    /// Clears the slot.
    pub(crate) fn cancel(&mut self) {
        self.0 = None;
    }

    /// Returns `true` while a deadline is pending.
    pub(crate) fn is_armed(&self) -> bool {
        self.0.is_some()
    }

    /// Waits for the deadline, then clears the slot. Cancel safe.
    pub(crate) async fn fired(&mut self) {
        match self.0.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.0 = None;
            }
            None => pending().await,
        }
    }
}
