//! Completion and cancellation state of one long operation.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::cancel::CancellationToken;
use crate::event::Event;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent {
    CompletionChanged(f32),
    CancelRequested,
}

/// Shared between the running operation (writer) and the manager (observer).
///
/// Each operation owns one `Progress` and is its only writer, so updates are
/// observed in the order they were made.
#[derive(Debug)]
pub struct Progress {
    completion_bits: AtomicU32,
    cancel: CancellationToken,
    events: Event<ProgressEvent>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            completion_bits: AtomicU32::new(0f32.to_bits()),
            cancel: CancellationToken::new(),
            events: Event::new(),
        }
    }

    /// Store `completion`, clamped to `[0, 1]`, and notify subscribers.
    ///
    /// NaN is ignored.
    pub fn set_completion(&self, completion: f32) {
        if completion.is_nan() {
            return;
        }
        let completion = completion.clamp(0.0, 1.0);
        self.completion_bits
            .store(completion.to_bits(), Ordering::SeqCst);
        self.events
            .broadcast(&ProgressEvent::CompletionChanged(completion));
    }

    pub fn completion(&self) -> f32 {
        f32::from_bits(self.completion_bits.load(Ordering::SeqCst))
    }

    /// Request cooperative cancellation. Returns `true` on the first request.
    pub fn user_clicked_cancel(&self) -> bool {
        let first = self.cancel.cancel();
        if first {
            self.events.broadcast(&ProgressEvent::CancelRequested);
        }
        first
    }

    pub fn has_been_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested; use with `?` in loops.
    pub fn check_canceled(&self) -> Result<()> {
        Ok(self.cancel.check()?)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn events(&self) -> &Event<ProgressEvent> {
        &self.events
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}
