/// Consumer contract: the single sink a streaming session feeds.
///
/// The engine calls the consumer from its hot loop with exactly one kind of
/// event per call. The returned [`Flow`] is the only backpressure and
/// cancellation channel the consumer has, so it must return promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::progress::ProgressSnapshot;

/// Consumer decision after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Release the slot that delivered this event instead of resubmitting it.
    Stop,
}

impl Flow {
    #[inline]
    pub fn is_stop(self) -> bool {
        self == Flow::Stop
    }
}

/// What the engine hands the consumer.
#[derive(Debug)]
pub enum StreamEvent<'a> {
    /// One packet payload of a completed read transfer.
    Payload(&'a [u8]),
    /// A write buffer about to be (re)submitted; the consumer fills it.
    Fill(&'a mut [u8]),
    /// A fresh progress sample.
    Progress(&'a ProgressSnapshot),
}

pub trait StreamConsumer {
    fn on_event(&mut self, event: StreamEvent<'_>) -> Flow;
}

impl<F> StreamConsumer for F
where
    F: FnMut(StreamEvent<'_>) -> Flow,
{
    fn on_event(&mut self, event: StreamEvent<'_>) -> Flow {
        self(event)
    }
}

/// Abort request shared with a signal handler.
///
/// Only ever set from outside the engine; the engine reads it at the top of
/// each loop iteration and before each consumer dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
