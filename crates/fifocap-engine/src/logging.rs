/// Session logging trait for structured engine events.
///
/// The engine reports lifecycle events through a [`SessionLogger`] so the
/// embedding program decides where they go: `tracing`, or nowhere.

use std::fmt;

use crate::engine::EngineState;
use crate::transport::Direction;

/// Structured log entry for a streaming session.
#[derive(Debug, Clone)]
pub struct SessionLog {
    pub component: &'static str,
    pub event: SessionEvent,
}

/// Session events that can be logged.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Engine moved to a new state
    StateChanged {
        from: EngineState,
        to: EngineState,
    },
    /// All slots submitted, peripheral about to stream
    Primed {
        direction: Direction,
        slots: usize,
        buffer_len: usize,
    },
    /// Consumer released a slot
    SlotReleased {
        slot: usize,
        live: usize,
    },
    /// Wait primitive interrupted by a signal, retrying
    WaitInterrupted,
    /// Progress sample taken
    Progress {
        total_bytes: u64,
        current_rate: Option<f64>,
    },
    /// Transfer finished with a non-success status
    TransferFailed {
        slot: usize,
        status: String,
    },
    /// No completion within one wait interval
    Stalled {
        timeout_ms: u64,
    },
    /// Drain finished
    Drained {
        collected: usize,
        abandoned: usize,
    },
    /// Session ended
    Finished {
        total_bytes: u64,
        transfers: u64,
        elapsed_ms: u64,
    },
    /// Error occurred
    Error {
        message: String,
    },
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged { from, to } => write!(f, "state {:?} -> {:?}", from, to),
            Self::Primed { direction, slots, buffer_len } => {
                write!(f, "primed direction={} slots={} buffer_len={}", direction, slots, buffer_len)
            }
            Self::SlotReleased { slot, live } => write!(f, "slot_released slot={} live={}", slot, live),
            Self::WaitInterrupted => f.write_str("wait_interrupted retrying"),
            Self::Progress { total_bytes, current_rate } => match current_rate {
                Some(rate) => write!(f, "progress bytes={} rate={:.0}B/s", total_bytes, rate),
                None => write!(f, "progress bytes={}", total_bytes),
            },
            Self::TransferFailed { slot, status } => {
                write!(f, "transfer_failed slot={} status={}", slot, status)
            }
            Self::Stalled { timeout_ms } => write!(f, "stalled no completions in {}ms", timeout_ms),
            Self::Drained { collected, abandoned } => {
                write!(f, "drained collected={} abandoned={}", collected, abandoned)
            }
            Self::Finished { total_bytes, transfers, elapsed_ms } => write!(
                f,
                "finished bytes={} transfers={} elapsed_ms={}",
                total_bytes, transfers, elapsed_ms
            ),
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Trait for session logging.
pub trait SessionLogger: Send + Sync {
    fn log(&self, entry: SessionLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl SessionLogger for TracingLogger {
    fn log(&self, entry: SessionLog) {
        match &entry.event {
            SessionEvent::TransferFailed { .. } | SessionEvent::Error { .. } => {
                tracing::error!(component = entry.component, "{}", entry.event);
            }
            SessionEvent::Stalled { .. } => {
                tracing::warn!(component = entry.component, "{}", entry.event);
            }
            SessionEvent::Primed { .. }
            | SessionEvent::Drained { .. }
            | SessionEvent::Finished { .. } => {
                tracing::info!(component = entry.component, "{}", entry.event);
            }
            // per-slot and per-second noise
            _ => {
                tracing::debug!(component = entry.component, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl SessionLogger for NullLogger {
    fn log(&self, _entry: SessionLog) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let e = SessionEvent::Primed {
            direction: Direction::Read,
            slots: 256,
            buffer_len: 4096,
        };
        assert_eq!(e.to_string(), "primed direction=read slots=256 buffer_len=4096");

        let e = SessionEvent::StateChanged {
            from: EngineState::Priming,
            to: EngineState::Streaming,
        };
        assert_eq!(e.to_string(), "state Priming -> Streaming");

        let e = SessionEvent::Progress {
            total_bytes: 10,
            current_rate: None,
        };
        assert_eq!(e.to_string(), "progress bytes=10");
    }
}
