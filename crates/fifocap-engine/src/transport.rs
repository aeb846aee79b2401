/// Transport collaborator contract.
///
/// The engine never touches a device directly. It submits owned buffers,
/// waits for completions with a bounded timeout, and gets the buffers back
/// inside [`Completion`]s. Completion handling happens on the caller's
/// thread right after [`Transport::wait_completions`] returns.

use std::fmt;
use std::time::Duration;

use crate::error::TransportError;

/// Data direction of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peripheral to host.
    Read,
    /// Host to peripheral.
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Peripheral operating modes the engine switches between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralMode {
    /// Known idle state; no data flows.
    Reset,
    /// Continuous synchronous FIFO streaming.
    SyncFifo,
}

/// One buffer handed to the transport.
#[derive(Debug)]
pub struct TransferRequest {
    /// Pool index of the submitting slot, echoed back in the completion.
    pub slot: usize,
    /// Selects the endpoint.
    pub direction: Direction,
    pub buffer: Vec<u8>,
    /// Bytes to transfer: the read size for reads, the valid prefix for writes.
    pub length: usize,
}

/// Final status of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    Stall,
    TimedOut,
    Disconnected,
    Overflow,
    Fault(String),
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Stall => f.write_str("stall"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Overflow => f.write_str("overflow"),
            Self::Fault(msg) => write!(f, "fault: {}", msg),
        }
    }
}

/// A finished transfer, returning buffer ownership to the engine.
#[derive(Debug)]
pub struct Completion {
    pub slot: usize,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
    pub status: TransferStatus,
}

/// Failure of the bounded wait primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The wait was cut short by a signal; it may be retried.
    Interrupted,
    Failed(TransportError),
}

/// Operations a streaming session needs from the transport.
pub trait Transport {
    /// Bulk packet size of the streaming endpoint.
    fn packet_size(&self) -> usize;

    fn set_mode(&mut self, mode: PeripheralMode) -> Result<(), TransportError>;

    /// Purge pending data in both directions.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Queue an asynchronous transfer. On error the buffer is dropped.
    fn submit(&mut self, request: TransferRequest) -> Result<(), TransportError>;

    /// Block for at most `timeout`, appending every finished transfer to `out`.
    ///
    /// Returning with nothing appended means no transfer finished in time.
    fn wait_completions(
        &mut self,
        timeout: Duration,
        out: &mut Vec<Completion>,
    ) -> Result<(), WaitError>;

    /// Request cancellation of every outstanding transfer. Cancelled
    /// transfers still complete through [`wait_completions`](Self::wait_completions).
    fn cancel_all(&mut self);
}
