/// fifocap engine: continuous bulk streaming from synchronous FIFO peripherals.
///
/// Provides:
/// - A fixed pool of transfer slots kept perpetually in flight
/// - Per-packet demultiplexing that strips transport status bytes
/// - A single-threaded streaming state machine with liveness detection
/// - Consumer backpressure and cancellation through one callback
/// - Throughput sampling on a fixed cadence
/// - Sequence integrity checking of binary counter and text line streams
/// - A simulated peripheral for testing without hardware

pub mod consumer;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod logging;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod sim;
pub mod transport;

// Re-export key types for convenience.
pub use consumer::{CancelFlag, Flow, StreamConsumer, StreamEvent};
pub use engine::{EngineState, SessionReport, StreamConfig, StreamEngine, Termination};
pub use error::{StreamError, TransportError};
pub use integrity::{
    BinaryChecker, BinaryFormat, Checker, IntegrityReport, RecordFormat, SequenceCheck,
    TextChecker, check_dump,
};
pub use logging::{NullLogger, SessionEvent, SessionLog, SessionLogger, TracingLogger};
pub use progress::{Clock, ProgressSnapshot, ProgressTracker, SystemClock};
pub use protocol::{
    DEFAULT_LATENCY_MS, DEFAULT_PACKET_SIZE, DEFAULT_PACKETS_PER_TRANSFER, DEFAULT_TRANSFER_COUNT,
    DEFAULT_WAIT_TIMEOUT, PACKET_STATUS_LEN, PROGRESS_INTERVAL, demux,
};
pub use sim::{SimConfig, SimPattern, SimulatedFifo};
pub use transport::{
    Completion, Direction, PeripheralMode, TransferRequest, TransferStatus, Transport, WaitError,
};
