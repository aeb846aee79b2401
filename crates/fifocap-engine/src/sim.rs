/// In-process synchronous FIFO peripheral.
///
/// Produces the same packet framing a real device does: `packet_size` bytes
/// per packet, the last two being transport status, the rest a continuous
/// stream of counter records. Data only flows in [`PeripheralMode::SyncFifo`].
///
/// Faults are injected by count, not by time, so sessions are reproducible:
///
/// ```text
/// drop_every  = 100   every 100th record never reaches the host
/// stall_after = 40    the 41st transfer never completes
/// fault_after = 40    the 41st transfer completes with a stall status
/// ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::TransportError;
use crate::integrity::BinaryFormat;
use crate::protocol::{DEFAULT_PACKET_SIZE, PACKET_STATUS_LEN};
use crate::transport::{
    Completion, Direction, PeripheralMode, TransferRequest, TransferStatus, Transport, WaitError,
};

/// Status bytes trailing every packet.
const STATUS_TRAILER: [u8; PACKET_STATUS_LEN] = [0x31, 0x60];

const TEXT_FILLER: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const TEXT_FILLER_LEN: usize = 94;
const TEXT_MODULUS: u64 = 100_000;

/// Record stream the simulated peripheral emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPattern {
    /// Little-endian counter records.
    Binary(BinaryFormat),
    /// `"%06u<filler>%06u\n"` lines.
    Text,
}

impl Default for SimPattern {
    fn default() -> Self {
        SimPattern::Binary(BinaryFormat::default())
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub packet_size: usize,
    pub pattern: SimPattern,
    /// Silently lose every Nth record.
    pub drop_every: Option<u64>,
    /// Stop completing transfers after this many.
    pub stall_after: Option<u64>,
    /// Fail the transfer after this many with [`TransferStatus::Stall`].
    pub fault_after: Option<u64>,
    /// Pace read completions to this many bytes per second.
    pub rate: Option<u64>,
    /// Completions returned per wait; `None` returns everything pending.
    pub batch: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            pattern: SimPattern::default(),
            drop_every: None,
            stall_after: None,
            fault_after: None,
            rate: None,
            batch: None,
        }
    }
}

/// Endless record generator with a read cursor into the current record.
struct RecordStream {
    pattern: SimPattern,
    drop_every: Option<u64>,
    index: u64,
    record: Vec<u8>,
    pos: usize,
}

impl RecordStream {
    fn new(pattern: SimPattern, drop_every: Option<u64>) -> Self {
        let mut stream = Self {
            pattern,
            drop_every,
            index: 0,
            record: Vec::new(),
            pos: 0,
        };
        stream.render();
        stream
    }

    fn render(&mut self) {
        self.record.clear();
        self.pos = 0;
        match self.pattern {
            SimPattern::Binary(format) => {
                let counter = (self.index as u32).wrapping_mul(format.stride);
                self.record.extend_from_slice(&counter.to_le_bytes());
                self.record.resize(format.record_size, (self.index & 0xFF) as u8);
            }
            SimPattern::Text => {
                let n = self.index % TEXT_MODULUS;
                let filler = TEXT_FILLER.iter().cycle().skip((n % 26) as usize);
                self.record.extend_from_slice(format!("{:06}", n).as_bytes());
                self.record.extend(filler.take(TEXT_FILLER_LEN));
                self.record
                    .extend_from_slice(format!("{:06}\n", (n + 1) % TEXT_MODULUS).as_bytes());
            }
        }
    }

    fn advance(&mut self) {
        self.index += 1;
        if let Some(n) = self.drop_every {
            if n > 0 && (self.index + 1) % n == 0 {
                self.index += 1;
            }
        }
        self.render();
    }

    fn fill(&mut self, mut out: &mut [u8]) {
        while !out.is_empty() {
            if self.pos == self.record.len() {
                self.advance();
            }
            let n = (self.record.len() - self.pos).min(out.len());
            out[..n].copy_from_slice(&self.record[self.pos..self.pos + n]);
            self.pos += n;
            out = &mut out[n..];
        }
    }
}

pub struct SimulatedFifo {
    config: SimConfig,
    mode: PeripheralMode,
    records: RecordStream,
    queue: VecDeque<TransferRequest>,
    cancelled: Vec<TransferRequest>,
    completed: u64,
    bytes_moved: u64,
    written: Vec<u8>,
    keep_writes: bool,
    modes: Vec<PeripheralMode>,
    flushes: usize,
    started: Option<Instant>,
}

impl SimulatedFifo {
    /// # Panics
    /// Panics if `packet_size` leaves no room for payload.
    pub fn new(config: SimConfig) -> Self {
        assert!(config.packet_size > PACKET_STATUS_LEN);
        Self {
            records: RecordStream::new(config.pattern, config.drop_every),
            config,
            mode: PeripheralMode::Reset,
            queue: VecDeque::new(),
            cancelled: Vec::new(),
            completed: 0,
            bytes_moved: 0,
            written: Vec::new(),
            keep_writes: false,
            modes: Vec::new(),
            flushes: 0,
            started: None,
        }
    }

    /// Keep every byte written by the host for inspection.
    pub fn keep_writes(mut self) -> Self {
        self.keep_writes = true;
        self
    }

    pub fn mode(&self) -> PeripheralMode {
        self.mode
    }

    /// Every mode the host has set, in order.
    pub fn mode_history(&self) -> &[PeripheralMode] {
        &self.modes
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Transfers currently owned by the peripheral.
    pub fn pending(&self) -> usize {
        self.queue.len() + self.cancelled.len()
    }

    /// Bytes received from the host; empty unless [`keep_writes`](Self::keep_writes).
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    fn frame(&mut self, buffer: &mut [u8]) {
        let payload = self.config.packet_size - PACKET_STATUS_LEN;
        for packet in buffer.chunks_mut(self.config.packet_size) {
            let split = packet.len().min(payload);
            let (data, status) = packet.split_at_mut(split);
            self.records.fill(data);
            status.copy_from_slice(&STATUS_TRAILER[..status.len()]);
        }
    }

    /// Sleep until the configured rate allows `bytes_moved` to have been moved.
    fn pace(&mut self, timeout: Duration) {
        let (Some(rate), Some(started)) = (self.config.rate, self.started) else {
            return;
        };
        if rate == 0 {
            return;
        }
        let due = started + Duration::from_secs_f64(self.bytes_moved as f64 / rate as f64);
        let now = Instant::now();
        if due > now {
            std::thread::sleep((due - now).min(timeout));
        }
    }

    fn complete(&mut self, mut request: TransferRequest) -> Completion {
        self.completed += 1;
        if self.config.fault_after.is_some_and(|n| self.completed > n) {
            return Completion {
                slot: request.slot,
                buffer: request.buffer,
                actual_length: 0,
                status: TransferStatus::Stall,
            };
        }

        let length = request.length;
        match request.direction {
            Direction::Read => self.frame(&mut request.buffer[..length]),
            Direction::Write if self.keep_writes => {
                self.written.extend_from_slice(&request.buffer[..length]);
            }
            Direction::Write => {}
        }
        self.bytes_moved += length as u64;

        Completion {
            slot: request.slot,
            buffer: request.buffer,
            actual_length: length,
            status: TransferStatus::Completed,
        }
    }
}

impl Transport for SimulatedFifo {
    fn packet_size(&self) -> usize {
        self.config.packet_size
    }

    fn set_mode(&mut self, mode: PeripheralMode) -> Result<(), TransportError> {
        self.modes.push(mode);
        self.mode = mode;
        if mode == PeripheralMode::SyncFifo && self.started.is_none() {
            self.started = Some(Instant::now());
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.flushes += 1;
        Ok(())
    }

    fn submit(&mut self, request: TransferRequest) -> Result<(), TransportError> {
        if request.length > request.buffer.len() {
            return Err(TransportError::Other(format!(
                "transfer length {} exceeds buffer of {} bytes",
                request.length,
                request.buffer.len()
            )));
        }
        self.queue.push_back(request);
        Ok(())
    }

    fn wait_completions(
        &mut self,
        timeout: Duration,
        out: &mut Vec<Completion>,
    ) -> Result<(), WaitError> {
        if !self.cancelled.is_empty() {
            out.extend(self.cancelled.drain(..).map(|request| Completion {
                slot: request.slot,
                buffer: request.buffer,
                actual_length: 0,
                status: TransferStatus::Cancelled,
            }));
            return Ok(());
        }
        if self.mode != PeripheralMode::SyncFifo {
            return Ok(());
        }

        self.pace(timeout);
        let batch = self.config.batch.unwrap_or(usize::MAX);
        for _ in 0..batch {
            if self.config.stall_after.is_some_and(|n| self.completed >= n) {
                break;
            }
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            out.push(self.complete(request));
        }
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.cancelled.extend(self.queue.drain(..));
    }
}
