/// Streaming engine: one thread, one transport, a pool of perpetually
/// resubmitted transfers.
///
/// ```text
/// Idle -> Configuring -> Priming -> Streaming -> Draining -> Terminated
///              |                                               ^
///              +---------------- (configuration failed) ------+
/// ```
///
/// Every completion is handled on the engine thread right after the
/// transport's bounded wait returns. The cancel flag is the only state
/// shared with another context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::consumer::{CancelFlag, Flow, StreamConsumer, StreamEvent};
use crate::error::{StreamError, TransportError};
use crate::logging::{SessionEvent, SessionLog, SessionLogger};
use crate::pool::TransferPool;
use crate::progress::{Clock, ProgressSnapshot, ProgressTracker, SystemClock};
use crate::protocol::{
    DEFAULT_PACKETS_PER_TRANSFER, DEFAULT_TRANSFER_COUNT, DEFAULT_WAIT_TIMEOUT, PACKET_STATUS_LEN,
    PROGRESS_INTERVAL, demux,
};
use crate::transport::{
    Completion, Direction, PeripheralMode, TransferStatus, Transport, WaitError,
};

const COMPONENT: &str = "engine";

/// Position in the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Configuring,
    Priming,
    Streaming,
    Draining,
    Terminated,
}

/// Session geometry and timing.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub direction: Direction,
    pub packets_per_transfer: usize,
    pub transfer_count: usize,
    /// Bounded wait per loop iteration; also the liveness window.
    pub wait_timeout: Duration,
    pub progress_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Read,
            packets_per_transfer: DEFAULT_PACKETS_PER_TRANSFER,
            transfer_count: DEFAULT_TRANSFER_COUNT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The consumer released every slot.
    Stopped,
    /// The cancel flag was raised.
    Cancelled,
}

/// Statistics read out at the end of a session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub termination: Termination,
    pub total_bytes: u64,
    /// Successfully completed transfers.
    pub transfers: u64,
    pub slots_released: usize,
    pub elapsed: Duration,
    pub progress: ProgressSnapshot,
}

/// Mutable state of one streaming session.
struct StreamState {
    pool: TransferPool,
    tracker: ProgressTracker,
    packet_size: usize,
    /// Completions since the last liveness check.
    activity: usize,
    transfers: u64,
    stop_all: bool,
    fatal: Option<StreamError>,
}

impl StreamState {
    fn record_fatal(&mut self, err: StreamError) {
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }
}

pub struct StreamEngine<T: Transport> {
    transport: T,
    config: StreamConfig,
    cancel: CancelFlag,
    clock: Box<dyn Clock>,
    logger: Option<Arc<dyn SessionLogger>>,
    state: EngineState,
}

impl<T: Transport> StreamEngine<T> {
    pub fn new(transport: T, config: StreamConfig) -> Self {
        Self {
            transport,
            config,
            cancel: CancelFlag::new(),
            clock: Box::new(SystemClock),
            logger: None,
            state: EngineState::Idle,
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn SessionLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Run one session to completion. Blocks until the consumer stops, the
    /// cancel flag is raised, the transport stalls, or a fatal error occurs.
    pub fn run<C>(&mut self, consumer: &mut C) -> Result<SessionReport, StreamError>
    where
        C: StreamConsumer + ?Sized,
    {
        let started = self.clock.now();

        self.transition(EngineState::Configuring);
        let packet_size = match self.configure() {
            Ok(packet_size) => packet_size,
            Err(err) => {
                self.log(SessionEvent::Error {
                    message: err.to_string(),
                });
                self.transition(EngineState::Terminated);
                return Err(err);
            }
        };

        self.transition(EngineState::Priming);
        let pool = match TransferPool::allocate(
            self.config.direction,
            packet_size,
            self.config.packets_per_transfer,
            self.config.transfer_count,
        ) {
            Ok(pool) => pool,
            Err(err) => {
                self.log(SessionEvent::Error {
                    message: err.to_string(),
                });
                self.transition(EngineState::Terminated);
                return Err(err);
            }
        };

        let mut st = StreamState {
            pool,
            tracker: ProgressTracker::with_interval(started, self.config.progress_interval),
            packet_size,
            activity: 0,
            transfers: 0,
            stop_all: false,
            fatal: None,
        };

        let cancel = self.cancel.clone();
        let primed = st.pool.prime(&mut self.transport, |buf| {
            dispatch(&mut *consumer, &cancel, StreamEvent::Fill(buf))
        });
        if let Err(err) = primed {
            st.record_fatal(err);
            return self.finish(st, started);
        }
        self.log(SessionEvent::Primed {
            direction: self.config.direction,
            slots: st.pool.in_flight(),
            buffer_len: st.pool.buffer_len(),
        });

        // Only now may the peripheral start producing; every slot is queued.
        if let Err(source) = self.transport.set_mode(PeripheralMode::SyncFifo) {
            st.record_fatal(StreamError::Configuration {
                context: "enter synchronous FIFO mode",
                source,
            });
            return self.finish(st, started);
        }

        self.transition(EngineState::Streaming);
        st.tracker = ProgressTracker::with_interval(self.clock.now(), self.config.progress_interval);
        self.stream(&mut st, consumer);
        self.finish(st, started)
    }

    /// Reset and purge the peripheral, then return its packet size.
    fn configure(&mut self) -> Result<usize, StreamError> {
        self.transport
            .set_mode(PeripheralMode::Reset)
            .map_err(|source| StreamError::Configuration {
                context: "reset peripheral mode",
                source,
            })?;
        self.transport
            .flush()
            .map_err(|source| StreamError::Configuration {
                context: "purge buffers",
                source,
            })?;

        let packet_size = self.transport.packet_size();
        if packet_size <= PACKET_STATUS_LEN {
            return Err(StreamError::Configuration {
                context: "packet size",
                source: TransportError::Other(format!(
                    "{} byte packets leave no room for payload",
                    packet_size
                )),
            });
        }
        Ok(packet_size)
    }

    fn stream<C>(&mut self, st: &mut StreamState, consumer: &mut C)
    where
        C: StreamConsumer + ?Sized,
    {
        let mut completions = Vec::with_capacity(st.pool.capacity());

        loop {
            if self.cancel.is_cancelled() {
                st.stop_all = true;
            }

            completions.clear();
            if let Err(err) = self.wait(&mut completions) {
                st.record_fatal(err);
            }
            for completion in completions.drain(..) {
                self.handle_completion(st, consumer, completion);
            }

            if st.fatal.is_some() || st.pool.live() == 0 {
                return;
            }

            if st.activity == 0 {
                let timeout_ms = self.config.wait_timeout.as_millis() as u64;
                self.log(SessionEvent::Stalled { timeout_ms });
                st.record_fatal(StreamError::LivenessTimeout { timeout_ms });
                return;
            }
            st.activity = 0;

            let now = self.clock.now();
            if let Some(snapshot) = st.tracker.poll(now) {
                let snapshot = *snapshot;
                self.log(SessionEvent::Progress {
                    total_bytes: snapshot.total_bytes,
                    current_rate: snapshot.current_rate,
                });
                if dispatch(consumer, &self.cancel, StreamEvent::Progress(&snapshot)).is_stop() {
                    st.stop_all = true;
                }
                st.tracker.roll_forward();
            }
        }
    }

    /// Bounded wait, retried once if a signal interrupts it.
    fn wait(&mut self, out: &mut Vec<Completion>) -> Result<(), StreamError> {
        let timeout = self.config.wait_timeout;
        match self.transport.wait_completions(timeout, out) {
            Ok(()) => Ok(()),
            Err(WaitError::Failed(err)) => Err(StreamError::Transport(err)),
            Err(WaitError::Interrupted) => {
                self.log(SessionEvent::WaitInterrupted);
                match self.transport.wait_completions(timeout, out) {
                    Ok(()) => Ok(()),
                    Err(WaitError::Interrupted) => {
                        Err(StreamError::Transport(TransportError::Interrupted))
                    }
                    Err(WaitError::Failed(err)) => Err(StreamError::Transport(err)),
                }
            }
        }
    }

    fn handle_completion<C>(&mut self, st: &mut StreamState, consumer: &mut C, completion: Completion)
    where
        C: StreamConsumer + ?Sized,
    {
        let Completion {
            slot,
            mut buffer,
            actual_length,
            status,
        } = completion;

        st.activity += 1;
        if let Err(err) = st.pool.complete(slot) {
            st.record_fatal(err);
            return;
        }

        if status != TransferStatus::Completed {
            self.log(SessionEvent::TransferFailed {
                slot,
                status: status.to_string(),
            });
            st.pool.release(slot);
            st.record_fatal(StreamError::Transport(TransportError::Status(status)));
            return;
        }
        st.transfers += 1;

        if st.fatal.is_some() || st.stop_all {
            self.release(st, slot);
            return;
        }

        let flow = match st.pool.direction() {
            Direction::Read => {
                let mut flow = Flow::Continue;
                for payload in demux(&buffer, actual_length, st.packet_size).packets() {
                    if payload.is_empty() {
                        continue;
                    }
                    st.tracker.record_bytes(payload.len());
                    flow = dispatch(consumer, &self.cancel, StreamEvent::Payload(payload));
                    if flow.is_stop() {
                        break;
                    }
                }
                flow
            }
            Direction::Write => {
                st.tracker.record_bytes(actual_length);
                buffer.resize(st.pool.buffer_len(), 0);
                dispatch(consumer, &self.cancel, StreamEvent::Fill(&mut buffer))
            }
        };

        if flow.is_stop() {
            self.release(st, slot);
            return;
        }

        if let Err(err) = st.pool.resubmit(&mut self.transport, slot, buffer) {
            self.log(SessionEvent::Error {
                message: err.to_string(),
            });
            st.record_fatal(err);
        }
    }

    fn release(&self, st: &mut StreamState, slot: usize) {
        st.pool.release(slot);
        self.log(SessionEvent::SlotReleased {
            slot,
            live: st.pool.live(),
        });
    }

    /// Cancel and collect everything still in flight, then settle the result.
    fn finish(&mut self, mut st: StreamState, started: Instant) -> Result<SessionReport, StreamError> {
        self.transition(EngineState::Draining);
        self.drain(&mut st);
        self.transition(EngineState::Terminated);

        let cancelled = self.cancel.is_cancelled();
        let elapsed = self.clock.now().saturating_duration_since(started);
        self.log(SessionEvent::Finished {
            total_bytes: st.tracker.total_bytes(),
            transfers: st.transfers,
            elapsed_ms: elapsed.as_millis() as u64,
        });

        let termination = match st.fatal.take() {
            // A stall after an abort request is just the peripheral going quiet.
            Some(err) if cancelled && err.is_graceful() => Termination::Cancelled,
            Some(err) => {
                self.log(SessionEvent::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }
            None if cancelled => Termination::Cancelled,
            None => Termination::Stopped,
        };

        Ok(SessionReport {
            termination,
            total_bytes: st.tracker.total_bytes(),
            transfers: st.transfers,
            slots_released: st.pool.released(),
            elapsed,
            progress: *st.tracker.snapshot(),
        })
    }

    fn drain(&mut self, st: &mut StreamState) {
        st.pool.release_idle();
        if st.pool.in_flight() == 0 {
            self.log(SessionEvent::Drained {
                collected: 0,
                abandoned: 0,
            });
            return;
        }

        self.transport.cancel_all();

        let mut collected = 0;
        let mut interrupted = false;
        let mut completions = Vec::with_capacity(st.pool.in_flight());
        while st.pool.in_flight() > 0 {
            completions.clear();
            let waited = self
                .transport
                .wait_completions(self.config.wait_timeout, &mut completions);

            let before = collected;
            for completion in completions.drain(..) {
                // Buffers are dropped here; nothing is delivered while draining.
                if st.pool.complete(completion.slot).is_ok() {
                    st.pool.release(completion.slot);
                    collected += 1;
                }
            }

            match waited {
                Err(WaitError::Interrupted) if !interrupted => {
                    interrupted = true;
                    continue;
                }
                Err(_) => break,
                Ok(()) => interrupted = false,
            }
            if collected == before {
                break;
            }
        }

        let abandoned = st.pool.in_flight();
        st.pool.abandon_in_flight();
        self.log(SessionEvent::Drained {
            collected,
            abandoned,
        });
    }

    fn transition(&mut self, to: EngineState) {
        let from = self.state;
        self.state = to;
        self.log(SessionEvent::StateChanged { from, to });
    }

    fn log(&self, event: SessionEvent) {
        if let Some(ref logger) = self.logger {
            logger.log(SessionLog {
                component: COMPONENT,
                event,
            });
        }
    }
}

/// Deliver one event, converting a raised cancel flag into [`Flow::Stop`].
fn dispatch<C>(consumer: &mut C, cancel: &CancelFlag, event: StreamEvent<'_>) -> Flow
where
    C: StreamConsumer + ?Sized,
{
    if cancel.is_cancelled() {
        return Flow::Stop;
    }
    consumer.on_event(event)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;
    use crate::transport::TransferRequest;

    const PACKET: usize = 8;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        SetMode(PeripheralMode),
        Flush,
        Submit(usize),
        Wait,
        CancelAll,
    }

    struct ManualClock(Rc<Cell<Instant>>);

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    /// Completes the oldest pending transfers, a fixed number per wait.
    struct ScriptedTransport {
        calls: Vec<Call>,
        pending: VecDeque<TransferRequest>,
        cancelled: Vec<TransferRequest>,
        clock: Rc<Cell<Instant>>,
        step: Duration,
        per_wait: usize,
        stall_after: Option<usize>,
        fault_at_wait: Option<usize>,
        interrupts: VecDeque<bool>,
        fail_reset: bool,
        fail_submit_at: Option<usize>,
        packet_size: usize,
        waits: usize,
        submits: usize,
        written: Vec<u8>,
    }

    impl ScriptedTransport {
        fn new(per_wait: usize) -> Self {
            Self {
                calls: Vec::new(),
                pending: VecDeque::new(),
                cancelled: Vec::new(),
                clock: Rc::new(Cell::new(Instant::now())),
                step: Duration::from_millis(10),
                per_wait,
                stall_after: None,
                fault_at_wait: None,
                interrupts: VecDeque::new(),
                fail_reset: false,
                fail_submit_at: None,
                packet_size: PACKET,
                waits: 0,
                submits: 0,
                written: Vec::new(),
            }
        }

        fn count(&self, call: &Call) -> usize {
            self.calls.iter().filter(|c| *c == call).count()
        }
    }

    impl Transport for ScriptedTransport {
        fn packet_size(&self) -> usize {
            self.packet_size
        }

        fn set_mode(&mut self, mode: PeripheralMode) -> Result<(), TransportError> {
            self.calls.push(Call::SetMode(mode));
            if self.fail_reset && mode == PeripheralMode::Reset {
                return Err(TransportError::Other("pipe error".into()));
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), TransportError> {
            self.calls.push(Call::Flush);
            Ok(())
        }

        fn submit(&mut self, request: TransferRequest) -> Result<(), TransportError> {
            if self.fail_submit_at == Some(self.submits) {
                return Err(TransportError::Other("no memory".into()));
            }
            self.submits += 1;
            self.calls.push(Call::Submit(request.slot));
            self.pending.push_back(request);
            Ok(())
        }

        fn wait_completions(
            &mut self,
            _timeout: Duration,
            out: &mut Vec<Completion>,
        ) -> Result<(), WaitError> {
            self.calls.push(Call::Wait);
            self.clock.set(self.clock.get() + self.step);

            if !self.cancelled.is_empty() {
                for request in self.cancelled.drain(..) {
                    out.push(Completion {
                        slot: request.slot,
                        buffer: request.buffer,
                        actual_length: 0,
                        status: TransferStatus::Cancelled,
                    });
                }
                return Ok(());
            }
            if self.interrupts.pop_front() == Some(true) {
                return Err(WaitError::Interrupted);
            }

            self.waits += 1;
            if self.stall_after.is_some_and(|n| self.waits > n) {
                return Ok(());
            }
            for _ in 0..self.per_wait {
                let Some(mut request) = self.pending.pop_front() else {
                    break;
                };
                self.written.extend_from_slice(&request.buffer[..request.length]);
                request.buffer.fill(self.waits as u8);
                let status = if self.fault_at_wait == Some(self.waits) {
                    TransferStatus::Stall
                } else {
                    TransferStatus::Completed
                };
                out.push(Completion {
                    slot: request.slot,
                    actual_length: request.length,
                    buffer: request.buffer,
                    status,
                });
            }
            Ok(())
        }

        fn cancel_all(&mut self) {
            self.calls.push(Call::CancelAll);
            self.cancelled.extend(self.pending.drain(..));
        }
    }

    fn config(slots: usize, packets: usize) -> StreamConfig {
        StreamConfig {
            transfer_count: slots,
            packets_per_transfer: packets,
            ..Default::default()
        }
    }

    fn build(transport: ScriptedTransport, config: StreamConfig) -> StreamEngine<ScriptedTransport> {
        let clock = ManualClock(transport.clock.clone());
        StreamEngine::new(transport, config).with_clock(Box::new(clock))
    }

    #[test]
    fn test_primes_every_slot_before_streaming_mode() {
        let mut engine = build(ScriptedTransport::new(4), config(8, 1));
        let mut consumer = |_: StreamEvent<'_>| Flow::Stop;
        let report = engine.run(&mut consumer).unwrap();

        assert_eq!(report.termination, Termination::Stopped);
        assert_eq!(report.slots_released, 8);
        assert_eq!(engine.state(), EngineState::Terminated);

        let calls = &engine.transport().calls;
        assert_eq!(calls[0], Call::SetMode(PeripheralMode::Reset));
        assert_eq!(calls[1], Call::Flush);
        let last_submit = calls.iter().rposition(|c| matches!(c, Call::Submit(_))).unwrap();
        let streaming = calls
            .iter()
            .position(|c| *c == Call::SetMode(PeripheralMode::SyncFifo))
            .unwrap();
        assert_eq!(last_submit, 9);
        assert!(streaming > last_submit);
        // Stopped slots are never resubmitted.
        assert_eq!(engine.transport().count(&Call::Wait), 2);
        assert_eq!(engine.transport().submits, 8);
    }

    #[test]
    fn test_stall_drains_after_one_interval() {
        let mut transport = ScriptedTransport::new(1);
        transport.stall_after = Some(0);
        let mut engine = build(transport, config(4, 1));
        let mut consumer = |_: StreamEvent<'_>| Flow::Continue;

        let err = engine.run(&mut consumer).unwrap_err();
        assert!(matches!(err, StreamError::LivenessTimeout { timeout_ms: 5000 }));
        assert!(err.is_graceful());

        let calls = &engine.transport().calls;
        let streaming = calls
            .iter()
            .position(|c| *c == Call::SetMode(PeripheralMode::SyncFifo))
            .unwrap();
        assert_eq!(calls[streaming + 1], Call::Wait);
        assert_eq!(calls[streaming + 2], Call::CancelAll);
        assert_eq!(engine.state(), EngineState::Terminated);
    }

    #[test]
    fn test_resubmits_until_consumer_stops() {
        let mut engine = build(ScriptedTransport::new(1), config(2, 2));
        let mut payloads = 0usize;
        let mut consumer = |event: StreamEvent<'_>| {
            if let StreamEvent::Payload(p) = event {
                assert_eq!(p.len(), PACKET - 2);
                payloads += 1;
                if payloads >= 10 {
                    return Flow::Stop;
                }
            }
            Flow::Continue
        };
        let report = engine.run(&mut consumer).unwrap();

        assert_eq!(payloads, 11);
        assert_eq!(report.termination, Termination::Stopped);
        assert_eq!(report.total_bytes, 11 * 6);
        assert_eq!(report.transfers, 6);
        assert_eq!(engine.transport().submits, 6);
    }

    #[test]
    fn test_progress_cadence_in_simulated_time() {
        let mut transport = ScriptedTransport::new(1);
        transport.step = Duration::from_millis(300);
        let mut engine = build(transport, config(4, 2));

        let mut snapshots: Vec<ProgressSnapshot> = Vec::new();
        let mut consumer = |event: StreamEvent<'_>| match event {
            StreamEvent::Progress(s) => {
                snapshots.push(*s);
                if snapshots.len() == 3 { Flow::Stop } else { Flow::Continue }
            }
            _ => Flow::Continue,
        };
        let report = engine.run(&mut consumer).unwrap();
        assert_eq!(report.termination, Termination::Stopped);

        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].current_rate, None);
        for pair in snapshots.windows(2) {
            let gap = pair[1].current_time - pair[0].current_time;
            assert!(gap >= Duration::from_secs(1));
        }
        for s in &snapshots[1..] {
            let db = (s.total_bytes - s.previous_total_bytes) as f64;
            let dt = (s.current_time - s.previous_time).as_secs_f64();
            assert_eq!(s.current_rate, Some(db / dt));
            assert_eq!(s.total_rate, Some(s.total_bytes as f64 / s.total_elapsed));
        }
    }

    #[test]
    fn test_cancel_flag_stops_cleanly() {
        let mut engine = build(ScriptedTransport::new(2), config(4, 2));
        let flag = engine.cancel_flag();
        let mut delivered = 0;
        let mut consumer = |event: StreamEvent<'_>| {
            if let StreamEvent::Payload(_) = event {
                delivered += 1;
                flag.cancel();
            }
            Flow::Continue
        };
        let report = engine.run(&mut consumer).unwrap();

        // The flag is observed before the very next dispatch.
        assert_eq!(delivered, 1);
        assert_eq!(report.termination, Termination::Cancelled);
        assert_eq!(report.slots_released, 4);
    }

    #[test]
    fn test_cancelled_stall_is_not_an_error() {
        let mut transport = ScriptedTransport::new(1);
        transport.stall_after = Some(1);
        let mut engine = build(transport, config(4, 1));
        let flag = engine.cancel_flag();
        let mut consumer = |_: StreamEvent<'_>| {
            flag.cancel();
            Flow::Continue
        };
        let report = engine.run(&mut consumer).unwrap();
        assert_eq!(report.termination, Termination::Cancelled);
        assert_eq!(engine.transport().count(&Call::CancelAll), 1);
    }

    #[test]
    fn test_transport_fault_is_fatal() {
        let mut transport = ScriptedTransport::new(1);
        transport.fault_at_wait = Some(3);
        let mut engine = build(transport, config(4, 1));
        let mut consumer = |_: StreamEvent<'_>| Flow::Continue;

        let err = engine.run(&mut consumer).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Transport(TransportError::Status(TransferStatus::Stall))
        ));
        assert!(!err.is_graceful());
        assert_eq!(engine.transport().count(&Call::CancelAll), 1);
        assert!(engine.transport().cancelled.is_empty());
    }

    #[test]
    fn test_interrupted_wait_retried_once() {
        let mut transport = ScriptedTransport::new(1);
        transport.interrupts = VecDeque::from(vec![true, false]);
        let mut engine = build(transport, config(2, 1));
        let mut consumer = |_: StreamEvent<'_>| Flow::Stop;
        let report = engine.run(&mut consumer).unwrap();
        assert_eq!(report.termination, Termination::Stopped);

        let mut transport = ScriptedTransport::new(1);
        transport.interrupts = VecDeque::from(vec![true, true]);
        let mut engine = build(transport, config(2, 1));
        let err = engine.run(&mut consumer).unwrap_err();
        assert!(matches!(err, StreamError::Transport(TransportError::Interrupted)));
    }

    #[test]
    fn test_configuration_failure_skips_priming() {
        let mut transport = ScriptedTransport::new(1);
        transport.fail_reset = true;
        let mut engine = build(transport, config(4, 1));
        let mut consumer = |_: StreamEvent<'_>| Flow::Continue;

        let err = engine.run(&mut consumer).unwrap_err();
        assert!(matches!(err, StreamError::Configuration { .. }));
        assert_eq!(engine.transport().calls, vec![Call::SetMode(PeripheralMode::Reset)]);
        assert_eq!(engine.state(), EngineState::Terminated);
    }

    #[test]
    fn test_packet_size_without_payload_rejected() {
        for size in [0, 1, 2] {
            let mut transport = ScriptedTransport::new(1);
            transport.packet_size = size;
            let mut engine = build(transport, config(4, 1));
            let mut consumer = |_: StreamEvent<'_>| Flow::Continue;

            let err = engine.run(&mut consumer).unwrap_err();
            assert!(
                matches!(err, StreamError::Configuration { context: "packet size", .. }),
                "packet size {}",
                size
            );
            assert_eq!(engine.transport().count(&Call::SetMode(PeripheralMode::SyncFifo)), 0);
            assert!(engine.transport().pending.is_empty());
            assert_eq!(engine.state(), EngineState::Terminated);
        }
    }

    #[test]
    fn test_submission_failure_drains_partial_pool() {
        let mut transport = ScriptedTransport::new(1);
        transport.fail_submit_at = Some(3);
        let mut engine = build(transport, config(8, 1));
        let mut consumer = |_: StreamEvent<'_>| Flow::Continue;

        let err = engine.run(&mut consumer).unwrap_err();
        assert!(matches!(err, StreamError::Submission { slot: 3, .. }));
        let calls = &engine.transport().calls;
        assert!(!calls.contains(&Call::SetMode(PeripheralMode::SyncFifo)));
        assert_eq!(engine.transport().count(&Call::CancelAll), 1);
        assert!(engine.transport().pending.is_empty());
    }

    #[test]
    fn test_write_direction_fills_before_submission() {
        let mut config = config(2, 1);
        config.direction = Direction::Write;
        let mut engine = build(ScriptedTransport::new(1), config);

        let mut fills = 0u8;
        let mut consumer = |event: StreamEvent<'_>| match event {
            StreamEvent::Fill(buf) => {
                fills += 1;
                buf.fill(fills);
                if fills > 4 { Flow::Stop } else { Flow::Continue }
            }
            StreamEvent::Payload(_) => panic!("no payloads on a write session"),
            StreamEvent::Progress(_) => Flow::Continue,
        };
        let report = engine.run(&mut consumer).unwrap();

        assert_eq!(report.termination, Termination::Stopped);
        // Two priming fills plus one refill per completion.
        assert_eq!(fills, 6);
        assert_eq!(report.transfers, 4);
        assert_eq!(report.total_bytes, 4 * PACKET as u64);
        let written = &engine.transport().written;
        assert_eq!(&written[..PACKET], &[1u8; PACKET]);
        assert_eq!(&written[PACKET..2 * PACKET], &[2u8; PACKET]);
        assert_eq!(&written[2 * PACKET..3 * PACKET], &[3u8; PACKET]);
    }
}
