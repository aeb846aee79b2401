//! End-to-end sessions against the simulated peripheral.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use fifocap_engine::{
    Checker, Direction, Flow, NullLogger, PeripheralMode, RecordFormat, SequenceCheck, SimConfig,
    SimPattern, SimulatedFifo, StreamConfig, StreamEngine, StreamError, StreamEvent, Termination,
    TransferStatus, TransportError, check_dump,
};

fn config(transfer_count: usize) -> StreamConfig {
    StreamConfig {
        transfer_count,
        packets_per_transfer: 8,
        ..Default::default()
    }
}

/// Capture `limit` payload bytes into a dump file while checking them inline.
fn capture_to_dump(sim: SimConfig, format: RecordFormat, limit: u64) -> (Checker, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");
    let mut out = BufWriter::new(File::create(&path).unwrap());
    let mut checker = Checker::new(format);
    let mut written = 0u64;

    let mut engine = StreamEngine::new(SimulatedFifo::new(sim), config(16))
        .with_logger(Arc::new(NullLogger));
    let mut consumer = |event: StreamEvent<'_>| match event {
        StreamEvent::Payload(data) => {
            if written >= limit {
                return Flow::Stop;
            }
            out.write_all(data).unwrap();
            checker.feed(data);
            written += data.len() as u64;
            Flow::Continue
        }
        _ => Flow::Continue,
    };
    let report = engine.run(&mut consumer).unwrap();
    assert_eq!(report.termination, Termination::Stopped);
    assert_eq!(report.slots_released, 16);
    assert_eq!(engine.transport().pending(), 0);

    out.flush().unwrap();
    drop(out);
    (checker, std::fs::read(&path).unwrap())
}

#[test]
fn test_capture_is_clean_and_replays_identically() {
    let format = RecordFormat::default();
    let (mut online, dump) = capture_to_dump(SimConfig::default(), format, 1 << 20);
    assert!(dump.len() >= 1 << 20);

    let online = online.finish().clone();
    let offline = check_dump(&dump[..], format).unwrap();
    assert_eq!(online, offline);
    assert_eq!(offline.errors, 0);
}

#[test]
fn test_dropped_records_found_online_and_offline() {
    let format = RecordFormat::default();
    let sim = SimConfig {
        drop_every: Some(50),
        ..Default::default()
    };
    let (mut online, dump) = capture_to_dump(sim, format, 256 * 1024);

    let online = online.finish().clone();
    let offline = check_dump(&dump[..], format).unwrap();
    assert_eq!(online, offline);
    assert!(offline.errors > 0);
    assert!(!offline.diagnostics.is_empty());
}

#[test]
fn test_text_stream_has_no_skips() {
    let sim = SimConfig {
        pattern: SimPattern::Text,
        ..Default::default()
    };
    let (mut online, dump) = capture_to_dump(sim, RecordFormat::Text, 256 * 1024);

    let online = online.finish().clone();
    let offline = check_dump(&dump[..], RecordFormat::Text).unwrap();
    assert_eq!(online, offline);
    assert_eq!(offline.skips, 0);
    assert_eq!(offline.mismatches, 0);
}

#[test]
fn test_stalled_peripheral_ends_gracefully() {
    let sim = SimConfig {
        stall_after: Some(40),
        ..Default::default()
    };
    let mut engine = StreamEngine::new(SimulatedFifo::new(sim), config(8));
    let mut consumer = |_: StreamEvent<'_>| Flow::Continue;

    let err = engine.run(&mut consumer).unwrap_err();
    assert!(err.is_graceful());
    assert_eq!(engine.transport().completed(), 40);
    assert_eq!(engine.transport().pending(), 0);
    assert_eq!(
        engine.transport().mode_history(),
        &[PeripheralMode::Reset, PeripheralMode::SyncFifo]
    );
}

#[test]
fn test_faulted_transfer_is_fatal() {
    let sim = SimConfig {
        fault_after: Some(10),
        ..Default::default()
    };
    let mut engine = StreamEngine::new(SimulatedFifo::new(sim), config(8));
    let mut consumer = |_: StreamEvent<'_>| Flow::Continue;

    let err = engine.run(&mut consumer).unwrap_err();
    assert!(matches!(
        err,
        StreamError::Transport(TransportError::Status(TransferStatus::Stall))
    ));
    assert_eq!(engine.transport().pending(), 0);
}

#[test]
fn test_cancel_flag_from_consumer_side() {
    let mut engine = StreamEngine::new(SimulatedFifo::new(SimConfig::default()), config(8));
    let flag = engine.cancel_flag();
    let mut payloads = 0;
    let mut consumer = |event: StreamEvent<'_>| {
        if let StreamEvent::Payload(_) = event {
            payloads += 1;
            if payloads == 100 {
                flag.cancel();
            }
        }
        Flow::Continue
    };

    let report = engine.run(&mut consumer).unwrap();
    assert_eq!(report.termination, Termination::Cancelled);
    assert_eq!(payloads, 100);
    assert_eq!(report.slots_released, 8);
}

#[test]
fn test_write_session_streams_source_bytes() {
    let source: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let mut cursor = 0usize;
    let mut fills = 0;

    let sim = SimulatedFifo::new(SimConfig::default()).keep_writes();
    let mut config = config(4);
    config.direction = Direction::Write;
    let mut engine = StreamEngine::new(sim, config);

    let mut consumer = |event: StreamEvent<'_>| match event {
        StreamEvent::Fill(buf) => {
            fills += 1;
            if fills > 12 {
                return Flow::Stop;
            }
            for byte in buf.iter_mut() {
                *byte = source[cursor];
                // Rewind at the end of the source.
                cursor = (cursor + 1) % source.len();
            }
            Flow::Continue
        }
        StreamEvent::Payload(_) => Flow::Stop,
        StreamEvent::Progress(_) => Flow::Continue,
    };
    let report = engine.run(&mut consumer).unwrap();

    assert_eq!(report.termination, Termination::Stopped);
    let written = engine.transport().written();
    assert_eq!(written.len(), 12 * 4096);
    let expected: Vec<u8> = source.iter().copied().cycle().take(written.len()).collect();
    assert_eq!(written, &expected[..]);
}
