/// Capture sessions: the consumer that persists and checks the stream, and
/// the driver that runs one engine session against a transport.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use fifocap_engine::{
    CancelFlag, Checker, Flow, IntegrityReport, PeripheralMode, ProgressSnapshot, SequenceCheck,
    SessionReport, SimulatedFifo, StreamConsumer, StreamEngine, StreamEvent, Termination,
    TracingLogger, Transport,
};

use crate::config::CaptureArgs;

/// Dump file I/O buffer.
const DUMP_BUFFER: usize = 1 << 16;

/// How the dump file is used.
pub enum Dump {
    None,
    /// Received payload is appended.
    Output(BufWriter<File>),
    /// Outgoing buffers are filled from here, rewinding at end of file.
    Input(BufReader<File>),
}

impl Dump {
    pub fn open(args: &CaptureArgs) -> Result<Self> {
        let Some(path) = &args.file else {
            return Ok(Dump::None);
        };
        if args.read_file {
            let file = File::open(path)
                .with_context(|| format!("Can't open input file {}", path.display()))?;
            Ok(Dump::Input(BufReader::with_capacity(DUMP_BUFFER, file)))
        } else {
            let file = File::create(path)
                .with_context(|| format!("Can't create dump file {}", path.display()))?;
            Ok(Dump::Output(BufWriter::with_capacity(DUMP_BUFFER, file)))
        }
    }
}

/// Consumer behind every capture session.
///
/// I/O failures never propagate into the engine; they are logged, kept, and
/// turned into [`Flow::Stop`] so the session drains.
pub struct CaptureSink {
    dump: Dump,
    checker: Option<Checker>,
    failure: Option<io::Error>,
}

impl CaptureSink {
    pub fn new(dump: Dump, checker: Option<Checker>) -> Self {
        Self {
            dump,
            checker,
            failure: None,
        }
    }

    fn on_payload(&mut self, data: &[u8]) -> Flow {
        if self.failure.is_some() {
            return Flow::Stop;
        }
        if let Some(checker) = self.checker.as_mut() {
            checker.feed(data);
        }
        if let Dump::Output(out) = &mut self.dump {
            if let Err(e) = out.write_all(data) {
                error!("Write error: {}", e);
                self.failure = Some(e);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn on_fill(&mut self, buf: &mut [u8]) -> Flow {
        if self.failure.is_some() {
            return Flow::Stop;
        }
        let Dump::Input(input) = &mut self.dump else {
            // Nothing to send; the buffer goes out as it is.
            return Flow::Continue;
        };
        match fill_rewinding(input, buf) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                error!("File read error: {}", e);
                self.failure = Some(e);
                Flow::Stop
            }
        }
    }

    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let errors = self.checker.as_ref().map_or(0, |c| c.report().errors);
        info!("{}", progress_line(snapshot, errors));
    }

    /// Flush the dump and settle the integrity check.
    pub fn finish(mut self) -> Result<Option<IntegrityReport>> {
        if let Dump::Output(out) = &mut self.dump {
            out.flush().context("Can't flush dump file")?;
        }
        if let Some(e) = self.failure.take() {
            return Err(e).context("Dump file I/O failed during capture");
        }
        Ok(self.checker.as_mut().map(|c| c.finish().clone()))
    }
}

impl StreamConsumer for CaptureSink {
    fn on_event(&mut self, event: StreamEvent<'_>) -> Flow {
        match event {
            StreamEvent::Payload(data) => self.on_payload(data),
            StreamEvent::Fill(buf) => self.on_fill(buf),
            StreamEvent::Progress(snapshot) => {
                self.on_progress(snapshot);
                Flow::Continue
            }
        }
    }
}

/// Fill `buf` completely from `input`, starting over at end of file.
fn fill_rewinding<R: Read + Seek>(input: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    let mut rewound = false;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) if rewound => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input file is empty"));
            }
            Ok(0) => {
                input.seek(SeekFrom::Start(0))?;
                rewound = true;
            }
            Ok(n) => {
                filled += n;
                rewound = false;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn kib_rate(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:7.1} kB/s", r / 1024.0),
        None => format!("{:>7} kB/s", "-"),
    }
}

pub fn progress_line(snapshot: &ProgressSnapshot, errors: u64) -> String {
    format!(
        "{:10.2}s total time {:9.3} MiB transferred {} curr rate {} total rate {} errors",
        snapshot.total_elapsed,
        snapshot.total_mib(),
        kib_rate(snapshot.current_rate),
        kib_rate(snapshot.total_rate),
        errors
    )
}

/// Result of a capture that ended without a fatal error.
#[derive(Debug)]
pub struct CaptureOutcome {
    /// `None` when the session ended on the liveness timeout.
    pub session: Option<SessionReport>,
    pub integrity: Option<IntegrityReport>,
}

/// Open the transport named by `args` and run one session on it.
pub fn run(args: &CaptureArgs, cancel: CancelFlag) -> Result<CaptureOutcome> {
    let dump = Dump::open(args)?;
    let checker = args.check.map(|format| Checker::new(format.into()));
    let sink = CaptureSink::new(dump, checker);

    if args.simulate {
        info!("Using simulated peripheral");
        return run_session(SimulatedFifo::new(args.sim_config()), args, sink, cancel);
    }
    open_device(args, sink, cancel)
}

#[cfg(feature = "usb")]
fn open_device(args: &CaptureArgs, sink: CaptureSink, cancel: CancelFlag) -> Result<CaptureOutcome> {
    let transport = crate::usb::FtdiTransport::open(args.device.as_deref(), args.latency_ms)?;
    run_session(transport, args, sink, cancel)
}

#[cfg(not(feature = "usb"))]
fn open_device(_args: &CaptureArgs, _sink: CaptureSink, _cancel: CancelFlag) -> Result<CaptureOutcome> {
    anyhow::bail!("built without USB support; rebuild with `--features usb` or pass --simulate")
}

/// Drive one session, then put the peripheral back into reset mode.
pub fn run_session<T: Transport>(
    transport: T,
    args: &CaptureArgs,
    mut sink: CaptureSink,
    cancel: CancelFlag,
) -> Result<CaptureOutcome> {
    let mut engine = StreamEngine::new(transport, args.stream_config())
        .with_cancel_flag(cancel)
        .with_logger(Arc::new(TracingLogger));

    let result = engine.run(&mut sink);
    info!("Capture ended.");

    if let Err(e) = engine.transport_mut().set_mode(PeripheralMode::Reset) {
        warn!("Can't reset peripheral mode: {}", e);
    }

    let integrity = sink.finish()?;
    let session = match result {
        Ok(report) => Some(report),
        Err(e) if e.is_graceful() => {
            info!("{}, ending session", e);
            None
        }
        Err(e) => return Err(e).context("Streaming session failed"),
    };

    if let Some(report) = &session {
        let how = match report.termination {
            Termination::Stopped => "stopped",
            Termination::Cancelled => "cancelled",
        };
        info!(
            "Session {}: {} bytes in {} transfers, {:.2}s",
            how,
            report.total_bytes,
            report.transfers,
            report.elapsed.as_secs_f64()
        );
    }
    if let Some(report) = &integrity {
        log_integrity(report);
    }

    Ok(CaptureOutcome { session, integrity })
}

pub fn log_integrity(report: &IntegrityReport) {
    if report.is_clean() {
        info!("Integrity: {}", report);
        return;
    }
    warn!("Integrity: {}", report);
    for line in &report.diagnostics {
        warn!("  {}", line);
    }
    if report.suppressed() > 0 {
        warn!("  ... {} more", report.suppressed());
    }
}
