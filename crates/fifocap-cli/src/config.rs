/// Command-line and environment configuration.
///
/// Every tunable has a `FIFOCAP_*` environment variable; `.env` is loaded
/// before parsing so the file can stand in for the shell environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use fifocap_engine::{
    BinaryFormat, DEFAULT_LATENCY_MS, DEFAULT_PACKETS_PER_TRANSFER, DEFAULT_TRANSFER_COUNT,
    Direction, RecordFormat, SimConfig, SimPattern, StreamConfig,
};

/// Default bounded wait, also the liveness window.
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;

/// Continuous capture from synchronous FIFO USB bridges
#[derive(Parser, Debug)]
#[command(name = "fifocap")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream from the device into FILE, or from FILE to the device
    Capture(CaptureArgs),

    /// Check a dump file for sequence errors
    Check(CheckArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CaptureArgs {
    /// Only open a device with this product string
    #[arg(short = 'P', long, env = "FIFOCAP_DEVICE")]
    pub device: Option<String>,

    /// Read data from FILE and write it to the device (rewinds at end of file)
    #[arg(short, long, requires = "file")]
    pub read_file: bool,

    /// Check the captured stream inline
    #[arg(long, value_enum)]
    pub check: Option<FormatArg>,

    /// Use the built-in simulated peripheral instead of hardware
    #[arg(long, env = "FIFOCAP_SIMULATE")]
    pub simulate: bool,

    /// Packets per transfer request
    #[arg(long, env = "FIFOCAP_PACKETS_PER_TRANSFER", default_value_t = DEFAULT_PACKETS_PER_TRANSFER)]
    pub packets_per_transfer: usize,

    /// Transfer requests kept in flight
    #[arg(long, env = "FIFOCAP_TRANSFER_COUNT", default_value_t = DEFAULT_TRANSFER_COUNT)]
    pub transfer_count: usize,

    /// Latency timer in milliseconds (1 drops many blocks)
    #[arg(long, env = "FIFOCAP_LATENCY_MS", default_value_t = DEFAULT_LATENCY_MS)]
    pub latency_ms: u8,

    /// End the session after this long without a completed transfer
    #[arg(long, env = "FIFOCAP_WAIT_TIMEOUT_MS", default_value_t = DEFAULT_WAIT_TIMEOUT_MS,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub wait_timeout_ms: u64,

    /// Simulated peripheral byte rate
    #[arg(long, env = "FIFOCAP_SIM_RATE")]
    pub sim_rate: Option<u64>,

    /// Simulated peripheral loses every Nth record
    #[arg(long, env = "FIFOCAP_SIM_DROP_EVERY")]
    pub sim_drop_every: Option<u64>,

    /// Dump file
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Record encoding of the dump
    #[arg(short, long, value_enum, default_value = "binary")]
    pub format: FormatArg,

    /// Dump file to replay
    pub file: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// 16-byte records led by a little-endian counter stepping by 0x4000
    Binary,
    /// "%6u%94s%6u" lines
    Text,
}

impl From<FormatArg> for RecordFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Binary => RecordFormat::Binary(BinaryFormat::default()),
            FormatArg::Text => RecordFormat::Text,
        }
    }
}

impl CaptureArgs {
    pub fn direction(&self) -> Direction {
        if self.read_file {
            Direction::Write
        } else {
            Direction::Read
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            direction: self.direction(),
            packets_per_transfer: self.packets_per_transfer,
            transfer_count: self.transfer_count,
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            ..Default::default()
        }
    }

    /// Simulated peripheral emitting the records `--check` expects.
    pub fn sim_config(&self) -> SimConfig {
        let pattern = match self.check {
            Some(FormatArg::Text) => SimPattern::Text,
            _ => SimPattern::default(),
        };
        SimConfig {
            pattern,
            drop_every: self.sim_drop_every,
            rate: self.sim_rate,
            ..Default::default()
        }
    }
}
