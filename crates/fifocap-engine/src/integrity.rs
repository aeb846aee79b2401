//! Sequence integrity checking for captured streams.
//!
//! Two record encodings are understood:
//!
//! - **Binary**: fixed-size records whose first four bytes are a
//!   little-endian counter advancing by a fixed stride.
//! - **Text**: newline-terminated lines of a 6-digit start number, 94 filler
//!   characters and a 6-digit end number, where `end == (start + 1) % 100000`
//!   and each start repeats the previous line's end.
//!
//! Checkers accept input in arbitrary chunks and reassemble records split
//! across calls, so the online (capture) and offline (dump replay) paths are
//! the same code and give the same report for the same bytes.

use std::fmt;
use std::io::{self, Read};

/// Diagnostics kept per report; later anomalies are only counted.
pub const MAX_DIAGNOSTICS: usize = 20;

/// Read size when replaying a dump file.
const REPLAY_CHUNK: usize = 64 * 1024;

/// Modulus of the text line numbers.
const TEXT_MODULUS: u32 = 100_000;
const TEXT_NUMBER_DIGITS: usize = 6;
const TEXT_FILLER_LEN: usize = 94;

/// Longest text line, excluding its newline, that is parsed at all.
const MAX_TEXT_LINE: usize = 4096;

/// Layout of binary counter records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFormat {
    pub record_size: usize,
    pub stride: u32,
}

impl Default for BinaryFormat {
    fn default() -> Self {
        Self {
            record_size: 16,
            stride: 0x4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Binary(BinaryFormat),
    Text,
}

impl Default for RecordFormat {
    fn default() -> Self {
        RecordFormat::Binary(BinaryFormat::default())
    }
}

/// Additive anomaly statistics for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Records examined, including malformed ones.
    pub records: u64,
    /// Total anomalies: every counter discontinuity, skip, mismatch and
    /// malformed line counts once.
    pub errors: u64,
    /// Binary only: blocks estimated lost in forward counter jumps.
    pub missed_blocks: u64,
    /// Text only: lines whose start does not repeat the previous end.
    pub skips: u64,
    /// Text only: lines whose end is not `start + 1`.
    pub mismatches: u64,
    /// Text only: lines that do not parse.
    pub malformed: u64,
    /// First [`MAX_DIAGNOSTICS`] anomaly descriptions.
    pub diagnostics: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }

    fn note(&mut self, message: String) {
        tracing::debug!(records = self.records, "{}", message);
        if self.diagnostics.len() < MAX_DIAGNOSTICS {
            self.diagnostics.push(message);
        }
    }

    /// Diagnostics counted but not kept.
    pub fn suppressed(&self) -> u64 {
        self.errors.saturating_sub(self.diagnostics.len() as u64)
    }
}

impl fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "records={} errors={}", self.records, self.errors)?;
        if self.missed_blocks > 0 {
            write!(f, " missed_blocks={}", self.missed_blocks)?;
        }
        if self.skips + self.mismatches + self.malformed > 0 {
            write!(
                f,
                " skips={} mismatches={} malformed={}",
                self.skips, self.mismatches, self.malformed
            )?;
        }
        Ok(())
    }
}

/// Incremental checker contract shared by every record format.
pub trait SequenceCheck {
    /// Consume the next chunk of the stream.
    fn feed(&mut self, chunk: &[u8]);

    /// Report so far, excluding any partial trailing record.
    fn report(&self) -> &IntegrityReport;

    /// Account for the partial trailing record and return the final report.
    /// Further calls return the same report.
    fn finish(&mut self) -> &IntegrityReport;
}

// ---------------------------------------------------------------------------
// Binary

pub struct BinaryChecker {
    format: BinaryFormat,
    previous: Option<u32>,
    partial: Vec<u8>,
    report: IntegrityReport,
    finished: bool,
}

impl BinaryChecker {
    /// # Panics
    /// Panics if records are too short to hold a counter or the stride is zero.
    pub fn new(format: BinaryFormat) -> Self {
        assert!(format.record_size >= 4 && format.stride > 0);
        Self {
            format,
            previous: None,
            partial: Vec::with_capacity(format.record_size),
            report: IntegrityReport::default(),
            finished: false,
        }
    }

    fn check_record(&mut self, record: &[u8]) {
        let counter = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        self.report.records += 1;

        if let Some(previous) = self.previous {
            let expected = previous.wrapping_add(self.format.stride);
            if counter != expected {
                let distance = counter.wrapping_sub(expected);
                // Differences past half the counter space are backward jumps.
                let missed = if distance < 0x8000_0000 {
                    (distance / self.format.stride).saturating_sub(1)
                } else {
                    0
                };
                self.report.errors += 1;
                self.report.missed_blocks += u64::from(missed);
                self.report.note(format!(
                    "expected 0x{:08x}, got 0x{:08x} ({} blocks missed)",
                    expected, counter, missed
                ));
            }
        }
        self.previous = Some(counter);
    }
}

impl SequenceCheck for BinaryChecker {
    fn feed(&mut self, mut chunk: &[u8]) {
        let size = self.format.record_size;

        if !self.partial.is_empty() {
            let need = size - self.partial.len();
            let take = need.min(chunk.len());
            self.partial.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.partial.len() < size {
                return;
            }
            let record = std::mem::take(&mut self.partial);
            self.check_record(&record);
            self.partial = record;
            self.partial.clear();
        }

        let mut records = chunk.chunks_exact(size);
        for record in &mut records {
            self.check_record(record);
        }
        self.partial.extend_from_slice(records.remainder());
    }

    fn report(&self) -> &IntegrityReport {
        &self.report
    }

    fn finish(&mut self) -> &IntegrityReport {
        if !self.finished {
            self.finished = true;
            // A short tail still counts if it holds a whole counter.
            if self.partial.len() >= 4 {
                let tail = std::mem::take(&mut self.partial);
                self.check_record(&tail);
            }
            self.partial.clear();
        }
        &self.report
    }
}

// ---------------------------------------------------------------------------
// Text

/// One parsed text record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TextLine {
    start: u32,
    end: u32,
}

/// Parse `"%6u%94s%6u"`: whitespace before each field is skipped, numbers
/// take at most six digits, the filler at most 94 non-space bytes.
fn parse_text_line(line: &[u8]) -> Option<TextLine> {
    let mut rest = line;
    let start = take_number(&mut rest)?;
    take_word(&mut rest, TEXT_FILLER_LEN)?;
    let end = take_number(&mut rest)?;
    Some(TextLine { start, end })
}

fn skip_space(rest: &mut &[u8]) {
    let n = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
    *rest = &rest[n..];
}

fn take_number(rest: &mut &[u8]) -> Option<u32> {
    skip_space(rest);
    let n = rest
        .iter()
        .take(TEXT_NUMBER_DIGITS)
        .take_while(|b| b.is_ascii_digit())
        .count();
    if n == 0 {
        return None;
    }
    let value = rest[..n]
        .iter()
        .fold(0u32, |acc, b| acc * 10 + u32::from(b - b'0'));
    *rest = &rest[n..];
    Some(value)
}

fn take_word(rest: &mut &[u8], max: usize) -> Option<()> {
    skip_space(rest);
    let n = rest
        .iter()
        .take(max)
        .take_while(|b| !b.is_ascii_whitespace())
        .count();
    if n == 0 {
        return None;
    }
    *rest = &rest[n..];
    Some(())
}

pub struct TextChecker {
    previous_end: Option<u32>,
    partial: Vec<u8>,
    /// Bytes seen so far of the line in progress.
    line_len: usize,
    report: IntegrityReport,
    finished: bool,
}

impl Default for TextChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl TextChecker {
    pub fn new() -> Self {
        Self {
            previous_end: None,
            partial: Vec::new(),
            line_len: 0,
            report: IntegrityReport::default(),
            finished: false,
        }
    }

    fn check_line(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        self.report.records += 1;

        let Some(TextLine { start, end }) = parse_text_line(line) else {
            self.malformed(line.len());
            return;
        };

        if let Some(previous) = self.previous_end {
            if start != previous {
                self.report.skips += 1;
                self.report.errors += 1;
                self.report
                    .note(format!("skipping from {} to {}", previous, start));
            }
        }
        if end != (start + 1) % TEXT_MODULUS {
            self.report.mismatches += 1;
            self.report.errors += 1;
            let expected = (start + 1) % TEXT_MODULUS;
            self.report
                .note(format!("line {} ends with {} instead of {}", start, end, expected));
        }
        self.previous_end = Some(end);
    }

    /// A line over [`MAX_TEXT_LINE`] is one malformed record, never parsed.
    fn overlong(&mut self, len: usize) {
        self.report.records += 1;
        self.malformed(len);
    }

    fn malformed(&mut self, len: usize) {
        self.report.malformed += 1;
        self.report.errors += 1;
        // The next line cannot be judged against a line that did not parse.
        self.previous_end = None;
        let record = self.report.records;
        self.report
            .note(format!("malformed line {} ({} bytes)", record, len));
    }
}

impl SequenceCheck for TextChecker {
    fn feed(&mut self, mut chunk: &[u8]) {
        while let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            let (head, tail) = (&chunk[..pos], &chunk[pos + 1..]);
            chunk = tail;

            let len = std::mem::take(&mut self.line_len) + head.len();
            if len > MAX_TEXT_LINE {
                self.partial.clear();
                self.overlong(len);
            } else if self.partial.is_empty() {
                self.check_line(head);
            } else {
                let mut line = std::mem::take(&mut self.partial);
                line.extend_from_slice(head);
                self.check_line(&line);
                self.partial = line;
                self.partial.clear();
            }
        }

        self.line_len += chunk.len();
        if self.line_len > MAX_TEXT_LINE {
            self.partial.clear();
        } else {
            self.partial.extend_from_slice(chunk);
        }
    }

    fn report(&self) -> &IntegrityReport {
        &self.report
    }

    fn finish(&mut self) -> &IntegrityReport {
        if !self.finished {
            self.finished = true;
            let len = std::mem::take(&mut self.line_len);
            if len > MAX_TEXT_LINE {
                self.partial.clear();
                self.overlong(len);
            } else if !self.partial.is_empty() {
                let tail = std::mem::take(&mut self.partial);
                self.check_line(&tail);
            }
        }
        &self.report
    }
}

// ---------------------------------------------------------------------------
// Format dispatch

/// Checker for a format chosen at runtime.
pub enum Checker {
    Binary(BinaryChecker),
    Text(TextChecker),
}

impl Checker {
    pub fn new(format: RecordFormat) -> Self {
        match format {
            RecordFormat::Binary(binary) => Checker::Binary(BinaryChecker::new(binary)),
            RecordFormat::Text => Checker::Text(TextChecker::new()),
        }
    }
}

impl SequenceCheck for Checker {
    fn feed(&mut self, chunk: &[u8]) {
        match self {
            Checker::Binary(c) => c.feed(chunk),
            Checker::Text(c) => c.feed(chunk),
        }
    }

    fn report(&self) -> &IntegrityReport {
        match self {
            Checker::Binary(c) => c.report(),
            Checker::Text(c) => c.report(),
        }
    }

    fn finish(&mut self) -> &IntegrityReport {
        match self {
            Checker::Binary(c) => c.finish(),
            Checker::Text(c) => c.finish(),
        }
    }
}

/// Replay a dump through a checker and return the final report.
pub fn check_dump<R: Read>(mut reader: R, format: RecordFormat) -> io::Result<IntegrityReport> {
    let mut checker = Checker::new(format);
    let mut buf = vec![0u8; REPLAY_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        checker.feed(&buf[..n]);
    }
    Ok(checker.finish().clone())
}
