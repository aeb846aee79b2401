/// Bulk packet layout for FIFO peripherals in synchronous FIFO mode.
///
/// A completed transfer buffer is a run of fixed-size packets, the last one
/// possibly short. Every packet ends in two bytes of transport status that
/// are not part of the payload:
///
/// ```text
/// [0 .. n-2]   Payload (up to packet_size - 2 bytes)
/// [n-2 .. n]   Transport status (2 bytes)
/// ```
///
/// 512-byte high-speed packets carry 510 payload bytes each.

use std::time::Duration;

/// Per-packet transport status overhead in bytes.
pub const PACKET_STATUS_LEN: usize = 2;

/// Bulk packet size of a high-speed FIFO interface.
pub const DEFAULT_PACKET_SIZE: usize = 512;

/// Packets per transfer request.
pub const DEFAULT_PACKETS_PER_TRANSFER: usize = 8;

/// Transfer requests kept in flight.
pub const DEFAULT_TRANSFER_COUNT: usize = 256;

/// Latency timer in milliseconds. A value of 1 results in many skipped blocks.
pub const DEFAULT_LATENCY_MS: u8 = 2;

/// Bounded wait for completions; one empty wait ends the session.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Minimum interval between progress samples.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Payload spans of one completed transfer buffer.
#[derive(Debug, Clone, Copy)]
pub struct Demuxed<'a> {
    data: &'a [u8],
    packet_size: usize,
}

impl<'a> Demuxed<'a> {
    /// Number of packets in the buffer, counting a trailing short packet.
    pub fn packet_count(&self) -> usize {
        self.data.len().div_ceil(self.packet_size)
    }

    /// Total payload bytes across all packets.
    pub fn payload_len(&self) -> usize {
        self.packets().map(<[u8]>::len).sum()
    }

    /// Payload spans in buffer order.
    pub fn packets(self) -> impl Iterator<Item = &'a [u8]> {
        self.data
            .chunks(self.packet_size)
            .map(|packet| &packet[..packet.len().saturating_sub(PACKET_STATUS_LEN)])
    }
}

/// Split the first `actual_length` bytes of `buffer` into packet payloads.
///
/// `actual_length` is clamped to the buffer length.
///
/// # Panics
/// Panics if `packet_size` is not larger than the status overhead.
pub fn demux(buffer: &[u8], actual_length: usize, packet_size: usize) -> Demuxed<'_> {
    assert!(packet_size > PACKET_STATUS_LEN);
    let length = actual_length.min(buffer.len());
    Demuxed {
        data: &buffer[..length],
        packet_size,
    }
}

/// Payload capacity of a transfer of `packets` full packets.
pub fn payload_capacity(packet_size: usize, packets: usize) -> usize {
    packet_size.saturating_sub(PACKET_STATUS_LEN) * packets
}
