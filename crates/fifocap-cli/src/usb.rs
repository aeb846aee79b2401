/// FT2232H-class bridge on interface A, driven through nusb bulk queues.
///
/// Control requests are the vendor requests of the FTDI SIO protocol:
///
/// ```text
/// 0x00 RESET        value 0 = reset, 1 = purge RX, 2 = purge TX
/// 0x09 SET_LATENCY  value = latency timer in ms
/// 0x0B SET_BITMODE  value = mode << 8 | pin mask
/// ```

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nusb::transfer::{
    Control, ControlType, Queue, Recipient, RequestBuffer, TransferError,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use fifocap_engine::{
    Completion, DEFAULT_PACKET_SIZE, Direction, PeripheralMode, TransferRequest, TransferStatus,
    Transport, TransportError, WaitError,
};

const FTDI_VID: u16 = 0x0403;
const FT2232H_PID: u16 = 0x6010;

const INTERFACE_A: u8 = 0;
/// wIndex addressing interface A in SIO requests.
const SIO_INDEX_A: u16 = 1;
const EP_IN_A: u8 = 0x81;
const EP_OUT_A: u8 = 0x02;

const SIO_RESET: u8 = 0x00;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;
const SIO_SET_BITMODE: u8 = 0x0B;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

const BITMODE_RESET: u8 = 0x00;
const BITMODE_SYNCFF: u8 = 0x40;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

pub struct FtdiTransport {
    interface: nusb::Interface,
    bulk_in: Queue<RequestBuffer>,
    bulk_out: Queue<Vec<u8>>,
    /// Slots in submission order; each queue completes in order.
    in_slots: VecDeque<usize>,
    out_slots: VecDeque<usize>,
    /// wMaxPacketSize of the bulk-in endpoint.
    packet_size: usize,
    handle: Handle,
}

impl FtdiTransport {
    /// Open the first FT2232H whose product string matches `product`, if given.
    ///
    /// Must be called from within the tokio runtime; completions are awaited
    /// through it.
    pub fn open(product: Option<&str>, latency_ms: u8) -> Result<Self> {
        let handle = Handle::try_current().context("USB transport needs a tokio runtime")?;

        let info = nusb::list_devices()
            .context("Can't enumerate USB devices")?
            .find(|d| {
                d.vendor_id() == FTDI_VID
                    && d.product_id() == FT2232H_PID
                    && product.is_none_or(|p| d.product_string() == Some(p))
            })
            .ok_or_else(|| match product {
                Some(p) => anyhow!("Can't open ftdi device: no FT2232H with product string {:?}", p),
                None => anyhow!("Can't open ftdi device: no FT2232H found"),
            })?;
        info!(
            "Opening {:04x}:{:04x} {}",
            info.vendor_id(),
            info.product_id(),
            info.product_string().unwrap_or("(no product string)")
        );

        let device = info.open().context("Can't open ftdi device")?;
        let interface = device
            .claim_interface(INTERFACE_A)
            .context("Can't claim interface A")?;

        let packet_size = endpoint_packet_size(
            interface
                .descriptors()
                .flat_map(|alt| {
                    alt.endpoints()
                        .map(|ep| (ep.address(), ep.max_packet_size()))
                        .collect::<Vec<_>>()
                }),
            EP_IN_A,
        )
        .unwrap_or_else(|| {
            warn!(
                "No descriptor for endpoint {:#04x}, assuming {} byte packets",
                EP_IN_A, DEFAULT_PACKET_SIZE
            );
            DEFAULT_PACKET_SIZE
        });
        debug!("Bulk-in packet size {} bytes", packet_size);

        let bulk_in = interface.bulk_in_queue(EP_IN_A);
        let bulk_out = interface.bulk_out_queue(EP_OUT_A);
        let mut transport = Self {
            interface,
            bulk_in,
            bulk_out,
            in_slots: VecDeque::new(),
            out_slots: VecDeque::new(),
            packet_size,
            handle,
        };

        transport
            .control(SIO_RESET, SIO_RESET_SIO)
            .context("Can't reset device")?;
        // A timeout value of 1 results in many skipped blocks.
        transport
            .control(SIO_SET_LATENCY_TIMER, u16::from(latency_ms))
            .context("Can't set latency")?;
        debug!("Latency timer set to {} ms", latency_ms);
        Ok(transport)
    }

    fn control(&mut self, request: u8, value: u16) -> Result<(), TransportError> {
        let control = Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index: SIO_INDEX_A,
        };
        self.interface
            .control_out_blocking(control, &[], CONTROL_TIMEOUT)
            .map(|_| ())
            .map_err(|e| match e {
                TransferError::Disconnected => TransportError::Disconnected,
                e => TransportError::Status(status_of(e)),
            })
    }

    async fn next_completion(&mut self, timeout: Duration) -> Option<Completion> {
        if !self.in_slots.is_empty() {
            let done = tokio::time::timeout(timeout, self.bulk_in.next_complete())
                .await
                .ok()?;
            let slot = self.in_slots.pop_front()?;
            let actual_length = done.data.len();
            return Some(Completion {
                slot,
                buffer: done.data,
                actual_length,
                status: done.status.map_or_else(status_of, |()| TransferStatus::Completed),
            });
        }
        if !self.out_slots.is_empty() {
            let done = tokio::time::timeout(timeout, self.bulk_out.next_complete())
                .await
                .ok()?;
            let slot = self.out_slots.pop_front()?;
            let actual_length = done.data.actual_length();
            return Some(Completion {
                slot,
                buffer: done.data.reuse(),
                actual_length,
                status: done.status.map_or_else(status_of, |()| TransferStatus::Completed),
            });
        }
        None
    }
}

/// Max packet size of endpoint `address` among `(address, wMaxPacketSize)` pairs.
fn endpoint_packet_size(
    endpoints: impl IntoIterator<Item = (u8, usize)>,
    address: u8,
) -> Option<usize> {
    endpoints
        .into_iter()
        .find(|&(ep, size)| ep == address && size > 0)
        .map(|(_, size)| size)
}

fn status_of(err: TransferError) -> TransferStatus {
    match err {
        TransferError::Cancelled => TransferStatus::Cancelled,
        TransferError::Stall => TransferStatus::Stall,
        TransferError::Disconnected => TransferStatus::Disconnected,
        other => TransferStatus::Fault(other.to_string()),
    }
}

impl Transport for FtdiTransport {
    fn packet_size(&self) -> usize {
        self.packet_size
    }

    fn set_mode(&mut self, mode: PeripheralMode) -> Result<(), TransportError> {
        let bits = match mode {
            PeripheralMode::Reset => BITMODE_RESET,
            PeripheralMode::SyncFifo => BITMODE_SYNCFF,
        };
        self.control(SIO_SET_BITMODE, u16::from(bits) << 8 | 0xff)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.control(SIO_RESET, SIO_RESET_PURGE_RX)?;
        self.control(SIO_RESET, SIO_RESET_PURGE_TX)
    }

    fn submit(&mut self, request: TransferRequest) -> Result<(), TransportError> {
        match request.direction {
            Direction::Read => {
                self.bulk_in
                    .submit(RequestBuffer::reuse(request.buffer, request.length));
                self.in_slots.push_back(request.slot);
            }
            Direction::Write => {
                let mut buffer = request.buffer;
                buffer.truncate(request.length);
                self.bulk_out.submit(buffer);
                self.out_slots.push_back(request.slot);
            }
        }
        Ok(())
    }

    fn wait_completions(
        &mut self,
        timeout: Duration,
        out: &mut Vec<Completion>,
    ) -> Result<(), WaitError> {
        let handle = self.handle.clone();
        let Some(first) = handle.block_on(self.next_completion(timeout)) else {
            return Ok(());
        };
        out.push(first);
        // Collect whatever else is already done without blocking.
        while let Some(more) = handle.block_on(self.next_completion(Duration::ZERO)) {
            out.push(more);
        }
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.bulk_in.cancel_all();
        self.bulk_out.cancel_all();
    }
}
