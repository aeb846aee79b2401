/// Fixed-size pool of transfer slots against one transport endpoint.
///
/// Buffers move by value: pool → transport on submission, transport → engine
/// on completion, engine → transport again on resubmission. Between
/// completion and resubmission the slot is `Lent` and the buffer is lent to
/// the consumer for one dispatch; there is never a second live reference.

use crate::consumer::Flow;
use crate::error::{StreamError, TransportError};
use crate::transport::{Direction, TransferRequest, Transport};

/// Lifecycle position of one slot.
#[derive(Debug)]
pub enum SlotState {
    /// Allocated, never submitted.
    Held(Vec<u8>),
    /// Buffer out of the pool, owned by the engine.
    Lent,
    /// Buffer owned by the transport.
    InFlight,
    /// Freed; never submitted again.
    Released,
}

#[derive(Debug)]
pub struct TransferSlot {
    pub index: usize,
    pub state: SlotState,
}

impl TransferSlot {
    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, SlotState::InFlight)
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, SlotState::Released)
    }
}

pub struct TransferPool {
    slots: Vec<TransferSlot>,
    direction: Direction,
    buffer_len: usize,
    in_flight: usize,
    live: usize,
}

impl TransferPool {
    /// Allocate `transfer_count` buffers of `packets_per_transfer * packet_size` bytes.
    pub fn allocate(
        direction: Direction,
        packet_size: usize,
        packets_per_transfer: usize,
        transfer_count: usize,
    ) -> Result<Self, StreamError> {
        let buffer_len = packet_size.checked_mul(packets_per_transfer).unwrap_or(0);
        let alloc_err = || StreamError::Allocation {
            slots: transfer_count,
            buffer_len,
        };
        if buffer_len == 0 || transfer_count == 0 {
            return Err(alloc_err());
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(transfer_count).map_err(|_| alloc_err())?;
        for index in 0..transfer_count {
            let mut buffer = Vec::new();
            buffer.try_reserve_exact(buffer_len).map_err(|_| alloc_err())?;
            buffer.resize(buffer_len, 0);
            slots.push(TransferSlot {
                index,
                state: SlotState::Held(buffer),
            });
        }

        Ok(Self {
            slots,
            direction,
            buffer_len,
            in_flight: 0,
            live: transfer_count,
        })
    }

    /// Submit every allocated slot. Write buffers are filled through `fill`
    /// first; a slot whose fill returns [`Flow::Stop`] is released instead.
    ///
    /// Stops at the first submission failure, leaving earlier slots in flight.
    pub fn prime<T, F>(&mut self, transport: &mut T, mut fill: F) -> Result<(), StreamError>
    where
        T: Transport + ?Sized,
        F: FnMut(&mut [u8]) -> Flow,
    {
        for index in 0..self.slots.len() {
            let Some(mut buffer) = self.take(index) else {
                continue;
            };
            if self.direction == Direction::Write && fill(&mut buffer).is_stop() {
                self.release(index);
                continue;
            }
            self.resubmit(transport, index, buffer)?;
        }
        Ok(())
    }

    /// Move a never-submitted buffer out of its slot.
    pub fn take(&mut self, index: usize) -> Option<Vec<u8>> {
        let slot = self.slots.get_mut(index)?;
        if !matches!(slot.state, SlotState::Held(_)) {
            return None;
        }
        match std::mem::replace(&mut slot.state, SlotState::Lent) {
            SlotState::Held(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Mark an in-flight slot as completed; its buffer now belongs to the caller.
    pub fn complete(&mut self, index: usize) -> Result<(), StreamError> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_in_flight() => {
                slot.state = SlotState::Lent;
                self.in_flight -= 1;
                Ok(())
            }
            _ => Err(StreamError::Transport(TransportError::Other(format!(
                "completion for slot {} which is not in flight",
                index
            )))),
        }
    }

    /// Hand a lent buffer back to the transport.
    ///
    /// On failure the transport has dropped the buffer and the slot is released.
    pub fn resubmit<T>(
        &mut self,
        transport: &mut T,
        index: usize,
        mut buffer: Vec<u8>,
    ) -> Result<(), StreamError>
    where
        T: Transport + ?Sized,
    {
        debug_assert!(matches!(self.slots[index].state, SlotState::Lent));
        // Transports may hand reads back truncated to the received length.
        buffer.resize(self.buffer_len, 0);
        let length = buffer.len();
        self.slots[index].state = SlotState::InFlight;
        self.in_flight += 1;

        let request = TransferRequest {
            slot: index,
            direction: self.direction,
            buffer,
            length,
        };
        transport.submit(request).map_err(|source| {
            self.slots[index].state = SlotState::Released;
            self.in_flight -= 1;
            self.live -= 1;
            StreamError::Submission { slot: index, source }
        })
    }

    /// Free a slot permanently. In-flight and already released slots are left alone.
    pub fn release(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        match slot.state {
            SlotState::Held(_) | SlotState::Lent => {
                slot.state = SlotState::Released;
                self.live -= 1;
            }
            SlotState::InFlight | SlotState::Released => {}
        }
    }

    /// Release every slot not owned by the transport.
    pub fn release_idle(&mut self) {
        for index in 0..self.slots.len() {
            self.release(index);
        }
    }

    /// Release in-flight slots whose completions will never arrive.
    pub fn abandon_in_flight(&mut self) {
        for slot in &mut self.slots {
            if slot.is_in_flight() {
                slot.state = SlotState::Released;
                self.in_flight -= 1;
                self.live -= 1;
            }
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Slots allocated for the session; constant.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots owned by the transport.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Slots not yet released.
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn released(&self) -> usize {
        self.slots.len() - self.live
    }

    pub fn slots(&self) -> &[TransferSlot] {
        &self.slots
    }
}
