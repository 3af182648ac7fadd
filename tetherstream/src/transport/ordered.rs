//! Ordering engine -- in-order release of reliable payloads.
//!
//! Sender: each ordered message is tagged with the current send sequence,
//! which then advances modulo 255.
//!
//! Receiver: a payload tagged `sequence` is parked in slot
//! `(sequence + 1) mod 255` of a fixed 255-slot array. Payloads are then
//! released from `receive_sequence` (initially 1) for as long as consecutive
//! slots are occupied. The drain is the only place the receive sequence moves.
//!
//! The sequence space has no freshness window: with 255 or more ordered
//! messages outstanding, a new message can land in a slot whose previous
//! occupant was never released. Senders must keep fewer than 255 ordered
//! messages unacknowledged.

use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, TetherStreamError};
use crate::packet::SEQUENCE_MODULUS;

/// Advance a sequence number by one within `[0, 255)`.
pub fn next_sequence(sequence: u8) -> u8 {
    ((u16::from(sequence) + 1) % u16::from(SEQUENCE_MODULUS)) as u8
}

struct HoldingBuffer {
    receive_sequence: u8,
    slots: Box<[Option<Bytes>]>,
}

pub struct OrderingEngine {
    send_sequence: AtomicU8,
    holding: Mutex<HoldingBuffer>,
}

impl OrderingEngine {
    pub fn new() -> Self {
        Self {
            send_sequence: AtomicU8::new(0),
            holding: Mutex::new(HoldingBuffer {
                receive_sequence: 1,
                slots: vec![None; SEQUENCE_MODULUS as usize].into_boxed_slice(),
            }),
        }
    }

    /// Claim the sequence for the next ordered message.
    pub fn next_send_sequence(&self) -> u8 {
        match self.send_sequence.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(next_sequence(current))
        }) {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// Park an ordered payload and release everything now deliverable, in
    /// send order.
    pub fn on_ordered_received(&self, sequence: u8, payload: Bytes) -> Result<Vec<Bytes>> {
        let mut released = Vec::new();
        self.on_ordered_received_with(sequence, payload, |payload| released.push(payload))?;
        Ok(released)
    }

    /// Like [`on_ordered_received`](Self::on_ordered_received), but hands each
    /// released payload to `release` while the holding buffer is still
    /// locked. Concurrent receivers therefore emit runs in sequence order.
    pub fn on_ordered_received_with<F>(
        &self,
        sequence: u8,
        payload: Bytes,
        mut release: F,
    ) -> Result<usize>
    where
        F: FnMut(Bytes),
    {
        if sequence >= SEQUENCE_MODULUS {
            return Err(TetherStreamError::InvalidSequence(sequence));
        }

        let mut holding = self.holding.lock();
        holding.slots[next_sequence(sequence) as usize] = Some(payload);

        let mut count = 0;
        loop {
            let slot = holding.receive_sequence as usize;
            let Some(payload) = holding.slots[slot].take() else {
                break;
            };
            release(payload);
            count += 1;
            holding.receive_sequence = next_sequence(holding.receive_sequence);
        }
        Ok(count)
    }

    pub fn send_sequence(&self) -> u8 {
        self.send_sequence.load(Ordering::Acquire)
    }

    /// Slot that the next in-order payload will be released from.
    pub fn receive_sequence(&self) -> u8 {
        self.holding.lock().receive_sequence
    }

    /// Number of payloads parked awaiting an earlier sequence.
    pub fn held(&self) -> usize {
        self.holding.lock().slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn clear(&self) {
        let mut holding = self.holding.lock();
        holding.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

impl Default for OrderingEngine {
    fn default() -> Self {
        Self::new()
    }
}
