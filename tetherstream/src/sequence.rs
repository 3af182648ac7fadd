//! Wrapping arithmetic for 16-bit reliable ids and the receive-side id
//! history used for duplicate suppression and ack bitfields.

use crate::packet::ACK_WINDOW;

/// Half of the 16-bit id space. An id more than this far "behind" another is
/// considered to have wrapped forward.
const HALF_RANGE: u16 = 32768;

/// Number of recent ids remembered by [`ReceivedHistory`].
pub const HISTORY_SIZE: usize = 1024;

/// Returns whether `s1` is ahead of `s2`, accounting for wraparound.
///
/// `sequence_greater_than(2, 1)` is true, `sequence_greater_than(0, 65535)`
/// is true, `sequence_greater_than(1, 1)` is false.
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= HALF_RANGE)) || ((s1 < s2) && (s2 - s1 > HALF_RANGE))
}

/// Returns whether `s1` is behind `s2`, accounting for wraparound.
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Signed distance from `a` to `b`: `wrapping_diff(65535, 0) == 1`.
pub fn wrapping_diff(a: u16, b: u16) -> i16 {
    b.wrapping_sub(a) as i16
}

/// Classification of an inbound reliable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// First arrival; deliver and acknowledge.
    New,
    /// Seen before; acknowledge again, do not deliver.
    Duplicate,
    /// Older than the history window; acknowledged, never delivered.
    Stale,
}

/// Fixed-size ring of recently received reliable ids.
///
/// Slot `id % HISTORY_SIZE` holds `Some(id)` once `id` has been received.
/// Slots skipped when the high-water mark jumps forward are cleared so a
/// stale entry from the previous lap is never mistaken for a duplicate.
#[derive(Debug)]
pub struct ReceivedHistory {
    latest: Option<u16>,
    entries: Box<[Option<u16>]>,
}

impl ReceivedHistory {
    pub fn new() -> Self {
        Self {
            latest: None,
            entries: vec![None; HISTORY_SIZE].into_boxed_slice(),
        }
    }

    fn slot(id: u16) -> usize {
        id as usize % HISTORY_SIZE
    }

    /// Record `id` and classify it.
    pub fn insert(&mut self, id: u16) -> Received {
        match self.latest {
            None => self.latest = Some(id),
            Some(latest) if sequence_greater_than(id, latest) => {
                let gap = id.wrapping_sub(latest) as usize;
                if gap >= HISTORY_SIZE {
                    self.entries.iter_mut().for_each(|entry| *entry = None);
                } else {
                    for step in 1..gap {
                        let skipped = latest.wrapping_add(step as u16);
                        self.entries[Self::slot(skipped)] = None;
                    }
                }
                self.latest = Some(id);
            }
            Some(latest) => {
                if latest.wrapping_sub(id) as usize >= HISTORY_SIZE {
                    return Received::Stale;
                }
                if self.contains(id) {
                    return Received::Duplicate;
                }
            }
        }
        self.entries[Self::slot(id)] = Some(id);
        Received::New
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries[Self::slot(id)] == Some(id)
    }

    /// Highest id received so far.
    pub fn latest(&self) -> Option<u16> {
        self.latest
    }

    /// Bitfield acknowledging the `ACK_WINDOW` ids preceding `id`.
    pub fn ack_bitfield(&self, id: u16) -> u32 {
        (0..ACK_WINDOW).fold(0u32, |bits, i| {
            if self.contains(id.wrapping_sub(i + 1)) {
                bits | (1 << i)
            } else {
                bits
            }
        })
    }

    pub fn clear(&mut self) {
        self.latest = None;
        self.entries.iter_mut().for_each(|entry| *entry = None);
    }
}

impl Default for ReceivedHistory {
    fn default() -> Self {
        Self::new()
    }
}
