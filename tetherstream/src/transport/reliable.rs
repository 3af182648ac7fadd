//! Acknowledgement and retransmission engine.
//!
//! Sender: every reliable datagram is stored in a pending table keyed by its
//! 16-bit reliable id until an acknowledgement covers it. Each timer tick
//! resends packets whose resend interval elapsed and multiplies that interval
//! by the backoff factor. A packet that is still due after `resend_limit`
//! retries is reported as exhausted.
//!
//! Receiver: ids are recorded in a [`ReceivedHistory`]; every inbound id is
//! acknowledged with a bitfield covering the preceding `ACK_WINDOW` ids. Only
//! new ids are delivered.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, TetherStreamError};
use crate::packet::{Packet, ACK_WINDOW};
use crate::sequence::{Received, ReceivedHistory};

/// A reliable datagram awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingReliablePacket {
    /// Reliable id carried in the header.
    pub id: u16,
    /// Fully encoded datagram, resent verbatim.
    pub datagram: Bytes,
    /// First transmission; round-trip samples are measured from here.
    pub first_sent: Instant,
    /// Most recent transmission.
    pub last_sent: Instant,
    /// Resends so far.
    pub retries: u32,
    /// Wait after `last_sent` before the next resend.
    pub resend_interval: Duration,
}

/// Ids removed from the pending table by one acknowledgement.
#[derive(Debug, Default)]
pub struct Acknowledged {
    pub ids: Vec<u16>,
    /// Round trip of the directly acknowledged id, if it was never resent.
    pub rtt_sample: Option<Duration>,
}

/// Work produced by one retransmission tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub resend: Vec<Bytes>,
    /// A packet that ran out of retries. Fatal to the connection.
    pub exhausted: Option<u16>,
}

/// Result of recording an inbound reliable id.
#[derive(Debug)]
pub struct ReceiveOutcome {
    pub status: Received,
    /// Acknowledgement to send back.
    pub ack: Packet,
}

struct PendingTable {
    closed: bool,
    next_id: u16,
    packets: HashMap<u16, PendingReliablePacket>,
}

impl PendingTable {
    /// Claim `count` consecutive ids, or none of them if any is still
    /// pending.
    fn reserve(&mut self, count: usize) -> Result<u16> {
        if self.closed {
            return Err(TetherStreamError::ConnectionClosed);
        }
        let first = self.next_id;
        for offset in 0..count {
            let id = first.wrapping_add(offset as u16);
            if self.packets.contains_key(&id) {
                return Err(TetherStreamError::ReliableWindowFull(id));
            }
        }
        self.next_id = first.wrapping_add(count as u16);
        Ok(first)
    }

    fn track(&mut self, id: u16, datagram: Bytes, now: Instant, resend_interval: Duration) {
        self.packets.insert(
            id,
            PendingReliablePacket {
                id,
                datagram,
                first_sent: now,
                last_sent: now,
                retries: 0,
                resend_interval,
            },
        );
    }
}

pub struct ReliableEngine {
    pending: Mutex<PendingTable>,
    received: Mutex<ReceivedHistory>,
    /// Maximum retries per packet; 0 means unlimited.
    resend_limit: u32,
    backoff: f64,
}

impl ReliableEngine {
    pub fn new(resend_limit: u32, backoff: f64) -> Self {
        Self {
            pending: Mutex::new(PendingTable {
                closed: false,
                next_id: 0,
                packets: HashMap::new(),
            }),
            received: Mutex::new(ReceivedHistory::new()),
            resend_limit,
            backoff,
        }
    }

    /// Assign the next reliable id, encode the datagram with it and track it
    /// for retransmission. The caller transmits the returned datagram.
    ///
    /// `encode` runs under the pending-table lock and only once the id is
    /// secured; on error nothing is consumed.
    pub fn send_reliable<F>(
        &self,
        now: Instant,
        resend_interval: Duration,
        encode: F,
    ) -> Result<(u16, Bytes)>
    where
        F: FnOnce(u16) -> Bytes,
    {
        let mut table = self.pending.lock();
        let id = table.reserve(1)?;
        let datagram = encode(id);
        table.track(id, datagram.clone(), now, resend_interval);
        Ok((id, datagram))
    }

    /// Send `count` datagrams on consecutive ids. Either every id is free and
    /// all are tracked, or the call fails without side effects.
    /// `encode` receives each id with its index in the batch.
    pub fn send_reliable_batch<F>(
        &self,
        now: Instant,
        resend_interval: Duration,
        count: usize,
        mut encode: F,
    ) -> Result<Vec<(u16, Bytes)>>
    where
        F: FnMut(u16, usize) -> Bytes,
    {
        let mut table = self.pending.lock();
        let first = table.reserve(count)?;
        let mut sent = Vec::with_capacity(count);
        for index in 0..count {
            let id = first.wrapping_add(index as u16);
            let datagram = encode(id, index);
            table.track(id, datagram.clone(), now, resend_interval);
            sent.push((id, datagram));
        }
        Ok(sent)
    }

    /// Remove `id` and every id flagged in `bitfield` from the pending table.
    /// Ids that are not pending are ignored.
    pub fn on_ack(&self, id: u16, bitfield: u32, now: Instant) -> Acknowledged {
        let mut table = self.pending.lock();
        let mut acked = Acknowledged::default();

        if let Some(packet) = table.packets.remove(&id) {
            if packet.retries == 0 {
                acked.rtt_sample = Some(now.saturating_duration_since(packet.first_sent));
            }
            acked.ids.push(id);
        }
        for bit in 0..ACK_WINDOW {
            if bitfield & (1 << bit) == 0 {
                continue;
            }
            let covered = id.wrapping_sub(bit + 1);
            if table.packets.remove(&covered).is_some() {
                acked.ids.push(covered);
            }
        }
        acked
    }

    /// Collect packets due for retransmission at `now`.
    pub fn on_timer_tick(&self, now: Instant) -> TickOutcome {
        let mut table = self.pending.lock();
        let mut outcome = TickOutcome::default();
        if table.closed {
            return outcome;
        }

        for packet in table.packets.values_mut() {
            if now.saturating_duration_since(packet.last_sent) < packet.resend_interval {
                continue;
            }
            if self.resend_limit > 0 && packet.retries >= self.resend_limit {
                outcome.exhausted = Some(packet.id);
                continue;
            }
            packet.retries += 1;
            packet.last_sent = now;
            packet.resend_interval = packet.resend_interval.mul_f64(self.backoff);
            tracing::trace!(
                id = packet.id,
                retries = packet.retries,
                next_interval_ms = packet.resend_interval.as_millis() as u64,
                "resending reliable packet"
            );
            outcome.resend.push(packet.datagram.clone());
        }
        outcome
    }

    /// Record an inbound reliable id and build the acknowledgement for it.
    /// Every id is acknowledged, stale ones included, so a sender whose
    /// earlier acks were lost stops resending.
    pub fn on_reliable_received(&self, id: u16) -> ReceiveOutcome {
        let mut history = self.received.lock();
        let status = history.insert(id);
        let ack = Packet::Ack {
            id,
            bitfield: history.ack_bitfield(id),
        };
        ReceiveOutcome { status, ack }
    }

    /// Drop all pending and received state. Later sends fail and later ticks
    /// produce nothing.
    pub fn teardown(&self) {
        {
            let mut table = self.pending.lock();
            table.closed = true;
            table.packets.clear();
        }
        self.received.lock().clear();
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().packets.len()
    }

    pub fn is_pending(&self, id: u16) -> bool {
        self.pending.lock().packets.contains_key(&id)
    }

    /// Snapshot of one pending packet.
    pub fn pending_packet(&self, id: u16) -> Option<PendingReliablePacket> {
        self.pending.lock().packets.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_unordered(payload: &'static [u8]) -> impl FnOnce(u16) -> Bytes {
        move |id| {
            Packet::ReliableUnordered {
                id,
                payload: Bytes::from_static(payload),
            }
            .encode()
        }
    }

    #[test]
    fn ids_increase_monotonically() {
        let engine = ReliableEngine::new(0, 1.5);
        let now = Instant::now();
        let rto = Duration::from_millis(100);
        let (a, _) = engine.send_reliable(now, rto, encode_unordered(b"a")).unwrap();
        let (b, _) = engine.send_reliable(now, rto, encode_unordered(b"b")).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(engine.in_flight(), 2);
    }

    #[test]
    fn ack_bitfield_clears_preceding_ids() {
        let engine = ReliableEngine::new(0, 1.5);
        let now = Instant::now();
        let rto = Duration::from_millis(100);
        for _ in 0..4 {
            engine.send_reliable(now, rto, encode_unordered(b"x")).unwrap();
        }
        // Ack 3, plus 2 (bit 0) and 0 (bit 2).
        let acked = engine.on_ack(3, 0b101, now + Duration::from_millis(20));
        assert_eq!(acked.ids, vec![3, 2, 0]);
        assert_eq!(acked.rtt_sample, Some(Duration::from_millis(20)));
        assert!(engine.is_pending(1));
        assert_eq!(engine.in_flight(), 1);

        // Repeated ack is ignored.
        let again = engine.on_ack(3, 0b101, now);
        assert!(again.ids.is_empty());
    }

    #[test]
    fn resend_after_interval_with_backoff() {
        let engine = ReliableEngine::new(0, 2.0);
        let start = Instant::now();
        let rto = Duration::from_millis(100);
        let (id, datagram) = engine
            .send_reliable(start, rto, encode_unordered(b"r"))
            .unwrap();

        assert!(engine.on_timer_tick(start + Duration::from_millis(99)).resend.is_empty());

        let t1 = start + Duration::from_millis(100);
        let outcome = engine.on_timer_tick(t1);
        assert_eq!(outcome.resend, vec![datagram]);
        let packet = engine.pending_packet(id).unwrap();
        assert_eq!(packet.retries, 1);
        assert_eq!(packet.resend_interval, Duration::from_millis(200));

        assert!(engine.on_timer_tick(t1 + Duration::from_millis(150)).resend.is_empty());
        assert_eq!(engine.on_timer_tick(t1 + Duration::from_millis(200)).resend.len(), 1);
    }

    #[test]
    fn retransmitted_ack_gives_no_rtt_sample() {
        let engine = ReliableEngine::new(0, 1.0);
        let start = Instant::now();
        let rto = Duration::from_millis(10);
        let (id, _) = engine.send_reliable(start, rto, encode_unordered(b"k")).unwrap();
        engine.on_timer_tick(start + rto);
        let acked = engine.on_ack(id, 0, start + rto * 2);
        assert_eq!(acked.ids, vec![id]);
        assert!(acked.rtt_sample.is_none());
    }

    #[test]
    fn resend_limit_exhaustion() {
        let engine = ReliableEngine::new(2, 1.0);
        let mut now = Instant::now();
        let rto = Duration::from_millis(10);
        let (id, _) = engine.send_reliable(now, rto, encode_unordered(b"z")).unwrap();

        for _ in 0..2 {
            now += rto;
            let outcome = engine.on_timer_tick(now);
            assert_eq!(outcome.resend.len(), 1);
            assert!(outcome.exhausted.is_none());
        }
        now += rto;
        let outcome = engine.on_timer_tick(now);
        assert!(outcome.resend.is_empty());
        assert_eq!(outcome.exhausted, Some(id));
    }

    #[test]
    fn duplicate_receipt_is_reacked_not_redelivered() {
        let engine = ReliableEngine::new(0, 1.5);
        let first = engine.on_reliable_received(7);
        assert_eq!(first.status, Received::New);
        assert_eq!(first.ack, Packet::Ack { id: 7, bitfield: 0 });

        let second = engine.on_reliable_received(7);
        assert_eq!(second.status, Received::Duplicate);
        assert_eq!(second.ack, Packet::Ack { id: 7, bitfield: 0 });
    }

    #[test]
    fn stale_receipt_is_still_acked() {
        let engine = ReliableEngine::new(0, 1.5);
        engine.on_reliable_received(0);
        engine.on_reliable_received(1100);
        let late = engine.on_reliable_received(0);
        assert_eq!(late.status, Received::Stale);
        assert!(matches!(late.ack, Packet::Ack { id: 0, .. }));
    }

    #[test]
    fn teardown_blocks_revival() {
        let engine = ReliableEngine::new(0, 1.5);
        let now = Instant::now();
        let rto = Duration::from_millis(10);
        engine.send_reliable(now, rto, encode_unordered(b"q")).unwrap();
        engine.teardown();

        assert_eq!(engine.in_flight(), 0);
        assert!(engine.on_timer_tick(now + rto).resend.is_empty());
        assert!(matches!(
            engine.send_reliable(now, rto, encode_unordered(b"q")),
            Err(TetherStreamError::ConnectionClosed)
        ));
    }
}
