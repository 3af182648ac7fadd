//! Connection state machine.
//!
//! Manages the lifecycle of one remote endpoint:
//! Connecting -> Connected -> Disconnected.
//!
//! Inbound datagrams are decoded and dispatched by send-option to the
//! reliable, ordering, fragmentation and keep-alive engines. Payloads that
//! become deliverable, and the final disconnect, are pushed onto an event
//! queue that the application drains with [`Connection::poll_event`].
//! Datagrams are written to the sink only after every engine lock has been
//! released.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{Result, TetherStreamError};
use crate::keepalive::{KeepAlive, KeepAliveAction};
use crate::packet::Packet;
use crate::rtt::RttEstimator;
use crate::sequence::Received;
use crate::transport::fragmented::{FragmentAssembler, Fragmenter, Reassembled};
use crate::transport::ordered::OrderingEngine;
use crate::transport::reliable::ReliableEngine;
use crate::transport::{DatagramSink, DeliveryGuarantee};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake sent, awaiting its acknowledgement.
    Connecting = 0,
    /// Handshake complete; data flows.
    Connected = 1,
    /// Terminal.
    Disconnected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Why a connection entered `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The sink failed with a hard error.
    SocketExceptionSend,
    /// The receive half of the socket failed.
    SocketExceptionReceive,
    /// A zero-length datagram arrived.
    ReceivedZeroBytes,
    /// Silence outlasted `keep_alive_interval * missed_pings_threshold`.
    PingsWithoutResponse,
    /// A reliable packet used up its resends without an acknowledgement.
    ReliablePacketWithoutResponse,
    /// Closed locally or by a Disconnect datagram from the remote.
    ConnectionDisconnected,
    /// The handshake was not acknowledged within `disconnect_timeout`.
    HandshakeTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::SocketExceptionSend => "socket error while sending",
            DisconnectReason::SocketExceptionReceive => "socket error while receiving",
            DisconnectReason::ReceivedZeroBytes => "received a zero-byte datagram",
            DisconnectReason::PingsWithoutResponse => "pings went unanswered",
            DisconnectReason::ReliablePacketWithoutResponse => "reliable packet was never acknowledged",
            DisconnectReason::ConnectionDisconnected => "connection closed",
            DisconnectReason::HandshakeTimeout => "handshake timed out",
        };
        f.write_str(text)
    }
}

/// Something the application must observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// One complete payload, in delivery order for its guarantee.
    Message(Bytes),
    /// Raised exactly once.
    Disconnected(DisconnectReason),
}

struct Handshake {
    id: Option<u16>,
    started: Instant,
    payload: Bytes,
}

/// One remote endpoint.
///
/// Every method takes `&self`; share it as `Arc<Connection>` between the
/// receive path, the timer driver and application senders.
pub struct Connection {
    remote: SocketAddr,
    config: ConnectionConfig,
    state: AtomicU8,
    sink: Arc<dyn DatagramSink>,
    reliable: ReliableEngine,
    ordering: OrderingEngine,
    fragmenter: Fragmenter,
    assembler: FragmentAssembler,
    keep_alive: KeepAlive,
    rtt: Mutex<RttEstimator>,
    handshake: Mutex<Handshake>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    events: SegQueue<ConnectionEvent>,
}

impl Connection {
    fn new(
        remote: SocketAddr,
        config: ConnectionConfig,
        sink: Arc<dyn DatagramSink>,
        state: ConnectionState,
        handshake_payload: Bytes,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            remote,
            reliable: ReliableEngine::new(config.resend_limit, config.resend_backoff),
            ordering: OrderingEngine::new(),
            fragmenter: Fragmenter::new(config.max_fragment_size),
            assembler: FragmentAssembler::new(config.max_fragment_size, config.max_message_size),
            keep_alive: KeepAlive::new(
                config.keep_alive_interval,
                config.missed_pings_threshold,
                config.pong_on_any_traffic,
                now,
            ),
            rtt: Mutex::new(RttEstimator::new()),
            handshake: Mutex::new(Handshake {
                id: None,
                started: now,
                payload: handshake_payload,
            }),
            disconnect_reason: Mutex::new(None),
            events: SegQueue::new(),
            state: AtomicU8::new(state as u8),
            sink,
            config,
        })
    }

    /// Initiate a connection (client side): send the handshake reliably and
    /// wait in `Connecting` for its acknowledgement.
    pub fn connect(
        remote: SocketAddr,
        config: ConnectionConfig,
        sink: Arc<dyn DatagramSink>,
        handshake_payload: Bytes,
        now: Instant,
    ) -> Result<Self> {
        let connection = Self::new(
            remote,
            config,
            sink,
            ConnectionState::Connecting,
            handshake_payload.clone(),
            now,
        )?;
        let id = connection.send_reliable(now, |id| Packet::Handshake {
            id,
            payload: handshake_payload,
        })?;
        connection.handshake.lock().id = Some(id);
        debug!(remote = %remote, handshake_id = id, "handshake sent");
        Ok(connection)
    }

    /// Accept a connection (server side) from its first datagram, which must
    /// be a handshake. The handshake is acknowledged and the connection
    /// starts `Connected`.
    pub fn accept(
        remote: SocketAddr,
        config: ConnectionConfig,
        sink: Arc<dyn DatagramSink>,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Self> {
        let (id, payload) = match Packet::decode(datagram)? {
            Packet::Handshake { id, payload } => (id, payload),
            other => return Err(TetherStreamError::UnexpectedPacket(other.send_option())),
        };
        let connection = Self::new(
            remote,
            config,
            sink,
            ConnectionState::Connected,
            payload,
            now,
        )?;
        connection.handshake.lock().id = Some(id);
        connection.receive_reliable(id)?;
        debug!(remote = %remote, handshake_id = id, "handshake accepted");
        Ok(connection)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Payload carried by the handshake (sent or received).
    pub fn handshake_payload(&self) -> Bytes {
        self.handshake.lock().payload.clone()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.disconnect_reason.lock()
    }

    /// Smoothed round trip, once measured.
    pub fn round_trip(&self) -> Option<Duration> {
        self.rtt.lock().round_trip()
    }

    /// Reliable packets still awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.reliable.in_flight()
    }

    pub fn send_sequence(&self) -> u8 {
        self.ordering.send_sequence()
    }

    pub fn receive_sequence(&self) -> u8 {
        self.ordering.receive_sequence()
    }

    pub fn pending_fragments(&self) -> usize {
        self.assembler.pending()
    }

    pub fn missed_pongs(&self) -> u32 {
        self.keep_alive.missed_pongs()
    }

    /// Next queued event, if any.
    pub fn poll_event(&self) -> Option<ConnectionEvent> {
        self.events.pop()
    }

    /// Drain every queued event.
    pub fn drain_events(&self) -> Vec<ConnectionEvent> {
        std::iter::from_fn(|| self.events.pop()).collect()
    }

    /// Send `payload` with the requested guarantee. Reliable payloads larger
    /// than `max_fragment_size` are fragmented.
    pub fn send(&self, payload: Bytes, guarantee: DeliveryGuarantee, now: Instant) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => return Err(TetherStreamError::NotConnected),
            ConnectionState::Disconnected => {
                return Err(match self.disconnect_reason() {
                    Some(DisconnectReason::HandshakeTimeout) => TetherStreamError::HandshakeTimeout,
                    _ => TetherStreamError::ConnectionClosed,
                })
            }
        }
        if payload.len() > self.config.max_message_size {
            return Err(TetherStreamError::MessageTooLarge {
                size: payload.len(),
                max: self.config.max_message_size,
            });
        }
        let oversized = payload.len() > self.config.max_fragment_size;

        match guarantee {
            DeliveryGuarantee::Unreliable => {
                if oversized {
                    return Err(TetherStreamError::PayloadTooLarge {
                        size: payload.len(),
                        max: self.config.max_fragment_size,
                    });
                }
                self.transmit(&Packet::Unreliable { payload }.encode())
            }
            DeliveryGuarantee::ReliableUnordered if oversized => {
                self.send_fragmented(payload, false, now)
            }
            DeliveryGuarantee::ReliableUnordered => {
                self.send_reliable(now, |id| Packet::ReliableUnordered { id, payload })?;
                Ok(())
            }
            DeliveryGuarantee::ReliableOrdered if oversized => {
                self.send_fragmented(payload, true, now)
            }
            DeliveryGuarantee::ReliableOrdered => {
                // The sequence is claimed only once the reliable id is secured.
                self.send_reliable(now, |id| Packet::ReliableOrdered {
                    id,
                    sequence: self.ordering.next_send_sequence(),
                    payload,
                })?;
                Ok(())
            }
        }
    }

    /// Split `payload` and send every fragment reliably. Either all fragment
    /// ids are reserved or nothing is sent.
    fn send_fragmented(&self, payload: Bytes, ordered: bool, now: Instant) -> Result<()> {
        let fragments = self.fragmenter.split(&payload, None)?;
        trace!(
            remote = %self.remote,
            len = payload.len(),
            fragments = fragments.len(),
            "sending fragmented message"
        );
        let interval = self.initial_resend_interval();
        let mut sequence = None;
        let sent = self
            .reliable
            .send_reliable_batch(now, interval, fragments.len(), |id, index| {
                let (mut fragment, chunk) = fragments[index].clone();
                if ordered {
                    fragment.sequence =
                        Some(*sequence.get_or_insert_with(|| self.ordering.next_send_sequence()));
                }
                Packet::Fragment { id, fragment, chunk }.encode()
            })?;
        for (_, datagram) in &sent {
            self.transmit(datagram)?;
        }
        Ok(())
    }

    fn send_reliable<F>(&self, now: Instant, build: F) -> Result<u16>
    where
        F: FnOnce(u16) -> Packet,
    {
        let interval = self.initial_resend_interval();
        let (id, datagram) = self
            .reliable
            .send_reliable(now, interval, |id| build(id).encode())?;
        self.transmit(&datagram)?;
        Ok(id)
    }

    fn initial_resend_interval(&self) -> Duration {
        if self.config.resend_timeout.is_zero() {
            self.rtt.lock().resend_timeout()
        } else {
            self.config.resend_timeout
        }
    }

    /// Hand one datagram to the sink. A full socket buffer drops the datagram
    /// like any other loss; other errors are fatal.
    fn transmit(&self, datagram: &[u8]) -> Result<()> {
        match self.sink.write_bytes(datagram) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!(
                    remote = %self.remote,
                    len = datagram.len(),
                    "socket buffer full, datagram dropped"
                );
                Ok(())
            }
            Err(err) => {
                warn!(remote = %self.remote, error = %err, "datagram send failed");
                self.disconnect(DisconnectReason::SocketExceptionSend);
                Err(err.into())
            }
        }
    }

    /// Record an inbound reliable id, acknowledge it, and report whether its
    /// payload is new.
    fn receive_reliable(&self, id: u16) -> Result<bool> {
        let outcome = self.reliable.on_reliable_received(id);
        self.transmit(&outcome.ack.encode())?;
        if outcome.status == Received::Stale {
            debug!(remote = %self.remote, id, "re-acked stale reliable packet");
        }
        Ok(outcome.status == Received::New)
    }

    /// Entry point for every inbound datagram from this remote.
    pub fn handle_datagram(&self, datagram: &[u8], now: Instant) {
        let state = self.state();
        if state == ConnectionState::Disconnected {
            return;
        }
        if datagram.is_empty() {
            self.disconnect(DisconnectReason::ReceivedZeroBytes);
            return;
        }
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(remote = %self.remote, error = %err, "dropping malformed datagram");
                return;
            }
        };
        self.keep_alive.on_traffic(now);

        // A client only takes data once its handshake has been acknowledged;
        // unacknowledged reliable data is resent by the peer.
        if state == ConnectionState::Connecting
            && !matches!(
                packet,
                Packet::Ack { .. } | Packet::Ping | Packet::Pong | Packet::Disconnect
            )
        {
            trace!(remote = %self.remote, option = ?packet.send_option(), "ignored while connecting");
            return;
        }

        if let Err(err) = self.dispatch(packet, now) {
            debug!(remote = %self.remote, error = %err, "inbound datagram rejected");
        }
    }

    fn dispatch(&self, packet: Packet, now: Instant) -> Result<()> {
        match packet {
            Packet::Unreliable { payload } => self.deliver(payload),
            Packet::ReliableUnordered { id, payload } => {
                if self.receive_reliable(id)? {
                    self.deliver(payload);
                }
            }
            Packet::ReliableOrdered {
                id,
                sequence,
                payload,
            } => {
                if self.receive_reliable(id)? {
                    self.deliver_ordered(sequence, payload)?;
                }
            }
            Packet::Fragment {
                id,
                fragment,
                chunk,
            } => {
                // A fragment the assembler would reject is not acknowledged.
                self.assembler.validate(&fragment, chunk.len())?;
                if self.receive_reliable(id)? {
                    if let Some(message) = self.assembler.on_fragment_received(fragment, chunk)? {
                        self.deliver_reassembled(message)?;
                    }
                }
            }
            Packet::Handshake { id, .. } => {
                // Retransmitted handshake: our ack was lost.
                self.receive_reliable(id)?;
            }
            Packet::Ack { id, bitfield } => self.on_ack(id, bitfield, now),
            Packet::Ping => self.transmit(&Packet::Pong.encode())?,
            Packet::Pong => {
                if let Some(sample) = self.keep_alive.on_pong(now) {
                    self.rtt.lock().update(sample);
                }
            }
            Packet::Disconnect => {
                self.disconnect(DisconnectReason::ConnectionDisconnected);
            }
        }
        Ok(())
    }

    fn on_ack(&self, id: u16, bitfield: u32, now: Instant) {
        let acked = self.reliable.on_ack(id, bitfield, now);
        if let Some(sample) = acked.rtt_sample {
            self.rtt.lock().update(sample);
        }
        if self.state() != ConnectionState::Connecting {
            return;
        }
        let handshake_id = self.handshake.lock().id;
        if !handshake_id.is_some_and(|hid| acked.ids.contains(&hid)) {
            return;
        }
        match self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            Ok(()) => debug!(remote = %self.remote, "connected"),
            Err(err) => trace!(remote = %self.remote, error = %err, "handshake ack ignored"),
        }
    }

    /// Move from `from` to `to`, failing if another path changed the state
    /// first.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| TetherStreamError::InvalidStateTransition {
                from: ConnectionState::from_u8(actual).to_string(),
                to: to.to_string(),
            })
    }

    fn deliver(&self, payload: Bytes) {
        self.events.push(ConnectionEvent::Message(payload));
    }

    /// Released payloads are queued under the ordering lock so that runs
    /// drained by concurrent receivers cannot interleave.
    fn deliver_ordered(&self, sequence: u8, payload: Bytes) -> Result<()> {
        self.ordering
            .on_ordered_received_with(sequence, payload, |released| self.deliver(released))?;
        Ok(())
    }

    fn deliver_reassembled(&self, message: Reassembled) -> Result<()> {
        trace!(
            remote = %self.remote,
            message_id = message.message_id,
            len = message.payload.len(),
            "message reassembled"
        );
        match message.sequence {
            Some(sequence) => self.deliver_ordered(sequence, message.payload),
            None => {
                self.deliver(message.payload);
                Ok(())
            }
        }
    }

    /// Drive the handshake timeout, retransmission and keep-alive timers.
    pub fn tick(&self, now: Instant) {
        let state = self.state();
        match state {
            ConnectionState::Disconnected => return,
            ConnectionState::Connecting => {
                let started = self.handshake.lock().started;
                if now.saturating_duration_since(started) >= self.config.disconnect_timeout {
                    self.disconnect(DisconnectReason::HandshakeTimeout);
                    return;
                }
            }
            ConnectionState::Connected => {}
        }

        let outcome = self.reliable.on_timer_tick(now);
        if let Some(id) = outcome.exhausted {
            warn!(remote = %self.remote, id, "reliable packet exhausted its resends");
            let reason = if state == ConnectionState::Connecting {
                DisconnectReason::HandshakeTimeout
            } else {
                DisconnectReason::ReliablePacketWithoutResponse
            };
            self.disconnect(reason);
            return;
        }
        for datagram in &outcome.resend {
            if self.transmit(datagram).is_err() {
                return;
            }
        }

        if state != ConnectionState::Connected {
            return;
        }
        match self.keep_alive.on_tick(now) {
            KeepAliveAction::Idle => {}
            KeepAliveAction::SendPing => {
                trace!(remote = %self.remote, missed = self.keep_alive.missed_pongs(), "sending ping");
                if self.transmit(&Packet::Ping.encode()).is_err() {
                    return;
                }
            }
            KeepAliveAction::Disconnect => {
                self.disconnect(DisconnectReason::PingsWithoutResponse);
            }
        }
    }

    /// Report a failure of the receive half of the socket.
    pub fn report_receive_error(&self, err: &io::Error) {
        warn!(remote = %self.remote, error = %err, "datagram receive failed");
        self.disconnect(DisconnectReason::SocketExceptionReceive);
    }

    /// Close the connection, notifying the remote. Idempotent.
    pub fn close(&self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        if let Err(err) = self.sink.write_bytes(&Packet::Disconnect.encode()) {
            debug!(remote = %self.remote, error = %err, "disconnect notification not sent");
        }
        self.disconnect(DisconnectReason::ConnectionDisconnected);
    }

    /// Enter `Disconnected` and release all engine state. Only the first call
    /// has any effect; returns whether this call performed the transition.
    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        let previous = self
            .state
            .swap(ConnectionState::Disconnected as u8, Ordering::AcqRel);
        if previous == ConnectionState::Disconnected as u8 {
            return false;
        }
        *self.disconnect_reason.lock() = Some(reason);
        self.reliable.teardown();
        self.assembler.clear();
        self.ordering.clear();
        debug!(
            remote = %self.remote,
            from = %ConnectionState::from_u8(previous),
            %reason,
            "disconnected"
        );
        self.events.push(ConnectionEvent::Disconnected(reason));
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
