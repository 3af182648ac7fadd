//! Shared fixtures: in-memory sinks and a connected client/server pair.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tetherstream::{Connection, ConnectionConfig, ConnectionEvent, DatagramSink, Packet};

/// Records every datagram written to it. Can be switched to fail.
#[derive(Default)]
pub struct CaptureSink {
    sent: Mutex<Vec<Bytes>>,
    failing: AtomicBool,
}

impl CaptureSink {
    pub fn take(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn take_packets(&self) -> Vec<Packet> {
        self.take()
            .iter()
            .map(|datagram| Packet::decode(datagram).unwrap())
            .collect()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl DatagramSink for CaptureSink {
    fn write_bytes(&self, datagram: &[u8]) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "sink closed"));
        }
        self.sent.lock().push(Bytes::copy_from_slice(datagram));
        Ok(())
    }
}

pub fn client_addr() -> SocketAddr {
    "127.0.0.1:40001".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "127.0.0.1:40002".parse().unwrap()
}

pub struct Pair {
    pub client: Connection,
    pub client_sink: Arc<CaptureSink>,
    pub server: Connection,
    pub server_sink: Arc<CaptureSink>,
}

impl Pair {
    /// Connect a client and server with `config` and complete the handshake
    /// at `now`.
    pub fn connect(config: ConnectionConfig, now: Instant) -> Self {
        Self::connect_with(config.clone(), config, now)
    }

    /// Like [`Pair::connect`], with separate settings for each side.
    pub fn connect_with(
        client_config: ConnectionConfig,
        server_config: ConnectionConfig,
        now: Instant,
    ) -> Self {
        let client_sink = Arc::new(CaptureSink::default());
        let server_sink = Arc::new(CaptureSink::default());
        let client = Connection::connect(
            server_addr(),
            client_config,
            client_sink.clone(),
            Bytes::from_static(b"hello"),
            now,
        )
        .unwrap();
        let handshake = client_sink.take();
        assert_eq!(handshake.len(), 1);

        let server =
            Connection::accept(
                client_addr(),
                server_config,
                server_sink.clone(),
                &handshake[0],
                now,
            )
            .unwrap();
        let pair = Self {
            client,
            client_sink,
            server,
            server_sink,
        };
        pair.to_client(now);
        assert!(pair.client.is_connected());
        pair
    }

    /// Deliver everything the client sent to the server.
    pub fn to_server(&self, now: Instant) -> usize {
        deliver(&self.client_sink, &self.server, now)
    }

    /// Deliver everything the server sent to the client.
    pub fn to_client(&self, now: Instant) -> usize {
        deliver(&self.server_sink, &self.client, now)
    }

    /// Exchange datagrams until both directions are quiet.
    pub fn settle(&self, now: Instant) {
        while self.to_server(now) + self.to_client(now) > 0 {}
    }
}

pub fn deliver(sink: &CaptureSink, to: &Connection, now: Instant) -> usize {
    let datagrams = sink.take();
    for datagram in &datagrams {
        to.handle_datagram(datagram, now);
    }
    datagrams.len()
}

/// Payloads of every queued message event, in delivery order.
pub fn messages(connection: &Connection) -> Vec<Bytes> {
    connection
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            ConnectionEvent::Message(payload) => Some(payload),
            ConnectionEvent::Disconnected(_) => None,
        })
        .collect()
}
