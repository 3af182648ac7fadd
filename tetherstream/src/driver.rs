//! Tokio tasks that keep a [`Connection`] moving.
//!
//! The timer task calls [`Connection::tick`] every `tick_interval` and the
//! receive task feeds datagrams from a connected UDP socket into
//! [`Connection::handle_datagram`]. Both exit once the connection is
//! disconnected or dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connection::{Connection, ConnectionState};

/// Largest datagram the receive task accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// How often the receive task wakes to notice a disconnect.
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Spawn the timer task for `connection`. Holds only a weak reference.
pub fn spawn_driver(connection: &Arc<Connection>) -> JoinHandle<()> {
    let weak = Arc::downgrade(connection);
    let period = connection.config().tick_interval;
    tokio::spawn(run_timer(weak, period))
}

async fn run_timer(connection: Weak<Connection>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(connection) = connection.upgrade() else {
            tracing::trace!("connection dropped, timer exiting");
            return;
        };
        connection.tick(tokio::time::Instant::now().into_std());
        if connection.state() == ConnectionState::Disconnected {
            tracing::debug!(remote = %connection.remote(), "timer stopped");
            return;
        }
    }
}

/// Spawn a task reading datagrams from `socket`, which must be connected to
/// the connection's remote.
pub fn spawn_receiver(connection: &Arc<Connection>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
    let weak = Arc::downgrade(connection);
    tokio::spawn(run_receiver(weak, socket))
}

async fn run_receiver(connection: Weak<Connection>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::time::timeout(RECEIVE_POLL, socket.recv(&mut buf)).await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if connection.state() == ConnectionState::Disconnected {
            return;
        }
        match received {
            Err(_elapsed) => continue,
            Ok(Ok(len)) => {
                connection.handle_datagram(&buf[..len], tokio::time::Instant::now().into_std());
            }
            Ok(Err(err)) => {
                connection.report_receive_error(&err);
                return;
            }
        }
    }
}
