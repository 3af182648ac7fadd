//! Per-connection configuration.

use std::time::Duration;

use crate::error::{Result, TetherStreamError};

/// Settings supplied when a connection is created.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Initial resend interval. Zero derives it from the round-trip estimate.
    pub resend_timeout: Duration,
    /// Retries per reliable packet before the connection is dropped.
    /// Zero means unlimited.
    pub resend_limit: u32,
    /// Factor applied to a packet's resend interval after each resend.
    pub resend_backoff: f64,
    /// Time allowed for the handshake to be acknowledged.
    pub disconnect_timeout: Duration,
    /// Silence after which a ping is sent. Zero disables keep-alive.
    pub keep_alive_interval: Duration,
    /// Consecutive silent intervals tolerated before disconnecting.
    pub missed_pings_threshold: u32,
    /// Largest payload carried by a single datagram.
    pub max_fragment_size: usize,
    /// Largest message accepted for reassembly.
    pub max_message_size: usize,
    /// Treat any inbound packet as proof of life, not only pongs.
    pub pong_on_any_traffic: bool,
    /// Period of the timer driver.
    pub tick_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            resend_timeout: Duration::ZERO,
            resend_limit: 0,
            resend_backoff: 1.5,
            disconnect_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_millis(1500),
            missed_pings_threshold: 6,
            max_fragment_size: 1024,
            max_message_size: 1024 * 1024,
            pong_on_any_traffic: true,
            tick_interval: Duration::from_millis(10),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.resend_backoff.is_finite() || self.resend_backoff < 1.0 {
            return Err(TetherStreamError::InvalidConfig(format!(
                "resend_backoff must be at least 1.0, got {}",
                self.resend_backoff
            )));
        }
        if self.max_fragment_size == 0 {
            return Err(TetherStreamError::InvalidConfig(
                "max_fragment_size must be non-zero".into(),
            ));
        }
        if self.max_message_size < self.max_fragment_size {
            return Err(TetherStreamError::InvalidConfig(format!(
                "max_message_size {} is smaller than max_fragment_size {}",
                self.max_message_size, self.max_fragment_size
            )));
        }
        let fragment_bound = self.max_fragment_size.saturating_mul(u16::MAX as usize);
        if self.max_message_size > fragment_bound {
            return Err(TetherStreamError::InvalidConfig(format!(
                "max_message_size {} needs more than {} fragments",
                self.max_message_size,
                u16::MAX
            )));
        }
        if self.tick_interval.is_zero() {
            return Err(TetherStreamError::InvalidConfig(
                "tick_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
