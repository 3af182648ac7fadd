//! Keep-alive and liveness monitor.
//!
//! The monitor counts whole keep-alive intervals of inbound silence. Each
//! silent interval is one missed pong and triggers one ping; once the count
//! reaches the threshold the connection is declared dead. Any inbound packet
//! (or only pongs, when `pong_on_any_traffic` is off) resets the count.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// What the connection should do after a keep-alive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    Disconnect,
}

struct LivenessState {
    last_traffic: Instant,
    ping_sent_at: Option<Instant>,
    missed_pongs: u32,
}

pub struct KeepAlive {
    interval: Duration,
    threshold: u32,
    pong_on_any_traffic: bool,
    state: Mutex<LivenessState>,
}

impl KeepAlive {
    pub fn new(interval: Duration, threshold: u32, pong_on_any_traffic: bool, now: Instant) -> Self {
        Self {
            interval,
            threshold,
            pong_on_any_traffic,
            state: Mutex::new(LivenessState {
                last_traffic: now,
                ping_sent_at: None,
                missed_pongs: 0,
            }),
        }
    }

    /// A zero interval or threshold turns the monitor off.
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero() && self.threshold > 0
    }

    pub fn on_tick(&self, now: Instant) -> KeepAliveAction {
        if !self.is_enabled() {
            return KeepAliveAction::Idle;
        }
        let mut state = self.state.lock();
        let silent = now.saturating_duration_since(state.last_traffic);
        let missed = (silent.as_nanos() / self.interval.as_nanos()).min(u32::MAX as u128) as u32;
        state.missed_pongs = missed;

        if missed >= self.threshold {
            return KeepAliveAction::Disconnect;
        }
        if missed == 0 {
            return KeepAliveAction::Idle;
        }
        let due = state
            .ping_sent_at
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.interval);
        if due {
            state.ping_sent_at = Some(now);
            KeepAliveAction::SendPing
        } else {
            KeepAliveAction::Idle
        }
    }

    /// Any inbound datagram. Counts as a pong when the monitor is lax.
    pub fn on_traffic(&self, now: Instant) {
        if self.pong_on_any_traffic {
            let mut state = self.state.lock();
            state.last_traffic = now;
            state.missed_pongs = 0;
        }
    }

    /// A pong arrived. Returns the round trip if a ping was outstanding.
    pub fn on_pong(&self, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock();
        let rtt = state
            .ping_sent_at
            .take()
            .map(|sent| now.saturating_duration_since(sent));
        state.last_traffic = now;
        state.missed_pongs = 0;
        rtt
    }

    pub fn missed_pongs(&self) -> u32 {
        self.state.lock().missed_pongs
    }

    /// Silence after which the monitor disconnects.
    pub fn timeout(&self) -> Duration {
        self.interval * self.threshold
    }
}
