//! Per-client liveness watchdog.
//!
//! Every armed client is challenged once per tick with a PING carrying a
//! fresh challenge; a PONG with `challenge + 1` resets its pending count.
//! A client that stays silent for `timeout` ticks is challenged one last
//! time and declared dead on the tick after that.
//!
//! `pending` doubles as the state encoding:
//!
//! | pending          | state        |
//! |------------------|--------------|
//! | `0xFFFF`         | `Disabled`   |
//! | `< timeout`      | `Armed`      |
//! | `== timeout`     | `Challenged` |
//! | `> timeout`      | `Dead`       |

use std::sync::Weak;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::protocol::QueueStall;

use super::registry::ClientInfo;
use super::CommManager;

/// Pending value of a client without an active watchdog.
pub const WATCHDOG_DISABLED: u32 = 0xFFFF;

/// Default number of silent ticks before a client is challenged for the
/// last time.
pub const DEFAULT_TIMEOUT_TICKS: u32 = 30;

/// Client name exempt from the watchdog unless configured otherwise.
pub const DEFAULT_BLACKLISTED: &str = "HMI";

/// Watchdog configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Silent ticks before the final challenge.
    pub timeout_ticks: u32,
    /// Tick period in milliseconds.
    pub tick_interval_ms: u64,
    /// Client names that never get a watchdog.
    pub blacklist: Vec<String>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
            tick_interval_ms: 1000,
            blacklist: vec![DEFAULT_BLACKLISTED.to_string()],
        }
    }
}

impl WatchdogConfig {
    /// Timeout, clamped below the disabled marker.
    pub fn timeout(&self) -> u32 {
        self.timeout_ticks.clamp(1, WATCHDOG_DISABLED - 2)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklist.iter().any(|n| n == name)
    }
}

/// Externally visible watchdog state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Disabled,
    Armed,
    Challenged,
    Dead,
}

/// What a tick did to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Idle,
    Ping(u32),
    Died,
}

#[derive(Debug, Clone)]
pub(crate) struct Watchdog {
    challenge: u32,
    pending: u32,
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self {
            challenge: 0,
            pending: WATCHDOG_DISABLED,
        }
    }

    pub(crate) fn state(&self, timeout: u32) -> WatchdogState {
        match self.pending {
            WATCHDOG_DISABLED => WatchdogState::Disabled,
            p if p < timeout => WatchdogState::Armed,
            p if p == timeout => WatchdogState::Challenged,
            _ => WatchdogState::Dead,
        }
    }

    pub(crate) fn arm(&mut self) {
        self.pending = 0;
    }

    pub(crate) fn disable(&mut self) {
        self.pending = WATCHDOG_DISABLED;
    }

    pub(crate) fn challenge(&self) -> u32 {
        self.challenge
    }

    /// Accept a PONG. Returns true if it answered the current challenge.
    pub(crate) fn on_pong(&mut self, response: u32, timeout: u32) -> bool {
        match self.state(timeout) {
            WatchdogState::Armed | WatchdogState::Challenged => {}
            WatchdogState::Disabled | WatchdogState::Dead => return false,
        }
        if response != self.challenge.wrapping_add(1) {
            return false;
        }
        self.pending = 0;
        true
    }

    /// A dispatch queue of this client reported a stalled handler.
    ///
    /// Leaves the client one silent tick away from its final challenge and
    /// invalidates any PING still in flight.
    pub(crate) fn on_queue_expired(&mut self, timeout: u32) {
        match self.state(timeout) {
            WatchdogState::Armed | WatchdogState::Challenged => {}
            WatchdogState::Disabled | WatchdogState::Dead => return,
        }
        self.pending = timeout - 1;
        self.challenge = self.challenge.wrapping_add(1);
    }

    pub(crate) fn tick(&mut self, timeout: u32) -> Tick {
        match self.state(timeout) {
            WatchdogState::Disabled | WatchdogState::Dead => Tick::Idle,
            WatchdogState::Armed => {
                self.pending += 1;
                self.challenge = self.challenge.wrapping_add(1);
                Tick::Ping(self.challenge)
            }
            WatchdogState::Challenged => {
                self.pending += 1;
                self.challenge = self.challenge.wrapping_add(1);
                Tick::Died
            }
        }
    }
}

/// Receiver of liveness notifications.
///
/// Called outside the manager's lock; implementations may call back into
/// the manager.
pub trait WatchdogListener: Send + Sync {
    /// A client stopped answering PING. Fired once per death.
    fn com_channel_died(&self, client: &ClientInfo);

    /// A client's dispatch queue reported a handler that took too long.
    fn com_queue_watchdog(&self, client: &ClientInfo, stall: &QueueStall);
}

/// Handle to the running tick task.
pub(crate) struct TickerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TickerHandle {
    /// Signal the task to stop without waiting for it.
    pub(crate) fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Signal the task and wait for it to exit.
    pub(crate) async fn join(self) {
        self.stop();
        let _ = self.task.await;
    }
}

/// Tick schedule that never bursts: after a stall the next tick is a full
/// period away.
fn tick_schedule(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Spawn the periodic watchdog tick.
///
/// Holds only a weak reference so a dropped manager ends the task.
pub(crate) fn spawn_ticker(manager: Weak<CommManager>, interval: Duration) -> TickerHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tick_schedule(interval);
        // First tick completes immediately; skip it so clients get a full period.
        ticker.tick().await;
        info!(interval = ?interval, "Watchdog ticker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else {
                        debug!("Manager dropped, stopping watchdog ticker");
                        break;
                    };
                    manager.watchdog_tick();
                }
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!("Watchdog ticker stopped");
                        break;
                    }
                }
            }
        }
    });

    TickerHandle {
        cancel: cancel_tx,
        task,
    }
}
