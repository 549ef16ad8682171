//! Delayed reconnection after an unexpected disconnect.
//!
//! The consumer decides whether to retry (usually from its handler for
//! [`crate::event::Event::Disconnected`]); this module decides how long to wait
//! and when to give up. At most one retry timer exists at a time.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{DEFAULT_RECONNECT_DELAYS, EngineConfig};
use crate::error::{Error, Result};
use crate::state::DisconnectReason;

/// Backoff table plus attempt bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    /// An empty table falls back to the default one.
    pub fn new(delays_secs: &[u64], max_attempts: u32) -> Self {
        let table = if delays_secs.is_empty() {
            &DEFAULT_RECONNECT_DELAYS[..]
        } else {
            delays_secs
        };
        Self {
            delays: table.iter().copied().map(Duration::from_secs).collect(),
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.reconnect_delays, config.max_reconnect_attempts)
    }

    /// Delay for the next retry, or `None` once the attempts are used up.
    ///
    /// The table's last entry is reused past its end. An unknown host always
    /// waits the longest delay in the table.
    pub fn next_delay(&self, reason: &DisconnectReason) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        if *reason == DisconnectReason::UnknownHost {
            return Some(self.max_delay());
        }
        let index = (self.attempts as usize).min(self.delays.len() - 1);
        Some(self.delays[index])
    }

    pub fn max_delay(&self) -> Duration {
        self.delays.iter().copied().max().unwrap_or_default()
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[derive(Debug)]
struct PendingRetry {
    id: u64,
    handle: JoinHandle<()>,
}

/// Owns the policy and the single pending retry timer.
#[derive(Debug)]
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
    pending: Option<PendingRetry>,
    next_id: u64,
}

/// A retry that was just scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub id: u64,
    pub delay: Duration,
    /// 1-based number of the attempt this timer will make.
    pub attempt: u32,
}

impl ReconnectScheduler {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            pending: None,
            next_id: 0,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Start a retry timer. `spawn` receives the timer id and delay and must
    /// start the task that sleeps and then calls [`Self::fire`] with that id.
    pub fn schedule<F>(&mut self, reason: &DisconnectReason, spawn: F) -> Result<ScheduledRetry>
    where
        F: FnOnce(u64, Duration) -> JoinHandle<()>,
    {
        if self.pending.is_some() {
            return Err(Error::ReconnectPending);
        }
        let Some(delay) = self.policy.next_delay(reason) else {
            return Err(Error::AttemptsExhausted {
                attempts: self.policy.attempts(),
            });
        };
        self.next_id += 1;
        let id = self.next_id;
        let handle = spawn(id, delay);
        self.pending = Some(PendingRetry { id, handle });
        Ok(ScheduledRetry {
            id,
            delay,
            attempt: self.policy.attempts() + 1,
        })
    }

    /// Called by the timer task when its delay has elapsed. Returns false if
    /// the timer was cancelled or superseded, in which case it must not
    /// reconnect. Counts the attempt otherwise.
    pub fn fire(&mut self, id: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.id == id => {
                self.pending = None;
                self.policy.record_attempt();
                true
            }
            _ => false,
        }
    }

    /// Cancel the pending timer, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.policy.reset();
    }
}
