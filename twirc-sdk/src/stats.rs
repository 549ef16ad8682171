//! Traffic accounting and the adaptive keepalive heuristic.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Totals for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Traffic {
    pub lines_received: u64,
    pub bytes_received: u64,
    pub lines_sent: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    index: u64,
    lines: u32,
    bytes: u64,
}

/// Received traffic counted in fixed-size time buckets over a sliding window.
///
/// Window length and bucket granularity are fixed at construction. Besides the
/// per-bucket counts, the stats remember which buckets saw traffic since the
/// last keepalive check; that count drives [`Keepalive`].
#[derive(Debug)]
pub struct ActivityStats {
    window: Duration,
    granularity: Duration,
    origin: Instant,
    buckets: VecDeque<Bucket>,
    /// Bucket indices touched since the last `mark_checked`, ascending.
    since_check: VecDeque<u64>,
    traffic: Traffic,
}

impl ActivityStats {
    pub fn new(window: Duration, granularity: Duration, now: Instant) -> Self {
        let granularity = granularity.max(Duration::from_secs(1));
        Self {
            window: window.max(granularity),
            granularity,
            origin: now,
            buckets: VecDeque::new(),
            since_check: VecDeque::new(),
            traffic: Traffic::default(),
        }
    }

    pub fn record_received(&mut self, bytes: usize, now: Instant) {
        self.traffic.lines_received += 1;
        self.traffic.bytes_received += bytes as u64;

        let index = self.bucket_index(now);
        match self.buckets.back_mut() {
            Some(bucket) if bucket.index == index => {
                bucket.lines += 1;
                bucket.bytes += bytes as u64;
            }
            _ => self.buckets.push_back(Bucket { index, lines: 1, bytes: bytes as u64 }),
        }
        if self.since_check.back() != Some(&index) {
            self.since_check.push_back(index);
        }
        self.prune(now);
    }

    /// Outbound traffic only counts toward the totals: our own writes say
    /// nothing about whether the peer is still there.
    pub fn record_sent(&mut self, bytes: usize) {
        self.traffic.lines_sent += 1;
        self.traffic.bytes_sent += bytes as u64;
    }

    /// Number of buckets inside the window that saw traffic since the last
    /// keepalive check.
    pub fn recent_activity(&self, now: Instant) -> usize {
        let oldest = self.oldest_index(now);
        self.since_check.iter().filter(|&&i| i >= oldest).count()
    }

    /// Lines received inside the window.
    pub fn recent_lines(&self, now: Instant) -> u64 {
        let oldest = self.oldest_index(now);
        self.buckets
            .iter()
            .filter(|b| b.index >= oldest)
            .map(|b| u64::from(b.lines))
            .sum()
    }

    /// Bytes received inside the window.
    pub fn recent_bytes(&self, now: Instant) -> u64 {
        let oldest = self.oldest_index(now);
        self.buckets.iter().filter(|b| b.index >= oldest).map(|b| b.bytes).sum()
    }

    pub fn mark_checked(&mut self) {
        self.since_check.clear();
    }

    pub fn traffic(&self) -> Traffic {
        self.traffic
    }

    fn slots(&self) -> u64 {
        (self.window.as_secs() / self.granularity.as_secs()).max(1)
    }

    fn bucket_index(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_secs() / self.granularity.as_secs()
    }

    fn oldest_index(&self, now: Instant) -> u64 {
        (self.bucket_index(now) + 1).saturating_sub(self.slots())
    }

    fn prune(&mut self, now: Instant) {
        let oldest = self.oldest_index(now);
        while self.buckets.front().is_some_and(|b| b.index < oldest) {
            self.buckets.pop_front();
        }
        while self.since_check.front().is_some_and(|&i| i < oldest) {
            self.since_check.pop_front();
        }
    }
}

/// Decides when an idle connection gets probed with a PING.
///
/// Every read timeout is one tick. A PING is due once
/// `ticks * check_interval >= ping_timeout * factor`, where
/// `factor = 1 + recent_activity / 2`: the busier the link has been, the
/// longer it may stay quiet before being probed.
#[derive(Debug, Clone)]
pub struct Keepalive {
    check_interval: Duration,
    ping_timeout: Duration,
    check_count: u32,
}

impl Keepalive {
    pub fn new(check_interval: Duration, ping_timeout: Duration) -> Self {
        Self {
            check_interval,
            ping_timeout,
            check_count: 0,
        }
    }

    pub fn stats_factor(recent_activity: usize) -> f64 {
        1.0 + recent_activity as f64 / 2.0
    }

    /// Count one read timeout. Returns true when a PING should be sent; the
    /// tick counter restarts in that case.
    pub fn tick(&mut self, recent_activity: usize) -> bool {
        self.check_count += 1;
        let elapsed = f64::from(self.check_count) * self.check_interval.as_secs_f64();
        let threshold = self.ping_timeout.as_secs_f64() * Self::stats_factor(recent_activity);
        if elapsed >= threshold {
            self.check_count = 0;
            true
        } else {
            false
        }
    }

    pub fn check_count(&self) -> u32 {
        self.check_count
    }
}
