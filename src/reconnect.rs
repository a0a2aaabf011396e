use std::time::Duration;
use tokio::time::Instant;

// ═══════════════════════════════════════════════════════════════════════
//  Reconnect backoff
// ═══════════════════════════════════════════════════════════════════════

/// Exponential reconnect backoff with a single outstanding timer.
///
/// Delay for attempt `n` is `min(base * 2^n, max)`. The pending deadline is
/// the only timer handle: while it is set, further failures are ignored, so
/// a health-check failure racing a socket error never schedules twice.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    pending: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff { base, max, attempt: 0, pending: None }
    }

    /// Delay the next failure would schedule.
    pub fn next_delay(&self) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(self.attempt)).min(self.max)
    }

    /// Record a failure and schedule a reconnect.
    ///
    /// Returns the scheduled delay, or `None` if a reconnect is already
    /// pending.
    pub fn on_failure(&mut self, now: Instant) -> Option<Duration> {
        if self.pending.is_some() {
            return None;
        }
        let delay = self.next_delay();
        self.attempt = self.attempt.saturating_add(1);
        self.pending = Some(now + delay);
        Some(delay)
    }

    /// Handshake completed: the next failure starts from `base` again.
    pub fn on_ready(&mut self) {
        self.attempt = 0;
    }

    pub fn cancel_pending(&mut self) {
        self.pending = None;
    }

    /// The pending timer fired. Returns `false` if nothing was pending.
    pub fn fire(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Ping liveness
// ═══════════════════════════════════════════════════════════════════════

/// Tracks the last device-initiated ping.
///
/// The device pings the client periodically; silence longer than `timeout`
/// means the link is dead even if the socket still looks open.
#[derive(Debug, Clone)]
pub struct Liveness {
    timeout: Duration,
    last_seen: Instant,
}

impl Liveness {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Liveness { timeout, last_seen: now }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn since_last(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.since_last(now) > self.timeout
    }
}
