//! Connection liveness.
//!
//! The monitor is a pure state machine driven by the manager's timer: it never touches
//! the socket itself, it only tells the manager when to send a heartbeat request and when
//! the connection must be considered dead.
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    /// The connection has been quiet for a full interval; ask the server for a reply.
    SendRequest,
    /// Nothing arrived within the timeout after the request. Reported once.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Watching,
    AwaitingReply { since: Instant },
    Expired,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_seen: Instant,
    phase: Phase,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_seen: now,
            phase: Phase::Watching,
        }
    }

    /// Any inbound frame proves liveness, not only heartbeat replies.
    pub fn on_frame_received(&mut self, now: Instant) {
        self.last_seen = now;
        if self.phase != Phase::Expired {
            self.phase = Phase::Watching;
        }
    }

    pub fn tick(&mut self, now: Instant) -> HeartbeatAction {
        match self.phase {
            Phase::Watching => {
                if now.saturating_duration_since(self.last_seen) > self.interval {
                    self.phase = Phase::AwaitingReply { since: now };
                    HeartbeatAction::SendRequest
                } else {
                    HeartbeatAction::Idle
                }
            }
            Phase::AwaitingReply { since } => {
                if now.saturating_duration_since(since) > self.timeout {
                    self.phase = Phase::Expired;
                    HeartbeatAction::TimedOut
                } else {
                    HeartbeatAction::Idle
                }
            }
            Phase::Expired => HeartbeatAction::Idle,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.phase == Phase::Expired
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
