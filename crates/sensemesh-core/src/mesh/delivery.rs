//! Reliable delivery: in-flight log, ack timer and retry budget
//!
//! A node keeps at most one unacknowledged message outstanding. Sending a
//! data message or discovery request records a copy and arms the timer.
//! A matching ack (or, for discovery, any accepted reply) clears the
//! entry. When the timer expires the log is replayed onto the outbound
//! queue; after `max_retries` expirations the caller evicts its current
//! next hop.
//!
//! ```text
//!            send              ack / reply
//!   idle ──────────► armed ─────────────────► idle
//!                      │ timeout
//!                      ▼
//!              retry_count += 1 ──► requeue log ──► idle
//!                      │ retry_count == max
//!                      ▼
//!               exhausted: evict next hop, retry_count = 0
//! ```

use super::packet::Message;
use super::queue::DedupQueue;
use std::time::Duration;
use tracing::debug;

/// Outcome of an ack timer expiry
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExpiry {
    /// Messages to put back on the outbound queue, oldest first
    pub requeue: Vec<Message>,
    /// The retry budget ran out on this expiry
    pub exhausted: bool,
}

/// Per-node delivery state
#[derive(Debug, Clone)]
pub struct DeliveryState {
    in_flight: DedupQueue<Message>,
    retry_count: u8,
    armed_at: Option<Duration>,
    ack_timeout: Duration,
    max_retries: u8,
}

impl DeliveryState {
    pub fn new(ack_timeout: Duration, max_retries: u8) -> Self {
        Self {
            in_flight: DedupQueue::new(),
            retry_count: 0,
            armed_at: None,
            ack_timeout,
            max_retries,
        }
    }

    /// True while the ack timer is running
    pub fn is_awaiting_ack(&self) -> bool {
        self.armed_at.is_some()
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &Message> {
        self.in_flight.iter()
    }

    /// Note that `message` was handed to the radio at `now`
    ///
    /// Only data messages and discovery requests are tracked; anything
    /// else is ignored.
    pub fn record_sent(&mut self, message: &Message, now: Duration) {
        if !message.awaits_reply() {
            return;
        }
        self.in_flight.push_back(message.clone());
        if self.armed_at.is_none() {
            self.armed_at = Some(now);
        }
    }

    /// Match an ack against the in-flight log
    ///
    /// Removes only the data entry carrying `nonce`. Returns false when
    /// nothing matched, in which case timer and counter are untouched.
    pub fn on_ack(&mut self, nonce: u16) -> bool {
        let matched = self
            .in_flight
            .remove_first_matching(|m| m.nonce() == Some(nonce));
        if matched {
            self.retry_count = 0;
            if self.in_flight.is_empty() {
                self.armed_at = None;
            }
        }
        matched
    }

    /// An accepted discovery reply satisfies every outstanding request
    pub fn on_discovery_satisfied(&mut self) {
        let purged = self
            .in_flight
            .retain(|m| !matches!(m, Message::DiscoveryRequest));
        if purged > 0 && self.in_flight.is_empty() {
            self.armed_at = None;
            self.retry_count = 0;
        }
    }

    /// Check the ack timer at `now`
    ///
    /// Returns `None` while the timer is idle or has not yet expired.
    /// Discovery copies are dropped on expiry rather than replayed; route
    /// discovery regenerates them while the node stays isolated.
    pub fn poll_timer(&mut self, now: Duration) -> Option<RetryExpiry> {
        let armed_at = self.armed_at?;
        if now.saturating_sub(armed_at) < self.ack_timeout {
            return None;
        }

        self.armed_at = None;
        self.retry_count = self.retry_count.saturating_add(1);
        self.in_flight
            .retain(|m| !matches!(m, Message::DiscoveryRequest));
        let requeue = self.in_flight.drain();

        let exhausted = self.retry_count >= self.max_retries;
        if exhausted {
            self.retry_count = 0;
        }
        debug!(
            retry = self.retry_count,
            requeued = requeue.len(),
            exhausted,
            "Ack timer expired"
        );

        Some(RetryExpiry { requeue, exhausted })
    }
}
