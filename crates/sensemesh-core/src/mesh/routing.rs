//! Level-based route discovery
//!
//! Each node tracks its hop distance to the sink (its *level*) and an
//! ordered list of neighbors one level closer. The sink sits at level 0.
//!
//! ```text
//!   sink (0) ◄── A (1) ◄── B (2) ◄── C (3)
//!                 ▲                   │
//!                 └──── D (1) ◄───────┘   C keeps every level-2 neighbor
//!                                         it hears; a level-1 reply would
//!                                         reset its list to that one node
//! ```
//!
//! A reply advertising level `L` is accepted only when `L + 1` is no worse
//! than the current level. A strictly better reply resets the next-hop list
//! instead of merging into it, so the level always equals the best known
//! neighbor level plus one.

use super::packet::{Message, NodeAddress};
use super::queue::DedupQueue;
use tracing::{debug, info};

/// Result of processing a discovery reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The advertised level is worse than ours (or we are the sink)
    Rejected,
    /// The sender joined the existing next-hop list at our current level
    Joined,
    /// A strictly better level was adopted; the list now holds only the sender
    Improved { level: u32 },
}

impl ReplyOutcome {
    pub fn is_accepted(self) -> bool {
        !matches!(self, ReplyOutcome::Rejected)
    }
}

/// Per-node routing state
#[derive(Debug, Clone)]
pub struct RouteState {
    level: Option<u32>,
    next_hops: DedupQueue<NodeAddress>,
    sink: bool,
}

impl RouteState {
    /// Routing state for a sensor node: level unknown, no next hops
    pub fn new() -> Self {
        Self {
            level: None,
            next_hops: DedupQueue::new(),
            sink: false,
        }
    }

    /// Routing state for the sink: fixed at level 0, never isolated
    pub fn sink() -> Self {
        Self {
            level: Some(0),
            next_hops: DedupQueue::new(),
            sink: true,
        }
    }

    pub fn level(&self) -> Option<u32> {
        self.level
    }

    pub fn is_sink(&self) -> bool {
        self.sink
    }

    /// True when no next hop is known
    pub fn is_isolated(&self) -> bool {
        !self.sink && self.next_hops.is_empty()
    }

    /// Current preferred relay
    pub fn next_hop(&self) -> Option<NodeAddress> {
        self.next_hops.front().copied()
    }

    pub fn next_hops(&self) -> impl Iterator<Item = &NodeAddress> {
        self.next_hops.iter()
    }

    pub fn next_hop_count(&self) -> usize {
        self.next_hops.len()
    }

    /// Drop the level once the last next hop is gone; returns `is_isolated()`
    pub fn refresh_isolation(&mut self) -> bool {
        if self.is_isolated() {
            if self.level.take().is_some() {
                info!("Lost all next hops, level reset");
            }
            return true;
        }
        false
    }

    /// Reply to a discovery request, if we have anything to offer
    pub fn reply_for_request(&self, self_address: NodeAddress) -> Option<Message> {
        if self.is_isolated() {
            return None;
        }
        self.level
            .map(|level| Message::discovery_reply(level, self_address))
    }

    /// Process a discovery reply advertising `level` from `origin`
    pub fn on_discovery_reply(&mut self, level: u32, origin: NodeAddress) -> ReplyOutcome {
        if self.sink {
            return ReplyOutcome::Rejected;
        }
        let Some(candidate) = level.checked_add(1) else {
            return ReplyOutcome::Rejected;
        };

        let outcome = match self.level {
            Some(current) if candidate > current => return ReplyOutcome::Rejected,
            Some(current) if candidate == current => ReplyOutcome::Joined,
            _ => {
                if self.level.is_none() {
                    info!(level = candidate, via = %origin, "Connected to mesh");
                } else {
                    info!(level = candidate, via = %origin, "Found better route");
                }
                self.level = Some(candidate);
                self.next_hops.clear();
                ReplyOutcome::Improved { level: candidate }
            }
        };

        if self.next_hops.push_back(origin) {
            debug!(next_hop = %origin, level = candidate, "Added next hop");
        }
        outcome
    }

    /// Evict the head next hop after its retry budget ran out
    pub fn evict_head(&mut self) -> Option<NodeAddress> {
        self.next_hops.pop_front()
    }
}

impl Default for RouteState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: u16) -> NodeAddress {
        NodeAddress::from_index(i)
    }

    #[test]
    fn test_initial_state_is_isolated() {
        let state = RouteState::new();
        assert!(state.is_isolated());
        assert_eq!(state.level(), None);
        assert_eq!(state.next_hop(), None);
    }

    #[test]
    fn test_reply_from_sink_sets_level_one() {
        let mut state = RouteState::new();
        let sink = NodeAddress::parse("AA:BB:CC:DD:EE:01").unwrap();
        let outcome = state.on_discovery_reply(0, sink);
        assert_eq!(outcome, ReplyOutcome::Improved { level: 1 });
        assert_eq!(state.level(), Some(1));
        assert_eq!(state.next_hop(), Some(sink));
        assert!(!state.is_isolated());
    }

    #[test]
    fn test_equal_reply_joins_and_worse_is_rejected() {
        let mut state = RouteState::new();
        state.on_discovery_reply(1, addr(1));
        assert_eq!(state.on_discovery_reply(1, addr(2)), ReplyOutcome::Joined);
        assert_eq!(state.on_discovery_reply(2, addr(3)), ReplyOutcome::Rejected);
        assert_eq!(state.level(), Some(2));
        assert_eq!(state.next_hops().copied().collect::<Vec<_>>(), vec![addr(1), addr(2)]);
    }

    #[test]
    fn test_better_reply_replaces_next_hops() {
        let mut state = RouteState::new();
        state.on_discovery_reply(2, addr(1));
        state.on_discovery_reply(2, addr(2));
        assert_eq!(state.next_hop_count(), 2);

        assert_eq!(
            state.on_discovery_reply(0, addr(9)),
            ReplyOutcome::Improved { level: 1 }
        );
        assert_eq!(state.next_hops().copied().collect::<Vec<_>>(), vec![addr(9)]);
    }

    #[test]
    fn test_repeated_reply_is_deduplicated() {
        let mut state = RouteState::new();
        state.on_discovery_reply(0, addr(1));
        assert_eq!(state.on_discovery_reply(0, addr(1)), ReplyOutcome::Joined);
        assert_eq!(state.next_hop_count(), 1);
    }

    #[test]
    fn test_isolated_node_does_not_reply() {
        let state = RouteState::new();
        assert_eq!(state.reply_for_request(addr(5)), None);

        let mut state = RouteState::new();
        state.on_discovery_reply(0, addr(1));
        assert_eq!(
            state.reply_for_request(addr(5)),
            Some(Message::discovery_reply(1, addr(5)))
        );
    }

    #[test]
    fn test_eviction_leads_to_isolation() {
        let mut state = RouteState::new();
        state.on_discovery_reply(0, addr(1));
        assert!(!state.refresh_isolation());

        assert_eq!(state.evict_head(), Some(addr(1)));
        assert!(state.refresh_isolation());
        assert_eq!(state.level(), None);

        // Any level is acceptable again once isolated
        assert_eq!(
            state.on_discovery_reply(4, addr(2)),
            ReplyOutcome::Improved { level: 5 }
        );
    }

    #[test]
    fn test_sink_is_fixed_at_level_zero() {
        let mut state = RouteState::sink();
        assert!(!state.is_isolated());
        assert!(!state.refresh_isolation());
        assert_eq!(state.on_discovery_reply(0, addr(2)), ReplyOutcome::Rejected);
        assert_eq!(state.level(), Some(0));
        assert_eq!(
            state.reply_for_request(addr(1)),
            Some(Message::discovery_reply(0, addr(1)))
        );
    }

    #[test]
    fn test_level_overflow_is_rejected() {
        let mut state = RouteState::new();
        assert_eq!(
            state.on_discovery_reply(u32::MAX, addr(1)),
            ReplyOutcome::Rejected
        );
        assert!(state.is_isolated());
    }
}
