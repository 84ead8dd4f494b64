//! Ordered queue with duplicate suppression
//!
//! All four per-node queues (outbound, inbound, in-flight log and next
//! hops) share this container. Inserting an item that is already present
//! anywhere in the queue is a no-op, so repeated enqueues of the same
//! discovery request or ack never pile up.
//!
//! `push_back`/`pop_front` give FIFO order; `push_front` lets replies and
//! acks jump ahead of routine traffic.

use std::collections::VecDeque;

/// FIFO queue that ignores inserts of items it already holds
#[derive(Debug, Clone, PartialEq)]
pub struct DedupQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for DedupQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T: PartialEq> DedupQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless an equal item is present; returns true if inserted
    pub fn push_back(&mut self, item: T) -> bool {
        if self.contains(&item) {
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Prepend unless an equal item is present; returns true if inserted
    pub fn push_front(&mut self, item: T) -> bool {
        if self.contains(&item) {
            return false;
        }
        self.items.push_front(item);
        true
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.iter().any(|existing| existing == item)
    }

    /// Remove the first item matching `predicate`; returns true if one was removed
    pub fn remove_first_matching<F>(&mut self, predicate: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        match self.items.iter().position(predicate) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Keep only items matching `predicate`; returns the number removed
    pub fn retain<F>(&mut self, predicate: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.items.len();
        self.items.retain(predicate);
        before - self.items.len()
    }

    /// Remove and return every item in order
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::packet::Message;
    use proptest::prelude::*;

    #[test]
    fn test_fifo_order() {
        let mut q = DedupQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(2));
        assert_eq!(q.pop_front(), Some(3));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn test_push_front_takes_priority() {
        let mut q = DedupQueue::new();
        q.push_back("data");
        assert!(q.push_front("ack"));
        assert_eq!(q.front(), Some(&"ack"));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_duplicates_are_ignored_at_either_end() {
        let mut q = DedupQueue::new();
        assert!(q.push_back(Message::ack(1000)));
        assert!(!q.push_back(Message::ack(1000)));
        assert!(!q.push_front(Message::ack(1000)));
        assert_eq!(q.len(), 1);

        // The existing position is kept, the duplicate does not move it
        q.push_back(Message::DiscoveryRequest);
        assert!(!q.push_front(Message::DiscoveryRequest));
        assert_eq!(q.front(), Some(&Message::ack(1000)));
    }

    #[test]
    fn test_remove_first_matching() {
        let mut q = DedupQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        assert!(q.remove_first_matching(|v| *v >= 2));
        assert_eq!(q.iter().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(!q.remove_first_matching(|v| *v == 42));
    }

    #[test]
    fn test_retain_and_drain() {
        let mut q = DedupQueue::new();
        for v in 0..6 {
            q.push_back(v);
        }
        assert_eq!(q.retain(|v| v % 2 == 0), 3);
        assert_eq!(q.drain(), vec![0, 2, 4]);
        assert!(q.is_empty());
    }

    proptest! {
        #[test]
        fn prop_second_insert_never_grows(items in proptest::collection::vec(0u16..50, 0..40), probe in 0u16..50, front in any::<bool>()) {
            let mut q = DedupQueue::new();
            for item in items {
                q.push_back(item);
            }
            if front { q.push_front(probe); } else { q.push_back(probe); }
            let size = q.len();
            if front { q.push_front(probe); } else { q.push_back(probe); }
            prop_assert_eq!(q.len(), size);
        }

        #[test]
        fn prop_queue_never_holds_equal_items(ops in proptest::collection::vec((0u16..20, any::<bool>()), 0..60)) {
            let mut q = DedupQueue::new();
            for (item, front) in ops {
                if front { q.push_front(item); } else { q.push_back(item); }
            }
            let items: Vec<_> = q.iter().copied().collect();
            for (i, a) in items.iter().enumerate() {
                prop_assert!(!items[i + 1..].contains(a));
            }
        }
    }
}
