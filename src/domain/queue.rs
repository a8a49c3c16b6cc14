//! Pending connection queue.
//!
//! Holds device names only. Entries may go stale between enqueue and dequeue,
//! so callers validate whatever they pop.

use std::collections::VecDeque;

#[derive(Debug, Default, Clone)]
pub struct PendingQueue {
    entries: VecDeque<String>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a name. Returns false if it was already queued.
    pub fn push_back(&mut self, name: &str) -> bool {
        if self.contains(name) {
            return false;
        }
        self.entries.push_back(name.to_string());
        true
    }

    /// Splice a name in front of everything else, rebuilding the queue.
    pub fn push_front(&mut self, name: &str) {
        let mut rebuilt = VecDeque::with_capacity(self.entries.len() + 1);
        rebuilt.push_back(name.to_string());
        while let Some(entry) = self.entries.pop_front() {
            if entry != name {
                rebuilt.push_back(entry);
            }
        }
        self.entries = rebuilt;
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|entry| entry != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry == name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(queue: &PendingQueue) -> Vec<&str> {
        queue.iter().collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = PendingQueue::new();
        queue.push_back("a");
        queue.push_back("b");
        assert_eq!(queue.pop_front().as_deref(), Some("a"));
        assert_eq!(queue.pop_front().as_deref(), Some("b"));
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_push_back_ignores_duplicates() {
        let mut queue = PendingQueue::new();
        assert!(queue.push_back("a"));
        assert!(!queue.push_back("a"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_push_front_moves_existing_entry() {
        let mut queue = PendingQueue::new();
        queue.push_back("a");
        queue.push_back("b");
        queue.push_back("c");
        queue.push_front("c");
        assert_eq!(names(&queue), vec!["c", "a", "b"]);

        queue.push_front("z");
        assert_eq!(names(&queue), vec!["z", "c", "a", "b"]);
    }
}
