//! Deferred actions fired from the periodic tick.

use std::time::Instant;

#[derive(Debug)]
pub struct Scheduler<A> {
    entries: Vec<(Instant, A)>,
}

impl<A> Default for Scheduler<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<A> Scheduler<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: Instant, action: A) {
        self.entries.push((due, action));
    }

    /// Remove and return every action due at `now`, earliest first.
    /// Actions due at the same instant keep their scheduling order.
    pub fn take_due(&mut self, now: Instant) -> Vec<A> {
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|(at, _)| *at <= now);
        self.entries = pending;
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, action)| action).collect()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&A) -> bool) {
        self.entries.retain(|(_, action)| keep(action));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_take_due_orders_by_deadline() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.schedule(start + Duration::from_millis(30), "late");
        scheduler.schedule(start + Duration::from_millis(10), "early");
        scheduler.schedule(start + Duration::from_secs(5), "future");

        assert!(scheduler.take_due(start).is_empty());
        let fired = scheduler.take_due(start + Duration::from_millis(50));
        assert_eq!(fired, vec!["early", "late"]);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_retain_drops_matching_actions() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.schedule(start, 1);
        scheduler.schedule(start, 2);
        scheduler.retain(|n| *n != 1);
        assert_eq!(scheduler.take_due(start), vec![2]);
        assert!(scheduler.is_empty());
    }
}
