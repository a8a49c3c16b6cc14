//! Live links of a native backend and the tasks bound to them.
//!
//! Each address holds at most one link. Replacing or retiring a link aborts
//! the notification forwarder that was started for it.

use crate::infrastructure::bluetooth::transport::Link;
use std::collections::HashMap;
use tokio::task::AbortHandle;

#[derive(Debug)]
struct Entry {
    link: Link,
    forwarder: Option<AbortHandle>,
}

impl Entry {
    fn retire(self) -> Link {
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
        self.link
    }
}

#[derive(Debug, Default)]
pub struct LinkTable {
    entries: HashMap<String, Entry>,
}

impl LinkTable {
    /// Make `link` the live link for its address
    pub fn open(&mut self, link: Link) {
        let entry = Entry {
            link: link.clone(),
            forwarder: None,
        };
        if let Some(previous) = self.entries.insert(link.address, entry) {
            previous.retire();
        }
    }

    /// Bind a forwarder to `link`. If the link is no longer live the task is
    /// aborted straight away and false is returned.
    pub fn attach(&mut self, link: &Link, forwarder: AbortHandle) -> bool {
        match self.entries.get_mut(&link.address) {
            Some(entry) if entry.link == *link => {
                if let Some(previous) = entry.forwarder.replace(forwarder) {
                    previous.abort();
                }
                true
            }
            _ => {
                forwarder.abort();
                false
            }
        }
    }

    /// Drop whatever link `address` has
    pub fn retire(&mut self, address: &str) -> Option<Link> {
        self.entries.remove(address).map(Entry::retire)
    }

    /// Drop `link` only if it is still the live one
    pub fn retire_link(&mut self, link: &Link) -> bool {
        if !self.is_live(link) {
            return false;
        }
        self.retire(&link.address);
        true
    }

    pub fn is_live(&self, link: &Link) -> bool {
        self.entries
            .get(&link.address)
            .is_some_and(|entry| entry.link == *link)
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
    use tokio::task::JoinHandle;

    fn forwarder() -> JoinHandle<()> {
        tokio::spawn(std::future::pending::<()>())
    }

    async fn was_aborted(task: JoinHandle<()>) -> bool {
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .map(|result| result.is_err_and(|e| e.is_cancelled()))
            .unwrap_or(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_aborts_previous_forwarder() {
        let mut links = LinkTable::default();
        let first = Link::new("AA:BB", 1);
        let second = Link::new("AA:BB", 2);

        links.open(first.clone());
        let first_task = forwarder();
        assert!(links.attach(&first, first_task.abort_handle()));

        links.open(second.clone());
        let second_task = forwarder();
        assert!(links.attach(&second, second_task.abort_handle()));

        assert!(was_aborted(first_task).await);
        assert!(!second_task.is_finished());
        assert!(links.is_live(&second));
        assert_eq!(links.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_aborts_forwarder() {
        let mut links = LinkTable::default();
        let link = Link::new("AA:BB", 1);
        links.open(link.clone());
        let task = forwarder();
        links.attach(&link, task.abort_handle());

        assert_eq!(links.retire("AA:BB"), Some(link));
        assert!(was_aborted(task).await);
        assert!(links.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarder_for_retired_link_is_aborted() {
        let mut links = LinkTable::default();
        let old = Link::new("AA:BB", 1);
        links.open(old.clone());
        links.open(Link::new("AA:BB", 2));

        let late = forwarder();
        assert!(!links.attach(&old, late.abort_handle()));
        assert!(was_aborted(late).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_link_is_not_retired() {
        let mut links = LinkTable::default();
        let current = Link::new("AA:BB", 2);
        links.open(current.clone());

        assert!(!links.retire_link(&Link::new("AA:BB", 1)));
        assert!(links.is_live(&current));
        assert!(links.retire_link(&current));
        assert!(links.is_empty());
    }
}
