//! # Pending Message Store
//!
//! Sender-side buffer of undelivered messages, one text blob per recipient.
//! Entries are `"<timestamp> | <message>"` joined with `\n`, oldest first.
//! The blob is what gets published on the recipient's backlog topic, so it
//! is only ever appended to or cleared as a whole.

use std::collections::HashMap;

use geochat_core::types::Identity;
use geochat_core::wire::{format_entry, ENTRY_DELIMITER};
use parking_lot::Mutex;

use crate::error::{NodeError, Result};

#[derive(Default)]
pub struct PendingMessageStore {
    buffers: Mutex<HashMap<Identity, String>>,
}

impl PendingMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry and return the recipient's full text
    pub fn append(&self, recipient: &str, message: &str, timestamp: &str) -> Result<String> {
        if recipient.trim().is_empty() {
            return Err(NodeError::EmptyRecipient);
        }

        let mut buffers = self.buffers.lock();
        let text = buffers.entry(recipient.to_string()).or_default();
        if !text.is_empty() {
            text.push(ENTRY_DELIMITER);
        }
        text.push_str(&format_entry(timestamp, message));
        Ok(text.clone())
    }

    pub fn get(&self, recipient: &str) -> Option<String> {
        self.buffers.lock().get(recipient).cloned()
    }

    /// Drop the recipient's buffer, returning what it held
    pub fn clear(&self, recipient: &str) -> Option<String> {
        self.buffers.lock().remove(recipient)
    }

    /// Drop the oldest `count` entries and return what is left.
    ///
    /// The buffer disappears once nothing remains.
    pub fn drain_front(&self, recipient: &str, count: usize) -> Option<String> {
        let mut buffers = self.buffers.lock();
        let text = buffers.get_mut(recipient)?;
        let rest: Vec<&str> = text.split(ENTRY_DELIMITER).skip(count).collect();
        if rest.is_empty() {
            buffers.remove(recipient);
            return None;
        }
        *text = rest.join(&ENTRY_DELIMITER.to_string());
        Some(text.clone())
    }

    /// Recipients with something pending
    pub fn recipients(&self) -> Vec<Identity> {
        let mut list: Vec<Identity> = self.buffers.lock().keys().cloned().collect();
        list.sort();
        list
    }

    /// Number of entries held for `recipient`
    pub fn entry_count(&self, recipient: &str) -> usize {
        self.buffers
            .lock()
            .get(recipient)
            .map(|text| text.split(ENTRY_DELIMITER).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_append_accumulates() {
        let store = PendingMessageStore::new();

        let first = store.append("B", "hello", "2024-01-01 10:00:00").unwrap();
        assert_eq!(first, "2024-01-01 10:00:00 | hello");

        let second = store.append("B", "world", "2024-01-01 10:00:05").unwrap();
        assert_eq!(
            second,
            "2024-01-01 10:00:00 | hello\n2024-01-01 10:00:05 | world"
        );
        assert_eq!(store.get("B").unwrap(), second);
        assert_eq!(store.entry_count("B"), 2);
    }

    #[test]
    fn test_recipients_are_independent() {
        let store = PendingMessageStore::new();
        store.append("B", "for b", "t1").unwrap();
        store.append("C", "for c", "t2").unwrap();

        assert_eq!(store.get("B").unwrap(), "t1 | for b");
        assert_eq!(store.get("C").unwrap(), "t2 | for c");
        assert_eq!(store.recipients(), vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_empty_recipient_rejected() {
        let store = PendingMessageStore::new();
        assert!(matches!(
            store.append("", "hi", "t"),
            Err(NodeError::EmptyRecipient)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear() {
        let store = PendingMessageStore::new();
        store.append("B", "hi", "t").unwrap();

        assert_eq!(store.clear("B").unwrap(), "t | hi");
        assert!(store.get("B").is_none());
        assert!(store.clear("B").is_none());
        assert_eq!(store.entry_count("B"), 0);
    }

    #[test]
    fn test_drain_front() {
        let store = PendingMessageStore::new();
        store.append("B", "one", "t1").unwrap();
        store.append("B", "two", "t2").unwrap();
        store.append("B", "three", "t3").unwrap();

        assert_eq!(store.drain_front("B", 2).unwrap(), "t3 | three");
        assert_eq!(store.entry_count("B"), 1);

        assert!(store.drain_front("B", 1).is_none());
        assert!(store.get("B").is_none());
        assert!(store.drain_front("Z", 1).is_none());
    }

    #[test]
    fn test_concurrent_appends_keep_every_entry() {
        let store = Arc::new(PendingMessageStore::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        store.append("B", &format!("m{i}-{j}"), "t").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.entry_count("B"), 100);
    }
}
