//! Channel subscription bookkeeping for the bus server

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

/// A named channel and the clients subscribed to it
pub struct Topic {
    /// Channel name
    pub name: String,

    /// Subscribed client ids
    subscribers: HashSet<String>,

    /// Last subscribe, unsubscribe or publish
    last_activity: Instant,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    /// Add a subscriber. Returns `false` if it was already subscribed.
    pub fn add_subscriber(&mut self, client_id: &str, limit: usize) -> Result<bool, TopicError> {
        self.last_activity = Instant::now();

        if self.subscribers.contains(client_id) {
            return Ok(false);
        }
        if self.subscribers.len() >= limit {
            return Err(TopicError::Full);
        }

        self.subscribers.insert(client_id.to_string());
        Ok(true)
    }

    /// Remove a subscriber, returns whether it was present
    pub fn remove_subscriber(&mut self, client_id: &str) -> bool {
        self.last_activity = Instant::now();
        self.subscribers.remove(client_id)
    }

    pub fn is_subscribed(&self, client_id: &str) -> bool {
        self.subscribers.contains(client_id)
    }

    /// Snapshot of subscriber ids for fan-out
    pub fn subscriber_ids(&self) -> Vec<String> {
        self.subscribers.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Check if the topic has been idle for too long
    pub fn is_idle(&self, timeout_secs: u64) -> bool {
        self.last_activity.elapsed().as_secs() > timeout_secs
    }

    /// Update last activity time
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Topic errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    Full,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::Full => f.write_str("channel is full"),
        }
    }
}

impl std::error::Error for TopicError {}
