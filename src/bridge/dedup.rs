use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use crate::database::{DatabaseResult, MessageRecord, SharedMessageStore};
use crate::qq::{MessageKey, PortalKey};

pub const RECENTLY_HANDLED_CAPACITY: usize = 100;

/// Fixed size window of the most recently handled message keys.
#[derive(Debug)]
pub struct RecentRing {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl RecentRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    /// Returns false when the key was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.members.remove(&oldest);
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Recent ring in front of the persistent message index of one portal.
pub struct DedupTracker {
    chat: PortalKey,
    recent: Mutex<RecentRing>,
    messages: SharedMessageStore,
}

impl DedupTracker {
    pub fn new(chat: PortalKey, messages: SharedMessageStore) -> Self {
        Self {
            chat,
            recent: Mutex::new(RecentRing::new(RECENTLY_HANDLED_CAPACITY)),
            messages,
        }
    }

    pub fn recently_handled(&self, key: &MessageKey) -> bool {
        self.recent.lock().contains(&key.to_string())
    }

    /// A stored row only counts once it was delivered. Rows left behind by a
    /// failed Matrix send still carry a placeholder mxid and may be retried.
    pub async fn is_duplicate(&self, key: &MessageKey) -> DatabaseResult<bool> {
        if self.recently_handled(key) {
            return Ok(true);
        }
        Ok(self
            .messages
            .get_by_message_key(&self.chat, key)
            .await?
            .is_some_and(|record| is_delivered(&record)))
    }

    pub fn mark_handled(&self, key: &MessageKey) {
        self.recent.lock().insert(key.to_string());
    }
}

pub fn is_delivered(record: &MessageRecord) -> bool {
    record.sent && !record.is_fake_mxid()
}
