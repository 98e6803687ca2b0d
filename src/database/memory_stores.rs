use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::{DatabaseError, DatabaseResult};
use super::models::{MessageRecord, PortalRecord, PuppetRecord, UserRecord};
use super::stores::{MessageStore, PortalStore, PuppetStore, Stores, UserStore};
use crate::qq::{MessageKey, PortalKey, Uid};

#[derive(Default)]
struct Tables {
    portals: HashMap<PortalKey, PortalRecord>,
    puppets: HashMap<Uid, PuppetRecord>,
    messages: Vec<MessageRecord>,
    users: HashMap<String, UserRecord>,
}

/// Process-local backend used by `database.type: memory` and the tests.
#[derive(Clone, Default)]
pub struct MemoryStores {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stores(&self) -> Stores {
        Stores {
            portals: Arc::new(self.clone()),
            puppets: Arc::new(self.clone()),
            messages: Arc::new(self.clone()),
            users: Arc::new(self.clone()),
        }
    }
}

#[async_trait]
impl PortalStore for MemoryStores {
    async fn get_by_key(&self, key: &PortalKey) -> DatabaseResult<Option<PortalRecord>> {
        Ok(self.tables.lock().portals.get(key).cloned())
    }

    async fn get_by_mxid(&self, mxid: &str) -> DatabaseResult<Option<PortalRecord>> {
        Ok(self
            .tables
            .lock()
            .portals
            .values()
            .find(|p| p.mxid.as_deref() == Some(mxid))
            .cloned())
    }

    async fn get_all(&self) -> DatabaseResult<Vec<PortalRecord>> {
        Ok(self.tables.lock().portals.values().cloned().collect())
    }

    async fn find_private_chats_with(&self, uid: &Uid) -> DatabaseResult<Vec<PortalRecord>> {
        Ok(self
            .tables
            .lock()
            .portals
            .values()
            .filter(|p| &p.key.uid == uid && p.key.is_private())
            .cloned()
            .collect())
    }

    async fn insert(&self, portal: &PortalRecord) -> DatabaseResult<()> {
        let mut tables = self.tables.lock();
        if tables.portals.contains_key(&portal.key) {
            return Err(DatabaseError::Duplicate(portal.key.to_string()));
        }
        if let Some(mxid) = portal.mxid.as_deref()
            && tables.portals.values().any(|p| p.mxid.as_deref() == Some(mxid))
        {
            return Err(DatabaseError::Duplicate(mxid.to_string()));
        }
        tables.portals.insert(portal.key.clone(), portal.clone());
        Ok(())
    }

    async fn update(&self, portal: &PortalRecord) -> DatabaseResult<()> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.portals.get_mut(&portal.key) {
            *existing = portal.clone();
        }
        Ok(())
    }

    async fn delete(&self, key: &PortalKey) -> DatabaseResult<()> {
        self.tables.lock().portals.remove(key);
        Ok(())
    }
}

#[async_trait]
impl PuppetStore for MemoryStores {
    async fn get(&self, uid: &Uid) -> DatabaseResult<Option<PuppetRecord>> {
        Ok(self.tables.lock().puppets.get(uid).cloned())
    }

    async fn get_by_custom_mxid(&self, mxid: &str) -> DatabaseResult<Option<PuppetRecord>> {
        Ok(self
            .tables
            .lock()
            .puppets
            .values()
            .find(|p| p.custom_mxid.as_deref() == Some(mxid))
            .cloned())
    }

    async fn get_all(&self) -> DatabaseResult<Vec<PuppetRecord>> {
        Ok(self.tables.lock().puppets.values().cloned().collect())
    }

    async fn insert(&self, puppet: &PuppetRecord) -> DatabaseResult<()> {
        let mut tables = self.tables.lock();
        if tables.puppets.contains_key(&puppet.uid) {
            return Err(DatabaseError::Duplicate(puppet.uid.to_string()));
        }
        tables.puppets.insert(puppet.uid.clone(), puppet.clone());
        Ok(())
    }

    async fn update(&self, puppet: &PuppetRecord) -> DatabaseResult<()> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.puppets.get_mut(&puppet.uid) {
            *existing = puppet.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStores {
    async fn get_all(&self, chat: &PortalKey) -> DatabaseResult<Vec<MessageRecord>> {
        let mut found: Vec<MessageRecord> = self
            .tables
            .lock()
            .messages
            .iter()
            .filter(|m| &m.chat == chat)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.timestamp);
        Ok(found)
    }

    async fn get_by_message_key(
        &self,
        chat: &PortalKey,
        key: &MessageKey,
    ) -> DatabaseResult<Option<MessageRecord>> {
        Ok(self
            .tables
            .lock()
            .messages
            .iter()
            .find(|m| &m.chat == chat && &m.key == key)
            .cloned())
    }

    async fn get_by_mxid(&self, mxid: &str) -> DatabaseResult<Option<MessageRecord>> {
        Ok(self
            .tables
            .lock()
            .messages
            .iter()
            .find(|m| m.mxid == mxid)
            .cloned())
    }

    async fn get_by_reply(
        &self,
        chat: &PortalKey,
        seq: &str,
        timestamp: i64,
        window_secs: i64,
    ) -> DatabaseResult<Option<MessageRecord>> {
        let tables = self.tables.lock();
        let candidates = || {
            tables
                .messages
                .iter()
                .filter(|m| &m.chat == chat && m.key.seq == seq)
        };
        if let Some(exact) = candidates().find(|m| m.timestamp == timestamp) {
            return Ok(Some(exact.clone()));
        }
        Ok(candidates()
            .filter(|m| m.timestamp > timestamp && m.timestamp <= timestamp + window_secs)
            .min_by_key(|m| m.timestamp)
            .cloned())
    }

    async fn insert(&self, message: &MessageRecord) -> DatabaseResult<()> {
        let mut tables = self.tables.lock();
        if tables
            .messages
            .iter()
            .any(|m| (m.chat == message.chat && m.key == message.key) || m.mxid == message.mxid)
        {
            return Err(DatabaseError::Duplicate(format!(
                "{}/{}",
                message.chat, message.key
            )));
        }
        tables.messages.push(message.clone());
        Ok(())
    }

    async fn update_mxid(
        &self,
        chat: &PortalKey,
        key: &MessageKey,
        mxid: &str,
        sent: bool,
    ) -> DatabaseResult<()> {
        let mut tables = self.tables.lock();
        if let Some(record) = tables
            .messages
            .iter_mut()
            .find(|m| &m.chat == chat && &m.key == key)
        {
            record.mxid = mxid.to_string();
            record.sent = sent;
        }
        Ok(())
    }

    async fn delete_all(&self, chat: &PortalKey) -> DatabaseResult<()> {
        self.tables.lock().messages.retain(|m| &m.chat != chat);
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStores {
    async fn get_by_mxid(&self, mxid: &str) -> DatabaseResult<Option<UserRecord>> {
        Ok(self.tables.lock().users.get(mxid).cloned())
    }

    async fn get_by_uin(&self, uin: &str) -> DatabaseResult<Option<UserRecord>> {
        Ok(self
            .tables
            .lock()
            .users
            .values()
            .find(|u| u.uin.as_deref() == Some(uin))
            .cloned())
    }

    async fn get_all_logged_in(&self) -> DatabaseResult<Vec<UserRecord>> {
        Ok(self
            .tables
            .lock()
            .users
            .values()
            .filter(|u| u.uin.is_some())
            .cloned()
            .collect())
    }

    async fn upsert(&self, user: &UserRecord) -> DatabaseResult<()> {
        self.tables
            .lock()
            .users
            .insert(user.mxid.clone(), user.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chat: &PortalKey, seq: &str, ts: i64, mxid: &str) -> MessageRecord {
        MessageRecord::new(chat.clone(), MessageKey::new(seq, seq), Uid::user("10"), ts)
            .with_mxid(mxid)
    }

    #[tokio::test]
    async fn reply_lookup_prefers_exact_timestamp() {
        let store = MemoryStores::new();
        let chat = PortalKey::group("1");
        MessageStore::insert(&store, &record(&chat, "7", 100, "$a")).await.unwrap();
        let mut later = record(&chat, "7", 104, "$b");
        later.key.id = "other".to_string();
        MessageStore::insert(&store, &later).await.unwrap();

        let exact = store.get_by_reply(&chat, "7", 100, 10).await.unwrap().unwrap();
        assert_eq!(exact.mxid, "$a");

        let forward = store.get_by_reply(&chat, "7", 101, 10).await.unwrap().unwrap();
        assert_eq!(forward.mxid, "$b");

        assert!(store.get_by_reply(&chat, "7", 80, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_message_keys_are_rejected() {
        let store = MemoryStores::new();
        let chat = PortalKey::group("1");
        MessageStore::insert(&store, &record(&chat, "1", 0, "$a")).await.unwrap();
        let err = MessageStore::insert(&store, &record(&chat, "1", 0, "$c")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Duplicate(_)));
    }

    #[tokio::test]
    async fn private_chat_lookup_skips_groups() {
        let store = MemoryStores::new();
        let peer = Uid::user("42");
        for key in [
            PortalKey::private("42", "1"),
            PortalKey::private("42", "2"),
            PortalKey::group("42"),
        ] {
            PortalStore::insert(&store, &PortalRecord::new(key))
                .await
                .unwrap();
        }

        let found = store.find_private_chats_with(&peer).await.unwrap();
        assert_eq!(found.len(), 2);
    }
}
