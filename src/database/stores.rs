use std::sync::Arc;

use async_trait::async_trait;

use super::error::DatabaseResult;
use super::models::{MessageRecord, PortalRecord, PuppetRecord, UserRecord};
use crate::qq::{MessageKey, PortalKey, Uid};

#[async_trait]
pub trait PortalStore: Send + Sync {
    async fn get_by_key(&self, key: &PortalKey) -> DatabaseResult<Option<PortalRecord>>;
    async fn get_by_mxid(&self, mxid: &str) -> DatabaseResult<Option<PortalRecord>>;
    async fn get_all(&self) -> DatabaseResult<Vec<PortalRecord>>;
    /// Private portals whose peer is `uid`, across every receiver.
    async fn find_private_chats_with(&self, uid: &Uid) -> DatabaseResult<Vec<PortalRecord>>;
    async fn insert(&self, portal: &PortalRecord) -> DatabaseResult<()>;
    async fn update(&self, portal: &PortalRecord) -> DatabaseResult<()>;
    async fn delete(&self, key: &PortalKey) -> DatabaseResult<()>;
}

#[async_trait]
pub trait PuppetStore: Send + Sync {
    async fn get(&self, uid: &Uid) -> DatabaseResult<Option<PuppetRecord>>;
    async fn get_by_custom_mxid(&self, mxid: &str) -> DatabaseResult<Option<PuppetRecord>>;
    async fn get_all(&self) -> DatabaseResult<Vec<PuppetRecord>>;
    async fn insert(&self, puppet: &PuppetRecord) -> DatabaseResult<()>;
    async fn update(&self, puppet: &PuppetRecord) -> DatabaseResult<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_all(&self, chat: &PortalKey) -> DatabaseResult<Vec<MessageRecord>>;
    async fn get_by_message_key(
        &self,
        chat: &PortalKey,
        key: &MessageKey,
    ) -> DatabaseResult<Option<MessageRecord>>;
    async fn get_by_mxid(&self, mxid: &str) -> DatabaseResult<Option<MessageRecord>>;
    /// Exact `(seq, timestamp)` match first, then the earliest record with
    /// the same seq within `window_secs` after `timestamp`.
    async fn get_by_reply(
        &self,
        chat: &PortalKey,
        seq: &str,
        timestamp: i64,
        window_secs: i64,
    ) -> DatabaseResult<Option<MessageRecord>>;
    async fn insert(&self, message: &MessageRecord) -> DatabaseResult<()>;
    async fn update_mxid(
        &self,
        chat: &PortalKey,
        key: &MessageKey,
        mxid: &str,
        sent: bool,
    ) -> DatabaseResult<()>;
    async fn delete_all(&self, chat: &PortalKey) -> DatabaseResult<()>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_mxid(&self, mxid: &str) -> DatabaseResult<Option<UserRecord>>;
    async fn get_by_uin(&self, uin: &str) -> DatabaseResult<Option<UserRecord>>;
    async fn get_all_logged_in(&self) -> DatabaseResult<Vec<UserRecord>>;
    async fn upsert(&self, user: &UserRecord) -> DatabaseResult<()>;
}

pub type SharedPortalStore = Arc<dyn PortalStore>;
pub type SharedPuppetStore = Arc<dyn PuppetStore>;
pub type SharedMessageStore = Arc<dyn MessageStore>;
pub type SharedUserStore = Arc<dyn UserStore>;

/// The four stores the bridge runs on, whatever the backend.
#[derive(Clone)]
pub struct Stores {
    pub portals: SharedPortalStore,
    pub puppets: SharedPuppetStore,
    pub messages: SharedMessageStore,
    pub users: SharedUserStore,
}
