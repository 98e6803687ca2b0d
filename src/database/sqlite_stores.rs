use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::{
    prelude::*,
    r2d2::{ConnectionManager, Pool},
    sqlite::SqliteConnection,
};
use lru::LruCache;
use parking_lot::Mutex;

use super::error::DatabaseResult;
use super::models::{
    MessageErrorKind, MessageKind, MessageRecord, NameQuality, PortalRecord, PuppetRecord,
    UserRecord,
};
use super::stores::{MessageStore, PortalStore, PuppetStore, Stores, UserStore};
use crate::qq::{MessageKey, PortalKey, Uid};

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

const CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

table! {
    portals (uid, receiver) {
        uid -> Text,
        receiver -> Text,
        mxid -> Nullable<Text>,
        name -> Text,
        name_set -> Bool,
        topic -> Text,
        topic_set -> Bool,
        avatar -> Text,
        avatar_url -> Text,
        avatar_set -> Bool,
        encrypted -> Bool,
        last_sync -> Text,
    }
}

table! {
    puppets (uid) {
        uid -> Text,
        displayname -> Text,
        name_quality -> SmallInt,
        avatar -> Text,
        avatar_url -> Text,
        avatar_set -> Bool,
        last_sync -> Text,
        custom_mxid -> Nullable<Text>,
        access_token -> Nullable<Text>,
    }
}

table! {
    messages (chat, seq, msg_id) {
        chat -> Text,
        seq -> Text,
        msg_id -> Text,
        mxid -> Text,
        sender -> Text,
        timestamp -> BigInt,
        sent -> Bool,
        kind -> Text,
        error -> Text,
        content -> Text,
    }
}

table! {
    users (mxid) {
        mxid -> Text,
        uin -> Nullable<Text>,
        management_room -> Nullable<Text>,
        space_room -> Nullable<Text>,
    }
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS portals (
    uid TEXT NOT NULL,
    receiver TEXT NOT NULL,
    mxid TEXT UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    name_set BOOLEAN NOT NULL DEFAULT FALSE,
    topic TEXT NOT NULL DEFAULT '',
    topic_set BOOLEAN NOT NULL DEFAULT FALSE,
    avatar TEXT NOT NULL DEFAULT '',
    avatar_url TEXT NOT NULL DEFAULT '',
    avatar_set BOOLEAN NOT NULL DEFAULT FALSE,
    encrypted BOOLEAN NOT NULL DEFAULT FALSE,
    last_sync TEXT NOT NULL,
    PRIMARY KEY (uid, receiver)
);
CREATE TABLE IF NOT EXISTS puppets (
    uid TEXT PRIMARY KEY,
    displayname TEXT NOT NULL DEFAULT '',
    name_quality SMALLINT NOT NULL DEFAULT 0,
    avatar TEXT NOT NULL DEFAULT '',
    avatar_url TEXT NOT NULL DEFAULT '',
    avatar_set BOOLEAN NOT NULL DEFAULT FALSE,
    last_sync TEXT NOT NULL,
    custom_mxid TEXT,
    access_token TEXT
);
CREATE TABLE IF NOT EXISTS messages (
    chat TEXT NOT NULL,
    seq TEXT NOT NULL,
    msg_id TEXT NOT NULL,
    mxid TEXT NOT NULL UNIQUE,
    sender TEXT NOT NULL,
    timestamp BIGINT NOT NULL,
    sent BOOLEAN NOT NULL DEFAULT FALSE,
    kind TEXT NOT NULL DEFAULT 'message',
    error TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (chat, seq, msg_id)
);
CREATE INDEX IF NOT EXISTS messages_reply_idx ON messages (chat, seq, timestamp);
CREATE TABLE IF NOT EXISTS users (
    mxid TEXT PRIMARY KEY,
    uin TEXT UNIQUE,
    management_room TEXT,
    space_room TEXT
);
"#;

#[derive(Clone)]
pub struct SqliteStores {
    pool: SqlitePool,
    portal_cache: Arc<Mutex<LruCache<String, PortalRecord>>>,
    puppet_cache: Arc<Mutex<LruCache<String, PuppetRecord>>>,
}

impl SqliteStores {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            portal_cache: Arc::new(Mutex::new(LruCache::new(CACHE_CAPACITY))),
            puppet_cache: Arc::new(Mutex::new(LruCache::new(CACHE_CAPACITY))),
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            portals: Arc::new(self.clone()),
            puppets: Arc::new(self.clone()),
            messages: Arc::new(self.clone()),
            users: Arc::new(self.clone()),
        }
    }

    async fn run<T, F>(&self, op: F) -> DatabaseResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> DatabaseResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            op(&mut conn)
        })
        .await?
    }
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

#[async_trait]
impl PortalStore for SqliteStores {
    async fn get_by_key(&self, key: &PortalKey) -> DatabaseResult<Option<PortalRecord>> {
        let cache_key = key.to_string();
        if let Some(cached) = self.portal_cache.lock().get(&cache_key).cloned() {
            return Ok(Some(cached));
        }

        let uid = key.uid.to_string();
        let receiver = key.receiver.to_string();
        let row: Option<SqlitePortal> = self
            .run(move |conn| {
                Ok(portals::table
                    .filter(portals::uid.eq(&uid))
                    .filter(portals::receiver.eq(&receiver))
                    .first(conn)
                    .optional()?)
            })
            .await?;

        let portal = row.map(SqlitePortal::into_model).transpose()?;
        if let Some(ref portal) = portal {
            self.portal_cache.lock().put(cache_key, portal.clone());
        }
        Ok(portal)
    }

    async fn get_by_mxid(&self, mxid: &str) -> DatabaseResult<Option<PortalRecord>> {
        let mxid = mxid.to_string();
        let row: Option<SqlitePortal> = self
            .run(move |conn| {
                Ok(portals::table
                    .filter(portals::mxid.eq(&mxid))
                    .first(conn)
                    .optional()?)
            })
            .await?;
        row.map(SqlitePortal::into_model).transpose()
    }

    async fn get_all(&self) -> DatabaseResult<Vec<PortalRecord>> {
        let rows: Vec<SqlitePortal> = self.run(|conn| Ok(portals::table.load(conn)?)).await?;
        rows.into_iter().map(SqlitePortal::into_model).collect()
    }

    async fn find_private_chats_with(&self, uid: &Uid) -> DatabaseResult<Vec<PortalRecord>> {
        let uid = uid.to_string();
        let rows: Vec<SqlitePortal> = self
            .run(move |conn| {
                Ok(portals::table
                    .filter(portals::uid.eq(&uid))
                    .load(conn)?)
            })
            .await?;
        rows.into_iter().map(SqlitePortal::into_model).collect()
    }

    async fn insert(&self, portal: &PortalRecord) -> DatabaseResult<()> {
        let row = SqlitePortal::from_model(portal);
        self.run(move |conn| {
            diesel::insert_into(portals::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await?;
        self.portal_cache
            .lock()
            .put(portal.key.to_string(), portal.clone());
        Ok(())
    }

    async fn update(&self, portal: &PortalRecord) -> DatabaseResult<()> {
        let row = SqlitePortal::from_model(portal);
        self.run(move |conn| {
            diesel::update(
                portals::table
                    .filter(portals::uid.eq(&row.uid))
                    .filter(portals::receiver.eq(&row.receiver)),
            )
            .set(&row)
            .execute(conn)?;
            Ok(())
        })
        .await?;
        self.portal_cache
            .lock()
            .put(portal.key.to_string(), portal.clone());
        Ok(())
    }

    async fn delete(&self, key: &PortalKey) -> DatabaseResult<()> {
        self.portal_cache.lock().pop(&key.to_string());
        let uid = key.uid.to_string();
        let receiver = key.receiver.to_string();
        self.run(move |conn| {
            diesel::delete(
                portals::table
                    .filter(portals::uid.eq(&uid))
                    .filter(portals::receiver.eq(&receiver)),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl PuppetStore for SqliteStores {
    async fn get(&self, uid: &Uid) -> DatabaseResult<Option<PuppetRecord>> {
        let cache_key = uid.to_string();
        if let Some(cached) = self.puppet_cache.lock().get(&cache_key).cloned() {
            return Ok(Some(cached));
        }

        let lookup = cache_key.clone();
        let row: Option<SqlitePuppet> = self
            .run(move |conn| {
                Ok(puppets::table
                    .filter(puppets::uid.eq(&lookup))
                    .first(conn)
                    .optional()?)
            })
            .await?;
        let puppet = row.map(SqlitePuppet::into_model).transpose()?;
        if let Some(ref puppet) = puppet {
            self.puppet_cache.lock().put(cache_key, puppet.clone());
        }
        Ok(puppet)
    }

    async fn get_by_custom_mxid(&self, mxid: &str) -> DatabaseResult<Option<PuppetRecord>> {
        let mxid = mxid.to_string();
        let row: Option<SqlitePuppet> = self
            .run(move |conn| {
                Ok(puppets::table
                    .filter(puppets::custom_mxid.eq(&mxid))
                    .first(conn)
                    .optional()?)
            })
            .await?;
        row.map(SqlitePuppet::into_model).transpose()
    }

    async fn get_all(&self) -> DatabaseResult<Vec<PuppetRecord>> {
        let rows: Vec<SqlitePuppet> = self.run(|conn| Ok(puppets::table.load(conn)?)).await?;
        rows.into_iter().map(SqlitePuppet::into_model).collect()
    }

    async fn insert(&self, puppet: &PuppetRecord) -> DatabaseResult<()> {
        let row = SqlitePuppet::from_model(puppet);
        self.run(move |conn| {
            diesel::insert_into(puppets::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await?;
        self.puppet_cache
            .lock()
            .put(puppet.uid.to_string(), puppet.clone());
        Ok(())
    }

    async fn update(&self, puppet: &PuppetRecord) -> DatabaseResult<()> {
        let row = SqlitePuppet::from_model(puppet);
        self.run(move |conn| {
            diesel::update(puppets::table.filter(puppets::uid.eq(&row.uid)))
                .set(&row)
                .execute(conn)?;
            Ok(())
        })
        .await?;
        self.puppet_cache
            .lock()
            .put(puppet.uid.to_string(), puppet.clone());
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStores {
    async fn get_all(&self, chat: &PortalKey) -> DatabaseResult<Vec<MessageRecord>> {
        let chat = chat.to_string();
        let rows: Vec<SqliteMessage> = self
            .run(move |conn| {
                Ok(messages::table
                    .filter(messages::chat.eq(&chat))
                    .order(messages::timestamp.asc())
                    .load(conn)?)
            })
            .await?;
        rows.into_iter().map(SqliteMessage::into_model).collect()
    }

    async fn get_by_message_key(
        &self,
        chat: &PortalKey,
        key: &MessageKey,
    ) -> DatabaseResult<Option<MessageRecord>> {
        let chat = chat.to_string();
        let key = key.clone();
        let row: Option<SqliteMessage> = self
            .run(move |conn| {
                Ok(messages::table
                    .filter(messages::chat.eq(&chat))
                    .filter(messages::seq.eq(&key.seq))
                    .filter(messages::msg_id.eq(&key.id))
                    .first(conn)
                    .optional()?)
            })
            .await?;
        row.map(SqliteMessage::into_model).transpose()
    }

    async fn get_by_mxid(&self, mxid: &str) -> DatabaseResult<Option<MessageRecord>> {
        let mxid = mxid.to_string();
        let row: Option<SqliteMessage> = self
            .run(move |conn| {
                Ok(messages::table
                    .filter(messages::mxid.eq(&mxid))
                    .first(conn)
                    .optional()?)
            })
            .await?;
        row.map(SqliteMessage::into_model).transpose()
    }

    async fn get_by_reply(
        &self,
        chat: &PortalKey,
        seq: &str,
        timestamp: i64,
        window_secs: i64,
    ) -> DatabaseResult<Option<MessageRecord>> {
        let chat = chat.to_string();
        let seq = seq.to_string();
        let row: Option<SqliteMessage> = self
            .run(move |conn| {
                let exact = messages::table
                    .filter(messages::chat.eq(&chat))
                    .filter(messages::seq.eq(&seq))
                    .filter(messages::timestamp.eq(timestamp))
                    .first(conn)
                    .optional()?;
                if exact.is_some() {
                    return Ok(exact);
                }
                Ok(messages::table
                    .filter(messages::chat.eq(&chat))
                    .filter(messages::seq.eq(&seq))
                    .filter(messages::timestamp.gt(timestamp))
                    .filter(messages::timestamp.le(timestamp + window_secs))
                    .order(messages::timestamp.asc())
                    .first(conn)
                    .optional()?)
            })
            .await?;
        row.map(SqliteMessage::into_model).transpose()
    }

    async fn insert(&self, message: &MessageRecord) -> DatabaseResult<()> {
        let row = SqliteMessage::from_model(message);
        self.run(move |conn| {
            diesel::insert_into(messages::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_mxid(
        &self,
        chat: &PortalKey,
        key: &MessageKey,
        mxid: &str,
        sent: bool,
    ) -> DatabaseResult<()> {
        let chat = chat.to_string();
        let key = key.clone();
        let mxid = mxid.to_string();
        self.run(move |conn| {
            diesel::update(
                messages::table
                    .filter(messages::chat.eq(&chat))
                    .filter(messages::seq.eq(&key.seq))
                    .filter(messages::msg_id.eq(&key.id)),
            )
            .set((messages::mxid.eq(&mxid), messages::sent.eq(sent)))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn delete_all(&self, chat: &PortalKey) -> DatabaseResult<()> {
        let chat = chat.to_string();
        self.run(move |conn| {
            diesel::delete(messages::table.filter(messages::chat.eq(&chat))).execute(conn)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl UserStore for SqliteStores {
    async fn get_by_mxid(&self, mxid: &str) -> DatabaseResult<Option<UserRecord>> {
        let mxid = mxid.to_string();
        let row: Option<SqliteUser> = self
            .run(move |conn| {
                Ok(users::table
                    .filter(users::mxid.eq(&mxid))
                    .first(conn)
                    .optional()?)
            })
            .await?;
        Ok(row.map(SqliteUser::into_model))
    }

    async fn get_by_uin(&self, uin: &str) -> DatabaseResult<Option<UserRecord>> {
        let uin = uin.to_string();
        let row: Option<SqliteUser> = self
            .run(move |conn| {
                Ok(users::table
                    .filter(users::uin.eq(&uin))
                    .first(conn)
                    .optional()?)
            })
            .await?;
        Ok(row.map(SqliteUser::into_model))
    }

    async fn get_all_logged_in(&self) -> DatabaseResult<Vec<UserRecord>> {
        let rows: Vec<SqliteUser> = self
            .run(|conn| Ok(users::table.filter(users::uin.is_not_null()).load(conn)?))
            .await?;
        Ok(rows.into_iter().map(SqliteUser::into_model).collect())
    }

    async fn upsert(&self, user: &UserRecord) -> DatabaseResult<()> {
        let row = SqliteUser::from_model(user);
        self.run(move |conn| {
            diesel::replace_into(users::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = portals, primary_key(uid, receiver))]
struct SqlitePortal {
    uid: String,
    receiver: String,
    mxid: Option<String>,
    name: String,
    name_set: bool,
    topic: String,
    topic_set: bool,
    avatar: String,
    avatar_url: String,
    avatar_set: bool,
    encrypted: bool,
    last_sync: String,
}

impl SqlitePortal {
    fn from_model(model: &PortalRecord) -> Self {
        Self {
            uid: model.key.uid.to_string(),
            receiver: model.key.receiver.to_string(),
            mxid: model.mxid.clone(),
            name: model.name.clone(),
            name_set: model.name_set,
            topic: model.topic.clone(),
            topic_set: model.topic_set,
            avatar: model.avatar.clone(),
            avatar_url: model.avatar_url.clone(),
            avatar_set: model.avatar_set,
            encrypted: model.encrypted,
            last_sync: model.last_sync.to_rfc3339(),
        }
    }

    fn into_model(self) -> DatabaseResult<PortalRecord> {
        let key = PortalKey::new(self.uid.parse()?, self.receiver.parse()?);
        Ok(PortalRecord {
            key,
            mxid: self.mxid,
            name: self.name,
            name_set: self.name_set,
            topic: self.topic,
            topic_set: self.topic_set,
            avatar: self.avatar,
            avatar_url: self.avatar_url,
            avatar_set: self.avatar_set,
            encrypted: self.encrypted,
            last_sync: parse_time(&self.last_sync),
        })
    }
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = puppets, primary_key(uid))]
struct SqlitePuppet {
    uid: String,
    displayname: String,
    name_quality: i16,
    avatar: String,
    avatar_url: String,
    avatar_set: bool,
    last_sync: String,
    custom_mxid: Option<String>,
    access_token: Option<String>,
}

impl SqlitePuppet {
    fn from_model(model: &PuppetRecord) -> Self {
        Self {
            uid: model.uid.to_string(),
            displayname: model.displayname.clone(),
            name_quality: model.name_quality.as_i16(),
            avatar: model.avatar.clone(),
            avatar_url: model.avatar_url.clone(),
            avatar_set: model.avatar_set,
            last_sync: model.last_sync.to_rfc3339(),
            custom_mxid: model.custom_mxid.clone(),
            access_token: model.access_token.clone(),
        }
    }

    fn into_model(self) -> DatabaseResult<PuppetRecord> {
        Ok(PuppetRecord {
            uid: self.uid.parse()?,
            displayname: self.displayname,
            name_quality: NameQuality::from_i16(self.name_quality),
            avatar: self.avatar,
            avatar_url: self.avatar_url,
            avatar_set: self.avatar_set,
            last_sync: parse_time(&self.last_sync),
            custom_mxid: self.custom_mxid,
            access_token: self.access_token,
        })
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = messages)]
struct SqliteMessage {
    chat: String,
    seq: String,
    msg_id: String,
    mxid: String,
    sender: String,
    timestamp: i64,
    sent: bool,
    kind: String,
    error: String,
    content: String,
}

impl SqliteMessage {
    fn from_model(model: &MessageRecord) -> Self {
        Self {
            chat: model.chat.to_string(),
            seq: model.key.seq.clone(),
            msg_id: model.key.id.clone(),
            mxid: model.mxid.clone(),
            sender: model.sender.to_string(),
            timestamp: model.timestamp,
            sent: model.sent,
            kind: model.kind.as_str().to_string(),
            error: model.error.as_str().to_string(),
            content: model.content.clone(),
        }
    }

    fn into_model(self) -> DatabaseResult<MessageRecord> {
        Ok(MessageRecord {
            chat: self.chat.parse()?,
            key: MessageKey::new(self.seq, self.msg_id),
            mxid: self.mxid,
            sender: self.sender.parse()?,
            timestamp: self.timestamp,
            sent: self.sent,
            kind: MessageKind::parse(&self.kind),
            error: MessageErrorKind::parse(&self.error),
            content: self.content,
        })
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = users)]
struct SqliteUser {
    mxid: String,
    uin: Option<String>,
    management_room: Option<String>,
    space_room: Option<String>,
}

impl SqliteUser {
    fn from_model(model: &UserRecord) -> Self {
        Self {
            mxid: model.mxid.clone(),
            uin: model.uin.clone(),
            management_room: model.management_room.clone(),
            space_room: model.space_room.clone(),
        }
    }

    fn into_model(self) -> UserRecord {
        UserRecord {
            mxid: self.mxid,
            uin: self.uin,
            management_room: self.management_room,
            space_room: self.space_room,
        }
    }
}
