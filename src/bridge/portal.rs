use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dedup::{DedupTracker, is_delivered};
use super::puppet::{Puppet, reupload_avatar};
use super::qq_bridge::QqBridge;
use super::user::User;
use crate::database::{
    DatabaseError, DatabaseResult, FAKE_MXID_PREFIX, MessageKind, MessageRecord, NameQuality,
    PortalRecord, PuppetRecord,
};
use crate::formatter::{MatrixToQq, MentionResolver, QqToMatrix, ReplyInfo, escape_html};
use crate::matrix::types::{
    CreateRoomRequest, EVENT_MEMBER, MSG_NOTICE, MSG_TEXT, MatrixError, MessageContent, RoomEvent,
    StateEvent,
};
use crate::matrix::Intent;
use crate::qq::id::FAKE_KEY_PREFIX;
use crate::qq::onebot::user_avatar_url;
use crate::qq::{
    ContactInfo, GroupInfo, GroupMember, MemberRole, MessageKey, PortalKey, QqClient, QqMessage,
    Uid, summarize,
};
use crate::web::metrics::QueueDepthGuard;
use crate::web::{ScopedTimer, global_metrics};

pub const PRIVATE_CHAT_TOPIC: &str = "QQ private chat";

const KICK_REASON_LEFT: &str = "User had left this QQ chat";
const KICK_REASON_DELETING: &str = "Deleting portal";
const EVENT_POWER_LEVELS: &str = "m.room.power_levels";
const EVENT_BRIDGE: &str = "m.bridge";
const EVENT_HALF_SHOT_BRIDGE: &str = "uk.half-shot.bridge";
const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Unbound,
    RoomPending,
    Bound,
    Deleted,
}

/// Group metadata fetched in one go from the relay.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub info: GroupInfo,
    pub members: Vec<GroupMember>,
}

/// A notice the bridge itself writes into the room, stored under a
/// `FAKE::` message key.
#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub id: String,
    pub sender: Uid,
    pub text: String,
    /// Unix seconds.
    pub time: i64,
    pub important: bool,
}

impl FakeMessage {
    pub fn removed_from_group(self_uin: &str) -> Self {
        Self {
            id: format!("removed-{}", Utc::now().timestamp_millis()),
            sender: Uid::user(self_uin),
            text: "You are no longer a member of this QQ group".to_string(),
            time: Utc::now().timestamp(),
            important: true,
        }
    }
}

pub enum QqPortalEvent {
    Message {
        source: Arc<User>,
        message: QqMessage,
    },
    Fake {
        source: Arc<User>,
        message: FakeMessage,
    },
    Revoke {
        source: Arc<User>,
        operator: String,
        key: MessageKey,
        time: i64,
    },
    MemberJoined {
        source: Arc<User>,
        member: String,
    },
    MemberLeft {
        source: Arc<User>,
        member: String,
        operator: Option<String>,
    },
    MemberCardChanged {
        source: Arc<User>,
        member: String,
        card: String,
    },
    GroupLeft {
        source: Arc<User>,
        operator: Option<String>,
        notice: FakeMessage,
    },
}

impl QqPortalEvent {
    fn label(&self) -> &'static str {
        match self {
            QqPortalEvent::Message { .. } => "qq_message",
            QqPortalEvent::Fake { .. } => "fake_message",
            QqPortalEvent::Revoke { .. } => "qq_revoke",
            QqPortalEvent::MemberJoined { .. } => "member_joined",
            QqPortalEvent::MemberLeft { .. } => "member_left",
            QqPortalEvent::MemberCardChanged { .. } => "member_card",
            QqPortalEvent::GroupLeft { .. } => "group_left",
        }
    }
}

pub enum MatrixPortalEvent {
    Message { sender: Arc<User>, event: RoomEvent },
    Redaction { sender: Arc<User>, event: RoomEvent },
}

impl MatrixPortalEvent {
    fn label(&self) -> &'static str {
        match self {
            MatrixPortalEvent::Message { .. } => "matrix_message",
            MatrixPortalEvent::Redaction { .. } => "matrix_redaction",
        }
    }
}

struct Queued<T> {
    event: T,
    _depth: QueueDepthGuard,
}

impl<T> Queued<T> {
    fn new(event: T) -> Self {
        Self {
            event,
            _depth: global_metrics().begin_queue_task(),
        }
    }
}

enum WorkItem {
    Qq(QqPortalEvent),
    Matrix(MatrixPortalEvent),
}

impl WorkItem {
    fn label(&self) -> &'static str {
        match self {
            WorkItem::Qq(event) => event.label(),
            WorkItem::Matrix(event) => event.label(),
        }
    }
}

/// Receiving halves of a portal's queues, handed to its worker on start.
pub struct PortalReceivers {
    qq: mpsc::Receiver<Queued<QqPortalEvent>>,
    matrix: mpsc::Receiver<Queued<MatrixPortalEvent>>,
}

/// Why a Matrix user's message is not sent on to QQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeRefusal {
    NoPermission,
    NotLoggedIn,
    DifferentUser,
}

/// One QQ chat mirrored as one Matrix room. Every event for the chat runs on
/// the portal's single worker task, in arrival order.
pub struct Portal {
    pub key: PortalKey,
    bridge: Arc<QqBridge>,
    record: Mutex<PortalRecord>,
    persisted: AtomicBool,
    deleted: AtomicBool,
    creating: AtomicBool,
    create_lock: tokio::sync::Mutex<()>,
    joined: Mutex<HashSet<String>>,
    dedup: DedupTracker,
    qq_tx: mpsc::Sender<Queued<QqPortalEvent>>,
    matrix_tx: mpsc::Sender<Queued<MatrixPortalEvent>>,
}

struct CreatingFlag<'a>(&'a AtomicBool);

impl Drop for CreatingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Portal {
    pub fn new(
        bridge: Arc<QqBridge>,
        record: PortalRecord,
        persisted: bool,
    ) -> (Arc<Self>, PortalReceivers) {
        let buffer = bridge.config.bridge.portal_message_buffer.max(1);
        let (qq_tx, qq_rx) = mpsc::channel(buffer);
        let (matrix_tx, matrix_rx) = mpsc::channel(buffer);
        let portal = Arc::new(Self {
            key: record.key.clone(),
            dedup: DedupTracker::new(record.key.clone(), bridge.stores.messages.clone()),
            bridge,
            record: Mutex::new(record),
            persisted: AtomicBool::new(persisted),
            deleted: AtomicBool::new(false),
            creating: AtomicBool::new(false),
            create_lock: tokio::sync::Mutex::new(()),
            joined: Mutex::new(HashSet::new()),
            qq_tx,
            matrix_tx,
        });
        let receivers = PortalReceivers {
            qq: qq_rx,
            matrix: matrix_rx,
        };
        (portal, receivers)
    }

    /// Spawns the worker. It holds only a weak reference, so it stops once
    /// the registry lets go of the portal.
    pub fn start(self: &Arc<Self>, receivers: PortalReceivers) {
        let portal = Arc::downgrade(self);
        let key = self.key.clone();
        tokio::spawn(async move {
            run_worker(portal, receivers).await;
            debug!(portal = %key, "Portal worker stopped");
        });
    }

    pub fn state(&self) -> PortalState {
        if self.deleted.load(Ordering::Acquire) {
            PortalState::Deleted
        } else if self.record.lock().mxid.is_some() {
            PortalState::Bound
        } else if self.creating.load(Ordering::Acquire) {
            PortalState::RoomPending
        } else {
            PortalState::Unbound
        }
    }

    pub fn mxid(&self) -> Option<String> {
        self.record.lock().mxid.clone()
    }

    pub fn snapshot(&self) -> PortalRecord {
        self.record.lock().clone()
    }

    pub fn last_sync(&self) -> chrono::DateTime<Utc> {
        self.record.lock().last_sync
    }

    pub fn is_private(&self) -> bool {
        self.key.is_private()
    }

    pub fn is_encrypted(&self) -> bool {
        self.record.lock().encrypted
    }

    /// Private chats are run by the peer's ghost, groups by the bridge bot.
    pub fn main_intent(&self) -> Intent {
        if self.is_private() {
            Intent::new(
                self.bridge.matrix.clone(),
                self.bridge.puppet_ids.mxid(self.key.uid.uin()),
            )
        } else {
            self.bridge.bot.clone()
        }
    }

    pub async fn queue_qq_event(&self, event: QqPortalEvent) {
        if self.qq_tx.send(Queued::new(event)).await.is_err() {
            warn!(portal = %self.key, "Portal worker is gone, dropping QQ event");
        }
    }

    pub async fn queue_matrix_event(&self, event: MatrixPortalEvent) {
        if self.matrix_tx.send(Queued::new(event)).await.is_err() {
            warn!(portal = %self.key, "Portal worker is gone, dropping Matrix event");
        }
    }

    async fn process(self: &Arc<Self>, item: WorkItem) {
        match item {
            WorkItem::Qq(event) => self.process_qq(event).await,
            WorkItem::Matrix(MatrixPortalEvent::Message { sender, event }) => {
                self.handle_matrix_message(&sender, event).await
            }
            WorkItem::Matrix(MatrixPortalEvent::Redaction { sender, event }) => {
                self.handle_matrix_redaction(&sender, event).await
            }
        }
    }

    async fn process_qq(self: &Arc<Self>, event: QqPortalEvent) {
        if self.mxid().is_none() {
            let source = match &event {
                QqPortalEvent::Message { source, message }
                    if message.elements.iter().any(|e| e.is_conversational()) =>
                {
                    source.clone()
                }
                QqPortalEvent::Fake { source, .. } => source.clone(),
                _ => {
                    debug!(portal = %self.key, "Not creating portal room for incoming event: not a chat message");
                    return;
                }
            };
            debug!(portal = %self.key, "Creating Matrix room from incoming message");
            if let Err(err) = self.create_matrix_room(&source, None).await {
                error!(portal = %self.key, error = %err, "Failed to create portal room");
                return;
            }
        }

        match event {
            QqPortalEvent::Message { source, message } => {
                self.handle_qq_message(&source, message).await
            }
            QqPortalEvent::Fake { message, .. } => self.handle_fake_message(message).await,
            QqPortalEvent::Revoke {
                operator, key, time, ..
            } => self.handle_qq_revoke(&operator, &key, time).await,
            QqPortalEvent::MemberJoined { source, member } => {
                self.handle_member_join(&source, &member).await
            }
            QqPortalEvent::MemberLeft {
                member, operator, ..
            } => self.handle_member_leave(&member, operator.as_deref()).await,
            QqPortalEvent::MemberCardChanged { member, card, .. } => {
                self.handle_member_card_change(&member, &card).await
            }
            QqPortalEvent::GroupLeft {
                source,
                operator,
                notice,
            } => self.handle_group_leave(&source, operator.as_deref(), notice).await,
        }
    }

    /// Creates the room at most once however many triggers race for it.
    pub async fn create_matrix_room(
        self: &Arc<Self>,
        user: &Arc<User>,
        group: Option<GroupSnapshot>,
    ) -> anyhow::Result<String> {
        if let Some(mxid) = self.mxid() {
            return Ok(mxid);
        }
        let _guard = self.create_lock.lock().await;
        if let Some(mxid) = self.mxid() {
            return Ok(mxid);
        }
        self.creating.store(true, Ordering::Release);
        let _creating = CreatingFlag(&self.creating);

        let intent = self.main_intent();
        intent
            .api()
            .ensure_registered(intent.user_id())
            .await
            .context("failed to register portal owner")?;
        let qq = user.client().context("QQ session is not connected")?;
        info!(portal = %self.key, user = %user.mxid, "Creating Matrix room");

        let mut group = group;
        if self.is_private() {
            let puppet = self.bridge.get_puppet(&self.key.uid).await?;
            puppet
                .sync_contact(&self.bridge, qq.as_ref(), true, "creating private chat portal")
                .await;
            let meta = puppet.snapshot();
            let mut record = self.record.lock();
            if self.bridge.config.bridge.private_chat_portal_meta {
                record.name = meta.displayname;
                record.avatar = meta.avatar;
                record.avatar_url = meta.avatar_url;
            } else {
                record.name.clear();
            }
            record.topic = PRIVATE_CHAT_TOPIC.to_string();
        } else {
            if group.is_none() {
                group = fetch_group_snapshot(qq.as_ref(), self.key.uid.uin()).await;
            }
            if let Some(snapshot) = &group {
                self.record.lock().name = snapshot.info.name.clone();
                self.refresh_avatar(&intent, qq.as_ref(), &snapshot.info.avatar_url)
                    .await;
            }
        }

        let record = self.snapshot();
        let (state_key, bridge_info) = self.bridge_info(&record);
        let mut initial_state = vec![
            StateEvent {
                event_type: EVENT_POWER_LEVELS.to_string(),
                state_key: String::new(),
                content: self.base_power_levels(&intent),
            },
            StateEvent {
                event_type: EVENT_BRIDGE.to_string(),
                state_key: state_key.clone(),
                content: bridge_info.clone(),
            },
            StateEvent {
                event_type: EVENT_HALF_SHOT_BRIDGE.to_string(),
                state_key,
                content: bridge_info,
            },
        ];
        let avatar_set = !record.avatar_url.is_empty();
        if avatar_set {
            initial_state.push(StateEvent {
                event_type: "m.room.avatar".to_string(),
                state_key: String::new(),
                content: json!({ "url": record.avatar_url }),
            });
        }

        let settings = &self.bridge.config.bridge;
        let mut invite = Vec::new();
        let encrypted = settings.encryption.default;
        if encrypted {
            initial_state.push(StateEvent {
                event_type: "m.room.encryption".to_string(),
                state_key: String::new(),
                content: json!({ "algorithm": MEGOLM_ALGORITHM }),
            });
            if self.is_private() {
                invite.push(self.bridge.bot.user_id().to_string());
            }
        }
        let creation_content = (!settings.federate_rooms).then(|| json!({ "m.federate": false }));

        let request = CreateRoomRequest {
            visibility: Some("private".to_string()),
            name: (!record.name.is_empty()).then(|| record.name.clone()),
            topic: (!record.topic.is_empty()).then(|| record.topic.clone()),
            preset: Some("private_chat".to_string()),
            is_direct: self.is_private(),
            invite,
            initial_state,
            creation_content,
            power_level_content_override: None,
        };
        let room_id = intent
            .api()
            .create_room(intent.user_id(), &request)
            .await
            .context("failed to create room")?;

        {
            let mut record = self.record.lock();
            record.name_set = !record.name.is_empty();
            record.topic_set = !record.topic.is_empty();
            record.avatar_set = avatar_set;
            record.encrypted = encrypted;
            record.mxid = Some(room_id.clone());
        }
        self.joined.lock().insert(intent.user_id().to_string());
        self.bridge.index_portal_mxid(&room_id, self.clone());
        if let Err(err) = self.save().await {
            warn!(portal = %self.key, error = %err, "Failed to save portal after creating room");
        }
        info!(portal = %self.key, room_id = %room_id, "Matrix room created");

        user.ensure_invited(&intent, &room_id).await;
        if self.is_private() && encrypted {
            if let Err(err) = self.bridge.bot.ensure_joined(&room_id).await {
                error!(room_id = %room_id, error = %err, "Failed to join created portal with bridge bot");
            }
        }
        if let Some(snapshot) = &group {
            self.sync_participants(user, qq.as_ref(), &snapshot.members)
                .await;
        }
        Ok(room_id)
    }

    pub async fn handle_qq_message(self: &Arc<Self>, source: &Arc<User>, message: QqMessage) {
        let _timer = ScopedTimer::new("qq_message");
        let Some(room_id) = self.mxid() else {
            warn!(portal = %self.key, "QQ message reached a portal without a room");
            return;
        };
        let key = message.key.clone();
        match self.dedup.is_duplicate(&key).await {
            Ok(true) => {
                global_metrics().record_duplicate();
                debug!(portal = %self.key, key = %key, "Not handling message: duplicate");
                return;
            }
            Ok(false) => {}
            Err(err) => warn!(portal = %self.key, key = %key, error = %err, "Duplicate check failed"),
        }

        let Some(qq) = source.client() else {
            warn!(portal = %self.key, "Dropping QQ message, session is gone");
            return;
        };
        if self.is_private() && message.sender == self.key.receiver.uin() {
            debug!(portal = %self.key, key = %key, "Not handling own message: no double puppet");
            return;
        }

        let sender = Uid::user(&message.sender);
        let puppet = match self.message_puppet(source, qq.as_ref(), &message).await {
            Ok(puppet) => puppet,
            Err(err) => {
                warn!(portal = %self.key, sender = %message.sender, error = %err, "No ghost for message sender");
                return;
            }
        };
        let intent = puppet.intent(&self.bridge.matrix);
        self.ensure_member(&intent, &room_id).await;

        let mentions = PortalMentions {
            bridge: &self.bridge,
        };
        let converter = QqToMatrix {
            intent: &intent,
            qq: qq.as_ref(),
            codec: self.bridge.codec.as_ref(),
            mentions: &mentions,
            encrypted: self.is_encrypted(),
            native_lone_image: self.bridge.config.bridge.native_lone_image,
        };
        let mut converted = converter.convert(&message.elements).await;
        if let Some(reply) = converted.reply.take() {
            self.apply_reply(&mut converted.content, &reply).await;
        }

        let mut record = MessageRecord::new(self.key.clone(), key.clone(), sender, message.time)
            .with_mxid(format!("{FAKE_MXID_PREFIX}{}", Uuid::new_v4()))
            .with_content(summarize(&message.elements));
        record.error = converted.error;
        match self.bridge.stores.messages.insert(&record).await {
            Ok(()) => {}
            Err(DatabaseError::Duplicate(_)) => {
                match self.bridge.stores.messages.get_by_message_key(&self.key, &key).await {
                    Ok(Some(existing)) if !is_delivered(&existing) => {
                        debug!(portal = %self.key, key = %key, "Retrying undelivered message");
                    }
                    _ => {
                        global_metrics().record_duplicate();
                        debug!(portal = %self.key, key = %key, "Not handling message: already stored");
                        return;
                    }
                }
            }
            Err(err) => {
                error!(portal = %self.key, key = %key, error = %err, "Failed to store message");
                return;
            }
        }

        let event_id = match intent
            .api()
            .send_message_event(
                intent.user_id(),
                &room_id,
                converted.event_type,
                &converted.content.to_value(),
                Some(message.time * 1000),
            )
            .await
        {
            Ok(event_id) => event_id,
            Err(err) => {
                error!(portal = %self.key, key = %key, error = %err, "Failed to send message to Matrix");
                return;
            }
        };

        if let Err(err) = self
            .bridge
            .stores
            .messages
            .update_mxid(&self.key, &key, &event_id, true)
            .await
        {
            warn!(portal = %self.key, key = %key, error = %err, "Failed to record delivered message");
        }
        if let Some(caption) = converted.caption.take()
            && let Err(err) = intent
                .send_message(&room_id, &caption, Some(message.time * 1000))
                .await
        {
            warn!(portal = %self.key, key = %key, error = %err, "Failed to send media caption");
        }
        self.dedup.mark_handled(&key);
        global_metrics().record_bridged("qq_to_matrix");
        debug!(portal = %self.key, key = %key, event_id = %event_id, "Handled QQ message");
    }

    /// Resolves the sending ghost, queueing a background refresh and doing a
    /// cheap inline sync the first time the ghost is seen.
    async fn message_puppet(
        self: &Arc<Self>,
        source: &Arc<User>,
        qq: &dyn QqClient,
        message: &QqMessage,
    ) -> DatabaseResult<Arc<Puppet>> {
        let puppet = self.bridge.get_puppet(&Uid::user(&message.sender)).await?;
        source.resync.enqueue_portal(self);
        source.resync.enqueue_puppet(&puppet);
        if puppet.name_quality() == NameQuality::Unset {
            let contact = ContactInfo {
                uin: message.sender.clone(),
                name: message.sender_name.clone(),
                remark: String::new(),
                avatar_url: user_avatar_url(&message.sender),
            };
            puppet.sync(&self.bridge, qq, &contact, false, false).await;
        }
        Ok(puppet)
    }

    /// Threads the event onto the replied message. Relay replies carry the
    /// message id only, so the exact key is tried before the seq/time window.
    async fn apply_reply(&self, content: &mut MessageContent, reply: &ReplyInfo) {
        let messages = &self.bridge.stores.messages;
        let window = self.bridge.config.bridge.reply_window_secs;
        let found = if reply.id.is_empty() {
            messages.get_by_reply(&self.key, &reply.seq, reply.time, window).await
        } else {
            let key = MessageKey::new(&reply.seq, &reply.id);
            match messages.get_by_message_key(&self.key, &key).await {
                Ok(None) if reply.time > 0 => {
                    messages.get_by_reply(&self.key, &reply.seq, reply.time, window).await
                }
                other => other,
            }
        };

        let mut sender = reply.sender.clone();
        match found {
            Ok(Some(record)) if !record.is_fake_mxid() => {
                content.set_reply(&record.mxid);
                return;
            }
            Ok(Some(record)) => {
                if sender.is_empty() {
                    sender = record.sender.uin().to_string();
                }
                debug!(portal = %self.key, seq = %reply.seq, "Reply target was never delivered");
            }
            Ok(None) => debug!(portal = %self.key, seq = %reply.seq, "Reply target not found"),
            Err(err) => warn!(portal = %self.key, seq = %reply.seq, error = %err, "Reply lookup failed"),
        }

        if sender.is_empty() || (content.msgtype != MSG_TEXT && content.msgtype != MSG_NOTICE) {
            return;
        }
        let name = match self.bridge.get_puppet(&Uid::user(&sender)).await {
            Ok(puppet) if !puppet.displayname().is_empty() => puppet.displayname(),
            _ => sender,
        };
        let mention = format!("@{name} ");
        content.body = format!("{mention}{}", content.body);
        if let Some(html) = content.formatted_body.as_mut() {
            *html = format!("{}{html}", escape_html(&mention));
        }
    }

    pub async fn handle_fake_message(self: &Arc<Self>, message: FakeMessage) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let ring_key = MessageKey::new("", format!("{FAKE_KEY_PREFIX}{}", message.id));
        if self.dedup.recently_handled(&ring_key) {
            debug!(portal = %self.key, id = %message.id, "Not handling fake message: recently handled");
            return;
        }
        if self.is_private() && message.sender == self.key.receiver {
            debug!(portal = %self.key, id = %message.id, "Not handling fake message: no double puppet");
            return;
        }

        let intent = Intent::new(
            self.bridge.matrix.clone(),
            self.bridge.puppet_ids.mxid(message.sender.uin()),
        );
        self.ensure_member(&intent, &room_id).await;
        let content = if message.important {
            MessageContent::text(message.text.clone())
        } else {
            MessageContent::notice(message.text.clone())
        };
        match intent
            .send_message(&room_id, &content, Some(message.time * 1000))
            .await
        {
            Ok(event_id) => {
                let mut record = MessageRecord::new(
                    self.key.clone(),
                    MessageKey::fake(&message.id),
                    message.sender.clone(),
                    message.time,
                )
                .with_mxid(event_id)
                .with_kind(MessageKind::Fake)
                .with_content(message.text);
                record.sent = true;
                if let Err(err) = self.bridge.stores.messages.insert(&record).await {
                    warn!(portal = %self.key, error = %err, "Failed to store fake message");
                }
                self.dedup.mark_handled(&ring_key);
            }
            Err(err) => error!(portal = %self.key, id = %message.id, error = %err, "Failed to send fake message"),
        }
    }

    pub async fn handle_qq_revoke(&self, operator: &str, key: &MessageKey, time: i64) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let messages = &self.bridge.stores.messages;
        let found = if key.id.is_empty() {
            let window = self.bridge.config.bridge.reply_window_secs;
            messages.get_by_reply(&self.key, &key.seq, time, window).await
        } else {
            messages.get_by_message_key(&self.key, key).await
        };
        let record = match found {
            Ok(Some(record)) if !record.is_fake() && !record.is_fake_mxid() => record,
            Ok(_) => {
                debug!(portal = %self.key, key = %key, "Ignoring recall of unknown message");
                return;
            }
            Err(err) => {
                warn!(portal = %self.key, key = %key, error = %err, "Recall lookup failed");
                return;
            }
        };

        let intent = Intent::new(self.bridge.matrix.clone(), self.bridge.puppet_ids.mxid(operator));
        match intent.redact(&room_id, &record.mxid).await {
            Ok(_) => {}
            Err(MatrixError::Forbidden(_)) => {
                if let Err(err) = self.main_intent().redact(&room_id, &record.mxid).await {
                    error!(portal = %self.key, event_id = %record.mxid, error = %err, "Failed to redact recalled message");
                }
            }
            Err(err) => {
                error!(portal = %self.key, event_id = %record.mxid, error = %err, "Failed to redact recalled message")
            }
        }
    }

    fn can_bridge_from(&self, sender: &User) -> Result<(), BridgeRefusal> {
        if !self.bridge.config.bridge.can_bridge_from(&sender.mxid) {
            return Err(BridgeRefusal::NoPermission);
        }
        if !sender.is_logged_in() {
            return Err(BridgeRefusal::NotLoggedIn);
        }
        if self.is_private() && sender.uin().as_deref() != Some(self.key.receiver.uin()) {
            return Err(BridgeRefusal::DifferentUser);
        }
        Ok(())
    }

    pub async fn handle_matrix_message(&self, sender: &Arc<User>, event: RoomEvent) {
        let _timer = ScopedTimer::new("matrix_message");
        match self.can_bridge_from(sender) {
            Ok(()) => {}
            Err(BridgeRefusal::NotLoggedIn) => {
                self.send_error_notice(&event, "you are not logged in to QQ")
                    .await;
                return;
            }
            Err(refusal) => {
                debug!(portal = %self.key, sender = %sender.mxid, ?refusal, "Not bridging Matrix message");
                return;
            }
        }
        let (Some(qq), Some(self_uid)) = (sender.client(), sender.uid()) else {
            return;
        };
        match self.bridge.stores.messages.get_by_mxid(&event.event_id).await {
            Ok(Some(_)) => {
                global_metrics().record_duplicate();
                debug!(portal = %self.key, event_id = %event.event_id, "Not sending event to QQ: already bridged");
                return;
            }
            Ok(None) => {}
            Err(err) => warn!(event_id = %event.event_id, error = %err, "Duplicate check failed"),
        }
        let Some(content) = event.message_content() else {
            warn!(event_id = %event.event_id, "Failed to parse Matrix message content");
            return;
        };

        let reply_to = match content.reply_to() {
            Some(reply_id) => match self.bridge.stores.messages.get_by_mxid(reply_id).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(event_id = %event.event_id, error = %err, "Reply lookup failed");
                    None
                }
            },
            None => None,
        };

        let converter = MatrixToQq {
            matrix: self.bridge.matrix.as_ref(),
            qq: qq.as_ref(),
            codec: self.bridge.codec.as_ref(),
            puppets: &self.bridge.puppet_ids,
            portal: &self.key,
            max_file_size: self.bridge.config.bridge.max_file_size,
        };
        let elements = match converter
            .convert(&event.event_type, &content, reply_to.as_ref())
            .await
        {
            Ok(elements) => elements,
            Err(err) => {
                warn!(event_id = %event.event_id, error = %err, "Failed to convert Matrix message");
                self.send_error_notice(&event, &err.to_string()).await;
                return;
            }
        };

        let summary = summarize(&elements);
        debug!(portal = %self.key, event_id = %event.event_id, "Sending event to QQ");
        let sent = if self.is_private() {
            qq.send_private_message(self.key.uid.uin(), elements).await
        } else {
            qq.send_group_message(self.key.uid.uin(), elements).await
        };
        match sent {
            Ok(receipt) => {
                let mut record = MessageRecord::new(
                    self.key.clone(),
                    receipt.key.clone(),
                    self_uid,
                    receipt.time,
                )
                .with_mxid(event.event_id.clone())
                .with_content(summary);
                record.sent = true;
                if let Err(err) = self.bridge.stores.messages.insert(&record).await {
                    warn!(portal = %self.key, key = %receipt.key, error = %err, "Failed to store sent message");
                }
                self.dedup.mark_handled(&receipt.key);
                global_metrics().record_bridged("matrix_to_qq");
            }
            Err(err) => {
                warn!(event_id = %event.event_id, error = %err, "Sending event to QQ failed");
                self.send_error_notice(&event, &err.to_string()).await;
            }
        }
    }

    async fn send_error_notice(&self, event: &RoomEvent, reason: &str) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let mut content = MessageContent::notice(format!("Your message was not bridged: {reason}"));
        content.set_reply(&event.event_id);
        if let Err(err) = self.main_intent().send_message(&room_id, &content, None).await {
            warn!(room_id = %room_id, error = %err, "Failed to send error notice");
        }
    }

    pub async fn handle_matrix_redaction(&self, sender: &Arc<User>, event: RoomEvent) {
        let Some(redacts) = event.redacts() else {
            return;
        };
        let record = match self.bridge.stores.messages.get_by_mxid(redacts).await {
            Ok(Some(record)) if !record.is_fake() => record,
            Ok(_) => return,
            Err(err) => {
                warn!(event_id = %redacts, error = %err, "Redaction lookup failed");
                return;
            }
        };
        let (Some(qq), Some(self_uin)) = (sender.client(), sender.uin()) else {
            return;
        };

        let result = if self.is_private() {
            if record.sender.uin() != self_uin {
                debug!(event_id = %redacts, "Not recalling another user's private message");
                return;
            }
            qq.recall_private_message(self.key.uid.uin(), &record.key, record.timestamp)
                .await
        } else {
            qq.recall_group_message(self.key.uid.uin(), &record.key).await
        };
        if let Err(err) = result {
            warn!(event_id = %redacts, key = %record.key, error = %err, "Failed to recall message on QQ");
        }
    }

    /// Sets the room name, as `set_by` when given. Returns whether the stored
    /// record changed.
    pub async fn update_name(&self, name: &str, set_by: Option<&Uid>) -> bool {
        let room_id = {
            let mut record = self.record.lock();
            if record.name == name && (record.name_set || record.mxid.is_none()) {
                return false;
            }
            debug!(portal = %self.key, "Updating name {:?} -> {:?}", record.name, name);
            record.name = name.to_string();
            record.name_set = false;
            record.mxid.clone()
        };
        let Some(room_id) = room_id else {
            return true;
        };
        let intent = self.acting_intent(set_by);
        let mut result = intent.set_room_name(&room_id, name).await;
        if matches!(result, Err(MatrixError::Forbidden(_))) && set_by.is_some() {
            result = self.main_intent().set_room_name(&room_id, name).await;
        }
        match result {
            Ok(_) => self.record.lock().name_set = true,
            Err(err) => warn!(portal = %self.key, error = %err, "Failed to set room name"),
        }
        true
    }

    pub async fn update_topic(&self, topic: &str, set_by: Option<&Uid>) -> bool {
        let room_id = {
            let mut record = self.record.lock();
            if record.topic == topic && (record.topic_set || record.mxid.is_none()) {
                return false;
            }
            debug!(portal = %self.key, "Updating topic {:?} -> {:?}", record.topic, topic);
            record.topic = topic.to_string();
            record.topic_set = false;
            record.mxid.clone()
        };
        let Some(room_id) = room_id else {
            return true;
        };
        let intent = self.acting_intent(set_by);
        let mut result = intent.set_room_topic(&room_id, topic).await;
        if matches!(result, Err(MatrixError::Forbidden(_))) && set_by.is_some() {
            result = self.main_intent().set_room_topic(&room_id, topic).await;
        }
        match result {
            Ok(_) => self.record.lock().topic_set = true,
            Err(err) => warn!(portal = %self.key, error = %err, "Failed to set room topic"),
        }
        true
    }

    /// Points the room avatar at an already uploaded `mxc`.
    pub async fn update_avatar(&self, avatar: &str, mxc: &str, set_by: Option<&Uid>) -> bool {
        let room_id = {
            let mut record = self.record.lock();
            if record.avatar_url == mxc && (record.avatar_set || record.mxid.is_none()) {
                return false;
            }
            record.avatar = avatar.to_string();
            record.avatar_url = mxc.to_string();
            record.avatar_set = false;
            record.mxid.clone()
        };
        let Some(room_id) = room_id else {
            return true;
        };
        let intent = self.acting_intent(set_by);
        let mut result = intent.set_room_avatar(&room_id, mxc).await;
        if matches!(result, Err(MatrixError::Forbidden(_))) && set_by.is_some() {
            result = self.main_intent().set_room_avatar(&room_id, mxc).await;
        }
        match result {
            Ok(_) => self.record.lock().avatar_set = true,
            Err(err) => warn!(portal = %self.key, error = %err, "Failed to set room avatar"),
        }
        true
    }

    /// Reuploads a group avatar when its source URL changed.
    async fn refresh_avatar(&self, intent: &Intent, qq: &dyn QqClient, url: &str) -> bool {
        {
            let record = self.record.lock();
            if url.is_empty() || (record.avatar == url && !record.avatar_url.is_empty()) {
                return false;
            }
        }
        match reupload_avatar(intent, qq, url).await {
            Ok(mxc) => self.update_avatar(url, &mxc, None).await,
            Err(err) => {
                warn!(portal = %self.key, error = %err, "Failed to reupload group avatar");
                false
            }
        }
    }

    fn acting_intent(&self, set_by: Option<&Uid>) -> Intent {
        match set_by {
            Some(uid) => Intent::new(self.bridge.matrix.clone(), self.bridge.puppet_ids.mxid(uid.uin())),
            None => self.main_intent(),
        }
    }

    /// Mirrors the peer ghost's name and avatar onto a private chat room.
    pub async fn apply_puppet_meta(&self, puppet: &PuppetRecord) {
        if !self.is_private() || puppet.uid != self.key.uid || self.mxid().is_none() {
            return;
        }
        let mut changed = self.update_name(&puppet.displayname, None).await;
        if !puppet.avatar_url.is_empty() {
            changed |= self
                .update_avatar(&puppet.avatar, &puppet.avatar_url, None)
                .await;
        }
        if changed {
            self.update_bridge_info().await;
            if let Err(err) = self.save().await {
                warn!(portal = %self.key, error = %err, "Failed to save portal");
            }
        }
    }

    /// Brings room metadata and membership in line with QQ. Saves when
    /// something changed or the last sync is a day old.
    pub async fn update_matrix_room(&self, user: &Arc<User>, group: Option<GroupSnapshot>) -> bool {
        let Some(room_id) = self.mxid() else {
            return false;
        };
        info!(portal = %self.key, user = %user.mxid, "Syncing portal");
        let intent = self.main_intent();
        user.ensure_invited(&intent, &room_id).await;

        let mut update = false;
        if self.is_private() {
            update |= self.update_topic(PRIVATE_CHAT_TOPIC, None).await;
        } else if let (Some(snapshot), Some(qq)) = (group, user.client()) {
            self.sync_participants(user, qq.as_ref(), &snapshot.members)
                .await;
            update |= self.update_name(&snapshot.info.name, None).await;
            update |= self
                .refresh_avatar(&intent, qq.as_ref(), &snapshot.info.avatar_url)
                .await;
        }

        let stale = self.last_sync() + Duration::hours(24) < Utc::now();
        if update || stale {
            self.record.lock().last_sync = Utc::now();
            if let Err(err) = self.save().await {
                warn!(portal = %self.key, error = %err, "Failed to save portal");
            }
            self.update_bridge_info().await;
        }
        true
    }

    fn bridge_info(&self, record: &PortalRecord) -> (String, Value) {
        let state_key = format!("net.qq.bridge://qq/{}", self.key.uid.uin());
        let mut channel = json!({
            "id": self.key.uid.uin(),
            "displayname": record.name,
        });
        if !record.avatar_url.is_empty() {
            channel["avatar_url"] = json!(record.avatar_url);
        }
        let content = json!({
            "bridgebot": self.bridge.bot.user_id(),
            "creator": self.main_intent().user_id(),
            "protocol": {
                "id": "qq",
                "displayname": "QQ",
                "external_url": "https://im.qq.com/",
            },
            "channel": channel,
        });
        (state_key, content)
    }

    pub async fn update_bridge_info(&self) {
        let Some(room_id) = self.mxid() else {
            debug!(portal = %self.key, "Not updating bridge info: no Matrix room created");
            return;
        };
        let (state_key, content) = self.bridge_info(&self.snapshot());
        let intent = self.main_intent();
        for event_type in [EVENT_BRIDGE, EVENT_HALF_SHOT_BRIDGE] {
            if let Err(err) = intent
                .send_state(&room_id, event_type, &state_key, content.clone())
                .await
            {
                warn!(portal = %self.key, event_type, error = %err, "Failed to update bridge info");
            }
        }
    }

    fn base_power_levels(&self, main: &Intent) -> Value {
        let invite = if self.bridge.config.bridge.allow_user_invite {
            0
        } else {
            50
        };
        json!({
            "users_default": 0,
            "events_default": 0,
            "redact": 0,
            "state_default": 99,
            "ban": 99,
            "invite": invite,
            "users": { main.user_id(): 100 },
            "events": {
                "m.room.name": 0,
                "m.room.avatar": 0,
                "m.room.topic": 0,
                "m.reaction": 0,
                "m.room.redaction": 0,
            },
        })
    }

    pub async fn sync_participants(
        &self,
        user: &Arc<User>,
        qq: &dyn QqClient,
        members: &[GroupMember],
    ) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let main = self.main_intent();
        let (mut levels, mut changed) = match main
            .api()
            .get_state_event(&room_id, EVENT_POWER_LEVELS, "")
            .await
        {
            Ok(Some(levels)) => (levels, false),
            _ => (self.base_power_levels(&main), true),
        };
        changed |= ensure_event_level(&mut levels, "m.reaction", 0);
        changed |= ensure_event_level(&mut levels, "m.room.redaction", 0);

        let mut present = HashSet::new();
        for member in members {
            let puppet = match self.bridge.get_puppet(&Uid::user(&member.uin)).await {
                Ok(puppet) => puppet,
                Err(err) => {
                    warn!(portal = %self.key, uin = %member.uin, error = %err, "Failed to load participant ghost");
                    continue;
                }
            };
            present.insert(puppet.mxid.clone());
            puppet
                .sync(&self.bridge, qq, &member.as_contact(), false, false)
                .await;
            let intent = puppet.intent(&self.bridge.matrix);
            self.ensure_member(&intent, &room_id).await;
            self.update_room_nickname(&puppet, member).await;

            let level = member_level(member.role);
            changed |= ensure_user_level(&mut levels, &puppet.mxid, level);
            if let Some(local) = self.bridge.get_user_by_uin(&member.uin) {
                if local.mxid != user.mxid {
                    local.ensure_invited(&main, &room_id).await;
                }
                changed |= ensure_user_level(&mut levels, &local.mxid, level);
            }
        }

        if changed
            && let Err(err) = main
                .send_state(&room_id, EVENT_POWER_LEVELS, "", levels)
                .await
        {
            error!(portal = %self.key, error = %err, "Failed to change power levels");
        }
        self.kick_extra_users(&room_id, &present).await;
        debug!(portal = %self.key, "Participant sync completed");
    }

    async fn kick_extra_users(&self, room_id: &str, present: &HashSet<String>) {
        let main = self.main_intent();
        let joined = match main.api().joined_members(room_id).await {
            Ok(joined) => joined,
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "Failed to get member list");
                return;
            }
        };
        for member in joined {
            if self.bridge.puppet_ids.is_puppet(&member) && !present.contains(&member) {
                if let Err(err) = main.kick(room_id, &member, KICK_REASON_LEFT).await {
                    warn!(room_id = %room_id, user_id = %member, error = %err, "Failed to kick user who had left");
                } else {
                    self.joined.lock().remove(&member);
                }
            }
        }
    }

    /// Uses the member's group card as the ghost's per-room display name.
    pub async fn update_room_nickname(&self, puppet: &Puppet, member: &GroupMember) {
        if member.card.is_empty() {
            return;
        }
        let Some(room_id) = self.mxid() else {
            return;
        };
        let contact = ContactInfo {
            uin: member.uin.clone(),
            name: member.card.clone(),
            ..Default::default()
        };
        let (nickname, _) = self.bridge.config.bridge.format_displayname(&contact);
        let api = &self.bridge.matrix;
        let mut content = match api.get_state_event(&room_id, EVENT_MEMBER, &puppet.mxid).await {
            Ok(Some(content)) => content,
            _ => json!({ "membership": "join" }),
        };
        if content.get("displayname").and_then(Value::as_str) == Some(nickname.as_str()) {
            return;
        }
        content["displayname"] = json!(nickname);
        let avatar = puppet.avatar_url();
        if !avatar.is_empty() && content.get("avatar_url").is_none() {
            content["avatar_url"] = json!(avatar);
        }
        if let Err(err) = puppet
            .intent(api)
            .send_state(&room_id, EVENT_MEMBER, &puppet.mxid, content)
            .await
        {
            warn!(room_id = %room_id, user_id = %puppet.mxid, error = %err, "Failed to set room nickname");
        }
    }

    pub async fn handle_member_join(&self, source: &Arc<User>, member: &str) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let puppet = match self.bridge.get_puppet(&Uid::user(member)).await {
            Ok(puppet) => puppet,
            Err(err) => {
                warn!(portal = %self.key, uin = %member, error = %err, "Failed to load joined member");
                return;
            }
        };
        if let Some(qq) = source.client() {
            puppet
                .sync_contact(&self.bridge, qq.as_ref(), true, "handling QQ join")
                .await;
        }
        self.ensure_member(&puppet.intent(&self.bridge.matrix), &room_id)
            .await;
    }

    pub async fn handle_member_leave(&self, member: &str, operator: Option<&str>) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let target = self.bridge.puppet_ids.mxid(member);
        let target_intent = Intent::new(self.bridge.matrix.clone(), target.clone());
        match operator.filter(|op| *op != member) {
            None => {
                if let Err(err) = target_intent.leave(&room_id).await {
                    warn!(room_id = %room_id, user_id = %target, error = %err, "Failed to leave portal");
                    let _ = self.main_intent().kick(&room_id, &target, "").await;
                }
            }
            Some(operator) => {
                let kicker = self.acting_intent(Some(&Uid::user(operator)));
                let mut result = kicker.kick(&room_id, &target, "").await;
                if matches!(result, Err(MatrixError::Forbidden(_))) {
                    result = self.main_intent().kick(&room_id, &target, "").await;
                }
                if let Err(err) = result {
                    warn!(room_id = %room_id, user_id = %target, error = %err, "Failed to kick member");
                    let _ = target_intent.leave(&room_id).await;
                }
            }
        }
        self.joined.lock().remove(&target);
        self.cleanup_if_empty().await;
    }

    pub async fn handle_member_card_change(&self, member: &str, card: &str) {
        let puppet = match self.bridge.get_puppet(&Uid::user(member)).await {
            Ok(puppet) => puppet,
            Err(err) => {
                warn!(portal = %self.key, uin = %member, error = %err, "Failed to load member");
                return;
            }
        };
        let info = GroupMember {
            uin: member.to_string(),
            card: card.to_string(),
            ..Default::default()
        };
        self.update_room_nickname(&puppet, &info).await;
    }

    /// The logged in account left or was removed from the group.
    pub async fn handle_group_leave(
        self: &Arc<Self>,
        source: &Arc<User>,
        operator: Option<&str>,
        notice: FakeMessage,
    ) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        info!(portal = %self.key, operator = ?operator, "Left QQ group");
        self.handle_fake_message(notice).await;
        if let Err(err) = self
            .main_intent()
            .kick(&room_id, &source.mxid, "You left this QQ group")
            .await
        {
            warn!(room_id = %room_id, user_id = %source.mxid, error = %err, "Failed to kick user from left group");
        }
        self.cleanup_if_empty().await;
    }

    async fn ensure_member(&self, intent: &Intent, room_id: &str) -> bool {
        if self.joined.lock().contains(intent.user_id()) {
            return true;
        }
        match intent.ensure_joined(room_id).await {
            Ok(()) => {
                self.joined.lock().insert(intent.user_id().to_string());
                true
            }
            Err(err) => {
                warn!(room_id = %room_id, user_id = %intent.user_id(), error = %err, "Failed to join portal");
                false
            }
        }
    }

    pub async fn save(&self) -> DatabaseResult<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Ok(());
        }
        let record = self.snapshot();
        let portals = &self.bridge.stores.portals;
        if self.persisted.load(Ordering::Acquire) {
            portals.update(&record).await
        } else {
            portals.insert(&record).await?;
            self.persisted.store(true, Ordering::Release);
            Ok(())
        }
    }

    /// Drops the mapping. A later event for the same key gets a new portal.
    pub async fn delete(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        let mxid = self.mxid();
        if let Err(err) = self.bridge.stores.portals.delete(&self.key).await {
            warn!(portal = %self.key, error = %err, "Failed to delete portal");
        }
        if let Err(err) = self.bridge.stores.messages.delete_all(&self.key).await {
            warn!(portal = %self.key, error = %err, "Failed to delete portal messages");
        }
        self.bridge.forget_portal(&self.key, mxid.as_deref());
        info!(portal = %self.key, "Portal deleted");
    }

    /// Matrix users in the room other than ghosts and the bot.
    async fn matrix_users(&self, room_id: &str) -> Result<Vec<String>, MatrixError> {
        let joined = self.main_intent().api().joined_members(room_id).await?;
        let bot = self.bridge.bot.user_id();
        Ok(joined
            .into_iter()
            .filter(|member| member != bot && !self.bridge.puppet_ids.is_puppet(member))
            .collect())
    }

    pub async fn cleanup_if_empty(&self) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        match self.matrix_users(&room_id).await {
            Ok(users) if users.is_empty() => {
                info!(portal = %self.key, room_id = %room_id, "Room seems to be empty, cleaning up");
                self.delete().await;
                self.cleanup(&room_id).await;
            }
            Ok(_) => {}
            Err(err) => {
                error!(room_id = %room_id, error = %err, "Failed to get Matrix user list for cleanup check")
            }
        }
    }

    /// Ghosts leave, everyone else is kicked, then the owner leaves.
    pub async fn cleanup(&self, room_id: &str) {
        let main = self.main_intent();
        let joined = match main.api().joined_members(room_id).await {
            Ok(joined) => joined,
            Err(err) => {
                error!(room_id = %room_id, error = %err, "Failed to get portal members for cleanup");
                return;
            }
        };
        for member in joined {
            if member == main.user_id() {
                continue;
            }
            if self.bridge.puppet_ids.is_puppet(&member) {
                let ghost = Intent::new(self.bridge.matrix.clone(), member.clone());
                if let Err(err) = ghost.leave(room_id).await {
                    error!(room_id = %room_id, user_id = %member, error = %err, "Error leaving as ghost while cleaning up portal");
                }
            } else if let Err(err) = main.kick(room_id, &member, KICK_REASON_DELETING).await {
                error!(room_id = %room_id, user_id = %member, error = %err, "Error kicking user while cleaning up portal");
            }
        }
        if let Err(err) = main.leave(room_id).await {
            error!(room_id = %room_id, error = %err, "Error leaving with main intent while cleaning up portal");
        }
    }
}

async fn fetch_group_snapshot(qq: &dyn QqClient, code: &str) -> Option<GroupSnapshot> {
    let info = match qq.fetch_group_info(code).await {
        Ok(info) => info,
        Err(err) => {
            warn!(group = %code, error = %err, "Failed to get group info");
            return None;
        }
    };
    match qq.fetch_group_members(code).await {
        Ok(members) => Some(GroupSnapshot { info, members }),
        Err(err) => {
            warn!(group = %code, error = %err, "Failed to get group members");
            None
        }
    }
}

async fn run_worker(portal: Weak<Portal>, mut receivers: PortalReceivers) {
    loop {
        let item = tokio::select! {
            biased;
            Some(queued) = receivers.qq.recv() => WorkItem::Qq(queued.event),
            Some(queued) = receivers.matrix.recv() => WorkItem::Matrix(queued.event),
            else => break,
        };
        let Some(portal) = portal.upgrade() else {
            break;
        };
        let label = item.label();
        if let Err(panic) = AssertUnwindSafe(portal.process(item)).catch_unwind().await {
            global_metrics().record_worker_panic();
            error!(portal = %portal.key, item = label, panic = %panic_message(&*panic), "Panic while processing portal event");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn member_level(role: MemberRole) -> i64 {
    match role {
        MemberRole::Owner => 95,
        MemberRole::Admin => 50,
        MemberRole::Member => 0,
    }
}

/// Sets `users[user_id]`; level 0 is the default and is stored as absent.
fn ensure_user_level(levels: &mut Value, user_id: &str, level: i64) -> bool {
    ensure_level(levels, "users", user_id, level)
}

fn ensure_event_level(levels: &mut Value, event_type: &str, level: i64) -> bool {
    ensure_level(levels, "events", event_type, level)
}

fn ensure_level(levels: &mut Value, section: &str, key: &str, level: i64) -> bool {
    let Some(levels) = levels.as_object_mut() else {
        return false;
    };
    let entries = levels.entry(section).or_insert_with(|| json!({}));
    let Some(entries) = entries.as_object_mut() else {
        return false;
    };
    let current = entries.get(key).and_then(Value::as_i64);
    match current {
        Some(existing) if existing == level => false,
        None if level == 0 && section == "users" => false,
        _ => {
            if level == 0 && section == "users" {
                entries.remove(key);
            } else {
                entries.insert(key.to_string(), json!(level));
            }
            true
        }
    }
}

/// Resolves QQ mentions to local Matrix users first, then to ghosts.
struct PortalMentions<'a> {
    bridge: &'a Arc<QqBridge>,
}

#[async_trait]
impl MentionResolver for PortalMentions<'_> {
    async fn resolve_mention(&self, uin: &str) -> Option<(String, String)> {
        if let Some(user) = self.bridge.get_user_by_uin(uin) {
            return Some((user.mxid.clone(), user.mxid.clone()));
        }
        let puppet = self.bridge.get_puppet(&Uid::user(uin)).await.ok()?;
        let name = puppet.displayname();
        let name = if name.is_empty() { uin.to_string() } else { name };
        Some((puppet.mxid.clone(), name))
    }
}
