#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use matrix_bridge_qq::bridge::{QqBridge, User};
use matrix_bridge_qq::config::Config;
use matrix_bridge_qq::database::MemoryStores;
use matrix_bridge_qq::matrix::{CreateRoomRequest, MatrixApi, MatrixError, RoomEvent};
use matrix_bridge_qq::qq::{
    AudioCodec, ChatType, CodecError, ContactInfo, GroupInfo, GroupMember, MessageKey, QqClient,
    QqElement, QqError, QqMessage, SendReceipt, SharedQqClient,
};
use parking_lot::Mutex;
use serde_json::Value;

pub const SELF_UIN: &str = "10000";
pub const OWNER: &str = "@alice:example.org";
pub const BOT: &str = "@qqbot:example.org";

pub const BASE_CONFIG: &str = r#"
homeserver:
  address: http://localhost:8008
  domain: example.org
appservice:
  address: http://localhost:17777
  hostname: 127.0.0.1
  port: 17777
  id: qq
  as_token: astoken123
  hs_token: hstoken123
  database:
    type: memory
    uri: ":memory:"
  bot:
    username: qqbot
    displayname: QQ bridge bot
bridge:
  permissions:
    example.org: user
qq:
  relay_url: ws://127.0.0.1:3001
  owner: "@alice:example.org"
logging:
  min_level: debug
"#;

#[derive(Debug, Clone)]
pub struct SentEvent {
    pub as_user: String,
    pub room_id: String,
    pub event_type: String,
    pub content: Value,
    pub ts: Option<i64>,
    pub event_id: String,
}

/// Homeserver stand-in that records every call.
pub struct MockMatrix {
    bot: String,
    next_id: AtomicU64,
    pub create_room_calls: AtomicU64,
    pub upload_calls: AtomicU64,
    pub create_delay: Duration,
    pub created: Mutex<Vec<CreateRoomRequest>>,
    pub sent: Mutex<Vec<SentEvent>>,
    pub state: Mutex<HashMap<(String, String, String), Value>>,
    pub members: Mutex<HashMap<String, BTreeSet<String>>>,
    pub redactions: Mutex<Vec<(String, String, String)>>,
    pub kicks: Mutex<Vec<(String, String, String)>>,
    pub invites: Mutex<Vec<(String, String)>>,
    pub media: Mutex<HashMap<String, Vec<u8>>>,
    pub forbid_redact: Mutex<HashSet<String>>,
    pub fail_next_send: AtomicBool,
}

impl MockMatrix {
    pub fn new(create_delay: Duration) -> Self {
        Self {
            bot: BOT.to_string(),
            next_id: AtomicU64::new(1),
            create_room_calls: AtomicU64::new(0),
            upload_calls: AtomicU64::new(0),
            create_delay,
            created: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            state: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
            redactions: Mutex::new(Vec::new()),
            kicks: Mutex::new(Vec::new()),
            invites: Mutex::new(Vec::new()),
            media: Mutex::new(HashMap::new()),
            forbid_redact: Mutex::new(HashSet::new()),
            fail_next_send: AtomicBool::new(false),
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn messages(&self) -> Vec<SentEvent> {
        self.sent.lock().clone()
    }

    pub fn put_media(&self, mxc: &str, data: Vec<u8>) {
        self.media.lock().insert(mxc.to_string(), data);
    }

    pub fn join(&self, room_id: &str, user_id: &str) {
        self.members
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }
}

#[async_trait]
impl MatrixApi for MockMatrix {
    fn bot_user_id(&self) -> String {
        self.bot.clone()
    }

    async fn ensure_registered(&self, _user_id: &str) -> Result<(), MatrixError> {
        Ok(())
    }

    async fn create_room(
        &self,
        as_user: &str,
        request: &CreateRoomRequest,
    ) -> Result<String, MatrixError> {
        self.create_room_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.create_delay).await;
        let room_id = format!("!room{}:example.org", self.id());
        self.join(&room_id, as_user);
        let mut state = self.state.lock();
        for event in &request.initial_state {
            state.insert(
                (room_id.clone(), event.event_type.clone(), event.state_key.clone()),
                event.content.clone(),
            );
        }
        self.created.lock().push(request.clone());
        Ok(room_id)
    }

    async fn send_message_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: &Value,
        ts: Option<i64>,
    ) -> Result<String, MatrixError> {
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(MatrixError::Transport("connection reset".to_string()));
        }
        let event_id = format!("$event{}", self.id());
        self.sent.lock().push(SentEvent {
            as_user: as_user.to_string(),
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            content: content.clone(),
            ts,
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn send_state_event(
        &self,
        _as_user: &str,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, MatrixError> {
        self.state.lock().insert(
            (room_id.to_string(), event_type.to_string(), state_key.to_string()),
            content.clone(),
        );
        Ok(format!("$state{}", self.id()))
    }

    async fn get_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, MatrixError> {
        Ok(self
            .state
            .lock()
            .get(&(room_id.to_string(), event_type.to_string(), state_key.to_string()))
            .cloned())
    }

    async fn get_event(&self, _room_id: &str, event_id: &str) -> Result<RoomEvent, MatrixError> {
        Err(MatrixError::NotFound(event_id.to_string()))
    }

    async fn redact_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_id: &str,
        _reason: Option<&str>,
    ) -> Result<String, MatrixError> {
        if self.forbid_redact.lock().contains(as_user) {
            return Err(MatrixError::Forbidden("insufficient power level".to_string()));
        }
        self.redactions.lock().push((
            as_user.to_string(),
            room_id.to_string(),
            event_id.to_string(),
        ));
        Ok(format!("$redaction{}", self.id()))
    }

    async fn upload_media(
        &self,
        _as_user: &str,
        data: Vec<u8>,
        _content_type: &str,
        _filename: &str,
    ) -> Result<String, MatrixError> {
        self.upload_calls.fetch_add(1, Ordering::Relaxed);
        let mxc = format!("mxc://example.org/media{}", self.id());
        self.put_media(&mxc, data);
        Ok(mxc)
    }

    async fn download_media(&self, mxc: &str) -> Result<Vec<u8>, MatrixError> {
        self.media
            .lock()
            .get(mxc)
            .cloned()
            .ok_or_else(|| MatrixError::NotFound(mxc.to_string()))
    }

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, MatrixError> {
        Ok(self
            .members
            .lock()
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn invite_user(
        &self,
        _as_user: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), MatrixError> {
        self.invites
            .lock()
            .push((room_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn join_room(&self, as_user: &str, room_id: &str) -> Result<(), MatrixError> {
        self.join(room_id, as_user);
        Ok(())
    }

    async fn leave_room(&self, as_user: &str, room_id: &str) -> Result<(), MatrixError> {
        if let Some(members) = self.members.lock().get_mut(room_id) {
            members.remove(as_user);
        }
        Ok(())
    }

    async fn kick_user(
        &self,
        as_user: &str,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), MatrixError> {
        if let Some(members) = self.members.lock().get_mut(room_id) {
            members.remove(user_id);
        }
        self.kicks.lock().push((
            as_user.to_string(),
            user_id.to_string(),
            reason.to_string(),
        ));
        Ok(())
    }

    async fn set_displayname(&self, _user_id: &str, _name: &str) -> Result<(), MatrixError> {
        Ok(())
    }

    async fn set_avatar_url(&self, _user_id: &str, _mxc: &str) -> Result<(), MatrixError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentQq {
    pub target: String,
    pub group: bool,
    pub elements: Vec<QqElement>,
}

/// QQ session stand-in that records every send and recall.
pub struct MockQq {
    self_uin: String,
    next_seq: AtomicU64,
    pub send_calls: AtomicU64,
    pub panic_on_next_send: AtomicBool,
    pub sent: Mutex<Vec<SentQq>>,
    pub recalls: Mutex<Vec<MessageKey>>,
    pub attachments: Mutex<HashMap<String, Vec<u8>>>,
    pub friends: Mutex<HashMap<String, ContactInfo>>,
    pub groups: Mutex<HashMap<String, (GroupInfo, Vec<GroupMember>)>>,
}

impl MockQq {
    pub fn new(self_uin: &str) -> Self {
        Self {
            self_uin: self_uin.to_string(),
            next_seq: AtomicU64::new(500),
            send_calls: AtomicU64::new(0),
            panic_on_next_send: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            recalls: Mutex::new(Vec::new()),
            attachments: Mutex::new(HashMap::new()),
            friends: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_friend(&self, uin: &str, name: &str) {
        self.friends.lock().insert(
            uin.to_string(),
            ContactInfo {
                uin: uin.to_string(),
                name: name.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn add_group(&self, code: &str, name: &str, members: Vec<GroupMember>) {
        let info = GroupInfo {
            code: code.to_string(),
            name: name.to_string(),
            avatar_url: String::new(),
            member_count: members.len() as u32,
        };
        self.groups.lock().insert(code.to_string(), (info, members));
    }

    fn receipt(&self) -> SendReceipt {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed).to_string();
        SendReceipt {
            key: MessageKey::new(seq.clone(), seq),
            time: chrono::Utc::now().timestamp(),
        }
    }

    fn record_send(&self, target: &str, group: bool, elements: Vec<QqElement>) -> SendReceipt {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_next_send.swap(false, Ordering::SeqCst) {
            panic!("relay exploded");
        }
        self.sent.lock().push(SentQq {
            target: target.to_string(),
            group,
            elements,
        });
        self.receipt()
    }
}

#[async_trait]
impl QqClient for MockQq {
    fn self_uin(&self) -> Option<String> {
        Some(self.self_uin.clone())
    }

    async fn send_private_message(
        &self,
        target: &str,
        elements: Vec<QqElement>,
    ) -> Result<SendReceipt, QqError> {
        Ok(self.record_send(target, false, elements))
    }

    async fn send_group_message(
        &self,
        group: &str,
        elements: Vec<QqElement>,
    ) -> Result<SendReceipt, QqError> {
        Ok(self.record_send(group, true, elements))
    }

    async fn recall_private_message(
        &self,
        _peer: &str,
        key: &MessageKey,
        _time: i64,
    ) -> Result<(), QqError> {
        self.recalls.lock().push(key.clone());
        Ok(())
    }

    async fn recall_group_message(&self, _group: &str, key: &MessageKey) -> Result<(), QqError> {
        self.recalls.lock().push(key.clone());
        Ok(())
    }

    async fn download_attachment(&self, url: &str) -> Result<Vec<u8>, QqError> {
        self.attachments
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| QqError::Transport(format!("404 for {url}")))
    }

    async fn fetch_user_info(&self, uin: &str) -> Result<ContactInfo, QqError> {
        Ok(self.friends.lock().get(uin).cloned().unwrap_or(ContactInfo {
            uin: uin.to_string(),
            ..Default::default()
        }))
    }

    async fn find_friend(&self, uin: &str) -> Result<Option<ContactInfo>, QqError> {
        Ok(self.friends.lock().get(uin).cloned())
    }

    async fn fetch_group_info(&self, code: &str) -> Result<GroupInfo, QqError> {
        self.groups
            .lock()
            .get(code)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| QqError::Api {
                action: "get_group_info".to_string(),
                retcode: 100,
                message: "no such group".to_string(),
            })
    }

    async fn fetch_group_members(&self, code: &str) -> Result<Vec<GroupMember>, QqError> {
        Ok(self
            .groups
            .lock()
            .get(code)
            .map(|(_, members)| members.clone())
            .unwrap_or_default())
    }
}

pub struct PassthroughCodec;

#[async_trait]
impl AudioCodec for PassthroughCodec {
    async fn silk_to_ogg(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(data)
    }

    async fn ogg_to_silk(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(data)
    }
}

pub struct Harness {
    pub bridge: Arc<QqBridge>,
    pub matrix: Arc<MockMatrix>,
    pub qq: Arc<MockQq>,
    pub user: Arc<User>,
}

pub async fn harness() -> Harness {
    harness_with(BASE_CONFIG, Duration::ZERO).await
}

pub async fn harness_with(config: &str, create_delay: Duration) -> Harness {
    let config = Config::load_from_bytes(config.as_bytes()).expect("test config should load");
    let stores = MemoryStores::new().stores();
    let matrix = Arc::new(MockMatrix::new(create_delay));
    let qq = Arc::new(MockQq::new(SELF_UIN));
    let bridge = QqBridge::new(
        Arc::new(config),
        stores,
        matrix.clone(),
        Arc::new(PassthroughCodec),
    )
    .expect("bridge should build");
    let user = bridge
        .get_user_by_mxid(OWNER)
        .await
        .expect("owner should load");
    let client: SharedQqClient = qq.clone();
    user.login(&bridge, client, SELF_UIN)
        .await
        .expect("login should persist");
    Harness {
        bridge,
        matrix,
        qq,
        user,
    }
}

pub fn group_message(code: &str, sender: &str, seq: &str, elements: Vec<QqElement>) -> QqMessage {
    QqMessage {
        chat_type: ChatType::Group,
        group: Some(code.to_string()),
        sender: sender.to_string(),
        sender_name: format!("user{sender}"),
        target: code.to_string(),
        key: MessageKey::new(seq, seq),
        time: 1_700_000_000,
        elements,
    }
}

pub fn private_message(sender: &str, seq: &str, elements: Vec<QqElement>) -> QqMessage {
    QqMessage {
        chat_type: ChatType::Private,
        group: None,
        sender: sender.to_string(),
        sender_name: format!("user{sender}"),
        target: SELF_UIN.to_string(),
        key: MessageKey::new(seq, seq),
        time: 1_700_000_000,
        elements,
    }
}

/// Polls until `check` holds, giving the portal workers time to drain.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Waits a little and confirms nothing else shows up.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
