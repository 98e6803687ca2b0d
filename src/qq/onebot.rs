//! QQ session backed by a OneBot v11 relay (NapCat, Lagrange.OneBot and
//! friends) reached over a forward websocket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use super::client::{QqClient, QqError};
use super::id::{ChatType, MessageKey};
use super::types::{
    AT_ALL_TARGET, ContactInfo, GroupInfo, GroupMember, MediaSource, MemberRole, QqElement,
    QqEvent, QqMessage, SendReceipt,
};

#[derive(Debug, Clone)]
pub struct OneBotConfig {
    pub relay_url: String,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
    pub reconnect_backoff: Duration,
}

#[derive(Clone)]
pub struct OneBotClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: OneBotConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    self_uin: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl OneBotClient {
    pub fn new(config: OneBotConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                self_uin: RwLock::new(None),
                http: reqwest::Client::new(),
            }),
        }
    }

    /// Starts the connection loop and returns the stream of relay events.
    pub fn spawn(&self, buffer: usize) -> mpsc::Receiver<QqEvent> {
        let (events_tx, events_rx) = mpsc::channel(buffer.max(1));
        let client = self.clone();
        tokio::spawn(async move { client.run(events_tx).await });
        events_rx
    }

    async fn run(self, events: mpsc::Sender<QqEvent>) {
        loop {
            let reason = match self.connect_once(&events).await {
                Ok(()) => "relay closed the connection".to_string(),
                Err(err) => err.to_string(),
            };
            warn!(relay = %self.inner.config.relay_url, reason = %reason, "QQ relay disconnected");
            if events
                .send(QqEvent::Disconnected { reason })
                .await
                .is_err()
            {
                return;
            }
            tokio::time::sleep(self.inner.config.reconnect_backoff).await;
        }
    }

    async fn connect_once(&self, events: &mpsc::Sender<QqEvent>) -> Result<(), QqError> {
        let mut request = self
            .inner
            .config
            .relay_url
            .as_str()
            .into_client_request()
            .map_err(|e| QqError::Transport(e.to_string()))?;
        if let Some(token) = self.inner.config.access_token.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| QqError::Transport(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| QqError::Transport(e.to_string()))?;
        info!(relay = %self.inner.config.relay_url, "Connected to QQ relay");

        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.inner.outbound.lock() = Some(tx);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let login = self.clone();
        let login_events = events.clone();
        tokio::spawn(async move {
            match login.call_api("get_login_info", json!({})).await {
                Ok(data) => {
                    if let Some(uin) = id_string(&data["user_id"]) {
                        *login.inner.self_uin.write() = Some(uin.clone());
                        let _ = login_events
                            .send(QqEvent::Connected { self_uin: uin })
                            .await;
                    }
                }
                Err(err) => warn!("Failed to query relay login info: {}", err),
            }
        });

        let mut result = Ok(());
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_frame(&text, events).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    result = Err(QqError::Transport(err.to_string()));
                    break;
                }
            }
        }

        *self.inner.outbound.lock() = None;
        writer.abort();
        // Dropping the senders wakes every waiting caller with Disconnected.
        self.inner.pending.lock().clear();
        result
    }

    async fn handle_frame(&self, text: &str, events: &mpsc::Sender<QqEvent>) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Dropping malformed relay frame: {}", err);
                return;
            }
        };

        if let Some(echo) = payload.get("echo").and_then(Value::as_str) {
            if let Some(waiter) = self.inner.pending.lock().remove(echo) {
                let _ = waiter.send(payload);
            }
            return;
        }

        let self_uin = self.self_uin().unwrap_or_default();
        let event = match payload["post_type"].as_str() {
            Some("message") | Some("message_sent") => {
                parse_message_event(&payload, &self_uin).map(QqEvent::Message)
            }
            Some("notice") => parse_notice_event(&payload),
            Some(other) => {
                debug!(post_type = other, "Ignoring relay event");
                None
            }
            None => None,
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                debug!("QQ event receiver dropped");
            }
        }
    }

    pub async fn call_api(&self, action: &str, params: Value) -> Result<Value, QqError> {
        let sender = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or(QqError::Disconnected)?;

        let echo = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(echo.clone(), tx);

        let request = json!({ "action": action, "params": params, "echo": echo });
        if sender.send(Message::Text(request.to_string().into())).is_err() {
            self.inner.pending.lock().remove(&echo);
            return Err(QqError::Disconnected);
        }

        let response = match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(QqError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().remove(&echo);
                return Err(QqError::Timeout(action.to_string()));
            }
        };

        let retcode = response["retcode"].as_i64().unwrap_or(-1);
        if response["status"].as_str() != Some("ok") && retcode != 0 {
            return Err(QqError::Api {
                action: action.to_string(),
                retcode,
                message: response["wording"]
                    .as_str()
                    .or_else(|| response["message"].as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(response.get("data").cloned().unwrap_or(Value::Null))
    }

    async fn send_message(&self, action: &str, params: Value) -> Result<SendReceipt, QqError> {
        let data = self.call_api(action, params).await?;
        let id = id_string(&data["message_id"])
            .ok_or_else(|| QqError::Payload(format!("{action} returned no message_id")))?;
        Ok(SendReceipt {
            key: MessageKey::new(id.clone(), id),
            time: Utc::now().timestamp(),
        })
    }
}

#[async_trait]
impl QqClient for OneBotClient {
    fn self_uin(&self) -> Option<String> {
        self.inner.self_uin.read().clone()
    }

    async fn send_private_message(
        &self,
        target: &str,
        elements: Vec<QqElement>,
    ) -> Result<SendReceipt, QqError> {
        self.send_message(
            "send_private_msg",
            json!({ "user_id": id_value(target), "message": encode_segments(&elements) }),
        )
        .await
    }

    async fn send_group_message(
        &self,
        group: &str,
        elements: Vec<QqElement>,
    ) -> Result<SendReceipt, QqError> {
        self.send_message(
            "send_group_msg",
            json!({ "group_id": id_value(group), "message": encode_segments(&elements) }),
        )
        .await
    }

    async fn recall_private_message(
        &self,
        _peer: &str,
        key: &MessageKey,
        _time: i64,
    ) -> Result<(), QqError> {
        self.call_api("delete_msg", json!({ "message_id": id_value(relay_id(key)) }))
            .await
            .map(|_| ())
    }

    async fn recall_group_message(&self, _group: &str, key: &MessageKey) -> Result<(), QqError> {
        self.call_api("delete_msg", json!({ "message_id": id_value(relay_id(key)) }))
            .await
            .map(|_| ())
    }

    async fn download_attachment(&self, url: &str) -> Result<Vec<u8>, QqError> {
        let response = self.inner.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn fetch_user_info(&self, uin: &str) -> Result<ContactInfo, QqError> {
        if let Some(friend) = self.find_friend(uin).await? {
            return Ok(friend);
        }
        let data = self
            .call_api("get_stranger_info", json!({ "user_id": id_value(uin) }))
            .await?;
        Ok(ContactInfo {
            uin: uin.to_string(),
            name: data["nickname"].as_str().unwrap_or_default().to_string(),
            remark: data["remark"].as_str().unwrap_or_default().to_string(),
            avatar_url: user_avatar_url(uin),
        })
    }

    async fn find_friend(&self, uin: &str) -> Result<Option<ContactInfo>, QqError> {
        let data = self.call_api("get_friend_list", json!({})).await?;
        let friend = data.as_array().and_then(|friends| {
            friends
                .iter()
                .find(|friend| id_string(&friend["user_id"]).as_deref() == Some(uin))
        });
        Ok(friend.map(|friend| ContactInfo {
            uin: uin.to_string(),
            name: friend["nickname"].as_str().unwrap_or_default().to_string(),
            remark: friend["remark"].as_str().unwrap_or_default().to_string(),
            avatar_url: user_avatar_url(uin),
        }))
    }

    async fn fetch_group_info(&self, code: &str) -> Result<GroupInfo, QqError> {
        let data = self
            .call_api("get_group_info", json!({ "group_id": id_value(code) }))
            .await?;
        Ok(GroupInfo {
            code: code.to_string(),
            name: data["group_name"].as_str().unwrap_or_default().to_string(),
            avatar_url: group_avatar_url(code),
            member_count: data["member_count"].as_u64().unwrap_or_default() as u32,
        })
    }

    async fn fetch_group_members(&self, code: &str) -> Result<Vec<GroupMember>, QqError> {
        let data = self
            .call_api("get_group_member_list", json!({ "group_id": id_value(code) }))
            .await?;
        Ok(data
            .as_array()
            .map(|members| members.iter().filter_map(parse_member).collect())
            .unwrap_or_default())
    }

    async fn fetch_group_member(
        &self,
        code: &str,
        uin: &str,
    ) -> Result<Option<GroupMember>, QqError> {
        let data = self
            .call_api(
                "get_group_member_info",
                json!({ "group_id": id_value(code), "user_id": id_value(uin) }),
            )
            .await?;
        Ok(parse_member(&data))
    }
}

pub fn user_avatar_url(uin: &str) -> String {
    format!("https://q1.qlogo.cn/g?b=qq&nk={uin}&s=640")
}

pub fn group_avatar_url(code: &str) -> String {
    format!("https://p.qlogo.cn/gh/{code}/{code}/640/")
}

fn relay_id(key: &MessageKey) -> &str {
    if key.id.is_empty() { &key.seq } else { &key.id }
}

fn id_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::to_string)
        .or_else(|| value.as_i64().map(|id| id.to_string()))
}

fn id_value(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(raw))
}

fn parse_member(value: &Value) -> Option<GroupMember> {
    Some(GroupMember {
        uin: id_string(&value["user_id"])?,
        nickname: value["nickname"].as_str().unwrap_or_default().to_string(),
        card: value["card"].as_str().unwrap_or_default().to_string(),
        role: MemberRole::parse(value["role"].as_str().unwrap_or_default()),
    })
}

fn parse_message_event(payload: &Value, self_uin: &str) -> Option<QqMessage> {
    let id = id_string(&payload["message_id"])?;
    let sender = id_string(&payload["user_id"])?;
    let self_id = id_string(&payload["self_id"]).unwrap_or_else(|| self_uin.to_string());
    let sub_type = payload["sub_type"].as_str().unwrap_or_default();
    let is_echo = payload["post_type"].as_str() == Some("message_sent");

    let (chat_type, group, target) = match payload["message_type"].as_str()? {
        "group" => {
            let code = id_string(&payload["group_id"])?;
            (ChatType::Group, Some(code.clone()), code)
        }
        "private" if sub_type == "group" => {
            let code = id_string(&payload["sender"]["group_id"])
                .or_else(|| id_string(&payload["group_id"]));
            (ChatType::Temp, code, self_id)
        }
        "private" => {
            let target = if is_echo {
                id_string(&payload["target_id"]).unwrap_or(self_id)
            } else {
                self_id
            };
            (ChatType::Private, None, target)
        }
        _ => return None,
    };

    let sender_info = &payload["sender"];
    let sender_name = sender_info["card"]
        .as_str()
        .filter(|card| !card.is_empty())
        .or_else(|| sender_info["nickname"].as_str())
        .unwrap_or_default()
        .to_string();

    Some(QqMessage {
        chat_type,
        group,
        sender,
        sender_name,
        target,
        key: MessageKey::new(id.clone(), id),
        time: payload["time"]
            .as_i64()
            .unwrap_or_else(|| Utc::now().timestamp()),
        elements: parse_segments(&payload["message"]),
    })
}

fn parse_segments(message: &Value) -> Vec<QqElement> {
    let Some(segments) = message.as_array() else {
        // String-format relays; treat the whole thing as text.
        return message
            .as_str()
            .map(|text| vec![QqElement::text(text)])
            .unwrap_or_default();
    };

    segments.iter().filter_map(parse_segment).collect()
}

fn parse_segment(segment: &Value) -> Option<QqElement> {
    let data = &segment["data"];
    let text_of = |field: &str| data[field].as_str().unwrap_or_default().to_string();
    let source = || {
        data["url"]
            .as_str()
            .filter(|url| !url.is_empty())
            .or_else(|| data["file"].as_str())
            .map(|url| MediaSource::Url(url.to_string()))
    };

    let element = match segment["type"].as_str()? {
        "text" => QqElement::text(text_of("text")),
        "face" => {
            let id = id_string(&data["id"]).unwrap_or_default();
            let name = data["raw"]["faceText"]
                .as_str()
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_else(|| format!("表情{id}"));
            QqElement::Face { id, name }
        }
        "at" => {
            let qq = id_string(&data["qq"]).unwrap_or_default();
            if qq == "all" {
                QqElement::at(AT_ALL_TARGET, "@全体成员")
            } else {
                let display = data["name"]
                    .as_str()
                    .map(|name| format!("@{}", name.trim_start_matches('@')))
                    .unwrap_or_else(|| format!("@{qq}"));
                QqElement::at(qq, display)
            }
        }
        "image" | "mface" => QqElement::Image {
            source: source()?,
            file: text_of("file"),
        },
        "record" => QqElement::Voice {
            source: source()?,
            name: text_of("file"),
        },
        "video" => QqElement::Video {
            source: source()?,
            name: text_of("file"),
            size: data["file_size"].as_u64().unwrap_or_default(),
        },
        "file" => QqElement::File {
            source: source()?,
            name: data["name"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| text_of("file")),
            size: data["file_size"]
                .as_u64()
                .or_else(|| data["file_size"].as_str().and_then(|s| s.parse().ok()))
                .unwrap_or_default(),
        },
        "reply" => {
            let id = id_string(&data["id"])?;
            QqElement::Reply {
                seq: id_string(&data["seq"]).unwrap_or_else(|| id.clone()),
                id,
                time: data["time"].as_i64().unwrap_or_default(),
                sender: id_string(&data["qq"]).unwrap_or_default(),
                group_id: None,
                summary: text_of("text"),
            }
        }
        "json" => QqElement::LightApp {
            content: text_of("data"),
        },
        "xml" => QqElement::Xml {
            content: text_of("data"),
        },
        "forward" => QqElement::Forward {
            res_id: id_string(&data["id"]).unwrap_or_default(),
        },
        other => {
            debug!(segment = other, "Skipping unsupported QQ segment");
            return None;
        }
    };
    Some(element)
}

fn parse_notice_event(payload: &Value) -> Option<QqEvent> {
    let time = payload["time"]
        .as_i64()
        .unwrap_or_else(|| Utc::now().timestamp());
    let group = || id_string(&payload["group_id"]);
    let user = || id_string(&payload["user_id"]);

    let event = match payload["notice_type"].as_str()? {
        "group_recall" => {
            let id = id_string(&payload["message_id"])?;
            QqEvent::GroupRecall {
                group: group()?,
                operator: id_string(&payload["operator_id"]).or_else(user)?,
                key: MessageKey::new(id.clone(), id),
                time,
            }
        }
        "friend_recall" => {
            let id = id_string(&payload["message_id"])?;
            QqEvent::FriendRecall {
                peer: user()?,
                key: MessageKey::new(id.clone(), id),
                time,
            }
        }
        "group_increase" => QqEvent::MemberJoined {
            group: group()?,
            member: user()?,
        },
        "group_decrease" => {
            let operator = match payload["sub_type"].as_str() {
                Some("leave") => None,
                _ => id_string(&payload["operator_id"]),
            };
            QqEvent::MemberLeft {
                group: group()?,
                member: user()?,
                operator,
            }
        }
        "group_card" => QqEvent::MemberCardChanged {
            group: group()?,
            member: user()?,
            card: payload["card_new"].as_str().unwrap_or_default().to_string(),
        },
        _ => return None,
    };
    Some(event)
}

fn encode_media(source: &MediaSource) -> String {
    match source {
        MediaSource::Url(url) => url.clone(),
        MediaSource::Data(data) => format!("base64://{}", general_purpose::STANDARD.encode(data)),
    }
}

fn encode_segments(elements: &[QqElement]) -> Value {
    let segments: Vec<Value> = elements
        .iter()
        .map(|element| match element {
            QqElement::Text { text } => json!({ "type": "text", "data": { "text": text } }),
            QqElement::Face { id, .. } => json!({ "type": "face", "data": { "id": id } }),
            QqElement::At { target, .. } => {
                let qq = if target == AT_ALL_TARGET { "all" } else { target.as_str() };
                json!({ "type": "at", "data": { "qq": qq } })
            }
            QqElement::Image { source, .. } => {
                json!({ "type": "image", "data": { "file": encode_media(source) } })
            }
            QqElement::Voice { source, .. } => {
                json!({ "type": "record", "data": { "file": encode_media(source) } })
            }
            QqElement::Video { source, .. } => {
                json!({ "type": "video", "data": { "file": encode_media(source) } })
            }
            QqElement::File { source, name, .. } => {
                json!({ "type": "file", "data": { "file": encode_media(source), "name": name } })
            }
            QqElement::Reply { id, seq, .. } => {
                let id = if id.is_empty() { seq } else { id };
                json!({ "type": "reply", "data": { "id": id } })
            }
            QqElement::LightApp { content } => json!({ "type": "json", "data": { "data": content } }),
            QqElement::Xml { content } => json!({ "type": "xml", "data": { "data": content } }),
            QqElement::Forward { res_id } => json!({ "type": "forward", "data": { "id": res_id } }),
        })
        .collect();
    Value::Array(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_group_message_segments() {
        let payload = json!({
            "post_type": "message",
            "message_type": "group",
            "sub_type": "normal",
            "message_id": 1234,
            "group_id": 5555,
            "user_id": 42,
            "self_id": 10000,
            "time": 1700000000,
            "sender": { "nickname": "bob", "card": "" },
            "message": [
                { "type": "reply", "data": { "id": "77" } },
                { "type": "at", "data": { "qq": "all" } },
                { "type": "text", "data": { "text": " hello" } },
                { "type": "image", "data": { "file": "a.png", "url": "http://img/a.png" } },
                { "type": "poke", "data": {} }
            ]
        });

        let message = parse_message_event(&payload, "10000").expect("group message parses");
        assert_eq!(message.chat_type, ChatType::Group);
        assert_eq!(message.group.as_deref(), Some("5555"));
        assert_eq!(message.sender_name, "bob");
        assert_eq!(message.key, MessageKey::new("1234", "1234"));
        assert_eq!(message.elements.len(), 4);
        assert_eq!(message.elements[1], QqElement::at("0", "@全体成员"));
        assert!(matches!(
            &message.elements[3],
            QqElement::Image { source: MediaSource::Url(url), .. } if url == "http://img/a.png"
        ));
    }

    #[test]
    fn private_echo_targets_peer() {
        let payload = json!({
            "post_type": "message_sent",
            "message_type": "private",
            "message_id": "9",
            "user_id": 10000,
            "target_id": 42,
            "self_id": 10000,
            "message": "hi"
        });
        let message = parse_message_event(&payload, "10000").expect("echo parses");
        assert_eq!(message.chat_type, ChatType::Private);
        assert_eq!(message.sender, "10000");
        assert_eq!(message.target, "42");
        assert_eq!(message.elements, vec![QqElement::text("hi")]);
    }

    #[test]
    fn temp_session_is_classified() {
        let payload = json!({
            "post_type": "message",
            "message_type": "private",
            "sub_type": "group",
            "message_id": 3,
            "user_id": 42,
            "self_id": 10000,
            "sender": { "group_id": 777 },
            "message": []
        });
        let message = parse_message_event(&payload, "").expect("temp parses");
        assert_eq!(message.chat_type, ChatType::Temp);
        assert_eq!(message.group.as_deref(), Some("777"));
    }

    #[test]
    fn parses_recall_and_member_notices() {
        let recall = parse_notice_event(&json!({
            "notice_type": "group_recall",
            "group_id": 1, "user_id": 2, "operator_id": 3, "message_id": 99, "time": 10
        }));
        assert_eq!(
            recall,
            Some(QqEvent::GroupRecall {
                group: "1".to_string(),
                operator: "3".to_string(),
                key: MessageKey::new("99", "99"),
                time: 10,
            })
        );

        let left = parse_notice_event(&json!({
            "notice_type": "group_decrease", "sub_type": "leave",
            "group_id": 1, "user_id": 2, "operator_id": 2
        }));
        assert_eq!(
            left,
            Some(QqEvent::MemberLeft {
                group: "1".to_string(),
                member: "2".to_string(),
                operator: None,
            })
        );
        assert!(parse_notice_event(&json!({ "notice_type": "notify" })).is_none());
    }

    #[test]
    fn encodes_outbound_segments() {
        let encoded = encode_segments(&[
            QqElement::Reply {
                id: "55".to_string(),
                seq: "55".to_string(),
                time: 0,
                sender: "1".to_string(),
                group_id: None,
                summary: String::new(),
            },
            QqElement::at(AT_ALL_TARGET, "@room"),
            QqElement::Image {
                source: MediaSource::Data(vec![1, 2, 3]),
                file: "x.png".to_string(),
            },
        ]);
        assert_eq!(encoded[0], json!({ "type": "reply", "data": { "id": "55" } }));
        assert_eq!(encoded[1]["data"]["qq"], "all");
        assert_eq!(encoded[2]["data"]["file"], "base64://AQID");
    }
}
