use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const UID_SEPARATOR: char = '\u{1}';
const KEY_SEPARATOR: char = '\u{2}';
const MESSAGE_ID_SEPARATOR: char = ':';
const FAKE_MESSAGE_ID_PREFIX: &str = "fake:";
const MAX_FAKE_SEQ: u64 = 9_999_999_999;

/// Prefix carried by the id half of every synthetic message key.
pub const FAKE_KEY_PREFIX: &str = "FAKE::";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("malformed id field: {0:?}")]
    MalformedId(String),

    #[error("fake message ID")]
    FakeMessageId,

    #[error("invalid message ID")]
    InvalidMessageId,

    #[error("invalid uid: {0:?}")]
    InvalidUid(String),

    #[error("invalid portal key: {0:?}")]
    InvalidPortalKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UidKind {
    User,
    Group,
}

impl UidKind {
    fn tag(self) -> &'static str {
        match self {
            UidKind::User => "u",
            UidKind::Group => "g",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "u" => Some(UidKind::User),
            "g" => Some(UidKind::Group),
            _ => None,
        }
    }
}

/// A QQ account number or group code tagged with what it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid {
    uin: String,
    kind: UidKind,
}

impl Uid {
    pub fn new(uin: impl Into<String>, kind: UidKind) -> Self {
        Self {
            uin: uin.into(),
            kind,
        }
    }

    pub fn user(uin: impl Into<String>) -> Self {
        Self::new(uin, UidKind::User)
    }

    pub fn group(code: impl Into<String>) -> Self {
        Self::new(code, UidKind::Group)
    }

    pub fn uin(&self) -> &str {
        &self.uin
    }

    pub fn kind(&self) -> UidKind {
        self.kind
    }

    pub fn is_user(&self) -> bool {
        self.kind == UidKind::User
    }

    pub fn is_group(&self) -> bool {
        self.kind == UidKind::Group
    }

    pub fn uin_number(&self) -> Option<i64> {
        self.uin.parse().ok()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.uin, UID_SEPARATOR, self.kind.tag())
    }
}

impl FromStr for Uid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(UID_SEPARATOR).collect();
        if parts.len() != 2 || parts[0].is_empty() {
            return Err(IdError::InvalidUid(s.to_string()));
        }
        let kind = UidKind::from_tag(parts[1]).ok_or_else(|| IdError::InvalidUid(s.to_string()))?;
        Ok(Uid::new(parts[0], kind))
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies one portal. Group chats are shared by every local user, so their
/// receiver is always the group itself; private chats are scoped per receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortalKey {
    pub uid: Uid,
    pub receiver: Uid,
}

impl PortalKey {
    pub fn new(uid: Uid, receiver: Uid) -> Self {
        if uid.is_group() {
            return Self {
                receiver: uid.clone(),
                uid,
            };
        }
        Self { uid, receiver }
    }

    pub fn group(code: impl Into<String>) -> Self {
        let uid = Uid::group(code);
        Self::new(uid.clone(), uid)
    }

    pub fn private(peer: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self::new(Uid::user(peer), Uid::user(receiver))
    }

    pub fn is_private(&self) -> bool {
        self.uid.is_user()
    }

    pub fn chat_type(&self) -> ChatType {
        match self.uid.kind() {
            UidKind::User => ChatType::Private,
            UidKind::Group => ChatType::Group,
        }
    }
}

impl fmt::Display for PortalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.uid == self.receiver {
            write!(f, "{}", self.uid)
        } else {
            write!(f, "{}{}{}", self.uid, KEY_SEPARATOR, self.receiver)
        }
    }
}

impl FromStr for PortalKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, KEY_SEPARATOR);
        let uid: Uid = parts
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|_| IdError::InvalidPortalKey(s.to_string()))?;
        let receiver = match parts.next() {
            Some(raw) => raw
                .parse()
                .map_err(|_| IdError::InvalidPortalKey(s.to_string()))?,
            None => uid.clone(),
        };
        Ok(PortalKey::new(uid, receiver))
    }
}

/// Composite QQ message identity: the per-chat sequence number plus the
/// relay's message id. Either half may be empty for partial lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub seq: String,
    pub id: String,
}

impl MessageKey {
    pub fn new(seq: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            seq: seq.into(),
            id: id.into(),
        }
    }

    pub fn partial(seq: impl Into<String>) -> Self {
        Self::new(seq, "")
    }

    pub fn fake(discriminator: &str) -> Self {
        let seq = rand::thread_rng().gen_range(0..MAX_FAKE_SEQ);
        Self::new(seq.to_string(), format!("{FAKE_KEY_PREFIX}{discriminator}"))
    }

    pub fn is_fake(&self) -> bool {
        self.id.starts_with(FAKE_KEY_PREFIX)
    }

    pub fn seq_number(&self) -> Option<i64> {
        self.seq.parse().ok()
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.seq, KEY_SEPARATOR, self.id)
    }
}

impl FromStr for MessageKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, KEY_SEPARATOR);
        let seq = parts.next().unwrap_or_default();
        let id = parts.next().unwrap_or_default();
        Ok(MessageKey::new(seq, id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChatType {
    #[default]
    Unknown,
    Private,
    Group,
    Temp,
}

impl ChatType {
    /// The chat type follows from the relay surface that produced an event,
    /// never from the id itself.
    pub fn classify(source: &str) -> Self {
        match source {
            "private" | "friend" => ChatType::Private,
            "group" => ChatType::Group,
            "temp" | "group_private" => ChatType::Temp,
            _ => ChatType::Unknown,
        }
    }
}

fn check_field(field: &str) -> Result<(), IdError> {
    if field.is_empty() || field.contains(MESSAGE_ID_SEPARATOR) {
        return Err(IdError::MalformedId(field.to_string()));
    }
    Ok(())
}

pub fn make_message_id(chat: &str, id: &str) -> Result<String, IdError> {
    check_field(chat)?;
    check_field(id)?;
    Ok(format!("{chat}{MESSAGE_ID_SEPARATOR}{id}"))
}

pub fn make_fake_message_id(chat: &str, discriminator: &str) -> Result<String, IdError> {
    check_field(chat)?;
    check_field(discriminator)?;
    Ok(format!("{FAKE_MESSAGE_ID_PREFIX}{chat}{MESSAGE_ID_SEPARATOR}{discriminator}"))
}

pub fn is_fake_message_id(id: &str) -> bool {
    id.starts_with(FAKE_MESSAGE_ID_PREFIX)
}

pub fn parse_message_id(id: &str) -> Result<(String, String), IdError> {
    if is_fake_message_id(id) {
        return Err(IdError::FakeMessageId);
    }
    let mut parts = id.splitn(2, MESSAGE_ID_SEPARATOR);
    match (parts.next(), parts.next()) {
        (Some(chat), Some(msg)) => Ok((chat.to_string(), msg.to_string())),
        _ => Err(IdError::InvalidMessageId),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_round_trips() {
        for (chat, id) in [("123456", "987"), ("g10001", "-42"), ("a", "b")] {
            let made = make_message_id(chat, id).expect("valid fields");
            let (parsed_chat, parsed_id) = parse_message_id(&made).expect("parse");
            assert_eq!(parsed_chat, chat);
            assert_eq!(parsed_id, id);
        }
    }

    #[test]
    fn message_id_rejects_separator_in_fields() {
        assert_eq!(
            make_message_id("12:34", "1"),
            Err(IdError::MalformedId("12:34".to_string()))
        );
        assert!(matches!(
            make_fake_message_id("12", "a:b"),
            Err(IdError::MalformedId(_))
        ));
    }

    #[test]
    fn fake_message_ids_are_distinguishable() {
        let fake = make_fake_message_id("123", "kicked").expect("valid fake id");
        assert!(is_fake_message_id(&fake));
        assert_eq!(parse_message_id(&fake), Err(IdError::FakeMessageId));
        assert_eq!(parse_message_id("nocolon"), Err(IdError::InvalidMessageId));
    }

    #[test]
    fn uid_text_form_round_trips() {
        let user = Uid::user("10001");
        let group = Uid::group("20002");
        assert_eq!(user.to_string().parse::<Uid>(), Ok(user));
        assert_eq!(group.to_string().parse::<Uid>(), Ok(group));
        assert!("10001".parse::<Uid>().is_err());
        assert!("10001\u{1}x".parse::<Uid>().is_err());
    }

    #[test]
    fn group_portal_key_uses_group_as_receiver() {
        let key = PortalKey::new(Uid::group("555"), Uid::user("1"));
        assert_eq!(key.receiver, Uid::group("555"));
        assert_eq!(key.to_string(), Uid::group("555").to_string());
        assert_eq!(key.to_string().parse::<PortalKey>(), Ok(key));
    }

    #[test]
    fn private_portal_key_round_trips_with_receiver() {
        let key = PortalKey::private("42", "7");
        let text = key.to_string();
        assert!(text.contains('\u{2}'));
        assert_eq!(text.parse::<PortalKey>(), Ok(key.clone()));
        assert_eq!(key.chat_type(), ChatType::Private);
    }

    #[test]
    fn fake_message_key_is_tagged() {
        let key = MessageKey::fake("invite");
        assert!(key.is_fake());
        assert!(key.seq_number().is_some());
        assert!(!MessageKey::new("1", "2").is_fake());
        assert_eq!(MessageKey::partial("5").to_string().parse(), Ok(MessageKey::partial("5")));
    }

    #[test]
    fn chat_type_follows_source_surface() {
        assert_eq!(ChatType::classify("group"), ChatType::Group);
        assert_eq!(ChatType::classify("private"), ChatType::Private);
        assert_eq!(ChatType::classify("group_private"), ChatType::Temp);
        assert_eq!(ChatType::classify("guild"), ChatType::Unknown);
    }
}
