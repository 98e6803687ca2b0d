use std::collections::HashMap;

use serde::Deserialize;

use crate::database::NameQuality;
use crate::qq::types::ContactInfo;

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Localpart template for ghost users; `{{.}}` is the QQ uin.
    #[serde(default = "default_username_template")]
    pub username_template: String,

    /// Display name template for ghost users. `{{.}}` is the best known name,
    /// `{{.Uin}}`, `{{.Name}}` and `{{.Remark}}` are the raw fields.
    #[serde(default = "default_displayname_template")]
    pub displayname_template: String,

    /// Capacity of each portal's QQ and Matrix queues.
    #[serde(default = "default_portal_message_buffer")]
    pub portal_message_buffer: usize,

    /// Mirror the ghost's name and avatar onto its private chat rooms.
    #[serde(default = "default_true")]
    pub private_chat_portal_meta: bool,

    #[serde(default)]
    pub allow_user_invite: bool,

    #[serde(default = "default_true")]
    pub federate_rooms: bool,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Largest attachment bridged in either direction, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,

    /// How far forward a reply's timestamp may drift from the original.
    #[serde(default = "default_reply_window_secs")]
    pub reply_window_secs: i64,

    /// Send a lone image as a native image event so animated gifs survive.
    /// When off every image is rendered inline in the formatted body.
    #[serde(default = "default_true")]
    pub native_lone_image: bool,

    #[serde(default)]
    pub resync: ResyncConfig,

    /// `*`, a homeserver domain or a full MXID mapped to `relay`, `user`
    /// or `admin`.
    #[serde(default)]
    pub permissions: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResyncConfig {
    #[serde(default = "default_resync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_resync_min_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_resync_jitter")]
    pub jitter_secs: u64,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_resync_interval(),
            min_interval_secs: default_resync_min_interval(),
            jitter_secs: default_resync_jitter(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionLevel {
    None,
    Relay,
    User,
    Admin,
}

impl PermissionLevel {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => PermissionLevel::Admin,
            "user" => PermissionLevel::User,
            "relay" => PermissionLevel::Relay,
            _ => PermissionLevel::None,
        }
    }
}

impl BridgeConfig {
    /// Most specific entry wins: full MXID, then server name, then `*`.
    pub fn permission_level(&self, mxid: &str) -> PermissionLevel {
        if let Some(level) = self.permissions.get(mxid) {
            return PermissionLevel::parse(level);
        }
        let domain = mxid.split_once(':').map(|(_, d)| d).unwrap_or_default();
        if let Some(level) = self.permissions.get(domain) {
            return PermissionLevel::parse(level);
        }
        self.permissions
            .get("*")
            .map(|level| PermissionLevel::parse(level))
            .unwrap_or(PermissionLevel::None)
    }

    pub fn can_bridge_from(&self, mxid: &str) -> bool {
        self.permission_level(mxid) >= PermissionLevel::User
    }

    pub fn format_displayname(&self, contact: &ContactInfo) -> (String, NameQuality) {
        let (best, quality) = if !contact.remark.trim().is_empty() {
            (contact.remark.as_str(), NameQuality::Remark)
        } else if !contact.name.trim().is_empty() {
            (contact.name.as_str(), NameQuality::Name)
        } else {
            (contact.uin.as_str(), NameQuality::Uin)
        };

        let name = self
            .displayname_template
            .replace("{{.Uin}}", &contact.uin)
            .replace("{{.Name}}", &contact.name)
            .replace("{{.Remark}}", &contact.remark)
            .replace("{{.}}", best);
        (name, quality)
    }
}

fn default_username_template() -> String {
    "qq_{{.}}".to_string()
}

fn default_displayname_template() -> String {
    "{{.}} (QQ)".to_string()
}

fn default_portal_message_buffer() -> usize {
    128
}

fn default_max_file_size() -> usize {
    50 * 1024 * 1024
}

fn default_reply_window_secs() -> i64 {
    10
}

fn default_resync_interval() -> u64 {
    4 * 60 * 60
}

fn default_resync_min_interval() -> u64 {
    7 * 24 * 60 * 60
}

fn default_resync_jitter() -> u64 {
    60 * 60
}

fn default_true() -> bool {
    true
}
