mod bridge;

use anyhow::Result;
pub use bridge::*;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct HomeserverConfig {
    pub address: String,
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_type")]
    pub r#type: String,
    pub uri: String,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,
}

fn default_db_type() -> String {
    "sqlite".to_string()
}

fn default_max_open_conns() -> u32 {
    20
}

fn default_max_idle_conns() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub username: String,
    pub displayname: String,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppServiceConfig {
    pub address: String,
    pub hostname: String,
    pub port: u16,
    pub database: DatabaseConfig,
    pub id: String,
    pub bot: BotConfig,
    pub as_token: String,
    pub hs_token: String,
}

/// Forward websocket of a OneBot v11 relay.
#[derive(Debug, Clone, Deserialize)]
pub struct QqRelayConfig {
    pub relay_url: String,
    /// Matrix user the relay's QQ account belongs to.
    pub owner: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
    /// Command that turns silk on stdin into ogg on stdout.
    #[serde(default)]
    pub silk_decoder: String,
    /// Command that turns ogg on stdin into silk on stdout.
    #[serde(default)]
    pub silk_encoder: String,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_reconnect_backoff() -> u64 {
    5
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_min_level")]
    pub min_level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_min_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub homeserver: HomeserverConfig,
    pub appservice: AppServiceConfig,
    pub bridge: BridgeConfig,
    pub qq: QqRelayConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let resolved_path = env_var("CONFIG").unwrap_or_else(|_| path.to_string());
        let content = std::fs::read(&resolved_path)?;
        Self::load_from_bytes(&content)
    }

    pub fn load_from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut config: Config = serde_yaml::from_slice(bytes)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let db_type = self.appservice.database.r#type.trim().to_ascii_lowercase();
        if db_type != "sqlite" && db_type != "memory" {
            anyhow::bail!(
                "appservice.database.type='{}' is not supported; use 'sqlite' or 'memory'",
                self.appservice.database.r#type
            );
        }

        // The generated config only carries the sample entries.
        let configured = self
            .bridge
            .permissions
            .keys()
            .filter(|key| !matches!(key.as_str(), "*" | "example.com" | "@admin:example.com"))
            .count();
        if configured == 0 {
            anyhow::bail!("bridge.permissions not configured");
        }

        if !self.bridge.username_template.contains("{{.}}") {
            anyhow::bail!("username template is missing user ID placeholder");
        }

        if self.bridge.portal_message_buffer == 0 {
            anyhow::bail!("bridge.portal_message_buffer must be > 0");
        }

        validate_not_placeholder("appservice.as_token", &self.appservice.as_token)?;
        validate_not_placeholder("appservice.hs_token", &self.appservice.hs_token)?;

        if !self.qq.relay_url.starts_with("ws://") && !self.qq.relay_url.starts_with("wss://") {
            anyhow::bail!("qq.relay_url must be a ws:// or wss:// URL");
        }

        if !self.qq.owner.starts_with('@') || !self.qq.owner.contains(':') {
            anyhow::bail!("qq.owner must be a full Matrix user ID");
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 6] = [
            ("DB_TYPE", &mut self.appservice.database.r#type),
            ("DB_URI", &mut self.appservice.database.uri),
            ("AS_TOKEN", &mut self.appservice.as_token),
            ("HS_TOKEN", &mut self.appservice.hs_token),
            ("QQ_RELAY_URL", &mut self.qq.relay_url),
            ("QQ_OWNER", &mut self.qq.owner),
        ];
        for (suffix, target) in overrides {
            if let Ok(value) = env_var(suffix)
                && !value.trim().is_empty()
            {
                *target = value;
            }
        }

        if let Ok(value) = env_var("QQ_ACCESS_TOKEN") {
            self.qq.access_token = Some(value).filter(|token| !token.trim().is_empty());
        }
    }

    pub fn format_username(&self, username: &str) -> String {
        self.bridge.username_template.replace("{{.}}", username)
    }

    pub fn bot_user_id(&self) -> String {
        format!(
            "@{}:{}",
            self.appservice.bot.username, self.homeserver.domain
        )
    }
}

fn env_var(suffix: &str) -> Result<String, std::env::VarError> {
    let key = format!("MATRIX_BRIDGE_QQ_{}", suffix);
    std::env::var(key)
}

const PLACEHOLDER_MARKERS: &[&str] = &["your_", "changeme", "replace_me", "example"];

/// Tokens copied unchanged from example-config.yaml.
fn validate_not_placeholder(field: &str, value: &str) -> Result<()> {
    let token = value.trim().to_ascii_lowercase();
    if token.is_empty()
        || token.ends_with("_here")
        || PLACEHOLDER_MARKERS.iter().any(|marker| token.contains(marker))
    {
        anyhow::bail!("{field} must be set to a real token, found {value:?}");
    }
    Ok(())
}
