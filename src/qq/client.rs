use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::id::MessageKey;
use super::types::{ContactInfo, GroupInfo, GroupMember, QqElement, SendReceipt};

#[derive(Debug, Error)]
pub enum QqError {
    #[error("relay connection is not established")]
    Disconnected,

    #[error("relay request {0} timed out")]
    Timeout(String),

    #[error("relay api {action} failed: retcode={retcode} {message}")]
    Api {
        action: String,
        retcode: i64,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid relay payload: {0}")]
    Payload(String),
}

impl From<reqwest::Error> for QqError {
    fn from(err: reqwest::Error) -> Self {
        QqError::Transport(err.to_string())
    }
}

/// Operations the bridge needs from a logged in QQ session.
#[async_trait]
pub trait QqClient: Send + Sync {
    fn self_uin(&self) -> Option<String>;

    async fn send_private_message(
        &self,
        target: &str,
        elements: Vec<QqElement>,
    ) -> Result<SendReceipt, QqError>;

    async fn send_group_message(
        &self,
        group: &str,
        elements: Vec<QqElement>,
    ) -> Result<SendReceipt, QqError>;

    async fn recall_private_message(
        &self,
        peer: &str,
        key: &MessageKey,
        time: i64,
    ) -> Result<(), QqError>;

    async fn recall_group_message(&self, group: &str, key: &MessageKey) -> Result<(), QqError>;

    async fn download_attachment(&self, url: &str) -> Result<Vec<u8>, QqError>;

    async fn fetch_user_info(&self, uin: &str) -> Result<ContactInfo, QqError>;

    async fn find_friend(&self, uin: &str) -> Result<Option<ContactInfo>, QqError>;

    async fn fetch_group_info(&self, code: &str) -> Result<GroupInfo, QqError>;

    async fn fetch_group_members(&self, code: &str) -> Result<Vec<GroupMember>, QqError>;

    async fn fetch_group_member(
        &self,
        code: &str,
        uin: &str,
    ) -> Result<Option<GroupMember>, QqError> {
        let members = self.fetch_group_members(code).await?;
        Ok(members.into_iter().find(|member| member.uin == uin))
    }
}

pub type SharedQqClient = Arc<dyn QqClient>;
