use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::types::{CreateRoomRequest, EVENT_MESSAGE, MatrixError, MessageContent, RoomEvent};

/// Client-server calls the bridge makes, each performed as `as_user` through
/// appservice impersonation.
#[async_trait]
pub trait MatrixApi: Send + Sync {
    fn bot_user_id(&self) -> String;

    async fn ensure_registered(&self, user_id: &str) -> Result<(), MatrixError>;

    async fn create_room(
        &self,
        as_user: &str,
        request: &CreateRoomRequest,
    ) -> Result<String, MatrixError>;

    /// `ts` backdates the event (appservice timestamp massaging).
    async fn send_message_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: &Value,
        ts: Option<i64>,
    ) -> Result<String, MatrixError>;

    async fn send_state_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, MatrixError>;

    async fn get_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, MatrixError>;

    async fn get_event(&self, room_id: &str, event_id: &str) -> Result<RoomEvent, MatrixError>;

    async fn redact_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> Result<String, MatrixError>;

    async fn upload_media(
        &self,
        as_user: &str,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, MatrixError>;

    async fn download_media(&self, mxc: &str) -> Result<Vec<u8>, MatrixError>;

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, MatrixError>;

    async fn invite_user(&self, as_user: &str, room_id: &str, user_id: &str)
    -> Result<(), MatrixError>;

    async fn join_room(&self, as_user: &str, room_id: &str) -> Result<(), MatrixError>;

    async fn leave_room(&self, as_user: &str, room_id: &str) -> Result<(), MatrixError>;

    async fn kick_user(
        &self,
        as_user: &str,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), MatrixError>;

    async fn set_displayname(&self, user_id: &str, name: &str) -> Result<(), MatrixError>;

    async fn set_avatar_url(&self, user_id: &str, mxc: &str) -> Result<(), MatrixError>;
}

pub type SharedMatrixApi = Arc<dyn MatrixApi>;

/// A Matrix identity the bridge acts as: the bot or one ghost.
#[derive(Clone)]
pub struct Intent {
    api: SharedMatrixApi,
    user_id: String,
}

impl Intent {
    pub fn new(api: SharedMatrixApi, user_id: impl Into<String>) -> Self {
        Self {
            api,
            user_id: user_id.into(),
        }
    }

    pub fn bot(api: SharedMatrixApi) -> Self {
        let user_id = api.bot_user_id();
        Self { api, user_id }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn api(&self) -> &SharedMatrixApi {
        &self.api
    }

    pub fn is_bot(&self) -> bool {
        self.user_id == self.api.bot_user_id()
    }

    pub async fn send_message(
        &self,
        room_id: &str,
        content: &MessageContent,
        ts: Option<i64>,
    ) -> Result<String, MatrixError> {
        self.api
            .send_message_event(&self.user_id, room_id, EVENT_MESSAGE, &content.to_value(), ts)
            .await
    }

    pub async fn send_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> Result<String, MatrixError> {
        self.api
            .send_state_event(&self.user_id, room_id, event_type, state_key, &content)
            .await
    }

    pub async fn set_room_name(&self, room_id: &str, name: &str) -> Result<String, MatrixError> {
        self.send_state(room_id, "m.room.name", "", json!({ "name": name }))
            .await
    }

    pub async fn set_room_topic(&self, room_id: &str, topic: &str) -> Result<String, MatrixError> {
        self.send_state(room_id, "m.room.topic", "", json!({ "topic": topic }))
            .await
    }

    pub async fn set_room_avatar(&self, room_id: &str, mxc: &str) -> Result<String, MatrixError> {
        self.send_state(room_id, "m.room.avatar", "", json!({ "url": mxc }))
            .await
    }

    pub async fn redact(&self, room_id: &str, event_id: &str) -> Result<String, MatrixError> {
        self.api
            .redact_event(&self.user_id, room_id, event_id, None)
            .await
    }

    pub async fn upload(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, MatrixError> {
        self.api
            .upload_media(&self.user_id, data, content_type, filename)
            .await
    }

    pub async fn kick(&self, room_id: &str, user_id: &str, reason: &str) -> Result<(), MatrixError> {
        self.api
            .kick_user(&self.user_id, room_id, user_id, reason)
            .await
    }

    pub async fn leave(&self, room_id: &str) -> Result<(), MatrixError> {
        self.api.leave_room(&self.user_id, room_id).await
    }

    /// Registers the user if needed, then gets it into the room through a bot
    /// invite.
    pub async fn ensure_joined(&self, room_id: &str) -> Result<(), MatrixError> {
        self.api.ensure_registered(&self.user_id).await?;
        if self.is_bot() {
            return self.api.join_room(&self.user_id, room_id).await;
        }
        match self.api.join_room(&self.user_id, room_id).await {
            Ok(()) => Ok(()),
            Err(MatrixError::Forbidden(_)) => {
                let bot = self.api.bot_user_id();
                self.api.invite_user(&bot, room_id, &self.user_id).await?;
                self.api.join_room(&self.user_id, room_id).await
            }
            Err(err) => Err(err),
        }
    }
}
