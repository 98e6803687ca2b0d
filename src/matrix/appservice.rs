use async_trait::async_trait;
use dashmap::DashSet;
use reqwest::{Client, Method, Response};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::client::MatrixApi;
use super::types::{CreateRoomRequest, MatrixError, RoomEvent};
use crate::web::metrics::global_metrics;

/// `MatrixApi` over the client-server API, authenticated with the appservice
/// token and impersonating users through `user_id`.
pub struct AppserviceClient {
    http: Client,
    homeserver: String,
    as_token: String,
    bot_user_id: String,
    registered: DashSet<String>,
}

impl AppserviceClient {
    pub fn new(homeserver: &str, as_token: &str, bot_user_id: &str) -> Self {
        Self::with_http_client(Client::new(), homeserver, as_token, bot_user_id)
    }

    pub fn with_http_client(
        http: Client,
        homeserver: &str,
        as_token: &str,
        bot_user_id: &str,
    ) -> Self {
        Self {
            http,
            homeserver: homeserver.trim_end_matches('/').to_string(),
            as_token: as_token.to_string(),
            bot_user_id: bot_user_id.to_string(),
            registered: DashSet::new(),
        }
    }

    fn url(
        &self,
        path: &str,
        as_user: Option<&str>,
        query: &[(&str, String)],
    ) -> Result<Url, MatrixError> {
        let mut url = Url::parse(&format!("{}{}", self.homeserver, path))
            .map_err(|e| MatrixError::Transport(format!("invalid url {path}: {e}")))?;
        if as_user.is_some() || !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            if let Some(user) = as_user {
                pairs.append_pair("user_id", user);
            }
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn call(
        &self,
        api: &str,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Value, MatrixError> {
        global_metrics().record_outbound_call(api);
        let mut request = self.http.request(method, url).bearer_auth(&self.as_token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.inspect_err(|_| {
            global_metrics().record_outbound_failure(api, "transport");
        })?;
        read_json(api, response).await
    }

    fn txn_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

fn enc(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

async fn read_json(api: &str, response: Response) -> Result<Value, MatrixError> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(body);
    }
    let err = classify_error(status.as_u16(), &body);
    global_metrics().record_outbound_failure(api, &status.as_u16().to_string());
    Err(err)
}

fn classify_error(status: u16, body: &Value) -> MatrixError {
    let errcode = body["errcode"].as_str().unwrap_or_default().to_string();
    let message = body["error"].as_str().unwrap_or_default().to_string();
    match (status, errcode.as_str()) {
        (_, "M_TOO_LARGE") => MatrixError::TooLarge,
        (413, _) => MatrixError::ProxyTooLarge,
        (403, _) | (_, "M_FORBIDDEN") => MatrixError::Forbidden(message),
        (404, _) | (_, "M_NOT_FOUND") => MatrixError::NotFound(message),
        _ => MatrixError::Http {
            status,
            errcode,
            message,
        },
    }
}

fn localpart(user_id: &str) -> &str {
    let trimmed = user_id.trim_start_matches('@');
    trimmed.split(':').next().unwrap_or(trimmed)
}

fn parse_mxc(mxc: &str) -> Result<(&str, &str), MatrixError> {
    mxc.strip_prefix("mxc://")
        .and_then(|rest| rest.split_once('/'))
        .filter(|(server, media)| !server.is_empty() && !media.is_empty())
        .ok_or_else(|| MatrixError::Transport(format!("invalid mxc uri: {mxc}")))
}

#[async_trait]
impl MatrixApi for AppserviceClient {
    fn bot_user_id(&self) -> String {
        self.bot_user_id.clone()
    }

    async fn ensure_registered(&self, user_id: &str) -> Result<(), MatrixError> {
        if self.registered.contains(user_id) {
            return Ok(());
        }
        let url = self.url("/_matrix/client/v3/register", None, &[])?;
        let body = json!({
            "type": "m.login.application_service",
            "username": localpart(user_id),
        });
        match self.call("register", Method::POST, url, Some(&body)).await {
            Ok(_) => {}
            Err(MatrixError::Http { errcode, .. }) if errcode == "M_USER_IN_USE" => {}
            Err(err) => return Err(err),
        }
        debug!(user_id = %user_id, "Registered Matrix ghost");
        self.registered.insert(user_id.to_string());
        Ok(())
    }

    async fn create_room(
        &self,
        as_user: &str,
        request: &CreateRoomRequest,
    ) -> Result<String, MatrixError> {
        let url = self.url("/_matrix/client/v3/createRoom", Some(as_user), &[])?;
        let body = serde_json::to_value(request)
            .map_err(|e| MatrixError::Transport(e.to_string()))?;
        let response = self.call("create_room", Method::POST, url, Some(&body)).await?;
        response["room_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MatrixError::Transport("createRoom returned no room_id".to_string()))
    }

    async fn send_message_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: &Value,
        ts: Option<i64>,
    ) -> Result<String, MatrixError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/send/{}/{}",
            enc(room_id),
            enc(event_type),
            Self::txn_id()
        );
        let query: Vec<(&str, String)> = ts.map(|ts| ("ts", ts.to_string())).into_iter().collect();
        let url = self.url(&path, Some(as_user), &query)?;
        let response = self.call("send_message", Method::PUT, url, Some(content)).await?;
        Ok(response["event_id"].as_str().unwrap_or_default().to_string())
    }

    async fn send_state_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, MatrixError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/state/{}/{}",
            enc(room_id),
            enc(event_type),
            enc(state_key)
        );
        let url = self.url(&path, Some(as_user), &[])?;
        let response = self.call("send_state", Method::PUT, url, Some(content)).await?;
        Ok(response["event_id"].as_str().unwrap_or_default().to_string())
    }

    async fn get_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, MatrixError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/state/{}/{}",
            enc(room_id),
            enc(event_type),
            enc(state_key)
        );
        let url = self.url(&path, Some(&self.bot_user_id), &[])?;
        match self.call("get_state", Method::GET, url, None).await {
            Ok(value) => Ok(Some(value)),
            Err(MatrixError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get_event(&self, room_id: &str, event_id: &str) -> Result<RoomEvent, MatrixError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/event/{}",
            enc(room_id),
            enc(event_id)
        );
        let url = self.url(&path, Some(&self.bot_user_id), &[])?;
        let value = self.call("get_event", Method::GET, url, None).await?;
        serde_json::from_value(value).map_err(|e| MatrixError::Transport(e.to_string()))
    }

    async fn redact_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> Result<String, MatrixError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/redact/{}/{}",
            enc(room_id),
            enc(event_id),
            Self::txn_id()
        );
        let url = self.url(&path, Some(as_user), &[])?;
        let body = match reason {
            Some(reason) => json!({ "reason": reason }),
            None => json!({}),
        };
        let response = self.call("redact", Method::PUT, url, Some(&body)).await?;
        Ok(response["event_id"].as_str().unwrap_or_default().to_string())
    }

    async fn upload_media(
        &self,
        as_user: &str,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, MatrixError> {
        let url = self.url(
            "/_matrix/media/v3/upload",
            Some(as_user),
            &[("filename", filename.to_string())],
        )?;
        global_metrics().record_outbound_call("upload_media");
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.as_token)
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await?;
        let body = read_json("upload_media", response).await?;
        body["content_uri"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MatrixError::Transport("upload returned no content_uri".to_string()))
    }

    async fn download_media(&self, mxc: &str) -> Result<Vec<u8>, MatrixError> {
        let (server, media_id) = parse_mxc(mxc)?;
        let mut last_error = None;
        for prefix in ["/_matrix/client/v1/media/download", "/_matrix/media/v3/download"] {
            let path = format!("{}/{}/{}", prefix, enc(server), enc(media_id));
            let url = self.url(&path, None, &[])?;
            global_metrics().record_outbound_call("download_media");
            let response = self
                .http
                .get(url)
                .bearer_auth(&self.as_token)
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response.bytes().await?.to_vec());
            }
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let err = classify_error(status.as_u16(), &body);
            if !matches!(err, MatrixError::NotFound(_)) {
                return Err(err);
            }
            last_error = Some(err);
        }
        Err(last_error.unwrap_or_else(|| MatrixError::NotFound(mxc.to_string())))
    }

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{}/joined_members", enc(room_id));
        let url = self.url(&path, Some(&self.bot_user_id), &[])?;
        let response = self.call("joined_members", Method::GET, url, None).await?;
        Ok(response["joined"]
            .as_object()
            .map(|joined| joined.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn invite_user(
        &self,
        as_user: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{}/invite", enc(room_id));
        let url = self.url(&path, Some(as_user), &[])?;
        let body = json!({ "user_id": user_id });
        self.call("invite", Method::POST, url, Some(&body)).await?;
        Ok(())
    }

    async fn join_room(&self, as_user: &str, room_id: &str) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/join/{}", enc(room_id));
        let url = self.url(&path, Some(as_user), &[])?;
        self.call("join", Method::POST, url, Some(&json!({}))).await?;
        Ok(())
    }

    async fn leave_room(&self, as_user: &str, room_id: &str) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{}/leave", enc(room_id));
        let url = self.url(&path, Some(as_user), &[])?;
        self.call("leave", Method::POST, url, Some(&json!({}))).await?;
        Ok(())
    }

    async fn kick_user(
        &self,
        as_user: &str,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{}/kick", enc(room_id));
        let url = self.url(&path, Some(as_user), &[])?;
        let body = json!({ "user_id": user_id, "reason": reason });
        self.call("kick", Method::POST, url, Some(&body)).await?;
        Ok(())
    }

    async fn set_displayname(&self, user_id: &str, name: &str) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/profile/{}/displayname", enc(user_id));
        let url = self.url(&path, Some(user_id), &[])?;
        let body = json!({ "displayname": name });
        self.call("set_displayname", Method::PUT, url, Some(&body))
            .await?;
        Ok(())
    }

    async fn set_avatar_url(&self, user_id: &str, mxc: &str) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/profile/{}/avatar_url", enc(user_id));
        let url = self.url(&path, Some(user_id), &[])?;
        let body = json!({ "avatar_url": mxc });
        self.call("set_avatar_url", Method::PUT, url, Some(&body))
            .await?;
        Ok(())
    }
}
