use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use salvo::affix_state;
use salvo::prelude::*;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::portal::{MatrixPortalEvent, Portal};
use super::dedup::RecentRing;
use super::puppet::Puppet;
use super::resync::ResyncQueue;
use super::user::User;
use crate::config::Config;
use crate::database::{DatabaseResult, PortalRecord, PuppetRecord, Stores, UserRecord};
use crate::matrix::{
    AppserviceClient, EVENT_MEMBER, EVENT_MESSAGE, EVENT_REDACTION, EVENT_STICKER, Intent,
    RoomEvent, SharedMatrixApi,
};
use crate::qq::{
    CommandCodec, OneBotClient, OneBotConfig, PortalKey, QqEvent, SharedAudioCodec,
    SharedQqClient, Uid,
};
use crate::util::PuppetIdFormatter;
use crate::web::{BridgeStatus, global_metrics, health_endpoint, metrics_endpoint};

const RECENT_TRANSACTIONS: usize = 64;
const RECENT_MATRIX_EVENTS: usize = 512;

/// Owns every portal, ghost and user, and the appservice HTTP surface.
pub struct QqBridge {
    pub config: Arc<Config>,
    pub stores: Stores,
    pub matrix: SharedMatrixApi,
    pub codec: SharedAudioCodec,
    pub puppet_ids: PuppetIdFormatter,
    pub bot: Intent,
    portals_by_key: DashMap<PortalKey, Arc<Portal>>,
    portals_by_mxid: DashMap<String, Arc<Portal>>,
    puppets: DashMap<Uid, Arc<Puppet>>,
    users_by_mxid: DashMap<String, Arc<User>>,
    users_by_uin: DashMap<String, Arc<User>>,
    seen_transactions: Mutex<RecentRing>,
    seen_events: Mutex<RecentRing>,
}

impl QqBridge {
    pub fn new(
        config: Arc<Config>,
        stores: Stores,
        matrix: SharedMatrixApi,
        codec: SharedAudioCodec,
    ) -> anyhow::Result<Arc<Self>> {
        let puppet_ids = PuppetIdFormatter::new(
            &config.bridge.username_template,
            &config.homeserver.domain,
        )
        .context("invalid username template")?;
        let bot = Intent::bot(matrix.clone());
        Ok(Arc::new(Self {
            config,
            stores,
            matrix,
            codec,
            puppet_ids,
            bot,
            portals_by_key: DashMap::new(),
            portals_by_mxid: DashMap::new(),
            puppets: DashMap::new(),
            users_by_mxid: DashMap::new(),
            users_by_uin: DashMap::new(),
            seen_transactions: Mutex::new(RecentRing::new(RECENT_TRANSACTIONS)),
            seen_events: Mutex::new(RecentRing::new(RECENT_MATRIX_EVENTS)),
        }))
    }

    /// Wires the reqwest appservice client and the configured silk codec.
    pub fn from_config(config: Config, stores: Stores) -> anyhow::Result<Arc<Self>> {
        let matrix: SharedMatrixApi = Arc::new(AppserviceClient::new(
            &config.homeserver.address,
            &config.appservice.as_token,
            &config.bot_user_id(),
        ));
        let codec: SharedAudioCodec = Arc::new(CommandCodec::new(
            &config.qq.silk_decoder,
            &config.qq.silk_encoder,
        ));
        Self::new(Arc::new(config), stores, matrix, codec)
    }

    pub async fn get_portal_by_key(self: &Arc<Self>, key: &PortalKey) -> DatabaseResult<Arc<Portal>> {
        if let Some(portal) = self.portals_by_key.get(key) {
            return Ok(portal.clone());
        }
        let (record, persisted) = match self.stores.portals.get_by_key(key).await? {
            Some(record) => (record, true),
            None => (PortalRecord::new(key.clone()), false),
        };
        Ok(self.register_portal(record, persisted))
    }

    fn register_portal(self: &Arc<Self>, record: PortalRecord, persisted: bool) -> Arc<Portal> {
        match self.portals_by_key.entry(record.key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (portal, receivers) = Portal::new(self.clone(), record, persisted);
                entry.insert(portal.clone());
                if let Some(mxid) = portal.mxid() {
                    self.portals_by_mxid.insert(mxid, portal.clone());
                }
                portal.start(receivers);
                portal
            }
        }
    }

    /// Like `get_portal_by_key`, but never creates a new portal record.
    pub async fn get_existing_portal(
        self: &Arc<Self>,
        key: &PortalKey,
    ) -> DatabaseResult<Option<Arc<Portal>>> {
        if let Some(portal) = self.portals_by_key.get(key) {
            return Ok(Some(portal.clone()));
        }
        Ok(self
            .stores
            .portals
            .get_by_key(key)
            .await?
            .map(|record| self.register_portal(record, true)))
    }

    pub async fn get_portal_by_mxid(
        self: &Arc<Self>,
        room_id: &str,
    ) -> DatabaseResult<Option<Arc<Portal>>> {
        if let Some(portal) = self.portals_by_mxid.get(room_id) {
            return Ok(Some(portal.clone()));
        }
        Ok(self
            .stores
            .portals
            .get_by_mxid(room_id)
            .await?
            .map(|record| self.register_portal(record, true)))
    }

    pub async fn private_portals_with(self: &Arc<Self>, uid: &Uid) -> DatabaseResult<Vec<Arc<Portal>>> {
        let records = self.stores.portals.find_private_chats_with(uid).await?;
        Ok(records
            .into_iter()
            .map(|record| match self.portals_by_key.get(&record.key) {
                Some(portal) => portal.clone(),
                None => self.register_portal(record, true),
            })
            .collect())
    }

    pub fn index_portal_mxid(&self, room_id: &str, portal: Arc<Portal>) {
        self.portals_by_mxid.insert(room_id.to_string(), portal);
    }

    pub fn forget_portal(&self, key: &PortalKey, room_id: Option<&str>) {
        self.portals_by_key.remove(key);
        if let Some(room_id) = room_id {
            self.portals_by_mxid.remove(room_id);
        }
    }

    pub async fn get_puppet(&self, uid: &Uid) -> DatabaseResult<Arc<Puppet>> {
        if let Some(puppet) = self.puppets.get(uid) {
            return Ok(puppet.clone());
        }
        let (record, persisted) = match self.stores.puppets.get(uid).await? {
            Some(record) => (record, true),
            None => (PuppetRecord::new(uid.clone()), false),
        };
        let puppet = self
            .puppets
            .entry(uid.clone())
            .or_insert_with(|| {
                let mxid = self.puppet_ids.mxid(uid.uin());
                Arc::new(Puppet::new(record, mxid, persisted))
            })
            .clone();
        Ok(puppet)
    }

    pub async fn get_user_by_mxid(&self, mxid: &str) -> DatabaseResult<Arc<User>> {
        if let Some(user) = self.users_by_mxid.get(mxid) {
            return Ok(user.clone());
        }
        let record = self
            .stores
            .users
            .get_by_mxid(mxid)
            .await?
            .unwrap_or_else(|| UserRecord::new(mxid));
        let min_interval = self.config.bridge.resync.min_interval_secs;
        let user = self
            .users_by_mxid
            .entry(mxid.to_string())
            .or_insert_with(|| Arc::new(User::new(record, min_interval)))
            .clone();
        Ok(user)
    }

    /// Logged in users only.
    pub fn get_user_by_uin(&self, uin: &str) -> Option<Arc<User>> {
        self.users_by_uin.get(uin).map(|user| user.clone())
    }

    pub fn index_user_uin(&self, user: &Arc<User>, uin: &str) {
        self.users_by_uin.insert(uin.to_string(), user.clone());
    }

    pub fn status(&self) -> BridgeStatus {
        let owner = self.users_by_mxid.get(&self.config.qq.owner);
        BridgeStatus {
            relay_connected: owner.as_ref().is_some_and(|user| user.is_logged_in()),
            qq_uin: owner.and_then(|user| user.uin()),
            portals: self.portals_by_key.len(),
        }
    }

    /// Connects the relay, then serves appservice transactions until the
    /// listener stops.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        info!("Starting QQ bridge");
        self.matrix
            .ensure_registered(self.bot.user_id())
            .await
            .context("failed to register bridge bot")?;
        let displayname = &self.config.appservice.bot.displayname;
        if !displayname.is_empty()
            && let Err(err) = self.matrix.set_displayname(self.bot.user_id(), displayname).await
        {
            warn!(error = %err, "Failed to set bridge bot displayname");
        }

        let owner = self
            .get_user_by_mxid(&self.config.qq.owner)
            .await
            .context("failed to load relay owner")?;
        let relay = OneBotClient::new(OneBotConfig {
            relay_url: self.config.qq.relay_url.clone(),
            access_token: self
                .config
                .qq
                .access_token
                .clone()
                .filter(|token| !token.trim().is_empty()),
            request_timeout: Duration::from_secs(self.config.qq.request_timeout_secs),
            reconnect_backoff: Duration::from_secs(self.config.qq.reconnect_backoff_secs),
        });
        let events = relay.spawn(self.config.bridge.portal_message_buffer);
        let client: SharedQqClient = Arc::new(relay);
        tokio::spawn(self.clone().run_session(owner.clone(), client, events));
        tokio::spawn(ResyncQueue::run_loop(self.clone(), owner));

        let acceptor = TcpListener::new(format!(
            "{}:{}",
            self.config.appservice.hostname, self.config.appservice.port
        ))
        .bind()
        .await;
        info!(
            "Appservice listening on {}:{}",
            self.config.appservice.hostname, self.config.appservice.port
        );
        Server::new(acceptor).serve(self.create_appservice_router()).await;
        Ok(())
    }

    /// Feeds one relay session's events to its user. The session is bound
    /// to the user whenever the relay reports a login.
    pub async fn run_session(
        self: Arc<Self>,
        user: Arc<User>,
        client: SharedQqClient,
        mut events: mpsc::Receiver<QqEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                QqEvent::Connected { self_uin } => {
                    if let Err(err) = user.login(&self, client.clone(), &self_uin).await {
                        error!(mxid = %user.mxid, uin = %self_uin, error = %err, "Failed to save QQ login");
                    }
                }
                event => user.handle_event(&self, event).await,
            }
        }
        user.disconnect("relay event stream ended");
    }

    fn create_appservice_router(self: &Arc<Self>) -> Router {
        let handler = MatrixRequestHandler {
            bridge: self.clone(),
        };

        Router::new()
            .hoop(Logger::new())
            .hoop(affix_state::inject(self.clone()))
            .push(Router::with_path("/_matrix/app/{*path}").put(handler))
            .push(Router::with_path("/health").get(health_endpoint))
            .push(Router::with_path("/metrics").get(metrics_endpoint))
    }

    async fn handle_matrix_request(self: &Arc<Self>, req: &mut Request, res: &mut Response) {
        if !self.is_authorized_request(req) {
            res.status_code(StatusCode::UNAUTHORIZED);
            res.render(Json(serde_json::json!({
                "errcode": "M_FORBIDDEN",
                "error": "Bad token supplied",
            })));
            return;
        }

        let path = req.uri().path().to_string();
        let Some(txn_id) = transaction_id(&path) else {
            res.status_code(StatusCode::OK);
            res.render(Json(serde_json::json!({})));
            return;
        };
        if self.seen_transactions.lock().contains(txn_id) {
            debug!(txn_id, "Ignoring retried appservice transaction");
            res.status_code(StatusCode::OK);
            res.render(Json(serde_json::json!({})));
            return;
        }
        let txn_id = txn_id.to_string();

        let payload = match req.payload().await {
            Ok(bytes) => bytes.clone(),
            Err(err) => {
                error!("Failed to read appservice payload: {}", err);
                res.status_code(StatusCode::BAD_REQUEST);
                res.render("invalid payload");
                return;
            }
        };
        let body: Value = match serde_json::from_slice(&payload) {
            Ok(body) => body,
            Err(err) => {
                error!("Failed to parse appservice JSON body: {}", err);
                res.status_code(StatusCode::BAD_REQUEST);
                res.render("invalid json");
                return;
            }
        };

        let events = body
            .get("events")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for raw in events {
            match serde_json::from_value::<RoomEvent>(raw) {
                Ok(event) => self.handle_matrix_event(event).await,
                Err(err) => warn!(error = %err, "Skipping malformed Matrix event"),
            }
        }
        self.seen_transactions.lock().insert(txn_id);

        res.status_code(StatusCode::OK);
        res.render(Json(serde_json::json!({})));
    }

    fn is_authorized_request(&self, req: &Request) -> bool {
        let token = &self.config.appservice.hs_token;
        if let Some(query_token) = req.query::<String>("access_token")
            && query_token == *token
        {
            return true;
        }
        if let Some(auth) = req.header::<String>("Authorization") {
            let supplied = auth
                .strip_prefix("Bearer ")
                .or_else(|| auth.strip_prefix("bearer "))
                .unwrap_or(auth.as_str());
            return supplied == token.as_str();
        }
        false
    }

    /// Routes one event from an appservice transaction.
    pub async fn handle_matrix_event(self: &Arc<Self>, event: RoomEvent) {
        if event.sender == self.bot.user_id() || self.puppet_ids.is_puppet(&event.sender) {
            return;
        }
        if !event.event_id.is_empty() && !self.seen_events.lock().insert(event.event_id.clone()) {
            debug!(event_id = %event.event_id, "Ignoring redelivered Matrix event");
            return;
        }
        global_metrics().record_matrix_event(&event.event_type);

        match event.event_type.as_str() {
            EVENT_MESSAGE | EVENT_STICKER | EVENT_REDACTION => {
                let portal = match self.get_portal_by_mxid(&event.room_id).await {
                    Ok(Some(portal)) => portal,
                    Ok(None) => {
                        debug!(room_id = %event.room_id, "Ignoring event in non-portal room");
                        return;
                    }
                    Err(err) => {
                        warn!(room_id = %event.room_id, error = %err, "Failed to look up portal");
                        return;
                    }
                };
                let sender = match self.get_user_by_mxid(&event.sender).await {
                    Ok(sender) => sender,
                    Err(err) => {
                        warn!(sender = %event.sender, error = %err, "Failed to load Matrix user");
                        return;
                    }
                };
                let queued = if event.event_type == EVENT_REDACTION {
                    MatrixPortalEvent::Redaction { sender, event }
                } else {
                    MatrixPortalEvent::Message { sender, event }
                };
                portal.queue_matrix_event(queued).await;
            }
            EVENT_MEMBER => self.handle_member_event(event).await,
            other => debug!(event_type = %other, "Ignoring Matrix event type"),
        }
    }

    async fn handle_member_event(self: &Arc<Self>, event: RoomEvent) {
        let Some(target) = event.state_key.as_deref() else {
            return;
        };
        match event.membership() {
            Some("invite") if target == self.bot.user_id() => {
                info!(room_id = %event.room_id, inviter = %event.sender, "Joining room after invite");
                if let Err(err) = self.bot.ensure_joined(&event.room_id).await {
                    warn!(room_id = %event.room_id, error = %err, "Failed to accept invite");
                }
            }
            Some("leave") if target == event.sender => {
                if let Ok(Some(portal)) = self.get_portal_by_mxid(&event.room_id).await
                    && portal.is_private()
                {
                    debug!(room_id = %event.room_id, user_id = %target, "User left private portal");
                    portal.cleanup_if_empty().await;
                }
            }
            _ => {}
        }
    }
}

/// `.../transactions/{txn_id}` of an appservice push.
fn transaction_id(path: &str) -> Option<&str> {
    path.split_once("/transactions/")
        .map(|(_, txn)| txn.trim_end_matches('/'))
        .filter(|txn| !txn.is_empty())
}

struct MatrixRequestHandler {
    bridge: Arc<QqBridge>,
}

#[async_trait]
impl Handler for MatrixRequestHandler {
    async fn handle(
        &self,
        req: &mut Request,
        _depot: &mut Depot,
        res: &mut Response,
        _ctrl: &mut FlowCtrl,
    ) {
        self.bridge.handle_matrix_request(req, res).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_come_from_the_push_path() {
        assert_eq!(
            transaction_id("/_matrix/app/v1/transactions/42"),
            Some("42")
        );
        assert_eq!(transaction_id("/_matrix/app/v1/transactions/"), None);
        assert_eq!(transaction_id("/_matrix/app/v1/users/@qq_1:hs"), None);
    }
}
