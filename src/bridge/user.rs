use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::portal::{FakeMessage, QqPortalEvent};
use super::qq_bridge::QqBridge;
use super::resync::ResyncQueue;
use crate::database::{DatabaseResult, UserRecord};
use crate::matrix::{Intent, MatrixError};
use crate::qq::{ChatType, PortalKey, QqEvent, QqMessage, SharedQqClient, Uid};
use crate::web::global_metrics;

/// A Matrix user of the bridge, together with the QQ session acting for it.
pub struct User {
    pub mxid: String,
    record: Mutex<UserRecord>,
    client: RwLock<Option<SharedQqClient>>,
    pub resync: ResyncQueue,
}

/// Portal a QQ message belongs to, seen from the session of `self_uin`.
pub fn route_message(self_uin: &str, message: &QqMessage) -> Option<PortalKey> {
    match message.chat_type {
        ChatType::Private if message.sender == self_uin => {
            Some(PortalKey::private(&message.target, &message.sender))
        }
        ChatType::Private => Some(PortalKey::private(&message.sender, &message.target)),
        ChatType::Group => {
            let code = message.group.as_deref().unwrap_or(&message.target);
            Some(PortalKey::group(code))
        }
        ChatType::Temp => Some(PortalKey::private(&message.sender, self_uin)),
        ChatType::Unknown => None,
    }
}

impl User {
    pub fn new(record: UserRecord, resync_min_interval_secs: u64) -> Self {
        Self {
            mxid: record.mxid.clone(),
            record: Mutex::new(record),
            client: RwLock::new(None),
            resync: ResyncQueue::new(resync_min_interval_secs),
        }
    }

    pub fn uin(&self) -> Option<String> {
        self.record.lock().uin.clone()
    }

    pub fn uid(&self) -> Option<Uid> {
        self.uin().map(Uid::user)
    }

    pub fn client(&self) -> Option<SharedQqClient> {
        self.client.read().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.client.read().is_some() && self.uin().is_some()
    }

    /// Binds a connected QQ session to this user.
    pub async fn login(
        self: &Arc<Self>,
        bridge: &Arc<QqBridge>,
        client: SharedQqClient,
        uin: &str,
    ) -> DatabaseResult<()> {
        let record = {
            let mut record = self.record.lock();
            record.uin = Some(uin.to_string());
            record.clone()
        };
        *self.client.write() = Some(client);
        bridge.stores.users.upsert(&record).await?;
        bridge.index_user_uin(self, uin);
        info!(mxid = %self.mxid, uin = %uin, "QQ session ready");
        Ok(())
    }

    pub fn disconnect(&self, reason: &str) {
        if self.client.write().take().is_some() {
            warn!(mxid = %self.mxid, reason = %reason, "QQ session disconnected");
        }
    }

    /// Invites this user as `intent`, treating "already in the room" as
    /// success.
    pub async fn ensure_invited(&self, intent: &Intent, room_id: &str) -> bool {
        match intent
            .api()
            .invite_user(intent.user_id(), room_id, &self.mxid)
            .await
        {
            Ok(()) => true,
            Err(MatrixError::Forbidden(message)) if message.contains("is already in the room") => {
                true
            }
            Err(err) => {
                warn!(mxid = %self.mxid, room_id = %room_id, error = %err, "Failed to invite user");
                false
            }
        }
    }

    pub async fn handle_event(self: &Arc<Self>, bridge: &Arc<QqBridge>, event: QqEvent) {
        let Some(self_uin) = self.uin() else {
            debug!(mxid = %self.mxid, "Dropping QQ event for user without session");
            return;
        };

        match event {
            QqEvent::Connected { self_uin } => {
                debug!(uin = %self_uin, "Ignoring connect notice in event stream");
            }
            QqEvent::Disconnected { reason } => self.disconnect(&reason),
            QqEvent::Message(message) => {
                global_metrics().record_qq_event("message");
                let Some(key) = route_message(&self_uin, &message) else {
                    debug!(key = %message.key, "Dropping message from unknown chat surface");
                    return;
                };
                self.queue(bridge, key, QqPortalEvent::Message {
                    source: self.clone(),
                    message,
                })
                .await;
            }
            QqEvent::GroupRecall {
                group,
                operator,
                key,
                time,
            } => {
                global_metrics().record_qq_event("group_recall");
                self.queue(bridge, PortalKey::group(group), QqPortalEvent::Revoke {
                    source: self.clone(),
                    operator,
                    key,
                    time,
                })
                .await;
            }
            QqEvent::FriendRecall { peer, key, time } => {
                global_metrics().record_qq_event("friend_recall");
                let portal_key = PortalKey::private(&peer, &self_uin);
                self.queue(bridge, portal_key, QqPortalEvent::Revoke {
                    source: self.clone(),
                    operator: peer,
                    key,
                    time,
                })
                .await;
            }
            QqEvent::MemberJoined { group, member } => {
                global_metrics().record_qq_event("member_joined");
                self.queue_existing(bridge, PortalKey::group(group), QqPortalEvent::MemberJoined {
                    source: self.clone(),
                    member,
                })
                .await;
            }
            QqEvent::MemberLeft {
                group,
                member,
                operator,
            } => {
                global_metrics().record_qq_event("member_left");
                let event = if member == self_uin {
                    QqPortalEvent::GroupLeft {
                        source: self.clone(),
                        operator,
                        notice: FakeMessage::removed_from_group(&self_uin),
                    }
                } else {
                    QqPortalEvent::MemberLeft {
                        source: self.clone(),
                        member,
                        operator,
                    }
                };
                self.queue_existing(bridge, PortalKey::group(group), event).await;
            }
            QqEvent::MemberCardChanged {
                group,
                member,
                card,
            } => {
                global_metrics().record_qq_event("member_card");
                self.queue_existing(bridge, PortalKey::group(group), QqPortalEvent::MemberCardChanged {
                    source: self.clone(),
                    member,
                    card,
                })
                .await;
            }
        }
    }

    async fn queue(&self, bridge: &Arc<QqBridge>, key: PortalKey, event: QqPortalEvent) {
        match bridge.get_portal_by_key(&key).await {
            Ok(portal) => portal.queue_qq_event(event).await,
            Err(err) => warn!(portal = %key, error = %err, "Failed to load portal"),
        }
    }

    /// Membership notices only matter for chats that already have a room.
    async fn queue_existing(&self, bridge: &Arc<QqBridge>, key: PortalKey, event: QqPortalEvent) {
        match bridge.get_existing_portal(&key).await {
            Ok(Some(portal)) if portal.mxid().is_some() => portal.queue_qq_event(event).await,
            Ok(_) => debug!(portal = %key, "Ignoring group update in chat with no portal"),
            Err(err) => warn!(portal = %key, error = %err, "Failed to load portal"),
        }
    }
}
