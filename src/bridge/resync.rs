use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::{Instant, interval_at};
use tracing::{debug, warn};

use super::portal::{GroupSnapshot, Portal};
use super::puppet::Puppet;
use super::qq_bridge::QqBridge;
use super::user::User;
use crate::qq::{PortalKey, Uid};
use crate::web::global_metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncTarget {
    Puppet(Uid),
    Portal(Uid),
}

/// Coalescing set of ghosts and group portals waiting for a background
/// metadata refresh.
pub struct ResyncQueue {
    queue: Mutex<HashMap<String, ResyncTarget>>,
    min_interval: chrono::Duration,
}

pub fn is_stale(last_sync: DateTime<Utc>, min_interval: chrono::Duration, now: DateTime<Utc>) -> bool {
    last_sync + min_interval <= now
}

impl ResyncQueue {
    pub fn new(min_interval_secs: u64) -> Self {
        Self {
            queue: Mutex::new(HashMap::new()),
            min_interval: chrono::Duration::seconds(min_interval_secs as i64),
        }
    }

    fn enqueue(&self, key: String, target: ResyncTarget, last_sync: DateTime<Utc>) -> bool {
        if !is_stale(last_sync, self.min_interval, Utc::now()) {
            return false;
        }
        let mut queue = self.queue.lock();
        if queue.contains_key(&key) {
            return false;
        }
        debug!(target = %key, "Enqueued resync");
        queue.insert(key, target);
        true
    }

    pub fn enqueue_puppet(&self, puppet: &Puppet) -> bool {
        self.enqueue(
            puppet.uid.to_string(),
            ResyncTarget::Puppet(puppet.uid.clone()),
            puppet.last_sync(),
        )
    }

    pub fn enqueue_portal(&self, portal: &Portal) -> bool {
        if portal.is_private() {
            return false;
        }
        self.enqueue(
            portal.key.uid.to_string(),
            ResyncTarget::Portal(portal.key.uid.clone()),
            portal.last_sync(),
        )
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn take(&self) -> Vec<ResyncTarget> {
        std::mem::take(&mut *self.queue.lock()).into_values().collect()
    }

    /// Refreshes every queued target whose last sync is still older than the
    /// minimum interval.
    pub async fn drain(&self, bridge: &Arc<QqBridge>, user: &Arc<User>) {
        let Some(qq) = user.client() else {
            return;
        };
        let targets = self.take();
        if targets.is_empty() {
            return;
        }

        let now = Utc::now();
        for target in targets {
            match target {
                ResyncTarget::Portal(uid) => {
                    let portal = match bridge.get_portal_by_key(&PortalKey::new(uid.clone(), uid)).await {
                        Ok(portal) => portal,
                        Err(err) => {
                            warn!(error = %err, "Failed to load portal for background sync");
                            continue;
                        }
                    };
                    if !is_stale(portal.last_sync(), self.min_interval, now) {
                        debug!(portal = %portal.key.uid.uin(), "Not resyncing, synced recently");
                        continue;
                    }
                    global_metrics().record_resync_fetch("portal");
                    let code = portal.key.uid.uin().to_string();
                    let info = match qq.fetch_group_info(&code).await {
                        Ok(info) => info,
                        Err(err) => {
                            warn!(group = %code, error = %err, "Failed to get group info for background sync");
                            continue;
                        }
                    };
                    match qq.fetch_group_members(&code).await {
                        Ok(members) => {
                            debug!(group = %code, "Doing background sync");
                            portal
                                .update_matrix_room(user, Some(GroupSnapshot { info, members }))
                                .await;
                        }
                        Err(err) => {
                            warn!(group = %code, error = %err, "Failed to get group members for background sync");
                        }
                    }
                }
                ResyncTarget::Puppet(uid) => {
                    let puppet = match bridge.get_puppet(&uid).await {
                        Ok(puppet) => puppet,
                        Err(err) => {
                            warn!(error = %err, "Failed to load ghost for background sync");
                            continue;
                        }
                    };
                    if !is_stale(puppet.last_sync(), self.min_interval, now) {
                        continue;
                    }
                    global_metrics().record_resync_fetch("puppet");
                    let contact = match qq.find_friend(uid.uin()).await {
                        Ok(Some(friend)) => friend,
                        _ => match qq.fetch_user_info(uid.uin()).await {
                            Ok(info) => info,
                            Err(err) => {
                                warn!(uid = %uid.uin(), error = %err, "Failed to get contact info in background sync");
                                continue;
                            }
                        },
                    };
                    debug!(uid = %uid.uin(), "Doing background sync for user");
                    puppet.sync(bridge, qq.as_ref(), &contact, true, true).await;
                }
            }
        }
    }

    /// Wakes up every `interval`, the first time up to `jitter` early so that
    /// sessions started together do not hit the relay at once.
    pub async fn run_loop(bridge: Arc<QqBridge>, user: Arc<User>) {
        let settings = &bridge.config.bridge.resync;
        let interval = Duration::from_secs(settings.interval_secs.max(1));
        let jitter = rand::thread_rng().gen_range(0..=settings.jitter_secs.min(settings.interval_secs));
        let first = interval.saturating_sub(Duration::from_secs(jitter));
        let mut ticker = interval_at(Instant::now() + first, interval);
        loop {
            ticker.tick().await;
            if !user.is_logged_in() {
                continue;
            }
            user.resync.drain(&bridge, &user).await;
        }
    }
}
