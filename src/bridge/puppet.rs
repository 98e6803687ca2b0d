use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::qq_bridge::QqBridge;
use crate::database::{DatabaseResult, NameQuality, PuppetRecord, Stores};
use crate::matrix::{Intent, SharedMatrixApi};
use crate::qq::{ContactInfo, QqClient, Uid};
use crate::util::detect_mime;

/// A QQ contact mirrored as a Matrix ghost.
pub struct Puppet {
    pub uid: Uid,
    pub mxid: String,
    record: Mutex<PuppetRecord>,
    persisted: AtomicBool,
    sync_lock: tokio::sync::Mutex<()>,
}

/// A lower quality name never replaces a higher quality one.
pub fn accepts_name(current: &PuppetRecord, name: &str, quality: NameQuality) -> bool {
    if quality < current.name_quality {
        return false;
    }
    current.displayname != name || quality > current.name_quality
}

impl Puppet {
    pub fn new(record: PuppetRecord, mxid: String, persisted: bool) -> Self {
        Self {
            uid: record.uid.clone(),
            mxid,
            record: Mutex::new(record),
            persisted: AtomicBool::new(persisted),
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn intent(&self, api: &SharedMatrixApi) -> Intent {
        Intent::new(api.clone(), self.mxid.clone())
    }

    pub fn snapshot(&self) -> PuppetRecord {
        self.record.lock().clone()
    }

    pub fn displayname(&self) -> String {
        self.record.lock().displayname.clone()
    }

    pub fn name_quality(&self) -> NameQuality {
        self.record.lock().name_quality
    }

    pub fn avatar_url(&self) -> String {
        self.record.lock().avatar_url.clone()
    }

    pub fn last_sync(&self) -> chrono::DateTime<Utc> {
        self.record.lock().last_sync
    }

    /// Looks the contact up through the session, preferring the friend list.
    pub async fn sync_contact(
        self: &Arc<Self>,
        bridge: &Arc<QqBridge>,
        qq: &dyn QqClient,
        force_avatar: bool,
        reason: &str,
    ) {
        let contact = match qq.find_friend(self.uid.uin()).await {
            Ok(Some(friend)) => friend,
            _ => match qq.fetch_user_info(self.uid.uin()).await {
                Ok(info) => info,
                Err(err) => {
                    warn!(uid = %self.uid.uin(), reason = %reason, error = %err, "No contact info found");
                    return;
                }
            },
        };
        self.sync(bridge, qq, &contact, force_avatar, false).await;
    }

    pub async fn sync(
        self: &Arc<Self>,
        bridge: &Arc<QqBridge>,
        qq: &dyn QqClient,
        contact: &ContactInfo,
        force_avatar: bool,
        force_portal_sync: bool,
    ) {
        let _guard = self.sync_lock.lock().await;
        if let Err(err) = bridge.matrix.ensure_registered(&self.mxid).await {
            warn!(mxid = %self.mxid, error = %err, "Failed to ensure ghost is registered");
        }

        let mut changed = self.update_name(bridge, contact, force_portal_sync).await;
        let needs_avatar = force_avatar || self.record.lock().avatar.is_empty();
        if needs_avatar {
            changed |= self
                .update_avatar(bridge, qq, &contact.avatar_url, force_portal_sync)
                .await;
        }

        let stale = self.last_sync() + Duration::hours(24) < Utc::now();
        if changed || stale {
            self.record.lock().last_sync = Utc::now();
            if let Err(err) = self.save(&bridge.stores).await {
                warn!(uid = %self.uid.uin(), error = %err, "Failed to save ghost");
            }
        }
    }

    pub async fn update_name(
        self: &Arc<Self>,
        bridge: &Arc<QqBridge>,
        contact: &ContactInfo,
        force_portal_sync: bool,
    ) -> bool {
        let (name, quality) = bridge.config.bridge.format_displayname(contact);
        if !accepts_name(&self.record.lock(), &name, quality) {
            if force_portal_sync {
                self.spawn_portal_meta_update(bridge);
            }
            return false;
        }

        let previous = {
            let mut record = self.record.lock();
            record.name_quality = quality;
            std::mem::replace(&mut record.displayname, name.clone())
        };
        match bridge.matrix.set_displayname(&self.mxid, &name).await {
            Ok(()) => debug!(mxid = %self.mxid, "Updated name {:?} -> {:?}", previous, name),
            Err(err) => warn!(mxid = %self.mxid, error = %err, "Failed to set display name"),
        }
        self.spawn_portal_meta_update(bridge);
        true
    }

    async fn update_avatar(
        self: &Arc<Self>,
        bridge: &Arc<QqBridge>,
        qq: &dyn QqClient,
        url: &str,
        force_portal_sync: bool,
    ) -> bool {
        let unchanged = {
            let record = self.record.lock();
            url.is_empty() || (record.avatar == url && record.avatar_set)
        };
        if unchanged {
            if force_portal_sync {
                self.spawn_portal_meta_update(bridge);
            }
            return false;
        }

        let intent = self.intent(&bridge.matrix);
        let mxc = match reupload_avatar(&intent, qq, url).await {
            Ok(mxc) => mxc,
            Err(err) => {
                warn!(mxid = %self.mxid, error = %err, "Failed to reupload avatar");
                return false;
            }
        };
        {
            let mut record = self.record.lock();
            record.avatar = url.to_string();
            record.avatar_url = mxc.clone();
            record.avatar_set = false;
        }
        match bridge.matrix.set_avatar_url(&self.mxid, &mxc).await {
            Ok(()) => self.record.lock().avatar_set = true,
            Err(err) => warn!(mxid = %self.mxid, error = %err, "Failed to set avatar"),
        }
        self.spawn_portal_meta_update(bridge);
        true
    }

    /// Private portals show the ghost's name and avatar. Runs detached since
    /// the portal may be holding its creation lock while syncing this ghost.
    fn spawn_portal_meta_update(self: &Arc<Self>, bridge: &Arc<QqBridge>) {
        if !bridge.config.bridge.private_chat_portal_meta {
            return;
        }
        let puppet = self.clone();
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let portals = match bridge.private_portals_with(&puppet.uid).await {
                Ok(portals) => portals,
                Err(err) => {
                    warn!(uid = %puppet.uid.uin(), error = %err, "Failed to list private portals");
                    return;
                }
            };
            let snapshot = puppet.snapshot();
            for portal in portals {
                portal.apply_puppet_meta(&snapshot).await;
            }
        });
    }

    pub async fn save(&self, stores: &Stores) -> DatabaseResult<()> {
        let record = self.snapshot();
        if self.persisted.load(Ordering::Acquire) {
            stores.puppets.update(&record).await
        } else {
            stores.puppets.insert(&record).await?;
            self.persisted.store(true, Ordering::Release);
            Ok(())
        }
    }
}

pub(crate) async fn reupload_avatar(
    intent: &Intent,
    qq: &dyn QqClient,
    url: &str,
) -> anyhow::Result<String> {
    let data = qq
        .download_attachment(url)
        .await
        .with_context(|| format!("failed to download avatar {url}"))?;
    let mime = detect_mime(&data, "avatar");
    let mxc = intent
        .upload(data, &mime, "avatar")
        .await
        .context("failed to upload avatar")?;
    Ok(mxc)
}
