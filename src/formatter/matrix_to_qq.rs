use std::num::ParseFloatError;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use super::unescape_html;
use crate::database::{MessageKind, MessageRecord};
use crate::matrix::types::{
    EVENT_STICKER, MSG_AUDIO, MSG_EMOTE, MSG_FILE, MSG_IMAGE, MSG_LOCATION, MSG_NOTICE, MSG_TEXT,
    MSG_VIDEO, MessageContent,
};
use crate::matrix::{MatrixApi, attachment};
use crate::qq::types::{MediaSource, QqElement};
use crate::qq::{AudioCodec, PortalKey, QqClient, QqError};
use crate::util::PuppetIdFormatter;

#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    #[error("uri doesn't have geo: prefix")]
    MissingPrefix,

    #[error("didn't find exactly two numbers separated by a comma")]
    NotTwoNumbers,

    #[error("latitude is not a number: {0}")]
    Latitude(ParseFloatError),

    #[error("longitude is not a number: {0}")]
    Longitude(ParseFloatError),
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(String),

    #[error("failed to bridge media: {0}")]
    Media(String),

    #[error("failed to parse geo uri: {0}")]
    Geo(#[from] GeoError),

    #[error("not logged in to QQ")]
    NotLoggedIn,

    #[error("QQ request failed: {0}")]
    Remote(#[from] QqError),
}

/// `geo:lat,lng[;params]`
pub fn parse_geo_uri(uri: &str) -> Result<(f64, f64), GeoError> {
    let rest = uri.strip_prefix("geo:").ok_or(GeoError::MissingPrefix)?;
    let coordinates = rest.split(';').next().unwrap_or_default();
    let parts: Vec<&str> = coordinates.split(',').collect();
    let [lat, lng] = parts.as_slice() else {
        return Err(GeoError::NotTwoNumbers);
    };
    let lat = lat.trim().parse::<f64>().map_err(GeoError::Latitude)?;
    let lng = lng.trim().parse::<f64>().map_err(GeoError::Longitude)?;
    Ok((lat, lng))
}

fn location_app(lat: f64, lng: f64) -> QqElement {
    let content = json!({
        "app": "com.tencent.map",
        "desc": "地图",
        "view": "LocationShare",
        "ver": "0.0.0.1",
        "prompt": "[应用]地图",
        "from": 1,
        "meta": {
            "Location.Search": {
                "id": "12250896297164027526",
                "name": "Location Share",
                "address": format!("Latitude: {lat:.5} Longitude: {lng:.5}"),
                "lat": format!("{lat:.5}"),
                "lng": format!("{lng:.5}"),
                "from": "plusPanel"
            }
        },
        "config": { "forward": 1, "autosize": 1, "type": "card" }
    });
    QqElement::LightApp {
        content: content.to_string(),
    }
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a [^>]*href=["']https://matrix\.to/#/([^"'?]+)[^"']*["'][^>]*>(.*?)</a>"#)
            .expect("valid regex")
    })
}

fn reply_fallback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<mx-reply>.*?</mx-reply>").expect("valid regex"))
}

fn line_break_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<br ?/?>|<BR ?/?>|</p>|</li>|</h[1-6]>|</blockquote>").expect("valid regex"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid regex"))
}

fn html_to_text(html: &str) -> String {
    let text = line_break_re().replace_all(html, "\n");
    let text = tag_re().replace_all(&text, "");
    unescape_html(&text)
}

/// Drops the `> <@user> quoted` lines clients prepend to plain reply bodies.
fn strip_reply_fallback(body: &str) -> &str {
    if !body.starts_with("> ") {
        return body;
    }
    match body.find("\n\n") {
        Some(end) => &body[end + 2..],
        None => body,
    }
}

/// Turns one Matrix message into QQ elements for the portal `portal`.
pub struct MatrixToQq<'a> {
    pub matrix: &'a dyn MatrixApi,
    pub qq: &'a dyn QqClient,
    pub codec: &'a dyn AudioCodec,
    pub puppets: &'a PuppetIdFormatter,
    pub portal: &'a PortalKey,
    pub max_file_size: usize,
}

impl MatrixToQq<'_> {
    pub async fn convert(
        &self,
        event_type: &str,
        content: &MessageContent,
        reply_to: Option<&MessageRecord>,
    ) -> Result<Vec<QqElement>, ConvertError> {
        let mut elements = Vec::new();
        if let Some(record) = reply_to.filter(|r| r.kind == MessageKind::Normal && !r.is_fake()) {
            elements.push(self.reply_element(record).await?);
        }

        let msgtype = if event_type == EVENT_STICKER {
            MSG_IMAGE
        } else {
            content.msgtype.as_str()
        };

        match msgtype {
            MSG_TEXT | MSG_NOTICE | MSG_EMOTE => {
                if msgtype == MSG_EMOTE {
                    elements.push(QqElement::text("/me "));
                }
                match content.formatted_body.as_deref() {
                    Some(html) if content.format.is_some() => {
                        elements.extend(self.parse_html(html).await);
                    }
                    _ => elements.push(QqElement::text(strip_reply_fallback(&content.body))),
                }
            }
            MSG_IMAGE => {
                let (name, data) = self.fetch_media(content).await?;
                elements.push(QqElement::Image {
                    source: MediaSource::Data(data),
                    file: name,
                });
            }
            MSG_VIDEO => {
                let (name, data) = self.fetch_media(content).await?;
                elements.push(QqElement::Video {
                    size: data.len() as u64,
                    source: MediaSource::Data(data),
                    name,
                });
            }
            MSG_AUDIO => {
                let (name, data) = self.fetch_media(content).await?;
                let silk = self.codec.ogg_to_silk(data).await.map_err(|err| {
                    ConvertError::Media(format!("failed to convert ogg audio to silk format: {err}"))
                })?;
                elements.push(QqElement::Voice {
                    source: MediaSource::Data(silk),
                    name,
                });
            }
            MSG_FILE => {
                let (name, data) = self.fetch_media(content).await?;
                elements.push(QqElement::File {
                    size: data.len() as u64,
                    source: MediaSource::Data(data),
                    name,
                });
            }
            MSG_LOCATION => {
                let geo = content.geo_uri.as_deref().unwrap_or_default();
                let (lat, lng) = parse_geo_uri(geo)?;
                elements.push(location_app(lat, lng));
            }
            other => return Err(ConvertError::UnsupportedMessageType(other.to_string())),
        }

        Ok(elements)
    }

    async fn reply_element(&self, record: &MessageRecord) -> Result<QqElement, ConvertError> {
        let sender = record.sender.uin();
        let Ok(seq) = record.key.seq.parse::<i64>() else {
            return Ok(self.mention(sender).await);
        };

        let (seq, group_id) = if self.portal.is_private() {
            let self_uin = self.qq.self_uin().ok_or(ConvertError::NotLoggedIn)?;
            let group_id = if sender == self_uin {
                self.portal.uid.uin().to_string()
            } else {
                self_uin
            };
            ((seq as u16).to_string(), group_id)
        } else {
            (seq.to_string(), self.portal.uid.uin().to_string())
        };

        Ok(QqElement::Reply {
            id: record.key.id.clone(),
            seq,
            time: record.timestamp,
            sender: sender.to_string(),
            group_id: Some(group_id),
            summary: record.content.clone(),
        })
    }

    /// `At` with the name the target shows under on QQ.
    async fn mention(&self, uin: &str) -> QqElement {
        let name = if self.portal.uid.is_group() {
            self.qq
                .fetch_group_member(self.portal.uid.uin(), uin)
                .await
                .ok()
                .flatten()
                .map(|member| member.display_name().to_string())
        } else {
            match self.qq.find_friend(uin).await {
                Ok(Some(friend)) => Some(friend.name),
                _ => self.qq.fetch_user_info(uin).await.ok().map(|info| info.name),
            }
        };
        let name = name.filter(|n| !n.is_empty()).unwrap_or_else(|| uin.to_string());
        QqElement::at(uin, format!("@{name}"))
    }

    async fn parse_html(&self, html: &str) -> Vec<QqElement> {
        let html = reply_fallback_re().replace_all(html, "");
        let mut elements = Vec::new();
        let mut last = 0;
        for caps in mention_re().captures_iter(&html) {
            let (Some(whole), Some(target), Some(label)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            push_text(&mut elements, html_to_text(&html[last..whole.start()]));
            last = whole.end();

            let mxid = urlencoding::decode(target.as_str())
                .map(|m| m.into_owned())
                .unwrap_or_else(|_| target.as_str().to_string());
            match self.puppets.parse(&mxid) {
                Some(uin) => elements.push(self.mention(&uin).await),
                None => {
                    debug!(mxid = %mxid, "mention of a non-ghost user kept as text");
                    push_text(&mut elements, html_to_text(label.as_str()));
                }
            }
        }
        push_text(&mut elements, html_to_text(&html[last..]));
        elements
    }

    async fn fetch_media(&self, content: &MessageContent) -> Result<(String, Vec<u8>), ConvertError> {
        let name = match content.filename.as_deref() {
            Some(filename) if !filename.is_empty() && filename != content.body => filename,
            _ => content.body.as_str(),
        }
        .to_string();

        let mxc = content
            .media_url()
            .ok_or_else(|| ConvertError::Media("message has no media url".to_string()))?;
        let mut data = self
            .matrix
            .download_media(mxc)
            .await
            .map_err(|err| ConvertError::Media(format!("failed to download media: {err}")))?;
        if let Some(file) = &content.file {
            data = attachment::decrypt(&data, file)
                .map_err(|err| ConvertError::Media(format!("failed to decrypt media: {err}")))?;
        }
        if data.len() > self.max_file_size {
            return Err(ConvertError::Media(format!(
                "file is larger than {} bytes",
                self.max_file_size
            )));
        }
        Ok((name, data))
    }
}

fn push_text(elements: &mut Vec<QqElement>, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(QqElement::Text { text: previous }) = elements.last_mut() {
        previous.push_str(&text);
    } else {
        elements.push(QqElement::text(text));
    }
}
