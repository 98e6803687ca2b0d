use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::escape_html;
use crate::database::MessageErrorKind;
use crate::matrix::types::{
    EVENT_MESSAGE, MSG_AUDIO, MSG_FILE, MSG_IMAGE, MSG_LOCATION, MSG_TEXT, MSG_VIDEO, MatrixError,
    MediaInfo, Mentions, MessageContent,
};
use crate::matrix::{Intent, attachment};
use crate::qq::types::{AT_ALL_TARGET, MediaSource, QqElement};
use crate::qq::{AudioCodec, QqClient};
use crate::util::{detect_mime, image_dimensions};
use crate::web::global_metrics;

/// Resolves the Matrix side of a QQ mention: `(mxid, displayname)`.
#[async_trait]
pub trait MentionResolver: Send + Sync {
    async fn resolve_mention(&self, uin: &str) -> Option<(String, String)>;
}

/// A quoted QQ message, still to be matched against stored records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyInfo {
    pub id: String,
    pub seq: String,
    pub time: i64,
    pub sender: String,
}

#[derive(Debug, Clone)]
pub struct ConvertedMessage {
    pub event_type: &'static str,
    pub content: MessageContent,
    pub error: MessageErrorKind,
    pub reply: Option<ReplyInfo>,
    /// Text that accompanied a native media event, sent right after it.
    pub caption: Option<MessageContent>,
}

impl ConvertedMessage {
    fn message(content: MessageContent) -> Self {
        Self {
            event_type: EVENT_MESSAGE,
            content,
            error: MessageErrorKind::None,
            reply: None,
            caption: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Video,
    File,
    Voice,
}

impl MediaKind {
    fn label(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::File => "file",
            MediaKind::Voice => "voice",
        }
    }

    fn msgtype(self) -> &'static str {
        match self {
            MediaKind::Image => MSG_IMAGE,
            MediaKind::Video => MSG_VIDEO,
            MediaKind::File => MSG_FILE,
            MediaKind::Voice => MSG_AUDIO,
        }
    }
}

struct MediaFailure {
    reason: String,
    kind: MessageErrorKind,
}

impl MediaFailure {
    fn download(kind: MediaKind) -> Self {
        Self {
            reason: format!("failed to download {} from QQ", kind.label()),
            kind: MessageErrorKind::MediaNotFound,
        }
    }

    fn upload(err: MatrixError) -> Self {
        let reason = match err {
            MatrixError::TooLarge | MatrixError::ProxyTooLarge => err.to_string(),
            other => format!("failed to upload media: {other}"),
        };
        Self {
            reason,
            kind: MessageErrorKind::None,
        }
    }
}

/// Turns one QQ message into the Matrix event that represents it.
pub struct QqToMatrix<'a> {
    pub intent: &'a Intent,
    pub qq: &'a dyn QqClient,
    pub codec: &'a dyn AudioCodec,
    pub mentions: &'a dyn MentionResolver,
    pub encrypted: bool,
    pub native_lone_image: bool,
}

impl QqToMatrix<'_> {
    pub async fn convert(&self, elements: &[QqElement]) -> ConvertedMessage {
        let mut native: Option<ConvertedMessage> = None;
        let mut reply = None;
        let mut summary: Vec<String> = Vec::new();
        let mut mention_html: HashMap<usize, String> = HashMap::new();
        let mut rich: Vec<bool> = Vec::new();
        let mut mentioned = Mentions::default();
        let lone = elements.len() == 1;

        for element in elements {
            match element {
                QqElement::Text { text } => {
                    summary.push(text.clone());
                    rich.push(false);
                }
                QqElement::Face { name, .. } => {
                    summary.push(format!("/{name}"));
                    rich.push(false);
                }
                QqElement::At { target, display } => {
                    summary.push(display.clone());
                    rich.push(false);
                    if target == AT_ALL_TARGET || target == "all" {
                        mention_html.insert(summary.len() - 1, "@room".to_string());
                        mentioned.room = true;
                    } else if let Some((mxid, name)) = self.mentions.resolve_mention(target).await {
                        mention_html.insert(
                            summary.len() - 1,
                            format!(
                                r#"<a href="https://matrix.to/#/{}">{}</a>"#,
                                mxid,
                                escape_html(&name)
                            ),
                        );
                        mentioned.user_ids.push(mxid);
                    }
                }
                QqElement::Image { source, file } => {
                    if lone && self.native_lone_image {
                        native = Some(self.convert_media(MediaKind::Image, source, file).await);
                    } else {
                        summary.push(self.render_inline_image(source, file).await);
                        rich.push(true);
                    }
                }
                QqElement::Video { source, name, .. } => {
                    native = Some(self.convert_media(MediaKind::Video, source, name).await);
                }
                QqElement::File { source, name, .. } => {
                    native = Some(self.convert_media(MediaKind::File, source, name).await);
                }
                QqElement::Voice { source, name } => {
                    native = Some(self.convert_media(MediaKind::Voice, source, name).await);
                }
                QqElement::Reply {
                    id,
                    seq,
                    time,
                    sender,
                    ..
                } => {
                    reply = Some(ReplyInfo {
                        id: id.clone(),
                        seq: seq.clone(),
                        time: *time,
                        sender: sender.clone(),
                    });
                }
                QqElement::LightApp { content } => {
                    let parsed: Value = serde_json::from_str(content).unwrap_or(Value::Null);
                    if parsed.get("view").and_then(Value::as_str) == Some("LocationShare") {
                        native = Some(ConvertedMessage::message(convert_location(&parsed)));
                    } else {
                        summary.push(render_light_app(&parsed, content));
                        rich.push(true);
                    }
                }
                QqElement::Xml { content } => {
                    summary.push(render_forward_card(content).unwrap_or_else(|| content.clone()));
                    rich.push(false);
                }
                QqElement::Forward { .. } => {
                    summary.push(element.summary());
                    rich.push(false);
                }
            }
        }

        let mut converted = match native {
            Some(mut native) => {
                if summary.iter().any(|segment| !segment.trim().is_empty()) {
                    let mut caption =
                        build_text(summary, &rich, &mention_html, reply.is_some());
                    if !mentioned.user_ids.is_empty() || mentioned.room {
                        caption.mentions = Some(mentioned.clone());
                    }
                    native.caption = Some(caption);
                }
                native
            }
            None => ConvertedMessage::message(build_text(
                summary,
                &rich,
                &mention_html,
                reply.is_some(),
            )),
        };
        if !mentioned.user_ids.is_empty() || mentioned.room {
            converted.content.mentions = Some(mentioned);
        }
        converted.reply = reply;
        converted
    }

    async fn fetch(&self, source: &MediaSource) -> Option<Vec<u8>> {
        match source {
            MediaSource::Data(data) => Some(data.clone()),
            MediaSource::Url(url) => match self.qq.download_attachment(url).await {
                Ok(data) => Some(data),
                Err(err) => {
                    warn!(url = %url, error = %err, "QQ attachment download failed");
                    None
                }
            },
        }
    }

    async fn convert_media(
        &self,
        kind: MediaKind,
        source: &MediaSource,
        name: &str,
    ) -> ConvertedMessage {
        match self.try_convert_media(kind, source, name).await {
            Ok(content) => ConvertedMessage::message(content),
            Err(failure) => {
                warn!(kind = kind.label(), reason = %failure.reason, "Failed to bridge media");
                global_metrics().record_media_failure(kind.label());
                let mut converted = ConvertedMessage::message(MessageContent::notice(format!(
                    "Failed to bridge media: {}",
                    failure.reason
                )));
                converted.error = failure.kind;
                converted
            }
        }
    }

    async fn try_convert_media(
        &self,
        kind: MediaKind,
        source: &MediaSource,
        name: &str,
    ) -> Result<MessageContent, MediaFailure> {
        let mut data = self
            .fetch(source)
            .await
            .ok_or_else(|| MediaFailure::download(kind))?;

        let mut mime = detect_mime(&data, name);
        let mut voice = None;
        if kind == MediaKind::Voice {
            data = self.codec.silk_to_ogg(data).await.map_err(|err| {
                debug!(error = %err, "silk decode failed");
                MediaFailure {
                    reason: "failed to convert silk audio to ogg format".to_string(),
                    kind: MessageErrorKind::None,
                }
            })?;
            mime = "audio/ogg".to_string();
            voice = Some(json!({}));
        }

        let body = match kind {
            MediaKind::Image => mime.clone(),
            MediaKind::Voice if name.is_empty() => "voice.ogg".to_string(),
            _ if name.is_empty() => mime.clone(),
            _ => name.to_string(),
        };
        let mut content = MessageContent::new(kind.msgtype(), body);
        if kind == MediaKind::File || kind == MediaKind::Video {
            content.filename = (!name.is_empty()).then(|| name.to_string());
        }
        content.voice = voice;
        content.info = Some(MediaInfo {
            mimetype: Some(mime.clone()),
            ..Default::default()
        });

        self.upload(data, &mime, &mut content)
            .await
            .map_err(MediaFailure::upload)?;
        Ok(content)
    }

    /// Uploads `data` as the media of `content`, encrypting it first in
    /// encrypted portals, and fills in size and dimensions.
    async fn upload(
        &self,
        mut data: Vec<u8>,
        mime: &str,
        content: &mut MessageContent,
    ) -> Result<(), MatrixError> {
        let size = data.len() as u64;
        let dimensions = if mime.starts_with("image/") {
            image_dimensions(&data)
        } else {
            None
        };

        if self.encrypted {
            let mut file = attachment::encrypt(&mut data)?;
            file.url = self
                .intent
                .upload(data, "application/octet-stream", &content.body)
                .await?;
            content.file = Some(file);
        } else {
            content.url = Some(self.intent.upload(data, mime, &content.body).await?);
        }

        let info = content.info.get_or_insert_with(MediaInfo::default);
        info.size = Some(size);
        if let Some((w, h)) = dimensions {
            info.w = Some(w);
            info.h = Some(h);
        }
        Ok(())
    }

    async fn render_inline_image(&self, source: &MediaSource, file: &str) -> String {
        let Some(data) = self.fetch(source).await else {
            return "[图片]".to_string();
        };
        let mime = detect_mime(&data, file);
        match self.intent.upload(data, &mime, file).await {
            Ok(mxc) => format!("![{mime}]({mxc})"),
            Err(err) => {
                warn!(error = %err, "failed to upload inline image");
                "[图片]".to_string()
            }
        }
    }
}

fn build_text(
    mut summary: Vec<String>,
    rich: &[bool],
    mention_html: &HashMap<usize, String>,
    has_reply: bool,
) -> MessageContent {
    if summary.is_empty() {
        return MessageContent::text("[不支持的消息]");
    }

    let mut offset = 0;
    if !mention_html.is_empty() && has_reply && mention_html.contains_key(&0) {
        summary.remove(0);
        offset = 1;
    }
    let body: String = summary.concat();
    let any_rich = rich.iter().any(|r| *r);
    if mention_html.is_empty() && !any_rich {
        return MessageContent::text(body);
    }

    let mut html = String::new();
    for (pos, segment) in summary.iter().enumerate() {
        let index = pos + offset;
        if let Some(mention) = mention_html.get(&index) {
            html.push_str(mention);
        } else if rich.get(index).copied().unwrap_or(false) {
            html.push_str(&render_markdown(segment));
        } else {
            html.push_str(&escape_html(segment).replace('\n', "<br>"));
        }
    }
    MessageContent::new(MSG_TEXT, body).with_html(html)
}

fn meta_field<'a>(app: &'a Value, field: &str) -> Option<&'a Value> {
    app.get("meta")?
        .as_object()?
        .values()
        .find_map(|entry| entry.get(field))
}

fn meta_str(app: &Value, field: &str) -> String {
    match meta_field(app, field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn meta_f64(app: &Value, field: &str) -> f64 {
    match meta_field(app, field) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}

fn convert_location(app: &Value) -> MessageContent {
    let mut name = meta_str(app, "name");
    let address = meta_str(app, "address");
    let lat = meta_f64(app, "lat");
    let lng = meta_f64(app, "lng");
    if name.is_empty() {
        name = format!(
            "{:.4}° {} {:.4}° {}",
            lat.abs(),
            if lat >= 0.0 { "N" } else { "S" },
            lng.abs(),
            if lng >= 0.0 { "E" } else { "W" }
        );
    }

    let url = format!("https://maps.google.com/?q={lat:.5},{lng:.5}");
    let mut content = MessageContent::new(
        MSG_LOCATION,
        format!("Location: {name}\n{address}\n{url}"),
    )
    .with_html(format!(
        "Location: <a href='{url}'>{}</a><br>{}",
        escape_html(&name),
        escape_html(&address)
    ));
    content.geo_uri = Some(format!("geo:{lat:.5},{lng:.5}"));
    content
}

fn render_light_app(app: &Value, raw: &str) -> String {
    let title = meta_str(app, "title");
    let desc = meta_str(app, "desc");
    let doc_url = meta_str(app, "qqdocurl");
    if !doc_url.is_empty() {
        return format!("{desc}\n\nvia [{title}]({doc_url})");
    }
    let jump_url = meta_str(app, "jumpUrl");
    if !jump_url.is_empty() {
        let tag = meta_str(app, "tag");
        return format!("**{title}**\n\n{desc}\n\nvia [{tag}]({jump_url})");
    }
    raw.to_string()
}

fn forward_action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<msg[ \t\r\n][^>]*action[ \t\r\n]*=[ \t\r\n]*["']viewMultiMsg["']"#)
            .expect("valid regex")
    })
}

fn forward_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<item(?:[ \t\r\n][^>]*)?>(.*?)</item>").expect("valid regex")
    })
}

fn forward_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<(title|summary)(?:[ \t\r\n][^>]*)?>(.*?)</(?:title|summary)>")
            .expect("valid regex")
    })
}

/// Title lines and summary of a forwarded-messages card, or `None` for any
/// other XML card.
fn render_forward_card(xml: &str) -> Option<String> {
    if !forward_action_re().is_match(xml) {
        return None;
    }
    let mut titles = Vec::new();
    let mut summary = None;
    for item in forward_item_re().captures_iter(xml) {
        for line in forward_line_re().captures_iter(&item[1]) {
            let text = unescape_xml(line[2].trim());
            if text.is_empty() {
                continue;
            }
            if &line[1] == "summary" {
                summary.get_or_insert(text);
            } else {
                titles.push(text);
            }
        }
    }
    titles.extend(summary);
    if titles.is_empty() {
        return None;
    }
    Some(titles.join("\n"))
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^) \t\r\n]+)\)").expect("valid regex"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]*)\]\(([^) \t\r\n]+)\)").expect("valid regex"))
}

fn strong_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*([^*]+)\*\*").expect("valid regex"))
}

/// The small markdown subset produced by inline images and light apps.
pub fn render_markdown(text: &str) -> String {
    let escaped = escape_html(text);
    let html = image_re().replace_all(&escaped, r#"<img src="$2" alt="$1">"#);
    let html = link_re().replace_all(&html, r#"<a href="$2">$1</a>"#);
    let html = strong_re().replace_all(&html, "<strong>$1</strong>");
    html.replace('\n', "<br>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_card_becomes_geo_event() {
        let app = json!({
            "view": "LocationShare",
            "meta": {"Location.Search": {"name": "Tower", "address": "1 Road", "lat": "31.2304", "lng": 121.4737}}
        });
        let content = convert_location(&app);
        assert_eq!(content.msgtype, MSG_LOCATION);
        assert_eq!(content.geo_uri.as_deref(), Some("geo:31.23040,121.47370"));
        assert_eq!(
            content.body,
            "Location: Tower\n1 Road\nhttps://maps.google.com/?q=31.23040,121.47370"
        );
        assert_eq!(
            content.formatted_body.as_deref(),
            Some("Location: <a href='https://maps.google.com/?q=31.23040,121.47370'>Tower</a><br>1 Road")
        );
    }

    #[test]
    fn unnamed_location_uses_coordinates() {
        let app = json!({"meta": {"x": {"lat": -33.8688, "lng": -151.2093}}});
        let content = convert_location(&app);
        assert!(content.body.starts_with("Location: 33.8688° S 151.2093° W\n"));
    }

    #[test]
    fn light_apps_render_links() {
        let doc = json!({"meta": {"detail_1": {"title": "Doc", "desc": "Notes", "qqdocurl": "https://docs.qq.com/x"}}});
        assert_eq!(
            render_light_app(&doc, ""),
            "Notes\n\nvia [Doc](https://docs.qq.com/x)"
        );

        let news = json!({"meta": {"news": {"title": "Head", "desc": "Body", "tag": "Site", "jumpUrl": "https://e.com"}}});
        assert_eq!(
            render_light_app(&news, ""),
            "**Head**\n\nBody\n\nvia [Site](https://e.com)"
        );

        assert_eq!(render_light_app(&Value::Null, "{raw}"), "{raw}");
    }

    #[test]
    fn markdown_subset_renders_html() {
        assert_eq!(
            render_markdown("**Head**\n![image/png](mxc://s/a) [t](https://x.y/?a=1&b=2)"),
            "<strong>Head</strong><br><img src=\"mxc://s/a\" alt=\"image/png\"> <a href=\"https://x.y/?a=1&amp;b=2\">t</a>"
        );
    }

    #[test]
    fn reply_mention_prefix_is_dropped() {
        let mut mentions = HashMap::new();
        mentions.insert(0, "<a href=\"https://matrix.to/#/@qq_1:x\">A</a>".to_string());
        mentions.insert(2, "<a href=\"https://matrix.to/#/@qq_2:x\">B</a>".to_string());
        let content = build_text(
            vec!["@A".into(), " hi ".into(), "@B".into()],
            &[false, false, false],
            &mentions,
            true,
        );
        assert_eq!(content.body, " hi @B");
        assert_eq!(
            content.formatted_body.as_deref(),
            Some(" hi <a href=\"https://matrix.to/#/@qq_2:x\">B</a>")
        );
    }

    #[test]
    fn empty_message_gets_placeholder() {
        let content = build_text(Vec::new(), &[], &HashMap::new(), false);
        assert_eq!(content.body, "[不支持的消息]");
    }

    #[test]
    fn forward_cards_show_titles_and_summary() {
        let xml = r##"<?xml version='1.0' encoding='UTF-8' ?><msg serviceID="35" templateID="1" action="viewMultiMsg" brief="[聊天记录]" m_resid="abc"><item layout="1"><title color="#000000" size="34">群聊的聊天记录</title><title color="#777777" size="26">Alice: hi &amp; bye</title><title color="#777777" size="26">Bob: [图片]</title><hr></hr><summary color="#808080">查看2条转发消息</summary></item><source name="聊天记录"></source></msg>"##;
        assert_eq!(
            render_forward_card(xml).as_deref(),
            Some("群聊的聊天记录\nAlice: hi & bye\nBob: [图片]\n查看2条转发消息")
        );
    }

    #[test]
    fn other_xml_cards_are_left_alone() {
        let xml = r#"<msg serviceID="1" action="web" url="https://e.com"><item><title>News</title></item></msg>"#;
        assert_eq!(render_forward_card(xml), None);
    }
}
