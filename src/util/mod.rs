use std::io::Cursor;

use regex::Regex;

/// Maps QQ uins to ghost MXIDs through the configured username template and
/// back again.
#[derive(Debug, Clone)]
pub struct PuppetIdFormatter {
    template: String,
    domain: String,
    regex: Regex,
}

impl PuppetIdFormatter {
    pub fn new(template: &str, domain: &str) -> Result<Self, regex::Error> {
        let (prefix, suffix) = template.split_once("{{.}}").unwrap_or((template, ""));
        let pattern = format!(
            "^@{}([0-9]+){}:{}$",
            regex::escape(prefix),
            regex::escape(suffix),
            regex::escape(domain)
        );
        Ok(Self {
            template: template.to_string(),
            domain: domain.to_string(),
            regex: Regex::new(&pattern)?,
        })
    }

    pub fn localpart(&self, uin: &str) -> String {
        self.template.replace("{{.}}", uin)
    }

    pub fn mxid(&self, uin: &str) -> String {
        format!("@{}:{}", self.localpart(uin), self.domain)
    }

    /// The uin behind a ghost MXID, if it is one.
    pub fn parse(&self, mxid: &str) -> Option<String> {
        self.regex
            .captures(mxid)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub fn is_puppet(&self, mxid: &str) -> bool {
        self.regex.is_match(mxid)
    }
}

/// Best effort content type from magic bytes, falling back to the file name.
pub fn detect_mime(data: &[u8], filename: &str) -> String {
    if let Ok(format) = image::guess_format(data) {
        return format.to_mime_type().to_string();
    }
    if data.starts_with(b"OggS") {
        return "audio/ogg".to_string();
    }
    if data.starts_with(b"#!SILK") || data.starts_with(b"\x02#!SILK") {
        return "audio/silk".to_string();
    }
    if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) {
        return "audio/mpeg".to_string();
    }
    if data.starts_with(b"#!AMR") {
        return "audio/amr".to_string();
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" {
        return "audio/wav".to_string();
    }
    if data.len() >= 8 && &data[4..8] == b"ftyp" {
        return "video/mp4".to_string();
    }
    if data.starts_with(b"%PDF") {
        return "application/pdf".to_string();
    }
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

pub fn image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    mime_guess::get_mime_extensions_str(mime).and_then(|exts| exts.first().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn puppet_mxids_round_trip_through_template() {
        let formatter = PuppetIdFormatter::new("qq_{{.}}", "example.org").unwrap();
        let mxid = formatter.mxid("123456");
        assert_eq!(mxid, "@qq_123456:example.org");
        assert_eq!(formatter.parse(&mxid).as_deref(), Some("123456"));
        assert!(formatter.parse("@qq_abc:example.org").is_none());
        assert!(formatter.parse("@qq_1:other.org").is_none());
        assert!(!formatter.is_puppet("@alice:example.org"));
    }

    #[test]
    fn template_with_suffix_is_escaped() {
        let formatter = PuppetIdFormatter::new("{{.}}.qq", "example.org").unwrap();
        assert_eq!(formatter.parse("@42.qq:example.org").as_deref(), Some("42"));
        assert!(formatter.parse("@42xqq:example.org").is_none());
    }

    #[test]
    fn mime_detection_uses_magic_then_name() {
        assert_eq!(detect_mime(b"\x89PNG\r\n\x1a\n0000", "x"), "image/png");
        assert_eq!(detect_mime(b"GIF89a....", "x"), "image/gif");
        assert_eq!(detect_mime(b"OggS\0\0", "voice"), "audio/ogg");
        assert_eq!(detect_mime(b"\x02#!SILK_V3", "voice"), "audio/silk");
        assert_eq!(detect_mime(b"plain words", "notes.txt"), "text/plain");
        assert_eq!(detect_mime(b"plain words", "blob"), "application/octet-stream");
    }
}
