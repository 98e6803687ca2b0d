pub mod matrix_to_qq;
pub mod qq_to_matrix;

pub use matrix_to_qq::{ConvertError, GeoError, MatrixToQq, parse_geo_uri};
pub use qq_to_matrix::{ConvertedMessage, MentionResolver, QqToMatrix, ReplyInfo};

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
