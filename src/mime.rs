//! Content type helpers.

use std::path::Path;

pub const HTML_MIME_TYPE: &str = "text/html";
pub const CSS_MIME_TYPE: &str = "text/css";
pub const JS_MIME_TYPE: &str = "application/javascript";
pub const JSON_MIME_TYPE: &str = "application/json";
pub const SVG_MIME_TYPE: &str = "image/svg+xml";
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Normalize a content type for registry lookups: parameters are dropped and
/// the essence is trimmed and lowercased (`Text/HTML; charset=utf-8` → `text/html`).
pub fn normalize(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Infer a content type from the extension of a uri's path.
pub fn from_uri(uri: &str) -> &'static str {
    let path = match url::Url::parse(uri) {
        Ok(url) => url.path().to_string(),
        Err(_) => uri.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    let extension = Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("html") | Some("htm") => HTML_MIME_TYPE,
        Some("css") => CSS_MIME_TYPE,
        Some("js") | Some("mjs") | Some("cjs") => JS_MIME_TYPE,
        Some("json") => JSON_MIME_TYPE,
        Some("svg") => SVG_MIME_TYPE,
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// The content type of an element's embedded text, if the element carries
/// any: `<style>` and `<script>` default to CSS and JavaScript unless an
/// explicit `type` attribute says otherwise.
pub fn element_text_mime_type(element_name: &str, type_attr: Option<&str>) -> Option<String> {
    let fallback = match element_name {
        "style" => CSS_MIME_TYPE,
        "script" => JS_MIME_TYPE,
        _ => return None,
    };

    match type_attr.map(normalize) {
        Some(explicit) if !explicit.is_empty() => Some(explicit),
        _ => Some(fallback.to_string()),
    }
}
