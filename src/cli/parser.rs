//! Normalize provider output into a [`Measurement`].
//!
//! Providers print banners, warnings and log lines around their JSON, so the
//! payload is cut out from the first `{` to the last `}` before parsing.

use serde_json::{json, Value};

use super::provider::OutputShape;
use crate::session::error::{excerpt, ErrorCode, SessionError};
use crate::session::model::Measurement;

/// Parse `raw` provider output according to `shape`.
///
/// A document whose bandwidth fields are all zero or missing is rejected:
/// that almost always means a field-name mismatch rather than a real reading.
pub fn parse(shape: OutputShape, raw: &str, excerpt_chars: usize) -> Result<Measurement, SessionError> {
    let raw_excerpt = || excerpt(raw, excerpt_chars);

    let json_text = extract_json_object(raw).ok_or_else(|| {
        SessionError::new(
            ErrorCode::JsonParseFailed,
            "Failed to locate JSON payload in CLI output",
        )
        .with_details(json!({ "rawOutput": raw_excerpt() }))
    })?;

    let doc: Value = serde_json::from_str(json_text).map_err(|e| {
        SessionError::new(
            ErrorCode::JsonParseFailed,
            format!("Failed to parse CLI JSON: {}", raw_excerpt()),
        )
        .with_details(json!({ "rawOutput": raw_excerpt(), "cause": e.to_string() }))
    })?;

    let (download_mbps, upload_mbps, server_info) = match shape {
        OutputShape::BandwidthBytes => (
            bandwidth_mbps(&doc, "download"),
            bandwidth_mbps(&doc, "upload"),
            server_info(&doc, &["name", "location", "country"]),
        ),
        OutputShape::BitsPerSecond => (
            bits_mbps(&doc, "download"),
            bits_mbps(&doc, "upload"),
            server_info(&doc, &["sponsor", "name", "country"]),
        ),
    };

    if download_mbps <= 0.0 && upload_mbps <= 0.0 {
        return Err(SessionError::new(
            ErrorCode::JsonParseFailed,
            format!("CLI result parsing failed: {}", raw_excerpt()),
        )
        .with_details(json!({ "rawOutput": raw_excerpt() })));
    }

    Ok(Measurement {
        download_mbps: download_mbps.max(0.0),
        upload_mbps: upload_mbps.max(0.0),
        server_info,
    })
}

/// Slice from the first `{` to the last `}`, if both exist in that order.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&raw[start..=end])
}

// Nested `<key>.bandwidth` in bytes/s, else top-level `<key>` in bits/s.
fn bandwidth_mbps(doc: &Value, key: &str) -> f64 {
    let bandwidth = doc
        .get(key)
        .and_then(|v| v.get("bandwidth"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    if bandwidth > 0.0 {
        bandwidth * 8.0 / 1_000_000.0
    } else {
        bits_mbps(doc, key)
    }
}

fn bits_mbps(doc: &Value, key: &str) -> f64 {
    doc.get(key).and_then(Value::as_f64).unwrap_or(0.0) / 1_000_000.0
}

fn server_info(doc: &Value, fields: &[&str]) -> Option<String> {
    let server = doc.get("server")?;
    let parts: Vec<&str> = fields
        .iter()
        .filter_map(|f| server.get(*f).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" / "))
    }
}
