//! Human-readable formatting of progress and results.

use crate::session::model::{ProgressEvent, TerminalResult};

/// Format a rate, switching to Gbps at 1000 Mbps.
pub fn format_rate(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// One progress line: `download  42% 93.4 Mbps`.
pub fn format_progress(event: &ProgressEvent) -> String {
    format!(
        "{:<8} {:>3}% {}",
        event.phase.as_str(),
        (event.progress * 100.0).round() as u32,
        format_rate(event.mbps)
    )
}

/// Summarize a terminal result.
pub fn format_summary(result: &TerminalResult) -> String {
    match result {
        TerminalResult::Success(m) => {
            let mut summary = format!(
                "download: {}, upload: {}",
                format_rate(m.download_mbps),
                format_rate(m.upload_mbps)
            );
            if let Some(server) = &m.server_info {
                summary.push_str(&format!(", server: {}", server));
            }
            summary
        }
        TerminalResult::Error(e) => format!("failed ({}): {}", e.code, e.message),
    }
}
