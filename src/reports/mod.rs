//! Report history: filter the host's system log, summarize it through an
//! external language model and keep a bounded history of reports.

pub mod store;
pub mod summarizer;

use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::detect::DetectError;

pub use self::store::{Report, ReportStore};
pub use self::summarizer::{HttpSummarizer, Summarizer};

/// Only the tail of the log is considered.
pub const MAX_LOG_CHARS: usize = 10_000;
/// Upper bound on filtered lines handed to the summarizer.
pub const MAX_LOG_LINES: usize = 6_000;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("summarizer request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("summarizer returned no usable text: {0}")]
    EmptySummary(String),

    #[error(transparent)]
    Storage(#[from] DetectError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportOutcome {
    /// Nothing matched the configured levels; the summarizer was not called.
    NoLogs,
    Generated { report: Report },
}

/// Last `MAX_LOG_CHARS` characters of `raw`, reduced to lines carrying one
/// of `levels` as a space-delimited token, capped at `MAX_LOG_LINES` lines.
pub fn filter_logs(raw: &str, levels: &[String]) -> String {
    let tail = tail_chars(raw, MAX_LOG_CHARS);
    let needles: Vec<String> = levels
        .iter()
        .map(|level| format!(" {} ", level.trim().to_ascii_uppercase()))
        .collect();

    let kept: Vec<&str> = tail
        .lines()
        .filter(|line| needles.iter().any(|n| line.contains(n.as_str())))
        .take(MAX_LOG_LINES)
        .collect();
    debug!(lines = kept.len(), "filtered log lines");
    kept.join("\n")
}

fn tail_chars(raw: &str, max: usize) -> &str {
    let total = raw.chars().count();
    if total <= max {
        return raw;
    }
    let skip = total - max;
    match raw.char_indices().nth(skip) {
        Some((idx, _)) => &raw[idx..],
        None => "",
    }
}

/// Read the log at `log_path`, filter it, summarize and store the result.
/// A missing or unreadable log counts as empty.
pub async fn generate_report(
    log_path: &Path,
    levels: &[String],
    summarizer: &dyn Summarizer,
    store: &ReportStore,
) -> Result<ReportOutcome, ReportError> {
    let raw = match tokio::fs::read_to_string(log_path).await {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %log_path.display(), error = %e, "log file unreadable, treating as empty");
            String::new()
        }
    };

    let filtered = filter_logs(&raw, levels);
    if filtered.is_empty() {
        info!(path = %log_path.display(), "no matching log lines, skipping summary");
        return Ok(ReportOutcome::NoLogs);
    }

    let summary = summarizer.summarize(&filtered).await?;
    let report = store.save(&summary, tail_chars(&filtered, MAX_LOG_CHARS)).await?;
    info!(id = report.id, "report generated");
    Ok(ReportOutcome::Generated { report })
}
