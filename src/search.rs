//! Keyword search. The provider's raw entries keep every display field
//! optional; [`SearchResultItem::from_entry`] is the only place absence turns
//! into the `"N/A"` sentinel.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DefaultOnError, serde_as};
use tracing::warn;

use crate::{
    config::ToolPaths,
    process::{Stage, run_captured, stderr_tail},
};

/// Most results a single search returns.
pub const SEARCH_LIMIT: usize = 10;

const NOT_AVAILABLE: &str = "N/A";
const UNKNOWN_CHANNEL: &str = "Unknown";

/// Provider-side shape of one hit. Nothing is guaranteed to be present, and a
/// field holding an unexpected type reads as absent rather than dropping the
/// whole entry.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchEntry {
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub id: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub title: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub thumbnails: Option<Vec<Thumbnail>>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub thumbnail: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub channel: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub uploader: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub duration: Option<f64>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub duration_string: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub view_count: Option<u64>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub upload_date: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub timestamp: Option<f64>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub release_timestamp: Option<f64>,
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Thumbnail {
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub url: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub width: Option<u32>,
}

/// Stable, reduced search result served to the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultItem {
    pub id: String,
    pub title: String,
    #[serde(rename = "thumbnail")]
    pub thumbnail_url: String,
    #[serde(rename = "channel")]
    pub channel_name: String,
    pub duration: String,
    #[serde(rename = "views")]
    pub view_count: String,
    pub upload_date: String,
}

impl SearchResultItem {
    /// Maps a raw entry. Entries without an id are unusable for download and
    /// yield `None`.
    pub fn from_entry(entry: SearchEntry) -> Option<Self> {
        let id = entry.id.filter(|id| !id.trim().is_empty())?;
        let thumbnail_url = entry
            .thumbnails
            .as_deref()
            .and_then(best_thumbnail)
            .or(entry.thumbnail)
            .unwrap_or_default();
        let channel_name = entry
            .channel
            .or(entry.uploader)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_CHANNEL.to_string());
        let duration = entry
            .duration
            .and_then(format_duration)
            .or(entry.duration_string)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let view_count = entry
            .view_count
            .map(format_views)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let upload_date = entry
            .upload_date
            .as_deref()
            .and_then(format_upload_date)
            .or_else(|| {
                entry
                    .timestamp
                    .or(entry.release_timestamp)
                    .and_then(format_timestamp)
            })
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());

        Some(Self {
            title: entry.title.unwrap_or_default(),
            id,
            thumbnail_url,
            channel_name,
            duration,
            view_count,
            upload_date,
        })
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Returns at most `limit` ranked entries, videos only.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchEntry>>;
}

/// Runs a search and shapes the result.
pub async fn search_videos(
    provider: &dyn SearchProvider,
    query: &str,
) -> Result<Vec<SearchResultItem>> {
    let entries = provider.search(query, SEARCH_LIMIT).await?;
    Ok(entries
        .into_iter()
        .filter_map(SearchResultItem::from_entry)
        .take(SEARCH_LIMIT)
        .collect())
}

/// Search through `yt-dlp`'s `ytsearchN:` pseudo-URL in flat mode, so no
/// per-video page is fetched.
#[derive(Debug, Clone)]
pub struct YtDlpSearch {
    tools: ToolPaths,
}

impl YtDlpSearch {
    pub fn new(tools: ToolPaths) -> Self {
        Self { tools }
    }

    fn stage(&self, query: &str, limit: usize) -> Stage {
        Stage::new(
            "yt-dlp",
            &self.tools.yt_dlp,
            [
                "--flat-playlist".to_string(),
                "--dump-single-json".to_string(),
                "--no-warnings".to_string(),
                format!("ytsearch{limit}:{query}"),
            ],
        )
    }
}

#[async_trait]
impl SearchProvider for YtDlpSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchEntry>> {
        let output = run_captured(&self.stage(query, limit)).await?;
        if !output.status.success() {
            bail!(
                "yt-dlp search exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        parse_search_payload(&output.stdout)
    }
}

/// Parses a `--dump-single-json` playlist. Entries that are not objects are
/// skipped; mistyped fields inside an entry read as absent.
pub fn parse_search_payload(raw: &[u8]) -> Result<Vec<SearchEntry>> {
    let payload: Value = serde_json::from_slice(raw).context("parsing yt-dlp search response")?;
    let entries = match payload.get("entries") {
        Some(Value::Array(entries)) => entries.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => bail!("yt-dlp search response has non-array entries"),
    };
    Ok(entries
        .into_iter()
        .filter(|entry| !entry.is_null())
        .filter_map(|entry| match serde_json::from_value::<SearchEntry>(entry) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("skipping malformed search entry: {err}");
                None
            }
        })
        .collect())
}

fn best_thumbnail(thumbnails: &[Thumbnail]) -> Option<String> {
    thumbnails
        .iter()
        .enumerate()
        .filter(|(_, thumb)| thumb.url.is_some())
        .max_by_key(|(index, thumb)| (thumb.width.unwrap_or(0), *index))
        .and_then(|(_, thumb)| thumb.url.clone())
}

fn format_duration(seconds: f64) -> Option<String> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    Some(if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    })
}

fn format_views(count: u64) -> String {
    let digits = count.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if count == 1 {
        format!("{grouped} view")
    } else {
        format!("{grouped} views")
    }
}

fn format_upload_date(value: &str) -> Option<String> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

fn format_timestamp(timestamp: f64) -> Option<String> {
    if !timestamp.is_finite() {
        return None;
    }
    DateTime::from_timestamp(timestamp.floor() as i64, 0)
        .map(|datetime| datetime.format("%Y-%m-%d").to_string())
}
