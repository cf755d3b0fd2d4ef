#![forbid(unsafe_code)]

//! Shared security helpers: process privilege checks and keeping
//! user-controlled text out of response headers.

use anyhow::{Result, bail};
use axum::http::HeaderValue;
use nix::unistd::Uid;

/// Longest sanitized title, in characters, placed in `Content-Disposition`.
pub const MAX_TITLE_CHARS: usize = 100;

/// Fails fast when the server is started as root. It only spawns
/// `yt-dlp`/`ffmpeg` on behalf of anonymous clients, which should never
/// inherit root privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Reduces an upstream title to word characters and spaces, capped at
/// [`MAX_TITLE_CHARS`]. Returns `fallback` when nothing usable remains.
pub fn sanitize_title(title: &str, fallback: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '_' {
                Some(c)
            } else if c.is_whitespace() {
                Some(' ')
            } else {
                None
            }
        })
        .collect();
    let truncated: String = cleaned.trim().chars().take(MAX_TITLE_CHARS).collect();
    let truncated = truncated.trim_end();
    if truncated.is_empty() {
        fallback.to_string()
    } else {
        truncated.to_string()
    }
}

/// Builds `attachment; filename="<base>.<ext>"`. Non-ASCII titles are legal
/// in header values only as opaque bytes, so they additionally get an RFC 5987
/// `filename*` parameter and an ASCII-only plain `filename`.
pub fn attachment_disposition(base: &str, ext: &str) -> HeaderValue {
    let ascii: String = base.chars().filter(char::is_ascii).collect();
    let ascii = ascii.trim();
    let ascii = if ascii.is_empty() { "download" } else { ascii };
    let raw = if ascii.len() == base.len() {
        format!("attachment; filename=\"{base}.{ext}\"")
    } else {
        format!(
            "attachment; filename=\"{ascii}.{ext}\"; filename*=UTF-8''{}.{ext}",
            urlencoding::encode(base)
        )
    };
    HeaderValue::from_str(&raw).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
