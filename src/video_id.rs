//! Extraction of the 11-character YouTube video identifier from the URL shapes
//! clients paste into the download form.

use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::Serialize;

/// One grammar, three productions:
///
/// - `[?&]v=<ID>`: the watch-page query parameter
/// - `youtu.be/<ID>`: the share host
/// - `/<ID>`: a path segment (`/embed/<ID>`, `/shorts/<ID>`, `/v/<ID>` ...)
///
/// The token must end at a character outside the id charset, so a 12+
/// character run never yields a truncated id.
static ID_IN_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[?&]v=|youtu\.be/|/)(?P<id>[A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)")
        .expect("video id grammar compiles")
});

static BARE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("bare id pattern compiles"));

/// A validated video identifier. Always matches `^[A-Za-z0-9_-]{11}$`, so it
/// is safe as a URL segment, a query value and a process argument.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct VideoId(String);

impl VideoId {
    /// Pulls the identifier out of an arbitrary URL string. Existence of the
    /// video is not checked here.
    pub fn extract(raw: &str) -> Option<Self> {
        ID_IN_URL
            .captures_iter(raw.trim())
            .find_map(|caps| caps.name("id"))
            .map(|id| Self(id.as_str().to_owned()))
    }

    /// Accepts an already isolated identifier.
    pub fn parse(id: &str) -> Option<Self> {
        BARE_ID.is_match(id).then(|| Self(id.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
