//! YouTube search and download proxy.
//!
//! The browser UI talks to a small JSON API; searches and media fetches are
//! delegated to `yt-dlp` and `ffmpeg`, and downloads are streamed straight
//! through to the client without touching disk.

pub mod config;
pub mod download;
pub mod http;
pub mod process;
pub mod resolver;
pub mod search;
pub mod security;
pub mod video_id;

#[cfg(test)]
mod test_support;
