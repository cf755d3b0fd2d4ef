//! Fakes shared by the in-file test modules.

use std::{io, sync::Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::{
    resolver::{MediaResolver, MediaStream, ResolveError, ResolvedMedia, TrackType},
    search::{SearchEntry, SearchProvider},
    video_id::VideoId,
};

/// Search provider returning a fixed list and recording every call.
pub struct FixedSearch {
    pub entries: Vec<SearchEntry>,
    pub fail: bool,
    pub calls: Mutex<Vec<(String, usize)>>,
}

impl FixedSearch {
    pub fn new(entries: Vec<SearchEntry>) -> Self {
        Self {
            entries,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl SearchProvider for FixedSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchEntry>> {
        self.calls.lock().unwrap().push((query.to_string(), limit));
        if self.fail {
            return Err(anyhow!("provider exploded: HTTP 429"));
        }
        Ok(self.entries.clone())
    }
}

pub fn entry(id: &str) -> SearchEntry {
    SearchEntry {
        id: Some(id.into()),
        title: Some(format!("Title {id}")),
        ..SearchEntry::default()
    }
}

/// How a [`CannedResolver`] stream ends.
#[derive(Clone, Copy, Debug)]
pub enum Ending {
    Clean,
    Fails,
}

/// Resolver serving a fixed payload without spawning anything.
pub struct CannedResolver {
    pub title: String,
    pub payload: Vec<u8>,
    pub ending: Ending,
    pub calls: Mutex<Vec<(VideoId, TrackType)>>,
}

impl CannedResolver {
    pub fn new(title: &str, payload: &[u8], ending: Ending) -> Self {
        Self {
            title: title.to_string(),
            payload: payload.to_vec(),
            ending,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MediaResolver for CannedResolver {
    async fn resolve(
        &self,
        id: &VideoId,
        track: TrackType,
    ) -> Result<ResolvedMedia, ResolveError> {
        self.calls.lock().unwrap().push((id.clone(), track));
        let ending = self.ending;
        let finish = async move {
            match ending {
                Ending::Clean => Ok(()),
                Ending::Fails => Err(io::Error::other("ffmpeg exited with exit status: 1")),
            }
        };
        Ok(ResolvedMedia {
            title: self.title.clone(),
            stream: MediaStream::new(io::Cursor::new(self.payload.clone()), finish),
        })
    }
}

/// Resolver that always fails before producing a stream.
pub struct BrokenResolver;

#[async_trait]
impl MediaResolver for BrokenResolver {
    async fn resolve(
        &self,
        _id: &VideoId,
        track: TrackType,
    ) -> Result<ResolvedMedia, ResolveError> {
        Err(ResolveError::NoSuitableFormat(track))
    }
}

#[cfg(unix)]
pub use stubs::install_stub;

#[cfg(target_os = "linux")]
pub use procfs::{exited_within, read_pid};

#[cfg(unix)]
mod stubs {
    use std::{
        fs,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    };

    /// Writes an executable shell script standing in for an external tool.
    pub fn install_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }
}

#[cfg(target_os = "linux")]
mod procfs {
    use std::{path::Path, time::Duration};

    use tokio::time::{Instant, sleep};

    const POLL: Duration = Duration::from_millis(20);

    /// Waits for a stub to write its `$$` into `path`.
    pub async fn read_pid(path: &Path) -> u32 {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(pid) = std::fs::read_to_string(path)
                .unwrap_or_default()
                .trim()
                .parse()
            {
                return pid;
            }
            assert!(Instant::now() < deadline, "no pid in {}", path.display());
            sleep(POLL).await;
        }
    }

    /// A zombie counts as exited: it has been killed and only awaits reaping.
    fn running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/status")) {
            Ok(status) => !status
                .lines()
                .any(|line| line.starts_with("State:") && line.contains('Z')),
            Err(_) => false,
        }
    }

    pub async fn exited_within(pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while running(pid) {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL).await;
        }
        true
    }
}
