//! Media resolution: turning a [`VideoId`] plus a track type into a live byte
//! stream.
//!
//! The resolver never implements YouTube's protocol itself. [`YtDlpResolver`]
//! asks `yt-dlp` for the format list, picks a [`FetchPlan`], and starts a
//! `yt-dlp`/`ffmpeg` pipeline whose stdout becomes the [`MediaStream`].
//! Other backends can be plugged in behind the [`MediaResolver`] trait.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    future::Future,
    io,
    path::Path,
    pin::Pin,
    sync::Arc,
};

use async_trait::async_trait;
use axum::body::Bytes;
use futures::{
    StreamExt,
    future::{self, BoxFuture},
    stream::{self, BoxStream},
};
use serde::Deserialize;
use serde_with::{DefaultOnNull, serde_as};
use thiserror::Error;
use tokio::{io::AsyncRead, sync::OnceCell};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::{
    config::ToolPaths,
    process::{ProcessPipeline, Stage, run_captured, stderr_tail},
    video_id::VideoId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackType {
    Audio,
    Video,
}

impl TrackType {
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Audio => "audio/mpeg",
            Self::Video => "video/mp4",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video => "mp4",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("media tool unavailable: {0}")]
    ToolUnavailable(String),
    #[error("fetching media metadata failed: {0}")]
    Metadata(String),
    #[error("no suitable {0} format available")]
    NoSuitableFormat(TrackType),
    #[error("starting download pipeline failed: {0}")]
    Spawn(#[source] io::Error),
    #[error("download produced no data")]
    EmptyStream,
    #[error("download failed before the first byte: {0}")]
    Io(#[source] io::Error),
}

/// Resolved media ready to be piped to a client.
pub struct ResolvedMedia {
    pub title: String,
    pub stream: MediaStream,
}

/// Live media bytes plus the completion check that runs once the reader hits
/// EOF. Dropping it before completion drops whatever owns the upstream
/// (for the pipeline backend: kills the processes).
pub struct MediaStream {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    finish: BoxFuture<'static, io::Result<()>>,
}

impl MediaStream {
    pub fn new<R, F>(reader: R, finish: F) -> Self
    where
        R: AsyncRead + Send + 'static,
        F: Future<Output = io::Result<()>> + Send + 'static,
    {
        Self {
            reader: Box::pin(reader),
            finish: Box::pin(finish),
        }
    }

    /// Pull-based chunk stream. Reads only happen when the consumer polls, so
    /// a slow client pauses the upstream instead of growing a buffer. An
    /// unsuccessful completion surfaces as a final `Err` item.
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        let Self { reader, finish } = self;
        ReaderStream::new(reader)
            .chain(
                stream::once(finish)
                    .filter_map(|result| future::ready(result.err().map(Err::<Bytes, _>))),
            )
            .boxed()
    }
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, id: &VideoId, track: TrackType)
    -> Result<ResolvedMedia, ResolveError>;
}

type ResolverInit =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn MediaResolver>, ResolveError>> + Send + Sync>;

/// Process-wide resolver slot with single-flight initialisation. Concurrent
/// first callers await the same init; a failed init leaves the slot empty so a
/// later request can try again.
pub struct ResolverHandle {
    cell: OnceCell<Arc<dyn MediaResolver>>,
    init: ResolverInit,
}

impl ResolverHandle {
    pub fn new<F, Fut>(init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn MediaResolver>, ResolveError>> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            init: Box::new(move || Box::pin(init()) as BoxFuture<'static, _>),
        }
    }

    /// Handle backed by the `yt-dlp`/`ffmpeg` pipeline.
    pub fn yt_dlp(tools: ToolPaths) -> Self {
        Self::new(move || {
            let tools = tools.clone();
            async move {
                let resolver = YtDlpResolver::connect(tools).await?;
                Ok(Arc::new(resolver) as Arc<dyn MediaResolver>)
            }
        })
    }

    /// Handle around an already constructed resolver.
    pub fn ready(resolver: Arc<dyn MediaResolver>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(resolver)),
            init: Box::new(|| {
                Box::pin(async {
                    Err(ResolveError::ToolUnavailable(
                        "resolver slot was pre-filled".into(),
                    ))
                }) as BoxFuture<'static, _>
            }),
        }
    }

    pub async fn get_or_init(&self) -> Result<Arc<dyn MediaResolver>, ResolveError> {
        self.cell
            .get_or_try_init(|| (self.init)())
            .await
            .map(Arc::clone)
    }
}

/// Subset of `yt-dlp -J` output the resolver needs. Every field is optional
/// on the wire; `null` reads the same as a missing key.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnNull")]
    pub formats: Vec<Format>,
}

#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Format {
    #[serde(default)]
    #[serde_as(as = "DefaultOnNull")]
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub http_headers: Option<BTreeMap<String, String>>,
}

impl Format {
    fn codec_present(codec: &Option<String>) -> bool {
        codec
            .as_deref()
            .is_some_and(|codec| !codec.is_empty() && codec != "none")
    }

    pub fn has_video(&self) -> bool {
        Self::codec_present(&self.vcodec)
    }

    pub fn has_audio(&self) -> bool {
        Self::codec_present(&self.acodec)
    }

    fn ext_is(&self, ext: &str) -> bool {
        self.ext.as_deref() == Some(ext)
    }

    fn audio_rate(&self) -> f64 {
        self.abr.or(self.tbr).unwrap_or(0.0)
    }

    fn total_rate(&self) -> f64 {
        self.tbr.unwrap_or(0.0)
    }

    fn usable(&self) -> bool {
        !self.format_id.is_empty() && !self.ext_is("mhtml")
    }
}

/// How the bytes for one download are produced.
#[derive(Debug, Clone)]
pub enum FetchPlan {
    /// A pre-muxed format streamed as-is.
    Direct(Format),
    /// An audio-bearing format re-encoded to MP3.
    Transcode(Format),
    /// Separate video and audio streams joined by ffmpeg.
    Mux { video: Format, audio: Format },
}

impl FetchPlan {
    /// Picks the highest quality plan for `track`.
    pub fn select(info: &MediaInfo, track: TrackType) -> Result<Self, ResolveError> {
        let usable = || info.formats.iter().filter(|format| format.usable());
        match track {
            TrackType::Audio => {
                let audio_only = usable()
                    .filter(|format| format.has_audio() && !format.has_video())
                    .max_by(|a, b| compare_audio(a, b));
                let any_audio = || {
                    usable()
                        .filter(|format| format.has_audio())
                        .max_by(|a, b| a.total_rate().total_cmp(&b.total_rate()))
                };
                audio_only
                    .or_else(any_audio)
                    .cloned()
                    .map(Self::Transcode)
                    .ok_or(ResolveError::NoSuitableFormat(track))
            }
            TrackType::Video => {
                let premuxed = usable()
                    .filter(|format| format.has_video() && format.has_audio() && format.ext_is("mp4"))
                    .max_by(|a, b| compare_video(a, b));
                if let Some(format) = premuxed {
                    return Ok(Self::Direct(format.clone()));
                }

                let video = usable()
                    .filter(|format| format.has_video() && !format.has_audio() && format.url.is_some())
                    .max_by(|a, b| compare_video(a, b));
                let audio = usable()
                    .filter(|format| format.has_audio() && !format.has_video() && format.url.is_some())
                    .max_by(|a, b| compare_audio(a, b));
                match (video, audio) {
                    (Some(video), Some(audio)) => Ok(Self::Mux {
                        video: video.clone(),
                        audio: audio.clone(),
                    }),
                    _ => Err(ResolveError::NoSuitableFormat(track)),
                }
            }
        }
    }

    /// Programs to run for this plan. `source_url` is what `yt-dlp` fetches.
    pub fn stages(&self, tools: &ToolPaths, source_url: &str) -> Vec<Stage> {
        match self {
            Self::Direct(format) => vec![yt_dlp_fetch(&tools.yt_dlp, format, source_url)],
            Self::Transcode(format) => vec![
                yt_dlp_fetch(&tools.yt_dlp, format, source_url),
                Stage::new(
                    "ffmpeg",
                    &tools.ffmpeg,
                    [
                        "-hide_banner",
                        "-loglevel",
                        "error",
                        "-i",
                        "pipe:0",
                        "-vn",
                        "-c:a",
                        "libmp3lame",
                        "-q:a",
                        "2",
                        "-f",
                        "mp3",
                        "pipe:1",
                    ],
                ),
            ],
            Self::Mux { video, audio } => {
                let mut args: Vec<String> = vec![
                    "-hide_banner".into(),
                    "-loglevel".into(),
                    "error".into(),
                ];
                for input in [video, audio] {
                    if let Some(headers) = input.http_headers.as_ref().and_then(ffmpeg_headers) {
                        args.push("-headers".into());
                        args.push(headers);
                    }
                    args.push("-i".into());
                    args.push(input.url.clone().unwrap_or_default());
                }
                args.extend(
                    [
                        "-map",
                        "0:v:0",
                        "-map",
                        "1:a:0",
                        "-c",
                        "copy",
                        // mp4 on a pipe must be fragmented; there is no seeking back to
                        // write the index.
                        "-movflags",
                        "frag_keyframe+empty_moov",
                        "-f",
                        "mp4",
                        "pipe:1",
                    ]
                    .map(String::from),
                );
                vec![Stage::new("ffmpeg", &tools.ffmpeg, args)]
            }
        }
    }
}

fn compare_audio(a: &Format, b: &Format) -> Ordering {
    a.audio_rate()
        .total_cmp(&b.audio_rate())
        .then_with(|| a.ext_is("m4a").cmp(&b.ext_is("m4a")))
}

fn compare_video(a: &Format, b: &Format) -> Ordering {
    a.height
        .unwrap_or(0)
        .cmp(&b.height.unwrap_or(0))
        .then_with(|| a.ext_is("mp4").cmp(&b.ext_is("mp4")))
        .then_with(|| a.total_rate().total_cmp(&b.total_rate()))
}

fn yt_dlp_fetch(program: &Path, format: &Format, source_url: &str) -> Stage {
    Stage::new(
        "yt-dlp",
        program,
        [
            "--quiet",
            "--no-warnings",
            "--no-playlist",
            "--no-part",
            "-f",
            format.format_id.as_str(),
            "-o",
            "-",
            source_url,
        ],
    )
}

fn ffmpeg_headers(headers: &BTreeMap<String, String>) -> Option<String> {
    if headers.is_empty() {
        return None;
    }
    Some(
        headers
            .iter()
            .map(|(key, value)| format!("{key}: {value}\r\n"))
            .collect(),
    )
}

/// Resolver backed by the `yt-dlp` and `ffmpeg` executables.
#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    tools: ToolPaths,
}

impl YtDlpResolver {
    /// Verifies both tools answer a version query. This is the expensive
    /// one-time setup [`ResolverHandle`] guards.
    pub async fn connect(tools: ToolPaths) -> Result<Self, ResolveError> {
        let yt_dlp_version = probe_version(Stage::new("yt-dlp", &tools.yt_dlp, ["--version"])).await?;
        let ffmpeg_version = probe_version(Stage::new("ffmpeg", &tools.ffmpeg, ["-version"])).await?;
        info!(
            yt_dlp = %yt_dlp_version,
            ffmpeg = %ffmpeg_version,
            "media resolver ready"
        );
        Ok(Self { tools })
    }

    pub async fn fetch_info(&self, id: &VideoId) -> Result<MediaInfo, ResolveError> {
        let stage = Stage::new(
            "yt-dlp",
            &self.tools.yt_dlp,
            [
                "-J".to_string(),
                "--no-playlist".to_string(),
                "--no-warnings".to_string(),
                id.watch_url(),
            ],
        );
        let output = run_captured(&stage)
            .await
            .map_err(|err| ResolveError::Metadata(err.to_string()))?;
        if !output.status.success() {
            return Err(ResolveError::Metadata(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|err| ResolveError::Metadata(format!("parsing yt-dlp metadata: {err}")))
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve(
        &self,
        id: &VideoId,
        track: TrackType,
    ) -> Result<ResolvedMedia, ResolveError> {
        let info = self.fetch_info(id).await?;
        let plan = FetchPlan::select(&info, track)?;
        debug!(video = %id, ?plan, "selected fetch plan");
        let stages = plan.stages(&self.tools, &id.watch_url());
        let (stdout, pipeline) = ProcessPipeline::spawn(&stages).map_err(ResolveError::Spawn)?;
        Ok(ResolvedMedia {
            title: info.title.unwrap_or_default(),
            stream: MediaStream::new(stdout, pipeline.wait()),
        })
    }
}

async fn probe_version(stage: Stage) -> Result<String, ResolveError> {
    let output = run_captured(&stage)
        .await
        .map_err(|err| ResolveError::ToolUnavailable(err.to_string()))?;
    if !output.status.success() {
        return Err(ResolveError::ToolUnavailable(format!(
            "{} exited with {}",
            stage.name, output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}
