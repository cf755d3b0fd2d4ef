//! Download proxy: turns a pasted YouTube URL into an attachment response
//! whose body is piped straight from the resolver.
//!
//! Everything that can fail with a JSON error happens before the response is
//! returned. Once it is returned the status and headers are committed, and a
//! later failure can only abort the body.

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, TryStreamExt, stream};
use tracing::{error, info};

use crate::{
    http::ApiError,
    resolver::{ResolveError, ResolverHandle, TrackType},
    security::{attachment_disposition, sanitize_title},
    video_id::VideoId,
};

pub const MISSING_URL: &str = "Video URL is required";
pub const INVALID_URL: &str = "Invalid YouTube URL";

/// Generic client-facing failure for one track kind.
pub fn failure_message(track: TrackType) -> String {
    format!("Failed to download {}. Please try again.", track.label())
}

/// Validates the request, resolves the media and primes the stream with its
/// first chunk. Only then are headers built.
pub async fn prepare_download(
    handle: &ResolverHandle,
    raw_url: Option<&str>,
    track: TrackType,
) -> Result<Response, ApiError> {
    let raw_url = raw_url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request(MISSING_URL))?;
    let id = VideoId::extract(raw_url).ok_or_else(|| ApiError::bad_request(INVALID_URL))?;

    let fail = |err: ResolveError| {
        error!(video_id = %id, %track, "download failed: {err}");
        ApiError::internal(failure_message(track))
    };

    let resolver = handle.get_or_init().await.map_err(fail)?;
    let media = resolver.resolve(&id, track).await.map_err(fail)?;

    let mut chunks = media.stream.into_stream();
    let first = match chunks.next().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(err)) => return Err(fail(ResolveError::Io(err))),
        None => return Err(fail(ResolveError::EmptyStream)),
    };

    let filename = sanitize_title(&media.title, id.as_str());
    info!(video_id = %id, %track, %filename, "streaming download");

    let log_id = id.clone();
    let body = stream::once(async move { Ok(first) })
        .chain(chunks)
        .inspect_err(move |err| {
            error!(video_id = %log_id, %track, "download aborted mid-stream: {err}");
        });

    let mut response = Body::from_stream(body).into_response();
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(track.mime_type()),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_disposition(&filename, track.extension()),
    );
    Ok(response)
}
