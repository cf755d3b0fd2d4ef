#![forbid(unsafe_code)]

//! Axum front door: JSON search and download endpoints plus the static web
//! root for the browser UI.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use serde::Serialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};

use crate::{
    download::prepare_download,
    resolver::{ResolverHandle, TrackType},
    search::{SearchProvider, SearchResultItem, search_videos as run_search},
};

const SEARCH_QUERY_REQUIRED: &str = "Search query is required";
const SEARCH_FAILED: &str = "Failed to search videos";

/// Shared handler state. Cloned per request, so everything sits behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<ResolverHandle>,
    pub search: Arc<dyn SearchProvider>,
    pub www_root: Arc<PathBuf>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 404 error with the provided message.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Raw query pairs. Taking them untyped means a repeated key never turns into
/// an extractor rejection; the first occurrence wins.
pub type QueryPairs = Vec<(String, String)>;

fn first_param<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub success: bool,
    pub videos: Vec<SearchResultItem>,
}

/// Builds the full application router.
pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/search", get(search_videos))
        .route("/api/download/audio", get(download_audio))
        .route("/api/download/video", get(download_video))
        .route("/api/health", get(health))
        .fallback(static_fallback)
        .with_state(state)
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
}

/// Any origin unless an allow-list is configured. `Content-Disposition` is
/// exposed so the browser UI can read the suggested filename.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.is_empty() {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("ignoring invalid origin in ALLOWED_ORIGINS: {origin:?}");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([header::CONTENT_DISPOSITION])
}

pub async fn search_videos(
    State(state): State<AppState>,
    Query(params): Query<QueryPairs>,
) -> ApiResult<Json<SearchResponse>> {
    let query = first_param(&params, "q")
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::bad_request(SEARCH_QUERY_REQUIRED))?;

    let videos = run_search(state.search.as_ref(), query)
        .await
        .map_err(|err| {
            error!(query, "search failed: {err:#}");
            ApiError::internal(SEARCH_FAILED)
        })?;

    Ok(Json(SearchResponse {
        success: true,
        videos,
    }))
}

pub async fn download_audio(
    State(state): State<AppState>,
    Query(params): Query<QueryPairs>,
) -> ApiResult<Response> {
    prepare_download(&state.resolver, first_param(&params, "url"), TrackType::Audio).await
}

pub async fn download_video(
    State(state): State<AppState>,
    Query(params): Query<QueryPairs>,
) -> ApiResult<Response> {
    prepare_download(&state.resolver, first_param(&params, "url"), TrackType::Video).await
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Everything outside the API: files from the web root, with `index.html`
/// standing in for the root and for extension-less client-side routes.
pub async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let mut headers = HeaderMap::new();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));

    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        search::SearchEntry,
        test_support::{CannedResolver, Ending, FixedSearch, entry},
    };
    use axum::body::to_bytes;
    use serde_json::Value;
    use tempfile::TempDir;

    struct TestContext {
        state: AppState,
        search: Arc<FixedSearch>,
        _www: TempDir,
    }

    impl TestContext {
        fn new(search: FixedSearch, resolver: CannedResolver) -> Self {
            let www = tempfile::tempdir().unwrap();
            std::fs::write(www.path().join("index.html"), "<h1>ytproxy</h1>").unwrap();
            std::fs::write(www.path().join("app.js"), "console.log(1)").unwrap();
            let search = Arc::new(search);
            let state = AppState {
                resolver: Arc::new(ResolverHandle::ready(Arc::new(resolver))),
                search: search.clone(),
                www_root: Arc::new(www.path().to_path_buf()),
            };
            Self {
                state,
                search,
                _www: www,
            }
        }

        fn simple() -> Self {
            Self::new(
                FixedSearch::new(vec![entry("dQw4w9WgXcQ")]),
                CannedResolver::new("Song", b"bytes", Ending::Clean),
            )
        }
    }

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn query(uri: &str) -> Query<QueryPairs> {
        Query::try_from_uri(&uri.parse().unwrap()).unwrap()
    }

    fn search_params(q: Option<&str>) -> Query<QueryPairs> {
        Query(q.map(|q| ("q".to_string(), q.to_string())).into_iter().collect())
    }

    fn download_params(url: Option<&str>) -> Query<QueryPairs> {
        Query(
            url.map(|url| ("url".to_string(), url.to_string()))
                .into_iter()
                .collect(),
        )
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(json_body(response).await["error"], "missing");
    }

    #[tokio::test]
    async fn search_requires_a_query() {
        let ctx = TestContext::simple();
        for q in [None, Some(""), Some("  ")] {
            let err = search_videos(State(ctx.state.clone()), search_params(q))
                .await
                .unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
            assert_eq!(err.message, SEARCH_QUERY_REQUIRED);
        }
        assert!(ctx.search.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_returns_success_envelope() {
        let ctx = TestContext::new(
            FixedSearch::new(vec![
                SearchEntry {
                    channel: Some("Rick Astley".into()),
                    duration: Some(212.0),
                    view_count: Some(1_500_000_000),
                    upload_date: Some("20091025".into()),
                    ..entry("dQw4w9WgXcQ")
                },
                entry("9bZkp7q19f0"),
            ]),
            CannedResolver::new("Song", b"bytes", Ending::Clean),
        );
        let Json(payload) = search_videos(State(ctx.state.clone()), search_params(Some(" rick ")))
            .await
            .unwrap();
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["success"], true);
        let videos = value["videos"].as_array().unwrap();
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0]["id"], "dQw4w9WgXcQ");
        assert_eq!(videos[0]["channel"], "Rick Astley");
        assert_eq!(videos[0]["duration"], "3:32");
        assert_eq!(videos[0]["views"], "1,500,000,000 views");
        assert_eq!(videos[0]["uploadDate"], "2009-10-25");
        assert_eq!(videos[1]["views"], "N/A");
        assert_eq!(
            ctx.search.calls.lock().unwrap()[0],
            ("rick".to_string(), 10)
        );
    }

    #[tokio::test]
    async fn search_failure_is_generic_500() {
        let ctx = TestContext::new(
            FixedSearch::failing(),
            CannedResolver::new("Song", b"bytes", Ending::Clean),
        );
        let err = search_videos(State(ctx.state.clone()), search_params(Some("rick")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, SEARCH_FAILED);
        assert!(!err.message.contains("429"));
    }

    #[tokio::test]
    async fn download_handlers_pick_the_track() {
        let ctx = TestContext::simple();
        let url = Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ");

        let audio = download_audio(State(ctx.state.clone()), download_params(url))
            .await
            .unwrap();
        assert_eq!(audio.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(
            audio.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Song.mp3\""
        );

        let video = download_video(State(ctx.state.clone()), download_params(url))
            .await
            .unwrap();
        assert_eq!(video.headers()[header::CONTENT_TYPE], "video/mp4");
        let body = to_bytes(video.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"bytes");
    }

    #[tokio::test]
    async fn download_handlers_report_bad_input_as_json() {
        let ctx = TestContext::simple();
        let response = download_video(State(ctx.state.clone()), download_params(None))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Video URL is required");

        let response = download_audio(
            State(ctx.state.clone()),
            download_params(Some("https://vimeo.com/12345")),
        )
        .await
        .unwrap_err()
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Invalid YouTube URL");
    }

    #[tokio::test]
    async fn repeated_parameters_use_the_first_value() {
        let ctx = TestContext::simple();
        let response = download_audio(
            State(ctx.state.clone()),
            query("/api/download/audio?url=https%3A%2F%2Fyoutu.be%2FdQw4w9WgXcQ&url=junk"),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let err = download_video(
            State(ctx.state.clone()),
            query("/api/download/video?url=junk&url=https%3A%2F%2Fyoutu.be%2FdQw4w9WgXcQ"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Invalid YouTube URL");

        search_videos(State(ctx.state.clone()), query("/api/search?q=rick&q=astley"))
            .await
            .unwrap();
        assert_eq!(
            ctx.search.calls.lock().unwrap()[0],
            ("rick".to_string(), 10)
        );
    }

    #[tokio::test]
    async fn unrelated_or_empty_query_strings_are_json_400s() {
        let ctx = TestContext::simple();
        for uri in ["/api/search", "/api/search?q=", "/api/search?query=rick&q"] {
            let err = search_videos(State(ctx.state.clone()), query(uri))
                .await
                .unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(err.message, SEARCH_QUERY_REQUIRED, "{uri}");
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(value) = health().await;
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_api_paths_are_json_404() {
        let ctx = TestContext::simple();
        for path in ["/api", "/api/nope", "/api/download/flac"] {
            let response = static_fallback(State(ctx.state.clone()), request(path)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
            assert_eq!(json_body(response).await["error"], "endpoint not found");
        }
    }

    #[tokio::test]
    async fn static_fallback_serves_files_and_index() {
        let ctx = TestContext::simple();

        let response = static_fallback(State(ctx.state.clone()), request("/app.js")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .contains("javascript")
        );

        for path in ["/", "/player/settings"] {
            let response = static_fallback(State(ctx.state.clone()), request(path)).await;
            assert_eq!(response.status(), StatusCode::OK, "{path}");
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&body[..], b"<h1>ytproxy</h1>");
        }

        let response = static_fallback(State(ctx.state.clone()), request("/missing.css")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn resolve_www_path_rejects_traversal() {
        let root = Path::new("/srv/www");
        assert!(resolve_www_path(root, "/../etc/passwd").is_err());
        assert!(resolve_www_path(root, "/assets/../../secret").is_err());
        assert_eq!(
            resolve_www_path(root, "/").unwrap(),
            root.join("index.html")
        );
        assert_eq!(
            resolve_www_path(root, "/assets/app.css").unwrap(),
            root.join("assets/app.css")
        );
    }

    #[test]
    fn should_fallback_to_index_only_for_routes() {
        assert!(should_fallback_to_index("/"));
        assert!(should_fallback_to_index("/watch"));
        assert!(!should_fallback_to_index("/favicon.ico"));
    }

    #[test]
    fn build_router_accepts_origin_lists() {
        let ctx = TestContext::simple();
        let _ = build_router(ctx.state.clone(), &[]);
        let _ = build_router(
            ctx.state,
            &["https://app.example".to_string(), "bad\norigin".to_string()],
        );
    }
}
