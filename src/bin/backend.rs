#![forbid(unsafe_code)]

//! Axum backend for the Tubely upload pipeline.
//!
//! Handlers stay thin: they pull the video id, the bearer token and the one
//! multipart field they care about out of the request and hand everything to
//! `Ingestor`. Locally stored thumbnails are served back from `/assets/`.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path as AxumPath, State,
        multipart::{Field, MultipartError},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::TryStreamExt;
use mime_guess::MimeGuess;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tubely::auth::{JwtAuthenticator, bearer_token};
use tubely::config::{RuntimeOverrides, resolve_runtime_config};
use tubely::error::IngestError;
use tubely::ingest::{
    ASSETS_ROUTE, IngestSettings, Ingestor, MAX_THUMBNAIL_BYTES, MAX_VIDEO_BYTES, UploadGrant,
    parse_video_id,
};
use tubely::media::FfmpegTools;
use tubely::metadata::{MetadataStore, VideoRecord};
use tubely::storage::ObjectStorage;

const VIDEO_FIELD: &str = "video";
const THUMBNAIL_FIELD: &str = "thumbnail";

// Headroom for multipart boundaries and part headers on top of the file limit.
const MULTIPART_OVERHEAD: usize = 1 << 20;

const DEFAULT_LOG_FILTER: &str = "tubely=info,tower_http=info";

#[derive(Debug, Default)]
struct BackendArgs {
    overrides: RuntimeOverrides,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, mut inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
                None => (arg.clone(), None),
            };
            let mut value_for = |flag: &str| -> Result<String> {
                match inline.take() {
                    Some(value) => Ok(value),
                    None => args.next().ok_or_else(|| anyhow!("{flag} requires a value")),
                }
            };

            match flag.as_str() {
                "--port" => overrides.port = Some(parse_port_arg(&value_for(&flag)?)?),
                "--host" => {
                    let value = value_for(&flag)?;
                    parse_host_arg(&value)?;
                    overrides.host = Some(value);
                }
                "--assets-root" => {
                    overrides.assets_root = Some(PathBuf::from(value_for(&flag)?));
                }
                "--db" => overrides.db_path = Some(PathBuf::from(value_for(&flag)?)),
                "--env-file" => overrides.env_path = Some(PathBuf::from(value_for(&flag)?)),
                _ => bail!("unknown argument: {arg}"),
            }
        }

        Ok(Self { overrides })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/HOST")
}

#[derive(Clone)]
struct AppState {
    ingestor: Ingestor,
    assets_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        let status = err.status();
        if status.is_server_error() {
            tracing::error!(error = %err, status = status.as_u16(), "request failed");
        } else {
            tracing::warn!(error = %err, status = status.as_u16(), "request rejected");
        }
        Self {
            status,
            message: err.public_message().to_string(),
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

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let BackendArgs { overrides } = BackendArgs::parse()?;
    let config = resolve_runtime_config(overrides).context("resolving configuration")?;
    let host = parse_host_arg(&config.host)?;

    for dir in [&config.assets_root, &config.staging_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let records = MetadataStore::open(&config.db_path)
        .await
        .context("initializing record store")?;
    let assets = ObjectStorage::s3(
        &config.s3_bucket,
        &config.s3_region,
        config.s3_endpoint.as_deref(),
    )
    .context("configuring object storage")?;
    let tools = FfmpegTools::new(
        config.ffprobe_bin.clone(),
        config.ffmpeg_bin.clone(),
        config.tool_timeout,
    );

    let ingestor = Ingestor::new(
        Arc::new(JwtAuthenticator::new(&config.jwt_secret)),
        Arc::new(records),
        Arc::new(assets),
        Arc::new(tools),
        IngestSettings::from_config(&config),
    );
    let state = AppState {
        ingestor,
        assets_root: Arc::new(config.assets_root.clone()),
    };

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(
        %addr,
        bucket = %config.s3_bucket,
        assets_root = %config.assets_root.display(),
        "API server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let video_limit = usize::try_from(MAX_VIDEO_BYTES).unwrap_or(usize::MAX);
    let thumbnail_limit = usize::try_from(MAX_THUMBNAIL_BYTES).unwrap_or(usize::MAX);

    Router::new()
        .route("/videos/{video_id}", get(get_video))
        .route(
            "/videos/{video_id}/video",
            post(upload_video)
                .layer(DefaultBodyLimit::max(video_limit.saturating_add(MULTIPART_OVERHEAD))),
        )
        .route(
            "/videos/{video_id}/thumbnail",
            post(upload_thumbnail).layer(DefaultBodyLimit::max(
                thumbnail_limit.saturating_add(MULTIPART_OVERHEAD),
            )),
        )
        .route(&format!("/{ASSETS_ROUTE}/{{file}}"), get(serve_asset))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install Ctrl+C handler");
    }
    tracing::info!("shutdown requested");
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<VideoRecord>> {
    let video_id = parse_video_id(&video_id)?;
    Ok(Json(state.ingestor.records().get(video_id).await?))
}

async fn upload_video(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<VideoRecord>)> {
    let video_id = parse_video_id(&video_id)?;
    let token = bearer_token(&headers)?;
    let grant = state.ingestor.authorize(video_id, token).await?;
    let record = ingest_form_field(&state.ingestor, UploadKind::Video, grant, multipart).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn upload_thumbnail(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<Json<VideoRecord>> {
    let video_id = parse_video_id(&video_id)?;
    let token = bearer_token(&headers)?;
    let grant = state.ingestor.authorize(video_id, token).await?;
    let record =
        ingest_form_field(&state.ingestor, UploadKind::Thumbnail, grant, multipart).await?;
    Ok(Json(record))
}

#[derive(Clone, Copy, Debug)]
enum UploadKind {
    Video,
    Thumbnail,
}

impl UploadKind {
    fn field_name(self) -> &'static str {
        match self {
            Self::Video => VIDEO_FIELD,
            Self::Thumbnail => THUMBNAIL_FIELD,
        }
    }
}

/// Finds the form field for `kind` and streams it straight into the pipeline
/// without buffering it in memory. Only called once `grant` exists, so no
/// part of the form is read for unauthorized callers.
async fn ingest_form_field(
    ingestor: &Ingestor,
    kind: UploadKind,
    grant: UploadGrant,
    mut multipart: Multipart,
) -> ApiResult<VideoRecord> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_rejection)? {
        if field.name() != Some(kind.field_name()) {
            continue;
        }
        let content_type = field.content_type().unwrap_or_default().to_string();
        let body = field_reader(field);
        let record = match kind {
            UploadKind::Video => ingestor.store_video(grant, body, &content_type).await?,
            UploadKind::Thumbnail => {
                ingestor
                    .store_thumbnail(grant, body, &content_type)
                    .await?
            }
        };
        return Ok(record);
    }

    Err(IngestError::BadRequest(format!(
        "multipart field {:?} is missing",
        kind.field_name()
    ))
    .into())
}

fn field_reader(field: Field<'_>) -> impl AsyncRead + Send + Unpin + '_ {
    StreamReader::new(Box::pin(field.map_err(multipart_io_error)))
}

fn multipart_rejection(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        IngestError::PayloadTooLarge(err.body_text()).into()
    } else {
        IngestError::BadRequest(err.body_text()).into()
    }
}

/// Keeps the body-limit / malformed-body distinction alive through the
/// `AsyncRead` adapter.
fn multipart_io_error(err: MultipartError) -> io::Error {
    let kind = if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        io::ErrorKind::FileTooLarge
    } else {
        io::ErrorKind::InvalidData
    };
    io::Error::new(kind, err.body_text())
}

async fn serve_asset(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&file)?;
    stream_file(state.assets_root.join(&file), &headers).await
}

/// Validates that a single dynamic path segment never escapes its base folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if value.is_empty()
        || Path::new(value)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }

    Ok(())
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| ApiError::internal(err.to_string()))
}

async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let guessed = MimeGuess::from_path(&path).first();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    } else {
        let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        response
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = guessed
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::to_bytes,
        extract::FromRequest,
        http::Request,
    };
    use object_store::{ObjectStoreExt, memory::InMemory, path::Path as ObjectPath};
    use serde_json::Value;
    use tempfile::TempDir;
    use tubely::auth::issue_access_token;
    use tubely::error::IngestResult;
    use tubely::media::{MediaTools, StreamGeometry};
    use uuid::Uuid;

    const SECRET: &str = "backend-test-secret";
    const CDN: &str = "https://d111111abcdef8.cloudfront.net";
    const BOUNDARY: &str = "tubely-test-boundary";

    /// Copies the input through and reports a 1080p landscape stream.
    struct PassthroughTools;

    #[async_trait]
    impl MediaTools for PassthroughTools {
        async fn probe(&self, _path: &std::path::Path) -> IngestResult<StreamGeometry> {
            Ok(StreamGeometry {
                width: 1920,
                height: 1080,
            })
        }

        async fn remux(&self, input: &std::path::Path, output: &std::path::Path) -> IngestResult<()> {
            std::fs::copy(input, output).unwrap();
            Ok(())
        }
    }

    struct BackendTestContext {
        _temp: TempDir,
        state: AppState,
        store: Arc<MetadataStore>,
        objects: Arc<InMemory>,
        record: VideoRecord,
        token: String,
    }

    impl BackendTestContext {
        async fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let assets_root = temp.path().join("assets");
            let staging_dir = temp.path().join("staging");
            std::fs::create_dir_all(&assets_root).unwrap();
            std::fs::create_dir_all(&staging_dir).unwrap();

            let store = Arc::new(MetadataStore::open(&temp.path().join("tubely.db")).await.unwrap());
            let record = VideoRecord::new(Uuid::new_v4(), "Boots the bear");
            store.insert_video(&record).await.unwrap();
            let token =
                issue_access_token(record.user_id, SECRET, chrono::Duration::hours(1)).unwrap();

            let objects = Arc::new(InMemory::new());
            let ingestor = Ingestor::new(
                Arc::new(JwtAuthenticator::new(SECRET)),
                store.clone(),
                Arc::new(ObjectStorage::new(objects.clone(), "tubely-test")),
                Arc::new(PassthroughTools),
                IngestSettings {
                    staging_dir,
                    assets_root: assets_root.clone(),
                    distribution_base: CDN.into(),
                    public_base_url: "http://localhost:8091".into(),
                    max_video_bytes: MAX_VIDEO_BYTES,
                    max_thumbnail_bytes: MAX_THUMBNAIL_BYTES,
                },
            );

            Self {
                _temp: temp,
                state: AppState {
                    ingestor,
                    assets_root: Arc::new(assets_root),
                },
                store,
                objects,
                record,
                token,
            }
        }

        fn auth_headers(&self) -> HeaderMap {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", self.token)).unwrap(),
            );
            headers
        }
    }

    async fn multipart_form(field: &str, content_type: &str, bytes: &[u8]) -> Multipart {
        multipart_part(field, Some(content_type), bytes).await
    }

    async fn multipart_part(field: &str, content_type: Option<&str>, bytes: &[u8]) -> Multipart {
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"upload.bin\"\r\n"
        );
        if let Some(content_type) = content_type {
            body.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        body.push_str("\r\n");
        let mut body = body.into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(request, &()).await.unwrap()
    }

    fn parse_backend_args(argv: &[&str]) -> Result<BackendArgs> {
        BackendArgs::from_iter(argv.iter().map(|value| value.to_string()))
    }

    #[test]
    fn backend_args_default_to_no_overrides() {
        let args = parse_backend_args(&[]).unwrap();
        assert!(args.overrides.port.is_none());
        assert!(args.overrides.host.is_none());
        assert!(args.overrides.assets_root.is_none());
        assert!(args.overrides.db_path.is_none());
    }

    #[test]
    fn backend_args_accept_both_flag_forms() {
        let args = parse_backend_args(&[
            "--port",
            "9000",
            "--host=0.0.0.0",
            "--assets-root",
            "/srv/assets",
            "--db=/srv/tubely.db",
            "--env-file",
            "/etc/tubely.env",
        ])
        .unwrap();
        assert_eq!(args.overrides.port, Some(9000));
        assert_eq!(args.overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(
            args.overrides.assets_root,
            Some(PathBuf::from("/srv/assets"))
        );
        assert_eq!(args.overrides.db_path, Some(PathBuf::from("/srv/tubely.db")));
        assert_eq!(
            args.overrides.env_path,
            Some(PathBuf::from("/etc/tubely.env"))
        );
    }

    #[test]
    fn backend_args_reject_bad_input() {
        assert!(parse_backend_args(&["--verbose"]).is_err());
        assert!(parse_backend_args(&["--port"]).is_err());
        assert!(parse_backend_args(&["--port=http"]).is_err());
        assert!(parse_backend_args(&["--host", "localhost:80"]).is_err());
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "missing");
    }

    #[tokio::test]
    async fn ingest_errors_hide_diagnostics() {
        let err = ApiError::from(IngestError::StorageError("s3 said 503".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("503"));

        let err = ApiError::from(IngestError::UnsupportedMediaType("image/gif".into()));
        assert_eq!(err.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn video_upload_returns_accepted_record() {
        let ctx = BackendTestContext::new().await;
        let form = multipart_form(VIDEO_FIELD, "video/mp4", b"ftypisom-moov-mdat").await;

        let (status, Json(record)) = upload_video(
            State(ctx.state.clone()),
            AxumPath(ctx.record.id.to_string()),
            ctx.auth_headers(),
            form,
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        let url = record.video_url.clone().unwrap();
        let key = url
            .strip_prefix(&format!("{CDN}/"))
            .expect("url under distribution base");
        assert!(key.starts_with("landscape/"), "{key}");
        let stored = ctx.objects.get(&ObjectPath::from(key)).await.unwrap();
        assert_eq!(
            stored.bytes().await.unwrap().as_ref(),
            b"ftypisom-moov-mdat"
        );

        let fetched = ctx.store.get_video(ctx.record.id).await.unwrap().unwrap();
        assert_eq!(fetched.video_url, record.video_url);
    }

    #[tokio::test]
    async fn video_upload_requires_bearer_token() {
        let ctx = BackendTestContext::new().await;
        let form = multipart_form(VIDEO_FIELD, "video/mp4", b"mp4").await;
        let err = upload_video(
            State(ctx.state.clone()),
            AxumPath(ctx.record.id.to_string()),
            HeaderMap::new(),
            form,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn video_upload_rejects_bad_id_and_missing_field() {
        let ctx = BackendTestContext::new().await;
        let form = multipart_form(VIDEO_FIELD, "video/mp4", b"mp4").await;
        let err = upload_video(
            State(ctx.state.clone()),
            AxumPath("not-a-uuid".into()),
            ctx.auth_headers(),
            form,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let form = multipart_form("file", "video/mp4", b"mp4").await;
        let err = upload_video(
            State(ctx.state.clone()),
            AxumPath(ctx.record.id.to_string()),
            ctx.auth_headers(),
            form,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn video_upload_rejects_other_media_types() {
        let ctx = BackendTestContext::new().await;
        let form = multipart_form(VIDEO_FIELD, "video/quicktime", b"mov").await;
        let err = upload_video(
            State(ctx.state.clone()),
            AxumPath(ctx.record.id.to_string()),
            ctx.auth_headers(),
            form,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(
            ctx.store
                .get_video(ctx.record.id)
                .await
                .unwrap()
                .unwrap()
                .video_url
                .is_none()
        );
    }

    #[tokio::test]
    async fn part_without_content_type_is_unsupported() {
        let ctx = BackendTestContext::new().await;
        let form = multipart_part(VIDEO_FIELD, None, b"mp4").await;
        let err = upload_video(
            State(ctx.state.clone()),
            AxumPath(ctx.record.id.to_string()),
            ctx.auth_headers(),
            form,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let form = multipart_part(THUMBNAIL_FIELD, None, b"png").await;
        let err = upload_thumbnail(
            State(ctx.state.clone()),
            AxumPath(ctx.record.id.to_string()),
            ctx.auth_headers(),
            form,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn ownership_is_checked_before_the_form_is_walked() {
        let ctx = BackendTestContext::new().await;
        let intruder =
            issue_access_token(Uuid::new_v4(), SECRET, chrono::Duration::hours(1)).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {intruder}")).unwrap(),
        );

        // The form has no `video` part at all; a caller who does not own the
        // video still learns nothing beyond 403.
        let form = multipart_form("notes", "text/plain", b"leading part").await;
        let err = upload_video(
            State(ctx.state.clone()),
            AxumPath(ctx.record.id.to_string()),
            headers,
            form,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn thumbnail_upload_is_served_from_assets() {
        let ctx = BackendTestContext::new().await;
        let form = multipart_form(THUMBNAIL_FIELD, "image/png", b"\x89PNG-thumb").await;

        let Json(record) = upload_thumbnail(
            State(ctx.state.clone()),
            AxumPath(ctx.record.id.to_string()),
            ctx.auth_headers(),
            form,
        )
        .await
        .unwrap();

        let url = record.thumbnail_url.unwrap();
        let file = url
            .strip_prefix("http://localhost:8091/assets/")
            .expect("served from assets route")
            .to_string();

        let response = serve_asset(State(ctx.state.clone()), AxumPath(file), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"\x89PNG-thumb");
    }

    #[tokio::test]
    async fn get_video_reports_lookup_failures() {
        let ctx = BackendTestContext::new().await;
        let Json(record) = get_video(State(ctx.state.clone()), AxumPath(ctx.record.id.to_string()))
            .await
            .unwrap();
        assert_eq!(record.id, ctx.record.id);

        let err = get_video(State(ctx.state.clone()), AxumPath(Uuid::new_v4().to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = get_video(State(ctx.state.clone()), AxumPath("42".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn serve_asset_rejects_path_traversal() {
        let ctx = BackendTestContext::new().await;
        let err = serve_asset(
            State(ctx.state.clone()),
            AxumPath("../tubely.db".into()),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_asset_honours_range_requests() {
        let ctx = BackendTestContext::new().await;
        std::fs::write(ctx.state.assets_root.join("poster.jpeg"), b"0123456789").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-5"));

        let response = serve_asset(
            State(ctx.state.clone()),
            AxumPath("poster.jpeg".into()),
            headers,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 2-5/10"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"2345");
    }

    #[test]
    fn range_header_parsing() {
        let parse = |raw: &'static str| parse_range_header(&HeaderValue::from_static(raw), 100);
        assert_eq!(parse("bytes=0-9"), Some((0, 9)));
        assert_eq!(parse("bytes=90-"), Some((90, 99)));
        assert_eq!(parse("bytes=-10"), Some((90, 99)));
        assert_eq!(parse("bytes=-500"), Some((0, 99)));
        assert_eq!(parse("bytes=9-0"), None);
        assert_eq!(parse("bytes=0-1,5-6"), None);
        assert_eq!(parse("items=0-9"), None);
    }
}
