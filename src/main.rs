use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::SystemTime,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as RoutePath, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    process::Command,
    time::{Duration, timeout},
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

const DOWNLOADS_DIR: &str = "downloads";
const MAX_FILE_AGE: Duration = Duration::from_secs(3600);
const RECENT_FILE_WINDOW: Duration = Duration::from_secs(5 * 60);
const MAX_FILENAME_CHARS: usize = 150;
const MAX_VIDEO_FORMATS: usize = 15;
const MAX_AUDIO_FORMATS: usize = 10;
const ENGINE_BINARY: &str = "yt-dlp";
const ENGINE_TIMEOUT_SECONDS: u64 = 180;
const ENGINE_SOCKET_TIMEOUT_SECONDS: u64 = 30;
const ENGINE_RETRIES: u32 = 3;

// Ordered: first host match wins.
const PLATFORM_TABLE: &[(&str, &[&str])] = &[
    ("youtube", &["youtube.com", "youtu.be"]),
    ("instagram", &["instagram.com"]),
    ("tiktok", &["tiktok.com"]),
    ("facebook", &["facebook.com", "fb.watch"]),
    ("twitter", &["twitter.com", "x.com"]),
];

#[derive(Clone)]
struct AppState {
    engine: Engine,
    store: ArtifactStore,
}

#[derive(Debug, Deserialize)]
struct MediaUrlRequest {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    format_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    ffmpeg_available: bool,
    supported_platforms: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct PlatformsResponse {
    platforms: Vec<&'static str>,
    count: usize,
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    success: bool,
    video_info: VideoInfo,
}

#[derive(Debug, Serialize)]
struct VideoInfo {
    title: String,
    duration: String,
    thumbnail: String,
    formats: Vec<FormatDescriptor>,
}

#[derive(Debug, Serialize)]
struct FormatsResponse {
    success: bool,
    video_formats: Vec<FormatDescriptor>,
    audio_formats: Vec<FormatDescriptor>,
    video_info: FormatsVideoInfo,
}

#[derive(Debug, Serialize)]
struct FormatsVideoInfo {
    title: String,
    thumbnail: String,
    duration: String,
}

#[derive(Debug, Clone, Serialize)]
struct FormatDescriptor {
    format_id: String,
    ext: String,
    resolution: String,
    filesize: u64,
    filesize_readable: String,
    vcodec: String,
    acodec: String,
    format_note: String,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    filename: String,
    download_url: String,
    size: String,
    size_bytes: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unsupported_platform(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn extraction(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn artifact_missing() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Downloaded file could not be located".to_string(),
        }
    }

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

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug)]
enum EngineError {
    Network(String),
    Extraction(String),
    UnsupportedFormat(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(message)
            | Self::Extraction(message)
            | Self::UnsupportedFormat(message) => f.write_str(message),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Network(message) | EngineError::Extraction(message) => {
                ApiError::extraction(message)
            }
            EngineError::UnsupportedFormat(message) => ApiError::invalid_input(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PlatformClassification {
    label: String,
    matched: bool,
}

#[derive(Debug, Default, Deserialize)]
struct EngineMetadata {
    title: Option<String>,
    duration: Option<f64>,
    duration_string: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<EngineFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct EngineFormat {
    format_id: Option<String>,
    ext: Option<String>,
    resolution: Option<String>,
    height: Option<u32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    format_note: Option<String>,
}

#[derive(Debug, Clone)]
struct EngineOptions {
    socket_timeout: Duration,
    overall_timeout: Duration,
    retries: u32,
    no_playlist: bool,
    user_agent: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(ENGINE_SOCKET_TIMEOUT_SECONDS),
            overall_timeout: Duration::from_secs(ENGINE_TIMEOUT_SECONDS),
            retries: ENGINE_RETRIES,
            no_playlist: true,
            user_agent: None,
        }
    }
}

impl EngineOptions {
    fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--no-warnings".to_string()];
        if self.no_playlist {
            args.push("--no-playlist".to_string());
        }
        args.push("--socket-timeout".to_string());
        args.push(self.socket_timeout.as_secs().to_string());
        args.push("--retries".to_string());
        args.push(self.retries.to_string());
        if let Some(user_agent) = &self.user_agent {
            args.push("--user-agent".to_string());
            args.push(user_agent.clone());
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FetchPlan {
    selector: String,
    extract_audio: Option<&'static str>,
}

#[derive(Clone)]
struct Engine {
    options: EngineOptions,
    // Probed once at startup; stale if ffmpeg is (un)installed afterwards.
    ffmpeg_available: bool,
}

impl Engine {
    fn new(options: EngineOptions, ffmpeg_available: bool) -> Self {
        Self {
            options,
            ffmpeg_available,
        }
    }

    async fn detect() -> Self {
        let ffmpeg_available = Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);
        Self::new(EngineOptions::default(), ffmpeg_available)
    }

    async fn probe(&self, url: &str) -> Result<EngineMetadata, EngineError> {
        let mut args = self.options.to_args();
        args.push("-J".to_string());
        args.push(url.to_string());

        let output = self.run(args).await?;
        serde_json::from_slice(&output.stdout).map_err(|error| {
            EngineError::Extraction(format!("Engine returned unreadable metadata: {error}"))
        })
    }

    async fn fetch(
        &self,
        url: &str,
        plan: &FetchPlan,
        output_template: &str,
    ) -> Result<(), EngineError> {
        let mut args = self.options.to_args();
        args.push("-o".to_string());
        args.push(output_template.to_string());
        args.push("-f".to_string());
        args.push(plan.selector.clone());
        if let Some(codec) = plan.extract_audio {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(codec.to_string());
            args.push("--audio-quality".to_string());
            args.push("0".to_string());
        }
        args.push(url.to_string());

        self.run(args).await.map(|_| ())
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, EngineError> {
        let command_future = Command::new(ENGINE_BINARY).args(&args).output();
        let output = timeout(self.options.overall_timeout, command_future)
            .await
            .map_err(|_| {
                EngineError::Network(format!(
                    "{ENGINE_BINARY} timed out after {} seconds",
                    self.options.overall_timeout.as_secs()
                ))
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    EngineError::Extraction(format!(
                        "{ENGINE_BINARY} is not installed on this system"
                    ))
                } else {
                    EngineError::Extraction(format!("Failed to run {ENGINE_BINARY}: {error}"))
                }
            })?;

        if !output.status.success() {
            return Err(classify_engine_failure(&output.stderr));
        }

        Ok(output)
    }
}

#[derive(Debug, Clone)]
struct Artifact {
    unique_id: String,
    stored_path: PathBuf,
    display_filename: String,
    size_bytes: u64,
    created_at: DateTime<Utc>,
}

#[derive(Clone)]
struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn put(
        &self,
        unique_id: &str,
        source: &Path,
        desired_name: &str,
    ) -> Result<Artifact, ApiError> {
        let display_filename = sanitize_filename(desired_name);
        let final_path = self.root.join(&display_filename);

        // The provisional name can already equal the final one; deleting
        // first would then destroy the source.
        if final_path != source {
            // Last writer wins on a name collision.
            if let Err(error) = tokio::fs::remove_file(&final_path).await
                && error.kind() != ErrorKind::NotFound
            {
                return Err(ApiError::internal(format!(
                    "Could not replace existing file: {error}"
                )));
            }

            tokio::fs::rename(source, &final_path)
                .await
                .map_err(|error| ApiError::internal(format!("Could not store file: {error}")))?;
        }

        let metadata = tokio::fs::metadata(&final_path)
            .await
            .map_err(|error| ApiError::internal(format!("Could not read stored file: {error}")))?;

        Ok(Artifact {
            unique_id: unique_id.to_string(),
            stored_path: final_path,
            display_filename,
            size_bytes: metadata.len(),
            created_at: Utc::now(),
        })
    }

    async fn get(&self, name: &str) -> Result<PathBuf, ApiError> {
        let safe_name = sanitize_filename(name);
        let path = self.root.join(&safe_name);

        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            Ok(_) => Err(ApiError::not_found("File not found")),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(ApiError::not_found("File not found"))
            }
            Err(error) => Err(ApiError::internal(format!(
                "Could not read stored file: {error}"
            ))),
        }
    }

    async fn evict(&self, max_age: Duration) {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not open downloads directory for cleanup: {error}");
                }
                return;
            }
        };

        let now = SystemTime::now();

        loop {
            let maybe_entry = match entries.next_entry().await {
                Ok(value) => value,
                Err(error) => {
                    warn!("Could not iterate downloads directory for cleanup: {error}");
                    break;
                }
            };

            let Some(entry) = maybe_entry else {
                break;
            };

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!("Could not read metadata of {:?}: {error}", path);
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            let modified_at = match metadata.modified() {
                Ok(value) => value,
                Err(error) => {
                    warn!("Could not read modification time of {:?}: {error}", path);
                    continue;
                }
            };

            let age = now
                .duration_since(modified_at)
                .unwrap_or(Duration::from_secs(0));
            if age < max_age {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("Deleted old file: {:?}", path),
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("Could not delete old file {:?}: {error}", path),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mediagrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let store = ArtifactStore::new(DOWNLOADS_DIR);
    tokio::fs::create_dir_all(store.root())
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create downloads directory: {error}"))
        })?;

    let engine = Engine::detect().await;
    if engine.ffmpeg_available {
        info!("ffmpeg detected; audio extraction and stream merging enabled");
    } else {
        warn!("ffmpeg not found; mp3 conversion and merged formats are unavailable");
    }

    store.evict(MAX_FILE_AGE).await;

    let state = AppState { engine, store };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/platforms", get(list_platforms))
        .route("/api/analyze", post(analyze))
        .route("/api/formats", post(fetch_formats))
        .route("/api/download", post(start_download))
        .route("/api/download-file/{filename}", get(serve_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        ffmpeg_available: state.engine.ffmpeg_available,
        supported_platforms: platform_labels(),
    })
}

async fn list_platforms() -> Json<PlatformsResponse> {
    let platforms = platform_labels();
    let count = platforms.len();
    Json(PlatformsResponse { platforms, count })
}

async fn analyze(
    State(state): State<AppState>,
    Json(payload): Json<MediaUrlRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let url = payload
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::invalid_input("URL required"))?;

    let (normalized, classification) = classify_url(url)?;
    if !classification.matched {
        return Err(ApiError::unsupported_platform("Unsupported platform"));
    }

    let metadata = state.engine.probe(&normalized).await?;
    let formats = metadata.formats.iter().map(describe_format).collect();

    Ok(Json(AnalyzeResponse {
        success: true,
        video_info: VideoInfo {
            title: title_label(&metadata),
            duration: duration_label(&metadata),
            thumbnail: metadata.thumbnail.unwrap_or_default(),
            formats,
        },
    }))
}

async fn fetch_formats(
    State(state): State<AppState>,
    Json(payload): Json<MediaUrlRequest>,
) -> Result<Json<FormatsResponse>, ApiError> {
    let url = payload
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::invalid_input("URL required"))?;

    let (normalized, _classification) = classify_url(url)?;
    let metadata = state.engine.probe(&normalized).await?;
    let (video_formats, audio_formats) = partition_formats(&metadata.formats);

    Ok(Json(FormatsResponse {
        success: true,
        video_formats,
        audio_formats,
        video_info: FormatsVideoInfo {
            title: title_label(&metadata),
            thumbnail: metadata.thumbnail.clone().unwrap_or_default(),
            duration: duration_label(&metadata),
        },
    }))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    state.store.evict(MAX_FILE_AGE).await;

    let url = payload
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::invalid_input("url and format_id required"))?;
    let format_id = payload
        .format_id
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::invalid_input("url and format_id required"))?;

    let (normalized, classification) = classify_url(url)?;

    let plan = resolve_format_selector(format_id, state.engine.ffmpeg_available)
        .map_err(ApiError::from)?;
    let unique_id = mint_job_id();
    info!(
        "Starting download job {unique_id} for {normalized} ({})",
        classification.label
    );

    let metadata = match state.engine.probe(&normalized).await {
        Ok(metadata) => Some(metadata),
        Err(error) => {
            warn!("Metadata probe failed for job {unique_id}, continuing without it: {error}");
            None
        }
    };

    let output_template = format!(
        "{}/{unique_id}_%(title)s.%(ext)s",
        state.store.root().to_string_lossy()
    );
    state
        .engine
        .fetch(&normalized, &plan, &output_template)
        .await?;

    let produced = locate_fetched_file(state.store.root(), &unique_id).await?;
    let display_name =
        build_display_filename(&produced, &unique_id, metadata.as_ref(), format_id);
    let artifact = state.store.put(&unique_id, &produced, &display_name).await?;

    info!(
        "Job {} stored {:?} ({}) at {}",
        artifact.unique_id,
        artifact.stored_path,
        format_file_size(artifact.size_bytes),
        artifact.created_at
    );

    Ok(Json(DownloadResponse {
        success: true,
        download_url: format!(
            "/api/download-file/{}",
            urlencoding::encode(&artifact.display_filename)
        ),
        size: format_file_size(artifact.size_bytes),
        size_bytes: artifact.size_bytes,
        filename: artifact.display_filename,
    }))
}

async fn serve_file(
    State(state): State<AppState>,
    RoutePath(filename): RoutePath<String>,
) -> Result<Response, ApiError> {
    let path = state.store.get(&filename).await?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => {
            return Err(ApiError::internal(format!("Could not open file: {error}")));
        }
    };

    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?;

    let display_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&display_name)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build response length header"))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&display_name))
            .map_err(|_| ApiError::internal("Could not build download header"))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn platform_labels() -> Vec<&'static str> {
    PLATFORM_TABLE.iter().map(|(label, _)| *label).collect()
}

fn classify_url(input: &str) -> Result<(String, PlatformClassification), ApiError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ApiError::invalid_input("URL required"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = Url::parse(&candidate).map_err(|_| ApiError::invalid_input("Invalid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::invalid_input("Invalid URL"));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| ApiError::invalid_input("Invalid URL"))?
        .to_ascii_lowercase();

    for (label, domains) in PLATFORM_TABLE {
        let matched = domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")));
        if matched {
            return Ok((
                parsed.to_string(),
                PlatformClassification {
                    label: (*label).to_string(),
                    matched: true,
                },
            ));
        }
    }

    Ok((
        parsed.to_string(),
        PlatformClassification {
            label: "Other".to_string(),
            matched: false,
        },
    ))
}

// Reserved aliases; real engine format ids are numeric or codec-qualified and
// never collide with these.
fn resolve_format_selector(
    format_id: &str,
    ffmpeg_available: bool,
) -> Result<FetchPlan, EngineError> {
    match format_id {
        "mp3" => {
            if !ffmpeg_available {
                return Err(EngineError::UnsupportedFormat(
                    "Converting to mp3 requires ffmpeg, which is not installed".to_string(),
                ));
            }
            Ok(FetchPlan {
                selector: "bestaudio/best".to_string(),
                extract_audio: Some("mp3"),
            })
        }
        "m4a" => Ok(FetchPlan {
            selector: "bestaudio[ext=m4a]/bestaudio[ext=mp4]/bestaudio".to_string(),
            extract_audio: None,
        }),
        "best" => Ok(FetchPlan {
            selector: if ffmpeg_available {
                "bestvideo+bestaudio/best".to_string()
            } else {
                "best".to_string()
            },
            extract_audio: None,
        }),
        "worst" => Ok(FetchPlan {
            selector: "worst".to_string(),
            extract_audio: None,
        }),
        other => Ok(FetchPlan {
            selector: other.to_string(),
            extract_audio: None,
        }),
    }
}

fn mint_job_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

async fn locate_fetched_file(root: &Path, unique_id: &str) -> Result<PathBuf, ApiError> {
    let mut entries = tokio::fs::read_dir(root).await.map_err(|error| {
        ApiError::internal(format!("Could not open downloads directory: {error}"))
    })?;

    let prefix = format!("{unique_id}_");
    let now = SystemTime::now();
    let mut newest_recent: Option<(SystemTime, PathBuf)> = None;

    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        ApiError::internal(format!("Could not scan downloads directory: {error}"))
    })? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", entry.path());
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&prefix) {
            return Ok(entry.path());
        }

        // Best-effort fallback: the engine's output path is not guaranteed to
        // carry the template prefix for every post-processing combination.
        let Ok(modified_at) = metadata.modified() else {
            continue;
        };
        let age = now
            .duration_since(modified_at)
            .unwrap_or(Duration::from_secs(0));
        if age <= RECENT_FILE_WINDOW
            && newest_recent
                .as_ref()
                .is_none_or(|(best, _)| modified_at > *best)
        {
            newest_recent = Some((modified_at, entry.path()));
        }
    }

    if let Some((_, path)) = newest_recent {
        warn!(
            "Job {unique_id} produced no prefixed file; falling back to most recent {:?}",
            path
        );
        return Ok(path);
    }

    Err(ApiError::artifact_missing())
}

fn build_display_filename(
    produced: &Path,
    unique_id: &str,
    metadata: Option<&EngineMetadata>,
    format_id: &str,
) -> String {
    let ext = produced
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("bin");

    let prefix = format!("{unique_id}_");
    let title = metadata
        .and_then(|info| info.title.as_deref())
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| {
            produced
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(|stem| stem.strip_prefix(prefix.as_str()).unwrap_or(stem).to_string())
                .filter(|stem| !stem.is_empty())
                .unwrap_or_else(|| unique_id.to_string())
        });

    let resolution_suffix = metadata
        .and_then(|info| {
            info.formats
                .iter()
                .find(|format| format.format_id.as_deref() == Some(format_id))
        })
        .filter(|format| format_has_video(format))
        .and_then(|format| format.height)
        .map(|height| format!(" [{height}p]"))
        .unwrap_or_default();

    // The job id stays in the final name so identical titles from separate
    // jobs never collide in the store.
    format!("{unique_id}_{title}{resolution_suffix}.{ext}")
}

fn sanitize_filename(name: &str) -> String {
    const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

    // Whitespace-class control characters survive this pass so the collapse
    // below can turn them into single spaces.
    let cleaned: String = name
        .chars()
        .filter(|ch| !FORBIDDEN.contains(ch) && (!ch.is_control() || ch.is_whitespace()))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let truncated: String = collapsed.chars().take(MAX_FILENAME_CHARS).collect();
    let trimmed = truncated.trim_end();

    if trimmed.is_empty() {
        fallback_filename()
    } else {
        trimmed.to_string()
    }
}

fn fallback_filename() -> String {
    format!("download_{}", mint_job_id())
}

fn describe_format(format: &EngineFormat) -> FormatDescriptor {
    let filesize = format
        .filesize
        .or(format.filesize_approx)
        .unwrap_or(0.0)
        .max(0.0) as u64;

    FormatDescriptor {
        format_id: format.format_id.clone().unwrap_or_default(),
        ext: format.ext.clone().unwrap_or_default(),
        resolution: format
            .resolution
            .clone()
            .or_else(|| format.height.map(|height| format!("{height}p")))
            .unwrap_or_else(|| "unknown".to_string()),
        filesize,
        filesize_readable: format_file_size(filesize),
        vcodec: format.vcodec.clone().unwrap_or_else(|| "none".to_string()),
        acodec: format.acodec.clone().unwrap_or_else(|| "none".to_string()),
        format_note: format.format_note.clone().unwrap_or_default(),
    }
}

fn partition_formats(
    formats: &[EngineFormat],
) -> (Vec<FormatDescriptor>, Vec<FormatDescriptor>) {
    let mut video = Vec::new();
    let mut audio = Vec::new();

    for format in formats {
        if format_has_video(format) {
            video.push(describe_format(format));
        } else if format_has_audio(format) {
            audio.push(describe_format(format));
        }
    }

    video.truncate(MAX_VIDEO_FORMATS);
    audio.truncate(MAX_AUDIO_FORMATS);
    (video, audio)
}

fn format_has_video(format: &EngineFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn format_has_audio(format: &EngineFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

fn title_label(metadata: &EngineMetadata) -> String {
    metadata
        .title
        .clone()
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn duration_label(metadata: &EngineMetadata) -> String {
    if let Some(value) = metadata
        .duration_string
        .clone()
        .filter(|value| !value.is_empty())
    {
        return value;
    }
    metadata
        .duration
        .map(|seconds| (seconds.round() as u64).to_string())
        .unwrap_or_default()
}

fn classify_engine_failure(stderr: &[u8]) -> EngineError {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("Engine could not complete the operation")
        .to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("requested format is not available")
        || lower.contains("format is not available")
    {
        EngineError::UnsupportedFormat(message)
    } else if lower.contains("unable to download")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("network")
    {
        EngineError::Network(message)
    } else {
        EngineError::Extraction(message)
    }
}

fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} TB")
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')' | '[' | ']')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn resolve_bind_addr() -> String {
    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:5000".to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
