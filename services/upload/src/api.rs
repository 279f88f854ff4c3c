use crate::config::{ApiConfig, Config};
use crate::coordinator::UploadCoordinator;
use crate::error::UploadError;
use crate::metadata_store::MetadataStore;
use crate::record::{is_fingerprint, UploadRecord};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Room for multipart boundaries and part headers on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: UploadCoordinator,
    pub metadata_store: Arc<dyn MetadataStore>,
    /// Multipart field carrying the file
    pub form_field: Arc<str>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        coordinator: UploadCoordinator,
        metadata_store: Arc<dyn MetadataStore>,
        config: &Config,
    ) -> Self {
        Self {
            coordinator,
            metadata_store,
            form_field: Arc::from(config.upload.form_field.as_str()),
            max_upload_bytes: config.upload.max_upload_bytes,
        }
    }
}

/// Body of every `/upload` response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UploadResponse {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            url: None,
            deduped: None,
            message: Some(message.into()),
        }
    }
}

/// Upload record in API responses
#[derive(Debug, Serialize)]
pub struct UploadStatusResponse {
    pub id: Uuid,
    pub fingerprint: String,
    pub original_name: String,
    pub status: String,
    pub url: Option<String>,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UploadRecord> for UploadStatusResponse {
    fn from(r: UploadRecord) -> Self {
        Self {
            id: r.id,
            fingerprint: r.fingerprint,
            original_name: r.original_name,
            status: r.status.to_string(),
            url: r.url,
            size_bytes: r.size_bytes,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, error: &str, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/upload",
            post(upload_file)
                .layer(DefaultBodyLimit::max(body_limit))
                .fallback(invalid_method),
        )
        .route("/api/v1/uploads/:fingerprint", get(get_upload))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "upload-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check database connectivity
    match state.metadata_store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected"
                })),
            )
        }
    }
}

/// Any method other than POST on `/upload`
async fn invalid_method() -> (StatusCode, Json<UploadResponse>) {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(UploadResponse::failure("Invalid request method")),
    )
}

/// Accept one file and run it through the upload pipeline
#[instrument(skip(state, multipart))]
async fn upload_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> (StatusCode, Json<UploadResponse>) {
    let no_file = || {
        (
            StatusCode::BAD_REQUEST,
            Json(UploadResponse::failure("No file received")),
        )
    };

    let Ok(multipart) = multipart else {
        return no_file();
    };

    let (file_name, bytes) = match read_file_field(multipart, &state.form_field).await {
        Ok(Some(file)) => file,
        Ok(None) => return no_file(),
        Err(e) => return (StatusCode::OK, Json(render_error(&e))),
    };

    let result = state.coordinator.submit(bytes, &file_name).await;
    (StatusCode::OK, Json(render_result(result)))
}

/// Pull the named file field out of a multipart body
///
/// Other fields are skipped. A body that cannot be read (for example one
/// over the size limit) is reported as invalid input.
async fn read_file_field(
    mut multipart: Multipart,
    form_field: &str,
) -> Result<Option<(String, Bytes)>, UploadError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(None),
            Err(e) => return Err(unreadable_body(e.status())),
        };

        if field.name() != Some(form_field) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|e| unreadable_body(e.status()))?;

        return Ok(Some((file_name, bytes)));
    }
}

fn unreadable_body(status: StatusCode) -> UploadError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::InvalidInput("File exceeds the maximum upload size".to_string())
    } else {
        UploadError::InvalidInput("The uploaded file could not be read".to_string())
    }
}

fn render_result(result: Result<crate::coordinator::UploadOutcome, UploadError>) -> UploadResponse {
    match result {
        Ok(outcome) => UploadResponse {
            success: true,
            url: Some(outcome.url),
            deduped: Some(outcome.deduped),
            message: None,
        },
        Err(e) => render_error(&e),
    }
}

fn render_error(e: &UploadError) -> UploadResponse {
    match e {
        UploadError::InvalidInput(_) | UploadError::Conflict => {
            info!(kind = e.kind(), message = %e, "Upload rejected")
        }
        _ => error!(kind = e.kind(), error = ?e, "Upload failed"),
    }

    UploadResponse {
        success: false,
        url: e.url().map(String::from),
        deduped: None,
        message: Some(e.to_string()),
    }
}

/// Get the current record for a fingerprint
#[instrument(skip(state))]
async fn get_upload(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> Result<Json<UploadStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    if !is_fingerprint(&fingerprint) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Fingerprint must be 64 lowercase hex characters",
            "INVALID_FINGERPRINT",
        ));
    }

    let record = state.coordinator.find(&fingerprint).await.map_err(|e| {
        error!(error = ?e, "Failed to look up upload");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to look up upload",
            "QUERY_ERROR",
        )
    })?;

    match record {
        Some(r) => Ok(Json(r.into())),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            "Upload not found",
            "NOT_FOUND",
        )),
    }
}

/// Start the upload API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
