//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `PUT`    | `/api/products/sync` | Run a sync pass; materialization continues in the background |
//! | `GET`    | `/api/products` | List products (`search`, `page`, `limit`) |
//! | `GET`    | `/api/products/{id}` | Product by id |
//! | `GET`    | `/api/attachments` | List attachments (`search`, `product_code`, `page`, `limit`, `fast`) |
//! | `POST`   | `/api/attachments` | Multipart upload (`file`, `tag`, `name`, `remark`, `product_code`, `email`) |
//! | `GET`    | `/api/attachments/{id}` | Attachment metadata |
//! | `PUT`    | `/api/attachments/{id}` | Update metadata |
//! | `DELETE` | `/api/attachments/{id}` | Soft delete |
//! | `GET`    | `/api/attachments/download/{hash}` | Download bytes |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "attachment 7 not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `sync_failed`
//! (502 for wiki/tracker stages, 500 for storage stages), `internal` (500).
//!
//! Authorization happens in front of this server and is not checked here.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use product_hub_core::models::{Attachment, AttachmentQuery, AttachmentUpdate, Paged, Product};

use crate::app::App;
use crate::attachments::UploadMeta;
use crate::config::Config;
use crate::error::{AttachmentError, DownloadError, SyncError};
use crate::sync::SyncReport;

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Bind `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = Arc::new(App::from_config(config).await?);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "server listening");
    println!("Product hub listening on http://{}", config.server.bind);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/products/sync", put(handle_sync))
        .route("/api/products", get(handle_list_products))
        .route("/api/products/{id}", get(handle_get_product))
        .route(
            "/api/attachments",
            get(handle_list_attachments).post(handle_upload),
        )
        .route(
            "/api/attachments/{id}",
            get(handle_get_attachment)
                .put(handle_update_attachment)
                .delete(handle_delete_attachment),
        )
        .route("/api/attachments/download/{hash}", get(handle_download))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(app)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    let message = message.into();
    error!(error = %message, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message,
    }
}

impl From<AttachmentError> for AppError {
    fn from(err: AttachmentError) -> Self {
        match err {
            AttachmentError::NotFound(_) => not_found(err.to_string()),
            AttachmentError::Invalid(_) => bad_request(err.to_string()),
            AttachmentError::Storage(_) => internal(err.to_string()),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let status = match err {
            SyncError::Crawl(_) | SyncError::Resolve(_) => StatusCode::BAD_GATEWAY,
            SyncError::Reconcile(_) | SyncError::Attachment(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error!(stage = err.stage(), error = %err, "sync failed");
        AppError {
            status,
            code: "sync_failed".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<DownloadError> for AppError {
    fn from(err: DownloadError) -> Self {
        if err.is_not_found() {
            not_found(err.to_string())
        } else {
            internal(err.to_string())
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ PUT /api/products/sync ============

async fn handle_sync(State(app): State<Arc<App>>) -> Result<Json<SyncReport>, AppError> {
    let run = app.reconciler.run().await?;
    // The materialization handle is dropped; the task keeps running.
    Ok(Json(run.report))
}

// ============ /api/products ============

#[derive(Deserialize)]
struct ProductListParams {
    #[serde(default)]
    search: String,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    60
}

async fn handle_list_products(
    State(app): State<Arc<App>>,
    Query(params): Query<ProductListParams>,
) -> Result<Json<Paged<Product>>, AppError> {
    if params.page < 1 || !(1..=1000).contains(&params.limit) {
        return Err(bad_request("page must be >= 1 and limit between 1 and 1000"));
    }
    let page = app
        .products
        .list_products(&params.search, params.page, params.limit)
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(page))
}

async fn handle_get_product(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<Product>, AppError> {
    app.products
        .get_product(&id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .map(Json)
        .ok_or_else(|| not_found(format!("product {} not found", id)))
}

// ============ /api/attachments ============

async fn handle_list_attachments(
    State(app): State<Arc<App>>,
    Query(query): Query<AttachmentQuery>,
) -> Result<Json<Paged<Attachment>>, AppError> {
    Ok(Json(app.attachments.list(&query).await?))
}

async fn handle_upload(
    State(app): State<Arc<App>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Attachment>), AppError> {
    let mut meta = UploadMeta::default();
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        if field_name == "file" {
            if meta.name.is_empty() {
                meta.name = field.file_name().unwrap_or_default().to_string();
            }
            meta.mimetype = field.content_type().unwrap_or_default().to_string();
            let data = field.bytes().await.map_err(|e| bad_request(e.to_string()))?;
            bytes = Some(data.to_vec());
            continue;
        }

        let value = field.text().await.map_err(|e| bad_request(e.to_string()))?;
        match field_name.as_str() {
            "name" => meta.name = value,
            "tag" => meta.tag = value,
            "remark" => meta.remark = value,
            "product_code" => meta.product_code = value,
            "email" => meta.email = value,
            _ => {}
        }
    }

    let bytes = bytes.ok_or_else(|| bad_request("multipart field 'file' is required"))?;
    let attachment = app.attachments.upload(&bytes, meta).await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

async fn handle_get_attachment(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
) -> Result<Json<Attachment>, AppError> {
    Ok(Json(app.attachments.get(id).await?))
}

#[derive(Deserialize)]
struct UpdateRequest {
    #[serde(flatten)]
    update: AttachmentUpdate,
    #[serde(default)]
    email: String,
}

async fn handle_update_attachment(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRequest>,
) -> Result<Json<Attachment>, AppError> {
    Ok(Json(app.attachments.update(id, &req.update, &req.email).await?))
}

#[derive(Deserialize)]
struct DeleteParams {
    #[serde(default)]
    email: String,
}

async fn handle_delete_attachment(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<Attachment>, AppError> {
    Ok(Json(app.attachments.soft_delete(id, &params.email).await?))
}

// ============ GET /api/attachments/download/{hash} ============

async fn handle_download(
    State(app): State<Arc<App>>,
    Path(hash): Path<String>,
) -> Result<Response, AppError> {
    let download = app.attachments.download(&hash).await?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.filename().replace('"', "")
    );
    let headers = [
        (header::CONTENT_TYPE, download.content_type().to_string()),
        (header::CONTENT_LENGTH, download.content_length().to_string()),
        (header::CONTENT_DISPOSITION, disposition),
    ];
    Ok((headers, download.bytes).into_response())
}
