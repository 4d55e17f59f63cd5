//! 固件上传、下载与版本列表处理器。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Extension, Multipart, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::{FIRMWARE_EXTENSION, UPLOAD_FIELD, VERSION_FIELD};
use crate::error::ApiError;
use crate::ledger::{Ledger, LedgerEntry};
use crate::locking::LockManager;
use crate::routes::ENDPOINTS;
use crate::store::FirmwareStore;

#[derive(Debug)]
pub struct UploadConfig {
    /// Advertised base URL without trailing slash.
    pub base_url: String,
    pub default_version: String,
    pub max_upload_size: usize,
    /// How long a request waits for the per-filename lock.
    pub lock_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub(crate) struct UploadResponse {
    message: &'static str,
    filename: String,
    download_url: String,
    version: String,
    size_bytes: u64,
    md5_hash: String,
}

/// 服务信息与端点列表。
pub async fn index() -> JsonResponse<Value> {
    let endpoints: Map<String, Value> = ENDPOINTS
        .iter()
        .map(|endpoint| (endpoint.name.to_string(), Value::from(endpoint.path)))
        .collect();
    JsonResponse(json!({
        "message": "ESP32 OTA Server",
        "version": crate::build::PKG_VERSION,
        "endpoints": endpoints,
    }))
}

/// 下载固件并累加最新台账记录的下载次数。
///
/// 打开文件与计数在同名上传锁内完成，计数总是落在所下载内容对应的那一行。
pub async fn download_firmware(
    Path(filename): Path<String>,
    Extension(store): Extension<Arc<FirmwareStore>>,
    Extension(ledger): Extension<Arc<Ledger>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
) -> Result<Response, ApiError> {
    let (file, size, download_count) = {
        let _guard = lock_manager
            .lock_name_with_timeout(&filename, upload.lock_timeout)
            .await
            .map_err(|_| ApiError::Conflict("Firmware upload in progress".into()))?;
        let (file, size) = store.open(&filename).await?;
        let download_count = ledger.increment_download_count(&filename).await?;
        (file, size, download_count)
    };
    info!(filename, size, download_count, "serving firmware");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&size.to_string())
            .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&filename)?);

    let stream = ReaderStream::new(file);
    Ok((StatusCode::OK, headers, AxumBody::from_stream(stream)).into_response())
}

/// 接收 multipart 上传的 `.bin` 固件，写入存储并追加台账记录。
pub async fn upload_firmware(
    Extension(store): Extension<Arc<FirmwareStore>>,
    Extension(ledger): Extension<Arc<Ledger>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let mut multipart =
        multipart.map_err(|_| ApiError::BadRequest("No firmware file provided".into()))?;

    let mut firmware: Option<(String, Bytes)> = None;
    let mut version: Option<String> = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            UPLOAD_FIELD => {
                // 无 filename 参数的同名字段是普通表单值，不算文件
                let Some(file_name) = field.file_name().map(str::to_string) else {
                    debug!("ignoring non-file firmware field");
                    continue;
                };
                let data = field.bytes().await.map_err(multipart_error)?;
                firmware = Some((file_name, data));
            }
            VERSION_FIELD => {
                version = Some(field.text().await.map_err(multipart_error)?);
            }
            other => debug!(field = other, "ignoring multipart field"),
        }
    }

    let Some((filename, data)) = firmware else {
        return Err(ApiError::BadRequest("No firmware file provided".into()));
    };
    if filename.is_empty() {
        return Err(ApiError::BadRequest("No file selected".into()));
    }
    if !filename.ends_with(FIRMWARE_EXTENSION) {
        return Err(ApiError::BadRequest(
            "Invalid file type. Only .bin files allowed".into(),
        ));
    }
    let version = version
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| upload.default_version.clone());

    let _guard = lock_manager
        .lock_name_with_timeout(&filename, upload.lock_timeout)
        .await
        .map_err(|_| ApiError::Conflict("Firmware upload already in progress".into()))?;
    let replaced = store.exists(&filename).await?;
    store.put(&filename, &data).await?;
    let size_bytes = store.size(&filename).await?;
    let md5_hash = store.checksum(&filename).await?;
    let entry = ledger
        .append(&filename, size_bytes, &md5_hash, &version)
        .await?;
    info!(
        filename,
        size = entry.size_bytes,
        md5 = entry.md5_hash,
        version = entry.version,
        replaced,
        "firmware uploaded"
    );

    Ok(JsonResponse(UploadResponse {
        message: "Firmware uploaded successfully",
        download_url: format!(
            "{}/firmware/{}",
            upload.base_url,
            urlencoding::encode(&filename)
        ),
        filename,
        version: entry.version,
        size_bytes: entry.size_bytes,
        md5_hash: entry.md5_hash,
    }))
}

/// 返回台账中的全部记录。
pub async fn list_versions(
    Extension(ledger): Extension<Arc<Ledger>>,
) -> JsonResponse<Vec<LedgerEntry>> {
    let entries = ledger.list_all().await;
    info!(count = entries.len(), "list versions");
    JsonResponse(entries)
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::PayloadTooLarge("Firmware exceeds upload size limit".into());
    }
    ApiError::BadRequest(format!("Invalid multipart body: {}", err.body_text()))
}

/// 构建附件下载头，非 ASCII 文件名使用 RFC 5987 编码。
fn content_disposition(filename: &str) -> Result<HeaderValue, ApiError> {
    let value = if filename.is_ascii() && !filename.contains(['"', '\\']) {
        format!("attachment; filename=\"{filename}\"")
    } else {
        let fallback: String = filename
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(filename)
        )
    };
    HeaderValue::from_str(&value).map_err(|_| ApiError::Internal("响应头构建失败".into()))
}
