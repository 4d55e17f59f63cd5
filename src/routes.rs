//! 路由装配：端点、请求体限制与共享状态。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::sync::Arc;

use crate::firmware::{self, UploadConfig};
use crate::http;
use crate::ledger::Ledger;
use crate::locking::LockManager;
use crate::store::FirmwareStore;

pub struct Endpoint {
    pub name: &'static str,
    pub method: &'static str,
    pub path: &'static str,
    pub summary: &'static str,
}

pub const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        name: "index",
        method: "GET",
        path: "/",
        summary: "Server info",
    },
    Endpoint {
        name: "firmware",
        method: "GET",
        path: "/firmware/{filename}",
        summary: "Download firmware",
    },
    Endpoint {
        name: "upload",
        method: "POST",
        path: "/upload",
        summary: "Upload firmware",
    },
    Endpoint {
        name: "versions",
        method: "GET",
        path: "/versions",
        summary: "List versions",
    },
];

/// 构建 OTA 服务路由；追踪与 CORS 由调用方按需叠加。
pub fn build_router(
    store: Arc<FirmwareStore>,
    ledger: Arc<Ledger>,
    lock_manager: Arc<LockManager>,
    upload: Arc<UploadConfig>,
) -> Router {
    let body_limit = DefaultBodyLimit::max(upload.max_upload_size);
    Router::new()
        .route("/", get(firmware::index))
        .route("/firmware/{filename}", get(firmware::download_firmware))
        .route(
            "/upload",
            post(firmware::upload_firmware).layer(body_limit),
        )
        .route("/versions", get(firmware::list_versions))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(Extension(store))
        .layer(Extension(ledger))
        .layer(Extension(lock_manager))
        .layer(Extension(upload))
}
