//! Defines routes for project file operations.
//!
//! ## Structure
//! - **File endpoints** (`/project/{project_id}/file/{file_id}`)
//!   - `GET`   : download, optionally converted (`?format=`, `?style=`, `Range`)
//!   - `HEAD`  : size only
//!   - `POST`  : upload
//!   - `PUT`   : copy from another project
//!   - `DELETE`: delete with cached conversions
//!
//! - **Project endpoints**
//!   - `DELETE /project/{project_id}`     : delete every file
//!   - `GET    /project/{project_id}/size`: total bytes stored
//!
//! - **Store endpoints**
//!   - `GET /bucket/{bucket}/key/{*key}`: read from a configured store
//!
//! - **Operational endpoints**: `/status`, `/health_check`, `/metrics`

use crate::{
    handlers::{
        file_handlers::{
            copy_file, delete_file, delete_project, get_bucket_file, get_file, get_project_size,
            head_file, insert_file,
        },
        health_handlers::{health_check, metrics, status},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::{delete, get},
};

/// Build the router; every handler shares the `StorageService` state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        .route("/status", get(status))
        .route("/health_check", get(health_check))
        .route("/metrics", get(metrics))
        .route(
            "/project/{project_id}/file/{file_id}",
            get(get_file)
                .head(head_file)
                .post(insert_file)
                .put(copy_file)
                .delete(delete_file),
        )
        .route("/project/{project_id}", delete(delete_project))
        .route("/project/{project_id}/size", get(get_project_size))
        .route("/bucket/{bucket}/key/{*key}", get(get_bucket_file))
}
