//! HTTP handlers for project files.
//! Bodies are streamed in both directions; storage concerns live in
//! `StorageService`.

use crate::{
    errors::AppError,
    models::{ByteRange, ContentDigest},
    services::{
        file_converter::Style,
        storage_service::{GetFileOptions, StorageError, StorageService},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;

/// Optional conversion parameters on `GET` requests.
#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    pub format: Option<String>,
    pub style: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CopyFileReq {
    pub source: SourceFile,
}

#[derive(Debug, Deserialize)]
pub struct SourceFile {
    pub project_id: String,
    pub file_id: String,
}

/// Project and file ids are 24-digit hex object ids.
fn validate_id(id: &str) -> Result<(), AppError> {
    if id.len() == 24 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(AppError::bad_request(format!("invalid id `{id}`")))
    }
}

/// Store keys are relative `/`-separated paths without empty, `.` or `..` segments.
fn validate_key(key: &str) -> Result<(), AppError> {
    if key
        .split('/')
        .all(|segment| !matches!(segment, "" | "." | ".."))
    {
        Ok(())
    } else {
        Err(AppError::bad_request(format!("invalid key `{key}`")))
    }
}

fn file_key(project_id: &str, file_id: &str) -> Result<String, AppError> {
    validate_id(project_id)?;
    validate_id(file_id)?;
    Ok(format!("{project_id}/{file_id}"))
}

fn get_options(query: &FileQuery, headers: &HeaderMap) -> Result<GetFileOptions, AppError> {
    let style = query
        .style
        .as_deref()
        .map(str::parse::<Style>)
        .transpose()
        .map_err(|err| AppError::from(StorageError::from(err)))?;
    // unparsable ranges are served as full reads
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(ByteRange::from_header);
    Ok(GetFileOptions {
        format: query.format.clone(),
        style,
        range,
    })
}

async fn serve_file(
    service: &StorageService,
    bucket: &str,
    key: &str,
    options: GetFileOptions,
) -> Result<Response, AppError> {
    if let Some(url) = service.get_redirect_url(bucket, key, &options).await? {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::FOUND;
        let location = HeaderValue::from_str(&url)
            .map_err(|_| AppError::internal("redirect url is not a valid header"))?;
        response.headers_mut().insert(header::LOCATION, location);
        return Ok(response);
    }

    let stream = service.get_file(bucket, key, &options).await?;
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}

/// `GET /project/{project_id}/file/{file_id}`
pub async fn get_file(
    State(service): State<StorageService>,
    Path((project_id, file_id)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let key = file_key(&project_id, &file_id)?;
    let options = get_options(&query, &headers)?;
    let bucket = service.settings().user_files_bucket.clone();
    serve_file(&service, &bucket, &key, options).await
}

/// `HEAD /project/{project_id}/file/{file_id}`
pub async fn head_file(
    State(service): State<StorageService>,
    Path((project_id, file_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let key = file_key(&project_id, &file_id)?;
    let size = service
        .get_file_size(&service.settings().user_files_bucket, &key)
        .await?;
    let mut response = Response::new(Body::empty());
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    Ok(response)
}

/// `POST /project/{project_id}/file/{file_id}`
///
/// A `Content-MD5` header, when present, is checked against the streamed body.
pub async fn insert_file(
    State(service): State<StorageService>,
    Path((project_id, file_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, AppError> {
    let key = file_key(&project_id, &file_id)?;
    let expected = match headers.get("content-md5") {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(ContentDigest::from_base64)
                .ok_or_else(|| AppError::bad_request("invalid Content-MD5 header"))?,
        ),
        None => None,
    };
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();
    service
        .insert_file(&service.settings().user_files_bucket, &key, stream, expected)
        .await?;
    Ok(StatusCode::OK)
}

/// `PUT /project/{project_id}/file/{file_id}` copies another project's file here.
pub async fn copy_file(
    State(service): State<StorageService>,
    Path((project_id, file_id)): Path<(String, String)>,
    Json(req): Json<CopyFileReq>,
) -> Result<StatusCode, AppError> {
    let dest = file_key(&project_id, &file_id)?;
    let source = file_key(&req.source.project_id, &req.source.file_id)?;
    service
        .copy_file(&service.settings().user_files_bucket, &source, &dest)
        .await?;
    Ok(StatusCode::OK)
}

/// `DELETE /project/{project_id}/file/{file_id}`
pub async fn delete_file(
    State(service): State<StorageService>,
    Path((project_id, file_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let key = file_key(&project_id, &file_id)?;
    service
        .delete_file(&service.settings().user_files_bucket, &key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /project/{project_id}`
pub async fn delete_project(
    State(service): State<StorageService>,
    Path(project_id): Path<String>,
) -> Result<StatusCode, AppError> {
    validate_id(&project_id)?;
    service
        .delete_project(&service.settings().user_files_bucket, &project_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /project/{project_id}/size`
pub async fn get_project_size(
    State(service): State<StorageService>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validate_id(&project_id)?;
    let total = service
        .get_directory_size(&service.settings().user_files_bucket, &project_id)
        .await?;
    Ok(Json(json!({ "total bytes": total })))
}

/// `GET /bucket/{bucket}/key/{*key}` reads from any configured store.
pub async fn get_bucket_file(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !service.settings().is_store(&bucket) {
        return Err(StorageError::UnknownBucket(bucket).into());
    }
    validate_key(&key)?;
    let options = get_options(&FileQuery::default(), &headers)?;
    serve_file(&service, &bucket, &key, options).await
}
