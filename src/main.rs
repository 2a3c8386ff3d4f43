use anyhow::{Context, Result};
use axum::Router;
use std::io::ErrorKind;
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod persistor;
mod routes;
mod services;

use persistor::TransferMetrics;
use services::{
    file_converter::FileConverter, image_optimiser::{ImageOptimiser, OPTIMISE_TIMEOUT},
    local_file_writer::LocalFileWriter, safe_exec::SafeExec, storage_service::StorageService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        backend = ?cfg.persistor.backend,
        fallback = ?cfg.persistor.fallback.as_ref().map(|fallback| fallback.backend),
        upload_folder = %cfg.upload_folder.display(),
        conversions = cfg.conversions.enabled,
        "Starting filestore"
    );

    // --- Ensure upload folder exists ---
    fs::create_dir_all(&cfg.upload_folder)
        .await
        .with_context(|| format!("creating upload folder {}", cfg.upload_folder.display()))?;

    // --- Initialize storage backend ---
    let metrics = TransferMetrics::new();
    let persistor = persistor::build_persistor(&cfg.persistor, metrics.clone())
        .context("configuring storage backend")?;
    tracing::info!(backend = persistor.backend(), "storage backend ready");

    // --- Initialize core service ---
    let exec = SafeExec::new(cfg.conversions.enabled);
    let storage = StorageService::new(
        persistor,
        cfg.service.clone(),
        LocalFileWriter::new(cfg.upload_folder.clone()),
        FileConverter::new(
            exec.clone(),
            cfg.conversions.renderer,
            cfg.conversions.command_prefix.clone(),
        ),
        ImageOptimiser::new(exec, cfg.conversions.command_prefix.clone(), OPTIMISE_TIMEOUT),
        metrics,
    );

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
