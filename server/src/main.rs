use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

mod broadcast;
mod error;
mod handlers;
mod logic;
mod registry;
mod rooms;
mod sampling;
mod snapshot;
mod state;
mod storage;
mod store;
mod sweeper;
mod tracker;

use crate::handlers::{health_handler, join_room_handler, room_info_handler, root_handler, ws_handler};
use crate::state::{AppState, SyncConfig};
use crate::storage::{FileStorage, MemoryStorage, S3Storage, S3StorageConfig, Storage};
use crate::sweeper::spawn_sweeper;

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
    /// Directory holding one file per room.
    #[arg(long, env = "ROOM_DIR")]
    room_dir: Option<PathBuf>,
    /// Keep rooms in memory only.
    #[arg(long)]
    ephemeral: bool,
    #[arg(long, env = "S3_BUCKET")]
    s3_bucket: Option<String>,
    #[arg(long, env = "S3_PREFIX")]
    s3_prefix: Option<String>,
    #[arg(long, env = "S3_REGION")]
    s3_region: Option<String>,
    #[arg(long, env = "S3_ENDPOINT_URL")]
    s3_endpoint_url: Option<String>,
    #[arg(long, env = "S3_FORCE_PATH_STYLE")]
    s3_force_path_style: bool,
    #[arg(long, env = "S3_ACCESS_KEY_ID")]
    s3_access_key_id: Option<String>,
    #[arg(long, env = "S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    s3_secret_access_key: Option<String>,
    /// Persist one stroke point in every N move events.
    #[arg(long, env = "SAMPLE_STRIDE", default_value_t = sampling::DEFAULT_SAMPLE_STRIDE)]
    sample_stride: u32,
    #[arg(long, env = "FLUSH_INTERVAL_SECS", default_value_t = 60)]
    flush_interval_secs: u64,
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value_t = 6 * 60 * 60)]
    cleanup_interval_secs: u64,
    #[arg(long, env = "ROOM_TTL_SECS", default_value_t = 24 * 60 * 60)]
    room_ttl_secs: u64,
    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,
    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

impl Args {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sample_stride: self.sample_stride.max(1),
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs.max(1)),
            room_ttl: Duration::from_secs(self.room_ttl_secs),
        }
    }

    async fn storage(&self) -> std::io::Result<Arc<dyn Storage>> {
        if self.ephemeral {
            info!("Using in-memory room storage");
            return Ok(Arc::new(MemoryStorage::new()));
        }
        if let Some(bucket) = &self.s3_bucket {
            let mut config = S3StorageConfig::new(bucket.clone());
            config.prefix = self.s3_prefix.clone();
            config.region = self.s3_region.clone();
            config.endpoint_url = self.s3_endpoint_url.clone();
            config.force_path_style = self.s3_force_path_style;
            config.access_key_id = self.s3_access_key_id.clone();
            config.secret_access_key = self.s3_secret_access_key.clone();
            info!(bucket = %config.bucket, prefix = ?config.prefix, "Using S3 room storage");
            return Ok(Arc::new(S3Storage::new(config).await));
        }
        let room_dir = self
            .room_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../rooms"));
        tokio::fs::create_dir_all(&room_dir).await?;
        info!(dir = %room_dir.display(), "Using file room storage");
        Ok(Arc::new(FileStorage::new(room_dir)))
    }
}

fn spawn_flusher(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.flush_interval);
        loop {
            interval.tick().await;
            let saved = state.store.flush_dirty().await;
            if saved > 0 {
                info!(saved, "Flushed dirty rooms");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sketchroom_server=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let storage = match args.storage().await {
        Ok(storage) => storage,
        Err(error) => {
            error!(%error, "Failed to prepare room storage");
            return ExitCode::FAILURE;
        }
    };
    let state = AppState::new(storage, args.sync_config());
    info!(
        sample_stride = state.writer.sampler().stride(),
        room_ttl_secs = state.config.room_ttl.as_secs(),
        "Sync engine ready"
    );
    spawn_flusher(state.clone());
    spawn_sweeper(state.clone());

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/api/rooms/join", post(join_room_handler))
        .route("/api/rooms/:room_id", get(room_info_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let served = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = match axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await {
                Ok(tls) => tls,
                Err(error) => {
                    error!(%error, "Failed to load TLS certificate");
                    return ExitCode::FAILURE;
                }
            };
            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
            });
            info!("Sketchroom running at https://localhost:{}", args.port);
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        _ => {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(error) => {
                    error!(%error, %addr, "Failed to bind server");
                    return ExitCode::FAILURE;
                }
            };
            info!("Sketchroom running at http://localhost:{}", args.port);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        }
    };

    let saved = state.store.flush_dirty().await;
    info!(saved, "Flushed rooms before exit");
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "Server crashed");
            ExitCode::FAILURE
        }
    }
}
