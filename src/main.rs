use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod core;
mod db;
mod models;
mod services;

use config::AppConfig;
use core::collaborators::{
    test_support::{FakeLibrary, FakeMediaSources, FakeMusic},
    Collaborators,
};
use core::controller::ControllerFactoryChain;
use core::manager::SessionManagerConfig;
use core::SessionManager;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: AppConfig,
    pub sessions: Arc<SessionManager>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jellyfin_rust=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = AppConfig::load();
    config.paths.ensure_dirs().await?;
    config.log_config();

    let database_url = config.database_url();
    tracing::debug!("Database URL: {}", database_url);

    let connect_options = SqliteConnectOptions::from_str(&database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .page_size(8192)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .test_before_acquire(true)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                use sqlx::Executor;
                conn.execute("PRAGMA cache_size = -32000").await?;
                conn.execute("PRAGMA mmap_size = 67108864").await?;
                conn.execute("PRAGMA temp_store = MEMORY").await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await?;

    tracing::info!("SQLite configured: WAL mode, 32MB cache, 64MB mmap (per connection)");

    db::migrate(&pool).await?;

    let user_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&pool)
        .await?;

    if user_count.0 == 0 {
        tracing::info!("No users found, creating default admin user");
        db::create_user(&pool, "admin", "admin", true).await?;
        tracing::info!("Created default admin user (username: admin, password: admin)");
    }

    let collaborators = Collaborators {
        users: Arc::new(db::SqliteUsers::new(pool.clone())),
        user_data: Arc::new(db::SqliteUserData::new(pool.clone())),
        library: Arc::new(FakeLibrary::default()),
        music: Arc::new(FakeMusic),
        media_sources: Arc::new(FakeMediaSources),
        devices: Arc::new(db::SqliteDevices::new(pool.clone())),
        auth_repo: Arc::new(db::SqliteAuthRepository::new(pool.clone())),
    };

    let sessions = SessionManager::new(
        collaborators,
        ControllerFactoryChain::new(vec![]),
        SessionManagerConfig::from(&config.session),
    );

    let state = Arc::new(AppState {
        db: pool.clone(),
        config: config.clone(),
        sessions,
    });

    async fn root_handler() -> &'static str {
        "Jellyfin Rust Server"
    }

    let app = Router::new()
        .route("/", get(root_handler).head(root_handler))
        .route("/health", get(|| async { "OK" }))
        .nest("/", api::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    state.sessions.dispose().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
