//! Vitals service - ingestion workers and HTTP control surface.
//!
//! `run` serves the HTTP control surface; `sync`, `backfill`, and `archive`
//! execute one worker invocation and print its report, which is what a
//! platform scheduler (cron, systemd timer) calls.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::{Parser, Subcommand};
use time::macros::format_description;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use vitals_client::{ApiClient, ApiClientConfig};
use vitals_cold::LocalStore;
use vitals_service::{
    AppState, ArchivalEngine, BackfillEngine, Config, SyncOrchestrator, api,
};
use vitals_store::Store;

/// Vitals service - sensor timeseries ingestion pipeline.
#[derive(Parser, Debug)]
#[command(name = "vitals-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long, global = true)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP control surface (default behavior).
    Run,

    /// Run one sync invocation and print the report.
    Sync,

    /// Run one backfill trigger and print the continuation state.
    Backfill {
        /// Site to backfill.
        #[arg(long)]
        site: String,

        /// Range start, YYYY-MM-DD. Required for a new backfill.
        #[arg(long)]
        start_date: Option<String>,

        /// Range end, YYYY-MM-DD. Required for a new backfill.
        #[arg(long)]
        end_date: Option<String>,

        /// Discard existing progress and start over.
        #[arg(long)]
        reset: bool,
    },

    /// Run one archival pass and print the report.
    Archive,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vitals_service=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env();

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db_path) = args.database {
        config.storage.db_path = db_path;
    }
    config.validate()?;

    info!("Opening database at {:?}", config.storage.db_path);
    let store = Store::open(&config.storage.db_path)?;
    let cold = Arc::new(LocalStore::new(&config.storage.cold_root));
    let client = ApiClient::new(ApiClientConfig {
        base_url: config.api.base_url.clone(),
        token: config.api.token.clone(),
        page_size: config.api.page_size,
        point_chunk_size: config.api.point_chunk_size,
        request_timeout: config.api.request_timeout(),
    })?;

    let state = AppState::new(store, cold, Arc::new(client), config.clone());

    match args.command {
        Some(Command::Run) | None => serve(state, &config).await,
        Some(Command::Sync) => {
            let report = SyncOrchestrator::new(state).run().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(Command::Backfill { site, start_date, end_date, reset }) => {
            let range = parse_range(start_date.as_deref(), end_date.as_deref())?;
            let outcome = BackfillEngine::new(state).trigger(&site, range, reset).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Some(Command::Archive) => {
            let report = ArchivalEngine::new(state).run().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn parse_range(
    start: Option<&str>,
    end: Option<&str>,
) -> anyhow::Result<Option<(time::Date, time::Date)>> {
    let format = format_description!("[year]-[month]-[day]");
    match (start, end) {
        (Some(start), Some(end)) => Ok(Some((
            time::Date::parse(start, &format)?,
            time::Date::parse(end, &format)?,
        ))),
        (None, None) => Ok(None),
        _ => anyhow::bail!("--start-date and --end-date must be provided together"),
    }
}

async fn serve(state: Arc<AppState>, config: &Config) -> anyhow::Result<()> {
    let app = Router::new()
        .merge(api::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr: SocketAddr = config.server.bind.parse()?;
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
