//! Health check service.
//!
//! Runs the cluster health check on an interval and serves the latest result
//! over HTTP. With `--once` it checks a single time and prints the result.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use parking_lot::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use esprobe::health::SERVICE_NAME;
use esprobe::{new_client, CheckState, Config, SearchClient, Severity};

#[derive(Parser, Debug)]
#[command(name = "esprobe-health")]
#[command(about = "Elasticsearch cluster health service")]
struct Args {
    /// Path to TOML config file
    #[arg(short, long, env = "ESPROBE_CONFIG")]
    config: Option<String>,

    /// Elasticsearch URL, overrides the config file
    #[arg(long, env = "ELASTICSEARCH_URL")]
    es_url: Option<String>,

    /// Index that must exist, may be repeated
    #[arg(long = "index")]
    indexes: Vec<String>,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:3000")]
    listen: String,

    /// Seconds between checks
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Check once, print the result and exit
    #[arg(long)]
    once: bool,
}

struct AppState {
    check: RwLock<CheckState>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if let Some(es_url) = &args.es_url {
        config.address = es_url.clone();
    }
    if !args.indexes.is_empty() {
        config.indexes = args.indexes.clone();
    }

    info!(
        "Checking Elasticsearch at {} ({:?} client)",
        config.address, config.client_lib
    );
    let client = new_client(&config)?;

    if args.once {
        let mut state = CheckState::new(SERVICE_NAME);
        client.checker(&mut state).await;
        println!("{}", serde_json::to_string_pretty(&state)?);
        if state.status() == Some(Severity::Critical) {
            std::process::exit(1);
        }
        return Ok(());
    }

    let state = Arc::new(AppState {
        check: RwLock::new(CheckState::new(SERVICE_NAME)),
    });

    tokio::spawn(run_checks(
        client,
        state.clone(),
        Duration::from_secs(args.interval.max(1)),
    ));

    let app = Router::new()
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Starting server on {}", args.listen);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_checks(client: Box<dyn SearchClient>, state: Arc<AppState>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;

        // Check into a copy so the lock is never held across an await.
        let mut check = state.check.read().clone();
        client.checker(&mut check).await;

        match check.status() {
            Some(Severity::Critical) => error!(message = %check.message(), "cluster check failed"),
            Some(Severity::Warning) => warn!(message = %check.message(), "cluster check warning"),
            _ => {}
        }
        *state.check.write() = check;
    }
}

/// Latest check result. CRITICAL and not-yet-checked answer 503.
async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<CheckState>) {
    let check = state.check.read().clone();
    (http_status(check.status()), Json(check))
}

fn http_status(status: Option<Severity>) -> StatusCode {
    match status {
        Some(Severity::Ok) | Some(Severity::Warning) => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status() {
        assert_eq!(http_status(Some(Severity::Ok)), StatusCode::OK);
        assert_eq!(http_status(Some(Severity::Warning)), StatusCode::OK);
        assert_eq!(
            http_status(Some(Severity::Critical)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(http_status(None), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from([
            "esprobe-health",
            "--es-url",
            "http://es:9200",
            "--index",
            "one",
            "--index",
            "two",
            "--once",
        ]);
        assert_eq!(args.es_url.as_deref(), Some("http://es:9200"));
        assert_eq!(args.indexes, vec!["one", "two"]);
        assert!(args.once);
    }
}
