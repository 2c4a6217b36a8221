//! vertex-relay binary.
//!
//! Startup is fail-fast: configuration, the quota ledger connection and the
//! first access token must all succeed before the listener is opened.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use vertex_relay::auth::cache::{ServiceAccountFetcher, TokenCache};
use vertex_relay::auth::exchange::TokenExchanger;
use vertex_relay::auth::signer::CredentialSigner;
use vertex_relay::config::{Cli, Config};
use vertex_relay::ledger::postgres::PgLedger;
use vertex_relay::metrics::Metrics;
use vertex_relay::server::gateway::{build_router, AppState};
use vertex_relay::upstream::UpstreamClient;

const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the process environment is used instead.
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        "vertex_relay=debug,tower_http=debug"
    } else {
        "vertex_relay=info,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("vertex-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_cli(cli).context("loading configuration")?;

    info!(
        port = config.server.port,
        project = %config.upstream.project_id,
        region = %config.upstream.region,
        model = %config.upstream.model,
        max_body_bytes = config.server.max_body_bytes,
        "Configuration loaded"
    );

    let metrics = Metrics::new().context("registering metrics")?;

    let ledger = PgLedger::connect(&config.database)
        .await
        .context("connecting to quota ledger")?;

    let creds = &config.credentials;
    let signer = CredentialSigner::new(
        &creds.client_email,
        &creds.private_key_pem,
        &creds.private_key_id,
        &creds.token_url,
    )
    .context("loading service account key")?;
    let token_http = reqwest::Client::builder()
        .timeout(TOKEN_EXCHANGE_TIMEOUT)
        .build()
        .context("building token client")?;
    let exchanger = TokenExchanger::new(token_http, creds.token_url.clone());
    let fetcher = Arc::new(ServiceAccountFetcher::new(signer, exchanger));

    let tokens = TokenCache::initialize(fetcher, creds.refresh_margin, Some(metrics.clone()))
        .await
        .context("obtaining initial access token")?;

    let upstream = UpstreamClient::new(&config.upstream).context("building upstream client")?;
    info!(url = upstream.url(), "Upstream endpoint");

    let state = Arc::new(AppState {
        ledger: Arc::new(ledger),
        tokens: Arc::new(tokens),
        upstream,
        metrics,
        max_body_bytes: config.server.max_body_bytes,
        body_read_timeout: config.server.body_read_timeout,
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
