use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use triage_gateway::{EvaluationGateway, GatewayConfig};
use triage_service::create_app;

/// Initialize structured tracing; `LOG_FORMAT=pretty` for development.
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "triage_service=debug,triage_gateway=debug,tower_http=debug".into()
    });

    match log_format.as_str() {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received, cancelling in-flight evaluations");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = GatewayConfig::from_env()
        .map_err(|e| anyhow::anyhow!("{}: {}", e.code(), e))
        .context("invalid gateway configuration")?;
    if !config.is_enabled() {
        warn!("OPENROUTER_API_KEY not set; evaluations will fail with ConfigurationError");
    }
    info!(config = ?config, "Gateway configuration loaded");

    let bind_addr = std::env::var("TRIAGE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    let gateway = EvaluationGateway::from_config(config)?;
    let shutdown = CancellationToken::new();
    let app = create_app(gateway, shutdown.clone());

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let addr = listener.local_addr()?;

    info!("Referral Triage Gateway starting on {}", addr);
    info!("Evaluation endpoint: POST http://{}/v1/evaluate", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}
