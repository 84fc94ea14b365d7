use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use studio_relay::{build_app, AppState, RelayConfig};

// ─── Tracing ────────────────────────────────────────────────────────────────

fn init_tracing() {
    let log_level =
        std::env::var("STUDIO_RELAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let is_production = std::env::var("STUDIO_RELAY_ENV")
        .map(|v| v == "production")
        .unwrap_or(false);

    if is_production {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }
}

// ─── TLS configuration ─────────────────────────────────────────────────────

async fn load_tls_config(cfg: &RelayConfig) -> anyhow::Result<axum_server::tls_rustls::RustlsConfig> {
    let cert_path = cfg
        .tls_cert_path
        .as_deref()
        .context("STUDIO_RELAY_TLS_CERT_PATH must be set when TLS is enabled")?;
    let key_path = cfg
        .tls_key_path
        .as_deref()
        .context("STUDIO_RELAY_TLS_KEY_PATH must be set when TLS is enabled")?;

    info!("Loading TLS certificate from: {}", cert_path);
    info!("Loading TLS private key from:  {}", key_path);

    axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .context("failed to load TLS configuration")
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // rustls 0.23 needs a process-wide provider before any TLS/DTLS use.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = RelayConfig::from_env();
    let bind_addr = cfg.bind_addr.clone();
    let tls_enabled = cfg.tls_enabled;
    let tls_config = if tls_enabled {
        Some(load_tls_config(&cfg).await?)
    } else {
        None
    };

    let state = Arc::new(AppState::new(cfg));
    let app = build_app(state);

    match tls_config {
        Some(tls_config) => {
            let addr: SocketAddr = bind_addr
                .parse()
                .with_context(|| format!("invalid bind address '{bind_addr}'"))?;
            info!("studio relay listening on https://{bind_addr}");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("failed to bind {bind_addr}"))?;
            info!("studio relay listening on http://{bind_addr}");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
