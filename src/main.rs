//! Audio Relay Server
//!
//! Loads configuration, sets up logging and serves `/stream/{id}` until
//! interrupted.

use anyhow::Context;
use audio_relay::{RangeRelay, RelayConfig, RelayServer};
use std::env;
use std::path::Path;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "audio_relay.yaml";

/// Main entry point for the relay server
///
/// # Usage
/// ```bash
/// # Start with default config (audio_relay.yaml, built-in defaults if absent)
/// audio-relay
///
/// # Start with custom config
/// audio-relay /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args().nth(1);
    let config = load_config(config_path.as_deref())?;
    let reload_path = config_path
        .or_else(|| Path::new(DEFAULT_CONFIG_PATH).exists().then(|| DEFAULT_CONFIG_PATH.to_string()));

    tracing_subscriber::fmt()
        .with_max_level(parse_level(&config.log_level))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Audio Relay Server");
    info!("Configuration:");
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Extractor: {}", config.extractor_program);
    info!("  - Descriptor TTL: {} seconds", config.descriptor_ttl_secs);
    info!(
        "  - Initial chunk: {} KB, read-ahead: {} KB",
        config.initial_chunk_bytes / 1024,
        config.read_ahead_bytes / 1024
    );
    info!(
        "  - Max buffer: {} KB, low water: {} KB",
        config.max_buffer_bytes / 1024,
        config.low_water_bytes / 1024
    );
    info!(
        "  - Buffer idle TTL: {} seconds, sweep every {} seconds",
        config.buffer_idle_ttl_secs, config.sweep_interval_secs
    );

    let addr = config.listen_socket_addr()?;
    let relay = RangeRelay::with_process_runner(config).context("failed to create relay")?;
    relay.start();

    let server = RelayServer::bind(addr, relay.clone())
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    if let Some(path) = reload_path {
        spawn_reload_on_hangup(relay.clone(), path)?;
    }

    server.run(shutdown_rx).await?;
    relay.shutdown();

    let stats = relay.metrics().get_stats();
    info!(
        "Served {} requests ({} failed), buffer hit rate {:.2}%",
        stats.total_requests,
        stats.failed_requests,
        stats.buffer_hit_rate()
    );
    Ok(())
}

/// Re-read the config file on SIGHUP and apply it to the running relay
#[cfg(unix)]
fn spawn_reload_on_hangup(relay: RangeRelay, path: String) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    info!("Send SIGHUP to reload {}", path);
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading {}", path);
            let result = RelayConfig::from_file(&path).and_then(|config| relay.reload_config(&config));
            match result {
                Ok(changes) if !changes.has_changes() => info!("Configuration unchanged"),
                Ok(_) => {}
                Err(e) => error!("Failed to reload configuration, keeping current: {}", e),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_relay: RangeRelay, _path: String) -> anyhow::Result<()> {
    Ok(())
}

/// Load the config file; a missing default file means built-in defaults
fn load_config(path: Option<&str>) -> anyhow::Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path)),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            RelayConfig::from_file(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("failed to load configuration from {}", DEFAULT_CONFIG_PATH))
        }
        None => {
            // Logging is not up yet
            eprintln!(
                "{} not found, using built-in defaults",
                DEFAULT_CONFIG_PATH
            );
            Ok(RelayConfig::default())
        }
    }
}

fn parse_level(level: &str) -> tracing::Level {
    match level {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        "info" => tracing::Level::INFO,
        other => {
            warn!("Unknown log level '{}', using info", other);
            tracing::Level::INFO
        }
    }
}
