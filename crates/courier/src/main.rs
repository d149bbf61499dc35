//! # courier
//!
//! Courier delivery server binary: loads layered settings, wires the
//! collaborator store and shared state backends, and serves the WebSocket
//! gateway until SIGINT/SIGTERM.

#![deny(unsafe_code)]

mod wiring;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use courier_core::logging::{LogFormat, init_subscriber};
use courier_server::{CourierServer, ServerConfig, ServerDeps};
use courier_settings::{CourierSettings, StoreBackend};

use crate::wiring::SeedUser;

/// Courier delivery server.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Real-time message delivery and presence server")]
struct Cli {
    /// Settings file (defaults to `~/.courier/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Redis URL for shared presence, offline queues and cluster fan-out.
    #[arg(long)]
    redis_url: Option<String>,

    /// Collaborator store: `memory` or `sqlite`.
    #[arg(long, value_parser = ["memory", "sqlite"])]
    store: Option<String>,

    /// Path to the `SQLite` database.
    #[arg(long)]
    sqlite_path: Option<String>,

    /// Log output format: `compact` or `json`.
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Create a user at startup (`id` or `id:Display Name`); seeded users
    /// become mutual contacts. Repeatable.
    #[arg(long = "seed-user")]
    seed_users: Vec<SeedUser>,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, settings: &mut CourierSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = &self.redis_url {
            settings.redis.url = Some(url.clone());
        }
        if let Some(store) = self.store.as_deref() {
            settings.store.backend = if store == "sqlite" {
                StoreBackend::Sqlite
            } else {
                StoreBackend::Memory
            };
        }
        if let Some(path) = &self.sqlite_path {
            settings.store.sqlite_path.clone_from(path);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(courier_settings::settings_path);
    let mut settings = courier_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    init_subscriber(&settings.logging.level, settings.logging.format);
    tracing::info!(path = %settings_path.display(), "settings loaded");
    if settings.auth.uses_dev_secret() {
        tracing::warn!("using the development JWT secret; set COURIER_JWT_SECRET in production");
    }

    let stores = wiring::build_stores(&settings, &args.seed_users)?;
    let backends = wiring::build_backends(&settings).await?;
    let metrics = courier_server::metrics::install_recorder();

    let config = ServerConfig::from_settings(&settings);
    let server = CourierServer::new(
        config,
        ServerDeps {
            stores,
            presence: backends.presence,
            queue: backends.queue,
            cluster: backends.cluster,
            metrics: Some(metrics),
        },
    );

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Courier listening on ws://{addr}/ws");

    shutdown_signal().await?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["courier"]);
        let mut settings = CourierSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, CourierSettings::default().server.port);
        assert!(settings.redis.url.is_none());
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert!(cli.seed_users.is_empty());
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "courier",
            "--host",
            "0.0.0.0",
            "--port",
            "7100",
            "--redis-url",
            "redis://cache:6379",
            "--store",
            "sqlite",
            "--sqlite-path",
            "/var/lib/courier.db",
            "--log-format",
            "json",
        ]);
        let mut settings = CourierSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 7100);
        assert_eq!(settings.redis.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(settings.store.backend, StoreBackend::Sqlite);
        assert_eq!(settings.store.sqlite_path, "/var/lib/courier.db");
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn cli_rejects_unknown_store() {
        assert!(Cli::try_parse_from(["courier", "--store", "mongo"]).is_err());
    }

    #[test]
    fn cli_seed_users_repeat() {
        let cli = Cli::parse_from([
            "courier",
            "--seed-user",
            "alice:Alice",
            "--seed-user",
            "bob",
        ]);
        assert_eq!(cli.seed_users.len(), 2);
        assert_eq!(cli.seed_users[0].display_name, "Alice");
        assert_eq!(cli.seed_users[1].id, "bob");
    }

    #[test]
    fn config_flag_points_at_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7300}}"#).unwrap();

        let cli = Cli::parse_from(["courier", "--config", path.to_str().unwrap()]);
        let settings = courier_settings::load_settings_from_path(cli.config.as_ref().unwrap()).unwrap();
        assert_eq!(settings.server.port, 7300);
    }
}
