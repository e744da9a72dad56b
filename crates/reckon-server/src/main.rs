//! reckon server binary.
//!
//! Reads `reckon.toml` (or the path specified with `--config`), layers
//! `RECKON_*` environment variables on top, opens the SQLite store and serves
//! the JSON API over HTTP.
//!
//! Nested keys use a double underscore in the environment, e.g.
//! `RECKON_ENGINE__MAX_HORIZON_PERIODS=40`.
//!
//! # Password hash generation
//!
//! To generate the argon2 PHC string for `admin_password_hash`:
//!
//! ```text
//! cargo run -p reckon-server -- --hash-password
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use clap::Parser;
use rand_core::OsRng;
use reckon_api::{AppState, RunService, auth::AuthConfig};
use reckon_core::{
  catalog::{standard_checks, standard_registry},
  eval::Evaluator,
  reconcile::Reconciler,
  settings::EngineSettings,
};
use reckon_store_sqlite::SqliteStore;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Reckon calculation engine server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "reckon.toml")]
  config: PathBuf,

  /// Print the argon2 hash for a password entered on stdin and exit.
  #[arg(long)]
  hash_password: bool,
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration.
#[derive(Debug, Deserialize, Clone)]
struct ServerConfig {
  host:                String,
  port:                u16,
  store_path:          PathBuf,
  admin_username:      String,
  /// Empty disables the administrative routes.
  admin_password_hash: String,
  #[serde(default)]
  engine:              EngineSettings,
}

fn load_config(path: PathBuf) -> anyhow::Result<ServerConfig> {
  let settings = config::Config::builder()
    .set_default("host", "127.0.0.1")?
    .set_default("port", 8080)?
    .set_default("store_path", "~/.local/share/reckon/reckon.db")?
    .set_default("admin_username", "admin")?
    .set_default("admin_password_hash", "")?
    .add_source(config::File::from(path).required(false))
    .add_source(
      config::Environment::with_prefix("RECKON")
        .prefix_separator("_")
        .separator("__"),
    )
    .build()
    .context("failed to read config file")?;

  settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  if cli.hash_password {
    let password = rpassword_or_stdin()?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
      .to_string();
    println!("{hash}");
    return Ok(());
  }

  let server_cfg = load_config(cli.config)?;
  if server_cfg.admin_password_hash.is_empty() {
    tracing::warn!("admin_password_hash is not set; rollback is disabled");
  }

  let store_path = expand_tilde(&server_cfg.store_path);
  if let Some(parent) = store_path.parent() {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  let registry = standard_registry().context("failed to build calculation registry")?;
  tracing::info!(calculations = registry.len(), "registered calculations");

  let engine = server_cfg.engine.clone();
  let service = RunService::new(
    Arc::new(store),
    Evaluator::new(Arc::new(registry)),
    Reconciler::new(engine.reconciliation_tolerance, standard_checks()),
    engine,
  );
  let state = AppState::new(service, AuthConfig {
    username:      server_cfg.admin_username.clone(),
    password_hash: server_cfg.admin_password_hash.clone(),
  });

  let app = reckon_api::api_router(state).layer(TraceLayer::new_for_http());
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}

/// Read a password from stdin.
fn rpassword_or_stdin() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  let stdin = io::stdin();
  print!("Password: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  stdin.lock().read_line(&mut line)?;
  Ok(
    line
      .trim_end_matches('\n')
      .trim_end_matches('\r')
      .to_string(),
  )
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_config(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("reckon-{name}-{}.toml", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
  }

  #[test]
  fn missing_file_uses_defaults() {
    let cfg = load_config(PathBuf::from("/nonexistent/reckon.toml")).unwrap();
    assert_eq!(cfg.host, "127.0.0.1");
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.admin_username, "admin");
    assert!(cfg.admin_password_hash.is_empty());
    assert_eq!(cfg.engine, EngineSettings::default());
  }

  #[test]
  fn file_overrides_defaults_and_engine_fields() {
    let path = write_config(
      "engine",
      r#"
port = 9090
store_path = "/tmp/reckon-test.db"

[engine]
max_horizon_periods = 10

[engine.retry]
max_attempts = 2
"#,
    );
    let cfg = load_config(path.clone()).unwrap();
    std::fs::remove_file(path).ok();

    assert_eq!(cfg.port, 9090);
    assert_eq!(cfg.store_path, PathBuf::from("/tmp/reckon-test.db"));
    assert_eq!(cfg.engine.max_horizon_periods, 10);
    assert_eq!(cfg.engine.period_months, 12);
    assert_eq!(cfg.engine.retry.max_attempts, 2);
    assert_eq!(cfg.engine.retry.base_delay_ms, 25);
  }

  #[test]
  fn tilde_expands_to_home() {
    let path = expand_tilde(Path::new("/abs/reckon.db"));
    assert_eq!(path, PathBuf::from("/abs/reckon.db"));
    if let Ok(home) = std::env::var("HOME") {
      assert_eq!(
        expand_tilde(Path::new("~/reckon.db")),
        PathBuf::from(home).join("reckon.db")
      );
    }
  }
}
