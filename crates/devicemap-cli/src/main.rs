//! devicemap - command line client for the device map backend.
//!
//! Signs in, keeps the session alive across runs, and exports device
//! locations (GeoJSON) and vector tiles for a map renderer.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use devicemap_core::auth::SystemClock;
use devicemap_core::models::BoundingBox;
use devicemap_core::{ApiClient, AuthError, Config, MapDataClient, SessionManager, SessionStatus};

#[derive(Debug, Parser)]
#[command(name = "devicemap", version, about = "Device location map client")]
struct Cli {
    /// Backend base URL (overrides the config file)
    #[arg(long, env = "DEVICEMAP_API_URL", global = true)]
    api_url: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Revoke and forget the stored session
    Logout,
    /// Show whether a session is stored and when it expires
    Status,
    /// Export device locations as GeoJSON
    Devices {
        /// Only keep devices inside minLon,minLat,maxLon,maxLat
        #[arg(long, allow_hyphen_values = true)]
        bbox: Option<BoundingBox>,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Download one vector tile
    Tile {
        z: u32,
        x: u32,
        y: u32,
        #[arg(long, short)]
        output: PathBuf,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let mut config = Config::load()?;
    if let Some(url) = cli.api_url.clone() {
        config.api_base_url = Some(url);
    }
    debug!(api = config.api_base_url(), store = ?config.token_store, "Configuration loaded");

    let api = ApiClient::new(config.api_base_url())?;
    let session = SessionManager::with_options(
        api,
        config.token_store()?,
        Arc::new(SystemClock),
        config.session_settings(),
    );

    match cli.command {
        Command::Login { email } => login(&session, config.last_email.clone(), email).await,
        Command::Logout => {
            session.logout().await;
            eprintln!("Logged out.");
            Ok(())
        }
        Command::Status => {
            println!("{}", describe_status(&session));
            Ok(())
        }
        Command::Devices { bbox, output } => devices(session, bbox, output.as_deref()).await,
        Command::Tile { z, x, y, output } => tile(session, z, x, y, &output).await,
    }
}

async fn login(
    session: &Arc<SessionManager>,
    last_email: Option<String>,
    email: Option<String>,
) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt_email(last_email.as_deref())?,
    };
    if email.is_empty() {
        anyhow::bail!("Email required");
    }
    let password = rpassword::prompt_password("Password: ")?;

    let user = session.login(&email, &password).await.map_err(explain)?;

    // Reload so a one-off --api-url is not persisted
    let mut config = Config::load()?;
    config.last_email = Some(email);
    config.save().context("Failed to save config")?;

    info!(user = %user.id, "Login successful");
    eprintln!("Logged in as {}.", user.display_name());
    Ok(())
}

fn prompt_email(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    Ok(match (input.is_empty(), last) {
        (true, Some(last)) => last.to_string(),
        _ => input.to_string(),
    })
}

/// Report the stored session without renewing it or arming the timer.
fn describe_status(session: &SessionManager) -> String {
    if session.access_token().is_none() || session.refresh_token().is_none() {
        return "Not logged in.".to_string();
    }
    let Some(expires_at) = session.expires_at() else {
        return "Stored session is incomplete. Run `devicemap login` to sign in again.".to_string();
    };
    if session.is_stale() {
        return format!(
            "Logged in. Access token expires at {}; it will be renewed on the next request.",
            expires_at.to_rfc3339()
        );
    }
    let minutes = session
        .time_until_expiry()
        .map(|d| d.num_minutes().max(0))
        .unwrap_or(0);
    format!(
        "Logged in. Access token expires at {} ({}m left).",
        expires_at.to_rfc3339(),
        minutes
    )
}

/// Restore the stored session or explain why there is none.
async fn restore(session: &Arc<SessionManager>) -> Result<()> {
    match session.initialize().await {
        SessionStatus::Restored => Ok(()),
        SessionStatus::NoSession(None) => Err(explain(AuthError::NoSession)),
        SessionStatus::NoSession(Some(e)) => Err(explain(e)),
    }
}

async fn devices(
    session: Arc<SessionManager>,
    bbox: Option<BoundingBox>,
    output: Option<&Path>,
) -> Result<()> {
    restore(&session).await?;
    let client = MapDataClient::new(session);

    let mut collection = client.fetch_devices().await.map_err(explain)?;
    if let Some(bbox) = bbox {
        collection = collection.within(&bbox);
        debug!(%bbox, kept = collection.len(), "Applied bounding box");
    }

    let json = serde_json::to_string_pretty(&collection)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => println!("{}", json),
    }

    eprintln!(
        "{} locations from {} devices.",
        collection.len(),
        collection.device_count()
    );
    Ok(())
}

async fn tile(session: Arc<SessionManager>, z: u32, x: u32, y: u32, output: &Path) -> Result<()> {
    restore(&session).await?;
    let client = MapDataClient::new(session);

    let bytes = client.fetch_tile(z, x, y).await.map_err(explain)?;
    std::fs::write(output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    eprintln!("Wrote tile {}/{}/{} ({} bytes) to {}.", z, x, y, bytes.len(), output.display());
    Ok(())
}

/// Attach a next step to errors that end the session.
fn explain(err: AuthError) -> anyhow::Error {
    if err.requires_login() {
        anyhow::anyhow!("{}. Run `devicemap login` to sign in again.", err)
    } else {
        err.into()
    }
}
