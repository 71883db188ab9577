use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokenwarden::browser::chrome::ChromeLauncher;
use tokenwarden::cache::TokenCache;
use tokenwarden::config::{default_config_path, Config};
use tokenwarden::credentials::{CredentialStore, CAPTCHA_API_KEY};
use tokenwarden::duration::format_duration;
use tokenwarden::login::{BrowserAuthenticator, LoginFlow, LoginMode, LoginSettings};
use tokenwarden::manager::{ManagerSettings, TokenManager, TokenStatus};
use tokenwarden::solver::{ChallengeSolver, TwoCaptchaClient, TwoCaptchaConfig};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str =
    "info,chromiumoxide=warn,chromiumoxide::conn=off,chromiumoxide::handler=off";

#[derive(Parser)]
#[command(name = "tokenwarden")]
#[command(about = "Keeps a bearer token for a challenge-protected web app fresh")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show the browser window during automated logins
    #[arg(long, global = true)]
    visible: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print a valid token, logging in first if needed (default)
    Token,
    /// Log in now
    Login {
        /// Log in even if the cached token is still valid
        #[arg(long)]
        force: bool,
        /// Open a browser window and wait for a human to log in
        #[arg(long)]
        manual: bool,
    },
    /// Show the cached token's expiry
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Delete the cached token
    Clear,
    /// Show the solving service balance
    Balance,
    /// Store a token obtained elsewhere
    Import { token: String },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

async fn build_solver(config: &Config, store: &dyn CredentialStore) -> Option<Arc<dyn ChallengeSolver>> {
    let api_key = match store.get(CAPTCHA_API_KEY).await {
        Ok(Some(key)) if !key.expose_secret().trim().is_empty() => key,
        Ok(_) => {
            warn!("No solver API key configured; challenges can't be solved");
            return None;
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to read solver API key");
            return None;
        }
    };

    let solver_config = TwoCaptchaConfig {
        method: config.solver.method.clone(),
        poll_interval: config.solver.poll_interval,
        request_timeout: config.solver.request_timeout,
    };
    match TwoCaptchaClient::new(api_key, solver_config) {
        Ok(client) => Some(Arc::new(client.with_base_url(&config.solver.base_url))),
        Err(err) => {
            warn!(error = %err, "Failed to create solver HTTP client");
            None
        }
    }
}

/// Build the manager. `interactive` wires up the browser and solver; plain
/// cache operations don't need either.
async fn build_manager(
    config: &Config,
    visible: bool,
    interactive: bool,
) -> TokenManager {
    let cache = match &config.cache_path {
        Some(path) => TokenCache::with_path(path),
        None => TokenCache::new(),
    };
    debug!(path = %cache.path().display(), "Using token cache");

    let mut manager =
        TokenManager::new(cache, ManagerSettings::from_config(config));
    if !interactive {
        return manager;
    }

    let store: Arc<dyn CredentialStore> = Arc::from(config.credentials.build());
    let solver = build_solver(config, store.as_ref()).await;

    let mut launcher = ChromeLauncher::new();
    if let Some(dir) = &config.profile_dir {
        launcher = launcher.with_profile_dir(dir);
    }
    if let Some(exe) = &config.chrome_executable {
        launcher = launcher.with_executable(exe);
    }

    let mut flow = LoginFlow::new(LoginSettings::from_config(config));
    if let Some(solver) = &solver {
        flow = flow.with_solver(solver.clone());
        manager = manager.with_solver(solver.clone());
    }

    let authenticator = BrowserAuthenticator::new(Arc::new(launcher), flow, store)
        .headless(config.headless && !visible)
        .min_balance(config.solver.min_balance);

    manager.with_authenticator(Arc::new(authenticator))
}

fn print_status(status: &TokenStatus) {
    println!("Token:   {}", status.preview);
    println!(
        "Expires: {} ({} left{})",
        status.expiry.format("%Y-%m-%d %H:%M:%S UTC"),
        format_duration(status.remaining),
        if status.expiry_assumed { ", assumed" } else { "" }
    );
    println!("Updated: {}", status.updated.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Valid:   {}", if status.valid { "yes" } else { "no (renewal due)" });
    if !status.persisted {
        println!("Warning: token not saved to the cache file");
    }
}

fn status_json(status: Option<&TokenStatus>) -> serde_json::Value {
    match status {
        Some(s) => serde_json::json!({
            "present": true,
            "valid": s.valid,
            "expiry": s.expiry.to_rfc3339(),
            "expiry_assumed": s.expiry_assumed,
            "updated": s.updated.to_rfc3339(),
            "remaining_secs": s.remaining.as_secs(),
            "token_preview": s.preview,
            "persisted": s.persisted,
        }),
        None => serde_json::json!({ "present": false, "valid": false }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;

    let command = cli.command.unwrap_or(Command::Token);
    let interactive = matches!(command, Command::Token | Command::Login { .. } | Command::Balance);
    let manager = build_manager(&config, cli.visible, interactive).await;

    let cancel = manager.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    match command {
        Command::Token => {
            let token = manager.get_token().await?;
            println!("{token}");
        }
        Command::Login { force, manual } => {
            let mode = if manual {
                LoginMode::Manual
            } else {
                LoginMode::Automated
            };
            manager.login_with(mode, force).await?;
            if let Some(status) = manager.status().await {
                print_status(&status);
            }
        }
        Command::Status { json } => {
            let status = manager.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status_json(status.as_ref()))?);
            } else {
                match status {
                    Some(status) => print_status(&status),
                    None => println!("No cached token ({})", manager.cache().path().display()),
                }
            }
        }
        Command::Clear => {
            manager.clear_cache().await?;
            println!("Cleared {}", manager.cache().path().display());
        }
        Command::Balance => {
            let balance = manager.get_balance().await?;
            println!("{balance}");
        }
        Command::Import { token } => {
            let status = manager.import_token(&token).await?;
            print_status(&status);
        }
    }

    Ok(())
}
