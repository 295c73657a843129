//! storefront - command-line host for the storefront session client.
//!
//! Signs in, inspects the session, and issues authenticated requests. The
//! `watch` command keeps the session alive in the foreground, printing
//! renewals and notices as they happen.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use storefront_core::api::ApiRequest;
use storefront_core::auth::{ChannelNotifier, Notice, NoticeLevel, SessionEvent};
use storefront_core::{App, Config};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

const ENV_EMAIL: &str = "STOREFRONT_EMAIL";
const ENV_PASSWORD: &str = "STOREFRONT_PASSWORD";
const ENV_LOG_FILE: &str = "STOREFRONT_LOG_FILE";

/// How often `watch` checks for a credential that expired while suspended
const FOREGROUND_CHECK_SECS: u64 = 60;

const USAGE: &str = "\
Usage: storefront <command>

Commands:
  login [email]           Sign in (password from STOREFRONT_PASSWORD or prompt)
  register <name> <email> Create an account and sign in
  status                  Show the current session
  profile                 Fetch and show the signed-in user's profile
  get <path>              GET an API path with the session credential
  logout                  Sign out
  watch                   Keep the session alive, printing events until Ctrl-C
";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login { email: Option<String> },
    Register { name: String, email: String },
    Status,
    Profile,
    Get { path: String },
    Logout,
    Watch,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut args = args.iter().map(String::as_str);
    let command = match args.next() {
        None | Some("help" | "--help" | "-h") => Command::Help,
        Some("login") => Command::Login {
            email: args.next().map(str::to_string),
        },
        Some("register") => match (args.next(), args.next()) {
            (Some(name), Some(email)) => Command::Register {
                name: name.to_string(),
                email: email.to_string(),
            },
            _ => bail!("register needs <name> <email>"),
        },
        Some("status") => Command::Status,
        Some("profile") => Command::Profile,
        Some("get") => match args.next() {
            Some(path) if path.starts_with('/') => Command::Get {
                path: path.to_string(),
            },
            Some(path) => Command::Get {
                path: format!("/{}", path),
            },
            None => bail!("get needs <path>"),
        },
        Some("logout") => Command::Logout,
        Some("watch") => Command::Watch,
        Some(other) => bail!("Unknown command: {}\n\n{}", other, USAGE),
    };
    Ok(command)
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr; set `STOREFRONT_LOG_FILE` to also write them to a file.
/// The returned guard must live until exit so the file writer flushes.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_FILE) {
        Ok(path) if !path.is_empty() => {
            let path = Path::new(&path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "storefront.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if command == Command::Help {
        print!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env();
    info!(api = %config.api_base_url, storage = ?config.storage, "Storefront starting");

    let (notifier, mut notices) = ChannelNotifier::new();
    let app = App::from_config_with_notifier(config.clone(), Arc::new(notifier))?;
    app.restore();

    let result = run(&app, &mut config, command, &mut notices).await;

    while let Ok(notice) = notices.try_recv() {
        print_notice(&notice);
    }
    app.shutdown();
    result
}

async fn run(
    app: &App,
    config: &mut Config,
    command: Command,
    notices: &mut mpsc::UnboundedReceiver<Notice>,
) -> Result<()> {
    match command {
        Command::Login { email } => login(app, config, email).await,
        Command::Register { name, email } => register(app, config, &name, &email).await,
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&app.snapshot())?);
            Ok(())
        }
        Command::Profile => {
            require_session(app)?;
            let profile = app.fetch_profile().await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(())
        }
        Command::Get { path } => {
            let response = app.api().execute(ApiRequest::get(path)).await?;
            match serde_json::from_str::<serde_json::Value>(&response.body) {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", response.body),
            }
            Ok(())
        }
        Command::Logout => {
            app.logout().await;
            Ok(())
        }
        Command::Watch => watch(app, notices).await,
        Command::Help => Ok(()),
    }
}

fn require_session(app: &App) -> Result<()> {
    if !app.snapshot().is_authenticated {
        bail!("Not signed in. Run 'storefront login' first.");
    }
    Ok(())
}

// ============================================================================
// Sign-in
// ============================================================================

fn prompt(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(default) => print!("{} [{}]: ", label, default),
        None => print!("{}: ", label),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim();
    match (value.is_empty(), default) {
        (true, Some(default)) => Ok(default.to_string()),
        (true, None) => bail!("{} is required", label),
        (false, _) => Ok(value.to_string()),
    }
}

fn password_from_env_or_prompt() -> Result<String> {
    if let Ok(password) = std::env::var(ENV_PASSWORD) {
        if !password.is_empty() {
            return Ok(password);
        }
    }
    let password = rpassword::prompt_password("Password: ")?;
    if password.is_empty() {
        bail!("Password is required");
    }
    Ok(password)
}

fn remember_email(config: &mut Config, email: &str) {
    config.last_email = Some(email.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

fn print_signed_in(app: &App) {
    let snapshot = app.snapshot();
    let who = snapshot
        .user
        .as_ref()
        .map(|u| u.display_name.clone().unwrap_or_else(|| u.email.clone()))
        .unwrap_or_else(|| "user".to_string());
    println!("Signed in as {}", who);
}

async fn login(app: &App, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| std::env::var(ENV_EMAIL).ok()) {
        Some(email) => email,
        None => prompt("Email", config.last_email.as_deref())?,
    };
    let password = password_from_env_or_prompt()?;

    println!("Logging in...");
    if let Err(e) = app.login(&email, &password).await {
        bail!(e.user_message());
    }
    remember_email(config, &email);
    print_signed_in(app);
    Ok(())
}

async fn register(app: &App, config: &mut Config, name: &str, email: &str) -> Result<()> {
    let password = password_from_env_or_prompt()?;
    if std::env::var(ENV_PASSWORD).is_err() {
        let confirm = rpassword::prompt_password("Confirm password: ")?;
        if confirm != password {
            bail!("Passwords do not match");
        }
    }

    if let Err(e) = app.register(name, email, &password).await {
        bail!(e.user_message());
    }
    remember_email(config, email);
    print_signed_in(app);
    Ok(())
}

// ============================================================================
// Watch
// ============================================================================

fn print_notice(notice: &Notice) {
    let tag = match notice.level {
        NoticeLevel::Info => "info",
        NoticeLevel::Warning => "warning",
        NoticeLevel::Error => "error",
    };
    eprintln!("[{}] {}", tag, notice.message);
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::LoggedIn => "signed in".to_string(),
        SessionEvent::Restored => "session restored".to_string(),
        SessionEvent::LoginFailed { message } => format!("login failed: {}", message),
        SessionEvent::CredentialRenewed => "credential renewed".to_string(),
        SessionEvent::RenewalFailed { message } => format!("renewal failed: {}", message),
        SessionEvent::ProfileLoaded => "profile loaded".to_string(),
        SessionEvent::LoggedOut { reason } => format!("signed out ({})", reason),
    }
}

async fn watch(app: &App, notices: &mut mpsc::UnboundedReceiver<Notice>) -> Result<()> {
    require_session(app)?;
    let mut events = app.subscribe();
    let mut foreground = tokio::time::interval(Duration::from_secs(FOREGROUND_CHECK_SECS));

    if let Some(expires_at) = app.snapshot().expires_at {
        println!("Watching session (credential expires at {}). Ctrl-C to stop.", expires_at);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(notice) = notices.recv() => print_notice(&notice),
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", describe(&event));
                    if matches!(event, SessionEvent::LoggedOut { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = foreground.tick() => {
                // Catches credentials that expired while the machine slept
                if let Some(Err(e)) = app.on_foreground().await {
                    warn!(error = %e, "Renewal after wake failed");
                }
            }
        }
    }
    Ok(())
}
