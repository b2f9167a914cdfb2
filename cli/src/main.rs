// cli/src/main.rs

//! vpsdeck CLI - launch, watch and stop rented VPS sessions
//!
//! Every command talks to the backend through the shared engine.

mod dashboard;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vpsdeck::config::{CLI_VERSION, LAUNCH_WAIT_TIMEOUT_SECS, backend_url};
use vpsdeck::credentials::{Credentials, read_credentials, remove_credentials, resolve_token, write_credentials};
use vpsdeck::idempotency::UuidKeyGenerator;
use vpsdeck::lifecycle::refetch_interval;
use vpsdeck::poller::{LogView, PollerExit};
use vpsdeck::transport::HttpBackend;
use vpsdeck::variant::{Variant, product_variant, resolve_variant};
use vpsdeck::Engine;
use vpsdeck_common::Session;

#[derive(Parser)]
#[command(
    name = "vpsdeck",
    about = "vpsdeck - launch and watch rented VPS sessions",
    disable_version_flag = true,
    version = CLI_VERSION
)]
struct Cli {
    #[arg(long = "version", short = 'v')]
    version: bool,

    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Save an API token for later commands
    Login {
        /// Bearer token issued by the dashboard
        #[arg(long)]
        token: String,
    },
    /// Remove the saved API token
    Logout,
    /// List the products that can be launched
    Products {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// List your sessions, most urgent first
    Ls {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Launch a new session
    Launch {
        /// linux, windows, dummy or a numeric action code
        variant: Variant,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
        /// Wait until the session leaves pending/provisioning
        #[arg(long)]
        wait: bool,
    },
    /// Stop a session
    Stop {
        session_id: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print a session's provisioning log
    Log {
        session_id: String,
        /// Keep printing new output until the session ends
        #[arg(long, short = 'f')]
        follow: bool,
    },
    /// Show the coin balance
    Wallet {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Redeem a gift code
    Redeem { code: String },
    /// Interactive session dashboard
    Dashboard,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Login { .. } => "login",
            Commands::Logout => "logout",
            Commands::Products { .. } => "products",
            Commands::Ls { .. } => "ls",
            Commands::Launch { .. } => "launch",
            Commands::Stop { .. } => "stop",
            Commands::Log { .. } => "log",
            Commands::Wallet { .. } => "wallet",
            Commands::Redeem { .. } => "redeem",
            Commands::Dashboard => "dashboard",
        }
    }
}

#[derive(Serialize)]
struct ProductRow<'a> {
    id: &'a str,
    name: &'a str,
    variant: String,
    price_coins: i64,
    /// `None` when the capacity check could not be answered.
    available: Option<bool>,
}

async fn login(token: String) -> Result<()> {
    let credentials = Credentials::new(token);
    if credentials.token.is_empty() {
        bail!("token must not be empty");
    }
    write_credentials(&credentials).await?;
    println!("Token saved.");
    Ok(())
}

async fn logout() -> Result<()> {
    if read_credentials().await.is_err() {
        println!("No saved token");
        return Ok(());
    }
    remove_credentials().await?;
    println!("Logged out (local token removed).");
    Ok(())
}

async fn products(engine: &Engine, json: bool) -> Result<()> {
    let products = engine.refresh_products().await?;
    let availability = match engine.availability(None).await {
        Ok(availability) => Some(availability),
        Err(e) => {
            warn!("availability check failed: {}", e);
            None
        }
    };
    let rows: Vec<ProductRow> = products
        .iter()
        .filter(|p| p.is_active())
        .map(|p| ProductRow {
            id: &p.id,
            name: &p.name,
            variant: product_variant(p).to_string(),
            price_coins: p.price_coins,
            available: availability.as_ref().map(|a| a.product_available(&p.id)),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No products available.");
        return Ok(());
    }
    println!("{:<12} {:<10} {:>6}  {:<9} NAME", "ID", "VARIANT", "PRICE", "CAPACITY");
    for row in rows {
        let capacity = match row.available {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        println!(
            "{:<12} {:<10} {:>6}  {:<9} {}",
            row.id, row.variant, row.price_coins, capacity, row.name
        );
    }
    Ok(())
}

fn print_session_table(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }
    println!("{:<14} {:<8} {:<13} CREATED", "ID", "VARIANT", "STATUS");
    for s in sessions {
        let created = s
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<8} {:<13} {}",
            s.id,
            resolve_variant(s).label(),
            s.status,
            created
        );
    }
}

fn print_session(session: &Session) {
    println!("Session: {}", session.id);
    println!("Variant: {}", resolve_variant(session).label());
    println!("Status:  {}", session.status);
    if let Some(rdp) = &session.rdp {
        if let Some(host) = &rdp.host {
            println!("RDP:     {}:{}", host, rdp.port.unwrap_or(3389));
        }
        if let Some(user) = &rdp.user {
            println!("User:    {}", user);
        }
        if let Some(password) = &rdp.password {
            println!("Password: {}", password);
        }
    }
}

async fn ls(engine: &Engine, json: bool) -> Result<()> {
    let sessions = engine.refresh_sessions().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        print_session_table(&sessions);
    }
    Ok(())
}

async fn launch(engine: &Engine, variant: Variant, json: bool, wait: bool) -> Result<()> {
    let mut session = engine.launch(variant).await?;
    info!("launched session {}", session.id);

    if wait && session.status.is_in_progress() {
        session = wait_until_settled(engine, session).await?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else {
        println!("✅ Session created: {}", session.id);
        print_session(&session);
    }
    Ok(())
}

async fn wait_until_settled(engine: &Engine, launched: Session) -> Result<Session> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    let start = Instant::now();
    let deadline = start + Duration::from_secs(LAUNCH_WAIT_TIMEOUT_SECS);
    let mut current = launched;

    loop {
        spinner.set_message(format!(
            "Session {} is {}... {}s elapsed",
            current.id,
            current.status,
            start.elapsed().as_secs()
        ));
        if !current.status.is_in_progress() {
            spinner.finish_and_clear();
            return Ok(current);
        }
        if Instant::now() >= deadline {
            spinner.finish_and_clear();
            bail!(
                "timed out waiting for session {}; check later with `vpsdeck ls`",
                current.id
            );
        }

        let wait = refetch_interval(&current.status)
            .duration()
            .unwrap_or(Duration::from_secs(4));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                spinner.finish_and_clear();
                println!("\nStopped waiting; the session keeps provisioning.");
                return Ok(current);
            }
            _ = tokio::time::sleep(wait) => {}
        }

        match engine.fetch_session(&current.id).await {
            Ok(latest) => current = latest,
            Err(e) => warn!("session refresh failed: {}", e),
        }
    }
}

async fn stop(engine: &Engine, session_id: &str, json: bool) -> Result<()> {
    let session = engine.stop(session_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else {
        println!("Session {} is now {}.", session.id, session.status);
    }
    Ok(())
}

async fn log(engine: &Engine, session_id: &str, follow: bool) -> Result<()> {
    engine.refresh_sessions().await?;
    let session = engine
        .session(session_id)
        .ok_or_else(|| anyhow!("session {} not found", session_id))?;

    if engine.log_view(session_id) == LogView::Unavailable {
        println!("Logs are not available for session {}.", session_id);
        return Ok(());
    }

    if !follow {
        let text = engine.refresh_log(session_id).await?.unwrap_or_default();
        print!("{}", text);
        if !text.ends_with('\n') && !text.is_empty() {
            println!();
        }
        return Ok(());
    }

    follow_log(engine, session).await
}

async fn follow_log(engine: &Engine, session: Session) -> Result<()> {
    let cancel = CancellationToken::new();
    let refresher = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run_session_refresh(cancel).await }
    });

    let mut poller = engine.watch_log(&session.id);
    let mut log_rx = engine.cache().session_log(&session.id).subscribe();
    let mut printed = String::new();

    let exit = loop {
        tokio::select! {
            exit = poller.wait() => break exit,
            changed = log_rx.changed() => {
                if changed.is_err() {
                    break PollerExit::Cancelled;
                }
                let text = log_rx.borrow_and_update().data.clone().unwrap_or_default();
                print_new_output(&mut printed, text)?;
            }
            _ = tokio::signal::ctrl_c() => break PollerExit::Cancelled,
        }
    };

    cancel.cancel();
    let _ = refresher.await;

    if exit == PollerExit::Terminal {
        if let Some(text) = engine.cache().session_log(&session.id).data() {
            print_new_output(&mut printed, text)?;
        }
        let status = engine
            .session(&session.id)
            .map(|s| s.status.to_string())
            .unwrap_or_else(|| "gone".to_string());
        println!("\nSession {} is {}.", session.id, status);
    }
    Ok(())
}

// Prints only what was appended since the last call; a rewritten log is
// printed in full.
fn print_new_output(printed: &mut String, text: String) -> Result<()> {
    let mut stdout = std::io::stdout();
    match text.strip_prefix(printed.as_str()) {
        Some(tail) => stdout.write_all(tail.as_bytes())?,
        None => stdout.write_all(text.as_bytes())?,
    }
    stdout.flush().context("flush stdout")?;
    *printed = text;
    Ok(())
}

async fn wallet(engine: &Engine, json: bool) -> Result<()> {
    let wallet = engine.refresh_wallet().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&wallet)?);
    } else {
        println!("Balance: {} coins", wallet.balance);
    }
    Ok(())
}

async fn redeem(engine: &Engine, code: &str) -> Result<()> {
    let response = engine.redeem_gift_code(code).await?;
    match (&response.gift_title, response.added) {
        (Some(title), Some(added)) => println!("🎁 {}: +{} coins", title, added),
        (None, Some(added)) => println!("🎁 +{} coins", added),
        _ => println!("{}", response.message.as_deref().unwrap_or("Gift code redeemed.")),
    }
    let balance = engine
        .cache()
        .wallet()
        .data()
        .map(|w| w.balance)
        .or(response.balance);
    if let Some(balance) = balance {
        println!("Balance: {} coins", balance);
    }
    Ok(())
}

async fn build_engine() -> Result<Engine> {
    let client = HttpBackend::build_client()?;
    let token = resolve_token().await;
    if token.is_none() {
        warn!("no API token configured; run `vpsdeck login --token <TOKEN>`");
    }
    let backend = HttpBackend::new(client, backend_url(), token);
    Ok(Engine::new(Arc::new(backend), Arc::new(UuidKeyGenerator)))
}

async fn run(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Login { token } => login(token).await,
        Commands::Logout => logout().await,
        Commands::Products { json } => products(&build_engine().await?, json).await,
        Commands::Ls { json } => ls(&build_engine().await?, json).await,
        Commands::Launch { variant, json, wait } => {
            launch(&build_engine().await?, variant, json, wait).await
        }
        Commands::Stop { session_id, json } => stop(&build_engine().await?, &session_id, json).await,
        Commands::Log { session_id, follow } => log(&build_engine().await?, &session_id, follow).await,
        Commands::Wallet { json } => wallet(&build_engine().await?, json).await,
        Commands::Redeem { code } => redeem(&build_engine().await?, &code).await,
        Commands::Dashboard => {
            let engine = build_engine().await?;
            dashboard::Dashboard::new(engine).run().await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The dashboard owns the terminal; log lines would corrupt the screen.
    let quiet = matches!(cli.cmd, Some(Commands::Dashboard));
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if quiet {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    if std::env::var("RUST_LOG")
        .ok()
        .map(|value| value.to_lowercase().contains("debug"))
        .unwrap_or(false)
    {
        eprintln!("⚠️ Debug logging is enabled; API tokens may appear in logs. Proceed carefully.");
    }

    if cli.version {
        println!("vpsdeck version {}", CLI_VERSION);
        return Ok(());
    }

    let cmd = match cli.cmd {
        Some(cmd) => cmd,
        None => {
            Cli::command().print_help().ok();
            println!();
            return Ok(());
        }
    };

    let name = cmd.name();
    let quiet = matches!(cmd, Commands::Dashboard);
    if let Err(e) = run(cmd).await {
        if quiet {
            eprintln!("{} failed: {:#}", name, e);
        } else {
            error!("{} failed: {:#}", name, e);
        }
        std::process::exit(1);
    }

    Ok(())
}
