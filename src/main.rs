mod auth;
mod billing;
mod browser;
mod filter;
mod humanize;
mod lock;
mod notify;
mod outcome;
mod pages;
mod rows;
mod settings;
mod sheets;
mod timefmt;
mod totp;
mod worker;
mod workflow;
mod writer;

use browser::ProfileService;
use clap::Parser;
use eyre::{eyre, Result};
use fs2::FileExt;
use settings::KeeperConfig;
use sheets::{HttpSheetTransport, ServiceAccountKey, SheetError, SheetsClient};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use worker::{BrowserRunner, Worker};

#[derive(Parser, Debug)]
#[command(
    name = "premium-keeper",
    version,
    about = "Pauses and resumes YouTube Premium memberships on schedule, coordinated through a shared spreadsheet"
)]
struct Args {
    /// Spreadsheet id of the shared work ledger.
    #[arg(long, env = "GOOGLE_SHEETS_ID")]
    sheet_id: String,

    /// Path to the service-account key file for the spreadsheet backend.
    #[arg(long, env = "GOOGLE_SHEETS_CREDENTIALS")]
    credentials: PathBuf,

    /// Time zone all schedule math happens in.
    #[arg(long, env = "KEEPER_ZONE", default_value = "Asia/Seoul")]
    zone: String,

    /// Lock owner id. Defaults to <hostname>-<pid> so two machines never
    /// collide by accident.
    #[arg(long, env = "KEEPER_WORKER_ID")]
    worker_id: Option<String>,

    /// Tab holding the task rows.
    #[arg(long, default_value = "Integrated")]
    task_tab: String,

    /// Tab mapping emails to browser profile ids.
    #[arg(long, default_value = "Profiles")]
    mapping_tab: String,

    /// Key/value tab with the per-tick runtime parameters.
    #[arg(long, default_value = "Config")]
    config_tab: String,

    /// Host of the browser profile service.
    #[arg(long, default_value = "127.0.0.1")]
    profile_host: String,

    /// Candidate ports for the profile service, probed at startup.
    #[arg(long, value_delimiter = ',', default_value = "35000,36000,50325")]
    profile_ports: Vec<u16>,

    /// Webhook URL for out-of-band alerts. No webhook means log-only.
    #[arg(long, env = "KEEPER_WEBHOOK_URL")]
    webhook: Option<String>,

    /// Concurrent attempts. 1 (the common deployment) keeps rows
    /// strictly sequential.
    #[arg(long, default_value_t = 1)]
    pool: usize,

    /// Soft memory ceiling in MB for the recycle hint; 0 disables it.
    #[arg(long, default_value_t = 0)]
    memory_ceiling_mb: u64,

    /// Single-instance lock file.
    #[arg(long, default_value = "premium-keeper.lock")]
    lock_file: PathBuf,

    /// Run a single tick and exit.
    #[arg(long, env = "AUTO_EXIT_AFTER_TASK")]
    once: bool,

    /// Elect and log due rows; claim nothing, write nothing.
    #[arg(long)]
    dry_run: bool,

    /// Authenticate each due row and report, without touching the
    /// membership.
    #[arg(long, env = "LOGIN_MODE")]
    login_mode: bool,

    /// Dump resolved configuration and discovered tabs at startup.
    #[arg(long, env = "DEBUG_STARTUP")]
    debug_startup: bool,
}

fn build_config(args: &Args) -> Result<KeeperConfig> {
    let zone = KeeperConfig::parse_zone(&args.zone)?;
    let worker_id = args.worker_id.clone().unwrap_or_else(|| {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "keeper".to_string());
        format!("{host}-{}", std::process::id())
    });

    let cfg = KeeperConfig {
        spreadsheet_id: args.sheet_id.clone(),
        credentials_path: args.credentials.clone(),
        zone,
        worker_id,
        task_tab: args.task_tab.clone(),
        mapping_tab: args.mapping_tab.clone(),
        config_tab: args.config_tab.clone(),
        profile_host: args.profile_host.clone(),
        profile_ports: args.profile_ports.clone(),
        webhook_url: args.webhook.clone(),
        pool_size: args.pool,
        memory_ceiling_mb: args.memory_ceiling_mb,
        lock_file: args.lock_file.clone(),
        once: args.once,
        dry_run: args.dry_run,
        login_mode: args.login_mode,
        debug_startup: args.debug_startup,
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Startup transport checks: the spreadsheet must answer and carry the
/// required tabs before the loop starts.
async fn check_sheet(
    client: &SheetsClient<HttpSheetTransport>,
    cfg: &KeeperConfig,
) -> Result<Vec<String>, SheetError> {
    let tabs = client.list_tabs().await?;
    for tab in [&cfg.task_tab, &cfg.mapping_tab, &cfg.config_tab] {
        client.ensure_tab(tab).await?;
    }
    Ok(tabs)
}

async fn run(cfg: Arc<KeeperConfig>) -> Result<ExitCode> {
    // Single-instance guard: one keeper per lock file. Prevents two
    // processes sharing a worker id and a profile service by accident.
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&cfg.lock_file)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", cfg.lock_file.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "keeper already running or lock unavailable ({}): {e}",
            cfg.lock_file.display()
        )
    })?;
    let _lock_guard = lock_file;

    let key = ServiceAccountKey::load(&cfg.credentials_path)?;
    let transport = HttpSheetTransport::new(cfg.spreadsheet_id.clone(), key)?;
    let client = Arc::new(SheetsClient::new(transport));

    let tabs = match check_sheet(&client, &cfg).await {
        Ok(tabs) => tabs,
        Err(err) => {
            tracing::error!(error = %err, "spreadsheet unreachable at startup");
            return Ok(ExitCode::from(2));
        }
    };

    let service = match ProfileService::discover(&cfg.profile_host, &cfg.profile_ports).await {
        Ok(service) => service,
        Err(err) => {
            tracing::error!(error = %err, "profile service not found at startup");
            return Ok(ExitCode::from(2));
        }
    };

    if cfg.debug_startup {
        tracing::info!(?cfg, ?tabs, "startup configuration");
    }

    tracing::info!(
        worker_id = %cfg.worker_id,
        zone = %cfg.zone,
        task_tab = %cfg.task_tab,
        pool = cfg.pool_size,
        once = cfg.once,
        dry_run = cfg.dry_run,
        login_mode = cfg.login_mode,
        "keeper starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received; finishing current attempt");
        let _ = shutdown_tx.send(true);
        // Keep the sender alive so the receiver's `changed()` stays
        // meaningful until the loop exits.
        std::future::pending::<()>().await;
    });

    let runner = Arc::new(BrowserRunner::new(service, cfg.memory_ceiling_mb));
    let mut worker = Worker::new(cfg, client, runner, shutdown_rx);
    worker.run().await?;

    tracing::info!("keeper stopped cleanly");
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable; SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = match build_config(&args) {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            tracing::error!(error = %err, "configuration invalid");
            return ExitCode::from(1);
        }
    };

    match run(cfg).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "fatal configuration error");
            ExitCode::from(1)
        }
    }
}
