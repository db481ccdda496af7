mod commands;
mod gateway;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wabridge_accounts::{AccountManager, ManagerDeps, Reconciler, Timings};
use wabridge_channels::{client_factory, TelegramChannel};
use wabridge_core::{
    config::{self, Config},
    paths::PathResolver,
};
use wabridge_store::{validate_device_store, Catalog};

#[derive(Parser)]
#[command(
    name = "wabridge",
    version,
    about = "Manage WhatsApp groups across many accounts from Telegram"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: config/config.json, then akses.json).
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Directory holding bot_data.db and the per-operator folders.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot (default).
    Start,
    /// Print the account catalog and store health without connecting.
    Status,
    /// Reconcile disk and catalog offline and print the report.
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = config::resolve_path(cli.config.as_deref())?;
    let cfg = config::load(&config_path)?;
    let _guard = init_logging(&cli.root, &cfg.settings.log_level);
    info!("config loaded from {}", config_path.display());

    let paths = Arc::new(PathResolver::new(cli.root.clone()));
    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start(cfg, paths).await,
        Commands::Status => status(&cfg, &paths).await,
        Commands::Reconcile => {
            let catalog = Catalog::open(&paths.master_db_path()).await?;
            let report = Reconciler::new(&catalog, &paths).run().await;
            catalog.close().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Stderr plus a daily file under `<root>/logs`. `RUST_LOG` wins over the
/// configured level.
fn init_logging(root: &Path, level: &str) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = tracing_appender::rolling::daily(root.join("logs"), "wabridge.log");
    let (writer, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    guard
}

async fn start(cfg: Config, paths: Arc<PathResolver>) -> anyhow::Result<()> {
    let telegram = Arc::new(TelegramChannel::new(&cfg.telegram_token));
    let bot_name = telegram.get_me().await?;
    info!("telegram bot @{bot_name} authenticated");

    let catalog = Catalog::open(&paths.master_db_path()).await?;
    let manager = AccountManager::new(ManagerDeps {
        catalog,
        paths,
        factory: client_factory(),
        notifier: telegram.clone(),
        timings: Timings::default(),
        max_accounts: cfg.settings.max_accounts,
    });

    let gw = Arc::new(gateway::Gateway::new(
        cfg,
        manager,
        telegram.clone(),
        Some(telegram),
    ));
    gw.run().await
}

async fn status(cfg: &Config, paths: &PathResolver) -> anyhow::Result<()> {
    let catalog = Catalog::open(&paths.master_db_path()).await?;
    let accounts = catalog.list().await?;
    println!("wabridge status\n");
    println!("Root: {}", paths.root().display());
    println!(
        "Operators: {} | max accounts: {}",
        cfg.operators().len(),
        cfg.settings.max_accounts
    );
    println!("\nAccounts ({}):", accounts.len());
    for account in &accounts {
        let device = validate_device_store(Path::new(&account.upstream_db_path)).await;
        let bot = if Path::new(&account.bot_db_path).is_file() {
            "ok"
        } else {
            "missing"
        };
        println!(
            "  #{} +{} [{}] operator {} | device store: {device} | bot data: {bot}",
            account.id,
            account.phone,
            account.status.as_str(),
            account
                .operator_id()
                .map_or_else(|| "?".to_string(), |id| id.to_string()),
        );
    }
    catalog.close().await;
    Ok(())
}
