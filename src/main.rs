//! trustfulfill: fulfillment reconciliation daemon
//!
//! Runs the HTTP surface (webhooks, operator actions, dashboard reads) and the
//! periodic tasks:
//! - timeout reconciler (default every 60s, 5 minute confirmation deadline)
//! - trust streak recompute (default hourly)
//! - intervention pattern monitor (default every 5 minutes)
//! - order sync from the store platform (default every 5 minutes)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trustfulfill::api::{create_router, AppState};
use trustfulfill::config::Config;
use trustfulfill::db::shops::{self, NewShop};
use trustfulfill::fulfillment::{DryRunGateway, FulfillmentGateway, ShopifyGateway};
use trustfulfill::monitor::PatternMonitor;
use trustfulfill::reconciler::TimeoutReconciler;
use trustfulfill::sync::OrderSync;
use trustfulfill::tasks::TaskRunner;
use trustfulfill::trust::TrustLedger;
use trustfulfill::webhook::HmacSignatureVerifier;
use trustfulfill::{Clock, Store, SystemClock};

#[derive(Parser)]
#[command(name = "trustfulfill")]
#[command(about = "Two-phase order fulfillment reconciliation with trust-streak tracking")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "TRUSTFULFILL_CONFIG", default_value = "trustfulfill.toml")]
    config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "TRUSTFULFILL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP port (overrides config file)
    #[arg(long, env = "TRUSTFULFILL_HTTP_PORT")]
    http_port: Option<u16>,

    /// Shared secret for webhook signatures
    #[arg(long, env = "TRUSTFULFILL_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// Store platform Admin API access token
    #[arg(long, env = "TRUSTFULFILL_SHOPIFY_TOKEN", hide_env_values = true)]
    shopify_token: Option<String>,

    /// Enable development mode (fallback webhook secret, dry-run gateway without a token)
    #[arg(long, env = "TRUSTFULFILL_DEV_MODE", default_value = "false")]
    dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and periodic tasks (default)
    Serve,
    /// Run a single timeout reconciliation pass
    ReconcileOnce,
    /// Recompute every shop's trust streak once
    RecomputeStreaks,
    /// Pull today's orders from the store platform once
    SyncOrders {
        /// Only this shop (default: every shop)
        #[arg(long)]
        shop: Option<String>,
    },
    /// Register a shop
    RegisterShop {
        /// Store domain, e.g. acme.myshopify.com
        #[arg(long)]
        domain: String,

        /// Domestic country codes
        #[arg(long, value_delimiter = ',', default_value = "US,CA,PR")]
        domestic: Vec<String>,
    },
}

fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("trustfulfill={},info", log_level).into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let mut config = Config::load(&cli.config)?;

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(port) = cli.http_port {
        config.server.http_port = port;
    }
    if let Some(secret) = cli.webhook_secret {
        config.webhook.secret = Some(secret);
    }
    if let Some(token) = cli.shopify_token {
        config.shopify.access_token = Some(token);
    }
    if cli.dev_mode {
        config.dev_mode = true;
    }

    let store = Arc::new(Store::open(&config.storage.data_dir)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, store, clock).await,
        Command::ReconcileOnce => {
            let report = reconciler(&config, store, clock)?.run_once()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            report.into_result()?;
            Ok(())
        }
        Command::RecomputeStreaks => {
            let report = TrustLedger::new(store, clock).recompute_all()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::SyncOrders { shop } => {
            let sync = OrderSync::new(store, build_gateway(&config)?, clock);
            let report = match shop {
                Some(shop_id) => sync.sync_shop(&shop_id).await?,
                None => sync.sync_all().await?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::RegisterShop { domain, domestic } => {
            let input = NewShop {
                id: uuid::Uuid::new_v4().to_string(),
                external_store_ref: domain,
                domestic_countries: domestic,
            };
            let shop = store.with_conn(|conn| shops::insert_shop(conn, &input, clock.now()))?;
            println!("{}", shop.id);
            Ok(())
        }
    }
}

fn reconciler(
    config: &Config,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
) -> trustfulfill::Result<TimeoutReconciler> {
    let deadline = config.reconciler.confirmation_deadline()?;
    Ok(TimeoutReconciler::new(store, clock, deadline))
}

fn build_gateway(config: &Config) -> trustfulfill::Result<Arc<dyn FulfillmentGateway>> {
    match (&config.shopify.access_token, config.shopify.dry_run) {
        (Some(token), false) => Ok(Arc::new(ShopifyGateway::new(
            &config.shopify.api_version,
            token,
            Duration::from_millis(config.shopify.request_timeout_ms),
        )?)),
        _ => {
            info!("Using dry-run fulfillment gateway");
            Ok(Arc::new(DryRunGateway))
        }
    }
}

async fn serve(config: Config, store: Arc<Store>, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("Starting trustfulfill");
    info!("Data dir: {}", config.storage.data_dir.display());
    if config.dev_mode {
        warn!("Development mode enabled: do not use in production");
    }

    let gateway = build_gateway(&config)?;

    let secret = config
        .webhook_secret()
        .ok_or_else(|| anyhow::anyhow!("webhook secret is not configured"))?;
    let verifier = Arc::new(HmacSignatureVerifier::new(secret));

    let state = Arc::new(AppState::new(
        store.clone(),
        gateway.clone(),
        verifier,
        clock.clone(),
    ));

    // --- Periodic tasks ---
    let mut runner = TaskRunner::new();

    let timeouts = reconciler(&config, store.clone(), clock.clone())?;
    runner.spawn(
        "timeout-reconciler",
        Duration::from_secs(config.reconciler.interval_secs),
        move || {
            if let Err(e) = timeouts.run_once()?.into_result() {
                warn!(error = %e, "Reconciliation pass incomplete");
            }
            Ok(())
        },
    );

    let ledger = TrustLedger::new(store.clone(), clock.clone());
    runner.spawn(
        "trust-streaks",
        Duration::from_secs(config.trust.recompute_interval_secs),
        move || ledger.recompute_all().map(|_| ()),
    );

    let monitor = PatternMonitor::new(store.clone(), clock.clone(), config.monitor.thresholds()?);
    runner.spawn(
        "pattern-monitor",
        Duration::from_secs(config.monitor.interval_secs),
        move || monitor.run_once().map(|_| ()),
    );

    let order_sync = Arc::new(OrderSync::new(store.clone(), gateway, clock.clone()));
    runner.spawn_async(
        "order-sync",
        Duration::from_secs(config.sync.interval_secs),
        move || {
            let order_sync = Arc::clone(&order_sync);
            async move { order_sync.sync_all().await.map(|_| ()) }
        },
    );

    // --- HTTP ---
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.http_port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down periodic tasks");
    runner.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
