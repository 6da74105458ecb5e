use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use keymart_settlement::{
    clock::SystemClock,
    config::{self, AppConfig},
    db,
    events::{audit::TracingAuditSink, EventHandler, EventSender, LoggingEventHandler},
    services::{callback_signature::VnpaySignature, AppServices},
};

#[derive(Parser)]
#[command(
    name = "settlement-cli",
    about = "Operator tooling for the keymart settlement core",
    version
)]
struct Cli {
    #[arg(long, global = true, help = "Print results as JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Run a single expiry sweep
    ReapOnce,
    /// Process one batch of pending wallet payments
    DrainQueue,
    /// Show the status of an order
    OrderStatus(OrderArgs),
    /// Abort an order that is still awaiting payment
    Abort(AbortArgs),
    /// Credit a wallet with an idempotent top-up
    Credit(CreditArgs),
    /// Sign provider callback parameters with the configured hash secret
    SignCallback(SignArgs),
}

#[derive(Args)]
struct OrderArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid), help = "Order identifier (UUID)")]
    order_id: Uuid,
}

#[derive(Args)]
struct AbortArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid), help = "Order identifier (UUID)")]
    order_id: Uuid,
    #[arg(long, default_value = "operator_abort", help = "Reason recorded on the order")]
    reason: String,
}

#[derive(Args)]
struct CreditArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid), help = "Wallet owner (UUID)")]
    user_id: Uuid,
    #[arg(long, help = "Amount to credit")]
    amount: Decimal,
    #[arg(long, help = "Top-up reference; replays with the same value are ignored")]
    reference: String,
}

#[derive(Args)]
struct SignArgs {
    #[arg(help = "Callback parameters as key=value pairs")]
    params: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    match cli.command {
        Commands::SignCallback(args) => handle_sign(&cfg, args, cli.json),
        Commands::Migrate => {
            let pool = db::establish_connection_from_app_config(&cfg).await?;
            db::run_migrations(&pool).await?;
            println!("migrations applied");
            Ok(())
        }
        command => {
            let services = build_services(&cfg).await?;
            handle_service_command(&services, command, cli.json).await
        }
    }
}

async fn build_services(cfg: &AppConfig) -> Result<AppServices> {
    let pool = db::establish_connection_from_app_config(cfg)
        .await
        .context("failed to connect to the database")?;
    let (tx, rx) = mpsc::channel(cfg.event_channel_capacity);
    let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(LoggingEventHandler)];
    tokio::spawn(keymart_settlement::events::process_events(rx, handlers));

    AppServices::new(
        Arc::new(pool),
        cfg,
        Arc::new(SystemClock),
        EventSender::new(tx),
        Arc::new(TracingAuditSink),
    )
    .context("failed to build services")
}

async fn handle_service_command(services: &AppServices, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::ReapOnce => {
            let report = services.reaper.sweep().await?;
            emit(&report, json, |r| {
                format!(
                    "aborted {} orders ({} already terminal, {} orphans released, {} errors)",
                    r.orders_aborted, r.already_terminal, r.orphans_released, r.errors
                )
            })
        }
        Commands::DrainQueue => {
            let report = services.payment_queue.drain_once().await?;
            emit(&report, json, |r| {
                format!(
                    "completed {}, failed {}, skipped {}",
                    r.completed, r.failed, r.skipped
                )
            })
        }
        Commands::OrderStatus(args) => {
            let status = services.settlement.get_status(args.order_id).await?;
            emit(&status, json, |s| {
                format!(
                    "{} {} status={} state={} total={}",
                    s.order_id, s.order_code, s.status, s.settlement_state, s.total_amount
                )
            })
        }
        Commands::Abort(args) => {
            let outcome = services.settlement.abort(args.order_id, &args.reason).await?;
            emit(&outcome, json, |o| {
                if o.was_applied() {
                    format!("order {} aborted", o.order().order_id)
                } else {
                    format!(
                        "order {} already {}",
                        o.order().order_id,
                        o.order().settlement_state
                    )
                }
            })
        }
        Commands::Credit(args) => {
            if args.amount <= Decimal::ZERO {
                return Err(anyhow!("amount must be positive"));
            }
            let outcome = services
                .wallet
                .credit_wallet(args.user_id, args.amount, &format!("TOPUP:{}", args.reference))
                .await?;
            let snapshot = services.wallet.snapshot(args.user_id).await?;
            emit(&snapshot, json, |s| {
                format!("{:?}: balance={} available={}", outcome, s.balance, s.available)
            })
        }
        Commands::Migrate | Commands::SignCallback(_) => Ok(()),
    }
}

fn handle_sign(cfg: &AppConfig, args: SignArgs, json: bool) -> Result<()> {
    let params = parse_params(&args.params)?;
    let signer = VnpaySignature::new(cfg.payment_hash_secret.clone());
    let signature = signer.sign(&params)?;

    #[derive(Serialize)]
    struct Signed {
        canonical: String,
        signature: String,
    }
    let signed = Signed {
        canonical: VnpaySignature::canonicalize(&params),
        signature,
    };
    emit(&signed, json, |s| s.signature.clone())
}

fn parse_params(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("expected key=value, got '{}'", pair))
        })
        .collect()
}

fn emit<T: Serialize>(value: &T, json: bool, human: impl Fn(&T) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human(value));
    }
    Ok(())
}
