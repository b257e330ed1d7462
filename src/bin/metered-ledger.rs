use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metered_ledger::{
    IdeogramClient, Ledger, LedgerConfig, LedgerError, LedgerStore, PaymentStatus,
    PaymentVerifier, SqliteStore, StripeClient, VerifyError,
};

#[derive(Parser, Debug)]
#[command(version, about = "Operator tooling for the metered access ledger")]
struct Args {
    /// TOML config file; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `database_path` from the config.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Use a Postgres database instead of the SQLite file.
    #[cfg(feature = "store-postgres")]
    #[arg(long)]
    postgres_url: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema.
    Init,
    /// Print an account's balance.
    Balance { account: String },
    /// Credit an account outside the payment flow.
    Grant {
        account: String,
        credits: u64,
        #[arg(long)]
        note: Option<String>,
    },
    /// Confirm a checkout session and credit its account once.
    Reconcile { reference: String },
    /// Show recent balance changes for an account.
    History {
        account: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show recent generation attempts.
    Audit {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Only attempts at or after this unix timestamp in milliseconds.
        #[arg(long)]
        since_ms: Option<u64>,
    },
    /// Refund debits left pending longer than the given age.
    Sweep {
        /// Must be at least the upstream timeout plus 30s, which is also the
        /// default.
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Create a hosted checkout session for a credit plan.
    Checkout {
        plan: String,
        account: String,
        #[arg(long)]
        success_url: String,
        #[arg(long)]
        cancel_url: String,
    },
}

/// Stand-in verifier when no processor key is configured.
struct Unconfigured;

#[async_trait::async_trait]
impl PaymentVerifier for Unconfigured {
    async fn verify_payment(&self, _reference: &str) -> Result<PaymentStatus, VerifyError> {
        Err(VerifyError::Transport(
            "payment processor is not configured".to_string(),
        ))
    }
}

async fn open_store(
    args: &Args,
    config: &LedgerConfig,
) -> Result<Arc<dyn LedgerStore>, Box<dyn std::error::Error + Send + Sync>> {
    #[cfg(feature = "store-postgres")]
    if let Some(url) = args.postgres_url.as_deref() {
        let store = metered_ledger::PostgresStore::connect(url, 16).await?;
        store.init().await?;
        return Ok(Arc::new(store));
    }
    #[cfg(not(feature = "store-postgres"))]
    let _ = args;

    let store = SqliteStore::new(&config.database_path);
    store.init().await?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    metered_ledger::telemetry::init_tracing(args.json_logs)?;

    let mut config = match args.config.as_deref() {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    if let Some(database) = args.database.clone() {
        config.database_path = database;
    }

    let store = open_store(&args, &config).await?;
    if matches!(args.command, Command::Init) {
        println!("initialized");
        return Ok(());
    }

    let stripe = match config.stripe_secret_key() {
        Ok(key) => Some(StripeClient::from_config(
            &config.stripe,
            key,
            config.lookup_timeout(),
        )?),
        Err(_) => None,
    };
    let verifier: Arc<dyn PaymentVerifier> = match stripe.clone() {
        Some(client) => Arc::new(client),
        None => Arc::new(Unconfigured),
    };
    let provider = IdeogramClient::from_config(
        &config.ideogram,
        config.ideogram_api_key().ok(),
        Duration::from_secs(config.upstream.timeout_secs),
    )?;
    let ledger = Ledger::new(&config, store, Arc::new(provider), verifier)?;

    match args.command {
        Command::Init => {}
        Command::Balance { account } => {
            println!("{}", ledger.get_balance(&account).await?);
        }
        Command::Grant {
            account,
            credits,
            note,
        } => {
            let balance = ledger
                .adjust_balance(&account, credits, note.as_deref())
                .await?;
            println!("{balance}");
        }
        Command::Reconcile { reference } => {
            let result = ledger.reconcile_payment(&reference).await?;
            println!("{}", serde_json::to_string(&result)?);
        }
        Command::History { account, limit } => {
            for entry in ledger.balance_history(&account, limit).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Audit { limit, since_ms } => {
            for attempt in ledger.generation_attempts(limit, since_ms).await? {
                println!("{}", serde_json::to_string(&attempt)?);
            }
        }
        Command::Sweep { max_age_secs } => {
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| ledger.min_sweep_age());
            let report = ledger.sweep_stale_debits(max_age).await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::Checkout {
            plan,
            account,
            success_url,
            cancel_url,
        } => {
            let stripe = stripe.ok_or_else(|| {
                LedgerError::Config(format!(
                    "missing environment variable {}",
                    config.stripe.secret_key_env
                ))
            })?;
            let plan = ledger.plans().resolve(&plan)?;
            let session = stripe
                .create_checkout_session(plan, &account, &success_url, &cancel_url)
                .await?;
            println!("{}", serde_json::to_string(&session)?);
        }
    }

    Ok(())
}
