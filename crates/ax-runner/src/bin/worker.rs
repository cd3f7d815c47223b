use std::sync::Arc;

use anyhow::{bail, Context};
use ax_runner::{AppConfig, ImportJob, Orchestrator};
use ax_store::Store;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const USAGE: &str = "usage: arbitrex-worker <run-id>...\n       arbitrex-worker import <import-id>...";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "arbitrex=info,ax_runner=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        bail!(USAGE);
    }

    let config = AppConfig::load().context("loading configuration")?;
    let store = Arc::new(
        Store::open(&config.database.path)
            .with_context(|| format!("opening database {}", config.database.path.display()))?,
    );
    info!(database = %config.database.path.display(), provider = ?config.data.provider, "Worker starting");

    let failures = if args[0] == "import" {
        run_imports(store, &config, &args[1..]).await?
    } else {
        run_backtests(store, &config, &args).await?
    };

    if failures > 0 {
        bail!("{} job(s) failed", failures);
    }
    Ok(())
}

async fn run_backtests(store: Arc<Store>, config: &AppConfig, args: &[String]) -> anyhow::Result<usize> {
    let ids = args
        .iter()
        .map(|arg| Uuid::parse_str(arg).with_context(|| format!("invalid run id '{}'", arg)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let orchestrator = Arc::new(Orchestrator::new(store, config)?);
    let handles: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { (id, orchestrator.execute(id).await) })
        })
        .collect();

    let mut failures = 0;
    for handle in handles {
        match handle.await? {
            (id, Ok(run)) => info!(run_id = %id, status = %run.status, "Run finished"),
            (id, Err(err)) => {
                error!(run_id = %id, error = %err, "Run could not be executed");
                failures += 1;
            }
        }
    }
    Ok(failures)
}

async fn run_imports(store: Arc<Store>, config: &AppConfig, args: &[String]) -> anyhow::Result<usize> {
    if args.is_empty() {
        bail!(USAGE);
    }
    let ids = args
        .iter()
        .map(|arg| arg.parse::<i64>().with_context(|| format!("invalid import id '{}'", arg)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let job = ImportJob::new(store, config.data.normalizer()?);
    let mut failures = 0;
    for id in ids {
        match job.run(id).await {
            Ok(import) => info!(import_id = id, bars = import.bar_count, "Import finished"),
            Err(err) => {
                error!(import_id = id, error = %err, "Import failed");
                failures += 1;
            }
        }
    }
    Ok(failures)
}
