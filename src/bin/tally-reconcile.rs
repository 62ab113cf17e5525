use std::sync::Arc;

use tally_credit::{CreditConfig, CreditLedger, ReconciliationWorker, SqliteStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let usage = concat!(
        "usage: tally-reconcile \\\n",
        "  --sqlite PATH [--config PATH] \\\n",
        "  [--redis URL] [--redis-prefix PREFIX] \\\n",
        "  [--account ID] [--clear-halt]\n",
        "\n",
        "Forces an out-of-cycle reconciliation pass and drift check.\n",
        "--clear-halt re-checks drift for --account and clears the breaker\n",
        "when it has returned below tolerance.\n",
    );

    let mut args = std::env::args().skip(1);
    let mut sqlite_path: Option<std::path::PathBuf> = None;
    let mut config_path: Option<std::path::PathBuf> = None;
    let mut redis_url: Option<String> = None;
    let mut redis_prefix: Option<String> = None;
    let mut account_id: Option<String> = None;
    let mut clear_halt = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sqlite" => {
                sqlite_path = Some(args.next().ok_or("missing value for --sqlite")?.into());
            }
            "--config" => {
                config_path = Some(args.next().ok_or("missing value for --config")?.into());
            }
            "--redis" => {
                redis_url = Some(args.next().ok_or("missing value for --redis")?);
            }
            "--redis-prefix" => {
                redis_prefix = Some(args.next().ok_or("missing value for --redis-prefix")?);
            }
            "--account" => {
                account_id = Some(args.next().ok_or("missing value for --account")?);
            }
            "--clear-halt" => {
                clear_halt = true;
            }
            other => {
                return Err(format!("unknown argument {other}\n{usage}").into());
            }
        }
    }

    let Some(sqlite_path) = sqlite_path else {
        return Err(usage.into());
    };
    if clear_halt && account_id.is_none() {
        return Err("--clear-halt requires --account".into());
    }

    let config = match config_path {
        Some(path) => CreditConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => CreditConfig::default(),
    };
    let store = SqliteStore::new(sqlite_path);
    let ledger = Arc::new(build_ledger(config, store, redis_url, redis_prefix)?);
    ledger.init().await?;

    let worker = ReconciliationWorker::new(ledger.clone());
    let report = match account_id.as_deref() {
        Some(account_id) => {
            let mut report = tally_credit::ReconcileReport::default();
            report.accounts = 1;
            worker.reconcile_account(account_id, &mut report).await?;
            report
        }
        None => worker.run_once().await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if clear_halt {
        let account_id = account_id.as_deref().unwrap_or_default();
        match ledger.clear_halt(account_id).await {
            Ok(drift) => {
                println!(
                    "{}",
                    serde_json::json!({
                        "halt_cleared": account_id,
                        "drift_micros": drift.drift_micros.micros(),
                    })
                );
            }
            Err(err) => {
                return Err(format!("halt not cleared: {err}").into());
            }
        }
    }
    Ok(())
}

#[cfg(feature = "store-redis")]
fn build_ledger(
    config: CreditConfig,
    store: SqliteStore,
    redis_url: Option<String>,
    redis_prefix: Option<String>,
) -> Result<CreditLedger, Box<dyn std::error::Error>> {
    let mut ledger = CreditLedger::new(config, store);
    if let Some(url) = redis_url {
        let mut cache = tally_credit::RedisStore::new(url)?;
        if let Some(prefix) = redis_prefix {
            cache = cache.with_prefix(prefix);
        }
        ledger = ledger.with_cache(cache);
    }
    Ok(ledger)
}

#[cfg(not(feature = "store-redis"))]
fn build_ledger(
    config: CreditConfig,
    store: SqliteStore,
    redis_url: Option<String>,
    _redis_prefix: Option<String>,
) -> Result<CreditLedger, Box<dyn std::error::Error>> {
    if redis_url.is_some() {
        return Err("this build does not include the store-redis feature".into());
    }
    Ok(CreditLedger::new(config, store))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
