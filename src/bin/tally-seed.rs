use tally_credit::{CreditConfig, CreditLedger, LotSource, MicroUsd, SqliteStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let usage = concat!(
        "usage: tally-seed \\\n",
        "  --sqlite PATH --account ID --amount-micros N \\\n",
        "  [--source seed|purchase|grant] [--expires-in-secs SECS] \\\n",
        "  [--redis URL] [--redis-prefix PREFIX]\n",
    );

    let mut args = std::env::args().skip(1);
    let mut sqlite_path: Option<std::path::PathBuf> = None;
    let mut account_id: Option<String> = None;
    let mut amount_micros: Option<i64> = None;
    let mut source = "seed".to_string();
    let mut expires_in_secs: Option<u64> = None;
    let mut redis_url: Option<String> = None;
    let mut redis_prefix: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sqlite" => {
                sqlite_path = Some(args.next().ok_or("missing value for --sqlite")?.into());
            }
            "--account" => {
                account_id = Some(args.next().ok_or("missing value for --account")?);
            }
            "--amount-micros" => {
                amount_micros = Some(
                    args.next()
                        .ok_or("missing value for --amount-micros")?
                        .parse()?,
                );
            }
            "--source" => {
                source = args.next().ok_or("missing value for --source")?;
            }
            "--expires-in-secs" => {
                expires_in_secs = Some(
                    args.next()
                        .ok_or("missing value for --expires-in-secs")?
                        .parse()?,
                );
            }
            "--redis" => {
                redis_url = Some(args.next().ok_or("missing value for --redis")?);
            }
            "--redis-prefix" => {
                redis_prefix = Some(args.next().ok_or("missing value for --redis-prefix")?);
            }
            other => {
                return Err(format!("unknown argument {other}\n{usage}").into());
            }
        }
    }

    let Some(sqlite_path) = sqlite_path else {
        return Err(usage.into());
    };
    let Some(account_id) = account_id else {
        return Err(usage.into());
    };
    let Some(amount_micros) = amount_micros else {
        return Err(usage.into());
    };
    let source = LotSource::parse(&source)
        .ok_or_else(|| format!("invalid --source {source:?} (seed|purchase|grant)"))?;

    let expires_at_ms = expires_in_secs.map(|secs| {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0);
        now_ms + (secs as i64) * 1_000
    });

    let store = SqliteStore::new(sqlite_path);
    let ledger = build_ledger(store, redis_url, redis_prefix)?;
    ledger.init().await?;

    let lot = ledger
        .mint(
            &account_id,
            MicroUsd::from_micros(amount_micros),
            source,
            expires_at_ms,
        )
        .await?;
    let balance = ledger.balance(&account_id).await?;

    println!(
        "{}",
        serde_json::json!({
            "lot_id": lot.lot_id,
            "account_id": lot.account_id,
            "amount_micros": lot.amount_micros.micros(),
            "expires_at_ms": lot.expires_at_ms,
            "balance_micros": balance.micros(),
        })
    );
    Ok(())
}

#[cfg(feature = "store-redis")]
fn build_ledger(
    store: SqliteStore,
    redis_url: Option<String>,
    redis_prefix: Option<String>,
) -> Result<CreditLedger, Box<dyn std::error::Error>> {
    let mut ledger = CreditLedger::new(CreditConfig::default(), store);
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
    store: SqliteStore,
    redis_url: Option<String>,
    _redis_prefix: Option<String>,
) -> Result<CreditLedger, Box<dyn std::error::Error>> {
    if redis_url.is_some() {
        return Err("this build does not include the store-redis feature".into());
    }
    Ok(CreditLedger::new(CreditConfig::default(), store))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
