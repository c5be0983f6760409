// src/bin/counter_store_cli.rs

use dotenv::dotenv;
use indicatif::{ProgressBar, ProgressStyle};
use prettytable::{row, Table};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tracing::{info, warn};

use counter_store::config::{InMemoryConfig, RedisConfig, StoreConfig};
use counter_store::logging;
use counter_store::storage::{CounterCollection, MemoryCollection, RedisCollection};
use counter_store::CounterStore;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "counter_store_cli",
    about = "Inspect and exercise a rate limit counter store"
)]
struct Opt {
    /// Backing collection to use
    #[structopt(short, long, possible_values = &["memory", "redis"], default_value = "memory")]
    backend: String,

    /// Redis URL, defaults to COUNTER_STORE_REDIS_URL or redis://localhost:6379
    #[structopt(long)]
    redis_url: Option<String>,

    /// Redis collection name (key namespace)
    #[structopt(long)]
    collection: Option<String>,

    /// JSON file with store settings; COUNTER_STORE_* variables are used otherwise
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Key prefix
    #[structopt(long)]
    prefix: Option<String>,

    /// Window length in milliseconds
    #[structopt(short, long)]
    window_ms: Option<u64>,

    /// Refresh the reset time on every hit
    #[structopt(long)]
    rolling: bool,

    /// Don't provision backend expiry
    #[structopt(long)]
    no_ttl: bool,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Show hits and reset time of a key
    Get { key: String },
    /// Record a hit for a key
    Incr { key: String },
    /// Take back a hit for a key
    Decr { key: String },
    /// Delete a key
    Reset { key: String },
    /// Delete every key of the collection
    ResetAll,
    /// Fire concurrent increments and check that none was lost
    Hammer {
        /// Number of distinct keys to spread hits over
        #[structopt(short, long, default_value = "4")]
        keys: usize,

        /// Number of concurrent tasks
        #[structopt(short, long, default_value = "16")]
        tasks: usize,

        /// Increments per task
        #[structopt(short = "n", long, default_value = "250")]
        requests_per_task: usize,

        /// Leave the hammered keys in place afterwards
        #[structopt(long)]
        keep: bool,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[tokio::main]
async fn main() -> CliResult<()> {
    dotenv().ok();
    let opt = Opt::from_args();

    let log_level = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    logging::init_with_default(&format!(
        "counter_store_cli={},counter_store={}",
        log_level, log_level
    ));

    let store_config = store_config(&opt)?;
    info!(?store_config, backend = %opt.backend, "Starting counter store CLI");

    match opt.backend.as_str() {
        "memory" => {
            let store = CounterStore::<MemoryCollection>::builder()
                .config(store_config)
                .connection(InMemoryConfig::default())
                .error_handler(|err| warn!(error = %err, "Store operation failed"))
                .build()?;
            run(Arc::new(store), opt.command).await
        }
        "redis" => {
            let store = CounterStore::<RedisCollection>::builder()
                .config(store_config)
                .connection(redis_config(&opt)?)
                .error_handler(|err| warn!(error = %err, "Store operation failed"))
                .build()?;
            run(Arc::new(store), opt.command).await
        }
        other => Err(format!("Unknown backend: {}", other).into()),
    }
}

fn store_config(opt: &Opt) -> CliResult<StoreConfig> {
    let mut config = match &opt.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => StoreConfig::from_env()?,
    };

    if let Some(prefix) = &opt.prefix {
        config.prefix = prefix.clone();
    }
    if let Some(ms) = opt.window_ms {
        config.expire_time = Duration::from_millis(ms);
    }
    if opt.rolling {
        config.reset_expire_date_on_change = true;
    }
    if opt.no_ttl {
        config.create_ttl_index = false;
    }

    Ok(config)
}

fn redis_config(opt: &Opt) -> CliResult<RedisConfig> {
    apply_redis_overrides(opt, RedisConfig::from_env_or(DEFAULT_REDIS_URL)?)
}

fn apply_redis_overrides(opt: &Opt, mut config: RedisConfig) -> CliResult<RedisConfig> {
    if let Some(url) = &opt.redis_url {
        config.url = url.clone();
    }
    if let Some(collection) = &opt.collection {
        config.collection_name = collection.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run<C>(store: Arc<CounterStore<C>>, command: Command) -> CliResult<()>
where
    C: CounterCollection + 'static,
{
    match command {
        Command::Get { key } => {
            let info = store.get(&store.prefix_key(&key)).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Incr { key } => {
            let info = store.increment(&store.prefix_key(&key)).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Decr { key } => {
            let key = store.prefix_key(&key);
            store.decrement(&key).await?;
            println!("{}", serde_json::to_string_pretty(&store.get(&key).await?)?);
        }
        Command::Reset { key } => {
            store.reset_key(&store.prefix_key(&key)).await?;
            println!("reset {}", key);
        }
        Command::ResetAll => {
            store.reset_all().await?;
            println!("all keys reset");
        }
        Command::Hammer {
            keys,
            tasks,
            requests_per_task,
            keep,
        } => hammer(store, keys.max(1), tasks.max(1), requests_per_task, keep).await?,
    }

    Ok(())
}

async fn hammer<C>(
    store: Arc<CounterStore<C>>,
    key_count: usize,
    tasks: usize,
    requests_per_task: usize,
    keep: bool,
) -> CliResult<()>
where
    C: CounterCollection + 'static,
{
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let keys: Arc<Vec<String>> = Arc::new(
        (0..key_count)
            .map(|i| store.prefix_key(&format!("hammer-{}-{}", &run_id[..8], i)))
            .collect(),
    );

    let total = (tasks * requests_per_task) as u64;
    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} increments ({per_sec})")?
            .progress_chars("=>-"),
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let store = Arc::clone(&store);
            let keys = Arc::clone(&keys);
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut sent = vec![0i64; keys.len()];
                let mut failed = 0u64;
                for _ in 0..requests_per_task {
                    let index = rand::rng().random_range(0..keys.len());
                    match store.increment(&keys[index]).await {
                        Ok(_) => sent[index] += 1,
                        Err(_) => failed += 1,
                    }
                    progress.inc(1);
                }
                (sent, failed)
            })
        })
        .collect();

    let mut expected = vec![0i64; keys.len()];
    let mut failed = 0u64;
    for result in futures::future::join_all(handles).await {
        let (sent, task_failed) = result?;
        for (total, count) in expected.iter_mut().zip(sent) {
            *total += count;
        }
        failed += task_failed;
    }
    let elapsed = started.elapsed();
    progress.finish_and_clear();

    let mut table = Table::new();
    table.add_row(row!["key", "acknowledged", "stored", "status"]);
    let mut lost = false;
    for (key, expected) in keys.iter().zip(&expected) {
        let stored = store.get(key).await?.total_hits;
        let status = if stored == *expected { "ok" } else { "MISMATCH" };
        lost |= stored != *expected;
        table.add_row(row![key, expected, stored, status]);
    }
    table.printstd();

    println!(
        "{} increments in {:?} ({:.0}/s), {} failed",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        failed
    );

    if !keep {
        for key in keys.iter() {
            store.reset_key(key).await?;
        }
    }

    if lost {
        return Err("stored counts differ from acknowledged increments".into());
    }
    Ok(())
}
