use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use txweave::cache::{CacheBackend, InMemoryCache, TransactionCache};
use txweave::lock::InMemoryLockStore;
use txweave::tcc::{InMemoryTransport, TccConsumer, TccParticipant, TryInfo};
use txweave::{BoxError, Outcome, TxConfig, TxError, TxRuntime};

#[derive(Parser)]
#[command(name = "txweave")]
#[command(about = "Demo scenarios for transactions, leases and TCC compensation")]
struct Cli {
    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// JSON file with `TxConfig` overrides
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Several workers contend for one lease-protected counter
    Lock {
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long, default_value_t = 5)]
        rounds: usize,
        #[arg(long, default_value_t = 2000)]
        lease_ms: u64,
    },
    /// Cache writes kept on commit and removed on rollback
    Cache,
    /// Confirm on commit, Cancel on rollback, executed by a consumer
    Tcc {
        /// Number of Confirm handler failures before it succeeds
        #[arg(long, default_value_t = 1)]
        flaky: usize,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> Result<TxConfig> {
    let Some(path) = path else {
        return Ok(TxConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config '{}'", path.display()))?;
    TxConfig::from_json_str(&raw).with_context(|| format!("Invalid config '{}'", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = load_config(cli.config.as_deref())?;
    let transport = Arc::new(InMemoryTransport::with_config(&config));
    let runtime = TxRuntime::new(
        config,
        Arc::new(InMemoryLockStore::new()),
        transport.clone(),
    )?;

    match cli.command {
        Command::Lock {
            workers,
            rounds,
            lease_ms,
        } => run_lock(&runtime, workers, rounds, Duration::from_millis(lease_ms)).await,
        Command::Cache => run_cache(&runtime).await,
        Command::Tcc { flaky } => run_tcc(&runtime, transport, flaky).await,
    }
}

async fn run_lock(runtime: &TxRuntime, workers: usize, rounds: usize, lease: Duration) -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    let timeout = runtime.config().wait_timeout();

    let mut tasks = Vec::new();
    for worker in 0..workers {
        let locks = runtime.locks().clone();
        let counter = counter.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..rounds {
                locks
                    .with_lock("demo:counter", lease, timeout, || async {
                        // Non-atomic read-modify-write; only safe under the lock.
                        let seen = counter.load(Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.store(seen + 1, Ordering::SeqCst);
                        Ok::<_, TxError>(())
                    })
                    .await?;
            }
            info!(worker, "worker finished");
            Ok::<_, TxError>(())
        }));
    }

    for task in tasks {
        task.await.context("lock worker panicked")??;
    }

    let total = counter.load(Ordering::SeqCst);
    println!("counter = {} (expected {})", total, workers * rounds);
    if total != workers * rounds {
        return Err(anyhow!("lost updates under the lock"));
    }
    Ok(())
}

async fn run_cache(runtime: &TxRuntime) -> Result<()> {
    let backend = Arc::new(InMemoryCache::default());
    let cache = TransactionCache::new("demo", backend.clone());
    let ctx = runtime.context();

    let committed = cache.clone();
    runtime
        .interceptor()
        .execute(&ctx, None, |ctx| async move {
            committed.set(&ctx, "user:1", "alice").await?;
            Ok::<_, TxError>(Outcome::Value(()))
        })
        .await?;

    let rolled_back = cache.clone();
    runtime
        .interceptor()
        .execute(&ctx, None, |ctx| async move {
            rolled_back.set(&ctx, "user:2", "bob").await?;
            Ok::<_, TxError>(Outcome::RollbackSignal(()))
        })
        .await?;

    for key in ["user:1", "user:2"] {
        let value = backend.get(key).await?;
        println!("{} = {}", key, value.as_deref().unwrap_or("<absent>"));
    }
    Ok(())
}

/// Participant that fails its first `flaky` confirms
struct DemoInventory {
    flaky: AtomicUsize,
}

#[async_trait]
impl TccParticipant for DemoInventory {
    async fn confirm(&self, try_info: &TryInfo) -> std::result::Result<(), BoxError> {
        let remaining = self.flaky.load(Ordering::SeqCst);
        if remaining > 0 {
            self.flaky.store(remaining - 1, Ordering::SeqCst);
            return Err("inventory service unavailable".into());
        }
        println!("confirm {} {}", try_info.stage_id, try_info.arguments);
        Ok(())
    }

    async fn cancel(&self, try_info: &TryInfo) -> std::result::Result<(), BoxError> {
        println!("cancel  {} {}", try_info.stage_id, try_info.arguments);
        Ok(())
    }
}

async fn run_tcc(runtime: &TxRuntime, transport: Arc<InMemoryTransport>, flaky: usize) -> Result<()> {
    let consumer = Arc::new(
        TccConsumer::with_config(runtime.config()).with_ledger(runtime.coordinator().ledger()),
    );
    consumer.register_participant(
        "inventory",
        Arc::new(DemoInventory {
            flaky: AtomicUsize::new(flaky),
        }),
    );
    consumer.subscribe_all(transport.as_ref()).await?;

    let ctx = runtime.context();
    for (sku, commit) in [("A-1", true), ("B-2", false)] {
        let coordinator = runtime.coordinator().clone();
        runtime
            .interceptor()
            .execute(&ctx, None, |ctx| async move {
                let info = TryInfo::new("inventory", "reserve")
                    .with_arguments(&serde_json::json!({ "sku": sku, "qty": 1 }))?;
                coordinator.register_try(&ctx, info)?;
                if commit {
                    Ok::<_, TxError>(Outcome::Value(()))
                } else {
                    Ok(Outcome::RollbackSignal(()))
                }
            })
            .await?;
    }

    if !transport.wait_idle(Duration::from_secs(30)).await {
        return Err(anyhow!("stages still in flight after 30s"));
    }

    println!(
        "coordinator: {}",
        serde_json::to_string(&runtime.coordinator().stats())?
    );
    println!("consumer:    {}", serde_json::to_string(&consumer.stats())?);
    println!("transport:   {}", serde_json::to_string(&transport.stats())?);
    Ok(())
}
