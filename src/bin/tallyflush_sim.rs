use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tallyflush::{CounterService, CounterStore, InMemoryCounterStore, StoreError, TallyConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tallyflush-sim")]
#[command(about = "Simulates embedded widgets reporting post views through tallyflush")]
struct Cli {
    /// Concurrent widgets emitting views
    #[arg(long, default_value_t = 32)]
    widgets: usize,
    /// Views emitted by each widget
    #[arg(long, default_value_t = 200)]
    events: usize,
    /// Distinct posts receiving views
    #[arg(long, default_value_t = 20)]
    posts: usize,
    /// Percentage of store writes failing with a transient error
    #[arg(long, default_value_t = 10)]
    failure_rate: u8,
    /// Pause between two views of one widget, in milliseconds
    #[arg(long, default_value_t = 5)]
    think_ms: u64,
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

/// In-memory store that fails a share of its writes with `Unavailable`.
struct FlakyStore {
    inner: InMemoryCounterStore,
    rng: Mutex<Lcg64>,
    failure_rate: u8,
    injected: AtomicU64,
}

impl FlakyStore {
    fn should_fail(&self) -> bool {
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        (rng.next_u64() % 100) < u64::from(self.failure_rate)
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn increment(&self, entity_id: &str, delta: i64) -> Result<(), StoreError> {
        if self.should_fail() {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.increment(entity_id, delta).await
    }

    async fn get(&self, entity_id: &str) -> Result<i64, StoreError> {
        self.inner.get(entity_id).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TallyConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TallyConfig::default(),
    };

    let store = Arc::new(FlakyStore {
        inner: InMemoryCounterStore::new(),
        rng: Mutex::new(Lcg64::new(0x9e3779b97f4a7c15)),
        failure_rate: cli.failure_rate.min(100),
        injected: AtomicU64::new(0),
    });
    let posts = cli.posts.max(1);
    for post in 0..posts {
        store.inner.register(&format!("post-{}", post));
    }

    let service = Arc::new(CounterService::new(store.clone(), config)?);
    let start = Instant::now();
    let mut handles = Vec::with_capacity(cli.widgets);

    for widget_id in 0..cli.widgets {
        let service = service.clone();
        let events = cli.events;
        let think = Duration::from_millis(cli.think_ms);
        let mut rng = Lcg64::new(0x2545f4914f6cdd1d ^ widget_id as u64);
        handles.push(tokio::spawn(async move {
            for _ in 0..events {
                let post = rng.next_u64() as usize % posts;
                service.record_view(&format!("post-{}", post));
                if !think.is_zero() {
                    tokio::time::sleep(think).await;
                }
            }
        }));
    }

    for handle in handles {
        handle.await.context("widget task panicked")?;
    }

    let service = Arc::try_unwrap(service)
        .map_err(|_| anyhow::anyhow!("service still shared after widgets finished"))?;
    let stats_before = service.stats();
    let report = service.shutdown().await;

    let emitted = (cli.widgets * cli.events) as i64;
    let stored: i64 = store.inner.snapshot().iter().map(|(_, value)| value).sum();

    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        timed_flushes = stats_before.flushes,
        final_flush_delivered = report.delivered,
        store_calls = store.inner.increment_calls(),
        injected_failures = store.injected.load(Ordering::Relaxed),
        "simulation finished"
    );
    println!("emitted views:   {}", emitted);
    println!("stored views:    {}", stored);
    println!("still pending:   {}", report.requeued);
    for (post, value) in store.inner.snapshot() {
        println!("  {:<10} {}", post, value);
    }

    Ok(())
}

struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        // low bits of an LCG cycle quickly
        self.state >> 33
    }
}
