use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use fcache::{
    config::CacheConfig,
    dlq::DeadLetterStore,
    events::EventDispatcher,
    errors::Result as CacheResult,
    models::{DlqStatus, DomainEvent, RankingDomain, RebuildReport},
    remote::{InMemoryRemoteStore, RemoteStore},
    FCache,
};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Runs the command line interface for the fcache daemon.
pub async fn run_cli() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    execute(cli).await
}

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let cache = Arc::new(open_cache(&cli.global).await?);
    match cli.command {
        Command::Serve(args) => run_serve(cache, args).await?,
        Command::Rebuild => {
            let report = cache.rebuild_friend_cache().await?;
            print_json(&report)?;
        }
        Command::Decay(args) => run_decay(&cache, args).await?,
        Command::Reconcile => {
            let report = cache.reconciler.run_once().await?;
            print_json(&report)?;
        }
        Command::Dlq(args) => {
            let status = args.status.map(DlqStatus::from);
            let entries = cache.dead_letters.list(status, args.limit)?;
            print_json(&json!({
                "total": cache.dead_letters.count()?,
                "entries": entries,
            }))?;
        }
        Command::Top(args) => {
            let view = cache
                .top_view(args.domain, args.n.unwrap_or(cache.config.ranking.top_n))
                .await?;
            print_json(&view)?;
        }
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Keeps the Redis friend-set cache and popularity rankings consistent with the source of truth."
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding the dead-letter and source-of-truth SQLite files
    #[arg(long, env = "FCACHE_BASE_PATH", default_value = "./fcache-data")]
    pub base_path: PathBuf,
    /// Redis connection URL; overrides FCACHE_REDIS_URL from the environment or .env
    #[arg(long)]
    pub redis_url: Option<String>,
    /// Use an in-process store instead of Redis (dry runs and tests)
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the event dispatcher and the scheduled jobs until Ctrl-C
    Serve(ServeArgs),
    /// Rebuilds every friend set once and prints the report
    Rebuild,
    /// Runs one decay pass over one or all ranking domains
    Decay(DecayArgs),
    /// Replays pending dead-letter entries once
    Reconcile,
    /// Lists dead-letter entries
    Dlq(DlqArgs),
    /// Prints the cached top-N view of a ranking domain
    Top(TopArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Seconds between friend-set rebuilds; no periodic rebuild when unset
    #[arg(long, env = "FCACHE_REBUILD_INTERVAL_SECS")]
    pub rebuild_interval_secs: Option<u64>,
    /// Read newline-delimited JSON domain events from stdin
    #[arg(long, default_value_t = false)]
    pub stdin_events: bool,
}

#[derive(Args, Debug)]
pub struct DecayArgs {
    /// Ranking domain (`post` or `paper`); all domains when unset
    #[arg(long)]
    pub domain: Option<RankingDomain>,
    /// Overrides the configured decay rate
    #[arg(long)]
    pub rate: Option<f64>,
    /// Overrides the configured prune threshold
    #[arg(long)]
    pub threshold: Option<f64>,
}

#[derive(Args, Debug)]
pub struct DlqArgs {
    #[arg(long, value_enum)]
    pub status: Option<StatusArg>,
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct TopArgs {
    /// Ranking domain (`post` or `paper`)
    #[arg(long)]
    pub domain: RankingDomain,
    /// Number of entries; defaults to the configured top_n
    #[arg(long)]
    pub n: Option<usize>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusArg {
    Pending,
    Processed,
    Failed,
}

impl From<StatusArg> for DlqStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => DlqStatus::Pending,
            StatusArg::Processed => DlqStatus::Processed,
            StatusArg::Failed => DlqStatus::Failed,
        }
    }
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

pub fn build_config(args: &GlobalArgs) -> anyhow::Result<CacheConfig> {
    let mut config =
        CacheConfig::from_env(&args.base_path).context("failed to load fcache configuration")?;
    if let Some(url) = &args.redis_url {
        config.redis_url = url.clone();
    }
    Ok(config)
}

async fn open_cache(args: &GlobalArgs) -> anyhow::Result<FCache> {
    let config = build_config(args)?;
    let cache = if args.in_memory {
        info!("Using the in-process remote store");
        let remote: Arc<dyn RemoteStore> = Arc::new(InMemoryRemoteStore::new());
        FCache::with_remote(config, remote)?
    } else {
        let url = config.redis_url.clone();
        FCache::new(config)
            .await
            .with_context(|| format!("failed to open fcache against {}", url))?
    };
    Ok(cache)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize output")?
    );
    Ok(())
}

async fn run_decay(cache: &FCache, args: DecayArgs) -> anyhow::Result<()> {
    let rate = args.rate.unwrap_or(cache.config.ranking.decay_rate);
    let threshold = args.threshold.unwrap_or(cache.config.ranking.prune_threshold);
    let domains = match args.domain {
        Some(domain) => vec![domain],
        None => RankingDomain::ALL.to_vec(),
    };

    let mut outcomes = serde_json::Map::new();
    for domain in domains {
        let outcome = cache.ranking(domain)?.decay_all(rate, threshold).await?;
        outcomes.insert(domain.name().to_string(), serde_json::to_value(outcome)?);
    }
    print_json(&outcomes)
}

/// Lock TTL for a periodic job: slightly shorter than the period so the next
/// tick on the same instance can claim it again.
fn claim_ttl(period: Duration) -> Duration {
    period - period / 10
}

fn spawn_every<F, Fut>(
    name: String,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Scheduled {} every {:?}", name, period);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Stopped scheduled job {}", name);
                    break;
                }
                _ = ticker.tick() => job(cancel.clone()).await,
            }
        }
    })
}

/// Runs one rebuild, stopping the producer once `cancel` fires so shutdown
/// only waits for records already relayed.
async fn rebuild_until_cancelled(
    cache: &FCache,
    cancel: &CancellationToken,
) -> CacheResult<RebuildReport> {
    let handle = cache.start_rebuild();
    let stop = handle.stop_token();
    let wait = handle.wait();
    tokio::pin!(wait);
    tokio::select! {
        report = &mut wait => report,
        _ = cancel.cancelled() => {
            info!("Stopping friend cache rebuild for shutdown");
            stop.cancel();
            wait.await
        }
    }
}

async fn run_serve(cache: Arc<FCache>, args: ServeArgs) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let mut jobs = Vec::new();

    let decay_period = cache.config.ranking.decay_interval();
    for domain in RankingDomain::ALL {
        let cache = cache.clone();
        jobs.push(spawn_every(
            format!("decay:{}", domain.name()),
            decay_period,
            cancel.clone(),
            move |_| {
                let cache = cache.clone();
                async move {
                    let job = format!("decay:{}", domain.name());
                    if !cache.claim_period(&job, claim_ttl(decay_period)).await {
                        debug!("{} already ran this period elsewhere", job);
                        return;
                    }
                    match cache.decay(domain).await {
                        Ok(outcome) => info!(
                            "{} decay: {} rescaled, {} pruned",
                            domain, outcome.rescaled, outcome.pruned
                        ),
                        Err(err) => error!("{} decay failed: {}", domain, err),
                    }
                }
            },
        ));
    }

    let reconcile_period = cache.config.dead_letter.reconcile_interval();
    {
        let cache = cache.clone();
        jobs.push(spawn_every(
            "reconcile".to_string(),
            reconcile_period,
            cancel.clone(),
            move |_| {
                let cache = cache.clone();
                async move {
                    if !cache
                        .claim_period("reconcile", claim_ttl(reconcile_period))
                        .await
                    {
                        debug!("Reconciliation already ran this period elsewhere");
                        return;
                    }
                    if let Err(err) = cache.reconciler.run_once().await {
                        error!("Dead-letter reconciliation failed: {}", err);
                    }
                }
            },
        ));
    }

    let rebuild_interval = args
        .rebuild_interval_secs
        .or(cache.config.rebuild.interval_secs)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    if let Some(rebuild_period) = rebuild_interval {
        let cache = cache.clone();
        jobs.push(spawn_every(
            "rebuild".to_string(),
            rebuild_period,
            cancel.clone(),
            move |cancel| {
                let cache = cache.clone();
                async move {
                    if !cache
                        .claim_period("rebuild:friends", claim_ttl(rebuild_period))
                        .await
                    {
                        debug!("Friend cache rebuild already ran this period elsewhere");
                        return;
                    }
                    if let Err(err) = rebuild_until_cancelled(&cache, &cancel).await {
                        error!("Friend cache rebuild failed: {}", err);
                    }
                }
            },
        ));
    }

    let dispatcher = cache.start_dispatcher();
    info!("fcached serving; press Ctrl-C to stop");
    if args.stdin_events {
        tokio::select! {
            _ = shutdown_signal() => {}
            published = ingest_stdin(&dispatcher) => {
                info!("Event input closed after {} events; waiting for shutdown signal", published);
                shutdown_signal().await;
            }
        }
    } else {
        shutdown_signal().await;
    }

    cancel.cancel();
    for job in jobs {
        if let Err(err) = job.await {
            warn!("Scheduled job ended abnormally: {}", err);
        }
    }
    let stats = dispatcher.shutdown().await?;
    info!(
        "Dispatcher stopped: {} received, {} applied, {} dead-lettered, {} lost, {} best-effort, {} panicked",
        stats.received,
        stats.applied,
        stats.dead_lettered,
        stats.dead_letter_failed,
        stats.best_effort,
        stats.panicked
    );
    cache.pools().cancel_all();
    Ok(())
}

async fn ingest_stdin(dispatcher: &EventDispatcher) -> u64 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0u64;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<DomainEvent>(line) {
                    Ok(event) => {
                        if let Err(err) = dispatcher.publish(event).await {
                            error!("Stopping event input: {}", err);
                            break;
                        }
                        published += 1;
                    }
                    Err(err) => warn!("Skipping malformed event: {}", err),
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!("Failed to read event input: {}", err);
                break;
            }
        }
    }
    published
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("Shutdown signal received");
}
