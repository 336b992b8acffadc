//! Workload generator for exercising the distributed sender.
//!
//! This binary runs GET/SET/SCAN traffic through a `DistSender` against an
//! in-process simulated cluster while a background task keeps splitting
//! ranges and moving leases, then prints a JSON summary of what happened.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_batch::{BatchRequest, KvError, ReadConsistency, Request};
use holo_dist::sim::node_address;
use holo_dist::{DistSender, DistSenderArgs, RpcContext, SenderStatsSnapshot, SimCluster};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of simulated nodes.
    #[arg(long, default_value_t = 5)]
    nodes: usize,

    /// Replicas per range.
    #[arg(long, default_value_t = 3)]
    replication: usize,

    /// Node the sender runs on; its replicas are served in-process (0 = none).
    #[arg(long, default_value_t = 1)]
    local_node: u64,

    /// Number of concurrent clients sharing the sender.
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// Number of keys used by the workload.
    #[arg(long, default_value_t = 1000)]
    keys: usize,

    /// Key prefix/namespace. Keys are generated as `{key_prefix}{seed}_k{idx:06}`.
    #[arg(long, default_value = "holo_")]
    key_prefix: String,

    /// Percent of operations that are SET.
    #[arg(long, default_value_t = 40)]
    set_pct: u8,

    /// Percent of operations that are SCAN (rest are GET).
    #[arg(long, default_value_t = 10)]
    scan_pct: u8,

    /// Rows requested per SCAN.
    #[arg(long, default_value_t = 20)]
    scan_limit: i64,

    /// Ranges to create before traffic starts.
    #[arg(long, default_value_t = 8)]
    initial_splits: usize,

    /// Delay between background splits and lease moves (0s disables them).
    #[arg(long, default_value = "200ms")]
    chaos_interval: humantime::Duration,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Per-operation timeout.
    #[arg(long, default_value = "10s")]
    op_timeout: humantime::Duration,

    /// When true, any operation error aborts the run.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Also write the summary to this path.
    #[arg(long)]
    out: Option<PathBuf>,

    #[command(flatten)]
    dist: DistSenderArgs,
}

/// Parameters of the run, embedded in the summary for reproducibility.
#[derive(serde::Serialize, Debug, Clone)]
struct RunMeta {
    nodes: usize,
    replication: usize,
    local_node: u64,
    clients: usize,
    keys: usize,
    key_prefix: String,
    set_pct: u8,
    scan_pct: u8,
    duration_ms: u64,
    seed: u64,
}

/// Per-kind operation outcome counters.
#[derive(serde::Serialize, Debug, Clone, Copy, Default)]
struct OpCounts {
    ok: u64,
    errors: u64,
    timeouts: u64,
    total_us: u64,
    max_us: u64,
}

impl OpCounts {
    fn record(&mut self, outcome: &OpOutcome, elapsed: Duration) {
        match outcome {
            OpOutcome::Ok => self.ok += 1,
            OpOutcome::Err(_) => self.errors += 1,
            OpOutcome::Timeout => self.timeouts += 1,
        }
        let us = elapsed.as_micros() as u64;
        self.total_us += us;
        self.max_us = self.max_us.max(us);
    }

    fn merge(&mut self, other: &OpCounts) {
        self.ok += other.ok;
        self.errors += other.errors;
        self.timeouts += other.timeouts;
        self.total_us += other.total_us;
        self.max_us = self.max_us.max(other.max_us);
    }
}

/// Counters of one client, or of all clients once merged.
#[derive(serde::Serialize, Debug, Clone, Copy, Default)]
struct ClientReport {
    get: OpCounts,
    set: OpCounts,
    scan: OpCounts,
    scanned_rows: u64,
}

impl ClientReport {
    fn merge(&mut self, other: &ClientReport) {
        self.get.merge(&other.get);
        self.set.merge(&other.set);
        self.scan.merge(&other.scan);
        self.scanned_rows += other.scanned_rows;
    }
}

/// Background layout changes applied during the run.
#[derive(serde::Serialize, Debug, Clone, Copy, Default)]
struct ChaosReport {
    splits: u64,
    lease_moves: u64,
    failed: u64,
}

/// Final JSON summary.
#[derive(serde::Serialize, Debug)]
struct Summary {
    meta: RunMeta,
    ops: ClientReport,
    chaos: ChaosReport,
    ranges: usize,
    sender: SenderStatsSnapshot,
}

enum OpKind {
    Get,
    Set,
    Scan,
}

enum OpOutcome {
    Ok,
    Err(KvError),
    Timeout,
}

#[tokio::main]
/// Parse CLI args and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

/// Run the workload and print a JSON summary.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.nodes > 0, "--nodes must be > 0");
    anyhow::ensure!(
        (1..=args.nodes).contains(&args.replication),
        "--replication must be between 1 and --nodes"
    );
    anyhow::ensure!(
        args.local_node as usize <= args.nodes,
        "--local-node must be 0 or a node id"
    );
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    anyhow::ensure!(
        args.set_pct as u32 + args.scan_pct as u32 <= 100,
        "--set-pct + --scan-pct must be <= 100"
    );

    let duration: Duration = args.duration.into();
    let op_timeout: Duration = args.op_timeout.into();
    let chaos_interval: Duration = args.chaos_interval.into();
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let keyspace: Arc<Vec<String>> = Arc::new(
        (0..args.keys)
            .map(|i| format!("{}{}_k{i:06}", args.key_prefix, seed))
            .collect(),
    );

    let cluster = SimCluster::new(args.nodes, args.replication);
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut chaos = ChaosReport::default();
    for _ in 0..args.initial_splits {
        split_random(&cluster, &keyspace, &mut rng, &mut chaos);
    }

    let shutdown = CancellationToken::new();
    let mut config = args.dist.clone().into_config()?;
    config.retry.closer = Some(shutdown.clone());

    let rpc = Arc::new(RpcContext::new(Arc::new(cluster.clone())));
    if args.local_node > 0 {
        cluster.set_own_node(Some(args.local_node));
        rpc.set_local_server(
            node_address(args.local_node),
            cluster.local_server(args.local_node)?,
        );
    }
    let sender = Arc::new(DistSender::new(config, Arc::new(cluster.clone()), rpc));
    tracing::info!(
        nodes = args.nodes,
        ranges = cluster.descriptors().len(),
        clients = args.clients,
        seed,
        "starting workload"
    );

    let deadline = time::Instant::now() + duration;
    let chaos_task = (!chaos_interval.is_zero()).then(|| {
        let cluster = cluster.clone();
        let keyspace = keyspace.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_chaos(cluster, keyspace, seed, chaos_interval, shutdown).await
        })
    });

    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let sender = sender.clone();
        let keyspace = keyspace.clone();
        let client = ClientArgs {
            set_pct: args.set_pct,
            scan_pct: args.scan_pct,
            scan_limit: args.scan_limit,
            op_timeout,
            fail_fast: args.fail_fast,
            // Mix the base seed with the client id for deterministic per-client RNG.
            seed: seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15),
        };
        tasks.push(tokio::spawn(async move {
            run_client(client_id, sender, keyspace, client, deadline).await
        }));
    }

    let mut ops = ClientReport::default();
    let mut failure = None;
    for task in tasks {
        match task.await.context("client task panicked")? {
            Ok(report) => ops.merge(&report),
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    shutdown.cancel();
    if let Some(task) = chaos_task {
        let report = task.await.context("chaos task panicked")?;
        chaos.splits += report.splits;
        chaos.lease_moves += report.lease_moves;
        chaos.failed += report.failed;
    }
    if let Some(err) = failure {
        return Err(err);
    }

    let summary = Summary {
        meta: RunMeta {
            nodes: args.nodes,
            replication: args.replication,
            local_node: args.local_node,
            clients: args.clients,
            keys: args.keys,
            key_prefix: args.key_prefix.clone(),
            set_pct: args.set_pct,
            scan_pct: args.scan_pct,
            duration_ms: duration.as_millis() as u64,
            seed,
        },
        ops,
        chaos,
        ranges: cluster.descriptors().len(),
        sender: sender.stats().snapshot(),
    };
    let data = serde_json::to_string_pretty(&summary).context("serialize summary")?;
    println!("{data}");
    if let Some(path) = &args.out {
        write_summary(path, &data).context("write summary")?;
        eprintln!("wrote summary: {}", path.display());
    }
    Ok(())
}

/// Per-client knobs.
#[derive(Clone, Copy)]
struct ClientArgs {
    set_pct: u8,
    scan_pct: u8,
    scan_limit: i64,
    op_timeout: Duration,
    fail_fast: bool,
    seed: u64,
}

/// Issue operations until the deadline, returning the client's counters.
async fn run_client(
    client_id: usize,
    sender: Arc<DistSender>,
    keyspace: Arc<Vec<String>>,
    args: ClientArgs,
    deadline: time::Instant,
) -> anyhow::Result<ClientReport> {
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let mut report = ClientReport::default();

    let mut seq = 0u64;
    while time::Instant::now() < deadline {
        seq += 1;
        let idx = rng.gen_range(0..keyspace.len());
        let key = keyspace[idx].as_str();
        let roll = rng.gen_range(0..100u32);

        // Decide whether this operation is a SET, SCAN or GET.
        let (kind, ba) = if roll < args.set_pct as u32 {
            let value = format!("c{client_id}:{seq}");
            (
                OpKind::Set,
                BatchRequest::with_requests(vec![Request::put(key, value)]),
            )
        } else if roll < (args.set_pct as u32 + args.scan_pct as u32) {
            let end = keyspace
                .get(idx + args.scan_limit.max(1) as usize)
                .cloned()
                .unwrap_or_else(|| format!("{key}~"));
            let mut ba = BatchRequest::with_requests(vec![Request::scan(key, end.as_str(), 0)]);
            // Multi-range scans outside a transaction must be inconsistent.
            ba.header.read_consistency = ReadConsistency::Inconsistent;
            ba.header.max_scan_results = args.scan_limit;
            (OpKind::Scan, ba)
        } else {
            (
                OpKind::Get,
                BatchRequest::with_requests(vec![Request::get(key)]),
            )
        };

        let started = time::Instant::now();
        let outcome = match time::timeout(args.op_timeout, sender.send(ba)).await {
            Ok(Ok(resp)) => {
                if let OpKind::Scan = kind {
                    let rows: usize = resp.responses.iter().map(|r| r.rows().len()).sum();
                    report.scanned_rows += rows as u64;
                }
                OpOutcome::Ok
            }
            Ok(Err(err)) => OpOutcome::Err(err),
            Err(_) => OpOutcome::Timeout,
        };
        let elapsed = started.elapsed();

        match &outcome {
            OpOutcome::Ok => {}
            OpOutcome::Err(err) => {
                tracing::warn!(client_id, key, error = %err, "operation failed");
                if args.fail_fast {
                    // Abort immediately on failure when fail-fast is enabled.
                    anyhow::bail!("client {client_id} operation on {key} failed: {err}");
                }
            }
            OpOutcome::Timeout => {
                tracing::warn!(client_id, key, "operation timed out");
                if args.fail_fast {
                    anyhow::bail!("client {client_id} operation on {key} timed out");
                }
            }
        }
        let counts = match kind {
            OpKind::Get => &mut report.get,
            OpKind::Set => &mut report.set,
            OpKind::Scan => &mut report.scan,
        };
        counts.record(&outcome, elapsed);
    }

    Ok(report)
}

/// Split and move leases at random until `shutdown` fires.
async fn run_chaos(
    cluster: SimCluster,
    keyspace: Arc<Vec<String>>,
    seed: u64,
    interval: Duration,
    shutdown: CancellationToken,
) -> ChaosReport {
    let mut rng = SmallRng::seed_from_u64(seed.rotate_left(17));
    let mut report = ChaosReport::default();
    let mut ticker = time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if rng.gen_bool(0.5) {
            split_random(&cluster, &keyspace, &mut rng, &mut report);
        } else {
            move_random_lease(&cluster, &mut rng, &mut report);
        }
    }
    report
}

fn split_random(
    cluster: &SimCluster,
    keyspace: &[String],
    rng: &mut SmallRng,
    report: &mut ChaosReport,
) {
    let key = keyspace[rng.gen_range(0..keyspace.len())].as_str();
    match cluster.split_range(key) {
        Ok((left, right)) => {
            report.splits += 1;
            tracing::debug!(%left, %right, "split range");
        }
        Err(err) => {
            report.failed += 1;
            tracing::debug!(key, error = %format!("{err:#}"), "split skipped");
        }
    }
}

fn move_random_lease(cluster: &SimCluster, rng: &mut SmallRng, report: &mut ChaosReport) {
    let ranges = cluster.descriptors();
    if ranges.is_empty() {
        return;
    }
    let desc = &ranges[rng.gen_range(0..ranges.len())];
    let Some(target) = desc
        .replicas
        .get(rng.gen_range(0..desc.replicas.len().max(1)))
        .map(|r| r.node_id)
    else {
        report.failed += 1;
        return;
    };
    match cluster.transfer_lease(desc.range_id, target) {
        Ok(()) => {
            report.lease_moves += 1;
            tracing::debug!(range_id = desc.range_id, target, "moved lease");
        }
        Err(err) => {
            report.failed += 1;
            tracing::debug!(
                range_id = desc.range_id,
                error = %format!("{err:#}"),
                "lease move failed"
            );
        }
    }
}

/// Write the summary JSON, creating the parent directory.
fn write_summary(path: &PathBuf, data: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        // Ensure the output directory exists before writing.
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
