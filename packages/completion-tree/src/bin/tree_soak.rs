//! Completion tree soak driver
//!
//! Builds many random trees, resolves every node in a shuffled order across
//! worker tasks, releases gates at random times and then checks that every
//! node terminated exactly once and the node table drained.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use completion_tree::{
    CompletionTree, ExternalGate, GateTrigger, NodeFailure, NodeHandle, TreeConfig, TreeError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Tree = CompletionTree<u64, NodeFailure>;
type Handle = NodeHandle<u64, NodeFailure>;

#[derive(Parser, Debug)]
#[command(name = "tree-soak")]
#[command(about = "Race resolves, child terminations and gates across many completion trees")]
struct Args {
    /// Number of root nodes
    #[arg(long, env = "SOAK_ROOTS", default_value_t = 200)]
    roots: usize,

    /// Children per node
    #[arg(long, env = "SOAK_FAN_OUT", default_value_t = 3)]
    fan_out: usize,

    /// Levels below each root
    #[arg(long, env = "SOAK_DEPTH", default_value_t = 3)]
    depth: usize,

    /// Fraction of nodes that get an external gate
    #[arg(long, env = "SOAK_GATE_RATIO", default_value_t = 0.25)]
    gate_ratio: f64,

    /// Fraction of nodes resolved with an error
    #[arg(long, env = "SOAK_ERROR_RATIO", default_value_t = 0.1)]
    error_ratio: f64,

    /// Number of resolving worker tasks
    #[arg(long, env = "SOAK_WORKERS", default_value_t = 8)]
    workers: usize,

    /// How long to wait for every root to terminate
    #[arg(long, env = "SOAK_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,
}

impl Args {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.gate_ratio) {
            bail!("--gate-ratio must be within 0..=1, got {}", self.gate_ratio);
        }
        if !(0.0..=1.0).contains(&self.error_ratio) {
            bail!("--error-ratio must be within 0..=1, got {}", self.error_ratio);
        }
        if self.workers == 0 {
            bail!("--workers must be at least 1");
        }
        Ok(())
    }
}

/// Everything built for one run.
struct Forest {
    roots: Vec<Handle>,
    nodes: Vec<Handle>,
    triggers: Vec<GateTrigger>,
}

fn maybe_gate(ratio: f64, triggers: &mut Vec<GateTrigger>) -> Option<ExternalGate> {
    if fastrand::f64() >= ratio {
        return None;
    }
    let (trigger, gate) = ExternalGate::pair();
    triggers.push(trigger);
    Some(gate)
}

fn build_forest(tree: &Tree, args: &Args, terminations: &Arc<AtomicUsize>) -> Result<Forest> {
    let mut forest = Forest {
        roots: Vec::with_capacity(args.roots),
        nodes: Vec::new(),
        triggers: Vec::new(),
    };

    for i in 0..args.roots {
        let metadata = tree.metadata().with_correlation_id(format!("soak-{i}"));
        let gate = maybe_gate(args.gate_ratio, &mut forest.triggers);
        let root = tree.create_expiring_root(metadata, gate);
        forest.roots.push(root.clone());

        let mut level = vec![root];
        for _ in 0..args.depth {
            let mut next = Vec::with_capacity(level.len() * args.fan_out);
            for parent in &level {
                for _ in 0..args.fan_out {
                    let gate = maybe_gate(args.gate_ratio, &mut forest.triggers);
                    let child = parent
                        .create_child(gate)
                        .with_context(|| format!("creating child under {}", parent.id()))?;
                    next.push(child);
                }
            }
            forest.nodes.append(&mut level);
            level = next;
        }
        forest.nodes.append(&mut level);
    }

    for node in &forest.nodes {
        let terminations = terminations.clone();
        node.on_terminated(move |_| {
            terminations.fetch_add(1, Ordering::SeqCst);
        });
    }

    Ok(forest)
}

/// Resolve a batch of nodes, yielding now and then to shuffle interleavings.
async fn resolve_batch(batch: Vec<Handle>, error_ratio: f64) -> Result<usize> {
    let mut expired = 0;
    for (i, node) in batch.into_iter().enumerate() {
        let result = if fastrand::f64() < error_ratio {
            node.resolve_error(NodeFailure::new("soak", format!("injected failure #{i}")))
        } else {
            node.resolve_success(Some(i as u64))
        };
        match result {
            Ok(()) => {}
            // Root deadline got there first
            Err(TreeError::AlreadyResolved { .. }) if node.parent_id().is_none() => expired += 1,
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("resolving {}", node.id())))
            }
        }
        if fastrand::u8(..) < 16 {
            tokio::task::yield_now().await;
        }
    }
    Ok(expired)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,completion_tree=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    args.validate()?;
    let config = TreeConfig::from_env().context("Failed to load tree configuration")?;
    tracing::info!(?args, ?config, "Starting completion tree soak");

    let tree = Tree::with_config(config);
    let terminations = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let Forest {
        roots,
        mut nodes,
        triggers,
    } = build_forest(&tree, &args, &terminations)?;
    let total = nodes.len();
    tracing::info!(
        nodes = total,
        gates = triggers.len(),
        live = tree.live_count(),
        "Forest built"
    );

    fastrand::shuffle(&mut nodes);
    let chunk = total.div_ceil(args.workers).max(1);
    let mut workers = Vec::new();
    while !nodes.is_empty() {
        let batch: Vec<Handle> = nodes.drain(..chunk.min(nodes.len())).collect();
        workers.push(tokio::spawn(resolve_batch(batch, args.error_ratio)));
    }

    let gates = tokio::spawn(async move {
        for trigger in triggers {
            if fastrand::bool() {
                tokio::time::sleep(Duration::from_micros(fastrand::u64(0..200))).await;
            }
            trigger.complete();
        }
    });

    let mut expired = 0;
    for worker in workers {
        expired += worker.await.context("resolver task panicked")??;
    }
    gates.await.context("gate task panicked")?;

    let waits = roots.iter().map(|root| root.termination());
    let timeout = Duration::from_millis(args.timeout_ms);
    let outcomes = tokio::time::timeout(timeout, futures::future::join_all(waits))
        .await
        .with_context(|| format!("roots did not terminate within {timeout:?}"))?;

    let mut failed_roots = 0;
    for outcome in outcomes {
        if outcome.is_error() {
            failed_roots += 1;
        }
    }

    let terminated = terminations.load(Ordering::SeqCst);
    let live = tree.live_count();
    tracing::info!(
        nodes = total,
        terminated,
        failed_roots,
        expired,
        live,
        elapsed = ?started.elapsed(),
        "Soak finished"
    );

    if terminated != total {
        bail!("{terminated} termination callbacks for {total} nodes");
    }
    if live != 0 {
        bail!("node table still holds {live} nodes");
    }
    Ok(())
}
