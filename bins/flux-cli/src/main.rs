//! Command-line runner for declaratively specified pipelines.
//!
//! ```bash
//! # Run a pipeline from a YAML configuration file
//! flux --pipeline pipeline.yml
//!
//! # Tune inter-operator channel capacity and enable periodic checkpointing
//! flux --pipeline pipeline.yml --channel-capacity 256 --checkpoint-interval-ms 5000
//!
//! RUST_LOG=debug flux --pipeline pipeline.yml
//! ```
//!
//! The YAML file declares an ordered, source-to-sink list of operators built
//! from the `flux-ops` built-ins (`from_file`/`from_stdin`, `to_file`/
//! `to_stdout`, `batch`, `where`, `select`, `flatten`, `group`, `fork`,
//! `passthrough`) — format- and protocol-specific connectors are a plugin
//! concern and out of scope for this core.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use flux_core::control::{ControlPlane, NoSecrets};
use flux_core::diagnostics::TracingSink;
use flux_core::message::CheckpointId;
use flux_core::operator::Operator;
use flux_core::ErrorKind;
use flux_exec::checkpoint::CheckpointCoordinator;
use flux_exec::compose::compose;
use flux_exec::schedule::{spawn, ExecutorConfig, PipelineHandle, SnapshotReport};

mod config;

use config::PipelineConfig;

#[derive(Parser, Debug)]
#[command(name = "flux", about = "Run a declaratively specified data pipeline")]
struct Args {
    /// Path to a YAML pipeline configuration.
    #[arg(long)]
    pipeline: PathBuf,

    /// Directory durable checkpoint state is written under.
    #[arg(long, default_value = "flux-state")]
    state_dir: PathBuf,

    /// Bounded capacity of every inter-operator channel.
    #[arg(long, default_value_t = flux_core::message::DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// How long to wait for operators to drain after a shutdown request.
    #[arg(long, default_value_t = 10)]
    shutdown_grace_secs: u64,

    /// Take a checkpoint on this cadence. Omit to run without checkpointing.
    #[arg(long)]
    checkpoint_interval_ms: Option<u64>,

    /// Allow operators that declare themselves unsafe (shell execution, etc.) to run.
    #[arg(long, default_value_t = false)]
    allow_unsafe_pipelines: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.pipeline)
        .with_context(|| format!("failed to read pipeline config at {}", args.pipeline.display()))?;
    let pipeline_config: PipelineConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse pipeline config at {}", args.pipeline.display()))?;

    if pipeline_config.operators.is_empty() {
        bail!("pipeline `{}` declares no operators", pipeline_config.pipeline_id);
    }

    let mut operators: Vec<Box<dyn Operator>> = pipeline_config
        .operators
        .iter()
        .map(config::build_operator)
        .collect::<anyhow::Result<_>>()?;
    let operator_count = operators.len();

    let coordinator = CheckpointCoordinator::open_local(&args.state_dir, &pipeline_config.pipeline_id, operator_count)
        .context("failed to open checkpoint state directory")?;

    // Spec §4.G: a blob that fails to decode aborts restore with a
    // `state_corruption` error and falls back to the last-known-good earlier
    // checkpoint if one is present, otherwise to scratch — never aborts the
    // whole run over one corrupt checkpoint that still has a usable
    // predecessor on disk.
    match coordinator.restore_with_fallback(&mut operators).await? {
        Some(restored) => tracing::info!(checkpoint_id = %restored, "restored from committed checkpoint"),
        None => tracing::info!("no usable committed checkpoint found, starting from scratch"),
    }

    let composed = compose(operators).context("pipeline failed adjacency/kind checks")?;

    let control = ControlPlane::new(Arc::new(TracingSink), Arc::new(NoSecrets))
        .with_unsafe_pipelines_allowed(args.allow_unsafe_pipelines);
    let cancel = CancellationToken::new();
    let executor_config = ExecutorConfig {
        channel_capacity: args.channel_capacity,
        shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
    };
    let (handle, snapshot_rx, barrier_tx) = spawn(composed, control, cancel.clone(), executor_config);

    let checkpoint_task = args.checkpoint_interval_ms.map(|ms| {
        tokio::spawn(run_checkpoint_loop(
            coordinator,
            snapshot_rx,
            barrier_tx,
            Duration::from_millis(ms),
            cancel.child_token(),
        ))
    });

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c, requesting pipeline shutdown");
            ctrl_c_cancel.cancel();
        }
    });

    run_to_completion(handle, Duration::from_secs(args.shutdown_grace_secs)).await?;

    cancel.cancel();
    if let Some(task) = checkpoint_task {
        let _ = task.await;
    }

    Ok(())
}

/// Joins a running pipeline, tolerating (rather than failing on) the
/// `Cancelled` error a graceful shutdown produces, and bounding the overall
/// wait so a wedged operator cannot hang the process forever.
async fn run_to_completion(handle: PipelineHandle, grace: Duration) -> anyhow::Result<()> {
    match tokio::time::timeout(grace, handle.join()).await {
        Ok(Ok(())) => {
            tracing::info!("pipeline finished");
            Ok(())
        }
        Ok(Err(e)) if e.kind == ErrorKind::Cancelled => {
            tracing::info!("pipeline cancelled");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_elapsed) => {
            tracing::warn!(?grace, "pipeline did not shut down within grace period");
            Ok(())
        }
    }
}

/// Periodically injects a barrier at the source and runs a checkpoint round
/// to completion, committing once every operator has acked.
async fn run_checkpoint_loop(
    mut coordinator: CheckpointCoordinator,
    mut snapshots: mpsc::UnboundedReceiver<SnapshotReport>,
    barrier_tx: mpsc::UnboundedSender<CheckpointId>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let checkpoint_id = coordinator.next_checkpoint_id();
        if barrier_tx.send(checkpoint_id).is_err() {
            tracing::debug!("pipeline gone, stopping checkpoint loop");
            return;
        }
        match coordinator.run_round(checkpoint_id, &mut snapshots).await {
            Ok(true) => tracing::info!(%checkpoint_id, "checkpoint committed"),
            Ok(false) => {
                tracing::debug!("checkpoint round cut short by shutdown");
                return;
            }
            Err(e) => tracing::warn!(error = %e, "checkpoint round failed"),
        }
    }
}
