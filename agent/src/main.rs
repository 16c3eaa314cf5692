//! WhoFi Agent - bridges node payloads on stdin to the position feed on stdout.
//!
//! Reads one JSON node record per line, runs observations through the
//! positioning engine, records node stats reports, and writes every
//! published feed event as one JSON line:
//!
//! ```text
//! {"node":"n1","entity":"aa:bb","rssi":-61,"timestamp":1700000000.1,"seq":1}
//!   ──▶ {"event":"position","entity_id":"aa:bb","x":4.9,"y":3.1,...}
//! ```
//!
//! Logs go to stderr. EOF or Ctrl-C flushes the open epochs and exits.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use whofi_core::{AgentConfig, EngineConfig, FeedEvent, NodeTableFile, PositioningAgent, PositioningEngine};
use whofi_env::{LatestWinsFeed, TokioContext};

mod payload;

use payload::NodeRecord;

/// WhoFi positioning agent
#[derive(Parser, Debug)]
#[command(name = "whofi-agent")]
#[command(about = "Multi-node RF positioning: node payloads in, tracks out", long_about = None)]
struct Args {
    /// Node table (JSON)
    #[arg(short, long)]
    nodes: PathBuf,

    /// Engine configuration (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Epoch-closing cadence in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let nodes = NodeTableFile::from_path(&args.nodes)
        .with_context(|| format!("loading node table {}", args.nodes.display()))?;

    let flush_after = Duration::from_secs_f64(config.epoch.window_s) + Duration::from_millis(args.tick_ms * 2);
    let feed = Arc::new(LatestWinsFeed::<FeedEvent>::new(config.output.capacity));
    let engine = Arc::new(PositioningEngine::from_file(config, nodes).context("starting positioning engine")?);
    info!(estimator = engine.estimator_name(), nodes = engine.calibration().len(), "whofi agent ready");

    let agent = Arc::new(PositioningAgent::new(
        TokioContext::shared(),
        Arc::clone(&engine),
        Arc::clone(&feed),
        AgentConfig {
            tick_interval_ms: args.tick_ms,
            ..AgentConfig::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.run(shutdown_rx).await })
    };
    let writer = tokio::spawn(write_events(Arc::clone(&feed)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => ingest_line(&agent, &line),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    // Let the last epochs close before stopping
    tokio::time::sleep(flush_after).await;
    let _ = shutdown_tx.send(true);
    runner.await.context("agent task panicked")??;
    writer.await.context("writer task panicked")??;

    let stats = engine.stats();
    info!(
        accepted = stats.accepted,
        rejected = stats.total_rejected(),
        solves = stats.solves,
        tracks = stats.active_tracks,
        "whofi agent stopped"
    );
    Ok(())
}

fn ingest_line<Ctx, S>(agent: &PositioningAgent<Ctx, S>, line: &str)
where
    Ctx: whofi_env::EngineContext,
    S: whofi_env::SnapshotSink<FeedEvent>,
{
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let measurement = match NodeRecord::parse(line) {
        Ok(NodeRecord::Stats(stats)) => {
            agent.report_node(&stats.node_id(), stats.report());
            return;
        }
        Ok(NodeRecord::Observation(payload)) => match payload.into_measurement() {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "skipping malformed payload");
                return;
            }
        },
        Err(e) => {
            warn!(error = %e, "skipping malformed payload");
            return;
        }
    };
    if let Err(rejected) = agent.ingest(&measurement) {
        debug!(reason = %rejected.reason(), "payload rejected");
    }
}

/// Drains the feed to stdout until it is closed.
async fn write_events(feed: Arc<LatestWinsFeed<FeedEvent>>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some((_, event)) = feed.recv().await {
        let mut line = serde_json::to_vec(&event).context("encoding feed event")?;
        line.push(b'\n');
        stdout.write_all(&line).await.context("writing stdout")?;
    }
    stdout.flush().await.context("flushing stdout")?;
    Ok(())
}
