//! Agent Runtime - drives a [`PositioningEngine`] from an environment context.
//!
//! The engine itself is pure: every call takes an explicit `now`. The agent
//! supplies that clock from an [`EngineContext`], runs the periodic
//! epoch/sweep cadence and publishes the resulting events to a
//! [`SnapshotSink`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  PositioningAgent                    │
//! │  ctx.unix_secs() ──▶ engine.ingest / close_epochs    │
//! │                      engine.sweep (slower cadence)   │
//! │                            │                         │
//! │                            ▼                         │
//! │                 sink.publish(entity, event)          │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use whofi_core::agent_runtime::{AgentConfig, PositioningAgent};
//! use whofi_env::{LatestWinsFeed, TokioContext};
//!
//! let feed = Arc::new(LatestWinsFeed::new(256));
//! let agent = PositioningAgent::new(TokioContext::shared(), engine, feed.clone(), AgentConfig::default());
//! agent.run(shutdown_rx).await?;
//! ```

use crate::engine::{Accepted, PositioningEngine};
use crate::ingest::{NodeReport, Rejected};
use crate::types::{FeedEvent, Measurement};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use whofi_env::{EngineContext, EnvError, NodeId, SnapshotSink};

/// Configuration for a positioning agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent's logical name (for logging)
    pub name: String,

    /// Epoch-closing cadence (default: 100 ms)
    pub tick_interval_ms: u64,

    /// Coast/expiry sweep cadence (default: 500 ms)
    pub sweep_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "whofi-agent".to_string(),
            tick_interval_ms: 100,
            sweep_interval_ms: 500,
        }
    }
}

/// Couples an engine to a clock and an output sink.
///
/// Generic over the context so the same agent runs against tokio in
/// production and a virtual clock in simulation.
pub struct PositioningAgent<Ctx, S>
where
    Ctx: EngineContext,
    S: SnapshotSink<FeedEvent>,
{
    pub context: Arc<Ctx>,
    pub engine: Arc<PositioningEngine>,
    pub sink: Arc<S>,
    pub config: AgentConfig,
    tick_count: AtomicU64,
    last_sweep: Mutex<Option<f64>>,
}

impl<Ctx, S> PositioningAgent<Ctx, S>
where
    Ctx: EngineContext,
    S: SnapshotSink<FeedEvent>,
{
    pub fn new(context: Arc<Ctx>, engine: Arc<PositioningEngine>, sink: Arc<S>, config: AgentConfig) -> Self {
        Self {
            context,
            engine,
            sink,
            config,
            tick_count: AtomicU64::new(0),
            last_sweep: Mutex::new(None),
        }
    }

    /// Current engine time from the context.
    pub fn now_secs(&self) -> f64 {
        self.context.unix_secs()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Ingests a measurement using the context clock as arrival time.
    pub fn ingest(&self, measurement: &Measurement) -> Result<Accepted, Rejected> {
        self.engine.ingest(measurement, self.now_secs())
    }

    /// Records a node stats report, stamped with the context clock.
    pub fn report_node(&self, node_id: &NodeId, report: NodeReport) -> bool {
        self.engine.report_node(node_id, report, self.now_secs())
    }

    /// Closes due epochs, sweeps when the sweep interval elapsed, and
    /// publishes every resulting event. Returns the number published.
    pub fn tick(&self) -> Result<usize, EnvError> {
        self.tick_count.fetch_add(1, Ordering::Relaxed);
        let now = self.now_secs();

        let mut events = self.engine.close_epochs(now);
        if self.sweep_due(now) {
            events.extend(self.engine.sweep(now));
        }

        let published = events.len();
        for event in events {
            let key = event.entity_id().to_string();
            self.sink.publish(&key, event)?;
        }
        Ok(published)
    }

    fn sweep_due(&self, now: f64) -> bool {
        let interval = Duration::from_millis(self.config.sweep_interval_ms).as_secs_f64();
        let mut last = self.last_sweep.lock();
        match *last {
            Some(t) if now - t < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Ticks at the configured cadence until `shutdown` flips to `true` or
    /// its sender is dropped, then closes the sink.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EnvError> {
        let interval = Duration::from_millis(self.config.tick_interval_ms);
        info!(agent = %self.config.name, interval_ms = self.config.tick_interval_ms, "agent started");

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                _ = self.context.sleep(interval) => {
                    match self.tick() {
                        Ok(0) => {}
                        Ok(n) => debug!(agent = %self.config.name, events = n, "tick published"),
                        Err(e) => break Err(e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        self.sink.close();
        info!(agent = %self.config.name, ticks = self.tick_count(), "agent stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationParams, Node, NodeTable};
    use crate::config::EngineConfig;
    use crate::types::{Signal, TrackState};
    use manual_clock::ManualContext;
    use whofi_env::{EntityId, LatestWinsFeed, NodeId};

    mod manual_clock {
        use parking_lot::Mutex;
        use std::time::{Duration, SystemTime, UNIX_EPOCH};
        use whofi_env::EngineContext;

        /// Clock that only moves when told to (or when slept on).
        pub struct ManualContext {
            secs: Mutex<f64>,
        }

        impl ManualContext {
            pub fn at(secs: f64) -> Self {
                Self { secs: Mutex::new(secs) }
            }

            pub fn set(&self, secs: f64) {
                *self.secs.lock() = secs;
            }
        }

        #[async_trait::async_trait]
        impl EngineContext for ManualContext {
            fn now(&self) -> Duration {
                Duration::from_secs_f64(*self.secs.lock())
            }

            fn system_time(&self) -> SystemTime {
                UNIX_EPOCH + self.now()
            }

            async fn sleep(&self, duration: Duration) {
                *self.secs.lock() += duration.as_secs_f64();
                tokio::task::yield_now().await;
            }
        }
    }

    fn agent(
        start: f64,
    ) -> (
        Arc<PositioningAgent<ManualContext, LatestWinsFeed<FeedEvent>>>,
        Arc<ManualContext>,
        Arc<LatestWinsFeed<FeedEvent>>,
    ) {
        let table = NodeTable::new(
            vec![
                Node::new("a", 0.0, 0.0),
                Node::new("b", 10.0, 0.0),
                Node::new("c", 5.0, 8.66),
            ],
            CalibrationParams::default(),
        )
        .unwrap();
        let engine = Arc::new(PositioningEngine::new(EngineConfig::default(), table).unwrap());
        let ctx = Arc::new(ManualContext::at(start));
        let feed = Arc::new(LatestWinsFeed::new(16));
        let agent = Arc::new(PositioningAgent::new(
            ctx.clone(),
            engine,
            feed.clone(),
            AgentConfig::default(),
        ));
        (agent, ctx, feed)
    }

    fn measurement(node: &str, rssi: f64, ts: f64) -> Measurement {
        Measurement {
            node_id: NodeId::from(node),
            entity_id: EntityId::from("phone"),
            signal: Signal::rssi(rssi),
            timestamp: ts,
            sequence_no: 1,
        }
    }

    fn feed_triangle(agent: &PositioningAgent<ManualContext, LatestWinsFeed<FeedEvent>>, ts: f64) {
        // Entity at (5, 3) under the default path-loss model
        for (node, distance) in [("a", 34.0_f64.sqrt()), ("b", 34.0_f64.sqrt()), ("c", 5.66)] {
            agent
                .ingest(&measurement(node, -30.0 - 20.0 * distance.log10(), ts))
                .unwrap();
        }
    }

    #[test]
    fn test_agent_config_default() {
        let config = AgentConfig::default();
        assert_eq!(config.tick_interval_ms, 100);
        assert_eq!(config.sweep_interval_ms, 500);
    }

    #[tokio::test]
    async fn test_tick_publishes_closed_epoch() {
        let (agent, ctx, feed) = agent(1000.0);
        feed_triangle(&agent, 1000.0);

        assert_eq!(agent.tick().unwrap(), 0);
        ctx.set(1000.4);
        assert_eq!(agent.tick().unwrap(), 1);

        let (key, event) = feed.try_recv().unwrap();
        assert_eq!(key, "phone");
        assert!(matches!(event, FeedEvent::Position(s) if s.state == TrackState::Tracking));
        assert_eq!(agent.tick_count(), 2);
    }

    #[tokio::test]
    async fn test_tick_publishes_expiry() {
        let (agent, ctx, feed) = agent(1000.0);
        feed_triangle(&agent, 1000.0);
        ctx.set(1000.4);
        agent.tick().unwrap();
        feed.drain();

        ctx.set(1020.0);
        agent.tick().unwrap();
        let events: Vec<FeedEvent> = feed.drain().into_iter().map(|(_, e)| e).collect();
        assert!(events.iter().any(|e| matches!(e, FeedEvent::Expired { .. })));
    }

    #[tokio::test]
    async fn test_report_node_is_stamped_with_context_time() {
        let (agent, _ctx, _feed) = agent(1000.0);
        let report = NodeReport {
            packets: 7,
            enabled: true,
            uptime_s: 30.0,
        };
        assert!(agent.report_node(&NodeId::from("a"), report));

        let status = agent.engine.node_status(1000.0);
        let a = status.iter().find(|s| s.node_id.as_str() == "a").unwrap();
        assert_eq!(a.reported_at, Some(1000.0));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (agent, _ctx, feed) = agent(1000.0);
        let (tx, rx) = watch::channel(false);

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(rx).await })
        };
        while agent.tick_count() < 3 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();

        runner.await.unwrap().unwrap();
        assert!(feed.is_closed());
    }
}
