//! WhoFi Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the WhoFi
//! positioning engine to run in both **Production** (tokio) and
//! **Simulation** (virtual clock) environments.
//!
//! # Core Concept
//!
//! The engine never reads the clock or writes to a socket directly:
//! - Time goes through [`EngineContext`] (`now()`, `sleep()`, `unix_secs()`)
//! - Output goes through a [`SnapshotSink`], typically a [`LatestWinsFeed`]
//!
//! # Example
//!
//! ```ignore
//! use whofi_env::{EngineContext, LatestWinsFeed};
//!
//! async fn agent_loop<Ctx: EngineContext>(ctx: &Ctx, feed: &LatestWinsFeed<Event>) {
//!     loop {
//!         ctx.sleep(Duration::from_millis(100)).await;
//!         for event in engine.close_epochs(ctx.unix_secs()) {
//!             feed.push(event.key(), event)?;
//!         }
//!     }
//! }
//! ```

mod context;
mod error;
mod feed;
mod sink;
mod tokio_impl;
mod types;

pub use context::EngineContext;
pub use error::EnvError;
pub use feed::{FeedStats, LatestWinsFeed};
pub use sink::SnapshotSink;
pub use tokio_impl::TokioContext;
pub use types::{EntityId, NodeId};
