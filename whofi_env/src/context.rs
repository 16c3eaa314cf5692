//! Core environment context trait for WhoFi agents.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the positioning engine can
/// run in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the system clock
/// - **Simulation**: `SimContext` - virtual clock advanced by the harness
///
/// # Determinism
///
/// For simulation, time only moves when the implementation moves it.
#[async_trait]
pub trait EngineContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for measurement timestamps.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Wall-clock time as fractional seconds since the Unix epoch.
    ///
    /// This is the time base of every timestamp inside the engine.
    fn unix_secs(&self) -> f64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}
