//! Simulation context implementing EngineContext for deterministic runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use whofi_env::EngineContext;

/// Simulation context backed by a virtual clock that only moves when
/// advanced (or slept on).
///
/// The master seed of a run lives here; the oracle's radio noise stream is
/// derived from it via [`SimContext::physics_seed`].
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn advance_time(&self, duration: Duration) {
        *self.virtual_time_ns.lock() += duration.as_nanos() as u64;
    }

    pub fn set_time(&self, time_ns: u64) {
        *self.virtual_time_ns.lock() = time_ns;
    }

    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock()
    }

    /// Seed for the oracle's radio noise, decorrelated from the master seed.
    pub fn physics_seed(&self) -> u64 {
        self.seed.wrapping_mul(0x9e3779b97f4a7c15)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl EngineContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping is the only way virtual time moves inside an agent loop
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_sim_context_unix_secs_offset() {
        let ctx = SimContext::new(42);
        ctx.advance_time(Duration::from_millis(250));
        assert!((ctx.unix_secs() - 1704067200.25).abs() < 1e-6);
    }

    #[test]
    fn test_sim_context_physics_seed() {
        assert_eq!(SimContext::new(7).physics_seed(), SimContext::new(7).physics_seed());
        assert_ne!(SimContext::new(7).physics_seed(), SimContext::new(8).physics_seed());
        assert_ne!(SimContext::new(7).physics_seed(), 7);
    }

    #[tokio::test]
    async fn test_sim_context_sleep_advances_clock() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.time_ns(), 100_000_000);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));
        assert_eq!(ctx1.now(), ctx2.now());
    }
}
