use async_trait::async_trait;
use tokio::time::{Duration, Instant};

/// Time source for the polling loops.
///
/// Injected instead of calling `tokio::time` directly so tests can drive
/// the clock rather than flipping a global "sleeps enabled" switch.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, dur: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

#[async_trait]
impl Clock for WallClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}
