// Injectable time source
// Breaker cooldowns, bucket refills, cache TTLs and approval expiry all run
// off this trait so tests can advance time manually.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use agora_types::{AgoraError, Result};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_ms(&self) -> u64 {
        self.now().timestamp_millis().max(0) as u64
    }

    /// Cancel-observing sleep. Returns `Err(Cancelled)` if the token fires
    /// before the duration elapses.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<()>;
}

/// Wall-clock implementation used outside tests.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AgoraError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Manually advanced clock for deterministic tests. `advance` wakes every
/// pending sleeper; sleepers re-check their deadline against the new time.
#[derive(Clone)]
pub struct ManualClock {
    now_ms: Arc<Mutex<u64>>,
    tick: Arc<Notify>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(Mutex::new(start_ms)),
            tick: Arc::new(Notify::new()),
        }
    }

    pub fn advance(&self, delta: Duration) {
        {
            let mut now = self.now_ms.lock().expect("manual clock poisoned");
            *now += delta.as_millis() as u64;
        }
        self.tick.notify_waiters();
    }

    pub fn set_ms(&self, now_ms: u64) {
        *self.now_ms.lock().expect("manual clock poisoned") = now_ms;
        self.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = *self.now_ms.lock().expect("manual clock poisoned");
        Utc.timestamp_millis_opt(ms as i64).single().unwrap_or_else(Utc::now)
    }

    fn now_ms(&self) -> u64 {
        *self.now_ms.lock().expect("manual clock poisoned")
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        let deadline = self.now_ms() + duration.as_millis() as u64;
        loop {
            if self.now_ms() >= deadline {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgoraError::Cancelled),
                _ = self.tick.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_sleep_completes_after_advance() {
        let clock = ManualClock::new(1_000);
        let cancel = CancellationToken::new();
        let sleeper = {
            let clock = clock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_millis(500), &cancel).await })
        };
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(600));
        assert!(sleeper.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn manual_clock_sleep_observes_cancellation() {
        let clock = ManualClock::new(0);
        let cancel = CancellationToken::new();
        let sleeper = {
            let clock = clock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(60), &cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(sleeper.await.unwrap(), Err(AgoraError::Cancelled)));
    }
}
