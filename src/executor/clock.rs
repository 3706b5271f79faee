//! Pause handling and pause-aware time.
//!
//! Pausing is not cancellation: a paused run keeps its in-flight iterations
//! and only stops starting new ones. Executor schedules are expressed in
//! *active* time, which excludes every paused interval, so a 30s scenario
//! paused for 10s still runs 30s worth of load.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};

#[derive(Debug, Default)]
struct PauseClock {
    since: Option<Instant>,
    total: Duration,
}

#[derive(Debug)]
struct Inner {
    tx: watch::Sender<bool>,
    clock: Mutex<PauseClock>,
}

#[derive(Debug, Clone)]
pub struct PauseGate {
    inner: Arc<Inner>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PauseGate {
    pub fn new(paused: bool) -> Self {
        let (tx, _) = watch::channel(paused);
        let clock = PauseClock {
            since: paused.then(Instant::now),
            total: Duration::ZERO,
        };
        Self {
            inner: Arc::new(Inner {
                tx,
                clock: Mutex::new(clock),
            }),
        }
    }

    /// Returns `false` when the gate was already in the requested state.
    pub fn set_paused(&self, paused: bool) -> bool {
        {
            let mut clock = self.inner.clock.lock();
            match (paused, clock.since) {
                (true, None) => clock.since = Some(Instant::now()),
                (false, Some(since)) => {
                    clock.total += since.elapsed();
                    clock.since = None;
                }
                _ => return false,
            }
        }
        self.inner.tx.send_replace(paused);
        true
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Total time spent paused so far, including an ongoing pause.
    pub fn paused_total(&self) -> Duration {
        let clock = self.inner.clock.lock();
        clock.total + clock.since.map_or(Duration::ZERO, |s| s.elapsed())
    }

    pub async fn wait_resumed(&self) {
        let mut rx = self.inner.tx.subscribe();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    pub async fn wait_paused(&self) {
        let mut rx = self.inner.tx.subscribe();
        let _ = rx.wait_for(|paused| *paused).await;
    }

    pub fn stopwatch(&self) -> Stopwatch {
        Stopwatch {
            gate: self.clone(),
            start: Instant::now(),
            paused_at_start: self.paused_total(),
        }
    }
}

/// Measures active time from its creation.
#[derive(Debug, Clone)]
pub struct Stopwatch {
    gate: PauseGate,
    start: Instant,
    paused_at_start: Duration,
}

impl Stopwatch {
    pub fn elapsed(&self) -> Duration {
        let paused = self.gate.paused_total().saturating_sub(self.paused_at_start);
        self.start.elapsed().saturating_sub(paused)
    }

    /// Sleeps until `offset` of active time has passed since the start.
    pub async fn wait_until(&self, offset: Duration) {
        loop {
            self.gate.wait_resumed().await;
            let now = self.elapsed();
            if now >= offset {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(offset - now) => {}
                _ = self.gate.wait_paused() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn paused_time_is_excluded() {
        let gate = PauseGate::default();
        let sw = gate.stopwatch();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(gate.set_paused(true));
        assert!(!gate.set_paused(true));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sw.elapsed(), Duration::from_secs(2));

        gate.set_paused(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sw.elapsed(), Duration::from_secs(3));
        assert_eq!(gate.paused_total(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_stretches_over_pauses() {
        let gate = PauseGate::default();
        let sw = gate.stopwatch();
        let start = Instant::now();

        let pauser = tokio::spawn({
            let gate = gate.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                gate.set_paused(true);
                tokio::time::sleep(Duration::from_secs(4)).await;
                gate.set_paused(false);
            }
        });

        sw.wait_until(Duration::from_secs(3)).await;
        pauser.await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert_eq!(sw.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn wait_resumed_returns_when_running() {
        let gate = PauseGate::new(false);
        gate.wait_resumed().await;
        assert!(!gate.is_paused());
    }
}
