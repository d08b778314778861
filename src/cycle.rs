//! # Main Cycle
//!
//! Fixed-period scheduler for the unit's outbound work. Each tick runs one
//! step to completion; stopping, either through [`MainCycle::stop`] or the
//! caller's cancellation token, ends the loop before the next tick. A stop
//! issued before the loop starts is kept and ends that run at once.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use sysinfo::System;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleState {
    pub running: bool,
    pub stop_requested: bool,
    pub last_state_send: Option<Instant>,
}

#[derive(Debug)]
pub struct MainCycle {
    period: Duration,
    state: Mutex<CycleState>,
    stop_signal: Notify,
}

impl MainCycle {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            state: Mutex::new(CycleState::default()),
            stop_signal: Notify::new(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut CycleState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut *guard),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    pub fn state(&self) -> CycleState {
        self.with_state(|s| *s)
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|s| s.running)
    }

    pub fn stop(&self) {
        info!("Stopping main cycle");
        self.with_state(|s| {
            s.running = false;
            s.stop_requested = true;
        });
        self.stop_signal.notify_waiters();
    }

    /// True when nothing was sent yet or `interval` has passed since the last send.
    pub fn state_send_due(&self, interval: Duration, now: Instant) -> bool {
        self.with_state(|s| {
            s.last_state_send
                .map_or(true, |last| now.saturating_duration_since(last) >= interval)
        })
    }

    pub fn mark_state_sent(&self, now: Instant) {
        self.with_state(|s| s.last_state_send = Some(now));
    }

    /// Runs `step` once per period until stopped or `cancel` fires.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut step: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let stopped_early = self.with_state(|s| {
            if s.stop_requested {
                s.stop_requested = false;
                true
            } else {
                s.running = true;
                false
            }
        });
        if stopped_early {
            info!("Main cycle stopped before it started");
            return;
        }
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Main cycle started with period {:?}", self.period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Main cycle cancelled");
                    break;
                }
                _ = self.stop_signal.notified() => break,
                _ = ticker.tick() => {
                    if !self.is_running() {
                        break;
                    }
                    step().await;
                }
            }
        }

        self.with_state(|s| {
            s.running = false;
            s.stop_requested = false;
        });
        debug!("Main cycle finished");
    }
}

/// Snapshot published on `state/pepeunit`.
pub fn system_state(commit_version: &str) -> Value {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_frequency();

    let available = sys.available_memory();
    let total = sys.total_memory();
    let freq = sys.cpus().first().map_or(0, |cpu| cpu.frequency());

    json!({
        "millis": Utc::now().timestamp_millis(),
        "mem_free": available,
        "mem_alloc": total.saturating_sub(available),
        "freq": freq,
        "commit_version": commit_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stop_from_step_ends_loop_before_next_tick() {
        let cycle = Arc::new(MainCycle::new(Duration::from_millis(5)));
        let ticks = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let (c, t) = (cycle.clone(), ticks.clone());
        cycle
            .run(&token, move || {
                let (c, t) = (c.clone(), t.clone());
                async move {
                    if t.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        c.stop();
                    }
                }
            })
            .await;

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!cycle.is_running());
    }

    #[tokio::test]
    async fn stop_before_run_is_honoured_once() {
        let cycle = MainCycle::new(Duration::from_millis(5));
        let ticks = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        cycle.stop();

        let t = ticks.clone();
        cycle
            .run(&token, move || {
                t.fetch_add(1, Ordering::SeqCst);
                async {}
            })
            .await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert!(!cycle.state().stop_requested);

        // The request was consumed, so the next run ticks until stopped.
        let cycle = Arc::new(cycle);
        let (c, t) = (cycle.clone(), ticks.clone());
        cycle
            .run(&token, move || {
                let (c, t) = (c.clone(), t.clone());
                async move {
                    if t.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                        c.stop();
                    }
                }
            })
            .await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_token_ends_loop() {
        let cycle = Arc::new(MainCycle::new(Duration::from_millis(5)));
        let token = CancellationToken::new();
        let runner = {
            let (cycle, token) = (cycle.clone(), token.clone());
            tokio::spawn(async move { cycle.run(&token, || async {}).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cycle.is_running());
        token.cancel();
        runner.await.unwrap();
        assert!(!cycle.is_running());
    }

    #[test]
    fn state_send_schedule() {
        let cycle = MainCycle::new(Duration::from_millis(100));
        let start = Instant::now();
        let interval = Duration::from_secs(300);

        assert!(cycle.state_send_due(interval, start));
        cycle.mark_state_sent(start);
        assert!(!cycle.state_send_due(interval, start + Duration::from_secs(10)));
        assert!(cycle.state_send_due(interval, start + interval));
    }

    #[test]
    fn snapshot_has_every_field() {
        let state = system_state("abc123");
        for key in ["millis", "mem_free", "mem_alloc", "freq", "commit_version"] {
            assert!(state.get(key).is_some(), "missing {key}");
        }
        assert_eq!(state["commit_version"], "abc123");
    }
}
