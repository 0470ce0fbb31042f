//! Sync scheduling: periodic timer, debounced local changes and external
//! triggers.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// Why an attempt was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTrigger {
    /// The automatic sync interval elapsed.
    Timer,
    /// Local edits settled after the debounce delay.
    LocalChange,
    /// The remote account availability changed.
    AccountChanged,
}

/// Background loop turning triggers into attempt requests.
pub(crate) struct Scheduler {
    triggers: mpsc::UnboundedReceiver<SyncTrigger>,
    interval: watch::Receiver<Option<Duration>>,
    shutdown: watch::Receiver<bool>,
    debounce: Duration,
}

impl Scheduler {
    pub(crate) fn new(
        triggers: mpsc::UnboundedReceiver<SyncTrigger>,
        interval: watch::Receiver<Option<Duration>>,
        shutdown: watch::Receiver<bool>,
        debounce: Duration,
    ) -> Self {
        Self {
            triggers,
            interval,
            shutdown,
            debounce,
        }
    }

    fn make_ticker(period: Option<Duration>) -> Option<Interval> {
        period.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        })
    }

    async fn wait_for_tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn wait_until(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Run until shutdown, calling `on_trigger` for each attempt request.
    ///
    /// `on_trigger` must not block; the engine spawns the attempt so that a
    /// long sync never delays the timer.
    pub(crate) async fn run<F>(mut self, on_trigger: F)
    where
        F: Fn(SyncTrigger) -> bool,
    {
        let mut ticker = Self::make_ticker(*self.interval.borrow_and_update());
        let mut debounce_deadline: Option<Instant> = None;

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }

                changed = self.interval.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let period = *self.interval.borrow_and_update();
                    debug!("Automatic sync interval set to {:?}", period);
                    ticker = Self::make_ticker(period);
                }

                trigger = self.triggers.recv() => {
                    match trigger {
                        None => break,
                        Some(SyncTrigger::LocalChange) => {
                            debounce_deadline = Some(Instant::now() + self.debounce);
                        }
                        Some(trigger) => {
                            if !on_trigger(trigger) {
                                break;
                            }
                        }
                    }
                }

                _ = Self::wait_for_tick(&mut ticker) => {
                    if !on_trigger(SyncTrigger::Timer) {
                        break;
                    }
                }

                _ = Self::wait_until(debounce_deadline) => {
                    debounce_deadline = None;
                    if !on_trigger(SyncTrigger::LocalChange) {
                        break;
                    }
                }
            }
        }

        info!("Sync scheduler shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Harness {
        triggers: mpsc::UnboundedSender<SyncTrigger>,
        interval: watch::Sender<Option<Duration>>,
        shutdown: watch::Sender<bool>,
        seen: Arc<Mutex<Vec<SyncTrigger>>>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn(debounce: Duration) -> Harness {
        let (triggers, rx) = mpsc::unbounded_channel();
        let (interval, interval_rx) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();

        let scheduler = Scheduler::new(rx, interval_rx, shutdown_rx, debounce);
        let task = tokio::spawn(scheduler.run(move |trigger| {
            recorded.lock().push(trigger);
            true
        }));
        Harness {
            triggers,
            interval,
            shutdown,
            seen,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_changes_are_debounced() {
        let h = spawn(Duration::from_secs(2));
        for _ in 0..5 {
            h.triggers.send(SyncTrigger::LocalChange).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(h.seen.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*h.seen.lock(), vec![SyncTrigger::LocalChange]);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_follows_interval_changes() {
        let h = spawn(Duration::from_secs(1));
        h.interval.send(Some(Duration::from_secs(10))).unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(h.seen.lock().len(), 3);

        h.interval.send(None).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.seen.lock().len(), 3);

        h.triggers.send(SyncTrigger::AccountChanged).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.seen.lock().last(), Some(&SyncTrigger::AccountChanged));

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }
}
