// Polling scheduler: periodic refresh with a per-second countdown
// Countdown and refresh are driven by one loop so they cannot drift apart

use crate::bulk::RefreshTrigger;
use crate::telemetry;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TICK: Duration = Duration::from_secs(1);

type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    Idle,
    Active { interval: Duration },
}

struct Active {
    interval: Duration,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    commands: mpsc::UnboundedSender<()>,
}

struct Inner {
    /// Bumped on every enable/disable; a loop from an older generation stops
    generation: u64,
    active: Option<Active>,
    in_flight: Option<JoinHandle<()>>,
    /// Identifies the current refresh task; a stale task leaves state alone
    refresh_seq: u64,
    /// An explicit refresh arrived while another was in flight
    pending: bool,
    countdown: watch::Sender<u64>,
}

impl Inner {
    fn is_refreshing(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the current refresh task and forget any queued request
    fn abort_refresh(&mut self) {
        self.refresh_seq += 1;
        self.pending = false;
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort();
        }
    }
}

/// Start the refresh unless one is already in flight.
///
/// A busy tick is dropped. A busy explicit request is queued and runs once
/// after the in-flight refresh completes.
fn fire(shared: &Arc<Mutex<Inner>>, inner: &mut Inner, refresh: &RefreshFn, explicit: bool) {
    if inner.is_refreshing() {
        if explicit {
            debug!("Refresh in flight, queueing requested refresh");
            inner.pending = true;
        } else {
            debug!("Previous refresh still in flight, dropping tick");
            telemetry::record_poll_refresh("skipped");
        }
        return;
    }

    inner.refresh_seq += 1;
    inner.pending = false;
    let seq = inner.refresh_seq;
    let shared = Arc::clone(shared);
    let refresh = Arc::clone(refresh);
    inner.in_flight = Some(tokio::spawn(async move {
        loop {
            refresh().await;
            let again = {
                let mut inner = lock(&shared);
                if inner.refresh_seq != seq {
                    return;
                }
                let again = std::mem::take(&mut inner.pending);
                if !again {
                    inner.in_flight = None;
                }
                again
            };
            if !again {
                break;
            }
        }
    }));
}

fn lock(shared: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cancellable, resettable periodic refresh.
///
/// Idle until [`enable`](Self::enable); while active the countdown drops by
/// one each second and the refresh fires when it reaches zero. Must be used
/// from within a tokio runtime.
pub struct PollingScheduler {
    refresh: RefreshFn,
    shared: Arc<Mutex<Inner>>,
}

impl PollingScheduler {
    pub fn new<F, Fut>(refresh: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (countdown, _) = watch::channel(0);
        Self {
            refresh: Arc::new(move || Box::pin(refresh()) as BoxFuture<'static, ()>),
            shared: Arc::new(Mutex::new(Inner {
                generation: 0,
                active: None,
                in_flight: None,
                refresh_seq: 0,
                pending: false,
                countdown,
            })),
        }
    }

    pub fn state(&self) -> PollingState {
        match &lock(&self.shared).active {
            Some(active) => PollingState::Active {
                interval: active.interval,
            },
            None => PollingState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), PollingState::Active { .. })
    }

    /// Seconds until the next refresh; zero while idle
    pub fn countdown(&self) -> u64 {
        *lock(&self.shared).countdown.borrow()
    }

    pub fn subscribe_countdown(&self) -> watch::Receiver<u64> {
        lock(&self.shared).countdown.subscribe()
    }

    /// Start polling every `interval` (whole seconds, at least one).
    /// Enabling while active restarts the cycle.
    pub fn enable(&self, interval: Duration) {
        let seconds = interval.as_secs().max(1);
        let interval = Duration::from_secs(seconds);
        let mut inner = lock(&self.shared);
        Self::stop(&mut inner);

        let generation = inner.generation;
        let cancel = CancellationToken::new();
        let (commands, receiver) = mpsc::unbounded_channel();
        inner.countdown.send_replace(seconds);

        let task = tokio::spawn(run_loop(
            seconds,
            generation,
            Arc::clone(&self.shared),
            Arc::clone(&self.refresh),
            cancel.clone(),
            receiver,
        ));

        inner.active = Some(Active {
            interval,
            cancel,
            task,
            commands,
        });
        info!(interval_seconds = seconds, "Polling enabled");
    }

    /// Stop polling. No refresh fires afterwards and the countdown reads zero.
    pub fn disable(&self) {
        let mut inner = lock(&self.shared);
        let was_active = inner.active.is_some();
        Self::stop(&mut inner);
        inner.abort_refresh();
        if was_active {
            info!("Polling disabled");
        }
    }

    /// Refresh immediately and restart the countdown; Idle/Active is unchanged.
    /// If a refresh is already in flight, this one runs right after it.
    pub fn refresh_now(&self) {
        let mut inner = lock(&self.shared);
        let delivered = inner
            .active
            .as_ref()
            .is_some_and(|active| active.commands.send(()).is_ok());
        if !delivered {
            fire(&self.shared, &mut inner, &self.refresh, true);
        }
    }

    /// Disarm both timers together; caller holds the lock
    fn stop(inner: &mut Inner) {
        inner.generation += 1;
        if let Some(active) = inner.active.take() {
            active.cancel.cancel();
            active.task.abort();
        }
        inner.countdown.send_replace(0);
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.disable();
    }
}

impl RefreshTrigger for PollingScheduler {
    fn trigger_refresh(&self) {
        self.refresh_now();
    }
}

async fn run_loop(
    seconds: u64,
    generation: u64,
    shared: Arc<Mutex<Inner>>,
    refresh: RefreshFn,
    cancel: CancellationToken,
    mut commands: mpsc::UnboundedReceiver<()>,
) {
    let mut remaining = seconds;
    let mut ticker = interval_at(Instant::now() + TICK, TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let manual = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(()) = commands.recv() => true,
            _ = ticker.tick() => false,
        };

        let mut inner = lock(&shared);
        if inner.generation != generation {
            break;
        }
        if manual {
            fire(&shared, &mut inner, &refresh, true);
            remaining = seconds;
            ticker.reset();
        } else {
            remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                fire(&shared, &mut inner, &refresh, false);
                remaining = seconds;
            }
        }
        inner.countdown.send_replace(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting_scheduler() -> (PollingScheduler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let scheduler = PollingScheduler::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (scheduler, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_before_first_refresh() {
        let (scheduler, calls) = counting_scheduler();
        scheduler.enable(Duration::from_secs(10));
        assert_eq!(scheduler.countdown(), 10);

        sleep(Duration::from_secs(3)).await;
        scheduler.disable();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.countdown(), 0);
        assert_eq!(scheduler.state(), PollingState::Idle);

        // no ghost countdown or late refresh
        sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.countdown(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_fires_each_interval_and_resets_countdown() {
        let (scheduler, calls) = counting_scheduler();
        scheduler.enable(Duration::from_secs(5));

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(scheduler.countdown(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.countdown(), 5);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_while_active_restarts_countdown() {
        let (scheduler, calls) = counting_scheduler();
        scheduler.enable(Duration::from_secs(10));
        sleep(Duration::from_millis(3500)).await;
        assert_eq!(scheduler.countdown(), 7);

        scheduler.refresh_now();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.countdown(), 10);
        assert!(scheduler.is_active());

        // next automatic refresh is a full interval after the manual one
        sleep(Duration::from_secs(9)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_while_idle_stays_idle() {
        let (scheduler, calls) = counting_scheduler();
        scheduler.refresh_now();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), PollingState::Idle);
        assert_eq!(scheduler.countdown(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_refresh_trigger_refreshes_once() {
        let (scheduler, calls) = counting_scheduler();
        let trigger: &dyn RefreshTrigger = &scheduler;
        trigger.trigger_refresh();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_in_flight_refresh_runs_after_it() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let scheduler = PollingScheduler::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(3)).await;
            }
        });
        scheduler.enable(Duration::from_secs(5));

        // the tick at 5s starts a refresh that runs until 8s
        sleep(Duration::from_millis(5100)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        let trigger: &dyn RefreshTrigger = &scheduler;
        trigger.trigger_refresh();

        sleep(Duration::from_millis(2000)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        sleep(Duration::from_millis(2000)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_drops_queued_refresh() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let scheduler = PollingScheduler::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(3)).await;
            }
        });
        scheduler.refresh_now();
        sleep(Duration::from_millis(10)).await;
        scheduler.refresh_now();
        scheduler.disable();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_dropped_while_refresh_in_flight() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let scheduler = PollingScheduler::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(30)).await;
            }
        });
        scheduler.enable(Duration::from_secs(5));

        sleep(Duration::from_secs(12)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_disarms_timers() {
        let (scheduler, calls) = counting_scheduler();
        let countdown = scheduler.subscribe_countdown();
        scheduler.enable(Duration::from_secs(2));
        drop(scheduler);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*countdown.borrow(), 0);
    }
}
