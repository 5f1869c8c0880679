// Live view: last-known data for one dashboard resource
// Background refreshes publish only on change; manual refreshes surface errors

use crate::errors::{Alert, ClientError};
use crate::polling::PollingScheduler;
use crate::telemetry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of fresh data for a live view
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self) -> Result<T, ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New data differed from the last-known data and was published
    Updated,
    /// New data was identical; observers were not notified
    Unchanged,
    /// Another refresh was in flight, or the view was closed
    Skipped,
    /// The fetch failed; last-known data kept
    Failed,
}

impl RefreshOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Updated => "updated",
            RefreshOutcome::Unchanged => "unchanged",
            RefreshOutcome::Skipped => "skipped",
            RefreshOutcome::Failed => "failed",
        }
    }
}

pub struct LiveView<T> {
    name: &'static str,
    fetcher: Arc<dyn Fetcher<T>>,
    data: watch::Sender<Option<T>>,
    /// Serializes fetches so responses are applied in order
    gate: Mutex<()>,
    cancel: CancellationToken,
    fetch_timeout: Duration,
}

impl<T> LiveView<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(name: &'static str, fetcher: Arc<dyn Fetcher<T>>, fetch_timeout: Duration) -> Self {
        let (data, _) = watch::channel(None);
        Self {
            name,
            fetcher,
            data,
            gate: Mutex::new(()),
            cancel: CancellationToken::new(),
            fetch_timeout,
        }
    }

    /// Observers are woken only when the published data changes
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.data.subscribe()
    }

    pub fn current(&self) -> Option<T> {
        self.data.borrow().clone()
    }

    /// Tear down: in-flight fetches are abandoned and their results discarded
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn fetch_bounded(&self) -> Result<T, ClientError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            result = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch()) => {
                result.unwrap_or(Err(ClientError::Timeout(self.fetch_timeout)))
            }
        }
    }

    fn publish(&self, fresh: T) -> RefreshOutcome {
        // A response that lands after teardown is never applied
        if self.cancel.is_cancelled() {
            return RefreshOutcome::Skipped;
        }
        let changed = self.data.send_if_modified(|current| {
            if current.as_ref() == Some(&fresh) {
                false
            } else {
                *current = Some(fresh);
                true
            }
        });
        if changed {
            RefreshOutcome::Updated
        } else {
            RefreshOutcome::Unchanged
        }
    }

    /// Background refresh. Never surfaces errors; a tick that arrives while
    /// another fetch is outstanding is dropped.
    pub async fn gentle_refresh(&self) -> RefreshOutcome {
        let outcome = match self.gate.try_lock() {
            Err(_) => RefreshOutcome::Skipped,
            Ok(_guard) => match self.fetch_bounded().await {
                Ok(fresh) => self.publish(fresh),
                Err(ClientError::Cancelled) => RefreshOutcome::Skipped,
                Err(e) => {
                    debug!(view = self.name, error = %e, "Background refresh failed, keeping last data");
                    RefreshOutcome::Failed
                }
            },
        };
        telemetry::record_poll_refresh(outcome.as_str());
        outcome
    }

    /// User-initiated refresh. Waits for any in-flight fetch, then fetches
    /// and reports failures as an alert.
    pub async fn manual_refresh(&self) -> Result<RefreshOutcome, Alert> {
        let _guard = self.gate.lock().await;
        let outcome = match self.fetch_bounded().await {
            Ok(fresh) => Ok(self.publish(fresh)),
            Err(ClientError::Cancelled) => Ok(RefreshOutcome::Skipped),
            Err(e) => {
                warn!(view = self.name, error = %e, "Manual refresh failed");
                Err(Alert::from_client_error(&e))
            }
        };
        let label = match &outcome {
            Ok(outcome) => outcome.as_str(),
            Err(_) => RefreshOutcome::Failed.as_str(),
        };
        telemetry::record_poll_refresh(label);
        outcome
    }

    /// Scheduler whose ticks run [`gentle_refresh`](Self::gentle_refresh) on this view
    pub fn scheduler(self: &Arc<Self>) -> PollingScheduler {
        let view = Arc::clone(self);
        PollingScheduler::new(move || {
            let view = Arc::clone(&view);
            async move {
                view.gentle_refresh().await;
            }
        })
    }
}

impl<T> Drop for LiveView<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AlertLevel;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// Replays scripted responses, optionally waiting on a gate first
    struct ScriptedFetcher {
        responses: StdMutex<VecDeque<Result<Vec<u32>, ClientError>>>,
        hold: Option<Arc<Notify>>,
        delay: Option<Duration>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<Vec<u32>, ClientError>>) -> Self {
            Self {
                responses: StdMutex::new(responses.into()),
                hold: None,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl Fetcher<Vec<u32>> for ScriptedFetcher {
        async fn fetch(&self) -> Result<Vec<u32>, ClientError> {
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn view(fetcher: ScriptedFetcher) -> Arc<LiveView<Vec<u32>>> {
        Arc::new(LiveView::new("test", Arc::new(fetcher), Duration::from_secs(10)))
    }

    #[tokio::test]
    async fn test_identical_data_does_not_notify() {
        let view = view(ScriptedFetcher::new(vec![Ok(vec![1, 2]), Ok(vec![1, 2])]));
        let mut rx = view.subscribe();

        assert_eq!(view.gentle_refresh().await, RefreshOutcome::Updated);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert_eq!(view.gentle_refresh().await, RefreshOutcome::Unchanged);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(view.current(), Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_changed_data_notifies() {
        let view = view(ScriptedFetcher::new(vec![Ok(vec![1]), Ok(vec![1, 2])]));
        let mut rx = view.subscribe();
        view.gentle_refresh().await;
        rx.borrow_and_update();

        assert_eq!(view.gentle_refresh().await, RefreshOutcome::Updated);
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_gentle_refresh_swallows_errors() {
        let view = view(ScriptedFetcher::new(vec![
            Ok(vec![5]),
            Err(ClientError::Transport("connection reset".to_string())),
        ]));
        view.gentle_refresh().await;

        assert_eq!(view.gentle_refresh().await, RefreshOutcome::Failed);
        assert_eq!(view.current(), Some(vec![5]));
    }

    #[tokio::test]
    async fn test_manual_refresh_surfaces_unauthorized_as_sticky_alert() {
        let view = view(ScriptedFetcher::new(vec![Err(ClientError::Unauthorized(
            "token expired".to_string(),
        ))]));

        let alert = view.manual_refresh().await.unwrap_err();
        assert_eq!(alert.level, AlertLevel::Error);
        assert!(!alert.expires);
    }

    #[tokio::test]
    async fn test_manual_refresh_other_errors_are_timed() {
        let view = view(ScriptedFetcher::new(vec![Err(ClientError::Status {
            status: 502,
            body: "Bad Gateway".to_string(),
        })]));

        let alert = view.manual_refresh().await.unwrap_err();
        assert!(alert.expires);
        assert!(alert.message.contains("502"));
    }

    #[tokio::test]
    async fn test_background_tick_dropped_while_fetch_outstanding() {
        let hold = Arc::new(Notify::new());
        let mut fetcher = ScriptedFetcher::new(vec![Ok(vec![1])]);
        fetcher.hold = Some(Arc::clone(&hold));
        let view = view(fetcher);

        let first = tokio::spawn({
            let view = Arc::clone(&view);
            async move { view.gentle_refresh().await }
        });
        tokio::task::yield_now().await;

        assert_eq!(view.gentle_refresh().await, RefreshOutcome::Skipped);

        hold.notify_one();
        assert_eq!(first.await.unwrap(), RefreshOutcome::Updated);
    }

    #[tokio::test]
    async fn test_close_discards_in_flight_fetch() {
        let hold = Arc::new(Notify::new());
        let mut fetcher = ScriptedFetcher::new(vec![Ok(vec![9])]);
        fetcher.hold = Some(Arc::clone(&hold));
        let view = view(fetcher);

        let pending = tokio::spawn({
            let view = Arc::clone(&view);
            async move { view.gentle_refresh().await }
        });
        tokio::task::yield_now().await;

        view.close();
        hold.notify_one();
        assert_eq!(pending.await.unwrap(), RefreshOutcome::Skipped);
        assert_eq!(view.current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out() {
        let mut fetcher = ScriptedFetcher::new(vec![Ok(vec![1]), Ok(vec![1])]);
        fetcher.delay = Some(Duration::from_secs(60));
        let view = view(fetcher);

        assert_eq!(view.gentle_refresh().await, RefreshOutcome::Failed);
        let alert = view.manual_refresh().await.unwrap_err();
        assert!(alert.message.contains("timed out"));
    }
}
