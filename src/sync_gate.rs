//! Manual sync trigger with a cooldown, and reconciliation of the backend's
//! "last sync" record.
//!
//! The backend stores only the time of day its sync task last ran, in
//! facility time. After we trigger a sync the endpoint answers before that
//! record is written, so the gate records "now" optimistically and then polls
//! the record until it moves. Observers follow [`SyncState`] through a
//! `watch` channel.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{OrderBackend, SyncEndpoint};
use crate::clock::{latest_instant_for_time_of_day, parse_time_of_day, Clock};
use crate::error::{DashboardError, Result};

pub const SYNC_SUCCESS_MESSAGE: &str = "Sincronización completada";

#[derive(Debug, Clone)]
pub struct SyncTimings {
    /// Minimum time between two manual syncs.
    pub cooldown: Duration,
    pub poll_interval: Duration,
    /// Give up waiting for the backend record after this long.
    pub poll_timeout: Duration,
    /// The record must move by more than this to count as a new sync.
    pub confirm_tolerance: Duration,
    pub error_message_ttl: Duration,
    pub success_message_ttl: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(60),
            confirm_tolerance: Duration::from_secs(1),
            error_message_ttl: Duration::from_secs(5),
            success_message_ttl: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Epoch millis of the last known sync.
    pub last_sync_timestamp: Option<i64>,
    pub syncing: bool,
    /// Transient message for the user; cleared after a few seconds.
    pub sync_message: Option<String>,
}

/// True when no sync is recorded or the cooldown has fully elapsed.
pub fn cooldown_elapsed(last_sync: Option<i64>, now_millis: i64, cooldown: Duration) -> bool {
    match last_sync {
        None => true,
        Some(last) => now_millis - last > cooldown.as_millis() as i64,
    }
}

/// `M:SS`, rounding partial seconds up so a blocked gate never shows `0:00`.
pub fn format_countdown(remaining_millis: i64) -> String {
    let secs = (remaining_millis.max(0) + 999) / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

pub struct SyncGate {
    backend: Arc<dyn OrderBackend>,
    endpoint: Option<Arc<dyn SyncEndpoint>>,
    clock: Arc<dyn Clock>,
    task_name: String,
    timings: SyncTimings,
    state: Arc<watch::Sender<SyncState>>,
    message_seq: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl SyncGate {
    pub fn new(
        backend: Arc<dyn OrderBackend>,
        endpoint: Option<Arc<dyn SyncEndpoint>>,
        clock: Arc<dyn Clock>,
        task_name: &str,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        Self {
            backend,
            endpoint,
            clock,
            task_name: task_name.to_string(),
            timings: SyncTimings::default(),
            state: Arc::new(state),
            message_seq: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_timings(mut self, timings: SyncTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn has_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Stop any poll loop. Pending messages are cleared right away.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Read the control record and resolve it to the most recent matching
    /// instant. Missing, unreadable or unparseable records all mean "never
    /// synced".
    pub async fn get_latest_sync_timestamp(&self) -> Option<i64> {
        let raw = match self.backend.fetch_control_time(&self.task_name).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(task = %self.task_name, "no sync control record");
                return None;
            }
            Err(e) => {
                warn!(task = %self.task_name, error = %e, "failed to read sync control record");
                return None;
            }
        };
        let Some(time_of_day) = parse_time_of_day(&raw) else {
            warn!(task = %self.task_name, raw = %raw, "unparseable sync control time");
            return None;
        };
        Some(latest_instant_for_time_of_day(time_of_day, self.clock.now()).timestamp_millis())
    }

    /// Load the backend's last sync time into the gate state.
    pub async fn refresh_timestamp(&self) -> Option<i64> {
        let latest = self.get_latest_sync_timestamp().await;
        self.state.send_modify(|s| s.last_sync_timestamp = latest);
        latest
    }

    pub fn can_sync(&self) -> bool {
        cooldown_elapsed(
            self.state.borrow().last_sync_timestamp,
            self.clock.now_millis(),
            self.timings.cooldown,
        )
    }

    /// Remaining cooldown as `M:SS`, or `None` when a sync is allowed.
    pub fn time_until_next_sync(&self) -> Option<String> {
        let last = self.state.borrow().last_sync_timestamp;
        let now = self.clock.now_millis();
        if cooldown_elapsed(last, now, self.timings.cooldown) {
            return None;
        }
        let last = last?;
        let remaining = self.timings.cooldown.as_millis() as i64 - (now - last);
        Some(format_countdown(remaining))
    }

    /// Trigger a backend sync, wait for the backend to record it, then run
    /// `refresh` (normally a full pipeline run).
    ///
    /// Refused while another sync runs or the cooldown is active. The
    /// `syncing` flag is cleared on every exit path. Returns whatever
    /// `refresh` produced.
    pub async fn sync_registries<F, Fut, T>(&self, refresh: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| DashboardError::Config("no sync endpoint configured".into()))?;

        if let Some(remaining) = self.time_until_next_sync() {
            return Err(DashboardError::SyncCooldown { remaining });
        }
        let claimed = self.state.send_if_modified(|s| {
            if s.syncing {
                false
            } else {
                s.syncing = true;
                true
            }
        });
        if !claimed {
            return Err(DashboardError::SyncInProgress);
        }

        let result = self.run_sync(endpoint.as_ref(), refresh).await;
        self.state.send_modify(|s| s.syncing = false);
        result
    }

    async fn run_sync<F, Fut, T>(&self, endpoint: &dyn SyncEndpoint, refresh: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let previous = self.state.borrow().last_sync_timestamp;

        if let Err(e) = endpoint.trigger().await {
            warn!(error = %e, "sync trigger failed");
            self.show_message(
                format!("Error al sincronizar: {e}"),
                self.timings.error_message_ttl,
            );
            return Err(e);
        }

        let optimistic = self.clock.now_millis();
        self.state
            .send_modify(|s| s.last_sync_timestamp = Some(optimistic));
        info!(previous = ?previous, "sync triggered, waiting for backend confirmation");

        match self.await_confirmation(previous).await? {
            Some(confirmed) => {
                info!(confirmed, "backend confirmed sync");
                self.state
                    .send_modify(|s| s.last_sync_timestamp = Some(confirmed));
            }
            None => {
                warn!(
                    timeout_secs = self.timings.poll_timeout.as_secs(),
                    "sync confirmation timed out, reloading control record"
                );
                // An absent or unreadable record keeps the optimistic timestamp.
                if let Some(latest) = self.get_latest_sync_timestamp().await {
                    self.state
                        .send_modify(|s| s.last_sync_timestamp = Some(latest));
                }
            }
        }

        let reloaded = refresh().await;
        self.show_message(SYNC_SUCCESS_MESSAGE.to_string(), self.timings.success_message_ttl);
        Ok(reloaded)
    }

    /// Poll until the recorded sync moves past `previous` by more than the
    /// tolerance. `Ok(None)` on timeout.
    async fn await_confirmation(&self, previous: Option<i64>) -> Result<Option<i64>> {
        let interval_ms = self.timings.poll_interval.as_millis().max(1);
        let attempts = (self.timings.poll_timeout.as_millis() / interval_ms).max(1);
        let tolerance = self.timings.confirm_tolerance.as_millis() as i64;

        for attempt in 1..=attempts {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("sync confirmation cancelled");
                    return Err(DashboardError::Cancelled);
                }
                _ = tokio::time::sleep(self.timings.poll_interval) => {}
            }

            if let Some(latest) = self.get_latest_sync_timestamp().await {
                let advanced = previous.map_or(true, |prev| latest - prev > tolerance);
                if advanced {
                    return Ok(Some(latest));
                }
            }
            debug!(attempt = attempt as u64, "sync not recorded yet");
        }
        Ok(None)
    }

    /// Show `text` for `ttl`, unless a newer message replaces it first.
    fn show_message(&self, text: String, ttl: Duration) {
        let seq = self.message_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_modify(|s| s.sync_message = Some(text));

        let state = self.state.clone();
        let message_seq = self.message_seq.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {}
            }
            if message_seq.load(Ordering::SeqCst) == seq {
                state.send_modify(|s| s.sync_message = None);
            }
        });
    }
}
