//! The sampling loop: `Idle → Starting → Active → Stopping → Idle`.

use crate::position::{LocationRequest, PositionBatch, PositionSource, SourceError, Subscription};
use stalk_client::Collector;
use stalk_core::prefs::{PrefError, PrefKey, PrefStore};
use stalk_core::{SampleReport, SamplingInterval, TrackerPhase};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("position source could not be acquired: {0}")]
    Source(#[from] SourceError),
    #[error("running flag could not be persisted: {0}")]
    Store(#[from] PrefError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit stop command, or the handle was dropped.
    Requested,
    /// The subscription ended underneath an active session.
    SourceLost,
    /// The loop task panicked; the running flag was cleared by the handle.
    Crashed,
}

#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn PrefStore>,
    collector: Arc<dyn Collector>,
}

impl Tracker {
    pub fn new(store: Arc<dyn PrefStore>, collector: Arc<dyn Collector>) -> Self {
        Self { store, collector }
    }

    /// Acquires `source` and enters `Active`.
    ///
    /// The sampling interval is read once here and fixed for the whole session. On any failure
    /// the running flag is left false and the source is released before returning.
    pub fn start(&self, source: &dyn PositionSource) -> Result<TrackerHandle, TrackerError> {
        let interval = self.store.sampling_interval().unwrap_or_else(|err| {
            warn!(event = "tracker_interval_read_error", error = %err);
            SamplingInterval::default()
        });
        let request = LocationRequest::for_interval(interval);
        info!(
            event = "tracker_starting",
            phase = %TrackerPhase::Starting,
            interval = %interval,
            priority = %request.priority
        );

        let subscription = match source.subscribe(&request) {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(event = "tracker_source_unavailable", error = %err);
                mark_stopped(self.store.as_ref());
                return Err(err.into());
            }
        };

        if let Err(err) = self.store.set_bool(PrefKey::ServiceRunning, true) {
            error!(event = "tracker_running_flag_error", error = %err);
            subscription.unsubscribe();
            mark_stopped(self.store.as_ref());
            return Err(err.into());
        }

        let (phase_tx, phase_rx) = watch::channel(TrackerPhase::Active);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(event = "tracker_active", interval = %interval);

        let task = tokio::spawn(run_loop(
            self.clone(),
            subscription,
            shutdown_rx,
            phase_tx,
        ));

        Ok(TrackerHandle {
            interval,
            phase: phase_rx,
            shutdown: shutdown_tx,
            task: Some(task),
            outcome: None,
            store: self.store.clone(),
        })
    }

    fn handle_batch(&self, batch: PositionBatch, reports: &mut JoinSet<bool>) {
        let Some(position) = batch.last().copied() else {
            debug!(event = "tracker_empty_batch");
            return;
        };
        if batch.len() > 1 {
            debug!(event = "tracker_batch_trimmed", dropped = batch.len() - 1);
        }

        // Read per sample so a rename redirects the next report without a restart.
        let identity = match self.store.identity() {
            Ok(identity) => identity,
            Err(err) => {
                warn!(event = "tracker_identity_read_error", error = %err);
                return;
            }
        };
        if identity.is_empty() {
            debug!(event = "tracker_no_identity");
            return;
        }

        let report = SampleReport::new(identity, position);
        let store = self.store.clone();
        let collector = self.collector.clone();
        reports.spawn(async move { send_report(store.as_ref(), collector.as_ref(), report).await });
    }
}

/// Posts one report; a success also records that data now exists for the identity.
pub async fn send_report(
    store: &dyn PrefStore,
    collector: &dyn Collector,
    report: SampleReport,
) -> bool {
    debug!(event = "tracker_report_send", identity = %report.identity());
    if !collector.report_position(&report).await {
        warn!(event = "tracker_report_failed", identity = %report.identity());
        return false;
    }
    info!(event = "tracker_report_sent", identity = %report.identity());
    // Implicit existence write: shares the dataExists slot with the control surface's checks.
    if let Err(err) = store.record_existence(report.identity(), true) {
        warn!(event = "tracker_existence_write_error", error = %err);
    }
    true
}

async fn run_loop(
    tracker: Tracker,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
    phase: watch::Sender<TrackerPhase>,
) -> StopReason {
    let mut reports = JoinSet::new();

    let reason = loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break StopReason::Requested;
                }
            }
            batch = subscription.next_batch() => match batch {
                Some(batch) => tracker.handle_batch(batch, &mut reports),
                None => {
                    warn!(event = "tracker_source_lost");
                    break StopReason::SourceLost;
                }
            },
            Some(joined) = reports.join_next(), if !reports.is_empty() => {
                if let Err(err) = joined {
                    warn!(event = "tracker_report_task_error", error = %err);
                }
            }
        }
    };

    let _ = phase.send(TrackerPhase::Stopping);
    subscription.unsubscribe();
    reports.abort_all();
    while reports.join_next().await.is_some() {}
    mark_stopped(tracker.store.as_ref());
    let _ = phase.send(TrackerPhase::Idle);
    info!(event = "tracker_stopped", reason = ?reason);
    reason
}

fn mark_stopped(store: &dyn PrefStore) {
    if let Err(err) = store.set_bool(PrefKey::ServiceRunning, false) {
        error!(event = "tracker_running_flag_error", error = %err);
    }
}

/// Owner of an active session.
///
/// Dropping the handle also stops the loop, but only [`TrackerHandle::stop`] waits for the
/// running flag to be cleared.
pub struct TrackerHandle {
    interval: SamplingInterval,
    phase: watch::Receiver<TrackerPhase>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<StopReason>>,
    outcome: Option<StopReason>,
    store: Arc<dyn PrefStore>,
}

impl TrackerHandle {
    pub fn interval(&self) -> SamplingInterval {
        self.interval
    }

    pub fn phase(&self) -> TrackerPhase {
        *self.phase.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<TrackerPhase> {
        self.phase.clone()
    }

    /// Resolves when the loop has fully stopped, for whatever reason. Cancel-safe.
    pub async fn wait(&mut self) -> StopReason {
        if let Some(reason) = self.outcome {
            return reason;
        }
        let reason = match self.task.as_mut() {
            Some(task) => match task.await {
                Ok(reason) => reason,
                Err(err) => {
                    error!(event = "tracker_loop_crashed", error = %err);
                    mark_stopped(self.store.as_ref());
                    StopReason::Crashed
                }
            },
            None => StopReason::Requested,
        };
        self.task = None;
        self.outcome = Some(reason);
        reason
    }

    /// Unregisters the subscription, cancels in-flight reports and clears the running flag
    /// before returning.
    pub async fn stop(mut self) -> StopReason {
        let _ = self.shutdown.send(true);
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::ChannelSource;
    use async_trait::async_trait;
    use stalk_core::{MemoryPrefStore, Position};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingCollector {
        reports: Mutex<Vec<SampleReport>>,
        reject: AtomicBool,
        running_seen: Mutex<Vec<bool>>,
        store: Mutex<Option<Arc<dyn PrefStore>>>,
    }

    impl RecordingCollector {
        fn reports(&self) -> Vec<SampleReport> {
            self.reports.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Collector for RecordingCollector {
        async fn report_position(&self, report: &SampleReport) -> bool {
            if let Some(store) = self.store.lock().unwrap().as_ref() {
                self.running_seen
                    .lock()
                    .unwrap()
                    .push(store.is_running().unwrap());
            }
            self.reports.lock().unwrap().push(report.clone());
            !self.reject.load(Ordering::SeqCst)
        }

        async fn check_exists(&self, _identity: &str) -> bool {
            false
        }

        async fn delete_data(&self, _identity: &str) -> bool {
            true
        }
    }

    struct FailingSource;

    impl PositionSource for FailingSource {
        fn subscribe(&self, _request: &LocationRequest) -> Result<Subscription, SourceError> {
            Err(SourceError::Unavailable("permission denied".to_string()))
        }
    }

    struct Harness {
        store: Arc<MemoryPrefStore>,
        collector: Arc<RecordingCollector>,
        tracker: Tracker,
    }

    fn harness(identity: &str) -> Harness {
        let store = Arc::new(MemoryPrefStore::new());
        store.set_string(PrefKey::UserName, identity).unwrap();
        let collector = Arc::new(RecordingCollector::default());
        *collector.store.lock().unwrap() = Some(store.clone());
        let tracker = Tracker::new(store.clone(), collector.clone());
        Harness {
            store,
            collector,
            tracker,
        }
    }

    async fn settle_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    async fn push(tx: &mpsc::Sender<PositionBatch>, batch: PositionBatch) {
        tx.send(batch).await.expect("batch accepted");
    }

    #[tokio::test]
    async fn running_flag_is_set_before_the_first_sample() {
        let h = harness("Alice");
        let (source, tx) = ChannelSource::new(4);
        let handle = h.tracker.start(&source).expect("start");
        assert!(h.store.is_running().unwrap());
        assert_eq!(handle.phase(), TrackerPhase::Active);

        push(&tx, vec![Position::new(1.0, 2.0)]).await;
        settle_until(|| h.collector.reports().len() == 1).await;
        assert_eq!(*h.collector.running_seen.lock().unwrap(), vec![true]);

        assert_eq!(handle.stop().await, StopReason::Requested);
        assert!(!h.store.is_running().unwrap());
    }

    #[tokio::test]
    async fn only_the_latest_position_in_a_batch_is_reported() {
        let h = harness("Alice");
        let (source, tx) = ChannelSource::new(4);
        let handle = h.tracker.start(&source).expect("start");

        push(
            &tx,
            vec![
                Position::new(1.0, 1.0),
                Position::new(2.0, 2.0),
                Position::new(3.0, 3.0),
            ],
        )
        .await;
        settle_until(|| !h.collector.reports().is_empty()).await;
        handle.stop().await;

        assert_eq!(
            h.collector.reports(),
            vec![SampleReport::new("Alice", Position::new(3.0, 3.0))]
        );
    }

    #[tokio::test]
    async fn rename_mid_session_redirects_later_reports() {
        let h = harness("Alice");
        let (source, tx) = ChannelSource::new(4);
        let handle = h.tracker.start(&source).expect("start");

        push(&tx, vec![Position::new(1.0, 1.0)]).await;
        settle_until(|| h.collector.reports().len() == 1).await;
        h.store.set_string(PrefKey::UserName, "Bob").unwrap();
        push(&tx, vec![Position::new(2.0, 2.0)]).await;
        settle_until(|| h.collector.reports().len() == 2).await;
        handle.stop().await;

        let names: Vec<String> = h
            .collector
            .reports()
            .into_iter()
            .map(|report| report.name)
            .collect();
        assert_eq!(names, vec!["Alice".to_string(), "Bob".to_string()]);
    }

    #[tokio::test]
    async fn successful_report_marks_data_as_existing() {
        let h = harness("Alice");
        h.store.record_existence("Alice", false).unwrap();
        let (source, tx) = ChannelSource::new(4);
        let handle = h.tracker.start(&source).expect("start");

        push(&tx, vec![Position::new(1.0, 1.0)]).await;
        settle_until(|| h.store.existence_record().unwrap().exists_for("Alice")).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn failed_report_leaves_existence_untouched() {
        let h = harness("Alice");
        h.collector.reject.store(true, Ordering::SeqCst);
        let (source, tx) = ChannelSource::new(4);
        let handle = h.tracker.start(&source).expect("start");

        push(&tx, vec![Position::new(1.0, 1.0)]).await;
        settle_until(|| h.collector.reports().len() == 1).await;
        handle.stop().await;

        let record = h.store.existence_record().unwrap();
        assert_eq!(record.last_checked_identity, "");
        assert!(!record.data_exists);
    }

    #[tokio::test]
    async fn samples_without_identity_are_skipped() {
        let h = harness("");
        let (source, tx) = ChannelSource::new(4);
        let handle = h.tracker.start(&source).expect("start");

        push(&tx, vec![Position::new(1.0, 1.0)]).await;
        h.store.set_string(PrefKey::UserName, "Carol").unwrap();
        push(&tx, vec![Position::new(2.0, 2.0)]).await;
        settle_until(|| h.collector.reports().len() == 1).await;
        handle.stop().await;

        assert_eq!(h.collector.reports()[0].name, "Carol");
    }

    #[tokio::test]
    async fn no_reports_are_sent_after_stop_returns() {
        let h = harness("Alice");
        let (source, tx) = ChannelSource::new(4);
        let handle = h.tracker.start(&source).expect("start");

        push(&tx, vec![Position::new(1.0, 1.0)]).await;
        settle_until(|| h.collector.reports().len() == 1).await;
        handle.stop().await;
        assert!(!h.store.is_running().unwrap());

        assert!(tx.send(vec![Position::new(9.0, 9.0)]).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.collector.reports().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_source_is_fatal_but_not_a_crash() {
        let h = harness("Alice");
        h.store.set_bool(PrefKey::ServiceRunning, true).unwrap();

        let err = h.tracker.start(&FailingSource).err().expect("start fails");
        assert!(matches!(err, TrackerError::Source(SourceError::Unavailable(_))));
        assert!(!h.store.is_running().unwrap());
    }

    #[tokio::test]
    async fn losing_the_source_stops_the_session() {
        let h = harness("Alice");
        let (source, tx) = ChannelSource::new(4);
        let mut handle = h.tracker.start(&source).expect("start");

        drop(tx);
        assert_eq!(handle.wait().await, StopReason::SourceLost);
        assert_eq!(handle.phase(), TrackerPhase::Idle);
        assert!(!h.store.is_running().unwrap());
        assert_eq!(handle.stop().await, StopReason::SourceLost);
    }

    #[tokio::test]
    async fn interval_is_read_once_at_start() {
        let h = harness("Alice");
        h.store.set_string(PrefKey::StalkFrequency, "30s").unwrap();
        let (source, _tx) = ChannelSource::new(4);
        let handle = h.tracker.start(&source).expect("start");
        h.store.set_string(PrefKey::StalkFrequency, "1s").unwrap();

        assert_eq!(handle.interval(), SamplingInterval::ThirtySeconds);
        handle.stop().await;
    }
}
