//! Ingestion dispatcher - readout events → independent pipeline tasks
//!
//! The event source calls `on_event` on its own context. The dispatcher
//! filters the event and, when eligible, spawns one detached task per
//! exposure. No ordering, no back-pressure, no retry: a failing run is
//! logged and forgotten.

use super::engine::{PipelineError, RunOutcome, StatsPipeline};
use crate::camera::event::{ExposureEvent, ReadoutStatus, KEY_FRAME_TYPE, KEY_SHUTTER};
use crate::camera::subscription::ReadoutHandler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Frame type that carries sky data
const OBJECT_FRAME: &str = "OBJECT";
/// Shutter state during a science exposure
const SHUTTER_OPEN: &str = "OPEN";

/// True for a successful, shutter-open science readout
///
/// Missing or non-text metadata makes the event ineligible.
pub fn is_eligible(event: &ExposureEvent) -> bool {
    event.status == ReadoutStatus::Ok
        && event.header_matches(KEY_FRAME_TYPE, OBJECT_FRAME)
        && event.header_matches(KEY_SHUTTER, SHUTTER_OPEN)
}

pub struct IngestionDispatcher {
    pipeline: Arc<StatsPipeline>,
    runtime: Handle,
    dispatched: AtomicU64,
    ignored: AtomicU64,
}

impl IngestionDispatcher {
    /// Spawn pipeline runs on `runtime`
    ///
    /// Taking a handle lets the event source live on a thread outside the
    /// runtime.
    pub fn new(pipeline: Arc<StatsPipeline>, runtime: Handle) -> Self {
        Self {
            pipeline,
            runtime,
            dispatched: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
        }
    }

    /// Filter one event and hand it to a detached task
    ///
    /// Returns the task handle for eligible events, `None` otherwise.
    /// Never waits on the task.
    pub fn dispatch(&self, event: ExposureEvent) -> Option<JoinHandle<()>> {
        if !is_eligible(&event) {
            log::debug!(
                "Ignoring readout {} (status={}, {}={:?}, {}={:?})",
                event.filename,
                event.status.as_str(),
                KEY_FRAME_TYPE,
                event.header_str(KEY_FRAME_TYPE),
                KEY_SHUTTER,
                event.header_str(KEY_SHUTTER)
            );
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        log::debug!("🚀 Dispatching pipeline run for {}", event.filename);
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let pipeline = self.pipeline.clone();
        Some(self.runtime.spawn(async move {
            let outcome = pipeline.process(&event).await;
            report(&event, outcome);
        }))
    }

    /// (dispatched, ignored) since start
    pub fn counts(&self) -> (u64, u64) {
        (
            self.dispatched.load(Ordering::Relaxed),
            self.ignored.load(Ordering::Relaxed),
        )
    }

    /// Event-source entry point
    pub fn on_event(&self, event: ExposureEvent) {
        // Detached: the handle is dropped, the task keeps running
        let _ = self.dispatch(event);
    }
}

impl ReadoutHandler for IngestionDispatcher {
    fn on_readout(&self, event: ExposureEvent) {
        self.on_event(event);
    }
}

fn report(event: &ExposureEvent, outcome: Result<RunOutcome, PipelineError>) {
    match outcome {
        Ok(RunOutcome::Stored(_)) | Ok(RunOutcome::NoSources) => {}
        Err(e) if e.is_data_issue() => {
            log::warn!("⚠️  {}: {}", event.filename, e);
        }
        Err(e) => {
            log::error!("❌ Pipeline run failed for {}: {}", event.filename, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::extractor::{ExtractionError, ExtractorParams, SourceExtractor};
    use crate::camera::resolver::ImageResolver;
    use crate::pipeline::db::QualityStore;
    use crate::pipeline::engine::tests::{object_event, test_store, FakeExtractor, StubFetcher};
    use crate::pipeline::reduction::tests::make_source;
    use crate::pipeline::types::SourceRecord;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::{tempdir, NamedTempFile};

    fn event(frame: &str, shutter: &str) -> ExposureEvent {
        ExposureEvent::new("obj.fits", ReadoutStatus::Ok)
            .with_header("IMAGETYP", frame)
            .with_header("SHUTTER", shutter)
    }

    #[test]
    fn test_eligibility_is_trimmed_and_case_insensitive() {
        assert!(is_eligible(&event("Object ", "open")));
        assert!(is_eligible(&event("OBJECT", " OPEN")));
    }

    #[test]
    fn test_closed_shutter_never_eligible() {
        for frame in ["OBJECT", "Object ", "BIAS", "DARK", "FLAT"] {
            assert!(!is_eligible(&event(frame, "CLOSED")), "frame {}", frame);
        }
    }

    #[test]
    fn test_other_frames_and_statuses_ineligible() {
        assert!(!is_eligible(&event("FLAT", "OPEN")));

        let mut failed = event("OBJECT", "OPEN");
        failed.status = ReadoutStatus::Aborted;
        assert!(!is_eligible(&failed));

        // Missing or non-text metadata
        let bare = ExposureEvent::new("obj.fits", ReadoutStatus::Ok);
        assert!(!is_eligible(&bare));
        let numeric = ExposureEvent::new("obj.fits", ReadoutStatus::Ok)
            .with_header("IMAGETYP", 1.0)
            .with_header("SHUTTER", "OPEN");
        assert!(!is_eligible(&numeric));
    }

    /// Holds every run for a while and tracks peak concurrency
    struct SlowExtractor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        sources: Vec<SourceRecord>,
    }

    #[async_trait]
    impl SourceExtractor for SlowExtractor {
        async fn extract(
            &self,
            _image: &Path,
            _params: &ExtractorParams,
        ) -> Result<Vec<SourceRecord>, ExtractionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(self.sources.clone())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runs_are_concurrent_and_detached() {
        let (store, _db) = test_store(0);
        let storage = tempdir().unwrap();
        let image = NamedTempFile::new().unwrap();
        let extractor = Arc::new(SlowExtractor {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            sources: vec![make_source(1, 12.0, 2.0, 100.0, 0.95, 0)],
        });
        let resolver = ImageResolver::new(storage.path(), Box::new(StubFetcher));
        let pipeline = StatsPipeline::new(
            resolver,
            extractor.clone(),
            Arc::new(ExtractorParams::default()),
            store.clone(),
        );
        let dispatcher = IngestionDispatcher::new(Arc::new(pipeline), Handle::current());

        let started = std::time::Instant::now();
        let handles: Vec<JoinHandle<()>> = (0..5)
            .filter_map(|i| {
                let date = format!("2024-01-01T00:00:0{}", i);
                dispatcher.dispatch(object_event(image.path().to_str().unwrap(), "R", &date))
            })
            .collect();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(handles.len(), 5);

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(extractor.peak.load(Ordering::SeqCst) > 1);
        assert_eq!(dispatcher.counts(), (5, 0));
        assert_eq!(store.distinct_filters().await.unwrap(), vec!["R"]);
    }

    #[tokio::test]
    async fn test_failed_run_does_not_reach_dispatcher() {
        let (store, _db) = test_store(0);
        let storage = tempdir().unwrap();
        // No local file and no URL: resolution fails inside the task
        let resolver = ImageResolver::new(storage.path(), Box::new(StubFetcher));
        let pipeline = StatsPipeline::new(
            resolver,
            Arc::new(FakeExtractor::new(Vec::new())),
            Arc::new(ExtractorParams::default()),
            store,
        );
        let dispatcher = IngestionDispatcher::new(Arc::new(pipeline), Handle::current());

        let handle = dispatcher
            .dispatch(object_event("/nonexistent/obj.fits", "R", "2024-01-01T00:00:00"))
            .unwrap();
        handle.await.unwrap();

        dispatcher.on_readout(event("BIAS", "CLOSED"));
        assert_eq!(dispatcher.counts(), (1, 1));
    }
}
