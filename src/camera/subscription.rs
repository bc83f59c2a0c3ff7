//! Readout subscription: turns a stream of JSON lines into handler calls
//!
//! The camera proxy (or anything replaying its notifications) writes one
//! `ExposureEvent` per line. Each parsed event is handed to the registered
//! `ReadoutHandler`, which must return quickly.

use super::event::ExposureEvent;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Receiver of camera readout notifications
///
/// Called on the subscription task; implementations must not block.
pub trait ReadoutHandler: Send + Sync {
    fn on_readout(&self, event: ExposureEvent);
}

/// Counters reported when the source closes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub delivered: u64,
    pub malformed: u64,
}

/// Read events line by line until EOF and deliver each one to `handler`
///
/// Blank lines are ignored. Lines that are not a valid event are logged and
/// skipped; the subscription keeps running.
pub async fn run_event_source<R>(
    reader: R,
    handler: &dyn ReadoutHandler,
) -> std::io::Result<SubscriptionStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = SubscriptionStats::default();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<ExposureEvent>(line) {
            Ok(event) => {
                log::debug!("📷 Readout: {} ({})", event.filename, event.status.as_str());
                handler.on_readout(event);
                stats.delivered += 1;
            }
            Err(e) => {
                log::warn!("⚠️  Skipping malformed readout event: {}", e);
                stats.malformed += 1;
            }
        }
    }

    log::info!(
        "📭 Event source closed ({} delivered, {} malformed)",
        stats.delivered,
        stats.malformed
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::event::ReadoutStatus;
    use std::sync::Mutex;
    use tokio::io::BufReader;

    #[derive(Default)]
    struct Collector {
        events: Mutex<Vec<ExposureEvent>>,
    }

    impl ReadoutHandler for Collector {
        fn on_readout(&self, event: ExposureEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_delivers_events_in_order() {
        let input = concat!(
            r#"{"filename": "a.fits", "status": "OK", "headers": {"FILTER": "R"}}"#,
            "\n\n",
            r#"{"filename": "b.fits", "url": "http://cam/b.fits", "status": "ERROR"}"#,
            "\n",
        );
        let collector = Collector::default();

        let stats = run_event_source(BufReader::new(input.as_bytes()), &collector)
            .await
            .unwrap();

        assert_eq!(stats, SubscriptionStats { delivered: 2, malformed: 0 });
        let events = collector.events.lock().unwrap();
        assert_eq!(events[0].filename, "a.fits");
        assert_eq!(events[0].header_str("FILTER"), Some("R"));
        assert_eq!(events[1].status, ReadoutStatus::Error);
        assert_eq!(events[1].url.as_deref(), Some("http://cam/b.fits"));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let input = concat!(
            "not json\n",
            r#"{"status": "OK"}"#,
            "\n",
            r#"{"filename": "c.fits", "status": "OK"}"#,
            "\n",
        );
        let collector = Collector::default();

        let stats = run_event_source(BufReader::new(input.as_bytes()), &collector)
            .await
            .unwrap();

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.malformed, 2);
        assert_eq!(collector.events.lock().unwrap()[0].filename, "c.fits");
    }
}
