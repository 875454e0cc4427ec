//! User-facing progress output.
//!
//! Announcements, heartbeat ticks, the completion line and result lines are
//! the tool's actual output, so they go through a [`ProgressSink`] rather than
//! the diagnostic logger.

use std::io::Write;
use std::sync::Mutex;

use crate::report::BandwidthReport;

/// Receiver of run progress.
///
/// Called from the blocking worker (announcements), the heartbeat task (ticks)
/// and the orchestrator (completion and results).
pub trait ProgressSink: Send + Sync {
    /// A transfer issued its first copy.
    fn transfer_started(&self, announcement: &str);

    /// One heartbeat interval elapsed.
    fn heartbeat(&self);

    /// All transfers are synchronized.
    fn completed(&self);

    /// Result of one transfer.
    fn result(&self, report: &BandwidthReport);
}

/// Writes progress to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn transfer_started(&self, announcement: &str) {
        println!("{}", announcement);
    }

    fn heartbeat(&self) {
        let mut stdout = std::io::stdout().lock();
        // a lost tick is not worth failing the run
        let _ = stdout.write_all(b".");
        let _ = stdout.flush();
    }

    fn completed(&self) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(b"\nCompleted.\n");
        let _ = stdout.flush();
    }

    fn result(&self, report: &BandwidthReport) {
        println!("{}", report);
    }
}

/// One recorded progress event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Announcement line
    Started(String),
    /// Heartbeat tick
    Tick,
    /// Completion line
    Completed,
    /// Result of one transfer
    Result(BandwidthReport),
}

/// Collects progress events in memory.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Snapshot of every event so far, in arrival order.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Announcement lines.
    pub fn announcements(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Started(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    /// Result reports.
    pub fn results(&self) -> Vec<BandwidthReport> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Result(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    /// Number of heartbeat ticks.
    pub fn ticks(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, ProgressEvent::Tick))
            .count()
    }
}

impl ProgressSink for RecordingProgress {
    fn transfer_started(&self, announcement: &str) {
        self.push(ProgressEvent::Started(announcement.to_string()));
    }

    fn heartbeat(&self) {
        self.push(ProgressEvent::Tick);
    }

    fn completed(&self) {
        self.push(ProgressEvent::Completed);
    }

    fn result(&self, report: &BandwidthReport) {
        self.push(ProgressEvent::Result(report.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let sink = RecordingProgress::new();
        sink.transfer_started("Launching");
        sink.heartbeat();
        sink.heartbeat();
        sink.completed();

        assert_eq!(
            sink.events(),
            vec![
                ProgressEvent::Started("Launching".into()),
                ProgressEvent::Tick,
                ProgressEvent::Tick,
                ProgressEvent::Completed,
            ]
        );
        assert_eq!(sink.ticks(), 2);
        assert_eq!(sink.announcements(), vec!["Launching".to_string()]);
        assert!(sink.results().is_empty());
    }

    #[test]
    fn usable_as_trait_object() {
        let sink: std::sync::Arc<dyn ProgressSink> = std::sync::Arc::new(ConsoleProgress);
        sink.heartbeat();
    }
}
