use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One progress snapshot. Delivery is best-effort; entries_processed is
/// monotonic within a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub volume_uuid: String,
    pub entries_processed: u64,
    pub current_item: String,
    pub completed: bool,
}

/// Counts entries and broadcasts a snapshot every `interval` entries and on
/// completion. Subscribers that fall behind just miss frames.
pub struct ProgressReporter {
    volume_uuid: String,
    interval: u64,
    processed: AtomicU64,
    current_item: Mutex<String>,
    sender: Option<broadcast::Sender<ScanProgress>>,
}

impl ProgressReporter {
    pub fn new(
        volume_uuid: &str,
        interval: u64,
        sender: Option<broadcast::Sender<ScanProgress>>,
    ) -> Self {
        Self {
            volume_uuid: volume_uuid.to_string(),
            interval: interval.max(1),
            processed: AtomicU64::new(0),
            current_item: Mutex::new(String::new()),
            sender,
        }
    }

    /// Discards output; used by one-shot CLI paths and tests.
    pub fn silent(volume_uuid: &str) -> Self {
        Self::new(volume_uuid, u64::MAX, None)
    }

    pub fn on_entry(&self, leaf_name: &str) {
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        *self.current_item.lock().unwrap() = leaf_name.to_string();
        if processed % self.interval == 0 {
            self.emit(processed, false);
        }
    }

    pub fn complete(&self) {
        self.emit(self.processed.load(Ordering::Relaxed), true);
    }

    #[allow(dead_code)]
    pub fn entries_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    fn emit(&self, processed: u64, completed: bool) {
        if let Some(sender) = &self.sender {
            let snapshot = ScanProgress {
                volume_uuid: self.volume_uuid.clone(),
                entries_processed: processed,
                current_item: self.current_item.lock().unwrap().clone(),
                completed,
            };
            // No receivers is fine
            let _ = sender.send(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emits_every_interval_and_on_completion() {
        let (tx, mut rx) = broadcast::channel(64);
        let reporter = ProgressReporter::new("u1", 3, Some(tx));

        for i in 0..7 {
            reporter.on_entry(&format!("file{i}"));
        }
        reporter.complete();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.entries_processed, 3);
        assert!(!first.completed);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.entries_processed, 6);

        let last = rx.try_recv().unwrap();
        assert_eq!(last.entries_processed, 7);
        assert!(last.completed);
        assert_eq!(last.volume_uuid, "u1");

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let (tx, mut rx) = broadcast::channel(64);
        let reporter = ProgressReporter::new("u1", 1, Some(tx));
        for i in 0..5 {
            reporter.on_entry(&format!("f{i}"));
        }

        let mut last = 0;
        while let Ok(snapshot) = rx.try_recv() {
            assert!(snapshot.entries_processed > last);
            last = snapshot.entries_processed;
        }
        assert_eq!(last, 5);
    }

    #[test]
    fn test_silent_reporter_counts() {
        let reporter = ProgressReporter::silent("u1");
        reporter.on_entry("a");
        reporter.on_entry("b");
        reporter.complete();
        assert_eq!(reporter.entries_processed(), 2);
    }
}
