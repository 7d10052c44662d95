//! Collector status and event publication
//!
//! [`StatusBoard`] owns the one mutable [`CollectorStatus`] of a collector
//! together with the bounded history of file results. Every mutation
//! publishes a fresh snapshot on a broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::trace;

use super::models::{CollectorStatus, ProcessResult};

/// Results kept in history
pub const HISTORY_CAPACITY: usize = 50;

/// Results included in a status snapshot
pub const RECENT_RESULTS: usize = 10;

const EVENT_CHANNEL_CAPACITY: usize = 200;

/// Notifications pushed to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CollectorEvent {
    FileProcessed(ProcessResult),
    StatusChanged(CollectorStatus),
    Error(String),
}

struct BoardState {
    status: CollectorStatus,
    /// Newest first
    history: VecDeque<ProcessResult>,
}

pub struct StatusBoard {
    state: Mutex<BoardState>,
    events_tx: broadcast::Sender<CollectorEvent>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(BoardState {
                status: CollectorStatus::default(),
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            }),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.events_tx.subscribe()
    }

    /// Current status with the newest results attached
    pub fn snapshot(&self) -> CollectorStatus {
        Self::render(&self.lock())
    }

    /// Full retained history, newest first
    pub fn history(&self) -> Vec<ProcessResult> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.lock().status.is_running
    }

    pub fn set_running(&self, running: bool) {
        self.update(|status| {
            status.is_running = running;
            if !running {
                status.next_run = None;
            }
        });
    }

    pub fn cycle_started(&self, at: DateTime<Utc>) {
        self.update(|status| status.last_run = Some(at));
    }

    /// Publish the end-of-cycle snapshot
    pub fn cycle_completed(&self) {
        self.update(|_| {});
    }

    pub fn cycle_finished(&self, next_run: Option<DateTime<Utc>>) {
        self.update(|status| status.next_run = next_run);
    }

    /// Add a file outcome to history and counters
    pub fn record_result(&self, result: ProcessResult) {
        let snapshot = {
            let mut state = self.lock();
            if result.success {
                state.status.files_processed += 1;
                state.status.total_rows_saved += result.rows_saved as u64;
            } else {
                state.status.last_error = result.error_message.clone();
            }

            state.history.push_front(result.clone());
            state.history.truncate(HISTORY_CAPACITY);
            Self::render(&state)
        };

        self.publish(CollectorEvent::FileProcessed(result));
        self.publish(CollectorEvent::StatusChanged(snapshot));
    }

    /// Record a failure that is not tied to one file
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|status| status.last_error = Some(message.clone()));
        self.publish(CollectorEvent::Error(message));
    }

    fn update(&self, mutate: impl FnOnce(&mut CollectorStatus)) {
        let snapshot = {
            let mut state = self.lock();
            mutate(&mut state.status);
            Self::render(&state)
        };
        self.publish(CollectorEvent::StatusChanged(snapshot));
    }

    fn render(state: &BoardState) -> CollectorStatus {
        let mut status = state.status.clone();
        status.recent_results = state.history.iter().take(RECENT_RESULTS).cloned().collect();
        status
    }

    fn publish(&self, event: CollectorEvent) {
        // no subscribers is fine
        if self.events_tx.send(event).is_err() {
            trace!("No status subscribers");
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ingest::models::CollectedFile;
    use std::path::PathBuf;
    use std::time::Duration;

    fn file(name: &str) -> CollectedFile {
        CollectedFile {
            name: name.to_string(),
            local_path: PathBuf::from(name),
            remote_path: name.to_string(),
            modified: None,
            size: 1,
            hash: name.to_string(),
            source: "IHM1".to_string(),
        }
    }

    #[test]
    fn test_record_result_updates_counters() {
        let board = StatusBoard::new();
        board.record_result(ProcessResult::succeeded(&file("a.csv"), 5, 4, 0, Duration::ZERO));
        board.record_result(ProcessResult::failed(&file("b.csv"), 0, "boom", Duration::ZERO));

        let status = board.snapshot();
        assert_eq!(status.files_processed, 1);
        assert_eq!(status.total_rows_saved, 4);
        assert_eq!(status.last_error.as_deref(), Some("boom"));
        assert_eq!(status.recent_results[0].file_name, "b.csv");
    }

    #[test]
    fn test_history_is_bounded() {
        let board = StatusBoard::new();
        for i in 0..60 {
            let name = format!("{}.csv", i);
            board.record_result(ProcessResult::succeeded(&file(&name), 1, 1, 0, Duration::ZERO));
        }

        let history = board.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].file_name, "59.csv");
        assert_eq!(history[49].file_name, "10.csv");

        let status = board.snapshot();
        assert_eq!(status.recent_results.len(), RECENT_RESULTS);
        assert_eq!(status.files_processed, 60);
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();

        board.set_running(true);
        board.record_result(ProcessResult::succeeded(&file("a.csv"), 1, 1, 0, Duration::ZERO));
        board.record_error("unreachable");

        assert!(matches!(rx.recv().await.unwrap(), CollectorEvent::StatusChanged(s) if s.is_running));
        assert!(matches!(rx.recv().await.unwrap(), CollectorEvent::FileProcessed(r) if r.file_name == "a.csv"));
        assert!(matches!(rx.recv().await.unwrap(), CollectorEvent::StatusChanged(_)));
        assert!(matches!(rx.recv().await.unwrap(), CollectorEvent::StatusChanged(s) if s.last_error.is_some()));
        assert!(matches!(rx.recv().await.unwrap(), CollectorEvent::Error(m) if m == "unreachable"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let board = StatusBoard::new();
        board.set_running(true);
        board.set_running(false);
        assert!(!board.is_running());
    }

    #[test]
    fn test_event_json_shape() {
        let event = CollectorEvent::Error("IHM2: timed out".to_string());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"], "IHM2: timed out");

        let event = CollectorEvent::StatusChanged(CollectorStatus::default());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["data"]["is_running"], false);
    }
}
