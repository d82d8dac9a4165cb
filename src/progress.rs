//! Progress event channel between backup/restore workers and UI subscribers.
//!
//! Workers publish stage/counter events; whoever renders them subscribes to
//! the broadcast side. Delivery is best-effort: with no subscriber attached,
//! events are dropped silently.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const BACKUP_CHANNEL: &str = "backup:progress";
pub const RESTORE_CHANNEL: &str = "restore:progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Copy,
    Extract,
    Done,
    /// Terminal sibling of `Done`; an operation never falls back to idle
    /// after a surfaced failure.
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Copy => "copy",
            Stage::Extract => "extract",
            Stage::Done => "done",
            Stage::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub channel: &'static str,
    pub game_id: String,
    pub stage: Stage,
    pub message: String,
    pub done: usize,
    pub total: usize,
}

#[derive(Clone)]
pub struct ProgressReporter {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl ProgressReporter {
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn backup(&self, game_id: &str) -> ProgressScope {
        ProgressScope {
            tx: self.tx.clone(),
            channel: BACKUP_CHANNEL,
            game_id: game_id.to_string(),
        }
    }

    pub fn restore(&self, game_id: &str) -> ProgressScope {
        ProgressScope {
            tx: self.tx.clone(),
            channel: RESTORE_CHANNEL,
            game_id: game_id.to_string(),
        }
    }
}

/// Per-operation handle that tags every event with its channel and game id.
#[derive(Clone)]
pub struct ProgressScope {
    tx: broadcast::Sender<ProgressEvent>,
    channel: &'static str,
    game_id: String,
}

impl ProgressScope {
    pub fn emit(&self, stage: Stage, message: impl Into<String>, done: usize, total: usize) {
        let _ = self.tx.send(ProgressEvent {
            channel: self.channel,
            game_id: self.game_id.clone(),
            stage,
            message: message.into(),
            done,
            total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_receives_scoped_events() {
        let reporter = ProgressReporter::default();
        let mut rx = reporter.subscribe();

        let scope = reporter.backup("game-1");
        scope.emit(Stage::Scan, "scanning", 0, 0);
        scope.emit(Stage::Done, "finished", 3, 3);

        let first = rx.try_recv().expect("first event");
        assert_eq!(first.channel, BACKUP_CHANNEL);
        assert_eq!(first.game_id, "game-1");
        assert_eq!(first.stage, Stage::Scan);

        let second = rx.try_recv().expect("second event");
        assert_eq!(second.stage, Stage::Done);
        assert_eq!(second.done, 3);
    }

    #[test]
    fn test_emit_without_subscriber_is_silent() {
        let reporter = ProgressReporter::default();
        // No receiver attached; must not panic or error.
        reporter.restore("game-2").emit(Stage::Extract, "x", 1, 2);
    }
}
