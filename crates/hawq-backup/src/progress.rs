//! Collaborators for operator interaction: progress events and confirmation.

use async_trait::async_trait;
use serde::Serialize;

use crate::core::TableRef;
use crate::error::Result;

/// Phase a job is in when it reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Metadata,
    Globals,
    Data,
}

/// Progress side channel. Transfers never wait on the reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStarted {
        phase: Phase,
    },
    PhaseFinished {
        phase: Phase,
    },
    TableStarted {
        table: TableRef,
        total: usize,
    },
    TableFinished {
        table: TableRef,
        rows: u64,
        duration_ms: u64,
        completed: usize,
        total: usize,
    },
    TableFailed {
        table: TableRef,
        error: String,
        completed: usize,
        total: usize,
    },
}

/// Receives progress events from a running job.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Asks the operator to approve a job summary before anything changes.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    /// `Ok(false)` aborts the job.
    async fn confirm(&self, summary: &str) -> Result<bool>;
}

/// Approves everything. Used with `--yes`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait]
impl ConfirmationGate for AutoConfirm {
    async fn confirm(&self, _summary: &str) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_as_tagged_json() {
        let event = ProgressEvent::TableFinished {
            table: TableRef::new("s", "a").unwrap(),
            rows: 10,
            duration_ms: 5,
            completed: 1,
            total: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "table_finished");
        assert_eq!(json["table"]["schema"], "s");
        assert_eq!(json["completed"], 1);
    }

    #[tokio::test]
    async fn test_auto_confirm() {
        assert!(AutoConfirm.confirm("anything").await.unwrap());
    }
}
