// crates/quorum-orchestrator/src/progress.rs

//! Per-run progress tracking.
//!
//! The tracker keeps a `{stage → {model → status}}` matrix plus an
//! append-only log, and fans updates out to subscribers over a broadcast
//! channel. It stores no callbacks, so nothing can hold a reference cycle
//! back into it; subscribers just receive or poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    Pending,
    Started,
    InProgress,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub model: String,
    pub stage: String,
    pub status: ProgressStatus,
    pub message: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct Cell {
    status: ProgressStatus,
    message: Option<String>,
    ts: DateTime<Utc>,
}

/// One stage's per-model statuses.
#[derive(Debug, Clone, Serialize)]
pub struct StageProgress {
    pub stage: String,
    pub models: HashMap<String, ProgressStatus>,
}

/// Point-in-time view of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub stages: Vec<StageProgress>,
    pub overall: ProgressStatus,
}

impl ProgressSnapshot {
    pub fn stage(&self, name: &str) -> Option<&StageProgress> {
        self.stages.iter().find(|stage| stage.stage == name)
    }
}

struct TrackerState {
    matrix: Vec<(String, HashMap<String, Cell>)>,
    log: Vec<ProgressUpdate>,
}

pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    sender: broadcast::Sender<ProgressUpdate>,
}

impl ProgressTracker {
    /// Create a tracker for an ordered list of stages.
    pub fn new(stages: &[String]) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(TrackerState {
                matrix: stages
                    .iter()
                    .map(|stage| (stage.clone(), HashMap::new()))
                    .collect(),
                log: Vec::new(),
            }),
            sender,
        }
    }

    /// Pre-mark the models a stage will dispatch to as `Pending`.
    pub fn expect(&self, stage: &str, models: &[String]) {
        for model in models {
            self.update(model, stage, ProgressStatus::Pending, None);
        }
    }

    /// Record a status change. Updates for one `(model, stage)` pair are
    /// delivered to subscribers in the order they occur.
    pub fn update(&self, model: &str, stage: &str, status: ProgressStatus, message: Option<String>) {
        let update = ProgressUpdate {
            model: model.to_string(),
            stage: stage.to_string(),
            status,
            message: message.clone(),
            ts: Utc::now(),
        };

        if let Ok(mut state) = self.state.lock() {
            let index = match state.matrix.iter().position(|(name, _)| name.as_str() == stage) {
                Some(index) => index,
                None => {
                    state.matrix.push((stage.to_string(), HashMap::new()));
                    state.matrix.len() - 1
                }
            };
            state.matrix[index].1.insert(
                model.to_string(),
                Cell {
                    status,
                    message,
                    ts: update.ts,
                },
            );
            state.log.push(update.clone());
        }

        // Nobody listening is fine.
        let _ = self.sender.send(update);
    }

    /// Receive future updates in occurrence order.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }

    /// Every update so far, in occurrence order.
    pub fn history(&self) -> Vec<ProgressUpdate> {
        self.state
            .lock()
            .map(|state| state.log.clone())
            .unwrap_or_default()
    }

    /// Current matrix plus the aggregate status: `Failed` if any populated
    /// stage failed entirely, else `InProgress` while anything is
    /// non-terminal, else `Completed`.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let Ok(state) = self.state.lock() else {
            return ProgressSnapshot {
                stages: Vec::new(),
                overall: ProgressStatus::Failed,
            };
        };

        let stages: Vec<StageProgress> = state
            .matrix
            .iter()
            .map(|(stage, row)| StageProgress {
                stage: stage.clone(),
                models: row
                    .iter()
                    .map(|(model, cell)| (model.clone(), cell.status))
                    .collect(),
            })
            .collect();

        let any_stage_failed = stages.iter().any(|stage| {
            !stage.models.is_empty()
                && stage
                    .models
                    .values()
                    .all(|status| matches!(status, ProgressStatus::Failed))
        });
        let any_open = stages.iter().any(|stage| {
            stage.models.is_empty() || stage.models.values().any(|status| !status.is_terminal())
        });

        let overall = if any_stage_failed {
            ProgressStatus::Failed
        } else if any_open {
            ProgressStatus::InProgress
        } else {
            ProgressStatus::Completed
        };

        ProgressSnapshot { stages, overall }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn completion_rolls_up() {
        let tracker = ProgressTracker::new(&stages(&["initial"]));
        tracker.update("mA", "initial", ProgressStatus::InProgress, None);
        assert_eq!(tracker.snapshot().overall, ProgressStatus::InProgress);

        tracker.update("mA", "initial", ProgressStatus::Completed, None);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.overall, ProgressStatus::Completed);
        assert_eq!(
            snapshot.stage("initial").unwrap().models["mA"],
            ProgressStatus::Completed
        );
    }

    #[test]
    fn unstarted_declared_stage_keeps_run_open() {
        let tracker = ProgressTracker::new(&stages(&["initial", "meta"]));
        tracker.update("mA", "initial", ProgressStatus::Completed, None);
        // meta has no cells yet, so the run is still in progress.
        assert_eq!(tracker.snapshot().overall, ProgressStatus::InProgress);
    }

    #[test]
    fn wholly_failed_stage_fails_the_run() {
        let tracker = ProgressTracker::new(&stages(&["initial"]));
        tracker.update("mA", "initial", ProgressStatus::Failed, Some("boom".into()));
        assert_eq!(tracker.snapshot().overall, ProgressStatus::Failed);
    }

    #[test]
    fn partial_failure_is_not_a_stage_failure() {
        let tracker = ProgressTracker::new(&stages(&["initial"]));
        tracker.update("mA", "initial", ProgressStatus::Failed, None);
        tracker.update("mB", "initial", ProgressStatus::Completed, None);
        assert_eq!(tracker.snapshot().overall, ProgressStatus::Completed);
    }

    #[test]
    fn history_preserves_occurrence_order() {
        let tracker = ProgressTracker::new(&stages(&["initial"]));
        tracker.update("mA", "initial", ProgressStatus::Pending, None);
        tracker.update("mA", "initial", ProgressStatus::Started, None);
        tracker.update("mA", "initial", ProgressStatus::Retrying, None);
        tracker.update("mA", "initial", ProgressStatus::Completed, None);

        let statuses: Vec<ProgressStatus> =
            tracker.history().into_iter().map(|update| update.status).collect();
        assert_eq!(
            statuses,
            vec![
                ProgressStatus::Pending,
                ProgressStatus::Started,
                ProgressStatus::Retrying,
                ProgressStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn subscribers_receive_updates_in_order() {
        let tracker = ProgressTracker::new(&stages(&["initial"]));
        let mut receiver = tracker.subscribe();

        tracker.update("mA", "initial", ProgressStatus::Started, None);
        tracker.update("mA", "initial", ProgressStatus::Completed, None);

        assert_eq!(receiver.recv().await.unwrap().status, ProgressStatus::Started);
        assert_eq!(receiver.recv().await.unwrap().status, ProgressStatus::Completed);
    }
}
