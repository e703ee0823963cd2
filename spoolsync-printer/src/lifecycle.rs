//! Print lifecycle edge detection.
//!
//! Turns the stream of `gcode_state` snapshots into exactly one start and one
//! completion per physical print. A job first seen mid-run (after a host
//! restart) is still completed once, through the `Running` tracking state.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::PrintStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintOutcome {
    Completed,
    Failed,
    Aborted,
}

impl PrintOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PrintOutcome::Completed => "completed",
            PrintOutcome::Failed => "failed",
            PrintOutcome::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Started { file: String },
    Completed {
        outcome: PrintOutcome,
        file: Option<String>,
    },
}

/// Where the detector stands with respect to the current job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTracking {
    /// No job observed yet, or the last one was never seen running.
    #[default]
    Untracked,
    /// RUNNING with a file was observed; a completion is owed.
    Running,
    /// Completion already signaled for the last job.
    Completed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrintLifecycle {
    previous_status: Option<PrintStatus>,
    previous_file: Option<String>,
    tracking: JobTracking,
}

impl PrintLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracking(&self) -> JobTracking {
        self.tracking
    }

    /// Feeds one status update. At most one event comes out per call.
    pub fn observe(&mut self, status: &PrintStatus, file: Option<&str>) -> Option<LifecycleEvent> {
        let file = file.filter(|f| !f.is_empty());
        let was_running = self.previous_status.as_ref() == Some(&PrintStatus::Running);
        let running = *status == PrintStatus::Running;

        let mut event = None;

        if let (true, Some(current)) = (running, file) {
            let file_changed = self
                .previous_file
                .as_deref()
                .is_some_and(|prev| prev != current);

            self.tracking = JobTracking::Running;

            if !was_running || file_changed {
                debug!(file = current, file_changed, "print start edge");
                event = Some(LifecycleEvent::Started { file: current.to_string() });
            }
        }

        if event.is_none() {
            if let Some(outcome) = self.completion(status, was_running) {
                self.tracking = JobTracking::Completed;
                event = Some(LifecycleEvent::Completed {
                    outcome,
                    file: self.previous_file.clone().or_else(|| file.map(str::to_string)),
                });
            }
        }

        self.previous_status = Some(status.clone());
        if let Some(current) = file {
            self.previous_file = Some(current.to_string());
        }

        event
    }

    fn completion(&self, status: &PrintStatus, was_running: bool) -> Option<PrintOutcome> {
        if self.tracking == JobTracking::Completed {
            return None;
        }
        let status_moved = self.previous_status.as_ref() != Some(status);

        match status {
            PrintStatus::Finish | PrintStatus::Failed => {
                let resumed = self.tracking == JobTracking::Running && status_moved;
                if !(was_running || resumed) {
                    return None;
                }
                Some(if *status == PrintStatus::Finish {
                    PrintOutcome::Completed
                } else {
                    PrintOutcome::Failed
                })
            }
            PrintStatus::Idle if was_running => Some(PrintOutcome::Aborted),
            _ => None,
        }
    }
}
