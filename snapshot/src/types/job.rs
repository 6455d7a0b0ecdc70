use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_postgres::types::PgLsn;

/// Identifier of a snapshot job.
pub type JobId = i64;

/// Lifecycle status of a snapshot job.
///
/// Jobs move forward along `planning -> exporting -> running -> completed`. Any non-terminal
/// status may move to `failed`. `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Planning,
    Exporting,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// A live job blocks the creation of another job for the same endpoint.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Planning, JobStatus::Exporting)
                | (JobStatus::Exporting, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (
                    JobStatus::Planning | JobStatus::Exporting | JobStatus::Running,
                    JobStatus::Failed
                )
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Planning => "planning",
            JobStatus::Exporting => "exporting",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token identifying an exported consistent view, as returned by `pg_export_snapshot()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewToken(String);

impl ViewToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One attempt at snapshotting the configured tables of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotJob {
    pub id: JobId,
    /// Logical replication endpoint the snapshot is taken for.
    pub endpoint: String,
    pub status: JobStatus,
    /// Log position captured before any chunk is read. Streaming resumes from here.
    pub fence_lsn: PgLsn,
    /// Set once the consistent view has been exported.
    pub view_token: Option<ViewToken>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotJob {
    /// Returns the view every worker reads from, once the job is running.
    pub fn running_view(&self) -> Option<RunningJob> {
        if self.status != JobStatus::Running {
            return None;
        }

        Some(RunningJob {
            id: self.id,
            fence_lsn: self.fence_lsn,
            view_token: self.view_token.clone()?,
        })
    }
}

/// The parts of a running job chunk workers need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningJob {
    pub id: JobId,
    pub fence_lsn: PgLsn,
    pub view_token: ViewToken,
}

/// Chunk counts of a job by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobProgress {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed
    }

    /// All chunks are completed. A job without chunks is never done.
    pub fn is_done(&self) -> bool {
        self.total() > 0 && self.completed == self.total()
    }

    pub fn has_claimable(&self) -> bool {
        self.pending > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 5] = [
        JobStatus::Planning,
        JobStatus::Exporting,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    #[test]
    fn terminal_statuses_never_change() {
        for next in ALL {
            assert!(!JobStatus::Completed.can_transition_to(next));
            assert!(!JobStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn statuses_only_move_forward() {
        assert!(JobStatus::Planning.can_transition_to(JobStatus::Exporting));
        assert!(JobStatus::Exporting.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));

        assert!(!JobStatus::Planning.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Exporting));
        assert!(!JobStatus::Exporting.can_transition_to(JobStatus::Completed));

        for status in ALL.into_iter().filter(JobStatus::is_live) {
            assert!(status.can_transition_to(JobStatus::Failed));
        }
    }

    #[test]
    fn progress_is_done_only_when_every_chunk_completed() {
        assert!(!JobProgress::default().is_done());

        let progress = JobProgress {
            completed: 10,
            ..JobProgress::default()
        };
        assert!(progress.is_done());

        let progress = JobProgress {
            in_progress: 1,
            completed: 9,
            ..JobProgress::default()
        };
        assert!(!progress.is_done());
        assert!(!progress.has_claimable());
    }
}
