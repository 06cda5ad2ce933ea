//! Long-running remote job tracking
//!
//! Export and import jobs share one state machine:
//! `STARTING -> IN_PROGRESS -> {COMPLETED | FAILED}`, plus a `timed_out`
//! marker set only by [`monitor`] when its deadline passes. Once a job is
//! terminal it is never polled again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::table::TableService;

/// Default interval between poll rounds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default wall-clock budget for export monitoring.
pub const DEFAULT_EXPORT_DEADLINE: Duration = Duration::from_secs(840);

/// Default wall-clock budget for import monitoring.
pub const DEFAULT_IMPORT_DEADLINE: Duration = Duration::from_secs(720);

/// Remote job status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Starting,
    InProgress,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Starting => "STARTING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Unknown => "UNKNOWN",
        }
    }

    /// Whether the remote service will report no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Poll interval and deadline for a monitor run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollSchedule {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    pub fn for_exports() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_EXPORT_DEADLINE)
    }

    pub fn for_imports() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_IMPORT_DEADLINE)
    }
}

/// A job record that can be refreshed from its remote status.
#[async_trait]
pub trait PollableJob: Send {
    /// Remote handle; jobs without one never started and are not polled.
    fn handle(&self) -> Option<&str>;

    fn status(&self) -> JobStatus;

    /// Whether the job needs no further polling.
    fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    fn mark_timed_out(&mut self);

    /// Fetch the remote status and fold it into this record. Describe
    /// failures are recorded on the job, never returned.
    async fn refresh(&mut self, tables: &dyn TableService);
}

/// Poll every unfinished job until all are terminal or `schedule.deadline`
/// elapses.
///
/// Jobs still active at the deadline are polled one final time and marked
/// `timed_out`, whatever their last remote status. Returns within
/// `deadline + interval` plus the final poll round. Output order matches
/// input order.
pub async fn monitor<J: PollableJob>(
    mut jobs: Vec<J>,
    tables: &dyn TableService,
    schedule: PollSchedule,
) -> Vec<J> {
    let started = Instant::now();
    let mut active: Vec<usize> = jobs
        .iter()
        .enumerate()
        .filter(|(_, job)| job.handle().is_some() && !job.is_finished())
        .map(|(index, _)| index)
        .collect();

    info!(jobs = active.len(), "Monitoring remote jobs for completion");

    while !active.is_empty() && started.elapsed() < schedule.deadline {
        let mut still_active = Vec::with_capacity(active.len());

        for index in active {
            let job = &mut jobs[index];
            job.refresh(tables).await;

            let handle = job.handle().unwrap_or_default().to_string();
            match job.status() {
                JobStatus::Completed => info!(handle = %handle, "Job completed successfully"),
                JobStatus::Failed => error!(handle = %handle, "Job failed"),
                status => {
                    info!(handle = %handle, status = %status, "Job in progress");
                    still_active.push(index);
                },
            }
        }

        active = still_active;

        if !active.is_empty() {
            sleep(schedule.interval).await;
        }
    }

    for index in active {
        let job = &mut jobs[index];
        job.refresh(tables).await;
        job.mark_timed_out();
        warn!(
            handle = job.handle().unwrap_or_default(),
            status = %job.status(),
            waited_secs = started.elapsed().as_secs(),
            "Job monitoring timed out"
        );
    }

    jobs
}
