//! Per-job timing metrics.
//!
//! Each workflow job reports `queued`, `in_progress` and `completed` events;
//! from their timestamps three durations are derived and published. A
//! `bumped` set per job guarantees every derived metric is emitted at most
//! once no matter how often the platform redelivers an event.

use crate::expiring::ExpiringMap;
use crate::UnixSeconds;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

pub const METRIC_PICK_UP_TIME: &str = "JobPickUpTimeSec";
pub const METRIC_EXECUTION_TIME: &str = "JobExecutionTimeSec";
pub const METRIC_COMPLETE_TIME: &str = "JobCompleteTimeSec";

/// Jobs are forgotten after this much inactivity; generously above the
/// longest job the fleet runs, and still bounded.
const JOB_TIMINGS_TTL: Duration = Duration::from_secs(6 * 3600);

/// The lifecycle phase a workflow-job event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Queued,
    InProgress,
    Completed,
}

impl JobPhase {
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct JobTiming {
    queued_at: Option<UnixSeconds>,
    started_at: Option<UnixSeconds>,
    completed_at: Option<UnixSeconds>,
    /// Metric names already emitted for this job.
    bumped: BTreeSet<&'static str>,
}

/// Timing state for all in-flight jobs, keyed by job id.
#[derive(Debug)]
pub struct JobTimings {
    timings: ExpiringMap<i64, JobTiming>,
}

impl Default for JobTimings {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTimings {
    pub fn new() -> Self {
        Self {
            timings: ExpiringMap::new(JOB_TIMINGS_TTL),
        }
    }

    /// Record the timestamp for one phase of a job and return the metrics
    /// that became derivable, each reported at most once per job.
    ///
    /// Redelivered events neither move timestamps (the first delivery wins)
    /// nor re-emit metrics.
    pub fn observe(
        &mut self,
        job_id: i64,
        phase: JobPhase,
        now: UnixSeconds,
    ) -> Vec<(&'static str, i64)> {
        let mut timing = self.timings.remove(&job_id).unwrap_or_default();
        let slot = match phase {
            JobPhase::Queued => &mut timing.queued_at,
            JobPhase::InProgress => &mut timing.started_at,
            JobPhase::Completed => &mut timing.completed_at,
        };
        slot.get_or_insert(now);

        let derivable = [
            (METRIC_PICK_UP_TIME, timing.queued_at, timing.started_at),
            (METRIC_EXECUTION_TIME, timing.started_at, timing.completed_at),
            (METRIC_COMPLETE_TIME, timing.queued_at, timing.completed_at),
        ];
        let mut metrics = Vec::new();
        for (name, from, to) in derivable {
            if let (Some(from), Some(to)) = (from, to) {
                if timing.bumped.insert(name) {
                    metrics.push((name, (to - from).max(0)));
                }
            }
        }
        // Re-inserting refreshes the TTL, so the entry expires only after
        // the job goes quiet.
        self.timings.insert(job_id, timing);
        metrics
    }
}

/// Normalize a job name into a metric dimension value.
///
/// Lowercases, collapses a trailing shard number into `" x"` (so matrix
/// variants like "test 6" share one dimension "test x"), replaces every run
/// of characters outside `[-_a-zA-Z0-9]` with `_`, and trims underscores.
pub fn normalize_job_name(name: &str) -> String {
    static TRAILING_SHARD: OnceLock<Regex> = OnceLock::new();
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    let trailing_shard = TRAILING_SHARD.get_or_init(|| Regex::new(r"\s+\d+$").unwrap());
    let non_word = NON_WORD.get_or_init(|| Regex::new(r"[^-_a-zA-Z0-9]+").unwrap());

    let lowered = name.to_lowercase();
    let collapsed = trailing_shard.replace(&lowered, " x");
    let cleaned = non_word.replace_all(&collapsed, "_");
    cleaned.trim_matches('_').to_string()
}

#[cfg(test)]
#[path = "timing_tests.rs"]
mod tests;
