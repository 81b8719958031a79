//! Tests for job timing derivation and job-name normalization.

use super::*;

// ============================================================================
// observe tests
// ============================================================================

mod observe_tests {
    use super::*;

    /// queued → in_progress → completed yields the three derived metrics,
    /// each exactly once, with the expected durations.
    #[test]
    fn test_full_lifecycle_derives_three_metrics() {
        let mut timings = JobTimings::new();

        assert!(timings.observe(1, JobPhase::Queued, 100).is_empty());

        let picked_up = timings.observe(1, JobPhase::InProgress, 105);
        assert_eq!(picked_up, vec![(METRIC_PICK_UP_TIME, 5)]);

        let mut completed = timings.observe(1, JobPhase::Completed, 165);
        completed.sort();
        assert_eq!(
            completed,
            vec![(METRIC_COMPLETE_TIME, 65), (METRIC_EXECUTION_TIME, 60)]
        );
    }

    /// Redelivered events neither move timestamps nor re-emit metrics.
    #[test]
    fn test_redelivery_is_idempotent() {
        let mut timings = JobTimings::new();
        timings.observe(1, JobPhase::Queued, 100);
        timings.observe(1, JobPhase::InProgress, 105);
        timings.observe(1, JobPhase::Completed, 165);

        assert!(timings.observe(1, JobPhase::Queued, 999).is_empty());
        assert!(timings.observe(1, JobPhase::InProgress, 999).is_empty());
        assert!(timings.observe(1, JobPhase::Completed, 999).is_empty());
    }

    /// Events can arrive out of order; metrics appear once both endpoints
    /// are known.
    #[test]
    fn test_out_of_order_events() {
        let mut timings = JobTimings::new();
        assert!(timings.observe(2, JobPhase::Completed, 160).is_empty());

        let metrics = timings.observe(2, JobPhase::InProgress, 110);
        assert_eq!(metrics, vec![(METRIC_EXECUTION_TIME, 50)]);

        let mut metrics = timings.observe(2, JobPhase::Queued, 100);
        metrics.sort();
        assert_eq!(
            metrics,
            vec![(METRIC_COMPLETE_TIME, 60), (METRIC_PICK_UP_TIME, 10)]
        );
    }

    /// Jobs are tracked independently.
    #[test]
    fn test_jobs_do_not_interfere() {
        let mut timings = JobTimings::new();
        timings.observe(1, JobPhase::Queued, 100);
        timings.observe(2, JobPhase::Queued, 200);

        assert_eq!(
            timings.observe(1, JobPhase::InProgress, 130),
            vec![(METRIC_PICK_UP_TIME, 30)]
        );
        assert_eq!(
            timings.observe(2, JobPhase::InProgress, 210),
            vec![(METRIC_PICK_UP_TIME, 10)]
        );
    }
}

// ============================================================================
// normalize_job_name tests
// ============================================================================

mod normalize_job_name_tests {
    use super::*;

    /// Matrix shard suffixes collapse so variants share one dimension value.
    #[test]
    fn test_collapses_trailing_shard_numbers() {
        assert_eq!(normalize_job_name("Test 6"), "test_x");
        assert_eq!(normalize_job_name("Test 12"), "test_x");
        assert_eq!(normalize_job_name("test"), "test");
    }

    /// Punctuation runs become single underscores; edges are trimmed.
    #[test]
    fn test_replaces_non_word_runs() {
        assert_eq!(normalize_job_name("Build & Push!"), "build_push");
        assert_eq!(normalize_job_name("  lint  "), "lint");
        assert_eq!(normalize_job_name("e2e (chrome)"), "e2e_chrome");
    }

    /// Numbers not separated by whitespace survive.
    #[test]
    fn test_keeps_embedded_numbers() {
        assert_eq!(normalize_job_name("py311"), "py311");
        assert_eq!(normalize_job_name("node-20"), "node-20");
    }
}
