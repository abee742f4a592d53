use crate::invoke::Invoke;
use crate::outcome::{parse_outcome, status_echo, Outcome};
use crate::plan::{BucketKey, BucketPlan};
use crate::stats::{summarize, BucketSummary, Sample};

/// Receives every trial as it finishes. Purely for human observability.
pub trait TrialObserver: Sync {
    fn trial_finished(&self, key: &BucketKey, trial: usize, outcome: &Outcome);

    fn bucket_finished(&self, _summary: &BucketSummary) {}
}

pub struct SilentObserver;

impl TrialObserver for SilentObserver {
    fn trial_finished(&self, _key: &BucketKey, _trial: usize, _outcome: &Outcome) {}
}

/// Runs every planned trial of one bucket, one solver process at a time.
pub fn run_bucket(
    bucket: &BucketPlan,
    invoker: &dyn Invoke,
    success_exit_code: i32,
    observer: &dyn TrialObserver,
) -> Sample {
    let planned = bucket.files.len();
    let mut sample = Vec::with_capacity(planned);
    for trial in 0..planned {
        let Some(puzzle) = bucket.files.file_for(trial) else {
            break;
        };
        let raw = invoker.invoke(puzzle, bucket.timeout_secs);
        if let Some(echo) = status_echo(&raw) {
            if echo != i64::from(raw.exit_code) && !raw.timed_out {
                tracing::warn!(
                    bucket = %bucket.key,
                    puzzle = %puzzle.display(),
                    echo,
                    exit_code = raw.exit_code,
                    "status echo mismatch: solver printed a status that differs from its exit code"
                );
            }
        }
        let outcome = parse_outcome(&raw, success_exit_code);
        tracing::debug!(
            bucket = %bucket.key,
            trial,
            solved = outcome.solved,
            elapsed = ?outcome.elapsed,
            iterations = ?outcome.iterations,
            "trial finished"
        );
        observer.trial_finished(&bucket.key, trial, &outcome);
        sample.push(outcome);
    }
    sample
}

pub fn summarize_bucket(
    bucket: &BucketPlan,
    invoker: &dyn Invoke,
    success_exit_code: i32,
    observer: &dyn TrialObserver,
) -> BucketSummary {
    let sample = run_bucket(bucket, invoker, success_exit_code, observer);
    let summary = summarize(bucket.key.clone(), &sample);
    tracing::info!(
        bucket = %summary.key,
        successes = summary.successes,
        total = summary.total_trials,
        "{:.2}% success, avg time {:.8}, std dev {:.8}, avg cycles {:.2}",
        summary.success_rate,
        summary.avg_time,
        summary.stdev_time,
        summary.avg_iterations
    );
    observer.bucket_finished(&summary);
    summary
}
