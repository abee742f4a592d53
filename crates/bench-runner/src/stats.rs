//! Per-bucket statistics.
//!
//! Samples are reduced with Welford's online update so a bucket can be
//! summarized while its trials are still streaming in.

use serde::Serialize;

use crate::outcome::Outcome;
use crate::plan::BucketKey;

pub type Sample = Vec<Outcome>;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// 0 for an empty sample.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample standard deviation; 0 below two observations.
    pub fn sample_stdev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSummary {
    pub key: BucketKey,
    pub total_trials: usize,
    pub successes: usize,
    /// Percentage in `0..=100`.
    pub success_rate: f64,
    pub avg_time: f64,
    pub stdev_time: f64,
    pub avg_iterations: f64,
}

#[derive(Debug, Clone, Default)]
pub struct BucketAccumulator {
    trials: usize,
    successes: usize,
    times: RunningStats,
    iterations: RunningStats,
}

impl BucketAccumulator {
    pub fn push(&mut self, outcome: &Outcome) {
        self.trials += 1;
        if !outcome.solved {
            return;
        }
        self.successes += 1;
        if let Some(elapsed) = outcome.elapsed {
            self.times.push(elapsed);
        }
        if let Some(iterations) = outcome.iterations {
            self.iterations.push(iterations as f64);
        }
    }

    pub fn finish(&self, key: BucketKey) -> BucketSummary {
        let success_rate = if self.trials == 0 {
            0.0
        } else {
            self.successes as f64 / self.trials as f64 * 100.0
        };
        BucketSummary {
            key,
            total_trials: self.trials,
            successes: self.successes,
            success_rate,
            avg_time: self.times.mean(),
            stdev_time: self.times.sample_stdev(),
            avg_iterations: self.iterations.mean(),
        }
    }
}

pub fn summarize(key: BucketKey, sample: &[Outcome]) -> BucketSummary {
    let mut acc = BucketAccumulator::default();
    for outcome in sample {
        acc.push(outcome);
    }
    acc.finish(key)
}
