//! Priority-weighted ordering of job types for each fetch attempt.

use rand::Rng;

/// The six keys the fetch script needs for one job type, in script order.
#[derive(Debug, Clone)]
pub(crate) struct JobTypeKeys {
    pub jobs: String,
    pub in_progress: String,
    pub paused: String,
    pub lock: String,
    pub lock_info: String,
    pub max_concurrency: String,
}

#[derive(Debug, Clone)]
struct Sample {
    priority: u32,
    rank: f64,
    keys: JobTypeKeys,
}

/// Produces a fresh weighted-without-replacement permutation of the
/// registered job types on every `sample` call: each type draws
/// `u^(1/priority)` and the draws sort descending, so higher priorities
/// land earlier more often without ever starving the rest.
#[derive(Debug, Clone, Default)]
pub(crate) struct PrioritySampler {
    samples: Vec<Sample>,
}

impl PrioritySampler {
    pub fn add(&mut self, priority: u32, keys: JobTypeKeys) {
        self.samples.push(Sample {
            priority: priority.max(1),
            rank: 0.0,
            keys,
        });
    }

    pub fn sample(&mut self) {
        let mut rng = rand::rng();
        for sample in &mut self.samples {
            let draw: f64 = rng.random();
            sample.rank = draw.powf(1.0 / f64::from(sample.priority));
        }
        self.samples.sort_by(|a, b| b.rank.total_cmp(&a.rank));
    }

    pub fn keys(&self) -> impl Iterator<Item = &JobTypeKeys> {
        self.samples.iter().map(|sample| &sample.keys)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
