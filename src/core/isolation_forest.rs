//! Univariate isolation forest.
//!
//! Each tree isolates a random sub-sample of the training values with uniform
//! random splits. Values that are isolated after few splits are outliers.
//! Scores follow the usual decision-function convention:
//!
//! * `score_samples(x) = -2^(-E[h(x)] / c(psi))`, in `[-1, 0)`
//! * `decision_function(x) = score_samples(x) - offset`, where `offset` is the
//!   `contamination` percentile of the training scores
//!
//! A negative decision value marks an outlier, so higher means more normal.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use thiserror::Error;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Errors raised while fitting the forest
#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
    #[error("contamination must be in (0, 0.5], got {0}")]
    InvalidContamination(f64),
    #[error("at least one tree is required")]
    NoTrees,
    #[error("at least two finite samples are required, got {0}")]
    TooFewSamples(usize),
}

/// Forest hyper-parameters
#[derive(Debug, Clone)]
pub struct IsolationForestParams {
    pub n_estimators: usize,
    pub max_samples: usize,
    pub contamination: f64,
    pub random_seed: u64,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            contamination: 0.05,
            random_seed: 42,
        }
    }
}

#[derive(Debug)]
enum Node {
    Leaf { size: usize },
    Split { threshold: f64, left: Box<Node>, right: Box<Node> },
}

/// A fitted forest
#[derive(Debug)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
    offset: f64,
}

impl IsolationForestParams {
    /// Build the trees and calibrate the outlier threshold on `data`
    pub fn fit(&self, data: &[f64]) -> Result<IsolationForest, ModelError> {
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(ModelError::InvalidContamination(self.contamination));
        }
        if self.n_estimators == 0 {
            return Err(ModelError::NoTrees);
        }
        let finite: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.len() < 2 {
            return Err(ModelError::TooFewSamples(finite.len()));
        }

        let sample_size = self.max_samples.clamp(2, finite.len());
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(self.random_seed);

        let trees = (0..self.n_estimators)
            .map(|_| {
                let mut sample: Vec<f64> = index::sample(&mut rng, finite.len(), sample_size)
                    .into_iter()
                    .map(|i| finite[i])
                    .collect();
                grow(&mut sample, 0, max_depth, &mut rng)
            })
            .collect();

        let mut forest = IsolationForest {
            trees,
            sample_size,
            offset: 0.0,
        };

        let mut training_scores: Vec<f64> = finite.iter().map(|v| forest.score_samples(*v)).collect();
        training_scores.sort_by(|a, b| a.total_cmp(b));
        forest.offset = percentile(&training_scores, self.contamination);

        Ok(forest)
    }
}

impl IsolationForest {
    /// Opposite of the normalized anomaly score
    pub fn score_samples(&self, value: f64) -> f64 {
        let total: f64 = self.trees.iter().map(|tree| path_length(tree, value, 0)).sum();
        let mean_depth = total / self.trees.len() as f64;
        -(2f64.powf(-mean_depth / average_path_length(self.sample_size)))
    }

    /// Shifted score, negative for outliers
    pub fn decision_function(&self, value: f64) -> f64 {
        self.score_samples(value) - self.offset
    }

    pub fn is_outlier(&self, value: f64) -> bool {
        self.decision_function(value) < 0.0
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }
}

fn grow(values: &mut [f64], depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
    if depth >= max_depth || values.len() <= 1 {
        return Node::Leaf { size: values.len() };
    }

    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if max <= min {
        return Node::Leaf { size: values.len() };
    }

    // Both sides are non-empty: min goes left, max goes right.
    let threshold = rng.gen_range(min..max);
    values.sort_by(|a, b| a.total_cmp(b));
    let split = values.partition_point(|v| *v <= threshold);
    let (left, right) = values.split_at_mut(split);

    Node::Split {
        threshold,
        left: Box::new(grow(left, depth + 1, max_depth, rng)),
        right: Box::new(grow(right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, value: f64, depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split { threshold, left, right } => {
            if value <= *threshold {
                path_length(left, value, depth + 1)
            } else {
                path_length(right, value, depth + 1)
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` items.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Linear-interpolated percentile of ascending `sorted`, `q` in `[0, 1]`.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    sorted[lower] + (pos - lower as f64) * (sorted[upper] - sorted[lower])
}
