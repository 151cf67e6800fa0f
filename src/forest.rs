//! Unsupervised outlier detection.
//!
//! The statistical layer is abstracted behind the [`OutlierModel`] trait so
//! an alternative algorithm can be substituted without touching the
//! pipeline. The provided implementation is an isolation forest: outliers
//! are easier to isolate by random axis-aligned splits and therefore end up
//! with shorter average path lengths across the trees.
//!
//! The decision boundary is estimated from the training data itself rather
//! than from a fixed contamination fraction: the threshold is the 99.5th
//! percentile of the training scores, floored at 0.5 (the score of an
//! average point in the isolation forest formulation). Tree construction is
//! driven by a seeded RNG so a fitted model is reproducible.

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::features::{FeatureVector, FEATURE_DIM};

/// Capability interface for the statistical layer: fit on a training set,
/// then score/classify individual samples.
pub trait OutlierModel {
    /// Fits the model on the full training set. Fails on degenerate input
    /// (e.g. an empty buffer); the caller recovers by restarting training.
    fn fit(&mut self, samples: &[FeatureVector]) -> Result<(), ModelError>;

    /// Anomaly score in [0, 1]; higher means easier to isolate.
    fn score(&self, sample: &FeatureVector) -> f64;

    /// Whether the sample falls past the fitted decision boundary.
    fn is_outlier(&self, sample: &FeatureVector) -> bool;

    fn is_fitted(&self) -> bool;
}

/// Default number of trees in the ensemble.
const NUM_TREES: usize = 100;
/// Default per-tree subsample size.
const SUBSAMPLE: usize = 256;
/// Fixed seed so training on the same buffer yields the same model.
const SEED: u64 = 42;
/// Quantile of training scores used for the decision boundary.
const THRESHOLD_QUANTILE: f64 = 0.995;

/// Isolation forest over 4-field packet feature vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    num_trees: usize,
    /// Effective per-tree subsample size of the last fit.
    subsample: usize,
    seed: u64,
    /// Decision boundary estimated from the training scores.
    threshold: f64,
    /// Path-length normalization factor c(subsample).
    norm: f64,
    fitted: bool,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self::with_params(NUM_TREES, SUBSAMPLE, SEED)
    }
}

impl IsolationForest {
    pub fn with_params(num_trees: usize, subsample: usize, seed: u64) -> Self {
        Self {
            trees: Vec::new(),
            num_trees,
            subsample,
            seed,
            threshold: 0.5,
            norm: 0.0,
            fitted: false,
        }
    }

    /// Fitted decision boundary (0.5 until the threshold estimate raises it).
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Expected path length of an unsuccessful BST search, c(n) from the
    /// isolation forest paper. Used to normalize raw path lengths.
    fn average_path_length(n: usize) -> f64 {
        if n <= 1 {
            return 0.0;
        }
        let n = n as f64;
        2.0 * ((n - 1.0).ln() + 0.5772156649) - 2.0 * (n - 1.0) / n
    }

    fn score_sample(&self, sample: &[f64]) -> f64 {
        if self.trees.is_empty() || self.norm == 0.0 {
            return 0.5;
        }

        let total: f64 = self
            .trees
            .iter()
            .map(|tree| tree.path_length(sample, 0))
            .sum();
        let avg_path = total / self.trees.len() as f64;

        // Anomaly score: 2^(-E(h) / c(subsample))
        2.0_f64.powf(-avg_path / self.norm)
    }
}

impl OutlierModel for IsolationForest {
    fn fit(&mut self, samples: &[FeatureVector]) -> Result<(), ModelError> {
        if samples.is_empty() {
            return Err(ModelError::Fit("empty training set".into()));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let subsample = self.subsample.min(samples.len());

        self.trees.clear();
        self.subsample = subsample;
        self.norm = Self::average_path_length(subsample);

        for _ in 0..self.num_trees {
            // Subsample with replacement.
            let sample: Vec<[f64; FEATURE_DIM]> = (0..subsample)
                .map(|_| {
                    let idx = rng.random_range(0..samples.len());
                    samples[idx].0
                })
                .collect();

            let max_depth = (subsample as f64).log2().ceil() as usize;
            self.trees
                .push(IsolationTree::build(&sample, max_depth, &mut rng));
        }
        self.fitted = true;

        // Threshold auto-estimation: place the boundary just past the bulk
        // of the training scores, never below the paper's 0.5 midpoint.
        let mut scores: Vec<f64> = samples.iter().map(|s| self.score_sample(&s.0)).collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((scores.len() - 1) as f64 * THRESHOLD_QUANTILE).round() as usize;
        self.threshold = scores[idx].max(0.5);

        Ok(())
    }

    fn score(&self, sample: &FeatureVector) -> f64 {
        self.score_sample(sample.as_slice())
    }

    fn is_outlier(&self, sample: &FeatureVector) -> bool {
        self.score(sample) > self.threshold
    }

    fn is_fitted(&self) -> bool {
        self.fitted
    }
}

/// A single isolation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    root: Option<Box<IsolationNode>>,
}

impl IsolationTree {
    fn build<R: Rng>(samples: &[[f64; FEATURE_DIM]], max_depth: usize, rng: &mut R) -> Self {
        let root = Self::build_node(samples, 0, max_depth, rng);
        Self { root }
    }

    fn build_node<R: Rng>(
        samples: &[[f64; FEATURE_DIM]],
        depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> Option<Box<IsolationNode>> {
        if samples.is_empty() {
            return None;
        }
        if depth >= max_depth || samples.len() <= 1 {
            return Some(Box::new(IsolationNode::Leaf {
                size: samples.len(),
            }));
        }

        let feature_idx = rng.random_range(0..FEATURE_DIM);

        let mut min_val = f64::MAX;
        let mut max_val = f64::MIN;
        for sample in samples {
            let val = sample[feature_idx];
            if val < min_val {
                min_val = val;
            }
            if val > max_val {
                max_val = val;
            }
        }

        // No spread on the chosen feature: nothing left to isolate here.
        if (max_val - min_val).abs() < f64::EPSILON {
            return Some(Box::new(IsolationNode::Leaf {
                size: samples.len(),
            }));
        }

        let split_value = rng.random_range(min_val..max_val);

        let (left_samples, right_samples): (Vec<_>, Vec<_>) = samples
            .iter()
            .copied()
            .partition(|s| s[feature_idx] < split_value);

        let left = Self::build_node(&left_samples, depth + 1, max_depth, rng);
        let right = Self::build_node(&right_samples, depth + 1, max_depth, rng);

        Some(Box::new(IsolationNode::Internal {
            feature_idx,
            split_value,
            left,
            right,
        }))
    }

    fn path_length(&self, sample: &[f64], depth: usize) -> f64 {
        match &self.root {
            None => depth as f64,
            Some(node) => Self::node_path_length(node, sample, depth),
        }
    }

    fn node_path_length(node: &IsolationNode, sample: &[f64], depth: usize) -> f64 {
        match node {
            IsolationNode::Leaf { size } => {
                // Leaves holding several samples get the expected remaining
                // depth of an unbuilt subtree added on.
                depth as f64 + IsolationForest::average_path_length(*size)
            }
            IsolationNode::Internal {
                feature_idx,
                split_value,
                left,
                right,
            } => {
                let val = sample.get(*feature_idx).copied().unwrap_or(0.0);
                let next = if val < *split_value { left } else { right };
                match next {
                    Some(n) => Self::node_path_length(n, sample, depth + 1),
                    None => depth as f64 + 1.0,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsolationNode {
    Internal {
        feature_idx: usize,
        split_value: f64,
        left: Option<Box<IsolationNode>>,
        right: Option<Box<IsolationNode>>,
    },
    Leaf {
        size: usize,
    },
}
