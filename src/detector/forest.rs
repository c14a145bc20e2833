//! Isolation forest: unsupervised outlier scorer
//!
//! Standard isolation forest construction: each tree recursively partitions a
//! random subsample on a random attribute at a random split value; anomalous
//! points isolate in fewer splits, so their expected path length is short.
//!
//! Scoring follows the `score_samples` convention: the continuous score is the
//! negated normalized anomaly score in [-1, 0), more negative = more
//! anomalous. The binary label compares the score against an offset placed at
//! the contamination quantile of the training scores.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};

use crate::preprocessing::mean;

/// Maximum subsample size per tree (standard isolation forest setting).
const MAX_SUBSAMPLE: usize = 256;

/// Euler–Mascheroni constant, used in the harmonic-number approximation.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Expected path length of an unsuccessful BST search over `n` points.
///
/// This is the c(n) normalization term from the isolation forest paper.
fn expected_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// One node of an isolation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

impl Node {
    /// Path length of `row` through this subtree, with the external-node
    /// adjustment c(size) added at the leaf.
    fn path_length(&self, row: &[f64], depth: f64) -> f64 {
        match self {
            Node::Leaf { size } => depth + expected_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] < *threshold {
                    left.path_length(row, depth + 1.0)
                } else {
                    right.path_length(row, depth + 1.0)
                }
            }
        }
    }
}

/// A fitted isolation forest.
///
/// Plain-data tree representation so the whole model serializes with serde
/// for on-disk persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
    n_features: usize,
    /// Score threshold at the contamination quantile of the training scores;
    /// rows scoring below it are labeled anomalous.
    offset: f64,
}

impl IsolationForest {
    /// Fit a forest of `n_estimators` trees on `data` (rows of equal length).
    ///
    /// Construction is deterministic for a given `seed`.
    pub fn fit(data: &[Vec<f64>], n_estimators: usize, contamination: f64, seed: u64) -> Self {
        let n_features = data.first().map_or(0, Vec::len);
        let sample_size = data.len().min(MAX_SUBSAMPLE);
        // Standard height limit: trees deeper than this isolate nothing useful
        let height_limit = (sample_size.max(2) as f64).log2().ceil();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut trees = Vec::with_capacity(n_estimators);
        for _ in 0..n_estimators {
            let subsample = rand::seq::index::sample(&mut rng, data.len(), sample_size)
                .into_iter()
                .map(|i| data[i].as_slice())
                .collect::<Vec<_>>();
            trees.push(build_node(&mut rng, &subsample, 0.0, height_limit));
        }

        let mut forest = Self {
            trees,
            sample_size,
            n_features,
            offset: 0.0,
        };

        // Place the decision offset so roughly `contamination` of the
        // training rows fall below it.
        let training_scores: Vec<f64> = data.iter().map(|row| forest.score_row(row)).collect();
        forest.offset = Data::new(training_scores).quantile(contamination.clamp(0.0, 1.0));

        forest
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Continuous anomaly score for one row: -2^(-E[h(x)] / c(n)).
    ///
    /// In [-1, 0); more negative = more anomalous.
    pub fn score_row(&self, row: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let paths: Vec<f64> = self
            .trees
            .iter()
            .map(|tree| tree.path_length(row, 0.0))
            .collect();
        let avg_path = mean(&paths);
        let normalized = expected_path_length(self.sample_size).max(f64::MIN_POSITIVE);
        -(2.0_f64.powf(-avg_path / normalized))
    }

    /// Continuous anomaly scores per row.
    pub fn score_samples(&self, data: &[Vec<f64>]) -> Vec<f64> {
        data.iter().map(|row| self.score_row(row)).collect()
    }

    /// Signed decision value: negative = anomalous.
    pub fn decision_value(&self, row: &[f64]) -> f64 {
        self.score_row(row) - self.offset
    }

    /// Binary anomaly label for one row.
    pub fn is_anomaly(&self, row: &[f64]) -> bool {
        self.decision_value(row) < 0.0
    }
}

/// Recursively build one isolation tree over `rows`.
fn build_node(rng: &mut StdRng, rows: &[&[f64]], depth: f64, height_limit: f64) -> Node {
    if rows.len() <= 1 || depth >= height_limit {
        return Node::Leaf { size: rows.len() };
    }

    // Candidate features are those with spread left to split on
    let n_features = rows[0].len();
    let mut candidates = Vec::with_capacity(n_features);
    for feature in 0..n_features {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for row in rows {
            min = min.min(row[feature]);
            max = max.max(row[feature]);
        }
        if max > min {
            candidates.push((feature, min, max));
        }
    }
    if candidates.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(min..max);

    let (left_rows, right_rows): (Vec<&[f64]>, Vec<&[f64]>) =
        rows.iter().copied().partition(|row| row[feature] < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_node(rng, &left_rows, depth + 1.0, height_limit)),
        right: Box::new(build_node(rng, &right_rows, depth + 1.0, height_limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Uniform;
    use rand::Rng;

    fn clustered_data(n: usize, center: f64, spread: f64, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Uniform::new(center - spread, center + spread);
        (0..n)
            .map(|_| (0..5).map(|_| rng.sample(dist)).collect())
            .collect()
    }

    #[test]
    fn outlier_scores_below_inlier_scores() {
        let data = clustered_data(200, 60.0, 3.0, 7);
        let forest = IsolationForest::fit(&data, 100, 0.1, 42);

        let inlier_score = forest.score_row(&[60.0, 60.0, 60.0, 60.0, 60.0]);
        let outlier_score = forest.score_row(&[5.0, 200.0, 5.0, 200.0, 5.0]);

        assert!(outlier_score < inlier_score);
        assert!(forest.is_anomaly(&[5.0, 200.0, 5.0, 200.0, 5.0]));
    }

    #[test]
    fn fit_is_deterministic_for_a_seed() {
        let data = clustered_data(100, 20.0, 2.0, 3);
        let a = IsolationForest::fit(&data, 50, 0.1, 42);
        let b = IsolationForest::fit(&data, 50, 0.1, 42);

        let probe = [20.0, 21.0, 19.0, 20.5, 20.0];
        assert_eq!(a.score_row(&probe), b.score_row(&probe));
        assert_eq!(a.offset, b.offset);
    }

    #[test]
    fn scores_are_negative_and_bounded() {
        let data = clustered_data(100, 50.0, 5.0, 11);
        let forest = IsolationForest::fit(&data, 100, 0.1, 42);
        for row in &data {
            let score = forest.score_row(row);
            assert!(score < 0.0 && score >= -1.0, "score {score} out of range");
        }
    }

    #[test]
    fn serde_round_trip_preserves_scoring() {
        let data = clustered_data(100, 50.0, 5.0, 13);
        let forest = IsolationForest::fit(&data, 20, 0.1, 42);
        let json = serde_json::to_string(&forest).unwrap();
        let restored: IsolationForest = serde_json::from_str(&json).unwrap();

        let probe = [48.0, 52.0, 50.0, 49.0, 51.0];
        assert_eq!(forest.score_row(&probe), restored.score_row(&probe));
    }
}
