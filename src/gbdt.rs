//! Gradient-boosted regression trees for squared loss.
//!
//! Each round fits a shallow tree to the current residuals with sample weights
//! and adds it, shrunk by the learning rate. The only randomness is the order
//! in which features are tried at each node; it is drawn from a seeded ChaCha
//! stream, so a fit is fully reproducible for identical input.
//!
//! The booster plugs into linfa through `Fit` and `PredictInplace`, so callers
//! build a `Dataset` with weights and use `.fit()` / `.predict()` as with any
//! other linfa model.

use linfa::dataset::DatasetBase;
use linfa::traits::{Fit, PredictInplace};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix2};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::TrainingParams;
use crate::error::PitwiseError;

// minimum weighted SSE reduction for a split to count
const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostingParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl From<&TrainingParams> for BoostingParams {
    fn from(p: &TrainingParams) -> Self {
        Self {
            n_estimators: p.n_estimators,
            learning_rate: p.learning_rate,
            max_depth: p.max_depth,
            min_samples_leaf: p.min_samples_leaf.max(1),
            seed: p.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Split { feature: usize, threshold: f64, left: usize, right: usize },
    Leaf { value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { value } => return *value,
                Node::Split { feature, threshold, left, right } => {
                    at = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match &nodes[at] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Fitted booster: `init + learning_rate * sum(tree(x))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    init: f64,
    learning_rate: f64,
    n_features: usize,
    trees: Vec<RegressionTree>,
}

impl GradientBoostedTrees {
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        self.init + self.learning_rate * self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    #[cfg(test)]
    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }
}

impl Fit<Array2<f64>, Array1<f64>, PitwiseError> for BoostingParams {
    type Object = GradientBoostedTrees;

    fn fit(&self, dataset: &DatasetBase<Array2<f64>, Array1<f64>>) -> Result<Self::Object, PitwiseError> {
        let x = dataset.records();
        let y = dataset.targets();
        let n = x.nrows();
        if n == 0 || y.len() != n {
            return Err(PitwiseError::Fit(format!("{} rows against {} targets", n, y.len())));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(PitwiseError::Fit("non-finite value in training data".into()));
        }

        let weights: Vec<f64> = match dataset.weights() {
            Some(w) if w.len() == n => w.iter().map(|&v| v as f64).collect(),
            _ => vec![1.0; n],
        };
        let total_w: f64 = weights.iter().sum();
        if total_w <= 0.0 {
            return Err(PitwiseError::Fit("sample weights sum to zero".into()));
        }

        let init = weights.iter().zip(y.iter()).map(|(w, t)| w * t).sum::<f64>() / total_w;
        let mut current = vec![init; n];
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut trees = Vec::with_capacity(self.n_estimators);

        for _ in 0..self.n_estimators {
            let residual: Vec<f64> = y.iter().zip(&current).map(|(t, f)| t - f).collect();
            let mut builder = TreeBuilder {
                x,
                residual: &residual,
                weights: &weights,
                max_depth: self.max_depth,
                min_samples_leaf: self.min_samples_leaf.max(1),
                rng: &mut rng,
                nodes: Vec::new(),
            };
            let mut idx: Vec<usize> = (0..n).collect();
            builder.grow(&mut idx, 0);
            let tree = RegressionTree { nodes: builder.nodes };

            for (i, f) in current.iter_mut().enumerate() {
                *f += self.learning_rate * tree.predict_row(x.row(i));
            }
            trees.push(tree);
        }

        Ok(GradientBoostedTrees { init, learning_rate: self.learning_rate, n_features: x.ncols(), trees })
    }
}

impl<D: Data<Elem = f64>> PredictInplace<ArrayBase<D, Ix2>, Array1<f64>> for GradientBoostedTrees {
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<f64>) {
        assert_eq!(x.nrows(), y.len(), "the number of data points must match the number of output targets");
        for (row, out) in x.rows().into_iter().zip(y.iter_mut()) {
            *out = self.predict_row(row);
        }
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<f64> {
        Array1::zeros(x.nrows())
    }
}

struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct TreeBuilder<'a> {
    x: &'a Array2<f64>,
    residual: &'a [f64],
    weights: &'a [f64],
    max_depth: usize,
    min_samples_leaf: usize,
    rng: &'a mut ChaCha8Rng,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    // grows the subtree over `idx` and returns its node id
    fn grow(&mut self, idx: &mut [usize], depth: usize) -> usize {
        let (sum_w, sum_wr) = self.sums(idx);
        let value = if sum_w > 0.0 { sum_wr / sum_w } else { 0.0 };
        let slot = self.nodes.len();
        self.nodes.push(Node::Leaf { value });

        if depth >= self.max_depth || idx.len() < 2 * self.min_samples_leaf {
            return slot;
        }
        let Some(split) = self.best_split(idx, sum_w, sum_wr) else {
            return slot;
        };

        let x = self.x;
        idx.sort_by_key(|&i| x[[i, split.feature]] > split.threshold);
        let mid = idx.iter().take_while(|&&i| x[[i, split.feature]] <= split.threshold).count();
        let (left_idx, right_idx) = idx.split_at_mut(mid);
        let left = self.grow(left_idx, depth + 1);
        let right = self.grow(right_idx, depth + 1);
        self.nodes[slot] = Node::Split { feature: split.feature, threshold: split.threshold, left, right };
        slot
    }

    fn sums(&self, idx: &[usize]) -> (f64, f64) {
        idx.iter().fold((0.0, 0.0), |(w, wr), &i| (w + self.weights[i], wr + self.weights[i] * self.residual[i]))
    }

    fn best_split(&mut self, idx: &[usize], sum_w: f64, sum_wr: f64) -> Option<Split> {
        let parent_score = sum_wr * sum_wr / sum_w;
        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(&mut *self.rng);

        let mut best: Option<Split> = None;
        let mut order = idx.to_vec();
        for feature in features {
            let col = self.x.column(feature);
            order.sort_by(|&a, &b| col[a].total_cmp(&col[b]));

            let (mut lw, mut lwr) = (0.0, 0.0);
            for k in 0..order.len() - 1 {
                let i = order[k];
                lw += self.weights[i];
                lwr += self.weights[i] * self.residual[i];

                let (here, next) = (col[i], col[order[k + 1]]);
                if here >= next || k + 1 < self.min_samples_leaf || order.len() - (k + 1) < self.min_samples_leaf {
                    continue;
                }
                let rw = sum_w - lw;
                if lw <= 0.0 || rw <= 0.0 {
                    continue;
                }
                let rwr = sum_wr - lwr;
                let gain = lwr * lwr / lw + rwr * rwr / rw - parent_score;
                if gain > MIN_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                    let mut threshold = here + (next - here) / 2.0;
                    if threshold >= next {
                        threshold = here;
                    }
                    best = Some(Split { feature, threshold, gain });
                }
            }
        }
        best
    }
}
