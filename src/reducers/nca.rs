//! Neighbourhood Components Analysis.
//!
//! Goldberger, Roweis, Hinton, Salakhutdinov 2005 :
//! [nca](https://www.cs.toronto.edu/~hinton/absps/nca.pdf).
//! A linear map is learned so that a stochastic nearest neighbour classifier on the mapped data
//! recovers the labels (here population or superpopulation of samples).

use anyhow::anyhow;

use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayView2};
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::pca::Pca;
use super::reducer::Reducer;

const DEFAULT_MAX_ITER: usize = 50;
const DEFAULT_TOL: f64 = 1.0e-5;
// max nb of step halvings in one iteration
const NB_BACKTRACK: usize = 30;

#[cfg_attr(doc, katexit::katexit)]
/// NCA reducer.
///
/// With $A$ the (n_components, n_features) map, $p_{ij} = \frac{\exp(-\|Ax_i - Ax_j\|^2)}{\sum_{k \ne i} \exp(-\|Ax_i - Ax_k\|^2)}$
/// and $p_i = \sum_{j \in C_i} p_{ij}$, the objective $\sum_i p_i$ is maximized by gradient ascent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nca {
    n_components: usize,
    max_iter: usize,
    tol: f64,
    random_state: Option<u64>,
    // (n_components, n_features)
    components: Option<Array2<f64>>,
    // distinct labels in order of appearance
    classes: Vec<String>,
    // nb of iterations done at fit
    n_iter: usize,
}

impl Nca {
    pub fn new(n_components: usize, random_state: Option<u64>) -> Self {
        Nca {
            n_components,
            max_iter: DEFAULT_MAX_ITER,
            tol: DEFAULT_TOL,
            random_state,
            components: None,
            classes: Vec::new(),
            n_iter: 0,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn get_components(&self) -> Option<&Array2<f64>> {
        self.components.as_ref()
    }

    pub fn get_classes(&self) -> &[String] {
        &self.classes
    }

    pub fn get_nb_iter(&self) -> usize {
        self.n_iter
    }

    // initial map : pca axes if possible, else a seeded gaussian matrix
    fn init_components(&self, data: ArrayView2<f64>) -> anyhow::Result<Array2<f64>> {
        let (n_samples, n_features) = data.dim();
        if self.n_components < n_samples.min(n_features) {
            let mut pca = Pca::new(self.n_components, self.random_state);
            pca.fit(data, None)?;
            if let Some(components) = pca.get_components() {
                if components.iter().any(|x| *x != 0.) {
                    return Ok(components.clone());
                }
            }
        }
        let seed = match self.random_state {
            Some(s) => s,
            None => rand::rng().random::<u64>(),
        };
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        Ok(Array2::from_shape_fn((self.n_components, n_features), |_| {
            rng.sample::<f64, _>(StandardNormal)
        }))
    }
} // end of impl Nca

/// objective and its gradient with respect to the map
pub(crate) fn loss_grad(components: &Array2<f64>, data: ArrayView2<f64>, class_ids: &[usize]) -> (f64, Array2<f64>) {
    let n = data.nrows();
    let embedded = data.dot(&components.t());
    // rows of p_ij, softmax over j != i
    let p_rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let ei = embedded.row(i);
            let mut row: Vec<f64> = (0..n)
                .map(|j| {
                    if i == j {
                        f64::NEG_INFINITY
                    } else {
                        let diff = &ei - &embedded.row(j);
                        -diff.dot(&diff)
                    }
                })
                .collect();
            let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if max == f64::NEG_INFINITY {
                return vec![0.; n];
            }
            let mut sum = 0.;
            for x in row.iter_mut() {
                *x = (*x - max).exp();
                sum += *x;
            }
            for x in row.iter_mut() {
                *x /= sum;
            }
            row
        })
        .collect();
    //
    let mut weighted = Array2::<f64>::zeros((n, n));
    let mut loss = 0.;
    for i in 0..n {
        let p_i: f64 = (0..n)
            .filter(|j| class_ids[*j] == class_ids[i])
            .map(|j| p_rows[i][j])
            .sum();
        loss += p_i;
        for j in 0..n {
            let masked = if class_ids[j] == class_ids[i] { p_rows[i][j] } else { 0. };
            weighted[[i, j]] = masked - p_rows[i][j] * p_i;
        }
    }
    let col_sums: Array1<f64> = weighted.sum_axis(ndarray::Axis(0));
    let mut sym = &weighted + &weighted.t();
    for i in 0..n {
        sym[[i, i]] = -col_sums[i];
    }
    let grad = embedded.t().dot(&sym).dot(&data) * 2.;
    (loss, grad)
} // end of loss_grad

impl Reducer for Nca {
    fn fit(&mut self, data: ArrayView2<f64>, labels: Option<&[String]>) -> anyhow::Result<()> {
        let labels = labels.ok_or_else(|| anyhow!("nca requires labels"))?;
        let (n_samples, n_features) = data.dim();
        if labels.len() != n_samples {
            return Err(anyhow!(
                "nca got {} labels for {} samples",
                labels.len(),
                n_samples
            ));
        }
        if n_samples < 2 {
            return Err(anyhow!("nca needs at least 2 samples, got {}", n_samples));
        }
        if self.n_components == 0 || self.n_components > n_features {
            return Err(anyhow!(
                "nca : n_components = {} must be between 1 and n_features = {}",
                self.n_components,
                n_features
            ));
        }
        // labels to class ids
        let mut classes = IndexMap::<String, usize>::new();
        let class_ids: Vec<usize> = labels
            .iter()
            .map(|l| {
                let next = classes.len();
                *classes.entry(l.clone()).or_insert(next)
            })
            .collect();
        log::debug!("nca : {} samples in {} classes", n_samples, classes.len());
        //
        let mut components = self.init_components(data)?;
        let (mut loss, mut grad) = loss_grad(&components, data, &class_ids);
        let norm = |m: &Array2<f64>| m.iter().map(|x| x * x).sum::<f64>().sqrt();
        let mut step = 0.1 * norm(&components).max(1.0e-12) / norm(&grad).max(1.0e-12);
        let mut n_iter = 0;
        while n_iter < self.max_iter {
            n_iter += 1;
            if norm(&grad) <= f64::EPSILON {
                break;
            }
            let mut accepted = None;
            for _ in 0..NB_BACKTRACK {
                let candidate = &components + &(&grad * step);
                let (new_loss, new_grad) = loss_grad(&candidate, data, &class_ids);
                if new_loss > loss {
                    accepted = Some((candidate, new_loss, new_grad));
                    break;
                }
                step *= 0.5;
            }
            let Some((candidate, new_loss, new_grad)) = accepted else {
                log::debug!("nca : no ascent step found at iteration {}", n_iter);
                break;
            };
            let gain = new_loss - loss;
            components = candidate;
            loss = new_loss;
            grad = new_grad;
            step *= 1.2;
            log::trace!("nca iter {} loss {:.6e}", n_iter, loss);
            if gain <= self.tol * loss.abs().max(1.) {
                break;
            }
        }
        log::debug!("nca : end after {} iterations, objective {:.4e} / {}", n_iter, loss, n_samples);
        //
        self.components = Some(components);
        self.classes = classes.into_keys().collect();
        self.n_iter = n_iter;
        Ok(())
    } // end of fit

    fn transform(&self, data: ArrayView2<f64>) -> anyhow::Result<Array2<f64>> {
        let components = self
            .components
            .as_ref()
            .ok_or_else(|| anyhow!("nca is not fitted"))?;
        if data.ncols() != components.ncols() {
            return Err(anyhow!(
                "nca fitted on {} features, data have {}",
                components.ncols(),
                data.ncols()
            ));
        }
        Ok(data.dot(&components.t()))
    }

    fn get_nb_components(&self) -> usize {
        self.n_components
    }
} // end of impl Reducer for Nca
