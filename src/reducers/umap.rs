//! Uniform Manifold Approximation and Projection.
//!
//! Implementation follows the reference algorithm of McInnes, Healy, Melville 2018
//! [umap](https://arxiv.org/abs/1802.03426):
//! - a k nearest neighbour graph is built in the original space with the chosen [Metric],
//! - distances are turned into fuzzy memberships (local $\rho$, $\sigma$ calibrated on $\log_2(k)$),
//! - the fuzzy union of the graph is laid out by stochastic gradient descent with negative sampling.
//!
//! The model keeps its training data and embedding so that new points can be placed
//! in the fitted embedding without refitting.

use anyhow::anyhow;

use std::cmp::Ordering;

use indexmap::IndexMap;
use ndarray::{Array2, ArrayView2};
use rand::distr::{Distribution, Uniform};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::metric::Metric;
use super::reducer::Reducer;

const SMOOTH_K_TOLERANCE: f64 = 1.0e-5;
const MIN_K_DIST_SCALE: f64 = 1.0e-3;
const NB_SIGMA_ITER: usize = 64;
// gradient clipping in layout
const GRAD_CLIP: f64 = 4.0;
// range of random initialization
const INIT_RANGE: f64 = 10.0;
// salt to derive the transform rng from the fit seed
const TRANSFORM_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// parameters of umap
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UmapParams {
    pub n_components: usize,
    /// size of local neighbourhood
    pub n_neighbors: usize,
    /// minimum distance between embedded points
    pub min_dist: f64,
    /// scale of embedded points
    pub spread: f64,
    pub metric: Metric,
    /// nb of layout epochs, if None 500 for less than 10000 points, 200 otherwise
    pub n_epochs: Option<usize>,
    pub learning_rate: f64,
    pub negative_sample_rate: usize,
    pub repulsion_strength: f64,
    pub random_state: Option<u64>,
}

impl Default for UmapParams {
    fn default() -> Self {
        UmapParams {
            n_components: 2,
            n_neighbors: 15,
            min_dist: 0.1,
            spread: 1.0,
            metric: Metric::Euclidean,
            n_epochs: None,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            repulsion_strength: 1.0,
            random_state: None,
        }
    }
}

// an edge of the fuzzy graph, membership strength is weight
#[derive(Debug, Clone, Copy)]
struct Edge {
    head: usize,
    tail: usize,
    weight: f64,
}

/// umap reducer, see module doc
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Umap {
    params: UmapParams,
    // curve parameters of low dimensional similarity 1/(1 + a d^2b)
    a: f64,
    b: f64,
    // seed actually used, drawn at fit time if params have none
    seed: u64,
    // effective number of neighbours
    nb_neighbours: usize,
    n_epochs: usize,
    training: Option<Array2<f64>>,
    embedding: Option<Array2<f64>>,
}

impl Umap {
    pub fn new(params: UmapParams) -> Self {
        let (a, b) = find_ab_params(params.spread, params.min_dist);
        log::debug!("umap min_dist {} spread {} -> a = {:.3e} b = {:.3e}", params.min_dist, params.spread, a, b);
        Umap {
            params,
            a,
            b,
            seed: 0,
            nb_neighbours: 0,
            n_epochs: 0,
            training: None,
            embedding: None,
        }
    }

    pub fn get_params(&self) -> &UmapParams {
        &self.params
    }

    /// returns (a,b) curve parameters
    pub fn get_ab(&self) -> (f64, f64) {
        (self.a, self.b)
    }

    /// embedding of training data
    pub fn get_embedding(&self) -> Option<&Array2<f64>> {
        self.embedding.as_ref()
    }

    fn get_epochs(&self, nb_data: usize) -> usize {
        match self.params.n_epochs {
            Some(n) => n.max(1),
            None => {
                if nb_data <= 10_000 {
                    500
                } else {
                    200
                }
            }
        }
    }

    // runs sgd layout, head rows move; tail rows also move when tail is None (head and tail are the same set)
    fn optimize_layout(&self, head: &mut Array2<f64>, tail: Option<&Array2<f64>>, edges: &[Edge], n_epochs: usize, rng: &mut Xoshiro256PlusPlus) {
        if edges.is_empty() {
            return;
        }
        let dim = head.ncols();
        let nb_tail = tail.map(|t| t.nrows()).unwrap_or(head.nrows());
        let (a, b) = (self.a, self.b);
        let gamma = self.params.repulsion_strength;
        //
        let w_max = edges.iter().fold(0., |acc: f64, e| acc.max(e.weight));
        let epochs_per_sample: Vec<f64> = edges
            .iter()
            .map(|e| {
                let nb_samples = n_epochs as f64 * e.weight / w_max;
                if nb_samples > 0. { n_epochs as f64 / nb_samples } else { -1. }
            })
            .collect();
        let neg_rate = self.params.negative_sample_rate.max(1) as f64;
        let epochs_per_negative: Vec<f64> = epochs_per_sample.iter().map(|e| e / neg_rate).collect();
        let mut next_sample = epochs_per_sample.clone();
        let mut next_negative = epochs_per_negative.clone();
        let mut other = vec![0.; dim];
        //
        for epoch in 0..n_epochs {
            let alpha = self.params.learning_rate * (1. - epoch as f64 / n_epochs as f64);
            let epoch_f = epoch as f64;
            for (i, edge) in edges.iter().enumerate() {
                if epochs_per_sample[i] <= 0. || next_sample[i] > epoch_f {
                    continue;
                }
                let (j, k) = (edge.head, edge.tail);
                // attraction
                for d in 0..dim {
                    other[d] = match tail {
                        Some(t) => t[[k, d]],
                        None => head[[k, d]],
                    };
                }
                let dist2: f64 = (0..dim).map(|d| (head[[j, d]] - other[d]).powi(2)).sum();
                let grad_coeff = if dist2 > 0. {
                    -2. * a * b * dist2.powf(b - 1.) / (a * dist2.powf(b) + 1.)
                } else {
                    0.
                };
                for d in 0..dim {
                    let grad = (grad_coeff * (head[[j, d]] - other[d])).clamp(-GRAD_CLIP, GRAD_CLIP);
                    head[[j, d]] += grad * alpha;
                    if tail.is_none() {
                        head[[k, d]] -= grad * alpha;
                    }
                }
                next_sample[i] += epochs_per_sample[i];
                // repulsion from random points
                let nb_neg = ((epoch_f - next_negative[i]) / epochs_per_negative[i]).max(0.) as usize;
                for _ in 0..nb_neg {
                    let k = rng.random_range(0..nb_tail);
                    if tail.is_none() && k == j {
                        continue;
                    }
                    for d in 0..dim {
                        other[d] = match tail {
                            Some(t) => t[[k, d]],
                            None => head[[k, d]],
                        };
                    }
                    let dist2: f64 = (0..dim).map(|d| (head[[j, d]] - other[d]).powi(2)).sum();
                    let grad_coeff = if dist2 > 0. {
                        2. * gamma * b / ((0.001 + dist2) * (a * dist2.powf(b) + 1.))
                    } else {
                        0.
                    };
                    for d in 0..dim {
                        let grad = if grad_coeff > 0. {
                            (grad_coeff * (head[[j, d]] - other[d])).clamp(-GRAD_CLIP, GRAD_CLIP)
                        } else {
                            GRAD_CLIP
                        };
                        head[[j, d]] += grad * alpha;
                    }
                }
                next_negative[i] += nb_neg as f64 * epochs_per_negative[i];
            }
            if epoch % 100 == 0 {
                log::trace!("umap layout epoch {}/{}", epoch, n_epochs);
            }
        }
    } // end of optimize_layout
} // end of impl Umap

/// k nearest neighbours of query rows among reference rows, sorted by increasing distance.
/// If same_set is true query and reference are the same rows and a point is not its own neighbour.
fn nearest_neighbours(query: ArrayView2<f64>, reference: ArrayView2<f64>, k: usize, metric: Metric, same_set: bool) -> Vec<Vec<(usize, f64)>> {
    (0..query.nrows())
        .into_par_iter()
        .map(|i| {
            let q = query.row(i);
            let mut dists: Vec<(usize, f64)> = (0..reference.nrows())
                .filter(|j| !same_set || *j != i)
                .map(|j| (j, metric.distance(q, reference.row(j))))
                .collect();
            dists.sort_by(|x, y| x.1.partial_cmp(&y.1).unwrap_or(Ordering::Equal).then(x.0.cmp(&y.0)));
            dists.truncate(k);
            dists
        })
        .collect()
}

/// For each point, find rho (distance to nearest distinct neighbour) and sigma such that
/// the sum of memberships of its neighbours equals log2(k+1).
fn smooth_knn_dist(knn: &[Vec<(usize, f64)>]) -> Vec<(f64, f64)> {
    let all_mean = {
        let (sum, nb) = knn
            .iter()
            .flat_map(|v| v.iter())
            .fold((0., 0usize), |acc, (_, d)| (acc.0 + d, acc.1 + 1));
        if nb > 0 { sum / nb as f64 } else { 0. }
    };
    knn.par_iter()
        .map(|neighbours| {
            if neighbours.is_empty() {
                return (0., 1.);
            }
            let target = ((neighbours.len() + 1) as f64).log2();
            let rho = neighbours
                .iter()
                .map(|(_, d)| *d)
                .find(|d| *d > 0.)
                .unwrap_or(0.);
            let (mut lo, mut hi, mut mid) = (0., f64::INFINITY, 1.);
            for _ in 0..NB_SIGMA_ITER {
                let psum: f64 = neighbours
                    .iter()
                    .map(|(_, d)| {
                        let gap = d - rho;
                        if gap > 0. { (-gap / mid).exp() } else { 1. }
                    })
                    .sum();
                if (psum - target).abs() < SMOOTH_K_TOLERANCE {
                    break;
                }
                if psum > target {
                    hi = mid;
                    mid = (lo + hi) / 2.;
                } else {
                    lo = mid;
                    if hi == f64::INFINITY {
                        mid *= 2.;
                    } else {
                        mid = (lo + hi) / 2.;
                    }
                }
            }
            let mean_i = neighbours.iter().map(|(_, d)| d).sum::<f64>() / neighbours.len() as f64;
            let floor = if rho > 0. { MIN_K_DIST_SCALE * mean_i } else { MIN_K_DIST_SCALE * all_mean };
            (rho, mid.max(floor).max(f64::MIN_POSITIVE))
        })
        .collect()
} // end of smooth_knn_dist

// memberships of directed knn edges
fn membership(knn: &[Vec<(usize, f64)>], rho_sigma: &[(f64, f64)]) -> Vec<Vec<(usize, f64)>> {
    knn.iter()
        .zip(rho_sigma.iter())
        .map(|(neighbours, (rho, sigma))| {
            neighbours
                .iter()
                .map(|(j, d)| {
                    let gap = d - rho;
                    let w = if gap > 0. { (-gap / sigma).exp() } else { 1. };
                    (*j, w)
                })
                .collect()
        })
        .collect()
}

// fuzzy union p = w_ij + w_ji - w_ij * w_ji, both directions returned in a deterministic order
fn fuzzy_union(directed: &[Vec<(usize, f64)>]) -> Vec<Edge> {
    let mut pairs = IndexMap::<(usize, usize), (f64, f64)>::new();
    for (i, neighbours) in directed.iter().enumerate() {
        for (j, w) in neighbours {
            if i == *j {
                continue;
            }
            let key = (i.min(*j), i.max(*j));
            let entry = pairs.entry(key).or_insert((0., 0.));
            if i < *j {
                entry.0 = entry.0.max(*w);
            } else {
                entry.1 = entry.1.max(*w);
            }
        }
    }
    let mut edges = Vec::<Edge>::with_capacity(2 * pairs.len());
    for ((i, j), (w_ij, w_ji)) in pairs {
        let weight = w_ij + w_ji - w_ij * w_ji;
        if weight > 0. {
            edges.push(Edge { head: i, tail: j, weight });
            edges.push(Edge { head: j, tail: i, weight });
        }
    }
    edges
}

// drop edges too weak to be sampled at least once
fn prune_edges(edges: Vec<Edge>, n_epochs: usize) -> Vec<Edge> {
    let w_max = edges.iter().fold(0., |acc: f64, e| acc.max(e.weight));
    let threshold = w_max / n_epochs as f64;
    edges.into_iter().filter(|e| e.weight >= threshold).collect()
}

#[cfg_attr(doc, katexit::katexit)]
/// Fits $a, b$ such that $1/(1 + a x^{2b})$ approximates the target membership curve
/// $1$ for $x < min\_dist$, $\exp(-(x - min\_dist)/spread)$ beyond.
/// Least squares on 300 points of $[0, 3 \cdot spread]$ by Levenberg-Marquardt.
pub fn find_ab_params(spread: f64, min_dist: f64) -> (f64, f64) {
    let nb_points = 300;
    let xs: Vec<f64> = (0..nb_points)
        .map(|i| 3. * spread * i as f64 / (nb_points - 1) as f64)
        .filter(|x| *x > 0.)
        .collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|x| if *x < min_dist { 1. } else { (-(x - min_dist) / spread).exp() })
        .collect();
    //
    let residuals = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(ys.iter())
            .map(|(x, y)| (1. / (1. + a * x.powf(2. * b)) - y).powi(2))
            .sum()
    };
    let (mut a, mut b) = (1., 1.);
    let mut lambda = 1.0e-3;
    let mut cost = residuals(a, b);
    for _ in 0..200 {
        // normal equations J^t J delta = -J^t r
        let (mut jaa, mut jab, mut jbb, mut ga, mut gb) = (0., 0., 0., 0., 0.);
        for (x, y) in xs.iter().zip(ys.iter()) {
            let u = x.powf(2. * b);
            let f = 1. / (1. + a * u);
            let r = f - y;
            let da = -u * f * f;
            let db = -a * u * 2. * x.ln() * f * f;
            jaa += da * da;
            jab += da * db;
            jbb += db * db;
            ga += da * r;
            gb += db * r;
        }
        let mut improved = false;
        for _ in 0..20 {
            let (maa, mbb) = (jaa * (1. + lambda), jbb * (1. + lambda));
            let det = maa * mbb - jab * jab;
            if det.abs() < f64::MIN_POSITIVE {
                lambda *= 10.;
                continue;
            }
            let delta_a = -(mbb * ga - jab * gb) / det;
            let delta_b = -(maa * gb - jab * ga) / det;
            let (new_a, new_b) = (a + delta_a, b + delta_b);
            if new_a > 0. && new_b > 0. {
                let new_cost = residuals(new_a, new_b);
                if new_cost < cost {
                    let gain = cost - new_cost;
                    a = new_a;
                    b = new_b;
                    cost = new_cost;
                    lambda = (lambda / 10.).max(1.0e-12);
                    improved = gain > 1.0e-15;
                    break;
                }
            }
            lambda *= 10.;
        }
        if !improved {
            break;
        }
    }
    (a, b)
} // end of find_ab_params

impl Reducer for Umap {
    fn fit(&mut self, data: ArrayView2<f64>, _labels: Option<&[String]>) -> anyhow::Result<()> {
        let n = data.nrows();
        if n < 2 {
            return Err(anyhow!("umap needs at least 2 samples, got {}", n));
        }
        if self.params.n_components == 0 {
            return Err(anyhow!("umap : n_components must be positive"));
        }
        let seed = match self.params.random_state {
            Some(s) => s,
            None => rand::rng().random::<u64>(),
        };
        let k = self.params.n_neighbors.max(1).min(n - 1);
        if k < self.params.n_neighbors {
            log::debug!("umap : n_neighbors reduced to {} for {} samples", k, n);
        }
        let n_epochs = self.get_epochs(n);
        //
        let knn = nearest_neighbours(data, data, k, self.params.metric, true);
        let rho_sigma = smooth_knn_dist(&knn);
        let edges = prune_edges(fuzzy_union(&membership(&knn, &rho_sigma)), n_epochs);
        log::debug!("umap graph : {} points, {} directed edges", n, edges.len());
        //
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let unif = Uniform::<f64>::new(-INIT_RANGE, INIT_RANGE)?;
        let mut embedding = Array2::<f64>::from_shape_fn((n, self.params.n_components), |_| unif.sample(&mut rng));
        self.optimize_layout(&mut embedding, None, &edges, n_epochs, &mut rng);
        //
        self.seed = seed;
        self.nb_neighbours = k;
        self.n_epochs = n_epochs;
        self.training = Some(data.to_owned());
        self.embedding = Some(embedding);
        Ok(())
    } // end of fit

    /// places new points in the fitted embedding, training embedding is left untouched
    fn transform(&self, data: ArrayView2<f64>) -> anyhow::Result<Array2<f64>> {
        let (training, embedding) = match (self.training.as_ref(), self.embedding.as_ref()) {
            (Some(t), Some(e)) => (t, e),
            _ => return Err(anyhow!("umap is not fitted")),
        };
        if data.ncols() != training.ncols() {
            return Err(anyhow!(
                "umap fitted on {} features, data have {}",
                training.ncols(),
                data.ncols()
            ));
        }
        let nb_new = data.nrows();
        let dim = embedding.ncols();
        if nb_new == 0 {
            return Ok(Array2::<f64>::zeros((0, dim)));
        }
        let knn = nearest_neighbours(data, training.view(), self.nb_neighbours, self.params.metric, false);
        let rho_sigma = smooth_knn_dist(&knn);
        let directed = membership(&knn, &rho_sigma);
        // initial position : membership weighted mean of neighbours embedding
        let mut placed = Array2::<f64>::zeros((nb_new, dim));
        for (i, neighbours) in directed.iter().enumerate() {
            let total: f64 = neighbours.iter().map(|(_, w)| w).sum();
            if total <= 0. {
                continue;
            }
            for (j, w) in neighbours {
                for d in 0..dim {
                    placed[[i, d]] += w / total * embedding[[*j, d]];
                }
            }
        }
        //
        let n_epochs = (self.n_epochs / 3).max(1);
        let edges: Vec<Edge> = directed
            .iter()
            .enumerate()
            .flat_map(|(i, neighbours)| neighbours.iter().map(move |(j, w)| Edge { head: i, tail: *j, weight: *w }))
            .filter(|e| e.weight > 0.)
            .collect();
        let edges = prune_edges(edges, n_epochs);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed ^ TRANSFORM_SALT);
        self.optimize_layout(&mut placed, Some(embedding), &edges, n_epochs, &mut rng);
        Ok(placed)
    } // end of transform

    /// the embedding of training data is returned, as reference umap does
    fn fit_transform(&mut self, data: ArrayView2<f64>, labels: Option<&[String]>) -> anyhow::Result<Array2<f64>> {
        self.fit(data, labels)?;
        self.embedding
            .clone()
            .ok_or_else(|| anyhow!("umap embedding missing after fit"))
    }

    fn get_nb_components(&self) -> usize {
        self.params.n_components
    }
} // end of impl Reducer for Umap

#[cfg(test)]
mod tests {

    use super::*;

    fn log_init_test() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    // two well separated groups of binary vectors
    fn two_groups(nb_by_group: usize, dim: usize, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        Array2::from_shape_fn((2 * nb_by_group, dim), |(i, j)| {
            let in_first_half = j < dim / 2;
            let group0 = i < nb_by_group;
            let p = if in_first_half == group0 { 0.9 } else { 0.05 };
            if rng.random::<f64>() < p { 1. } else { 0. }
        })
    }

    fn centroid(emb: &Array2<f64>, rows: std::ops::Range<usize>) -> Vec<f64> {
        let nb = rows.len() as f64;
        let mut c = vec![0.; emb.ncols()];
        for i in rows {
            for d in 0..emb.ncols() {
                c[d] += emb[[i, d]] / nb;
            }
        }
        c
    }

    #[test]
    fn ab_params_reference_values() {
        log_init_test();
        // reference umap gives a = 1.577, b = 0.895 for default parameters
        let (a, b) = find_ab_params(1.0, 0.1);
        log::info!("a = {:.4} b = {:.4}", a, b);
        assert!((a - 1.577).abs() < 0.1, "a = {}", a);
        assert!((b - 0.895).abs() < 0.05, "b = {}", b);
    }

    #[test]
    fn smooth_knn_target() {
        let knn = vec![vec![(1, 0.5), (2, 1.0), (3, 2.0)]];
        let rho_sigma = smooth_knn_dist(&knn);
        let (rho, sigma) = rho_sigma[0];
        assert_eq!(rho, 0.5);
        let psum: f64 = knn[0].iter().map(|(_, d)| { let gap: f64 = d - rho; if gap > 0. { (-gap / sigma).exp() } else { 1. } }).sum();
        assert!((psum - 2.).abs() < 1.0e-3);
    }

    #[test]
    fn separates_groups() {
        log_init_test();
        let data = two_groups(20, 30, 4567);
        let params = UmapParams {
            n_components: 2,
            n_neighbors: 8,
            min_dist: 0.2,
            metric: Metric::Dice,
            n_epochs: Some(200),
            random_state: Some(42),
            ..Default::default()
        };
        let mut umap = Umap::new(params);
        let emb = umap.fit_transform(data.view(), None).unwrap();
        assert_eq!(emb.dim(), (40, 2));
        assert!(emb.iter().all(|x| x.is_finite()));
        // each point is closer to its own group centroid
        let c0 = centroid(&emb, 0..20);
        let c1 = centroid(&emb, 20..40);
        let dist = |i: usize, c: &[f64]| -> f64 { (0..2).map(|d| (emb[[i, d]] - c[d]).powi(2)).sum::<f64>() };
        let nb_ok = (0..40)
            .filter(|i| {
                let (own, other) = if *i < 20 { (&c0, &c1) } else { (&c1, &c0) };
                dist(*i, own) < dist(*i, other)
            })
            .count();
        assert!(nb_ok >= 36, "nb well placed {}", nb_ok);
    }

    #[test]
    fn seeded_fit_is_reproducible() {
        let data = two_groups(10, 20, 11);
        let params = UmapParams {
            n_components: 3,
            n_neighbors: 5,
            metric: Metric::Dice,
            n_epochs: Some(50),
            random_state: Some(7),
            ..Default::default()
        };
        let mut u1 = Umap::new(params);
        let mut u2 = Umap::new(params);
        let e1 = u1.fit_transform(data.view(), None).unwrap();
        let e2 = u2.fit_transform(data.view(), None).unwrap();
        assert_eq!(e1, e2);
        // transform is deterministic and leaves model untouched
        let t1 = u1.transform(data.view()).unwrap();
        let t2 = u1.transform(data.view()).unwrap();
        assert_eq!(t1, t2);
        assert_eq!(t1.dim(), (20, 3));
        assert_eq!(u1.get_embedding().unwrap(), &e1);
    }

    #[test]
    fn transform_needs_fit() {
        let umap = Umap::new(UmapParams::default());
        let data = Array2::<f64>::zeros((3, 4));
        assert!(umap.transform(data.view()).is_err());
    }
}
