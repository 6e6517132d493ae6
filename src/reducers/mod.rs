//! module for dimension reduction of aisnp features.
//!
//! All reducers implement the [Reducer](reducer::Reducer) trait. [ReducerModel] gathers the supported algorithms
//! in one serializable type, this is what gets dumped in model files.

use serde::{Deserialize, Serialize};
use std::fmt;

use ndarray::{Array2, ArrayView2};

pub mod metric;
pub mod nca;
pub mod pca;
pub mod reducer;
pub mod umap;

use metric::Metric;
use nca::Nca;
use pca::Pca;
use reducer::Reducer;
use umap::{Umap, UmapParams};

/// min_dist of umap for one-hot snp data
pub const SNP_UMAP_MIN_DIST: f64 = 0.2;

/// metric of umap for one-hot snp data
pub const SNP_UMAP_METRIC: Metric = Metric::Dice;

/// algorithms for which a model can be fitted, persisted and reapplied.
/// (t-SNE has no out of sample transform and is not one of them)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    Pca,
    Umap,
    Nca,
}

impl Algorithm {
    /// case insensitive parsing, None for anything not supported
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "pca" => Some(Algorithm::Pca),
            "umap" => Some(Algorithm::Umap),
            "nca" => Some(Algorithm::Nca),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Pca => "pca",
            Algorithm::Umap => "umap",
            Algorithm::Nca => "nca",
        }
    }

    /// true if fitting requires labels, models are then also keyed by population level
    pub fn uses_labels(&self) -> bool {
        matches!(self, Algorithm::Nca)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// a reducer of any supported algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReducerModel {
    Pca(Pca),
    Umap(Umap),
    Nca(Nca),
}

impl ReducerModel {
    /// Unfitted reducer. Umap is set to min_dist 0.2 and the dice metric, the configuration used for snp data.
    pub fn new(algorithm: Algorithm, n_components: usize, random_state: Option<u64>) -> Self {
        match algorithm {
            Algorithm::Pca => ReducerModel::Pca(Pca::new(n_components, random_state)),
            Algorithm::Umap => ReducerModel::Umap(Umap::new(UmapParams {
                n_components,
                min_dist: SNP_UMAP_MIN_DIST,
                metric: SNP_UMAP_METRIC,
                random_state,
                ..Default::default()
            })),
            Algorithm::Nca => ReducerModel::Nca(Nca::new(n_components, random_state)),
        }
    }

    pub fn get_algorithm(&self) -> Algorithm {
        match self {
            ReducerModel::Pca(_) => Algorithm::Pca,
            ReducerModel::Umap(_) => Algorithm::Umap,
            ReducerModel::Nca(_) => Algorithm::Nca,
        }
    }
} // end of impl ReducerModel

impl Reducer for ReducerModel {
    fn fit(&mut self, data: ArrayView2<f64>, labels: Option<&[String]>) -> anyhow::Result<()> {
        match self {
            ReducerModel::Pca(r) => r.fit(data, labels),
            ReducerModel::Umap(r) => r.fit(data, labels),
            ReducerModel::Nca(r) => r.fit(data, labels),
        }
    }

    fn transform(&self, data: ArrayView2<f64>) -> anyhow::Result<Array2<f64>> {
        match self {
            ReducerModel::Pca(r) => r.transform(data),
            ReducerModel::Umap(r) => r.transform(data),
            ReducerModel::Nca(r) => r.transform(data),
        }
    }

    fn fit_transform(&mut self, data: ArrayView2<f64>, labels: Option<&[String]>) -> anyhow::Result<Array2<f64>> {
        match self {
            ReducerModel::Pca(r) => r.fit_transform(data, labels),
            ReducerModel::Umap(r) => r.fit_transform(data, labels),
            ReducerModel::Nca(r) => r.fit_transform(data, labels),
        }
    }

    fn get_nb_components(&self) -> usize {
        match self {
            ReducerModel::Pca(r) => r.get_nb_components(),
            ReducerModel::Umap(r) => r.get_nb_components(),
            ReducerModel::Nca(r) => r.get_nb_components(),
        }
    }
} // end of impl Reducer for ReducerModel
