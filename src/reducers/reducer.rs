//! trait for dimension reduction

use ndarray::{Array2, ArrayView2};

/// A reducer maps rows of a (nb sample, nb feature) matrix to a low dimensional space.
/// Labels are only used by supervised reducers, others ignore them.
pub trait Reducer {
    /// fit reducer on data, labels must have one item by row when given
    fn fit(&mut self, data: ArrayView2<f64>, labels: Option<&[String]>) -> anyhow::Result<()>;

    /// reduce dimension of data with a fitted reducer, never refits
    fn transform(&self, data: ArrayView2<f64>) -> anyhow::Result<Array2<f64>>;

    /// fit and return the reduced data
    fn fit_transform(&mut self, data: ArrayView2<f64>, labels: Option<&[String]>) -> anyhow::Result<Array2<f64>> {
        self.fit(data, labels)?;
        self.transform(data)
    }

    /// dimension of the reduced space
    fn get_nb_components(&self) -> usize;
}
