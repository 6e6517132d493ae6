//! Principal component analysis.
//!
//! Components are eigenvectors of the sample covariance. When there are fewer samples than features
//! (the usual case for small reference panels) the eigen problem is solved on the Gram matrix.
//! Eigen decompositions go through lapack (`syev` via lax).

use anyhow::anyhow;

use lax::{layout::MatrixLayout, Lapack, UPLO};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::reducer::Reducer;

// eigenvalues under this (relative to the largest) correspond to null directions
const RANK_EPSIL: f64 = 1.0e-12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pca {
    n_components: usize,
    // The full eigen solver is deterministic, seed is kept for the record
    random_state: Option<u64>,
    //
    mean: Option<Array1<f64>>,
    // (n_components, nb features), one component by row
    components: Option<Array2<f64>>,
    explained_variance: Option<Array1<f64>>,
    explained_variance_ratio: Option<Array1<f64>>,
}

impl Pca {
    pub fn new(n_components: usize, random_state: Option<u64>) -> Self {
        Pca {
            n_components,
            random_state,
            mean: None,
            components: None,
            explained_variance: None,
            explained_variance_ratio: None,
        }
    }

    /// principal axes, (n_components, nb features)
    pub fn get_components(&self) -> Option<&Array2<f64>> {
        self.components.as_ref()
    }

    pub fn get_mean(&self) -> Option<&Array1<f64>> {
        self.mean.as_ref()
    }

    pub fn get_explained_variance(&self) -> Option<&Array1<f64>> {
        self.explained_variance.as_ref()
    }

    pub fn get_explained_variance_ratio(&self) -> Option<&Array1<f64>> {
        self.explained_variance_ratio.as_ref()
    }

    pub fn get_random_state(&self) -> Option<u64> {
        self.random_state
    }
} // end of impl Pca

// Eigen decomposition of a symmetric matrix.
// Returns eigenvalues in decreasing order and corresponding eigenvectors as columns.
fn symmetric_eigen(mat: &Array2<f64>) -> anyhow::Result<(Array1<f64>, Array2<f64>)> {
    let n = mat.nrows();
    if n != mat.ncols() {
        return Err(anyhow!("symmetric_eigen : matrix is not square {:?}", mat.dim()));
    }
    if mat.iter().any(|x| !x.is_finite()) {
        return Err(anyhow!("symmetric_eigen : matrix has non finite values"));
    }
    // mat is symmetric so its row major buffer is also its column major buffer
    let layout = MatrixLayout::F {
        col: n as i32,
        lda: n as i32,
    };
    let mut buffer: Vec<f64> = mat.iter().cloned().collect();
    let values = f64::eigh(true, layout, UPLO::Upper, &mut buffer)
        .map_err(|e| anyhow!("symmetric_eigen : a lapack error occurred in eigh : {:?}", e))?;
    // eigenvectors are written column major, so they are the rows of a row major reading.
    // lapack gives increasing eigenvalues
    let by_row = Array2::from_shape_vec((n, n), buffer)?;
    let eigenvalues = Array1::from_iter(values.iter().rev().cloned());
    let mut eigenvectors = Array2::<f64>::zeros((n, n));
    for (rank, k) in (0..n).rev().enumerate() {
        eigenvectors.column_mut(rank).assign(&by_row.row(k));
    }
    log::trace!("symmetric_eigen dim {} done", n);
    Ok((eigenvalues, eigenvectors))
} // end of symmetric_eigen

// eigen decomposition of X^t X / (n-1) directly, used when nb features <= nb samples
fn covariance_axes(centered: &Array2<f64>, n_components: usize) -> anyhow::Result<(Array2<f64>, Array1<f64>)> {
    let n_samples = centered.nrows();
    let cov = centered.t().dot(centered) / (n_samples - 1) as f64;
    let (values, vectors) = symmetric_eigen(&cov)?;
    let mut components = Array2::<f64>::zeros((n_components, centered.ncols()));
    for i in 0..n_components {
        components.row_mut(i).assign(&vectors.column(i));
    }
    let variance = values.slice(ndarray::s![0..n_components]).mapv(|v| v.max(0.));
    Ok((components, variance))
}

// eigen decomposition of X X^t / (n-1) then back to feature space by X^t u
fn gram_axes(centered: &Array2<f64>, n_components: usize) -> anyhow::Result<(Array2<f64>, Array1<f64>)> {
    let n_samples = centered.nrows();
    let gram = centered.dot(&centered.t()) / (n_samples - 1) as f64;
    let (values, vectors) = symmetric_eigen(&gram)?;
    let largest = values[0].abs().max(f64::MIN_POSITIVE);
    let mut components = Array2::<f64>::zeros((n_components, centered.ncols()));
    let mut variance = Array1::<f64>::zeros(n_components);
    for i in 0..n_components {
        if values[i] <= RANK_EPSIL * largest {
            // null direction, data have no variance left
            log::debug!("pca : component {} has null variance", i);
            continue;
        }
        let axis = centered.t().dot(&vectors.column(i));
        let norm = axis.dot(&axis).sqrt();
        if norm > 0. {
            components.row_mut(i).assign(&(axis / norm));
            variance[i] = values[i];
        }
    }
    Ok((components, variance))
}

impl Reducer for Pca {
    fn fit(&mut self, data: ArrayView2<f64>, _labels: Option<&[String]>) -> anyhow::Result<()> {
        let (n_samples, n_features) = data.dim();
        if n_samples < 2 {
            return Err(anyhow!("pca needs at least 2 samples, got {}", n_samples));
        }
        if self.n_components == 0 || self.n_components > n_samples.min(n_features) {
            return Err(anyhow!(
                "pca : n_components = {} must be between 1 and min(n_samples, n_features) = {}",
                self.n_components,
                n_samples.min(n_features)
            ));
        }
        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow!("pca : cannot compute mean of empty data"))?;
        let centered = &data - &mean;
        //
        let (mut components, variance) = if n_features <= n_samples {
            covariance_axes(&centered, self.n_components)?
        } else {
            gram_axes(&centered, self.n_components)?
        };
        // deterministic orientation : largest absolute loading is positive
        for mut row in components.axis_iter_mut(Axis(0)) {
            let pivot = row.iter().fold(0., |acc: f64, x| if x.abs() > acc.abs() { *x } else { acc });
            if pivot < 0. {
                row.mapv_inplace(|x| -x);
            }
        }
        let total_variance = centered.iter().map(|x| x * x).sum::<f64>() / (n_samples - 1) as f64;
        let ratio = if total_variance > 0. {
            &variance / total_variance
        } else {
            Array1::<f64>::zeros(self.n_components)
        };
        log::debug!("pca explained variance ratio : {:?}", ratio);
        //
        self.mean = Some(mean);
        self.components = Some(components);
        self.explained_variance = Some(variance);
        self.explained_variance_ratio = Some(ratio);
        Ok(())
    } // end of fit

    fn transform(&self, data: ArrayView2<f64>) -> anyhow::Result<Array2<f64>> {
        let (components, mean) = match (self.components.as_ref(), self.mean.as_ref()) {
            (Some(c), Some(m)) => (c, m),
            _ => return Err(anyhow!("pca is not fitted")),
        };
        if data.ncols() != mean.len() {
            return Err(anyhow!(
                "pca fitted on {} features, data have {}",
                mean.len(),
                data.ncols()
            ));
        }
        let centered = &data - mean;
        Ok(centered.dot(&components.t()))
    }

    fn get_nb_components(&self) -> usize {
        self.n_components
    }
} // end of impl Reducer for Pca

#[cfg(test)]
mod tests {

    use super::*;

    use ndarray::array;
    use rand::prelude::*;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn log_init_test() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn binary_data(nb_row: usize, nb_col: usize, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        Array2::from_shape_fn((nb_row, nb_col), |_| if rng.random::<f64>() < 0.4 { 1. } else { 0. })
    }

    #[test]
    fn eigen_decreasing_reconstruct() {
        let mat = array![[4., 1., 0.5], [1., 3., 0.2], [0.5, 0.2, 1.]];
        let (values, vectors) = symmetric_eigen(&mat).unwrap();
        assert!(values[0] >= values[1] && values[1] >= values[2]);
        let rebuilt = vectors.dot(&Array2::from_diag(&values)).dot(&vectors.t());
        for (x, y) in rebuilt.iter().zip(mat.iter()) {
            assert!((x - y).abs() < 1.0e-9);
        }
        let id = vectors.t().dot(&vectors);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1. } else { 0. };
                assert!((id[[i, j]] - expected).abs() < 1.0e-9);
            }
        }
        // 2x2 : eigenvalues 3 and 1, first axis along (1,1)
        let (values, vectors) = symmetric_eigen(&array![[2., 1.], [1., 2.]]).unwrap();
        assert!((values[0] - 3.).abs() < 1.0e-10);
        assert!((values[1] - 1.).abs() < 1.0e-10);
        assert!((vectors[[0, 0]] - vectors[[1, 0]]).abs() < 1.0e-10);
        assert!(symmetric_eigen(&array![[1., f64::NAN], [f64::NAN, 1.]]).is_err());
    }

    #[test]
    fn line_variance() {
        log_init_test();
        // points on the line y = 2x
        let data = array![[0., 0.], [1., 2.], [2., 4.], [3., 6.]];
        let mut pca = Pca::new(1, None);
        let reduced = pca.fit_transform(data.view(), None).unwrap();
        let ratio = pca.get_explained_variance_ratio().unwrap();
        assert!((ratio[0] - 1.).abs() < 1.0e-10);
        let axis = pca.get_components().unwrap().row(0).to_owned();
        let norm5 = 5.0f64.sqrt();
        assert!((axis[0] - 1. / norm5).abs() < 1.0e-10);
        assert!((axis[1] - 2. / norm5).abs() < 1.0e-10);
        // projections are centered distances along the line
        assert!((reduced[[0, 0]] + 1.5 * norm5).abs() < 1.0e-10);
        assert!((reduced[[3, 0]] - 1.5 * norm5).abs() < 1.0e-10);
    }

    #[test]
    fn gram_and_covariance_agree() {
        log_init_test();
        // more samples than features : covariance path
        let data = binary_data(30, 8, 1234);
        let mut pca = Pca::new(3, None);
        let reduced = pca.fit_transform(data.view(), None).unwrap();
        // same data with zero padded features goes through the gram path
        let mut wide = Array2::<f64>::zeros((30, 40));
        wide.slice_mut(ndarray::s![.., 0..8]).assign(&data);
        let mut pca_wide = Pca::new(3, None);
        let reduced_wide = pca_wide.fit_transform(wide.view(), None).unwrap();
        for (x, y) in reduced.iter().zip(reduced_wide.iter()) {
            assert!((x - y).abs() < 1.0e-8, "x = {} y = {}", x, y);
        }
        let v1 = pca.get_explained_variance().unwrap();
        let v2 = pca_wide.get_explained_variance().unwrap();
        for (x, y) in v1.iter().zip(v2.iter()) {
            assert!((x - y).abs() < 1.0e-8);
        }
    }

    #[test]
    fn components_orthonormal() {
        let data = binary_data(10, 20, 77);
        let mut pca = Pca::new(3, Some(0));
        pca.fit(data.view(), None).unwrap();
        let c = pca.get_components().unwrap();
        let id = c.dot(&c.t());
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1. } else { 0. };
                assert!((id[[i, j]] - expected).abs() < 1.0e-8);
            }
        }
    }

    #[test]
    fn panel_sized_fit() {
        log_init_test();
        // reference panel sized data, both eigen problem paths
        for (nb_row, nb_col) in [(600, 220), (200, 500)] {
            let data = binary_data(nb_row, nb_col, 2504);
            let mut pca = Pca::new(3, None);
            let reduced = pca.fit_transform(data.view(), None).unwrap();
            assert_eq!(reduced.dim(), (nb_row, 3));
            let c = pca.get_components().unwrap();
            let id = c.dot(&c.t());
            for i in 0..3 {
                for j in 0..3 {
                    let expected = if i == j { 1. } else { 0. };
                    assert!((id[[i, j]] - expected).abs() < 1.0e-8);
                }
            }
            let variance = pca.get_explained_variance().unwrap();
            assert!(variance[0] >= variance[1] && variance[1] >= variance[2]);
        }
    }

    #[test]
    fn too_many_components() {
        let data = binary_data(4, 10, 5);
        let mut pca = Pca::new(5, None);
        assert!(pca.fit(data.view(), None).is_err());
        let pca = Pca::new(2, None);
        assert!(pca.transform(data.view()).is_err());
    }

    #[test]
    fn feature_mismatch() {
        let data = binary_data(10, 6, 5);
        let mut pca = Pca::new(2, None);
        pca.fit(data.view(), None).unwrap();
        let other = binary_data(3, 5, 6);
        assert!(pca.transform(other.view()).is_err());
    }
}
