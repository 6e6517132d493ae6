//! distances used to build neighbourhood graphs.
//!
//! One-hot encoded snps are binary vectors, for which the dice dissimilarity is the natural choice.

use num_traits::float::Float;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    Euclidean,
    /// dice dissimilarity, a coordinate is *true* if it is non zero
    Dice,
}

impl Metric {
    pub fn distance<T: Float>(&self, a: ArrayView1<T>, b: ArrayView1<T>) -> T {
        match self {
            Metric::Euclidean => euclidean(a, b),
            Metric::Dice => dice(a, b),
        }
    }
}

pub fn euclidean<T: Float>(a: ArrayView1<T>, b: ArrayView1<T>) -> T {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .fold(T::zero(), |acc, (x, y)| acc + (*x - *y) * (*x - *y))
        .sqrt()
}

#[cfg_attr(doc, katexit::katexit)]
/// dice dissimilarity : $$ \frac{c_{TF} + c_{FT}}{2 c_{TT} + c_{TF} + c_{FT}} $$
/// Two vectors with no difference are at distance 0, even when both are null.
pub fn dice<T: Float>(a: ArrayView1<T>, b: ArrayView1<T>) -> T {
    assert_eq!(a.len(), b.len());
    let (nb_tt, nb_neq) = a
        .iter()
        .zip(b.iter())
        .fold((0usize, 0usize), |acc, (x, y)| {
            let (x_true, y_true) = (!x.is_zero(), !y.is_zero());
            match (x_true, y_true) {
                (true, true) => (acc.0 + 1, acc.1),
                (true, false) | (false, true) => (acc.0, acc.1 + 1),
                _ => acc,
            }
        });
    if nb_neq == 0 {
        return T::zero();
    }
    T::from(nb_neq).unwrap() / T::from(2 * nb_tt + nb_neq).unwrap()
}
