//! Lifecycle of dimension reduction models for ancestry informative snps.
//!
//! One-hot encoded aisnps of samples are reduced (pca, umap or nca) to a few coordinates.
//! A [ReductionModelManager](manager::ReductionModelManager) fits and dumps a reducer for a given
//! (algorithm, aisnps set, population level) or reloads the dumped reducer to place new samples.

use lazy_static::lazy_static;

lazy_static! {
    static ref LOG: u64 = init_log();
}

// install a logger facility
fn init_log() -> u64 {
    let _res = env_logger::try_init();
    log::debug!("logger initialized");
    1
}

pub mod config;
pub mod features;
pub mod manager;
pub mod output;
pub mod reducers;
pub mod store;

pub use config::DimredConfig;
pub use features::FeatureMatrix;
pub use manager::{ReductionModelManager, ReductionOutcome, ReductionRequest};
pub use output::ReducedOutput;
pub use reducers::{Algorithm, ReducerModel};
