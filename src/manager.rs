//! lifecycle of reduction models.
//!
//! Given a feature matrix and a [ReductionRequest] the manager either fits a reducer and dumps it
//! (overwrite_model = true) or reloads a dumped reducer and applies it (overwrite_model = false).
//! Each call is independent, nothing is cached between calls.
//!
//! Expected outcomes (no model on disk, unsupported algorithm, nca without labels) are variants of
//! [ReductionOutcome]. Errors returned are numeric or io failures.

use cpu_time::ProcessTime;

use std::path::{Path, PathBuf};

use crate::config::DimredConfig;
use crate::features::FeatureMatrix;
use crate::output::ReducedOutput;
use crate::reducers::reducer::Reducer;
use crate::reducers::{Algorithm, ReducerModel};
use crate::store::{normalize_name, ModelKey, ModelStore};

/// default dimension of reduced space
pub const DEFAULT_N_COMPONENTS: usize = 3;

/// default label granularity
pub const DEFAULT_POPULATION_LEVEL: &str = "superpopulation";

/// description of one reduction
#[derive(Debug, Clone)]
pub struct ReductionRequest {
    algorithm: String,
    aisnps_set: String,
    n_components: usize,
    overwrite_model: bool,
    labels: Option<Vec<String>>,
    population_level: String,
    models_directory: Option<PathBuf>,
    random_state: Option<u64>,
}

impl ReductionRequest {
    /// request with defaults : 3 components, load existing model, superpopulation level
    pub fn new(algorithm: &str, aisnps_set: &str) -> Self {
        ReductionRequest {
            algorithm: algorithm.to_string(),
            aisnps_set: aisnps_set.to_string(),
            n_components: DEFAULT_N_COMPONENTS,
            overwrite_model: false,
            labels: None,
            population_level: DEFAULT_POPULATION_LEVEL.to_string(),
            models_directory: None,
            random_state: None,
        }
    }

    pub fn with_n_components(mut self, n_components: usize) -> Self {
        self.n_components = n_components;
        self
    }

    /// if true a new model is fitted and replaces the stored one
    pub fn with_overwrite_model(mut self, overwrite_model: bool) -> Self {
        self.overwrite_model = overwrite_model;
        self
    }

    /// labels of samples, one by row, needed to fit nca
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_population_level(mut self, population_level: &str) -> Self {
        self.population_level = population_level.to_string();
        self
    }

    /// overrides the configured models directory for this request
    pub fn with_models_directory<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.models_directory = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_random_state(mut self, random_state: u64) -> Self {
        self.random_state = Some(random_state);
        self
    }

    pub fn get_algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn get_aisnps_set(&self) -> &str {
        &self.aisnps_set
    }

    pub fn get_n_components(&self) -> usize {
        self.n_components
    }

    pub fn get_overwrite_model(&self) -> bool {
        self.overwrite_model
    }

    pub fn get_labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    pub fn get_population_level(&self) -> &str {
        &self.population_level
    }

    pub fn get_random_state(&self) -> Option<u64> {
        self.random_state
    }
} // end of impl ReductionRequest

impl Default for ReductionRequest {
    fn default() -> Self {
        ReductionRequest::new("pca", "kidd")
    }
}

/// result of a reduction
#[derive(Debug, Clone)]
pub enum ReductionOutcome {
    Reduced(ReducedOutput),
    /// unsupported algorithm, or no stored model to apply
    NotFound,
    /// nca fit requested without labels, nothing was written
    MissingLabels,
}

impl ReductionOutcome {
    pub fn reduced(self) -> Option<ReducedOutput> {
        match self {
            ReductionOutcome::Reduced(out) => Some(out),
            _ => None,
        }
    }

    pub fn is_reduced(&self) -> bool {
        matches!(self, ReductionOutcome::Reduced(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReductionOutcome::NotFound)
    }

    pub fn is_missing_labels(&self) -> bool {
        matches!(self, ReductionOutcome::MissingLabels)
    }
}

pub struct ReductionModelManager {
    config: DimredConfig,
}

impl ReductionModelManager {
    pub fn new(config: DimredConfig) -> Self {
        lazy_static::initialize(&crate::LOG);
        ReductionModelManager { config }
    }

    pub fn get_config(&self) -> &DimredConfig {
        &self.config
    }

    /// store used by request : its own directory if any, else the configured one
    pub fn store_for(&self, request: &ReductionRequest) -> ModelStore {
        match request.models_directory.as_ref() {
            Some(dir) => ModelStore::new(dir),
            None => ModelStore::new(self.config.get_models_directory()),
        }
    }

    /// path of the model file a request refers to, None if algorithm is not supported.
    /// Fails if the aisnps set or population level cannot be part of a model file name.
    pub fn model_path(&self, request: &ReductionRequest) -> anyhow::Result<Option<PathBuf>> {
        let Some(algorithm) = Algorithm::from_name(&request.algorithm) else {
            return Ok(None);
        };
        let key = ModelKey::new(algorithm, &request.aisnps_set, &request.population_level)?;
        Ok(Some(self.store_for(request).path_for(&key)))
    }

    /// Reduce dimension of features, fitting and dumping a new model or applying a stored one
    /// depending on request.overwrite_model.
    pub fn reduce(&self, features: &FeatureMatrix, request: &ReductionRequest) -> anyhow::Result<ReductionOutcome> {
        let algorithm_name = normalize_name(&request.algorithm);
        let data = features.numeric_features();
        let store = self.store_for(request);
        //
        let reduced = if request.overwrite_model {
            let Some(algorithm) = Algorithm::from_name(&algorithm_name) else {
                log::debug!("no reducer to fit for algorithm {}", algorithm_name);
                return Ok(ReductionOutcome::NotFound);
            };
            let labels = match (algorithm.uses_labels(), request.get_labels()) {
                (true, None) => {
                    log::warn!("{} needs labels to fit a model", algorithm);
                    return Ok(ReductionOutcome::MissingLabels);
                }
                (true, Some(labels)) => Some(labels),
                (false, _) => None,
            };
            let key = ModelKey::new(algorithm, &request.aisnps_set, &request.population_level)?;
            let mut reducer = ReducerModel::new(algorithm, request.n_components, request.random_state);
            let cpu_start = ProcessTime::now();
            let reduced = reducer.fit_transform(data.view(), labels)?;
            log::debug!(
                "{} fit on {:?} data, cpu time(s) {:.2e}",
                algorithm,
                data.dim(),
                cpu_start.elapsed().as_secs_f64()
            );
            store.save(&key, &reducer)?;
            log::info!(
                "Successfully wrote a dimensionality reduction model to {}",
                store.get_directory().display()
            );
            reduced
        } else {
            let Some(algorithm) = Algorithm::from_name(&algorithm_name) else {
                log::warn!(
                    "Could not find a matching dimensionality reduction model on disk for algorithm {}",
                    algorithm_name
                );
                return Ok(ReductionOutcome::NotFound);
            };
            let key = ModelKey::new(algorithm, &request.aisnps_set, &request.population_level)?;
            let Some(reducer) = store.load(&key)? else {
                return Ok(ReductionOutcome::NotFound);
            };
            let reduced = reducer.transform(data.view())?;
            log::info!(
                "Successfully loaded a dimensionality reduction model from {}",
                store.path_for(&key).display()
            );
            reduced
        };
        //
        let output = ReducedOutput::new(features.get_index().to_vec(), reduced)?;
        Ok(ReductionOutcome::Reduced(output))
    } // end of reduce
} // end of impl ReductionModelManager
