//! persistence of fitted reducers.
//!
//! Models live in a flat directory, one file by identity key. The key is fully encoded in the file name :
//! - `{algorithm}.{aisnps_set}.bin` for pca and umap
//! - `{algorithm}.{aisnps_set}.{population_level}.bin` for nca
//!
//! so a lookup is a path computation, there is no index file.
//! Files are written to a temporary sibling then renamed, so concurrent writers of the same key
//! leave one complete model (the last rename wins), never a partially written one.

use anyhow::{anyhow, Context};

use serde::{Deserialize, Serialize};

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::reducers::{Algorithm, ReducerModel};

/// version of the model file envelope
pub const MODEL_FORMAT_VERSION: u32 = 1;

const MODEL_EXTENSION: &str = "bin";

// distinguishes temporary files of concurrent saves within one process
static SAVE_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// algorithm and aisnps set names are case insensitive
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
}

/// "Super Population", "super-population" and "superpopulation" all give "superpopulation"
pub fn normalize_population_level(level: &str) -> String {
    level.replace(['-', ' '], "").to_lowercase()
}

// a name is one dot separated field of a file name
fn check_name_field(what: &str, name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        return Err(anyhow!("{} name is empty", what));
    }
    if name.contains(['.', '/', '\\']) {
        return Err(anyhow!("{} name {:?} must not contain '.', '/' or '\\'", what, name));
    }
    Ok(())
}

/// identity of a persisted model
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    algorithm: Algorithm,
    aisnps_set: String,
    // only for algorithms fitted on labels
    population_level: Option<String>,
}

impl ModelKey {
    /// Names are normalized, population level is dropped for algorithms not using labels.
    /// Fails if a normalized name is empty or holds a '.' or a path separator, as two distinct keys
    /// could then share a file name or a file could land outside the models directory.
    pub fn new(algorithm: Algorithm, aisnps_set: &str, population_level: &str) -> anyhow::Result<Self> {
        let aisnps_set = normalize_name(aisnps_set);
        check_name_field("aisnps set", &aisnps_set)?;
        let population_level = if algorithm.uses_labels() {
            let level = normalize_population_level(population_level);
            check_name_field("population level", &level)?;
            Some(level)
        } else {
            None
        };
        Ok(ModelKey {
            algorithm,
            aisnps_set,
            population_level,
        })
    }

    pub fn get_algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn get_aisnps_set(&self) -> &str {
        &self.aisnps_set
    }

    pub fn get_population_level(&self) -> Option<&str> {
        self.population_level.as_deref()
    }

    pub fn file_name(&self) -> String {
        match &self.population_level {
            Some(level) => format!(
                "{}.{}.{}.{}",
                self.algorithm, self.aisnps_set, level, MODEL_EXTENSION
            ),
            None => format!("{}.{}.{}", self.algorithm, self.aisnps_set, MODEL_EXTENSION),
        }
    }
} // end of impl ModelKey

// what is written, the reducer is borrowed
#[derive(Serialize)]
struct ModelFileOut<'a> {
    version: u32,
    algorithm: Algorithm,
    reducer: &'a ReducerModel,
}

// what is read back, same layout as ModelFileOut
#[derive(Deserialize)]
struct ModelFileIn {
    version: u32,
    algorithm: Algorithm,
    reducer: ReducerModel,
}

/// directory of persisted reducers
#[derive(Debug, Clone)]
pub struct ModelStore {
    directory: PathBuf,
}

impl ModelStore {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        ModelStore {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn get_directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, key: &ModelKey) -> PathBuf {
        self.directory.join(key.file_name())
    }

    /// true if a model file exists for key
    pub fn contains(&self, key: &ModelKey) -> bool {
        self.path_for(key).is_file()
    }

    /// dumps reducer under key, replacing any previous model. Returns the model path.
    pub fn save(&self, key: &ModelKey, reducer: &ReducerModel) -> anyhow::Result<PathBuf> {
        if reducer.get_algorithm() != key.get_algorithm() {
            return Err(anyhow!(
                "cannot save a {} reducer under key {}",
                reducer.get_algorithm(),
                key.file_name()
            ));
        }
        fs::create_dir_all(&self.directory).with_context(|| {
            format!("could not create models directory {}", self.directory.display())
        })?;
        let path = self.path_for(key);
        let tmp_path = self.directory.join(format!(
            ".{}.{}.{}.tmp",
            key.file_name(),
            std::process::id(),
            SAVE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        //
        let res = write_model(&tmp_path, key.get_algorithm(), reducer)
            .and_then(|_| fs::rename(&tmp_path, &path).map_err(anyhow::Error::from));
        if let Err(e) = res {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.context(format!("could not write model {}", path.display())));
        }
        log::debug!("model dumped in {}", path.display());
        Ok(path)
    } // end of save

    /// reloads the reducer stored under key, Ok(None) if there is no such model
    pub fn load(&self, key: &ModelKey) -> anyhow::Result<Option<ReducerModel>> {
        let path = self.path_for(key);
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no model file {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(anyhow::Error::from(e).context(format!("could not open model {}", path.display())));
            }
        };
        let model: ModelFileIn = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("could not decode model {}", path.display()))?;
        if model.version != MODEL_FORMAT_VERSION {
            return Err(anyhow!(
                "model {} has format version {}, expected {}",
                path.display(),
                model.version,
                MODEL_FORMAT_VERSION
            ));
        }
        if model.algorithm != key.get_algorithm() || model.reducer.get_algorithm() != key.get_algorithm() {
            return Err(anyhow!(
                "model {} holds a {} reducer, expected {}",
                path.display(),
                model.reducer.get_algorithm(),
                key.get_algorithm()
            ));
        }
        Ok(Some(model.reducer))
    } // end of load
} // end of impl ModelStore

fn write_model(path: &Path, algorithm: Algorithm, reducer: &ReducerModel) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let envelope = ModelFileOut {
        version: MODEL_FORMAT_VERSION,
        algorithm,
        reducer,
    };
    bincode::serialize_into(&mut writer, &envelope)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::reducers::reducer::Reducer;
    use ndarray::array;

    fn log_init_test() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn file_names() {
        let key = ModelKey::new(Algorithm::Pca, "Kidd", "Super Population").unwrap();
        assert_eq!(key.file_name(), "pca.kidd.bin");
        assert!(key.get_population_level().is_none());
        let key = ModelKey::new(Algorithm::Umap, "SELDIN", "population").unwrap();
        assert_eq!(key.file_name(), "umap.seldin.bin");
        let key = ModelKey::new(Algorithm::Nca, "kidd", "Super-Population").unwrap();
        assert_eq!(key.file_name(), "nca.kidd.superpopulation.bin");
        assert_eq!(
            ModelKey::new(Algorithm::Nca, "KIDD", "super population").unwrap(),
            ModelKey::new(Algorithm::Nca, "kidd", "superpopulation").unwrap()
        );
        assert_ne!(
            ModelKey::new(Algorithm::Nca, "kidd", "population").unwrap(),
            ModelKey::new(Algorithm::Nca, "kidd", "superpopulation").unwrap()
        );
    }

    #[test]
    fn save_load_pca() {
        log_init_test();
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("models"));
        let key = ModelKey::new(Algorithm::Pca, "kidd", "superpopulation").unwrap();
        assert!(store.load(&key).unwrap().is_none());
        assert!(!store.contains(&key));
        //
        let data = array![[0., 1., 1.], [1., 0., 1.], [1., 1., 0.], [0., 0., 1.]];
        let mut model = ReducerModel::new(Algorithm::Pca, 2, None);
        let reduced = model.fit_transform(data.view(), None).unwrap();
        let path = store.save(&key, &model).unwrap();
        assert_eq!(path, dir.path().join("models").join("pca.kidd.bin"));
        assert!(store.contains(&key));
        // no temporary file left behind
        let nb_files = fs::read_dir(store.get_directory()).unwrap().count();
        assert_eq!(nb_files, 1);
        //
        let reloaded = store.load(&key).unwrap().unwrap();
        assert_eq!(reloaded.get_algorithm(), Algorithm::Pca);
        let again = reloaded.transform(data.view()).unwrap();
        for (x, y) in reduced.iter().zip(again.iter()) {
            assert!((x - y).abs() < 1.0e-12);
        }
    }

    #[test]
    fn algorithm_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let model = ReducerModel::new(Algorithm::Pca, 2, None);
        let key = ModelKey::new(Algorithm::Umap, "kidd", "superpopulation").unwrap();
        assert!(store.save(&key, &model).is_err());
        // a pca file renamed as umap is refused at load
        let pca_key = ModelKey::new(Algorithm::Pca, "kidd", "superpopulation").unwrap();
        let pca_path = store.save(&pca_key, &model).unwrap();
        fs::copy(&pca_path, store.path_for(&key)).unwrap();
        assert!(store.load(&key).is_err());
    }

    #[test]
    fn corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let key = ModelKey::new(Algorithm::Pca, "kidd", "superpopulation").unwrap();
        fs::write(store.path_for(&key), b"not a model").unwrap();
        assert!(store.load(&key).is_err());
    }

    #[test]
    fn names_cannot_collide_or_escape() {
        // "a.b" + "c" and "a" + "b.c" would both give nca.a.b.c.bin
        assert!(ModelKey::new(Algorithm::Nca, "a.b", "c").is_err());
        assert!(ModelKey::new(Algorithm::Nca, "a", "b.c").is_err());
        assert!(ModelKey::new(Algorithm::Pca, "../kidd", "superpopulation").is_err());
        assert!(ModelKey::new(Algorithm::Pca, "kidd/x", "superpopulation").is_err());
        assert!(ModelKey::new(Algorithm::Pca, "kidd\\x", "superpopulation").is_err());
        assert!(ModelKey::new(Algorithm::Pca, "", "superpopulation").is_err());
        assert!(ModelKey::new(Algorithm::Nca, "kidd", " - ").is_err());
        // population level is not part of pca or umap keys, it is not checked
        assert!(ModelKey::new(Algorithm::Umap, "kidd", "a.b").is_ok());
    }

    #[test]
    fn concurrent_saves_leave_one_model() {
        log_init_test();
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("models"));
        let key = ModelKey::new(Algorithm::Pca, "kidd", "superpopulation").unwrap();
        let nb_writers = 8;
        // each writer has its own model, fitted on shifted data
        let models: Vec<ReducerModel> = (0..nb_writers)
            .map(|w| {
                let shift = w as f64;
                let data = array![[0., 1., shift], [1., 0., 1.], [1., 1., 0.], [0., shift, 1.]];
                let mut model = ReducerModel::new(Algorithm::Pca, 2, None);
                model.fit(data.view(), None).unwrap();
                model
            })
            .collect();
        let dumps: Vec<Vec<u8>> = models.iter().map(|m| bincode::serialize(m).unwrap()).collect();
        std::thread::scope(|scope| {
            for model in models.iter() {
                let store = &store;
                let key = &key;
                scope.spawn(move || {
                    for _ in 0..5 {
                        store.save(key, model).unwrap();
                    }
                });
            }
        });
        // one file, no temporary left
        let names: Vec<String> = fs::read_dir(store.get_directory())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["pca.kidd.bin".to_string()]);
        // the survivor is one of the written models, complete
        let reloaded = store.load(&key).unwrap().unwrap();
        let dump = bincode::serialize(&reloaded).unwrap();
        assert!(dumps.contains(&dump));
    }
}
