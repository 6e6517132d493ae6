//! configuration of the model lifecycle.
//!
//! The default storage location of reducer models is an explicit value given to the
//! [ReductionModelManager](crate::manager::ReductionModelManager), not a process global.

use std::path::{Path, PathBuf};

/// environment variable overriding the default models directory
pub const MODELS_DIR_ENV: &str = "DIMRED_MODELS_DIR";

/// models directory used when nothing else is configured
pub const DEFAULT_MODELS_DIR: &str = "data/models";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimredConfig {
    // directory where fitted reducers are dumped and looked up
    models_directory: PathBuf,
}

impl DimredConfig {
    pub fn new<P: AsRef<Path>>(models_directory: P) -> Self {
        DimredConfig {
            models_directory: models_directory.as_ref().to_path_buf(),
        }
    }

    /// build configuration from environment, falling back to [DEFAULT_MODELS_DIR]
    pub fn from_env() -> Self {
        match std::env::var_os(MODELS_DIR_ENV) {
            Some(dir) if !dir.is_empty() => {
                log::debug!("models directory from {} : {:?}", MODELS_DIR_ENV, dir);
                DimredConfig::new(PathBuf::from(dir))
            }
            _ => DimredConfig::default(),
        }
    }

    /// default storage directory of persisted reducers
    pub fn get_models_directory(&self) -> &Path {
        &self.models_directory
    }
} // end of impl DimredConfig

impl Default for DimredConfig {
    fn default() -> Self {
        DimredConfig::new(DEFAULT_MODELS_DIR)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn default_dir() {
        let config = DimredConfig::default();
        assert_eq!(config.get_models_directory(), Path::new(DEFAULT_MODELS_DIR));
        let config = DimredConfig::new("/tmp/models");
        assert_eq!(config.get_models_directory(), Path::new("/tmp/models"));
    }

    // the only test touching MODELS_DIR_ENV, so it cannot race with another test
    #[test]
    fn models_dir_from_env() {
        unsafe { std::env::set_var(MODELS_DIR_ENV, "/var/lib/dimred") };
        assert_eq!(
            DimredConfig::from_env().get_models_directory(),
            Path::new("/var/lib/dimred")
        );
        // empty value is ignored
        unsafe { std::env::set_var(MODELS_DIR_ENV, "") };
        assert_eq!(DimredConfig::from_env(), DimredConfig::default());
        //
        unsafe { std::env::remove_var(MODELS_DIR_ENV) };
        assert_eq!(
            DimredConfig::from_env().get_models_directory(),
            Path::new(DEFAULT_MODELS_DIR)
        );
    }
}
