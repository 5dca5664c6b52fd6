use strata_level::{LevelConfig, StoreConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to write config: {0}")]
    Write(#[from] ron::Error),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub level: LevelConfig,
}

impl Config {
    pub fn read_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let reader = std::fs::File::open(path)?;

        Ok(ron::de::from_reader(reader)?)
    }

    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    pub fn to_ron(&self) -> Result<String, ConfigError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = Config::from_ron("(level: (tile_shift: 5, cache: (worker_threads: 8)))").unwrap();
        assert_eq!(config.level.tile_shift, 5);
        assert_eq!(config.level.cache.worker_threads, 8);
        assert_eq!(config.level.min_height, LevelConfig::default().min_height);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn written_config_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.ron");
        let mut config = Config::default();
        config.store.temporary = true;
        config.level.horizontal_radius = 1024;
        std::fs::write(&path, config.to_ron().unwrap()).unwrap();

        assert_eq!(Config::read_file(&path).unwrap(), config);
        assert!(matches!(
            Config::read_file(dir.path().join("missing.ron")),
            Err(ConfigError::Io(_))
        ));
    }
}
