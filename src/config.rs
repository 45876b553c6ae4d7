/*!
 * Configuration of the defaults that operations fall back on.
 *
 * A [`Config`] is plain data that can be written by hand, loaded from TOML, or taken from
 * the environment. Nothing in this crate reads global state, so a configuration only takes
 * effect where it is passed in, for example to
 * [`stack_with`](crate::TensorDict::stack_with) or
 * [`ApplyOptions::from_config`](crate::tensordict::ApplyOptions::from_config).
 *
 * ```
 * use easy_tensordict::config::Config;
 * use easy_tensordict::tensordict::ShapeMode;
 * let config = Config::from_toml_str(r#"
 *     shape_mode = "lazy"
 *
 *     [map]
 *     num_workers = 4
 * "#).unwrap();
 * assert_eq!(config.shape_mode, ShapeMode::Lazy);
 * assert_eq!(config.map.num_workers, Some(4));
 * assert!(config.lazy_stack_fallback);
 * ```
 */

use crate::errors::{Result, TensorDictError};
use crate::tensordict::ShapeMode;

use serde::{Deserialize, Serialize};

use std::path::Path;

/**
 * Set to 1 or true to make shape operations lazy by default.
 */
pub const LAZY_LEGACY_VAR: &str = "TENSORDICT_LAZY_LEGACY";

/**
 * The number of workers [`map`](crate::TensorDict::map) uses by default.
 */
pub const MAP_WORKERS_VAR: &str = "TENSORDICT_MAP_WORKERS";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /**
     * Whether shape operations run through
     * [`shaped`](crate::TensorDict::shaped) with this config build new tensordicts or views.
     */
    pub shape_mode: ShapeMode,
    /**
     * Whether stacking incompatible tensordicts may return a lazy stack instead of an
     * error.
     */
    pub lazy_stack_fallback: bool,
    /**
     * The default for [`ApplyOptions::filter_empty`](crate::tensordict::ApplyOptions::filter_empty).
     */
    pub filter_empty: bool,
    pub map: MapConfig,
    pub memmap: MemmapConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            shape_mode: ShapeMode::Eager,
            lazy_stack_fallback: true,
            filter_empty: false,
            map: MapConfig::default(),
            memmap: MemmapConfig::default(),
        }
    }
}

/**
 * Defaults for [`MapOptions`](crate::map::MapOptions).
 */
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /**
     * The number of worker threads, the size of the global pool if None.
     */
    pub num_workers: Option<usize>,
    /**
     * The batch length of each chunk sent to a worker.
     */
    pub chunksize: Option<usize>,
}

/**
 * Defaults for [`MemmapOptions`](crate::persistence::MemmapOptions).
 */
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemmapConfig {
    /**
     * The number of threads writing tensors to disk, 0 writing on the calling thread.
     */
    pub num_threads: usize,
    /**
     * Return before the writes finish, handing back a future to wait on.
     */
    pub return_early: bool,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Config> {
        toml::from_str(text).map_err(|error| TensorDictError::Config(error.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Config::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|error| TensorDictError::Config(error.to_string()))
    }

    /**
     * The default configuration with any overrides from the environment applied, see
     * [`LAZY_LEGACY_VAR`] and [`MAP_WORKERS_VAR`].
     */
    pub fn from_env() -> Result<Config> {
        Config::default().with_env()
    }

    /**
     * Applies any overrides from the environment to this configuration.
     */
    pub fn with_env(self) -> Result<Config> {
        self.with_vars(|name| std::env::var(name).ok())
    }

    fn with_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        if let Some(value) = lookup(LAZY_LEGACY_VAR) {
            self.shape_mode = match value.trim().to_lowercase().as_str() {
                "1" | "true" => ShapeMode::Lazy,
                "0" | "false" | "" => ShapeMode::Eager,
                other => {
                    return Err(TensorDictError::Config(format!(
                        "{} must be 0 or 1, got {:?}",
                        LAZY_LEGACY_VAR, other
                    )));
                }
            };
        }
        if let Some(value) = lookup(MAP_WORKERS_VAR) {
            let workers = value.trim().parse::<usize>().map_err(|_| {
                TensorDictError::Config(format!(
                    "{} must be a number of workers, got {:?}",
                    MAP_WORKERS_VAR, value
                ))
            })?;
            self.map.num_workers = Some(workers);
        }
        Ok(self)
    }
}

#[test]
fn environment_overrides() {
    let config = Config::default()
        .with_vars(|name| match name {
            LAZY_LEGACY_VAR => Some("1".to_string()),
            MAP_WORKERS_VAR => Some(" 3 ".to_string()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.shape_mode, ShapeMode::Lazy);
    assert_eq!(config.map.num_workers, Some(3));
    let error = Config::default().with_vars(|name| match name {
        MAP_WORKERS_VAR => Some("many".to_string()),
        _ => None,
    });
    assert!(matches!(error, Err(TensorDictError::Config(_))));
    assert_eq!(Config::default().with_vars(|_| None).unwrap(), Config::default());
}

#[test]
fn toml_round_trip_keeps_defaults_for_missing_fields() {
    let config = Config::from_toml_str("lazy_stack_fallback = false").unwrap();
    assert!(!config.lazy_stack_fallback);
    assert_eq!(config.memmap, MemmapConfig::default());
    let text = config.to_toml_string().unwrap();
    assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    assert!(Config::from_toml_str("shape_mode = \"sideways\"").is_err());
}
