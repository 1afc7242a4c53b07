use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rest::SerializationFormat;

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid value {value:?} for key {key:?}")))
}

/// Consolidation policy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Maximum number of consolidation rounds per invocation.
    pub steps: u32,
    /// Minimum number of fragments merged per round.
    pub step_min_frags: u32,
    /// Maximum number of fragments merged per round.
    pub step_max_frags: u32,
    /// Minimum size ratio (smaller/larger) between adjacent fragments in a
    /// candidate set, in `[0.0, 1.0]`.
    pub step_size_ratio: f32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            steps: 10,
            step_min_frags: 2,
            step_max_frags: 8,
            step_size_ratio: 0.0,
        }
    }
}

impl ConsolidationConfig {
    /// Validate the policy parameters.
    pub fn check(&self) -> Result<()> {
        if self.step_min_frags < 2 || self.step_min_frags > self.step_max_frags {
            return Err(Error::InvalidArgument(
                "consolidation requires 2 <= step_min_frags <= step_max_frags".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.step_size_ratio) {
            return Err(Error::InvalidArgument(
                "consolidation step_size_ratio must be in [0.0, 1.0]".into(),
            ));
        }
        Ok(())
    }
}

/// REST client parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RestConfig {
    /// The server address; routing to the REST client is enabled when set.
    pub server_address: Option<String>,
    /// The wire encoding of queries.
    pub server_serialization_format: SerializationFormat,
}

/// The storage manager configuration.
///
/// Every parameter is also settable through [`Config::set`] with its dotted
/// key name, e.g. `sm.tile_cache_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Tile cache capacity in bytes (`sm.tile_cache_size`).
    pub tile_cache_size: u64,
    /// Reader thread pool size (`sm.num_reader_threads`).
    pub num_reader_threads: usize,
    /// Writer thread pool size (`sm.num_writer_threads`).
    pub num_writer_threads: usize,
    /// Async query pool size (`sm.num_async_threads`).
    pub num_async_threads: usize,
    /// Bound in milliseconds on waiting for readers to drain during an
    /// exclusive lock (`sm.xlock_timeout_ms`).
    pub xlock_timeout_ms: u64,
    /// Consolidation policy (`sm.consolidation.*`).
    pub consolidation: ConsolidationConfig,
    /// REST client parameters (`rest.*`).
    pub rest: RestConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tile_cache_size: 10_000_000,
            num_reader_threads: 1,
            num_writer_threads: 1,
            num_async_threads: 1,
            xlock_timeout_ms: 60_000,
            consolidation: ConsolidationConfig::default(),
            rest: RestConfig::default(),
        }
    }
}

impl Config {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter by its dotted key name.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for unknown keys and unparsable
    /// values.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "sm.tile_cache_size" => self.tile_cache_size = parse(key, value)?,
            "sm.num_reader_threads" => self.num_reader_threads = parse(key, value)?,
            "sm.num_writer_threads" => self.num_writer_threads = parse(key, value)?,
            "sm.num_async_threads" => self.num_async_threads = parse(key, value)?,
            "sm.xlock_timeout_ms" => self.xlock_timeout_ms = parse(key, value)?,
            "sm.consolidation.steps" => self.consolidation.steps = parse(key, value)?,
            "sm.consolidation.step_min_frags" => {
                self.consolidation.step_min_frags = parse(key, value)?;
            }
            "sm.consolidation.step_max_frags" => {
                self.consolidation.step_max_frags = parse(key, value)?;
            }
            "sm.consolidation.step_size_ratio" => {
                self.consolidation.step_size_ratio = parse(key, value)?;
            }
            "rest.server_address" => self.rest.server_address = Some(value.to_string()),
            "rest.server_serialization_format" => {
                self.rest.server_serialization_format = parse(key, value)?;
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unknown configuration key {key:?}"
                )));
            }
        }
        Ok(())
    }

    /// Get a parameter by its dotted key name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "sm.tile_cache_size" => Some(self.tile_cache_size.to_string()),
            "sm.num_reader_threads" => Some(self.num_reader_threads.to_string()),
            "sm.num_writer_threads" => Some(self.num_writer_threads.to_string()),
            "sm.num_async_threads" => Some(self.num_async_threads.to_string()),
            "sm.xlock_timeout_ms" => Some(self.xlock_timeout_ms.to_string()),
            "sm.consolidation.steps" => Some(self.consolidation.steps.to_string()),
            "sm.consolidation.step_min_frags" => {
                Some(self.consolidation.step_min_frags.to_string())
            }
            "sm.consolidation.step_max_frags" => {
                Some(self.consolidation.step_max_frags.to_string())
            }
            "sm.consolidation.step_size_ratio" => {
                Some(self.consolidation.step_size_ratio.to_string())
            }
            "rest.server_address" => self.rest.server_address.clone(),
            "rest.server_serialization_format" => {
                Some(self.rest.server_serialization_format.to_string())
            }
            _ => None,
        }
    }
}
