//! Cache configuration
//!
//! Settings can be loaded from a TOML file, overridden from environment
//! variables, or built programmatically.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const MB: usize = 1024 * 1024;

/// Configuration of the cell cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of background fetcher threads
    pub num_fetcher_threads: usize,
    /// Bound of the queue's prefetch lane
    pub prefetch_capacity: usize,
    /// Byte budget of retained valid cells, in megabytes
    pub soft_retention_mb: usize,
    /// Maximum map slots removed per reap sweep
    pub reap_batch: usize,
    /// How long budgeted inline loads pause the fetchers, in milliseconds
    pub budgeted_pause_ms: u64,
    /// How long a fetcher waits for work before re-checking for shutdown
    pub fetcher_poll_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_fetcher_threads: default_fetcher_threads(),
            prefetch_capacity: 16384,
            soft_retention_mb: 1024,
            reap_batch: 500,
            budgeted_pause_ms: 5,
            fetcher_poll_ms: 100,
        }
    }
}

/// One fewer than the available cores, at least one
fn default_fetcher_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

impl CacheConfig {
    /// Sets the number of fetcher threads.
    pub fn with_fetcher_threads(mut self, threads: usize) -> Self {
        self.num_fetcher_threads = threads;
        self
    }

    /// Sets the prefetch lane capacity.
    pub fn with_prefetch_capacity(mut self, capacity: usize) -> Self {
        self.prefetch_capacity = capacity;
        self
    }

    /// Sets the soft retention budget in megabytes.
    pub fn with_soft_retention_mb(mut self, mb: usize) -> Self {
        self.soft_retention_mb = mb;
        self
    }

    /// Sets the reap batch size.
    pub fn with_reap_batch(mut self, batch: usize) -> Self {
        self.reap_batch = batch;
        self
    }

    /// Sets the fetcher pause for budgeted loads in milliseconds.
    pub fn with_budgeted_pause_ms(mut self, ms: u64) -> Self {
        self.budgeted_pause_ms = ms;
        self
    }

    /// Sets the fetcher poll interval in milliseconds.
    pub fn with_fetcher_poll_ms(mut self, ms: u64) -> Self {
        self.fetcher_poll_ms = ms;
        self
    }

    /// Soft retention budget in bytes.
    pub fn soft_retention_bytes(&self) -> usize {
        self.soft_retention_mb.saturating_mul(MB)
    }

    /// Fetcher pause for budgeted loads.
    pub fn budgeted_pause(&self) -> Duration {
        Duration::from_millis(self.budgeted_pause_ms)
    }

    /// Fetcher poll interval.
    pub fn fetcher_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fetcher_poll_ms)
    }

    /// Returns the default configuration file location.
    ///
    /// - Linux: ~/.config/cellstream/cache.toml
    /// - macOS: ~/Library/Application Support/cellstream/cache.toml
    /// - Windows: %APPDATA%\cellstream\cache.toml
    pub fn default_config_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("cellstream").join("cache.toml"),
            None => PathBuf::from("cellstream.toml"),
        }
    }

    /// Loads configuration from environment variables over the defaults.
    ///
    /// # Errors
    /// Returns an error if any variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    ///
    /// Environment variables:
    /// - `CELLSTREAM_FETCHER_THREADS`
    /// - `CELLSTREAM_PREFETCH_CAPACITY`
    /// - `CELLSTREAM_SOFT_RETENTION_MB`
    /// - `CELLSTREAM_REAP_BATCH`
    /// - `CELLSTREAM_BUDGETED_PAUSE_MS`
    /// - `CELLSTREAM_FETCHER_POLL_MS`
    ///
    /// # Errors
    /// Returns an error if any variable holds an invalid value.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        env_override("CELLSTREAM_FETCHER_THREADS", &mut self.num_fetcher_threads)?;
        env_override("CELLSTREAM_PREFETCH_CAPACITY", &mut self.prefetch_capacity)?;
        env_override("CELLSTREAM_SOFT_RETENTION_MB", &mut self.soft_retention_mb)?;
        env_override("CELLSTREAM_REAP_BATCH", &mut self.reap_batch)?;
        env_override("CELLSTREAM_BUDGETED_PAUSE_MS", &mut self.budgeted_pause_ms)?;
        env_override("CELLSTREAM_FETCHER_POLL_MS", &mut self.fetcher_poll_ms)?;
        self.validate()?;
        Ok(self)
    }

    /// Loads configuration from a TOML file. Missing keys take defaults.
    ///
    /// ```toml
    /// num_fetcher_threads = 4
    /// prefetch_capacity = 16384
    /// soft_retention_mb = 1024
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects settings the cache cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_fetcher_threads == 0 {
            return Err(ConfigError::InvalidValue("num_fetcher_threads".to_string()));
        }
        if self.reap_batch == 0 {
            return Err(ConfigError::InvalidValue("reap_batch".to_string()));
        }
        if self.fetcher_poll_ms == 0 {
            return Err(ConfigError::InvalidValue("fetcher_poll_ms".to_string()));
        }
        Ok(())
    }
}

fn env_override<V: std::str::FromStr>(name: &str, target: &mut V) -> Result<(), ConfigError> {
    if let Ok(val) = std::env::var(name) {
        *target = val
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string()))?;
    }
    Ok(())
}

impl std::fmt::Display for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cache Configuration:")?;
        writeln!(f, "  Fetcher threads:   {}", self.num_fetcher_threads)?;
        writeln!(f, "  Prefetch capacity: {}", self.prefetch_capacity)?;
        writeln!(f, "  Soft retention:    {} MB", self.soft_retention_mb)?;
        writeln!(f, "  Reap batch:        {}", self.reap_batch)?;
        writeln!(f, "  Budgeted pause:    {} ms", self.budgeted_pause_ms)?;
        write!(f, "  Fetcher poll:      {} ms", self.fetcher_poll_ms)
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration key
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading or writing a configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed TOML
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_VARS: [&str; 6] = [
        "CELLSTREAM_FETCHER_THREADS",
        "CELLSTREAM_PREFETCH_CAPACITY",
        "CELLSTREAM_SOFT_RETENTION_MB",
        "CELLSTREAM_REAP_BATCH",
        "CELLSTREAM_BUDGETED_PAUSE_MS",
        "CELLSTREAM_FETCHER_POLL_MS",
    ];

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.num_fetcher_threads >= 1);
        assert_eq!(config.prefetch_capacity, 16384);
        assert_eq!(config.soft_retention_mb, 1024);
        assert_eq!(config.reap_batch, 500);
        assert_eq!(config.budgeted_pause(), Duration::from_millis(5));
        assert_eq!(config.fetcher_poll_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_fetcher_threads_leaves_a_core() {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let threads = CacheConfig::default().num_fetcher_threads;
        assert_eq!(threads, cores.saturating_sub(1).max(1));
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_fetcher_threads(3)
            .with_prefetch_capacity(64)
            .with_soft_retention_mb(8)
            .with_reap_batch(10)
            .with_budgeted_pause_ms(2)
            .with_fetcher_poll_ms(20);

        assert_eq!(config.num_fetcher_threads, 3);
        assert_eq!(config.prefetch_capacity, 64);
        assert_eq!(config.soft_retention_bytes(), 8 * MB);
        assert_eq!(config.reap_batch, 10);
        assert_eq!(config.budgeted_pause_ms, 2);
        assert_eq!(config.fetcher_poll_ms, 20);
    }

    #[test]
    fn test_validate() {
        let config = CacheConfig::default().with_fetcher_threads(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(key)) if key == "num_fetcher_threads"
        ));
        assert!(CacheConfig::default().with_reap_batch(0).validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ENV_VARS);

        env::set_var("CELLSTREAM_FETCHER_THREADS", "6");
        env::set_var("CELLSTREAM_PREFETCH_CAPACITY", "100");
        env::set_var("CELLSTREAM_SOFT_RETENTION_MB", "64");
        env::set_var("CELLSTREAM_REAP_BATCH", "50");
        env::set_var("CELLSTREAM_BUDGETED_PAUSE_MS", "1");
        env::set_var("CELLSTREAM_FETCHER_POLL_MS", "10");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.num_fetcher_threads, 6);
        assert_eq!(config.prefetch_capacity, 100);
        assert_eq!(config.soft_retention_mb, 64);
        assert_eq!(config.reap_batch, 50);
        assert_eq!(config.budgeted_pause_ms, 1);
        assert_eq!(config.fetcher_poll_ms, 10);
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&ENV_VARS);
        for name in ENV_VARS {
            env::remove_var(name);
        }
        env::set_var("CELLSTREAM_SOFT_RETENTION_MB", " 32 ");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.soft_retention_mb, 32);
        assert_eq!(config.prefetch_capacity, 16384);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ENV_VARS);
        env::set_var("CELLSTREAM_REAP_BATCH", "lots");

        let err = CacheConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(key) if key == "CELLSTREAM_REAP_BATCH"));
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CacheConfig::from_toml("soft_retention_mb = 128\nreap_batch = 7\n").unwrap();
        assert_eq!(config.soft_retention_mb, 128);
        assert_eq!(config.reap_batch, 7);
        assert_eq!(config.prefetch_capacity, 16384);
    }

    #[test]
    fn test_from_toml_errors() {
        assert!(matches!(
            CacheConfig::from_toml("prefetch_capacity = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            CacheConfig::from_toml("fetcher_poll_ms = 0"),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.toml");

        let config = CacheConfig::default()
            .with_fetcher_threads(2)
            .with_soft_retention_mb(256);
        config.save_to_file(&path).unwrap();

        let loaded = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = CacheConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_display() {
        let text = CacheConfig::default().with_soft_retention_mb(12).to_string();
        assert!(text.contains("Soft retention:    12 MB"));
    }
}
