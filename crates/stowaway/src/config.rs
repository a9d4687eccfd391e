use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Whether the coordinator participates in requests at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Read and write entries as usual.
    Normal,
    /// Pass every request straight to the network.
    Disabled,
}

/// Which request properties are folded into cache keys when the cache is
/// split by context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitCacheScheme {
    /// Key on the partition string alone.
    PartitionOnly,
    /// Additionally mark sub-frame document loads.
    TopFrameSite,
    /// Additionally mark sub-frame documents and cross-site main-frame
    /// navigations.
    NavigationInitiator,
}

/// Cache splitting configuration.
///
/// The flags mirror independent experiments, but the schemes they select are
/// mutually exclusive. When both refinements are requested the coordinator
/// falls back to the simplest scheme rather than guessing a combination.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SplitCacheConfig {
    /// Master switch. When off, partition data is ignored entirely.
    pub enabled: bool,
    /// Refine keys with the sub-frame document marker.
    pub by_top_frame_site: bool,
    /// Refine keys with sub-frame and cross-site navigation markers.
    pub by_navigation_initiator: bool,
    /// Key credentialed and credential-less loads separately.
    pub split_credentials: bool,
}

impl Default for SplitCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            by_top_frame_site: false,
            by_navigation_initiator: false,
            split_credentials: false,
        }
    }
}

impl SplitCacheConfig {
    /// The scheme these flags resolve to, or `None` when splitting is off.
    pub fn scheme(&self) -> Option<SplitCacheScheme> {
        if !self.enabled {
            return None;
        }
        let scheme = match (self.by_top_frame_site, self.by_navigation_initiator) {
            (false, false) => SplitCacheScheme::PartitionOnly,
            (true, false) => SplitCacheScheme::TopFrameSite,
            (false, true) => SplitCacheScheme::NavigationInitiator,
            (true, true) => {
                tracing::warn!(
                    "conflicting split-cache refinements configured, keying on partition only"
                );
                SplitCacheScheme::PartitionOnly
            }
        };
        Some(scheme)
    }
}

/// Static configuration of the coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Initial cache mode. Can be changed at runtime.
    pub mode: CacheMode,
    /// Cache splitting flags.
    pub split_cache: SplitCacheConfig,
    /// How long a transaction waits for exclusive access to an entry before
    /// giving up and going to the network.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// The much shorter wait applied to range requests queued behind an
    /// exclusive range writer. Media loads issue many disjoint ranges and
    /// must not serialize on one another.
    #[serde(with = "humantime_serde")]
    pub range_lock_timeout: Duration,
    /// How many keys the no-store memory remembers. Remembered keys skip
    /// entry creation on their next load.
    pub no_store_memory_capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: CacheMode::Normal,
            split_cache: SplitCacheConfig::default(),
            lock_timeout: Duration::from_secs(20),
            range_lock_timeout: Duration::from_millis(25),
            no_store_memory_capacity: 1000,
        }
    }
}

impl Config {
    /// Loads the config from a YAML file, or the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                Self::from_reader(fs::File::open(path).context("failed to open config file")?)
            }
            None => Ok(Config::default()),
        }
    }

    fn from_reader(reader: impl Read) -> Result<Self> {
        serde_yaml::from_reader(reader).context("failed to parse config YAML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mode, CacheMode::Normal);
        assert_eq!(config.lock_timeout, Duration::from_secs(20));
        assert_eq!(config.range_lock_timeout, Duration::from_millis(25));
        assert_eq!(config.split_cache.scheme(), None);
    }

    #[test]
    fn test_parse_timeouts() {
        let yaml = r#"
            mode: normal
            lock_timeout: 5s
            range_lock_timeout: 100ms
        "#;
        let config = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.range_lock_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_parse_split_cache() {
        let yaml = r#"
            split_cache:
              enabled: true
              by_navigation_initiator: true
        "#;
        let config = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            config.split_cache.scheme(),
            Some(SplitCacheScheme::NavigationInitiator)
        );
    }

    #[test]
    fn test_conflicting_split_schemes_fall_back() {
        let split = SplitCacheConfig {
            enabled: true,
            by_top_frame_site: true,
            by_navigation_initiator: true,
            split_credentials: false,
        };
        assert_eq!(split.scheme(), Some(SplitCacheScheme::PartitionOnly));
    }

    #[test]
    fn test_disabled_mode() {
        let config = Config::from_reader("mode: disabled".as_bytes()).unwrap();
        assert_eq!(config.mode, CacheMode::Disabled);
    }
}
