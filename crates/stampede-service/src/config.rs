use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::collapser::{AsyncCollapserOptions, CollapserOptions};
use crate::locking::{
    AsyncInstanceLockProvider, AsyncLockProvider, DEFAULT_STRIPES, DistributedLockProvider,
    FilesystemLockStore, InstanceLockProvider, LockProvider, LockStore, MemoryLockStore,
    StripedLockProvider,
};

/// An invalid collapser setup, always reported when constructing a component.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no key strategy configured")]
    MissingKeyStrategy,
    #[error("no lock provider configured")]
    MissingLockProvider,
    #[error("no event listener configured")]
    MissingListener,
    #[error("a striped lock needs at least one stripe")]
    InvalidStripes,
    #[error("invalid distributed lock: {0}")]
    InvalidDistributedLock(String),
    #[error("failed to set up the lock store")]
    Store(#[from] anyhow::Error),
}

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "stampede".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

impl Metrics {
    /// All tags sent with every metric, including the hostname tag if configured.
    pub fn tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.custom_tags.clone();
        if let Some(tag) = &self.hostname_tag {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag.clone(), hostname);
            }
        }
        tags
    }
}

/// Where distributed lock records are kept.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LockStoreConfig {
    /// In process memory, only shared by collapsers using the same provider.
    #[default]
    Memory,
    /// A directory shared by all participating processes.
    Filesystem { path: PathBuf },
}

impl LockStoreConfig {
    /// Opens the configured store.
    pub fn store(&self) -> Result<Arc<dyn LockStore>, ConfigError> {
        let store: Arc<dyn LockStore> = match self {
            LockStoreConfig::Memory => Arc::new(MemoryLockStore::new()),
            LockStoreConfig::Filesystem { path } => {
                Arc::new(FilesystemLockStore::new(path.clone())?)
            }
        };
        Ok(store)
    }
}

/// Settings of a [`DistributedLockProvider`].
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DistributedLockConfig {
    /// How long to keep trying to acquire a lock before giving up.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// How long to wait between two attempts.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// How long a lock stays valid if its holder never releases it.
    ///
    /// Defaults to the `timeout`.
    #[serde(with = "humantime_serde")]
    pub lease: Option<Duration>,
    /// The store holding the lock records.
    pub backend: LockStoreConfig,
}

impl Default for DistributedLockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(50),
            lease: None,
            backend: LockStoreConfig::Memory,
        }
    }
}

impl DistributedLockConfig {
    fn provider(&self) -> Result<DistributedLockProvider, ConfigError> {
        let provider =
            DistributedLockProvider::new(self.backend.store()?, self.timeout, self.retry_interval)?;
        match self.lease {
            Some(lease) => provider.with_lease(lease),
            None => Ok(provider),
        }
    }
}

fn default_stripes() -> usize {
    DEFAULT_STRIPES
}

/// Selects the lock provider guarding the registry of in-flight executions.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LockConfig {
    /// A single lock for all keys.
    Instance,
    /// A fixed number of spin locks selected by hashing the key.
    Striped {
        #[serde(default = "default_stripes")]
        stripes: usize,
    },
    /// A lock shared between processes.
    Distributed(DistributedLockConfig),
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig::Striped {
            stripes: DEFAULT_STRIPES,
        }
    }
}

impl LockConfig {
    /// Builds the configured provider for a [`RequestCollapser`](crate::RequestCollapser).
    pub fn lock_provider(&self) -> Result<Arc<dyn LockProvider>, ConfigError> {
        let provider: Arc<dyn LockProvider> = match self {
            LockConfig::Instance => Arc::new(InstanceLockProvider::new()),
            LockConfig::Striped { stripes } => Arc::new(StripedLockProvider::new(*stripes)?),
            LockConfig::Distributed(config) => Arc::new(config.provider()?),
        };
        Ok(provider)
    }

    /// Builds the configured provider for an [`AsyncRequestCollapser`](crate::AsyncRequestCollapser).
    pub fn async_lock_provider(&self) -> Result<Arc<dyn AsyncLockProvider>, ConfigError> {
        let provider: Arc<dyn AsyncLockProvider> = match self {
            LockConfig::Instance => Arc::new(AsyncInstanceLockProvider::new()),
            LockConfig::Striped { stripes } => Arc::new(StripedLockProvider::new(*stripes)?),
            LockConfig::Distributed(config) => Arc::new(config.provider()?),
        };
        Ok(provider)
    }
}

/// Settings of the collapsers.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CollapserConfig {
    /// The lock provider guarding the registry.
    pub lock: LockConfig,
}

impl CollapserConfig {
    /// Options for a [`RequestCollapser`](crate::RequestCollapser) using the configured lock.
    pub fn options(&self) -> Result<CollapserOptions, ConfigError> {
        Ok(CollapserOptions {
            lock_provider: Some(self.lock.lock_provider()?),
            ..Default::default()
        })
    }

    /// Options for an [`AsyncRequestCollapser`](crate::AsyncRequestCollapser) using the configured
    /// lock.
    pub fn async_options(&self) -> Result<AsyncCollapserOptions, ConfigError> {
        Ok(AsyncCollapserOptions {
            lock_provider: Some(self.lock.async_lock_provider()?),
            ..Default::default()
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Configuration of the collapsers.
    pub collapser: CollapserConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
