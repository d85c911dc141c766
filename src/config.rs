//! Corpus access configuration

use crate::{fetch::RetryPolicy, Result};
use std::{
    io::{self, ErrorKind},
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
};

/// Environment variable which decides whether network access is allowed
pub const ENVIRONMENT_VARIABLE: &str = "WEBDATACOMMONS_ENV";

/// Corpus version that is used when none is specified
pub const DEFAULT_DATA_SET_VERSION: &str = "2022-12";

/// Classes whose per-domain statistics files are too large to be fetched
///
/// These classes are treated as having no domain statistics at all.
pub const DEFAULT_EXCLUDED_DOMAIN_STATS: &[&str] = &[
    "CreativeWork",
    "LocalBusiness",
    "Organization",
    "Person",
    "Product",
];

/// Whether cache misses may be resolved over the network
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NetworkAccess {
    /// Cache misses are fetched over HTTP
    Allowed,

    /// Every cache miss is a fatal [`Error::Offline`](crate::Error::Offline)
    Denied,
}
//
impl NetworkAccess {
    /// Decide network access from the [`ENVIRONMENT_VARIABLE`]
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(ENVIRONMENT_VARIABLE).ok().as_deref())
    }

    /// Decide network access from the value of the [`ENVIRONMENT_VARIABLE`]
    ///
    /// Only the development and test environments may touch the network.
    /// Any other value, including no value at all, denies network access.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("development") | Some("test") => Self::Allowed,
            _ => Self::Denied,
        }
    }

    /// Truth that network access is allowed
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }
}

/// Final process configuration
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Root directory of the file-backed cache
    pub cache_dir: PathBuf,

    /// Truth that the cache must never be written to
    pub read_only_cache: bool,

    /// Whether cache misses may be fetched over the network
    pub network: NetworkAccess,

    /// Version of the schema.org corpus, e.g. "2022-12"
    pub data_set_version: Box<str>,

    /// Retry policy for transient HTTP failures
    pub retry: RetryPolicy,

    /// User agent sent with HTTP requests
    pub user_agent: Box<str>,

    /// Max number of domain shards that are finalized concurrently
    pub finalize_concurrency: NonZeroUsize,

    /// Max number of records that are buffered before a disk write
    pub batch_capacity: NonZeroUsize,

    /// Classes whose domain statistics are never fetched
    pub excluded_domain_stats: Box<[Box<str>]>,
}
//
impl Config {
    /// Default configuration for a cache directory
    ///
    /// Network access follows the [`ENVIRONMENT_VARIABLE`].
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            read_only_cache: false,
            network: NetworkAccess::from_env(),
            data_set_version: DEFAULT_DATA_SET_VERSION.into(),
            retry: RetryPolicy::default(),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).into(),
            finalize_concurrency: NonZeroUsize::new(8).expect("8 is not zero"),
            batch_capacity: NonZeroUsize::new(10_000).expect("10000 is not zero"),
            excluded_domain_stats: DEFAULT_EXCLUDED_DOMAIN_STATS
                .iter()
                .map(|&class| class.into())
                .collect(),
        }
    }

    /// Default configuration using the platform's cache directory
    pub fn with_default_cache_dir() -> Result<Self> {
        Ok(Self::new(default_cache_dir()?))
    }

    /// Rebuild with a different network access policy
    pub fn with_network(self, network: NetworkAccess) -> Self {
        Self { network, ..self }
    }

    /// Rebuild with a read-only cache
    pub fn with_read_only_cache(self, read_only_cache: bool) -> Self {
        Self {
            read_only_cache,
            ..self
        }
    }

    /// Rebuild with a different corpus version
    pub fn with_data_set_version(self, version: impl Into<Box<str>>) -> Self {
        Self {
            data_set_version: version.into(),
            ..self
        }
    }

    /// Truth that a class's domain statistics should not be fetched
    pub fn excludes_domain_stats(&self, class_name: &str) -> bool {
        self.excluded_domain_stats
            .iter()
            .any(|excluded| **excluded == *class_name)
    }

    /// Wrap into the shared form used by the rest of the library
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Platform-specific cache directory of this program
pub fn default_cache_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", env!("CARGO_PKG_NAME"))
        .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "no home directory to put the cache in"))?;
    Ok(dirs.cache_dir().to_path_buf())
}
