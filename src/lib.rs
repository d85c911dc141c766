//! Cached access to the Web Data Commons schema.org corpus
//!
//! The corpus is published at <https://webdatacommons.org/structureddata/>
//! as one large N-Quads file per schema.org class, mixing the records of
//! every web domain. This library downloads what it needs once, splits each
//! class file into per-domain shards once, and serves every later request
//! from a local file cache.
//!
//! Network access is only allowed when the `WEBDATACOMMONS_ENV` environment
//! variable is set to `development` or `test`. Otherwise, every cache miss
//! is an [`Error::Offline`].

pub mod cache;
mod codec;
pub mod config;
pub mod corpus;
pub mod dataset;
mod error;
pub mod fetch;
pub mod metadata;
pub mod partition;
pub mod progress;
pub mod records;
pub mod router;
#[cfg(test)]
mod testing;

pub use crate::{
    corpus::Corpus,
    error::{Error, Result},
};
