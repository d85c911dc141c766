//! Entry point to one version of the schema.org corpus

use crate::{
    cache::Cache,
    codec,
    config::Config,
    dataset::Dataset,
    fetch::Fetcher,
    metadata::{self, ClassSubset, DomainStats},
    partition::{Partitioner, SplitSummary},
    progress::ProgressReport,
    records,
    router::DomainRouter,
    Error, Result,
};
use std::{collections::BTreeMap, sync::Arc};
use unicase::UniCase;
use url::Url;

/// Records of a class that are owned by one domain
#[derive(Clone, Debug, PartialEq)]
pub struct DomainSubset {
    /// Pay-level domain, e.g. "example.com"
    pub domain: Box<str>,

    /// Precomputed statistics
    pub stats: DomainStats,
}

/// One version of the schema.org corpus, backed by a local cache
///
/// The class table is loaded when the corpus is opened. Everything else is
/// fetched on demand, and goes through the cache: asking twice for the same
/// data costs a disk read, never a second download or split.
pub struct Corpus {
    config: Arc<Config>,
    fetcher: Arc<Fetcher>,
    partitioner: Partitioner,

    /// Classes of this corpus version, in table order
    classes: Box<[ClassSubset]>,
}
//
impl Corpus {
    /// Open the corpus described by some configuration
    pub async fn open(config: Arc<Config>, report: ProgressReport) -> Result<Self> {
        let cache = if config.read_only_cache {
            Cache::read_only(&config.cache_dir)
        } else {
            Cache::new(&config.cache_dir)
        };
        let fetcher = Fetcher::from_config(&config, Arc::new(cache), report.clone())?;
        Self::with_fetcher(config, Arc::new(fetcher), report).await
    }

    /// Open a corpus using a preconfigured fetcher
    pub async fn with_fetcher(
        config: Arc<Config>,
        fetcher: Arc<Fetcher>,
        report: ProgressReport,
    ) -> Result<Self> {
        let page_url = metadata::class_subsets_url(&config.data_set_version);
        let html = fetcher.get_string(&page_url).await?;
        let page_url = Url::parse(&page_url).map_err(|e| Error::metadata(e.to_string()))?;
        let classes = metadata::parse_class_subsets(&html, &page_url)?.into_boxed_slice();
        log::info!(
            "Corpus version {} has {} classes",
            config.data_set_version,
            classes.len()
        );
        let partitioner = Partitioner::new(fetcher.clone(), config.clone(), report);
        Ok(Self {
            config,
            fetcher,
            partitioner,
            classes,
        })
    }

    /// Classes of this corpus version
    pub fn classes(&self) -> &[ClassSubset] {
        &self.classes
    }

    /// Look up a class by name, ignoring case
    pub fn class(&self, name: &str) -> Result<&ClassSubset> {
        let name = UniCase::new(name);
        self.classes
            .iter()
            .find(|class| UniCase::new(&*class.name) == name)
            .ok_or_else(|| Error::UnknownClass(name.into_inner().into()))
    }

    /// Domains that own records of a class, with their statistics
    ///
    /// Classes whose statistics are excluded by the configuration have no
    /// known domains.
    pub async fn domain_subsets(&self, class: &ClassSubset) -> Result<Vec<DomainSubset>> {
        if self.config.excludes_domain_stats(&class.name) {
            log::info!("Domain statistics of {} are not fetched", class.name);
            return Ok(Vec::new());
        }
        let tsv = self.fetcher.get_bytes(&class.domain_stats_url).await?;
        let stats = metadata::parse_domain_stats(&tsv).await?;
        Ok(stats
            .into_iter()
            .map(|stats| DomainSubset {
                domain: stats.domain.clone(),
                stats,
            })
            .collect())
    }

    /// Records of a class that are owned by one of its domains
    pub async fn domain_dataset(&self, class: &ClassSubset, domain: &str) -> Result<Dataset> {
        let router = self.router(class).await?;
        if !router.contains(domain) {
            return Err(Error::UnknownDomain {
                class: class.name.clone(),
                domain: domain.into(),
            });
        }
        self.partitioner
            .dataset(&class.source(), domain, &router)
            .await
    }

    /// Split a class into per-domain shards ahead of time
    pub async fn split_class(&self, class: &ClassSubset) -> Result<SplitSummary> {
        let router = self.router(class).await?;
        self.partitioner
            .split_class_file(&class.source(), &router)
            .await
    }

    /// Names of the record files that hold each domain's records
    pub async fn domain_file_names(&self, class: &ClassSubset) -> Result<BTreeMap<Box<str>, Box<str>>> {
        let csv = self.fetcher.get_bytes(&class.lookup_url).await?;
        metadata::parse_domain_lookup(&csv).await
    }

    /// Records of the class's sample file, grouped by owning page
    pub async fn sample_pages(&self, class: &ClassSubset) -> Result<BTreeMap<Box<str>, Dataset>> {
        let url = &class.sample_download_url;
        let body = self.fetcher.get(url).await?;
        let sample = Dataset::from_stream(records::parse(codec::record_text(url, body))).await?;
        Ok(sample.pages())
    }

    /// Router for the known domains of a class
    async fn router(&self, class: &ClassSubset) -> Result<DomainRouter> {
        let subsets = self.domain_subsets(class).await?;
        Ok(DomainRouter::new(subsets.iter().map(|subset| &*subset.domain)))
    }
}
