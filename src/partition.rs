//! Streaming split of class record files into per-domain shards
//!
//! Each class of the corpus comes as one large record file that mixes the
//! records of every domain. The first time a domain of some class is
//! requested, the whole class file is streamed once and fanned out into one
//! cached shard per known domain, so that later requests for any domain of
//! that class only read back their own shard.
//!
//! Shards are first accumulated in uncompressed intermediate entries, then
//! compressed into finalized entries. Only finalized entries are ever read,
//! so an interrupted split can simply be run again: domains whose shard was
//! finalized by a previous run are skipped, and leftover intermediates are
//! truncated before being written to.

use crate::{
    cache::{AppendHandle, Cache, CacheKey},
    codec,
    config::Config,
    dataset::Dataset,
    fetch::Fetcher,
    progress::{ProgressConfig, ProgressCounter, ProgressReport, Work},
    records::{self, Record},
    router::DomainRouter,
    Error, Result,
};
use futures::{Stream, StreamExt};
use std::{
    collections::{hash_map, BTreeSet, HashMap},
    io::{self, ErrorKind},
    pin::pin,
    sync::Arc,
};
use tokio::{
    io::{AsyncReadExt, BufReader},
    task::JoinSet,
};

/// Name of the entry that marks a class as fully split
const MANIFEST: &str = "split.json";

/// Extension of per-domain shards
const SHARD_EXTENSION: &str = ".nq";

/// Record file of a class
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ClassSource {
    /// Name of the class, e.g. "Recipe"
    pub name: Box<str>,

    /// URL of the class's record file
    pub download_url: Box<str>,
}

/// Outcome of a [`Partitioner::split_class_file()`] run
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SplitSummary {
    /// Truth that a previous run had already split this class
    pub already_split: bool,

    /// Number of records read from the source file
    pub records: u64,

    /// Number of records that were routed to a known domain
    pub routed: u64,

    /// Number of records dropped because their owner is not an IRI
    pub dropped_non_url: u64,

    /// Number of records dropped because their owner has no known domain
    pub dropped_unrouted: u64,

    /// Domains whose shard was finalized by this run
    pub finalized: BTreeSet<Box<str>>,

    /// Domains whose shard had been finalized by a previous run
    pub skipped: BTreeSet<Box<str>>,
}

/// Cache layout of the shards of one class
#[derive(Clone, Debug)]
struct ShardKeys {
    /// Key of the class directory
    class: CacheKey,
}
//
impl ShardKeys {
    fn new(version: &str, class: &str) -> Result<Self> {
        Ok(Self {
            class: CacheKey::new(["webdatacommons", version, "schemaorg", "by-domain", class])?,
        })
    }

    /// Uncompressed shard, which may be incomplete
    fn intermediate(&self, domain: &str) -> Result<CacheKey> {
        self.class.child(format!("{domain}{SHARD_EXTENSION}"))
    }

    /// Compressed shard, which is always complete
    fn finalized(&self, domain: &str) -> Result<CacheKey> {
        Ok(self.intermediate(domain)?.compressed())
    }

    /// List of the domains of a class that was fully split
    fn manifest(&self) -> Result<CacheKey> {
        self.class.child(MANIFEST)
    }
}

/// Provider of per-domain datasets
pub struct Partitioner {
    /// Source of class record files
    fetcher: Arc<Fetcher>,

    /// Split configuration
    config: Arc<Config>,

    /// Where split progress is shown
    report: ProgressReport,
}
//
impl Partitioner {
    /// Set up a partitioner
    pub fn new(fetcher: Arc<Fetcher>, config: Arc<Config>, report: ProgressReport) -> Self {
        Self {
            fetcher,
            config,
            report,
        }
    }

    /// Cache that holds the shards
    fn cache(&self) -> &Arc<Cache> {
        self.fetcher.cache()
    }

    /// Shard layout of a class
    fn keys(&self, class: &str) -> Result<ShardKeys> {
        ShardKeys::new(&self.config.data_set_version, class)
    }

    /// Records of one domain of a class
    ///
    /// The class file is split if that was not done before. Fails with
    /// [`Error::DatasetNotFound`] if the domain has no records in it.
    pub async fn dataset(
        &self,
        source: &ClassSource,
        domain: &str,
        router: &DomainRouter,
    ) -> Result<Dataset> {
        let domain = domain.to_ascii_lowercase();
        if let Some(dataset) = self.read_shard(&source.name, &domain).await? {
            return Ok(dataset);
        }
        self.split_class_file(source, router).await?;
        if let Some(dataset) = self.read_shard(&source.name, &domain).await? {
            return Ok(dataset);
        }
        Err(Error::DatasetNotFound {
            class: source.name.clone(),
            domain: domain.into(),
        })
    }

    /// Read a finalized shard, if it exists
    async fn read_shard(&self, class: &str, domain: &str) -> Result<Option<Dataset>> {
        let key = self.keys(class)?.finalized(domain)?;
        let Some(reader) = self.cache().get(&key).await? else {
            return Ok(None);
        };
        let text = BufReader::new(codec::decompress_text(reader));
        let dataset = Dataset::from_stream(records::parse(text)).await?;
        log::debug!("Read {} records of {class} for {domain}", dataset.len());
        Ok(Some(dataset))
    }

    /// Split a class's record file into one finalized shard per known domain
    ///
    /// Returns right away if a previous run completed the split.
    pub async fn split_class_file(
        &self,
        source: &ClassSource,
        router: &DomainRouter,
    ) -> Result<SplitSummary> {
        let keys = self.keys(&source.name)?;
        let manifest = keys.manifest()?;
        if let Some(domains) = self.read_manifest(&manifest).await? {
            log::info!("{} was already split into {} domains", source.name, domains.len());
            return Ok(SplitSummary {
                already_split: true,
                skipped: domains,
                ..SplitSummary::default()
            });
        }

        // Stream records from the class file
        log::info!("Splitting {} into {} domains", source.name, router.len());
        let body = self.fetcher.get(&source.download_url).await?;
        let records = records::parse(codec::record_text(&source.download_url, body));

        // Fan records out to per-domain intermediates
        let counter = self
            .report
            .add_counter(format!("Splitting {} by domain", source.name), "records");
        let mut splitter = Splitter::new(
            Shards::new(self.cache().clone(), keys),
            router,
            self.config.batch_capacity.get(),
            counter.clone(),
        );
        let result = splitter.run(records).await;
        counter.finish();
        if let Err(e) = result {
            splitter.shards.close_all().await;
            return Err(e);
        }

        // Compress intermediates into finalized shards
        let Splitter {
            shards, mut summary, ..
        } = splitter;
        let (handles, skipped) = shards.into_parts();
        summary.skipped = skipped;
        summary.finalized = self.finalize(handles).await?;

        // Remember that the class is complete
        let domains = summary
            .finalized
            .union(&summary.skipped)
            .collect::<Vec<_>>();
        self.cache()
            .set(&manifest, &serde_json::to_vec(&domains)?[..])
            .await?;
        log::info!(
            "Split {} records of {}: {} routed, {} dropped with a non-URL owner, \
             {} dropped with an unknown domain, {} shards finalized, {} already done",
            summary.records,
            source.name,
            summary.routed,
            summary.dropped_non_url,
            summary.dropped_unrouted,
            summary.finalized.len(),
            summary.skipped.len(),
        );
        Ok(summary)
    }

    /// Read the list of domains of a fully split class
    async fn read_manifest(&self, key: &CacheKey) -> Result<Option<BTreeSet<Box<str>>>> {
        let Some(mut reader) = self.cache().get(key).await? else {
            return Ok(None);
        };
        let mut json = Vec::new();
        reader.read_to_end(&mut json).await?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    /// Compress every intermediate that was written to, a few at a time
    async fn finalize(&self, handles: HashMap<Box<str>, AppendHandle>) -> Result<BTreeSet<Box<str>>> {
        let tracker = self.report.add(
            "Compressing domain shards",
            ProgressConfig::new(Work::Steps(handles.len())).dont_show_rate_eta(),
        );
        let max_tasks = self.config.finalize_concurrency.get();
        let mut pending = handles.into_iter();
        let mut tasks = JoinSet::new();
        let mut finalized = BTreeSet::new();
        let result = loop {
            while tasks.len() < max_tasks {
                let Some((domain, handle)) = pending.next() else {
                    break;
                };
                tasks.spawn(finalize_shard(self.cache().clone(), domain, handle));
            }
            match tasks.join_next().await {
                Some(Ok(Ok(domain))) => {
                    tracker.make_progress(1);
                    finalized.insert(domain);
                }
                Some(Ok(Err(e))) => break Err(e),
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(finalized),
            }
        };
        tracker.finish();
        if result.is_err() {
            tasks.shutdown().await;
            for (_, handle) in pending {
                close_quietly(handle).await;
            }
        }
        result
    }
}

/// Close, compress, then delete one intermediate shard
async fn finalize_shard(cache: Arc<Cache>, domain: Box<str>, handle: AppendHandle) -> Result<Box<str>> {
    let intermediate = handle.key().clone();
    let bytes = handle.bytes_written();
    handle.close().await?;
    let reader = cache.get(&intermediate).await?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::NotFound,
            format!("intermediate shard {intermediate} vanished before finalization"),
        )
    })?;
    let written = cache
        .set(&intermediate.compressed(), codec::compress_text(reader))
        .await?;
    cache.delete(&intermediate).await?;
    log::debug!("Finalized shard of {domain}: {bytes} bytes compressed into {written}");
    Ok(domain)
}

/// Close an append handle, logging failures
async fn close_quietly(handle: AppendHandle) {
    let key = handle.key().clone();
    if let Err(e) = handle.close().await {
        log::warn!("Failed to close {key} while cleaning up: {e}");
    }
}

/// Records of one domain waiting to be written out
#[derive(Debug)]
struct Batch {
    /// Domain that the records were routed to
    domain: Box<str>,

    /// Owner of the last record, used to skip routing for its successors
    last_owner: Box<str>,

    /// Records serialized as N-Quads lines
    lines: Vec<u8>,

    /// Number of records in `lines`
    len: usize,
}
//
impl Batch {
    fn new(domain: &str, owner: &str) -> Self {
        Self {
            domain: domain.into(),
            last_owner: owner.into(),
            lines: Vec::new(),
            len: 0,
        }
    }

    fn push(&mut self, record: &Record) -> Result<()> {
        records::write_line(record, &mut self.lines)?;
        self.len += 1;
        Ok(())
    }

    /// Take the serialized records out, leaving the batch open but empty
    fn drain(&mut self) -> Vec<u8> {
        self.len = 0;
        std::mem::take(&mut self.lines)
    }
}

/// Intermediate shards of a class that a split writes to
struct Shards {
    cache: Arc<Cache>,
    keys: ShardKeys,

    /// Intermediates opened by this run
    handles: HashMap<Box<str>, AppendHandle>,

    /// Whether each domain met so far had been finalized before this run
    finalized_before: HashMap<Box<str>, bool>,
}
//
impl Shards {
    fn new(cache: Arc<Cache>, keys: ShardKeys) -> Self {
        Self {
            cache,
            keys,
            handles: HashMap::new(),
            finalized_before: HashMap::new(),
        }
    }

    /// Append serialized records to a domain's intermediate
    ///
    /// Writes to domains that were finalized by a previous run are dropped.
    async fn write(&mut self, domain: &str, lines: &[u8]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let done = match self.finalized_before.get(domain) {
            Some(&done) => done,
            None => {
                let done = self.cache.exists(&self.keys.finalized(domain)?).await?;
                if done {
                    log::debug!("Shard of {domain} was finalized by a previous run, skipping it");
                }
                self.finalized_before.insert(domain.into(), done);
                done
            }
        };
        if done {
            return Ok(());
        }
        let handle = match self.handles.entry(domain.into()) {
            hash_map::Entry::Occupied(o) => o.into_mut(),
            hash_map::Entry::Vacant(v) => {
                let key = self.keys.intermediate(domain)?;
                v.insert(self.cache.open_for_append(&key).await?)
            }
        };
        handle.append(lines).await
    }

    /// Close every open intermediate after a failure
    async fn close_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            close_quietly(handle).await;
        }
    }

    /// Open intermediates, and domains that a previous run had finalized
    fn into_parts(self) -> (HashMap<Box<str>, AppendHandle>, BTreeSet<Box<str>>) {
        let skipped = self
            .finalized_before
            .into_iter()
            .filter_map(|(domain, done)| done.then_some(domain))
            .collect();
        (self.handles, skipped)
    }
}

/// Single-pass fan-out of a record stream into domain shards
struct Splitter<'router> {
    shards: Shards,
    router: &'router DomainRouter,

    /// Max number of records in a batch
    capacity: usize,

    /// Records of the domain being read, if any
    batch: Option<Batch>,

    /// Records read so far, for display
    counter: ProgressCounter,

    summary: SplitSummary,
}
//
impl<'router> Splitter<'router> {
    fn new(
        shards: Shards,
        router: &'router DomainRouter,
        capacity: usize,
        counter: ProgressCounter,
    ) -> Self {
        Self {
            shards,
            router,
            capacity,
            batch: None,
            counter,
            summary: SplitSummary::default(),
        }
    }

    /// Consume a record stream, then flush the last batch
    async fn run(&mut self, records: impl Stream<Item = Result<Record>>) -> Result<()> {
        let mut records = pin!(records);
        while let Some(record) = records.next().await {
            self.add_record(record?).await?;
        }
        self.switch_batch(None).await
    }

    /// Route a record into the current batch, or a new one
    async fn add_record(&mut self, record: Record) -> Result<()> {
        self.summary.records += 1;
        self.counter.inc(1);
        let Some(owner) = records::owner(&record) else {
            log::debug!("Dropping record with a non-URL owner: {record}");
            self.summary.dropped_non_url += 1;
            return Ok(());
        };

        // Records of a page tend to be contiguous, no need to route them again
        let same_owner = self
            .batch
            .as_ref()
            .is_some_and(|batch| *batch.last_owner == *owner);
        if !same_owner {
            let router = self.router;
            let Some(domain) = router.route(owner) else {
                log::debug!("Dropping record whose owner {owner} has no known domain");
                self.summary.dropped_unrouted += 1;
                return Ok(());
            };
            let same_domain = self
                .batch
                .as_ref()
                .is_some_and(|batch| *batch.domain == *domain);
            if same_domain {
                if let Some(batch) = &mut self.batch {
                    batch.last_owner = owner.into();
                }
            } else {
                self.switch_batch(Some(Batch::new(domain, owner))).await?;
            }
        }

        // Append to the current batch, writing it out once full
        if let Some(batch) = &mut self.batch {
            batch.push(&record)?;
            self.summary.routed += 1;
            if batch.len >= self.capacity {
                let lines = batch.drain();
                self.shards.write(&batch.domain, &lines).await?;
            }
        }
        Ok(())
    }

    /// Write out the current batch and replace it with another one
    async fn switch_batch(&mut self, new_batch: Option<Batch>) -> Result<()> {
        if let Some(former) = std::mem::replace(&mut self.batch, new_batch) {
            self.shards.write(&former.domain, &former.lines).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::NetworkAccess,
        fetch::resource_key,
        testing::{self, FakeTransport},
    };
    use std::{num::NonZeroUsize, path::Path};
    use tempfile::TempDir;

    const SOURCE_URL: &str = "http://data.example/Recipe/part_0.gz";

    fn test_source(url: &str) -> ClassSource {
        ClassSource {
            name: "Recipe".into(),
            download_url: url.into(),
        }
    }

    fn line(subject: usize, owner: &str) -> String {
        format!("<http://ex.org/s{subject}> <http://schema.org/name> \"n{subject}\" <{owner}>")
    }

    /// Source lines, and the lines expected in each domain's shard
    fn source_lines() -> (Vec<String>, Vec<(&'static str, Vec<String>)>) {
        let lines = vec![
            line(0, "http://www.a.com/p1"),
            line(1, "http://www.a.com/p1"),
            line(2, "http://shop.b.org/p1"),
            line(3, "http://c.net/p1"),
            "<http://ex.org/s4> <http://schema.org/name> \"n4\" _:g".to_owned(),
            line(5, "http://a.com/p2"),
            "<http://ex.org/s6> <broken".to_owned(),
            line(7, "http://b.org/p2"),
            line(8, "http://b.org/p2"),
            line(9, "http://b.org/p3"),
            line(10, "http://www.a.com/p1"),
        ];
        let a = vec![0, 1, 5, 10];
        let b = vec![2, 7, 8, 9];
        let pick = |indices: Vec<usize>| {
            indices
                .into_iter()
                .map(|i| format!("{} .", lines[i]))
                .collect::<Vec<_>>()
        };
        let expected = vec![("a.com", pick(a)), ("b.org", pick(b))];
        (lines, expected)
    }

    async fn serve_source(transport: &FakeTransport) {
        let (lines, _) = source_lines();
        let text = lines.iter().map(|l| format!("{l} .\n")).collect::<String>();
        transport.serve(SOURCE_URL, Some("application/gzip"), testing::gzip(text.as_bytes()).await);
    }

    fn router() -> DomainRouter {
        DomainRouter::new(["a.com", "b.org", "d.io"])
    }

    fn partitioner(dir: &Path, transport: Arc<FakeTransport>, network: NetworkAccess) -> Partitioner {
        let config = Config {
            batch_capacity: NonZeroUsize::new(2).unwrap(),
            finalize_concurrency: NonZeroUsize::new(1).unwrap(),
            ..Config::new(dir).with_network(network)
        };
        Partitioner::new(
            Arc::new(testing::fetcher(dir, transport, network)),
            Arc::new(config),
            ProgressReport::hidden(),
        )
    }

    fn domains(names: &[&str]) -> BTreeSet<Box<str>> {
        names.iter().map(|&name| name.into()).collect()
    }

    fn lines_of(dataset: &Dataset) -> Vec<String> {
        dataset.iter().map(|record| format!("{record} .")).collect()
    }

    #[tokio::test]
    async fn split_is_complete_and_disjoint() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new();
        serve_source(&transport).await;
        let partitioner = partitioner(dir.path(), transport.clone(), NetworkAccess::Allowed);
        let source = test_source(SOURCE_URL);

        let summary = partitioner.split_class_file(&source, &router()).await.unwrap();
        assert!(!summary.already_split);
        assert_eq!(summary.records, 10);
        assert_eq!(summary.routed, 8);
        assert_eq!(summary.dropped_non_url, 1);
        assert_eq!(summary.dropped_unrouted, 1);
        assert_eq!(summary.finalized, domains(&["a.com", "b.org"]));
        assert!(summary.skipped.is_empty());

        let (_, expected) = source_lines();
        for (domain, lines) in expected {
            let dataset = partitioner.dataset(&source, domain, &router()).await.unwrap();
            assert_eq!(lines_of(&dataset), lines, "records of {domain}");
        }
        assert_eq!(transport.requests(), 1);

        // Only finalized shards and the manifest remain
        let class_dir = dir.path().join("webdatacommons/2022-12/schemaorg/by-domain/Recipe");
        let mut names = std::fs::read_dir(class_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, ["a.com.nq.br", "b.org.nq.br", "split.json"]);
    }

    #[tokio::test]
    async fn missing_domain_is_not_found() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new();
        serve_source(&transport).await;
        let partitioner = partitioner(dir.path(), transport.clone(), NetworkAccess::Allowed);
        let source = test_source(SOURCE_URL);

        for _ in 0..2 {
            assert!(matches!(
                partitioner.dataset(&source, "d.io", &router()).await,
                Err(Error::DatasetNotFound { .. })
            ));
        }
        assert_eq!(transport.requests(), 1);
    }

    #[tokio::test]
    async fn interrupted_split_resumes_to_the_same_result() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new();
        serve_source(&transport).await;
        let partitioner = partitioner(dir.path(), transport.clone(), NetworkAccess::Allowed);
        let source = test_source(SOURCE_URL);
        partitioner.split_class_file(&source, &router()).await.unwrap();

        // Simulate a run that died after finalizing b.org and writing part of
        // the a.com intermediate
        let cache = Cache::new(dir.path());
        let keys = ShardKeys::new("2022-12", "Recipe").unwrap();
        cache.delete(&keys.manifest().unwrap()).await.unwrap();
        cache.delete(&keys.finalized("a.com").unwrap()).await.unwrap();
        cache
            .set(&keys.intermediate("a.com").unwrap(), &b"stale partial line\n"[..])
            .await
            .unwrap();

        let summary = partitioner.split_class_file(&source, &router()).await.unwrap();
        assert_eq!(summary.finalized, domains(&["a.com"]));
        assert_eq!(summary.skipped, domains(&["b.org"]));
        assert!(!cache.exists(&keys.intermediate("a.com").unwrap()).await.unwrap());

        let (_, expected) = source_lines();
        for (domain, lines) in expected {
            let dataset = partitioner.dataset(&source, domain, &router()).await.unwrap();
            assert_eq!(lines_of(&dataset), lines, "records of {domain}");
        }
    }

    #[tokio::test]
    async fn finished_split_needs_no_network() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new();
        serve_source(&transport).await;
        let source = test_source(SOURCE_URL);
        partitioner(dir.path(), transport.clone(), NetworkAccess::Allowed)
            .split_class_file(&source, &router())
            .await
            .unwrap();

        // Even without the source file in the cache, nothing is fetched
        let (_, source_key) = resource_key(SOURCE_URL).unwrap();
        Cache::new(dir.path()).delete(&source_key).await.unwrap();
        let offline = partitioner(dir.path(), transport.clone(), NetworkAccess::Denied);
        let summary = offline.split_class_file(&source, &router()).await.unwrap();
        assert!(summary.already_split);
        assert_eq!(summary.skipped.len(), 2);
        let dataset = offline.dataset(&source, "A.com", &router()).await.unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(transport.requests(), 1);
    }

    #[tokio::test]
    async fn truncated_source_leaves_no_finalized_shard() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new();
        let (lines, _) = source_lines();
        let text = lines.iter().map(|l| format!("{l} .\n")).collect::<String>();
        let gz = testing::gzip(text.as_bytes()).await;
        transport.serve_truncated(SOURCE_URL, Some("application/gzip"), gz.clone(), gz.len() / 2);
        let partitioner = partitioner(dir.path(), transport.clone(), NetworkAccess::Allowed);
        let source = test_source(SOURCE_URL);

        assert!(partitioner.split_class_file(&source, &router()).await.is_err());
        let keys = ShardKeys::new("2022-12", "Recipe").unwrap();
        let cache = Cache::new(dir.path());
        for domain in ["a.com", "b.org"] {
            assert!(!cache.exists(&keys.finalized(domain).unwrap()).await.unwrap());
        }
        assert!(!cache.exists(&keys.manifest().unwrap()).await.unwrap());

        transport.serve(SOURCE_URL, Some("application/gzip"), gz);
        let summary = partitioner.split_class_file(&source, &router()).await.unwrap();
        assert_eq!(summary.finalized.len(), 2);
        assert_eq!(transport.requests(), 2);
    }

    #[tokio::test]
    async fn plain_sources_are_not_gunzipped() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new();
        let url = "http://data.example/Recipe/sample.txt";
        transport.serve(url, Some("text/plain"), format!("{} .\n", line(0, "http://a.com/")));
        let partitioner = partitioner(dir.path(), transport, NetworkAccess::Allowed);
        let dataset = partitioner
            .dataset(&test_source(url), "a.com", &router())
            .await
            .unwrap();
        assert_eq!(dataset.len(), 1);
    }
}
