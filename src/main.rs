//! Command-line access to the Web Data Commons schema.org corpus, whose
//! general documentation you can find at
//! <https://webdatacommons.org/structureddata/>.

mod prompt;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use oxrdf::{GraphName, Quad};
use oxrdfio::{RdfFormat, RdfSerializer};
use std::{
    io::{BufWriter, Write},
    num::NonZeroUsize,
    path::PathBuf,
};
use webdatacommons::{
    config::{Config, DEFAULT_DATA_SET_VERSION, DEFAULT_EXCLUDED_DOMAIN_STATS},
    dataset::Dataset,
    fetch::RetryPolicy,
    progress::ProgressReport,
    Corpus,
};

/// Extract per-domain subsets of the Web Data Commons schema.org corpus
///
/// Everything that is downloaded or computed is kept in a local cache.
/// Cache misses may only be resolved over the network when the
/// WEBDATACOMMONS_ENV environment variable is set to "development" or
/// "test".
#[derive(Parser, Debug)]
#[command(version, author)]
struct Args {
    /// Root directory of the cache
    ///
    /// Defaults to the platform's cache directory for this program.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Version of the corpus, e.g. "2022-12"
    #[arg(long, global = true, default_value = DEFAULT_DATA_SET_VERSION)]
    data_set_version: Box<str>,

    /// Never write to the cache
    ///
    /// Useful when the cache was prepared in advance and is shipped
    /// read-only. Anything that is not cached yet will then fail.
    #[arg(long, global = true, default_value_t = false)]
    read_only_cache: bool,

    /// Max number of domain shards that are compressed concurrently at the
    /// end of a class split
    #[arg(long, global = true, default_value = "8")]
    finalize_concurrency: NonZeroUsize,

    /// Max number of records buffered in memory before a disk write during
    /// a class split
    #[arg(long, global = true, default_value = "10000")]
    batch_capacity: NonZeroUsize,

    /// Max number of retries of a failed HTTP request
    #[arg(long, global = true, default_value = "10")]
    max_retries: u32,

    /// Class whose per-domain statistics should never be fetched
    ///
    /// The statistics of some classes are too large to be worth fetching,
    /// and these classes are treated as having no known domain. Can be
    /// specified multiple times, replacing the default list.
    #[arg(long = "exclude-domain-stats", value_name = "CLASS", global = true, default_values = DEFAULT_EXCLUDED_DOMAIN_STATS)]
    excluded_domain_stats: Vec<Box<str>>,

    #[command(subcommand)]
    command: Command,
}
//
impl Args {
    /// Turn CLI arguments into a library configuration
    fn config(&self) -> Result<Config> {
        let config = match &self.cache_dir {
            Some(cache_dir) => Config::new(cache_dir.clone()),
            None => Config::with_default_cache_dir().context("locating the cache directory")?,
        }
        .with_read_only_cache(self.read_only_cache)
            .with_data_set_version(self.data_set_version.clone());
        Ok(Config {
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
            finalize_concurrency: self.finalize_concurrency,
            batch_capacity: self.batch_capacity,
            excluded_domain_stats: self.excluded_domain_stats.clone().into_boxed_slice(),
            ..config
        })
    }
}

/// What should be done with the corpus
#[derive(Debug, Subcommand)]
enum Command {
    /// Print the records of one domain of a class
    ///
    /// Will interactively prompt for the class and domain if not specified.
    Extract {
        /// Name of the schema.org class, e.g. "Recipe"
        #[arg(short, long)]
        class: Option<Box<str>>,

        /// Pay-level domain, e.g. "example.com"
        #[arg(short = 'd', long = "pay-level-domain", visible_alias = "domain")]
        domain: Option<Box<str>>,

        /// Output RDF syntax, as a media type or file extension
        #[arg(short, long, default_value = "application/trig")]
        format: Box<str>,
    },

    /// List the classes of the corpus
    Classes,

    /// List the known domains of a class
    Domains {
        /// Name of the schema.org class, e.g. "Recipe"
        #[arg(short, long)]
        class: Option<Box<str>>,
    },

    /// Split a class into per-domain shards ahead of time
    Split {
        /// Name of the schema.org class, e.g. "Recipe"
        #[arg(short, long)]
        class: Option<Box<str>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    setup_logging().map_err(|e| anyhow::format_err!("{e}"))?;

    // Decode CLI arguments
    let args = Args::parse();
    let config = args.config()?.shared();
    log::info!("Starting with {config:#?}");

    // Load the class table
    let report = ProgressReport::new();
    let corpus = Corpus::open(config, report)
        .await
        .context("opening the corpus")?;

    // Do what was asked
    let stdout = std::io::stdout();
    let mut stdout = BufWriter::new(stdout.lock());
    match &args.command {
        Command::Extract {
            class,
            domain,
            format,
        } => {
            let format = parse_format(format)?;
            let class = prompt::class(&corpus, class.as_deref())?;
            let domain = match domain {
                Some(domain) => domain.clone(),
                None => prompt::domain(&corpus.domain_subsets(class).await?, None)?,
            };
            let dataset = corpus
                .domain_dataset(class, &domain)
                .await
                .with_context(|| format!("extracting the records of {domain} from {}", class.name))?;
            write_dataset(&dataset, format, &mut stdout)?;
        }
        Command::Classes => {
            for class in corpus.classes() {
                let stats = class.general_stats;
                writeln!(
                    stdout,
                    "{}\t{} records\t{} pages\t{} hosts\t{}",
                    class.name, stats.quads, stats.urls, stats.hosts, class.size
                )?;
            }
        }
        Command::Domains { class } => {
            let class = prompt::class(&corpus, class.as_deref())?;
            for subset in corpus.domain_subsets(class).await? {
                writeln!(
                    stdout,
                    "{}\t{} entities\t{} records",
                    subset.domain, subset.stats.entities, subset.stats.quads
                )?;
            }
        }
        Command::Split { class } => {
            let class = prompt::class(&corpus, class.as_deref())?;
            let summary = corpus
                .split_class(class)
                .await
                .with_context(|| format!("splitting {} by domain", class.name))?;
            writeln!(
                stdout,
                "{} records read, {} routed, {} shards finalized, {} already done",
                summary.records,
                summary.routed,
                summary.finalized.len(),
                summary.skipped.len()
            )?;
        }
    }
    stdout.flush()?;
    Ok(())
}

/// Use anyhow for Result type erasure
pub use anyhow::Result;

/// Find an RDF syntax from its media type or file extension
fn parse_format(format: &str) -> Result<RdfFormat> {
    RdfFormat::from_media_type(format)
        .or_else(|| RdfFormat::from_extension(format))
        .with_context(|| format!("unknown RDF syntax {format:?}"))
}

/// Serialize a dataset
///
/// Syntaxes without named graphs get every record in the default graph.
fn write_dataset(dataset: &Dataset, format: RdfFormat, output: impl Write) -> Result<()> {
    let mut serializer = RdfSerializer::from_format(format).for_writer(output);
    for record in dataset {
        if format.supports_datasets() {
            serializer.serialize_quad(record)?;
        } else {
            serializer.serialize_quad(&Quad {
                graph_name: GraphName::DefaultGraph,
                ..record.clone()
            })?;
        }
    }
    serializer.finish()?;
    Ok(())
}

/// Set up logging
fn setup_logging() -> syslog::Result<()> {
    syslog::init(
        syslog::Facility::LOG_USER,
        if cfg!(feature = "log-trace") {
            LevelFilter::Trace
        } else if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        None,
    )
}
