//! Corpus metadata: class table, domain statistics and domain lookups
//!
//! The metadata comes as an HTML page listing the classes of a corpus
//! version, plus per-class tabular files. Everything is parsed into typed
//! structs here, so that the rest of the library never deals with raw rows.

use crate::{partition::ClassSource, Error, Result};
use csv_async::AsyncReaderBuilder;
use futures::TryStreamExt;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::{collections::BTreeMap, pin::pin};
use url::Url;

/// URL of the class table of a corpus version
pub fn class_subsets_url(version: &str) -> String {
    format!("https://webdatacommons.org/structureddata/{version}/stats/schema_org_subsets.html")
}

/// Aggregate statistics of a class
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct GeneralStats {
    /// Number of records
    pub quads: u64,

    /// Number of pages with records
    pub urls: u64,

    /// Number of hosts with records
    pub hosts: u64,
}

/// Class that often co-occurs with another class
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RelatedClass {
    /// Short schema.org name, e.g. "Person"
    pub name: Box<str>,

    /// Number of co-occurrences
    pub count: u64,
}

/// Subset of the corpus that holds the records of one class
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ClassSubset {
    /// Short schema.org name, e.g. "Recipe"
    pub name: Box<str>,

    pub general_stats: GeneralStats,

    pub related_classes: Box<[RelatedClass]>,

    /// Human-readable size of the record file, e.g. "2.1 GB"
    pub size: Box<str>,

    /// Full record file
    pub download_url: Box<str>,

    /// Small sample of the record file
    pub sample_download_url: Box<str>,

    /// Table from domains to record file names
    pub lookup_url: Box<str>,

    /// Per-domain statistics
    pub domain_stats_url: Box<str>,
}
//
impl ClassSubset {
    /// Record file of this class, as the partitioner sees it
    pub fn source(&self) -> ClassSource {
        ClassSource {
            name: self.name.clone(),
            download_url: self.download_url.clone(),
        }
    }
}

/// Statistics of one domain within a class
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DomainStats {
    /// Pay-level domain, e.g. "example.com"
    pub domain: Box<str>,

    /// Number of entities of the class
    pub entities: u64,

    /// Number of records
    pub quads: u64,

    /// Fraction of entities that use each property
    pub property_density: BTreeMap<Box<str>, f64>,
}

/// Parse the class table of a corpus version
///
/// `page_url` is the URL the page was fetched from, which relative links
/// are resolved against.
pub fn parse_class_subsets(html: &str, page_url: &Url) -> Result<Vec<ClassSubset>> {
    let document = Html::parse_document(html);
    let row_selector = selector("tr")?;
    let header_selector = selector("th")?;
    let cell_selector = selector("td")?;
    let link_selector = selector("a[href]")?;

    let mut classes = Vec::new();
    for row in document.select(&row_selector) {
        let cells = row.select(&cell_selector).collect::<Vec<_>>();
        if cells.is_empty() {
            continue;
        }
        let name = row
            .select(&header_selector)
            .next()
            .map(|header| header.text().collect::<String>().trim().to_owned())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::metadata("class row without a class name"))?;
        let [stats, related, size, downloads, lookups, ..] = &cells[..] else {
            return Err(Error::metadata(format!(
                "row of class {name} has {} cells instead of 5",
                cells.len()
            )));
        };

        let general_stats = match &text_nodes(stats)[..] {
            [quads, urls, hosts, ..] => GeneralStats {
                quads: parse_stat(&name, quads)?,
                urls: parse_stat(&name, urls)?,
                hosts: parse_stat(&name, hosts)?,
            },
            other => {
                return Err(Error::metadata(format!(
                    "class {name} has {} general statistics instead of 3",
                    other.len()
                )))
            }
        };
        let related_classes = text_nodes(related)
            .into_iter()
            .map(|text| parse_related_class(&name, text))
            .collect::<Result<_>>()?;
        let download_links = links(downloads, &link_selector, page_url)?;
        let lookup_links = links(lookups, &link_selector, page_url)?;
        let (
            [download_url, sample_download_url, ..],
            [lookup_url, domain_stats_url, ..],
        ) = (&download_links[..], &lookup_links[..])
        else {
            return Err(Error::metadata(format!(
                "class {name} lacks some of its download, sample, lookup and statistics links"
            )));
        };

        classes.push(ClassSubset {
            general_stats,
            related_classes,
            size: size.text().collect::<String>().trim().into(),
            download_url: download_url.clone(),
            sample_download_url: sample_download_url.clone(),
            lookup_url: lookup_url.clone(),
            domain_stats_url: domain_stats_url.clone(),
            name: name.into(),
        });
    }
    log::debug!("Found {} classes at {page_url}", classes.len());
    Ok(classes)
}

/// Parse a constant CSS selector
fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| Error::metadata(format!("bad selector {css}: {e:?}")))
}

/// Non-blank text nodes that are direct children of an element
fn text_nodes<'a>(element: &ElementRef<'a>) -> Vec<&'a str> {
    element
        .children()
        .filter_map(|node| node.value().as_text())
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .collect()
}

/// Absolute targets of the links within an element
fn links(element: &ElementRef<'_>, link_selector: &Selector, base: &Url) -> Result<Vec<Box<str>>> {
    element
        .select(link_selector)
        .filter_map(|link| link.value().attr("href"))
        .map(|href| {
            base.join(href)
                .map(|url| url.as_str().into())
                .map_err(|e| Error::metadata(format!("bad link {href:?}: {e}")))
        })
        .collect()
}

/// Parse a count like "Quads: 1,234"
fn parse_stat(class: &str, text: &str) -> Result<u64> {
    let number = text.split_once(' ').map_or(text, |(_label, number)| number);
    parse_count(number)
        .ok_or_else(|| Error::metadata(format!("bad statistic {text:?} for class {class}")))
}

/// Parse a related class like "http://schema.org/Person (1,234)"
fn parse_related_class(class: &str, text: &str) -> Result<RelatedClass> {
    let bad = || Error::metadata(format!("bad related class {text:?} for class {class}"));
    let (iri, count) = text.split_once(' ').ok_or_else(bad)?;
    let name = iri
        .strip_prefix("http://schema.org/")
        .or_else(|| iri.strip_prefix("https://schema.org/"))
        .ok_or_else(bad)?;
    let count = count
        .trim()
        .strip_prefix('(')
        .and_then(|count| count.strip_suffix(')'))
        .and_then(parse_count)
        .ok_or_else(bad)?;
    Ok(RelatedClass {
        name: name.into(),
        count,
    })
}

/// Parse a count with thousands separators
fn parse_count(text: &str) -> Option<u64> {
    text.trim().replace(',', "").parse().ok()
}

/// Row of a domain statistics file
#[derive(Debug, Deserialize)]
struct DomainStatsRow {
    #[serde(rename = "Domain", default)]
    domain: String,

    #[serde(rename = "#Entities of class", default)]
    entities: String,

    #[serde(rename = "#Quads of Subset", default)]
    quads: String,

    #[serde(rename = "Properties and Density", default)]
    property_density: String,
}

/// Parse a tab-separated domain statistics file
///
/// Rows without a domain are skipped. Unreadable counts are taken as zero
/// and unreadable property densities as empty, since they only serve
/// display purposes.
pub async fn parse_domain_stats(tsv: &[u8]) -> Result<Vec<DomainStats>> {
    let mut rows = pin!(AsyncReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .create_deserializer(tsv)
        .into_deserialize::<DomainStatsRow>());
    let mut stats = Vec::new();
    while let Some(row) = rows.try_next().await? {
        let domain = row.domain.trim();
        if domain.is_empty() {
            continue;
        }
        stats.push(DomainStats {
            domain: domain.into(),
            entities: parse_count(&row.entities).unwrap_or_else(|| {
                log::debug!("Bad entity count {:?} for {domain}", row.entities);
                0
            }),
            quads: parse_count(&row.quads).unwrap_or_else(|| {
                log::debug!("Bad record count {:?} for {domain}", row.quads);
                0
            }),
            property_density: parse_property_density(&row.property_density),
        });
    }
    Ok(stats)
}

/// Parse a property density column like `{'name': 0.98, 'image': 0.5}`
fn parse_property_density(text: &str) -> BTreeMap<Box<str>, f64> {
    let text = text.trim();
    if text.is_empty() {
        return BTreeMap::new();
    }
    serde_json::from_str(&text.replace('\'', "\"")).unwrap_or_else(|e| {
        log::debug!("Ignoring unreadable property density {text:?}: {e}");
        BTreeMap::new()
    })
}

/// Row of a domain lookup file
#[derive(Debug, Deserialize)]
struct DomainLookupRow {
    #[serde(default)]
    pld: String,

    #[serde(default)]
    file_lookup: String,
}

/// Parse a comma-separated table from domains to record file names
pub async fn parse_domain_lookup(csv: &[u8]) -> Result<BTreeMap<Box<str>, Box<str>>> {
    let mut rows = pin!(AsyncReaderBuilder::new()
        .flexible(true)
        .create_deserializer(csv)
        .into_deserialize::<DomainLookupRow>());
    let mut lookup = BTreeMap::new();
    while let Some(row) = rows.try_next().await? {
        let domain = row.pld.trim();
        if !domain.is_empty() {
            lookup.insert(domain.into(), row.file_lookup.trim().into());
        }
    }
    Ok(lookup)
}

/// Small copies of the metadata files, shared with the corpus tests
#[cfg(test)]
pub(crate) mod fixtures {
    pub const CLASS_TABLE: &str = r#"<!DOCTYPE html>
<html><body><div>
<h2>Class-specific Subsets</h2>
<table>
<tr><th>Class</th><th>Stats</th><th>Related Classes</th><th>Size</th><th>Download</th><th>Lookup</th></tr>
<tr>
  <th>Recipe</th>
  <td>Quads: 1,234<br>URLs: 56<br>Hosts: 7</td>
  <td>http://schema.org/Person (1,000)<br>https://schema.org/ImageObject (12)</td>
  <td>2.1 GB</td>
  <td><a href="../schemaorg/data/Recipe/part_0.gz">Data</a> <a href="../schemaorg/data/Recipe_sample.txt">Sample</a></td>
  <td><a href="lookups/Recipe_lookup.csv">Lookup</a> <a href="pld_stats/Recipe.tsv">PLD Stats</a></td>
</tr>
<tr>
  <th>Person</th>
  <td>Quads: 9,000,000<br>URLs: 5,000<br>Hosts: 300</td>
  <td></td>
  <td>120 GB</td>
  <td><a href="../schemaorg/data/Person/part_0.gz">Data</a> <a href="../schemaorg/data/Person_sample.txt">Sample</a></td>
  <td><a href="lookups/Person_lookup.csv">Lookup</a> <a href="pld_stats/Person.tsv">PLD Stats</a></td>
</tr>
</table>
</div></body></html>
"#;

    pub const DOMAIN_STATS: &str = "Domain\t#Entities of class\t#Quads of Subset\tProperties and Density\n\
a.com\t2\t40\t{'name': 1.0, 'image': 0.5}\n\
\t0\t0\t\n\
b.org\t1\t4\tnot a dict\n\
d.io\t3\t12\n";

    pub const DOMAIN_LOOKUP: &str = "pld,file_lookup\na.com,part_0.gz\n,part_9.gz\nb.org,part_0.gz\n";
}

#[cfg(test)]
mod tests {
    use super::{fixtures::*, *};

    fn page_url() -> Url {
        Url::parse(&class_subsets_url("2022-12")).unwrap()
    }

    #[test]
    fn class_table() {
        let classes = parse_class_subsets(CLASS_TABLE, &page_url()).unwrap();
        assert_eq!(classes.len(), 2);

        let recipe = &classes[0];
        assert_eq!(&*recipe.name, "Recipe");
        assert_eq!(
            recipe.general_stats,
            GeneralStats {
                quads: 1234,
                urls: 56,
                hosts: 7
            }
        );
        assert_eq!(
            &recipe.related_classes[..],
            [
                RelatedClass {
                    name: "Person".into(),
                    count: 1000
                },
                RelatedClass {
                    name: "ImageObject".into(),
                    count: 12
                },
            ]
        );
        assert_eq!(&*recipe.size, "2.1 GB");
        assert_eq!(
            &*recipe.download_url,
            "https://webdatacommons.org/structureddata/2022-12/schemaorg/data/Recipe/part_0.gz"
        );
        assert_eq!(
            &*recipe.domain_stats_url,
            "https://webdatacommons.org/structureddata/2022-12/stats/pld_stats/Recipe.tsv"
        );
        assert!(classes[1].related_classes.is_empty());
    }

    #[test]
    fn class_rows_without_links_are_rejected() {
        let html = "<table><tr><th>Broken</th><td>Quads: 1<br>URLs: 1<br>Hosts: 1</td>\
                    <td></td><td>1 KB</td><td></td><td></td></tr></table>";
        assert!(matches!(
            parse_class_subsets(html, &page_url()),
            Err(Error::Metadata(_))
        ));
    }

    #[tokio::test]
    async fn domain_stats() {
        let stats = parse_domain_stats(DOMAIN_STATS.as_bytes()).await.unwrap();
        let domains = stats.iter().map(|s| &*s.domain).collect::<Vec<_>>();
        assert_eq!(domains, ["a.com", "b.org", "d.io"]);
        assert_eq!(stats[0].entities, 2);
        assert_eq!(stats[0].quads, 40);
        assert_eq!(stats[0].property_density.get("image"), Some(&0.5));
        assert!(stats[1].property_density.is_empty());
        assert!(stats[2].property_density.is_empty());
    }

    #[tokio::test]
    async fn domain_lookup() {
        let lookup = parse_domain_lookup(DOMAIN_LOOKUP.as_bytes()).await.unwrap();
        assert_eq!(lookup.len(), 2);
        assert_eq!(lookup.get("b.org").map(|f| &**f), Some("part_0.gz"));
    }
}
