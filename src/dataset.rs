//! In-memory collections of parsed records

use crate::{
    records::{self, Record},
    Result,
};
use futures::{Stream, TryStreamExt};
use std::collections::BTreeMap;

/// Unordered collection of records, e.g. those of one domain of a class
///
/// Records are kept in the order where they were read, which for a domain
/// shard is the order of the source file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dataset(Vec<Record>);
//
impl Dataset {
    /// Collect a record stream
    pub async fn from_stream(records: impl Stream<Item = Result<Record>>) -> Result<Self> {
        Ok(Self(records.try_collect().await?))
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Truth that there are no records
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over records
    pub fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        self.0.iter()
    }

    /// Group records by owning page
    ///
    /// Records whose owner is not an IRI belong to no page and are left out.
    pub fn pages(&self) -> BTreeMap<Box<str>, Dataset> {
        let mut pages = BTreeMap::<Box<str>, Dataset>::new();
        for record in &self.0 {
            let Some(owner) = records::owner(record) else {
                log::trace!("Record {record} has no owning page");
                continue;
            };
            match pages.get_mut(owner) {
                Some(page) => page.0.push(record.clone()),
                None => {
                    pages.insert(owner.into(), Dataset(vec![record.clone()]));
                }
            }
        }
        pages
    }
}
//
impl FromIterator<Record> for Dataset {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
//
impl IntoIterator for Dataset {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
//
impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pages_group_records_by_owner() {
        let text = "\
<http://a.example/s1> <http://schema.org/name> \"one\" <http://a.example/p1> .
<http://a.example/s2> <http://schema.org/name> \"two\" <http://a.example/p2> .
<http://a.example/s3> <http://schema.org/name> \"three\" <http://a.example/p1> .
<http://a.example/s4> <http://schema.org/name> \"four\" _:nowhere .
";
        let dataset = Dataset::from_stream(records::parse(text.as_bytes()))
            .await
            .unwrap();
        assert_eq!(dataset.len(), 4);

        let pages = dataset.pages();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages["http://a.example/p1"].len(), 2);
        assert_eq!(pages["http://a.example/p2"].len(), 1);
        assert_eq!(
            pages.values().map(Dataset::len).sum::<usize>(),
            dataset.len() - 1
        );
    }
}
