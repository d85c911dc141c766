//! Routing of record owners to the domains of a class

use std::collections::HashSet;
use url::{Host, Url};

/// Maps owner URLs to one of a closed set of known domains
///
/// The known domains come from the class statistics, so there is no need
/// for public suffix rules: the longest suffix of a host name that is a
/// known domain is the right answer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DomainRouter {
    /// Known domains, in lowercase
    domains: HashSet<Box<str>>,
}
//
impl DomainRouter {
    /// Set up a router for a set of known domains
    pub fn new<S: AsRef<str>>(domains: impl IntoIterator<Item = S>) -> Self {
        Self {
            domains: domains
                .into_iter()
                .map(|domain| normalize(domain.as_ref()).into())
                .collect(),
        }
    }

    /// Number of known domains
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Truth that no domain is known
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Truth that a domain is one of the known ones
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(normalize(domain).as_str())
    }

    /// Find the known domain that owns some URL
    pub fn route(&self, owner: &str) -> Option<&str> {
        let url = match Url::parse(owner) {
            Ok(url) => url,
            Err(e) => {
                log::debug!("Owner {owner:?} is not a URL: {e}");
                return None;
            }
        };
        match url.host() {
            Some(Host::Domain(host)) => self.route_host(host),
            _ => {
                log::debug!("Owner {owner} has no domain name");
                None
            }
        }
    }

    /// Find the known domain that a host name belongs to
    ///
    /// Suffixes are tried from the longest (the host itself) to the shortest.
    pub fn route_host(&self, host: &str) -> Option<&str> {
        let host = normalize(host);
        let mut candidate = host.as_str();
        loop {
            if let Some(domain) = self.domains.get(candidate) {
                return Some(&**domain);
            }
            candidate = candidate.split_once('.')?.1;
        }
    }
}

/// Lowercase a domain name and drop the root label
fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}
