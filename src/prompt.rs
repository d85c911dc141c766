//! Interactive selection of classes and domains

use anyhow::Context;
use dialoguer::FuzzySelect;
use std::io::IsTerminal;
use webdatacommons::{corpus::DomainSubset, metadata::ClassSubset, Corpus};

/// Resolve the class named on the command line, or ask the user to pick one
pub fn class<'corpus>(corpus: &'corpus Corpus, name: Option<&str>) -> crate::Result<&'corpus ClassSubset> {
    if let Some(name) = name {
        return Ok(corpus.class(name)?);
    }
    ensure_interactive("--class")?;
    let classes = corpus.classes();
    let class_names = classes
        .iter()
        .map(|class| format!("{} ({} records)", class.name, class.general_stats.quads))
        .collect::<Vec<_>>();
    let class_idx = FuzzySelect::new()
        .with_prompt("Which class should I use?")
        .items(&class_names)
        .default(0)
        .max_length(usize::MAX)
        .interact()?;
    Ok(&classes[class_idx])
}

/// Resolve the domain named on the command line, or ask the user to pick one
pub fn domain(domains: &[DomainSubset], name: Option<&str>) -> crate::Result<Box<str>> {
    if let Some(name) = name {
        return Ok(name.into());
    }
    ensure_interactive("--pay-level-domain")?;
    anyhow::ensure!(!domains.is_empty(), "this class has no known domain");
    let domain_names = domains
        .iter()
        .map(|subset| format!("{} ({} records)", subset.domain, subset.stats.quads))
        .collect::<Vec<_>>();
    let domain_idx = FuzzySelect::new()
        .with_prompt("Which domain should I use?")
        .items(&domain_names)
        .default(0)
        .max_length(usize::MAX)
        .interact()?;
    Ok(domains[domain_idx].domain.clone())
}

/// Fail with a helpful message if nobody can answer a prompt
fn ensure_interactive(flag: &str) -> crate::Result<()> {
    std::io::stdin()
        .is_terminal()
        .then_some(())
        .with_context(|| format!("{flag} must be specified when not running in a terminal"))
}
