//! # Dependency graph ordering
//!
//! Orders a batch of dependencies so that every dependency comes after the
//! dependencies it imports. Imports may also point at symbols that are
//! already installed. Among dependencies that become ready together the order
//! is unspecified.

use std::collections::BTreeSet;

use crate::dependency::Dependency;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Dependencies whose imports can never be satisfied, with the missing
    /// targets of each.
    Unresolved(Vec<(String, Vec<String>)>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved(entries) => {
                write!(f, "unresolved dependencies:")?;
                for (i, (name, missing)) in entries.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{}{} (missing {})", sep, name, missing.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Orders `pending` against the set of already `installed` names.
///
/// Repeatedly selects every pending dependency whose imports are all either
/// installed or already selected, until no more progress is possible.
pub fn order(installed: &BTreeSet<String>, pending: Vec<Dependency>) -> Result<Vec<Dependency>> {
    let mut available: BTreeSet<String> = installed.clone();
    let mut remaining = pending;
    let mut ordered = Vec::with_capacity(remaining.len());

    loop {
        let (ready, blocked): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|dep| dep.targets().all(|t| available.contains(t)));

        remaining = blocked;
        if ready.is_empty() {
            break;
        }
        for dep in ready {
            available.insert(dep.name.clone());
            ordered.push(dep);
        }
    }

    if remaining.is_empty() {
        return Ok(ordered);
    }

    let unresolved = remaining
        .iter()
        .map(|dep| {
            let missing: BTreeSet<String> = dep
                .targets()
                .filter(|t| !available.contains(*t))
                .map(str::to_string)
                .collect();
            (dep.name.clone(), missing.into_iter().collect())
        })
        .collect();
    Err(Error::Unresolved(unresolved))
}
