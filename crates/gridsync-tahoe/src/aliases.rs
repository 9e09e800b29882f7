//! Alias table (`private/aliases`)
//!
//! One `name: capability` entry per line. `#` comments and lines without a
//! colon are skipped individually.

use crate::capability::Capability;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Parse alias file contents into a name → capability table.
///
/// Names are stored without their trailing colon.
pub fn parse_aliases(contents: &str) -> BTreeMap<String, Capability> {
    contents
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(name, cap)| (name.trim().to_string(), Capability::new(cap)))
        .filter(|(name, cap)| !name.is_empty() && !cap.as_str().is_empty())
        .collect()
}

/// Read the alias file. `None` if it cannot be read.
pub fn read_aliases(path: &Path) -> Option<BTreeMap<String, Capability>> {
    fs::read_to_string(path).ok().map(|c| parse_aliases(&c))
}

/// Look up one alias; a trailing `:` on the query is ignored.
pub fn lookup_alias(path: &Path, alias: &str) -> Option<Capability> {
    let name = alias.strip_suffix(':').unwrap_or(alias);
    read_aliases(path)?.remove(name)
}
