//! Group mapper: directory groups to dashboard groups.

use std::collections::BTreeSet;
use tracing::trace;

use crate::mapping::{DashboardGroup, MappingTable};

/// Resolves a user's directory groups through a [`MappingTable`].
#[derive(Debug, Clone, Copy)]
pub struct GroupMapper<'a> {
    table: &'a MappingTable,
}

impl<'a> GroupMapper<'a> {
    /// Create a mapper over a validated table.
    #[must_use]
    pub fn new(table: &'a MappingTable) -> Self {
        Self { table }
    }

    /// Union of the target groups of every rule matching one of `directory_groups`.
    ///
    /// Unmatched directory groups are ignored. The result is sorted, so equal
    /// inputs always serialize identically.
    #[must_use]
    pub fn resolve(&self, directory_groups: &BTreeSet<String>) -> BTreeSet<DashboardGroup> {
        let mut resolved = BTreeSet::new();
        for directory_group in directory_groups {
            match self.table.rule(directory_group) {
                Some(rule) => resolved.extend(rule.dashboard_groups.iter().cloned()),
                None => trace!(directory_group = %directory_group, "No mapping rule"),
            }
        }
        resolved
    }
}
