//! Mapping table: directory group to dashboard group rules.
//!
//! Qualified group strings (`org::group`, optionally followed by a
//! `, usergroup` / `, productconfiguration` designation) are parsed and
//! validated once here. Nothing downstream re-parses configuration strings.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::{debug, warn};

use crate::config::MappingRuleConfig;
use crate::error::{SyncError, SyncResult};

/// Separator between accessor organization and group name.
pub const GROUP_NAME_DELIMITER: &str = "::";

/// Separator between a group name and its designation.
pub const DESIGNATION_DELIMITER: char = ',';

/// What kind of dashboard entitlement a group is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// A product configuration (license profile).
    #[default]
    ProductConfiguration,
    /// A plain user group.
    UserGroup,
}

impl GroupKind {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::ProductConfiguration => "productconfiguration",
            GroupKind::UserGroup => "usergroup",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GroupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "productconfiguration" => Ok(GroupKind::ProductConfiguration),
            "usergroup" => Ok(GroupKind::UserGroup),
            _ => Err(format!("Unrecognized designation: {s}")),
        }
    }
}

/// A dashboard group, optionally scoped to an accessor organization.
///
/// `organization == None` means the owning organization. Equality, ordering
/// and hashing use the case-folded organization and name, so `Acrobat` and
/// `acrobat` are the same group; the configured spelling is kept for output.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardGroup {
    organization: Option<String>,
    name: String,
    kind: GroupKind,
    #[serde(skip)]
    key: (Option<String>, String),
}

impl DashboardGroup {
    /// Create a group in the given organization (`None` for the owning one).
    pub fn new(organization: Option<&str>, name: &str, kind: GroupKind) -> Self {
        let organization = organization
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string);
        let name = name.trim().to_string();
        let key = (
            organization.as_ref().map(|o| o.to_lowercase()),
            name.to_lowercase(),
        );
        Self {
            organization,
            name,
            kind,
            key,
        }
    }

    /// Parse a configured group string, including an optional designation.
    ///
    /// The organization qualifier is split on the first `::`. The organization
    /// is not checked against the configured accessors here.
    pub fn parse(qualified: &str) -> Result<Self, String> {
        let (body, kind) = match qualified.split_once(DESIGNATION_DELIMITER) {
            Some((body, designation)) => {
                if designation.contains(DESIGNATION_DELIMITER) {
                    return Err(format!("Too many designations in '{qualified}'"));
                }
                (body, designation.parse::<GroupKind>()?)
            }
            None => (qualified, GroupKind::default()),
        };

        let remote = Self::remote(body);
        if remote.name.is_empty() {
            return Err(format!("Empty group name in '{qualified}'"));
        }
        Ok(Self::new(remote.organization(), remote.name(), kind))
    }

    /// Interpret a group string reported by the dashboard (no designation).
    #[must_use]
    pub fn remote(qualified: &str) -> Self {
        match qualified.split_once(GROUP_NAME_DELIMITER) {
            Some((org, name)) => Self::new(Some(org), name, GroupKind::default()),
            None => Self::new(None, qualified, GroupKind::default()),
        }
    }

    /// Accessor organization, or `None` for the owning organization.
    #[must_use]
    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }

    /// Group name without qualifier.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Designation of the group.
    #[must_use]
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// `org::name` for accessor groups, `name` for owning-organization groups.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.organization {
            Some(org) => format!("{org}{GROUP_NAME_DELIMITER}{}", self.name),
            None => self.name.clone(),
        }
    }
}

impl PartialEq for DashboardGroup {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for DashboardGroup {}

impl Hash for DashboardGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for DashboardGroup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DashboardGroup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for DashboardGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// A resolved mapping rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingRule {
    /// Directory group name, matched exactly.
    pub directory_group: String,
    /// Deduplicated, sorted target groups.
    pub dashboard_groups: BTreeSet<DashboardGroup>,
}

/// Validated, fully resolved mapping configuration.
///
/// Built once at run start and immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    rules: BTreeMap<String, MappingRule>,
    managed_groups: BTreeSet<DashboardGroup>,
    accessor_organizations: BTreeSet<String>,
}

impl MappingTable {
    /// Build and validate the table.
    ///
    /// `extended_groups` are extra dashboard groups a hook may assign; they are
    /// validated like rule targets and become managed groups. Every qualifier
    /// must name one of `accessor_organizations`.
    pub fn build(
        rules: &[MappingRuleConfig],
        extended_groups: &[String],
        accessor_organizations: &BTreeSet<String>,
    ) -> SyncResult<Self> {
        let mut table = Self {
            rules: BTreeMap::new(),
            managed_groups: BTreeSet::new(),
            accessor_organizations: accessor_organizations.clone(),
        };

        for rule in rules {
            let directory_group = rule.directory_group.trim();
            if directory_group.is_empty() {
                return Err(SyncError::malformed_rule(
                    &rule.directory_group,
                    "directory group name is empty",
                ));
            }
            if rule.dashboard_groups.is_empty() {
                warn!(
                    directory_group = %directory_group,
                    "Mapping rule has no dashboard groups"
                );
            }

            let mut targets = BTreeSet::new();
            for qualified in &rule.dashboard_groups {
                let group = DashboardGroup::parse(qualified)
                    .map_err(|message| SyncError::malformed_rule(directory_group, message))?;
                table.check_organization(&group, qualified)?;
                targets.insert(group);
            }

            table.managed_groups.extend(targets.iter().cloned());
            table
                .rules
                .entry(directory_group.to_string())
                .or_insert_with(|| MappingRule {
                    directory_group: directory_group.to_string(),
                    dashboard_groups: BTreeSet::new(),
                })
                .dashboard_groups
                .extend(targets);
        }

        for qualified in extended_groups {
            let group = DashboardGroup::parse(qualified).map_err(|message| {
                SyncError::configuration(format!("Invalid extended dashboard group: {message}"))
            })?;
            table.check_organization(&group, qualified)?;
            table.managed_groups.insert(group);
        }

        debug!(
            rules = table.rules.len(),
            managed_groups = table.managed_groups.len(),
            accessors = table.accessor_organizations.len(),
            "Mapping table built"
        );

        Ok(table)
    }

    fn check_organization(&self, group: &DashboardGroup, qualified: &str) -> SyncResult<()> {
        match group.organization() {
            Some(org)
                if !self
                    .accessor_organizations
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(org)) =>
            {
                Err(SyncError::UnknownOrganization {
                    organization: org.to_string(),
                    group: qualified.trim().to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Rule for a directory group, if configured.
    #[must_use]
    pub fn rule(&self, directory_group: &str) -> Option<&MappingRule> {
        self.rules.get(directory_group)
    }

    /// All rules, ordered by directory group.
    pub fn rules(&self) -> impl Iterator<Item = &MappingRule> {
        self.rules.values()
    }

    /// Directory group names referenced by rules.
    #[must_use]
    pub fn directory_groups(&self) -> BTreeSet<String> {
        self.rules.keys().cloned().collect()
    }

    /// Every dashboard group this configuration manages.
    #[must_use]
    pub fn managed_groups(&self) -> &BTreeSet<DashboardGroup> {
        &self.managed_groups
    }

    /// Whether `group` is managed by this configuration.
    #[must_use]
    pub fn is_managed(&self, group: &DashboardGroup) -> bool {
        self.managed_groups.contains(group)
    }

    /// Resolve a qualified name to the configured group it denotes.
    #[must_use]
    pub fn lookup(&self, qualified: &str) -> Option<&DashboardGroup> {
        let probe = DashboardGroup::parse(qualified).ok()?;
        self.managed_groups.get(&probe)
    }

    /// Configured accessor organization names.
    #[must_use]
    pub fn accessor_organizations(&self) -> &BTreeSet<String> {
        &self.accessor_organizations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accessors(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn rule(directory_group: &str, groups: &[&str]) -> MappingRuleConfig {
        MappingRuleConfig {
            directory_group: directory_group.to_string(),
            dashboard_groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_unqualified_group() {
        let group = DashboardGroup::parse("Acrobat Pro").unwrap();
        assert_eq!(group.organization(), None);
        assert_eq!(group.name(), "Acrobat Pro");
        assert_eq!(group.kind(), GroupKind::ProductConfiguration);
        assert_eq!(group.qualified_name(), "Acrobat Pro");
    }

    #[test]
    fn test_parse_qualified_group_splits_on_first_separator() {
        let group = DashboardGroup::parse("org1::Group A").unwrap();
        assert_eq!(group.organization(), Some("org1"));
        assert_eq!(group.name(), "Group A");

        let group = DashboardGroup::parse("org1::Team::Leads").unwrap();
        assert_eq!(group.organization(), Some("org1"));
        assert_eq!(group.name(), "Team::Leads");
    }

    #[test]
    fn test_parse_designation() {
        let group = DashboardGroup::parse("org1::Designers, usergroup").unwrap();
        assert_eq!(group.kind(), GroupKind::UserGroup);
        assert_eq!(group.name(), "Designers");

        assert!(DashboardGroup::parse("Designers, team").is_err());
        assert!(DashboardGroup::parse("a, usergroup, usergroup").is_err());
        assert!(DashboardGroup::parse("org1::  ").is_err());
    }

    #[test]
    fn test_group_equality_ignores_case_and_kind() {
        let a = DashboardGroup::parse("Org1::Acrobat").unwrap();
        let b = DashboardGroup::parse("org1::ACROBAT, usergroup").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, DashboardGroup::parse("Acrobat").unwrap());
    }

    #[test]
    fn test_build_resolves_qualifiers() {
        let table = MappingTable::build(
            &[rule("Marketing", &["org1::Group A", "Acrobat"])],
            &[],
            &accessors(&["org1"]),
        )
        .unwrap();

        let mapped = table.rule("Marketing").unwrap();
        let names: Vec<String> = mapped
            .dashboard_groups
            .iter()
            .map(DashboardGroup::qualified_name)
            .collect();
        assert_eq!(names, vec!["Acrobat", "org1::Group A"]);
        assert_eq!(table.managed_groups().len(), 2);
    }

    #[test]
    fn test_build_rejects_unknown_organization() {
        let err = MappingTable::build(
            &[rule("Marketing", &["org9::X"])],
            &[],
            &accessors(&["org1"]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SyncError::UnknownOrganization { ref organization, .. } if organization == "org9"
        ));
    }

    #[test]
    fn test_build_accepts_qualifier_in_any_case() {
        let table = MappingTable::build(
            &[rule("Marketing", &["ORG1::Designers, usergroup"])],
            &[],
            &accessors(&["org1"]),
        )
        .unwrap();

        let group = table.lookup("org1::designers").unwrap();
        assert_eq!(group.organization(), Some("ORG1"));
        assert_eq!(group.kind(), GroupKind::UserGroup);
    }

    #[test]
    fn test_build_rejects_malformed_rule() {
        assert!(matches!(
            MappingTable::build(&[rule("  ", &["Acrobat"])], &[], &BTreeSet::new()),
            Err(SyncError::MalformedRule { .. })
        ));
        assert!(matches!(
            MappingTable::build(&[rule("Sales", &["::"])], &[], &BTreeSet::new()),
            Err(SyncError::MalformedRule { .. })
        ));
    }

    #[test]
    fn test_duplicate_rules_are_merged() {
        let table = MappingTable::build(
            &[
                rule("Sales", &["Acrobat", "Photoshop"]),
                rule("Sales", &["acrobat", "Illustrator"]),
            ],
            &[],
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(table.rule("Sales").unwrap().dashboard_groups.len(), 3);
    }

    #[test]
    fn test_extended_groups_are_managed() {
        let table = MappingTable::build(
            &[rule("Sales", &["Acrobat"])],
            &["org1::Contractors".to_string()],
            &accessors(&["org1"]),
        )
        .unwrap();
        assert!(table.lookup("org1::contractors").is_some());
        assert!(table.lookup("Acrobat").is_some());
        assert!(table.lookup("Premiere").is_none());

        let err = MappingTable::build(&[], &["org2::X".to_string()], &accessors(&["org1"]));
        assert!(err.is_err());
    }
}
