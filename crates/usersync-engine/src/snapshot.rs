//! Snapshot model: current (dashboard) and desired (directory) user state.
//!
//! Connectors hand over raw batches. [`Snapshot::from_dashboard`] turns the
//! dashboard batch into the current state; [`DesiredStateBuilder`] turns the
//! directory batch into the desired state by applying the user filters, the
//! group mapper and the hooks.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};
use tracing::{debug, error, info, trace, warn};

use crate::config::FilterConfig;
use crate::error::{SyncError, SyncResult};
use crate::hooks::{HookContext, HookRuntime, HookStorage};
use crate::mapper::GroupMapper;
use crate::mapping::{DashboardGroup, MappingTable};
use crate::types::{AttributeValue, Attributes, IdentityType, UserKey};

fn default_true() -> bool {
    true
}

/// A user as reported by a directory connector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    /// Raw identity type; the configured default applies when absent.
    #[serde(default)]
    pub identity_type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    /// Every other directory attribute, by name.
    #[serde(default)]
    pub attributes: Attributes,
    /// Directory group memberships.
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl DirectoryUser {
    /// Standard identity fields as attributes, skipping empty ones.
    #[must_use]
    pub fn standard_attributes(&self) -> Attributes {
        standard_attributes([
            ("email", self.email.as_deref()),
            ("username", self.username.as_deref()),
            ("domain", self.domain.as_deref()),
            ("firstname", self.firstname.as_deref()),
            ("lastname", self.lastname.as_deref()),
            ("country", self.country.as_deref()),
            ("uid", self.uid.as_deref()),
        ])
    }
}

/// Output of one or more directory connectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryBatch {
    #[serde(default)]
    pub users: Vec<DirectoryUser>,
    /// False when the connector could not read everything.
    #[serde(default = "default_true")]
    pub complete: bool,
}

impl Default for DirectoryBatch {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            complete: true,
        }
    }
}

impl DirectoryBatch {
    /// Append another connector's output.
    pub fn extend(&mut self, other: DirectoryBatch) {
        self.users.extend(other.users);
        self.complete &= other.complete;
    }
}

/// A user as reported by the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardUser {
    #[serde(default)]
    pub identity_type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    /// Qualified dashboard group names (`group` or `org::group`).
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Output of the dashboard collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardBatch {
    #[serde(default)]
    pub users: Vec<DashboardUser>,
    #[serde(default = "default_true")]
    pub complete: bool,
}

impl Default for DashboardBatch {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            complete: true,
        }
    }
}

/// State of one user on one side of the comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserState {
    pub key: UserKey,
    pub identity_type: IdentityType,
    pub attributes: Attributes,
    pub groups: BTreeSet<DashboardGroup>,
}

impl UserState {
    /// Single-valued attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(AttributeValue::first)
    }
}

/// Per-run counters collected while building the desired state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    /// Directory users dropped for invalid identity data.
    pub skipped_users: usize,
    /// Users whose hook failed and fell back to the mapping result.
    pub hook_failures: usize,
}

/// Users by key, plus whether the source was read completely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    users: BTreeMap<UserKey, UserState>,
    complete: bool,
    #[serde(skip)]
    stats: BuildStats,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    /// Empty, complete snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: BTreeMap::new(),
            complete: true,
            stats: BuildStats::default(),
        }
    }

    /// Build the current state from the dashboard's user list.
    ///
    /// Users with an unreadable identity type or key are logged and left out,
    /// which keeps them out of every action. An incomplete batch is refused.
    pub fn from_dashboard(batch: &DashboardBatch, default_type: IdentityType) -> SyncResult<Self> {
        if !batch.complete {
            return Err(SyncError::IncompleteSnapshot { side: "dashboard" });
        }

        let mut snapshot = Self::new();
        for user in &batch.users {
            let identity_type = match user.identity_type.as_deref() {
                Some(raw) if !raw.trim().is_empty() => match raw.parse::<IdentityType>() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(username = ?user.username, error = %e, "Skipping dashboard user");
                        continue;
                    }
                },
                _ => default_type,
            };
            let Some(key) = UserKey::new(
                identity_type,
                user.username.as_deref(),
                user.domain.as_deref(),
                user.email.as_deref(),
            ) else {
                warn!(email = ?user.email, "Skipping dashboard user without a usable key");
                continue;
            };

            let attributes = standard_attributes([
                ("email", user.email.as_deref()),
                ("username", user.username.as_deref()),
                ("domain", user.domain.as_deref()),
                ("firstname", user.firstname.as_deref()),
                ("lastname", user.lastname.as_deref()),
                ("country", user.country.as_deref()),
            ]);
            let groups = user
                .groups
                .iter()
                .filter(|g| !g.trim().is_empty())
                .map(|g| DashboardGroup::remote(g))
                .collect();

            snapshot.insert(UserState {
                key,
                identity_type,
                attributes,
                groups,
            });
        }

        debug!(users = snapshot.len(), "Dashboard snapshot loaded");
        Ok(snapshot)
    }

    /// Add a user, merging with an existing entry of the same key.
    ///
    /// Groups are united; attributes already present are kept.
    pub fn insert(&mut self, state: UserState) {
        match self.users.entry(state.key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(state);
            }
            Entry::Occupied(mut entry) => {
                trace!(user_key = %state.key, "Merging duplicate user");
                let existing = entry.get_mut();
                existing.groups.extend(state.groups);
                for (name, value) in state.attributes {
                    existing.attributes.entry(name).or_insert(value);
                }
            }
        }
    }

    /// Merge another snapshot into this one.
    pub fn merge(&mut self, other: Snapshot) {
        self.complete &= other.complete;
        self.stats.skipped_users += other.stats.skipped_users;
        self.stats.hook_failures += other.stats.hook_failures;
        for state in other.users.into_values() {
            self.insert(state);
        }
    }

    #[must_use]
    pub fn get(&self, key: &UserKey) -> Option<&UserState> {
        self.users.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &UserKey) -> bool {
        self.users.contains_key(key)
    }

    /// Users in key order.
    pub fn iter(&self) -> impl Iterator<Item = &UserState> {
        self.users.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Whether the underlying source was read completely.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Mark the snapshot as built from partial data.
    pub fn mark_incomplete(&mut self) {
        self.complete = false;
    }

    /// Counters gathered while building this snapshot.
    #[must_use]
    pub fn stats(&self) -> BuildStats {
        self.stats
    }
}

fn standard_attributes<'a>(
    fields: impl IntoIterator<Item = (&'static str, Option<&'a str>)>,
) -> Attributes {
    fields
        .into_iter()
        .filter_map(|(name, value)| {
            let value = value?.trim();
            (!value.is_empty()).then(|| (name.to_string(), AttributeValue::from(value)))
        })
        .collect()
}

/// Compiled user selection rules.
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    directory_groups: Option<BTreeSet<String>>,
    username: Option<Regex>,
    remove_keys: BTreeSet<UserKey>,
}

impl UserFilter {
    /// Compile the configured filters.
    pub fn from_config(config: &FilterConfig) -> SyncResult<Self> {
        let username = config
            .username_filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| SyncError::configuration(format!("Invalid username_filter: {e}")))?;
        let remove_keys = config
            .remove_user_keys
            .iter()
            .map(|k| UserKey::parse(k))
            .collect::<SyncResult<_>>()?;
        Ok(Self {
            directory_groups: config
                .directory_group_filter
                .as_ref()
                .map(|groups| groups.iter().map(|g| g.trim().to_string()).collect()),
            username,
            remove_keys,
        })
    }

    /// Whether a directory user with these groups is selected.
    #[must_use]
    pub fn selects_groups(&self, groups: &BTreeSet<String>) -> bool {
        match &self.directory_groups {
            Some(filter) => groups.iter().any(|g| filter.contains(g)),
            None => true,
        }
    }

    /// Whether a user key is in scope for this run.
    #[must_use]
    pub fn selects_user(&self, key: &UserKey) -> bool {
        self.username
            .as_ref()
            .map_or(true, |re| re.is_match(key.username()))
    }

    /// Whether the key was listed for removal.
    #[must_use]
    pub fn is_listed_for_removal(&self, key: &UserKey) -> bool {
        self.remove_keys.contains(key)
    }

    /// Keys listed for removal.
    #[must_use]
    pub fn remove_keys(&self) -> &BTreeSet<UserKey> {
        &self.remove_keys
    }
}

/// Builds the desired snapshot from directory data.
pub struct DesiredStateBuilder<'a> {
    table: &'a MappingTable,
    hooks: &'a HookRuntime,
    filter: &'a UserFilter,
    default_identity_type: IdentityType,
    default_country: Option<String>,
    extended_attributes: BTreeSet<String>,
}

impl<'a> DesiredStateBuilder<'a> {
    pub fn new(table: &'a MappingTable, hooks: &'a HookRuntime, filter: &'a UserFilter) -> Self {
        Self {
            table,
            hooks,
            filter,
            default_identity_type: IdentityType::EnterpriseId,
            default_country: None,
            extended_attributes: hooks.extended_attributes(),
        }
    }

    /// Identity type for users that do not state one.
    #[must_use]
    pub fn with_default_identity_type(mut self, identity_type: IdentityType) -> Self {
        self.default_identity_type = identity_type;
        self
    }

    /// Country for users whose directory entry has none.
    #[must_use]
    pub fn with_default_country(mut self, country: Option<String>) -> Self {
        self.default_country = country;
        self
    }

    /// Compute the desired state of every selected directory user.
    ///
    /// Users are processed in key order so hook storage accumulates
    /// deterministically.
    pub fn build(&self, batch: &DirectoryBatch, storage: &mut HookStorage) -> SyncResult<Snapshot> {
        if !batch.complete {
            return Err(SyncError::IncompleteSnapshot { side: "directory" });
        }

        let mut snapshot = Snapshot::new();
        let mut selected: BTreeMap<UserKey, (IdentityType, &DirectoryUser)> = BTreeMap::new();

        for user in &batch.users {
            let identity_type = match user.identity_type.as_deref() {
                Some(raw) if !raw.trim().is_empty() => match raw.parse::<IdentityType>() {
                    Ok(t) => t,
                    Err(e) => {
                        error!(username = ?user.username, error = %e, "Skipping directory user");
                        snapshot.stats.skipped_users += 1;
                        continue;
                    }
                },
                _ => self.default_identity_type,
            };
            let Some(key) = UserKey::new(
                identity_type,
                user.username.as_deref(),
                user.domain.as_deref(),
                user.email.as_deref(),
            ) else {
                error!(
                    username = ?user.username,
                    email = ?user.email,
                    "Skipping directory user: no username or domain"
                );
                snapshot.stats.skipped_users += 1;
                continue;
            };

            if !self.filter.selects_groups(&user.groups) {
                trace!(user_key = %key, "Not in directory group filter");
                continue;
            }
            if !self.filter.selects_user(&key) {
                trace!(user_key = %key, "Username does not match filter");
                continue;
            }
            if self.filter.is_listed_for_removal(&key) {
                info!(user_key = %key, "User is listed for removal; excluded from desired state");
                continue;
            }

            match selected.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert((identity_type, user));
                }
                Entry::Occupied(entry) => {
                    warn!(user_key = %entry.key(), "Duplicate directory user; keeping the first");
                }
            }
        }

        let mapper = GroupMapper::new(self.table);
        for (key, (identity_type, user)) in selected {
            let state = self.desired_user(&mapper, key, identity_type, user, storage, &mut snapshot.stats);
            snapshot.insert(state);
        }

        info!(
            users = snapshot.len(),
            skipped = snapshot.stats.skipped_users,
            hook_failures = snapshot.stats.hook_failures,
            "Desired state built"
        );
        Ok(snapshot)
    }

    fn desired_user(
        &self,
        mapper: &GroupMapper<'_>,
        key: UserKey,
        identity_type: IdentityType,
        user: &DirectoryUser,
        storage: &mut HookStorage,
        stats: &mut BuildStats,
    ) -> UserState {
        let mut source_attributes = user.attributes.clone();
        for (name, value) in user.standard_attributes() {
            source_attributes.entry(name).or_insert(value);
        }

        let mut target_attributes = user.standard_attributes();
        // Key components are normalized; send the normalized form.
        let (_, username, domain) = key.parts();
        target_attributes.insert("username".to_string(), username.into());
        if domain.is_empty() {
            target_attributes.remove("domain");
        } else {
            target_attributes.insert("domain".to_string(), domain.into());
        }
        if !target_attributes.contains_key("country") {
            if let Some(country) = &self.default_country {
                target_attributes.insert("country".to_string(), country.as_str().into());
            }
        }
        for name in &self.extended_attributes {
            if let Some(value) = source_attributes.get(name) {
                target_attributes.insert(name.clone(), value.clone());
            }
        }

        let mapped = mapper.resolve(&user.groups);
        trace!(
            user_key = %key,
            directory_groups = ?user.groups,
            dashboard_groups = ?mapped.iter().map(DashboardGroup::qualified_name).collect::<Vec<_>>(),
            "Groups mapped"
        );

        let context = HookContext {
            user_key: Some(key.clone()),
            source_attributes,
            source_groups: user.groups.clone(),
            target_attributes,
            target_groups: mapped.iter().map(DashboardGroup::qualified_name).collect(),
        };
        let run = self.hooks.run(context, storage);
        if run.failed {
            stats.hook_failures += 1;
        }

        let mut groups = BTreeSet::new();
        for name in &run.target_groups {
            match self.table.lookup(name) {
                Some(group) => {
                    groups.insert(group.clone());
                }
                None => error!(
                    user_key = %key,
                    group = %name,
                    "Target dashboard group is not known; ignored"
                ),
            }
        }

        UserState {
            key,
            identity_type,
            attributes: run.target_attributes,
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingRuleConfig;
    use crate::hooks::HookDefinition;
    use crate::rhai_executor::RhaiExecutorConfig;

    fn table() -> MappingTable {
        let rules = vec![MappingRuleConfig {
            directory_group: "Marketing".to_string(),
            dashboard_groups: vec!["Acrobat".to_string(), "org1::Group A".to_string()],
        }];
        let accessors = ["org1".to_string()].into_iter().collect();
        MappingTable::build(&rules, &[], &accessors).unwrap()
    }

    fn directory_user(username: &str, groups: &[&str]) -> DirectoryUser {
        DirectoryUser {
            username: Some(username.to_string()),
            email: Some(username.to_string()),
            firstname: Some("Test".to_string()),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        }
    }

    fn batch(users: Vec<DirectoryUser>) -> DirectoryBatch {
        DirectoryBatch {
            users,
            complete: true,
        }
    }

    #[test]
    fn test_from_dashboard_parses_users() {
        let batch = DashboardBatch {
            users: vec![DashboardUser {
                identity_type: Some("federatedID".to_string()),
                username: Some("Jane@Example.com".to_string()),
                email: Some("jane@example.com".to_string()),
                groups: vec!["Acrobat".to_string(), "org1::Group A".to_string()],
                ..Default::default()
            }],
            complete: true,
        };
        let snapshot = Snapshot::from_dashboard(&batch, IdentityType::EnterpriseId).unwrap();
        let key = UserKey::parse("federatedID,jane@example.com,").unwrap();
        let user = snapshot.get(&key).unwrap();
        assert_eq!(user.groups.len(), 2);
        assert_eq!(user.attribute("email"), Some("jane@example.com"));
    }

    #[test]
    fn test_from_dashboard_refuses_incomplete_batch() {
        let batch = DashboardBatch {
            users: vec![],
            complete: false,
        };
        assert!(matches!(
            Snapshot::from_dashboard(&batch, IdentityType::EnterpriseId),
            Err(SyncError::IncompleteSnapshot { side: "dashboard" })
        ));
    }

    #[test]
    fn test_from_dashboard_skips_unknown_type() {
        let batch = DashboardBatch {
            users: vec![DashboardUser {
                identity_type: Some("serviceAccount".to_string()),
                email: Some("svc@example.com".to_string()),
                ..Default::default()
            }],
            complete: true,
        };
        let snapshot = Snapshot::from_dashboard(&batch, IdentityType::EnterpriseId).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_merge_unites_groups_and_completeness() {
        let key = UserKey::parse("enterpriseID,a@example.com,").unwrap();
        let mut first = Snapshot::new();
        first.insert(UserState {
            key: key.clone(),
            identity_type: IdentityType::EnterpriseId,
            attributes: Attributes::new(),
            groups: [DashboardGroup::remote("Acrobat")].into_iter().collect(),
        });
        let mut second = Snapshot::new();
        second.mark_incomplete();
        second.insert(UserState {
            key: key.clone(),
            identity_type: IdentityType::EnterpriseId,
            attributes: Attributes::new(),
            groups: [DashboardGroup::remote("Photoshop")].into_iter().collect(),
        });

        first.merge(second);
        assert_eq!(first.get(&key).unwrap().groups.len(), 2);
        assert!(!first.is_complete());
    }

    #[test]
    fn test_build_maps_groups_and_defaults_country() {
        let table = table();
        let hooks = HookRuntime::new();
        let filter = UserFilter::default();
        let builder = DesiredStateBuilder::new(&table, &hooks, &filter)
            .with_default_country(Some("US".to_string()));

        let snapshot = builder
            .build(
                &batch(vec![directory_user("a@example.com", &["Marketing", "Other"])]),
                &mut HookStorage::new(),
            )
            .unwrap();

        let key = UserKey::parse("enterpriseID,a@example.com,").unwrap();
        let user = snapshot.get(&key).unwrap();
        let groups: Vec<String> = user.groups.iter().map(DashboardGroup::qualified_name).collect();
        assert_eq!(groups, vec!["Acrobat", "org1::Group A"]);
        assert_eq!(user.attribute("country"), Some("US"));
        assert_eq!(user.attribute("firstname"), Some("Test"));
    }

    #[test]
    fn test_build_applies_filters() {
        let table = table();
        let hooks = HookRuntime::new();
        let filter = UserFilter::from_config(&FilterConfig {
            directory_group_filter: Some(vec!["Marketing".to_string()]),
            username_filter: Some("^[ab]".to_string()),
            remove_user_keys: vec!["enterpriseID,b@example.com,".to_string()],
        })
        .unwrap();
        let builder = DesiredStateBuilder::new(&table, &hooks, &filter);

        let snapshot = builder
            .build(
                &batch(vec![
                    directory_user("a@example.com", &["Marketing"]),
                    directory_user("b@example.com", &["Marketing"]),
                    directory_user("c@example.com", &["Marketing"]),
                    directory_user("ab@example.com", &["Finance"]),
                ]),
                &mut HookStorage::new(),
            )
            .unwrap();

        let keys: Vec<&str> = snapshot.iter().map(|u| u.key.as_str()).collect();
        assert_eq!(keys, vec!["enterpriseID,a@example.com,"]);
    }

    #[test]
    fn test_build_counts_skipped_users() {
        let table = table();
        let hooks = HookRuntime::new();
        let filter = UserFilter::default();
        let builder = DesiredStateBuilder::new(&table, &hooks, &filter);

        let mut no_domain = directory_user("jdoe", &["Marketing"]);
        no_domain.email = None;
        let mut bad_type = directory_user("x@example.com", &[]);
        bad_type.identity_type = Some("ldapID".to_string());

        let snapshot = builder
            .build(&batch(vec![no_domain, bad_type]), &mut HookStorage::new())
            .unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.stats().skipped_users, 2);
    }

    #[test]
    fn test_build_refuses_incomplete_batch() {
        let table = table();
        let hooks = HookRuntime::new();
        let filter = UserFilter::default();
        let builder = DesiredStateBuilder::new(&table, &hooks, &filter);
        let batch = DirectoryBatch {
            users: vec![],
            complete: false,
        };
        assert!(matches!(
            builder.build(&batch, &mut HookStorage::new()),
            Err(SyncError::IncompleteSnapshot { side: "directory" })
        ));
    }

    #[test]
    fn test_build_runs_hook_with_extended_attribute() {
        let table = table();
        let mut hook = HookDefinition::per_user(
            r#"
            let bc = source_attributes["bc"];
            if type_of(bc) == "string" {
                target_attributes["country"] = bc.sub_string(0, 2);
            }
            target_groups.push("Unknown Group");
            "#,
        );
        hook.extended_attributes = vec!["bc".to_string()];
        let hooks = HookRuntime::compile(&[hook], &RhaiExecutorConfig::default()).unwrap();
        let filter = UserFilter::default();
        let builder = DesiredStateBuilder::new(&table, &hooks, &filter);

        let mut user = directory_user("a@example.com", &["Marketing"]);
        user.attributes.insert("bc".to_string(), "FR-77".into());

        let snapshot = builder
            .build(&batch(vec![user]), &mut HookStorage::new())
            .unwrap();
        let state = snapshot.iter().next().unwrap();
        assert_eq!(state.attribute("country"), Some("FR"));
        assert_eq!(state.attribute("bc"), Some("FR-77"));
        // Unknown hook group dropped; mapped groups kept.
        assert_eq!(state.groups.len(), 2);
        assert_eq!(snapshot.stats().hook_failures, 0);
    }
}
