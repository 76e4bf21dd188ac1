//! Reconciler: diff current against desired state into an [`ActionPlan`].
//!
//! The reconciler applies the identity-type policy and the blast-radius
//! limits:
//!
//! - more missing users than `max_missing_users` aborts with no actions;
//! - at most `max_deletions_per_run` users are removed, lowest keys first,
//!   the rest are deferred to a later run;
//! - dashboard users of an unmanaged identity type are never touched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::mapping::DashboardGroup;
use crate::plan::{Action, ActionKind, ActionPlan, ExistingUserPolicy, PlanCounters, PlanStatus};
use crate::snapshot::{Snapshot, UserFilter, UserState};
use crate::types::{AttributeValue, Attributes, IdentityType, UserKey};

/// Default maximum number of users removed in one run.
const DEFAULT_MAX_DELETIONS_PER_RUN: usize = 10;

/// Default maximum number of missing users before a run is aborted.
const DEFAULT_MAX_MISSING_USERS: usize = 200;

/// Attributes compared when updating existing users.
pub const UPDATABLE_ATTRIBUTES: [&str; 3] = ["email", "firstname", "lastname"];

/// Attributes sent when creating a user.
pub const CREATE_ATTRIBUTES: [&str; 6] = [
    "email",
    "username",
    "domain",
    "firstname",
    "lastname",
    "country",
];

/// Country used for enterprise users created without one.
const UNDEFINED_COUNTRY: &str = "UD";

/// Blast-radius limits, fixed for the duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum number of `RemoveUser` actions emitted per run.
    #[serde(default = "default_max_deletions_per_run")]
    pub max_deletions_per_run: usize,
    /// Abort threshold for users present remotely but absent from the directory.
    #[serde(default = "default_max_missing_users")]
    pub max_missing_users: usize,
}

fn default_max_deletions_per_run() -> usize {
    DEFAULT_MAX_DELETIONS_PER_RUN
}

fn default_max_missing_users() -> usize {
    DEFAULT_MAX_MISSING_USERS
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_deletions_per_run: DEFAULT_MAX_DELETIONS_PER_RUN,
            max_missing_users: DEFAULT_MAX_MISSING_USERS,
        }
    }
}

/// Which users, groups and attributes the reconciler may change.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Identity types that may be created, updated and removed.
    pub managed_identity_types: BTreeSet<IdentityType>,
    /// Dashboard groups memberships may be removed from.
    pub managed_groups: BTreeSet<DashboardGroup>,
    /// Emit group actions at all.
    pub manage_groups: bool,
    /// Emit attribute updates and overwrite on create.
    pub update_user_info: bool,
    /// Username filter and explicit removal list.
    pub filter: UserFilter,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            managed_identity_types: [IdentityType::EnterpriseId, IdentityType::FederatedId]
                .into_iter()
                .collect(),
            managed_groups: BTreeSet::new(),
            manage_groups: true,
            update_user_info: true,
            filter: UserFilter::default(),
        }
    }
}

impl ReconcilePolicy {
    fn is_managed_type(&self, identity_type: IdentityType) -> bool {
        self.managed_identity_types.contains(&identity_type)
    }
}

/// Computes action plans.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    limits: Limits,
    policy: ReconcilePolicy,
}

impl Reconciler {
    #[must_use]
    pub fn new(limits: Limits, policy: ReconcilePolicy) -> Self {
        Self { limits, policy }
    }

    #[must_use]
    pub fn limits(&self) -> Limits {
        self.limits
    }

    #[must_use]
    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Diff `current` (dashboard) against `desired` (directory).
    ///
    /// Refuses incomplete snapshots. Equal inputs always produce equal plans.
    pub fn reconcile(&self, current: &Snapshot, desired: &Snapshot) -> SyncResult<ActionPlan> {
        if !desired.is_complete() {
            return Err(SyncError::IncompleteSnapshot { side: "directory" });
        }
        if !current.is_complete() {
            return Err(SyncError::IncompleteSnapshot { side: "dashboard" });
        }

        let stats = desired.stats();
        let mut counters = PlanCounters {
            skipped_users: stats.skipped_users,
            hook_failures: stats.hook_failures,
            ..PlanCounters::default()
        };

        // Remote users only: candidates for removal, in key order.
        let mut removal_candidates = Vec::new();
        for user in current.iter() {
            if desired.contains(&user.key) {
                continue;
            }
            if !self.policy.is_managed_type(user.identity_type) {
                debug!(user_key = %user.key, "Ignoring user of unmanaged identity type");
                continue;
            }
            if self.policy.filter.is_listed_for_removal(&user.key) {
                removal_candidates.push(user);
                continue;
            }
            if !self.policy.filter.selects_user(&user.key) {
                continue;
            }
            counters.missing_users += 1;
            removal_candidates.push(user);
        }

        let candidate_keys: Vec<UserKey> =
            removal_candidates.iter().map(|u| u.key.clone()).collect();

        if counters.missing_users > self.limits.max_missing_users {
            let reason = format!(
                "missing-user threshold exceeded: {} missing users, limit {}",
                counters.missing_users, self.limits.max_missing_users
            );
            error!(
                severity = "critical",
                missing_users = counters.missing_users,
                max_missing_users = self.limits.max_missing_users,
                "Aborting run: too many users missing from the directory"
            );
            return Ok(ActionPlan::aborted(reason, candidate_keys, counters));
        }

        let mut per_user: BTreeMap<&UserKey, Vec<Action>> = BTreeMap::new();

        for user in desired.iter() {
            let actions = match current.get(&user.key) {
                Some(remote) => self.update_actions(remote, user),
                None => self.create_actions(user, &mut counters),
            };
            if !actions.is_empty() {
                per_user.insert(&user.key, actions);
            }
        }

        let allowed = self.limits.max_deletions_per_run.min(removal_candidates.len());
        for user in &removal_candidates[..allowed] {
            info!(user_key = %user.key, "Removing user");
            per_user.insert(&user.key, self.removal_actions(user));
        }
        counters.deletions_emitted = allowed;
        counters.deferred_deletions = removal_candidates.len() - allowed;

        let status = if counters.deferred_deletions > 0 {
            error!(
                severity = "critical",
                deferred = counters.deferred_deletions,
                emitted = counters.deletions_emitted,
                max_deletions_per_run = self.limits.max_deletions_per_run,
                "Deletion limit reached; remaining removals deferred to a later run"
            );
            PlanStatus::PartiallyLimited(format!(
                "deletion limit reached: {} removals deferred",
                counters.deferred_deletions
            ))
        } else {
            PlanStatus::Completed
        };

        let actions: Vec<Action> = per_user.into_values().flatten().collect();
        let plan = ActionPlan::finalize(actions, candidate_keys, counters, status);

        let summary = plan.summary();
        info!(
            status = %plan.status(),
            create_user = summary.create_user,
            remove_user = summary.remove_user,
            update_attributes = summary.update_attributes,
            add_to_group = summary.add_to_group,
            remove_from_group = summary.remove_from_group,
            missing_users = counters.missing_users,
            skipped_users = counters.skipped_users,
            hook_failures = counters.hook_failures,
            "Reconciliation complete"
        );
        Ok(plan)
    }

    fn create_actions(&self, user: &UserState, counters: &mut PlanCounters) -> Vec<Action> {
        if !self.policy.is_managed_type(user.identity_type) {
            warn!(
                user_key = %user.key,
                identity_type = %user.identity_type,
                "Not creating user of unmanaged identity type"
            );
            return Vec::new();
        }

        let mut attributes: Attributes = CREATE_ATTRIBUTES
            .iter()
            .filter_map(|name| {
                user.attributes
                    .get(*name)
                    .map(|value| ((*name).to_string(), value.clone()))
            })
            .collect();

        if user.attribute("country").is_none() {
            if user.identity_type == IdentityType::EnterpriseId {
                attributes.insert("country".to_string(), UNDEFINED_COUNTRY.into());
            } else {
                error!(
                    user_key = %user.key,
                    identity_type = %user.identity_type,
                    "User has no country and cannot be created"
                );
                counters.skipped_users += 1;
                return Vec::new();
            }
        }

        let on_conflict = if self.policy.update_user_info {
            ExistingUserPolicy::UpdateIfAlreadyExists
        } else {
            ExistingUserPolicy::IgnoreIfAlreadyExists
        };

        let mut actions = vec![Action::new(
            user.key.clone(),
            ActionKind::CreateUser {
                identity_type: user.identity_type,
                attributes,
                on_conflict,
            },
        )];
        if self.policy.manage_groups {
            actions.extend(user.groups.iter().map(|group| {
                Action::new(
                    user.key.clone(),
                    ActionKind::AddToGroup {
                        group: group.clone(),
                    },
                )
            }));
        }
        actions
    }

    /// Managed memberships are released before the account is removed.
    ///
    /// Accessor-organization memberships do not go away with the account, so
    /// they are released even when `manage_groups` is off.
    fn removal_actions(&self, remote: &UserState) -> Vec<Action> {
        let mut actions: Vec<Action> = remote
            .groups
            .iter()
            .filter_map(|group| self.policy.managed_groups.get(group))
            .filter(|managed| self.policy.manage_groups || managed.organization().is_some())
            .map(|managed| {
                Action::new(
                    remote.key.clone(),
                    ActionKind::RemoveFromGroup {
                        group: managed.clone(),
                    },
                )
            })
            .collect();
        actions.push(Action::new(remote.key.clone(), ActionKind::RemoveUser));
        actions
    }

    fn update_actions(&self, remote: &UserState, desired: &UserState) -> Vec<Action> {
        if !self.policy.is_managed_type(remote.identity_type) {
            debug!(user_key = %remote.key, "Ignoring user of unmanaged identity type");
            return Vec::new();
        }

        let mut actions = Vec::new();

        if self.policy.update_user_info {
            let changed = changed_attributes(remote, desired);
            if !changed.is_empty() {
                if remote.identity_type == IdentityType::AdobeId {
                    warn!(
                        user_key = %remote.key,
                        attributes = ?changed.keys().collect::<Vec<_>>(),
                        "Attributes of adobeID users cannot be updated"
                    );
                } else {
                    actions.push(Action::new(
                        remote.key.clone(),
                        ActionKind::UpdateAttributes {
                            attributes: changed,
                        },
                    ));
                }
            }
        }

        if self.policy.manage_groups {
            for group in desired.groups.difference(&remote.groups) {
                actions.push(Action::new(
                    remote.key.clone(),
                    ActionKind::AddToGroup {
                        group: group.clone(),
                    },
                ));
            }
            for group in remote.groups.difference(&desired.groups) {
                // Only groups this configuration manages; manual assignments stay.
                if let Some(managed) = self.policy.managed_groups.get(group) {
                    actions.push(Action::new(
                        remote.key.clone(),
                        ActionKind::RemoveFromGroup {
                            group: managed.clone(),
                        },
                    ));
                }
            }
        }

        actions
    }
}

/// Per-field diff over [`UPDATABLE_ATTRIBUTES`].
///
/// An absent desired value never blanks the remote one.
fn changed_attributes(remote: &UserState, desired: &UserState) -> Attributes {
    UPDATABLE_ATTRIBUTES
        .iter()
        .filter_map(|name| {
            let wanted = desired.attribute(name)?;
            (remote.attribute(name) != Some(wanted))
                .then(|| ((*name).to_string(), AttributeValue::from(wanted)))
        })
        .collect()
}
