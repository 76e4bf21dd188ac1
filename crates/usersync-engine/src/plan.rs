//! Action plan: the finalized output handed to the dashboard collaborator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::mapping::DashboardGroup;
use crate::types::{Attributes, IdentityType, UserKey};

/// What `CreateUser` does when the account already exists remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingUserPolicy {
    UpdateIfAlreadyExists,
    IgnoreIfAlreadyExists,
}

/// The operation of an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    CreateUser {
        identity_type: IdentityType,
        attributes: Attributes,
        on_conflict: ExistingUserPolicy,
    },
    RemoveUser,
    UpdateAttributes {
        attributes: Attributes,
    },
    AddToGroup {
        group: DashboardGroup,
    },
    RemoveFromGroup {
        group: DashboardGroup,
    },
}

impl ActionKind {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateUser { .. } => "create_user",
            ActionKind::RemoveUser => "remove_user",
            ActionKind::UpdateAttributes { .. } => "update_attributes",
            ActionKind::AddToGroup { .. } => "add_to_group",
            ActionKind::RemoveFromGroup { .. } => "remove_from_group",
        }
    }

    /// Dashboard group touched by this action, if any.
    #[must_use]
    pub fn group(&self) -> Option<&DashboardGroup> {
        match self {
            ActionKind::AddToGroup { group } | ActionKind::RemoveFromGroup { group } => Some(group),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One mutating operation against one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub user_key: UserKey,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl Action {
    pub fn new(user_key: UserKey, kind: ActionKind) -> Self {
        Self { user_key, kind }
    }
}

/// Terminal status of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PlanStatus {
    /// Every computed action was emitted.
    Completed,
    /// Nothing was emitted.
    Aborted(String),
    /// Emitted, but some deletions were deferred by the deletion limit.
    PartiallyLimited(String),
}

impl PlanStatus {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Completed => "completed",
            PlanStatus::Aborted(_) => "aborted",
            PlanStatus::PartiallyLimited(_) => "partially_limited",
        }
    }

    /// Reason for a non-completed status.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            PlanStatus::Completed => None,
            PlanStatus::Aborted(reason) | PlanStatus::PartiallyLimited(reason) => Some(reason),
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{} ({reason})", self.as_str()),
            None => write!(f, "{}", self.as_str()),
        }
    }
}

/// Run-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCounters {
    /// Managed-type dashboard users the directory no longer reports.
    pub missing_users: usize,
    /// `RemoveUser` actions emitted.
    pub deletions_emitted: usize,
    /// Removals held back by the deletion limit.
    pub deferred_deletions: usize,
    /// Users dropped for invalid identity data.
    pub skipped_users: usize,
    /// Users whose hook failed.
    pub hook_failures: usize,
}

/// Number of emitted actions per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create_user: usize,
    pub remove_user: usize,
    pub update_attributes: usize,
    pub add_to_group: usize,
    pub remove_from_group: usize,
}

impl PlanSummary {
    fn record(&mut self, kind: &ActionKind) {
        match kind {
            ActionKind::CreateUser { .. } => self.create_user += 1,
            ActionKind::RemoveUser => self.remove_user += 1,
            ActionKind::UpdateAttributes { .. } => self.update_attributes += 1,
            ActionKind::AddToGroup { .. } => self.add_to_group += 1,
            ActionKind::RemoveFromGroup { .. } => self.remove_from_group += 1,
        }
    }

    /// Total number of actions.
    #[must_use]
    pub fn total(&self) -> usize {
        self.create_user
            + self.remove_user
            + self.update_attributes
            + self.add_to_group
            + self.remove_from_group
    }
}

/// Finalized, immutable reconciliation output.
///
/// Actions are grouped per user and users appear in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionPlan {
    #[serde(flatten)]
    status: PlanStatus,
    counters: PlanCounters,
    summary: PlanSummary,
    removal_candidates: Vec<UserKey>,
    actions: Vec<Action>,
}

impl ActionPlan {
    pub(crate) fn finalize(
        actions: Vec<Action>,
        removal_candidates: Vec<UserKey>,
        counters: PlanCounters,
        status: PlanStatus,
    ) -> Self {
        let mut summary = PlanSummary::default();
        for action in &actions {
            summary.record(&action.kind);
        }
        Self {
            status,
            counters,
            summary,
            removal_candidates,
            actions,
        }
    }

    pub(crate) fn aborted(
        reason: impl Into<String>,
        removal_candidates: Vec<UserKey>,
        counters: PlanCounters,
    ) -> Self {
        Self::finalize(
            Vec::new(),
            removal_candidates,
            counters,
            PlanStatus::Aborted(reason.into()),
        )
    }

    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    #[must_use]
    pub fn status(&self) -> &PlanStatus {
        &self.status
    }

    #[must_use]
    pub fn counters(&self) -> &PlanCounters {
        &self.counters
    }

    /// Counts per action kind.
    #[must_use]
    pub fn summary(&self) -> &PlanSummary {
        &self.summary
    }

    /// Every user that qualified for removal this run, including deferred ones.
    #[must_use]
    pub fn removal_candidates(&self) -> &[UserKey] {
        &self.removal_candidates
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, PlanStatus::Aborted(_))
    }
}

/// Result of one action reported by the dashboard collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub user_key: UserKey,
    pub action: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of handing a plan to the dashboard collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// False when the plan was aborted and nothing was sent.
    pub executed: bool,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<ActionOutcome>,
}

impl ExecutionReport {
    pub(crate) fn from_outcomes(
        started_at: DateTime<Utc>,
        executed: bool,
        outcomes: Vec<ActionOutcome>,
    ) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        Self {
            started_at,
            completed_at: Utc::now(),
            executed,
            succeeded,
            failed: outcomes.len() - succeeded,
            outcomes,
        }
    }

    /// Whether every sent action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> UserKey {
        UserKey::parse(&format!("federatedID,{name}@example.com,")).unwrap()
    }

    #[test]
    fn test_summary_counts_kinds() {
        let plan = ActionPlan::finalize(
            vec![
                Action::new(
                    key("a"),
                    ActionKind::CreateUser {
                        identity_type: IdentityType::FederatedId,
                        attributes: Attributes::new(),
                        on_conflict: ExistingUserPolicy::UpdateIfAlreadyExists,
                    },
                ),
                Action::new(
                    key("a"),
                    ActionKind::AddToGroup {
                        group: DashboardGroup::remote("Acrobat"),
                    },
                ),
                Action::new(key("b"), ActionKind::RemoveUser),
            ],
            vec![key("b")],
            PlanCounters::default(),
            PlanStatus::Completed,
        );
        assert_eq!(plan.summary().create_user, 1);
        assert_eq!(plan.summary().add_to_group, 1);
        assert_eq!(plan.summary().remove_user, 1);
        assert_eq!(plan.summary().total(), 3);
        assert_eq!(plan.removal_candidates(), &[key("b")]);
    }

    #[test]
    fn test_aborted_plan_is_empty() {
        let plan = ActionPlan::aborted("too many", vec![], PlanCounters::default());
        assert!(plan.is_empty());
        assert!(plan.is_aborted());
        assert_eq!(plan.status().to_string(), "aborted (too many)");
    }

    #[test]
    fn test_action_serialization() {
        let action = Action::new(
            key("a"),
            ActionKind::RemoveFromGroup {
                group: DashboardGroup::parse("org1::Designers, usergroup").unwrap(),
            },
        );
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "remove_from_group");
        assert_eq!(json["user_key"], "federatedID,a@example.com,");
        assert_eq!(json["group"]["organization"], "org1");
        assert_eq!(json["group"]["kind"], "usergroup");
    }

    #[test]
    fn test_plan_serialization_has_status() {
        let plan = ActionPlan::finalize(
            vec![],
            vec![],
            PlanCounters::default(),
            PlanStatus::PartiallyLimited("5 deferred".to_string()),
        );
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["status"], "partially_limited");
        assert_eq!(json["reason"], "5 deferred");
    }

    #[test]
    fn test_execution_report_counts() {
        let report = ExecutionReport::from_outcomes(
            Utc::now(),
            true,
            vec![
                ActionOutcome {
                    user_key: key("a"),
                    action: "remove_user",
                    success: true,
                    error: None,
                },
                ActionOutcome {
                    user_key: key("b"),
                    action: "remove_user",
                    success: false,
                    error: Some("503".to_string()),
                },
            ],
        );
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.is_success());
    }
}
