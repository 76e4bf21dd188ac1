//! Sync engine: one run from raw batches to a finalized plan.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::connector::{acquire_snapshots, DashboardConnector, DirectoryConnector};
use crate::error::SyncResult;
use crate::hooks::{HookRuntime, HookStorage};
use crate::mapping::MappingTable;
use crate::plan::{ActionOutcome, ActionPlan, ExecutionReport};
use crate::reconciler::{ReconcilePolicy, Reconciler};
use crate::snapshot::{DashboardBatch, DesiredStateBuilder, DirectoryBatch, Snapshot, UserFilter};

/// A configured, validated engine. Reusable across runs.
pub struct SyncEngine {
    config: SyncConfig,
    table: MappingTable,
    hooks: HookRuntime,
    filter: UserFilter,
    reconciler: Reconciler,
}

impl SyncEngine {
    /// Validate the configuration, build the mapping table and compile hooks.
    ///
    /// Every configuration error surfaces here, before any user is processed.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let hooks = HookRuntime::compile(&config.hooks, &config.hook_sandbox)?;
        Self::with_hooks(config, hooks)
    }

    /// Like [`SyncEngine::new`], with a caller-supplied hook runtime.
    ///
    /// `config.hooks` still contributes extended dashboard groups.
    pub fn with_hooks(config: SyncConfig, hooks: HookRuntime) -> SyncResult<Self> {
        config.validate()?;

        let extended_groups: Vec<String> = config
            .hooks
            .iter()
            .flat_map(|h| h.extended_dashboard_groups.iter().cloned())
            .collect();
        let table = MappingTable::build(&config.mappings, &extended_groups, &config.accessor_set())?;
        let filter = UserFilter::from_config(&config.filters)?;

        let policy = ReconcilePolicy {
            managed_identity_types: config.identity.managed_identity_types.clone(),
            managed_groups: table.managed_groups().clone(),
            manage_groups: config.manage_groups,
            update_user_info: config.update_user_info,
            filter: filter.clone(),
        };
        let reconciler = Reconciler::new(config.limits, policy);

        info!(
            rules = table.rules().count(),
            managed_groups = table.managed_groups().len(),
            hooks = config.hooks.len(),
            max_deletions_per_run = config.limits.max_deletions_per_run,
            max_missing_users = config.limits.max_missing_users,
            "Sync engine configured"
        );

        Ok(Self {
            config,
            table,
            hooks,
            filter,
            reconciler,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn mapping_table(&self) -> &MappingTable {
        &self.table
    }

    /// Compute the plan for already-loaded batches.
    ///
    /// Hook storage is created fresh for the run and dropped with it.
    pub fn run(&self, directory: &DirectoryBatch, dashboard: &DashboardBatch) -> SyncResult<ActionPlan> {
        let start = Instant::now();

        let current =
            Snapshot::from_dashboard(dashboard, self.config.identity.default_identity_type)?;

        let mut storage = HookStorage::new();
        let desired = DesiredStateBuilder::new(&self.table, &self.hooks, &self.filter)
            .with_default_identity_type(self.config.identity.default_identity_type)
            .with_default_country(self.config.default_country())
            .build(directory, &mut storage)?;

        let plan = self.reconciler.reconcile(&current, &desired)?;

        info!(
            directory_users = desired.len(),
            dashboard_users = current.len(),
            actions = plan.len(),
            status = %plan.status(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Sync run finished"
        );
        Ok(plan)
    }

    /// Read from the collaborators concurrently, then compute the plan.
    pub async fn run_with(
        &self,
        directories: &[Arc<dyn DirectoryConnector>],
        dashboard: &dyn DashboardConnector,
    ) -> SyncResult<ActionPlan> {
        let (directory, dashboard_batch) = acquire_snapshots(directories, dashboard).await?;
        self.run(&directory, &dashboard_batch)
    }

    /// Hand a finalized plan to the dashboard, one action at a time.
    ///
    /// Aborted plans are never sent. Failures are logged and counted; nothing
    /// is retried.
    pub async fn execute(
        &self,
        plan: &ActionPlan,
        dashboard: &dyn DashboardConnector,
    ) -> SyncResult<ExecutionReport> {
        let started_at = Utc::now();

        if plan.is_aborted() {
            warn!(status = %plan.status(), "Plan aborted; nothing sent to the dashboard");
            return Ok(ExecutionReport::from_outcomes(started_at, false, Vec::new()));
        }

        let mut outcomes = Vec::with_capacity(plan.len());
        for action in plan.actions() {
            let outcome = match dashboard.apply(action).await {
                Ok(()) => ActionOutcome {
                    user_key: action.user_key.clone(),
                    action: action.kind.as_str(),
                    success: true,
                    error: None,
                },
                Err(e) => {
                    error!(
                        user_key = %action.user_key,
                        action = action.kind.as_str(),
                        error = %e,
                        "Dashboard action failed"
                    );
                    ActionOutcome {
                        user_key: action.user_key.clone(),
                        action: action.kind.as_str(),
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let report = ExecutionReport::from_outcomes(started_at, true, outcomes);
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Plan executed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingRuleConfig;
    use crate::error::SyncError;
    use crate::hooks::HookDefinition;
    use crate::snapshot::DirectoryUser;

    fn config() -> SyncConfig {
        SyncConfig {
            accessor_organizations: vec!["org1".to_string()],
            mappings: vec![MappingRuleConfig {
                directory_group: "Marketing".to_string(),
                dashboard_groups: vec!["Acrobat".to_string(), "org1::Group A".to_string()],
            }],
            default_country_code: Some("US".to_string()),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_new_rejects_unknown_organization() {
        let mut config = config();
        config.mappings[0].dashboard_groups.push("org9::X".to_string());
        assert!(matches!(
            SyncEngine::new(config),
            Err(SyncError::UnknownOrganization { .. })
        ));
    }

    #[test]
    fn test_new_rejects_bad_hook() {
        let mut config = config();
        config.hooks.push(HookDefinition::per_user("let = ;"));
        assert!(matches!(
            SyncEngine::new(config),
            Err(SyncError::InvalidHook { .. })
        ));
    }

    #[test]
    fn test_extended_dashboard_groups_are_managed() {
        let mut config = config();
        let mut hook = HookDefinition::per_user("target_groups.push(\"org1::Contractors\");");
        hook.extended_dashboard_groups = vec!["org1::Contractors".to_string()];
        config.hooks.push(hook);

        let engine = SyncEngine::new(config).unwrap();
        assert!(engine.mapping_table().lookup("org1::Contractors").is_some());

        let directory = DirectoryBatch {
            users: vec![DirectoryUser {
                email: Some("a@example.com".to_string()),
                groups: ["Marketing".to_string()].into_iter().collect(),
                ..Default::default()
            }],
            complete: true,
        };
        let plan = engine.run(&directory, &DashboardBatch::default()).unwrap();
        assert_eq!(plan.summary().create_user, 1);
        assert_eq!(plan.summary().add_to_group, 3);
    }

    #[test]
    fn test_run_refuses_incomplete_directory() {
        let engine = SyncEngine::new(config()).unwrap();
        let directory = DirectoryBatch {
            users: vec![],
            complete: false,
        };
        assert!(matches!(
            engine.run(&directory, &DashboardBatch::default()),
            Err(SyncError::IncompleteSnapshot { side: "directory" })
        ));
    }
}
