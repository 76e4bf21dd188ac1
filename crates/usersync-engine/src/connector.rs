//! Collaborator interfaces.
//!
//! Directory connectors and the dashboard client live outside the engine.
//! Snapshot acquisition is the only phase that runs concurrently: every
//! directory connector and the dashboard are read at the same time and their
//! output is merged before reconciliation starts.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::SyncResult;
use crate::plan::Action;
use crate::snapshot::{DashboardBatch, DirectoryBatch};

/// Source of directory users.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Connector name used in logs.
    fn name(&self) -> &str;

    /// Read every user with attributes and group memberships.
    async fn load_users(&self) -> SyncResult<DirectoryBatch>;
}

/// Client of the dashboard.
///
/// Retry and backoff are the client's concern; the engine calls each action
/// once and only logs failures.
#[async_trait]
pub trait DashboardConnector: Send + Sync {
    /// Read every dashboard user with its group memberships.
    async fn load_users(&self) -> SyncResult<DashboardBatch>;

    /// Apply one action.
    async fn apply(&self, action: &Action) -> SyncResult<()>;
}

/// Read all directory connectors and the dashboard concurrently.
///
/// Directory batches are concatenated in connector order. Any connector
/// error is returned unchanged.
pub async fn acquire_snapshots(
    directories: &[Arc<dyn DirectoryConnector>],
    dashboard: &dyn DashboardConnector,
) -> SyncResult<(DirectoryBatch, DashboardBatch)> {
    let directory_reads = try_join_all(directories.iter().map(|connector| async move {
        let batch = connector.load_users().await?;
        debug!(
            connector = connector.name(),
            users = batch.users.len(),
            complete = batch.complete,
            "Directory connector read"
        );
        Ok::<_, crate::error::SyncError>(batch)
    }));

    let (batches, dashboard_batch) = tokio::try_join!(directory_reads, dashboard.load_users())?;

    let mut directory = DirectoryBatch::default();
    for batch in batches {
        directory.extend(batch);
    }

    info!(
        directory_connectors = directories.len(),
        directory_users = directory.users.len(),
        dashboard_users = dashboard_batch.users.len(),
        "Snapshots acquired"
    );
    Ok((directory, dashboard_batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::snapshot::{DashboardUser, DirectoryUser};

    struct StaticDirectory {
        name: String,
        batch: DirectoryBatch,
    }

    #[async_trait]
    impl DirectoryConnector for StaticDirectory {
        fn name(&self) -> &str {
            &self.name
        }

        async fn load_users(&self) -> SyncResult<DirectoryBatch> {
            Ok(self.batch.clone())
        }
    }

    struct FailingDirectory;

    #[async_trait]
    impl DirectoryConnector for FailingDirectory {
        fn name(&self) -> &str {
            "failing"
        }

        async fn load_users(&self) -> SyncResult<DirectoryBatch> {
            Err(SyncError::connector("LDAP bind failed"))
        }
    }

    struct StaticDashboard;

    #[async_trait]
    impl DashboardConnector for StaticDashboard {
        async fn load_users(&self) -> SyncResult<DashboardBatch> {
            Ok(DashboardBatch {
                users: vec![DashboardUser {
                    email: Some("remote@example.com".to_string()),
                    ..Default::default()
                }],
                complete: true,
            })
        }

        async fn apply(&self, _action: &Action) -> SyncResult<()> {
            Ok(())
        }
    }

    fn directory(name: &str, email: &str, complete: bool) -> Arc<dyn DirectoryConnector> {
        Arc::new(StaticDirectory {
            name: name.to_string(),
            batch: DirectoryBatch {
                users: vec![DirectoryUser {
                    email: Some(email.to_string()),
                    ..Default::default()
                }],
                complete,
            },
        })
    }

    #[tokio::test]
    async fn test_acquire_merges_directory_batches() {
        let directories = vec![
            directory("ldap", "a@example.com", true),
            directory("csv", "b@example.com", true),
        ];
        let (dir, dash) = acquire_snapshots(&directories, &StaticDashboard).await.unwrap();
        assert_eq!(dir.users.len(), 2);
        assert_eq!(dir.users[0].email.as_deref(), Some("a@example.com"));
        assert!(dir.complete);
        assert_eq!(dash.users.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_propagates_incompleteness() {
        let directories = vec![
            directory("ldap", "a@example.com", true),
            directory("csv", "b@example.com", false),
        ];
        let (dir, _) = acquire_snapshots(&directories, &StaticDashboard).await.unwrap();
        assert!(!dir.complete);
    }

    #[tokio::test]
    async fn test_acquire_surfaces_connector_error() {
        let directories: Vec<Arc<dyn DirectoryConnector>> =
            vec![directory("ldap", "a@example.com", true), Arc::new(FailingDirectory)];
        let err = acquire_snapshots(&directories, &StaticDashboard)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Connector { .. }));
    }
}
