//! # User Sync Engine
//!
//! Reconciliation core for provisioning directory users into a dashboard.
//!
//! This crate provides:
//! - A validated mapping table from directory groups to dashboard groups,
//!   including `org::group` qualifiers for accessor organizations
//! - Sandboxed per-user transformation hooks (Rhai) with run-scoped storage
//! - Current and desired state snapshots
//! - A reconciler that emits a deterministic action plan under blast-radius
//!   limits
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌───────────────┐
//! │   Directory     │────►│ Group Mapper │────►│ Hook Runtime  │
//! │   Connectors    │     │              │     │               │
//! └─────────────────┘     └──────────────┘     └───────┬───────┘
//!                                                      │ desired
//! ┌─────────────────┐                          ┌───────▼───────┐
//! │   Dashboard     │─────────── current ─────►│  Reconciler   │
//! │   Connector     │                          │   (limits)    │
//! └────────▲────────┘                          └───────┬───────┘
//!          │                                           │
//!          └──────────────── Action Plan ◄─────────────┘
//! ```
//!
//! Only snapshot acquisition is concurrent. Mapping, hooks and
//! reconciliation are synchronous and deterministic.
//!
//! ## Example
//!
//! ```ignore
//! use usersync_engine::{SyncConfig, SyncEngine};
//!
//! let config = SyncConfig::from_file("usersync.yml")?;
//! let engine = SyncEngine::new(config)?;
//!
//! let plan = engine.run_with(&directories, &dashboard).await?;
//! if !plan.is_aborted() {
//!     let report = engine.execute(&plan, &dashboard).await?;
//!     println!("{} succeeded, {} failed", report.succeeded, report.failed);
//! }
//! ```

pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod mapper;
pub mod mapping;
pub mod plan;
pub mod reconciler;
pub mod rhai_executor;
pub mod snapshot;
pub mod types;

pub use config::{FilterConfig, IdentityPolicyConfig, MappingRuleConfig, SyncConfig};
pub use connector::{acquire_snapshots, DashboardConnector, DirectoryConnector};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use hooks::{
    HookContext, HookDefinition, HookError, HookExecutor, HookMode, HookOutcome, HookResult,
    HookRun, HookRuntime, HookStorage,
};
pub use mapper::GroupMapper;
pub use mapping::{DashboardGroup, GroupKind, MappingRule, MappingTable};
pub use plan::{
    Action, ActionKind, ActionOutcome, ActionPlan, ExecutionReport, ExistingUserPolicy,
    PlanCounters, PlanStatus, PlanSummary,
};
pub use reconciler::{Limits, ReconcilePolicy, Reconciler};
pub use rhai_executor::{RhaiExecutorConfig, RhaiScriptExecutor, ScriptValidationError};
pub use snapshot::{
    BuildStats, DashboardBatch, DashboardUser, DesiredStateBuilder, DirectoryBatch, DirectoryUser,
    Snapshot, UserFilter, UserState,
};
pub use types::{AttributeValue, Attributes, IdentityType, UserKey};
