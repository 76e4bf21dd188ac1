//! Per-user transformation hooks.
//!
//! A hook runs once per selected directory user, after group mapping and
//! before reconciliation. It may read the user's source attributes and
//! directory groups and rewrite the target attributes, target groups and the
//! run-scoped [`HookStorage`]. It never sees the mapping table, the network or
//! the file system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::{SyncError, SyncResult};
use crate::rhai_executor::{RhaiExecutorConfig, RhaiScriptExecutor};
use crate::types::{Attributes, UserKey};

/// Identity attributes every hook may read and write.
pub const STANDARD_ATTRIBUTES: [&str; 7] = [
    "email",
    "username",
    "domain",
    "firstname",
    "lastname",
    "country",
    "uid",
];

/// Hook execution errors.
#[derive(Debug, Error)]
pub enum HookError {
    /// The script raised an error or failed to evaluate.
    #[error("Hook execution failed: {message}")]
    ExecutionFailed { message: String },

    /// The script exceeded a sandbox limit.
    #[error("Hook exceeded sandbox limit: {message}")]
    ResourceLimit { message: String },

    /// The script left a target variable in an unusable shape.
    #[error("Hook produced invalid output for '{variable}': {message}")]
    InvalidOutput { variable: String, message: String },

    /// The hook declaration is invalid.
    #[error("Invalid hook configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Result type for hook operations.
pub type HookResult<T> = Result<T, HookError>;

/// When a hook runs. Only per-user execution exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HookMode {
    /// Once for every selected directory user.
    #[default]
    #[serde(rename = "per-user", alias = "per_user")]
    PerUser,
}

/// A hook declaration from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookDefinition {
    /// Name used in logs.
    #[serde(default = "default_hook_name")]
    pub name: String,
    /// Execution mode.
    #[serde(default)]
    pub context: HookMode,
    /// Extra directory attributes the hook may read and write.
    #[serde(default)]
    pub extended_attributes: Vec<String>,
    /// Extra dashboard groups the hook may assign.
    #[serde(default)]
    pub extended_dashboard_groups: Vec<String>,
    /// Script text.
    pub hook_source: String,
}

fn default_hook_name() -> String {
    "after_mapping_hook".to_string()
}

impl HookDefinition {
    /// Create a per-user hook with no extended fields.
    pub fn per_user(hook_source: impl Into<String>) -> Self {
        Self {
            name: default_hook_name(),
            context: HookMode::PerUser,
            extended_attributes: Vec::new(),
            extended_dashboard_groups: Vec::new(),
            hook_source: hook_source.into(),
        }
    }

    /// Attribute names this hook may see and change.
    #[must_use]
    pub fn permitted_attributes(&self) -> BTreeSet<String> {
        STANDARD_ATTRIBUTES
            .iter()
            .map(|a| (*a).to_string())
            .chain(
                self.extended_attributes
                    .iter()
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty()),
            )
            .collect()
    }
}

/// Run-scoped value threaded through every hook invocation in order.
///
/// Starts as `null`, is owned by the run and dropped with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookStorage(serde_json::Value);

impl HookStorage {
    /// Fresh storage for a new run.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Replace the stored value.
    pub fn replace(&mut self, value: serde_json::Value) {
        self.0 = value;
    }
}

/// Per-user input to a hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HookContext {
    /// Key of the user being processed.
    pub user_key: Option<UserKey>,
    /// Attributes read from the directory (read-only to the hook).
    pub source_attributes: Attributes,
    /// Directory groups of the user (read-only to the hook).
    pub source_groups: BTreeSet<String>,
    /// Attributes that will be sent to the dashboard.
    pub target_attributes: Attributes,
    /// Qualified dashboard group names computed by the mapper.
    pub target_groups: BTreeSet<String>,
}

impl HookContext {
    /// Copy of this context with attributes outside `permitted` removed.
    #[must_use]
    pub fn restricted_to(&self, permitted: &BTreeSet<String>) -> Self {
        let keep = |attrs: &Attributes| -> Attributes {
            attrs
                .iter()
                .filter(|(k, _)| permitted.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Self {
            user_key: self.user_key.clone(),
            source_attributes: keep(&self.source_attributes),
            source_groups: self.source_groups.clone(),
            target_attributes: keep(&self.target_attributes),
            target_groups: self.target_groups.clone(),
        }
    }
}

/// What a hook invocation returns.
#[derive(Debug, Clone, PartialEq)]
pub struct HookOutcome {
    /// Rewritten target attributes.
    pub target_attributes: Attributes,
    /// Rewritten target groups.
    pub target_groups: BTreeSet<String>,
    /// Updated storage value.
    pub storage: serde_json::Value,
}

/// Executes one hook for one user.
pub trait HookExecutor: Send + Sync {
    /// Run the hook against `context`, starting from `storage`.
    fn execute(&self, context: &HookContext, storage: &HookStorage) -> HookResult<HookOutcome>;

    /// Get the executor type name.
    fn executor_type(&self) -> &'static str;
}

struct RegisteredHook {
    definition: HookDefinition,
    permitted_attributes: BTreeSet<String>,
    executor: Arc<dyn HookExecutor>,
}

/// Result of running all hooks for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct HookRun {
    /// Final target attributes (pre-hook values if a hook failed).
    pub target_attributes: Attributes,
    /// Final target groups (pre-hook values if a hook failed).
    pub target_groups: BTreeSet<String>,
    /// Whether a hook failed and the pre-hook values were kept.
    pub failed: bool,
}

/// Runs the configured hooks with failure isolation.
#[derive(Default)]
pub struct HookRuntime {
    hooks: Vec<RegisteredHook>,
}

impl HookRuntime {
    /// Runtime without hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every declared hook into a sandboxed Rhai executor.
    ///
    /// Compilation errors are configuration errors.
    pub fn compile(definitions: &[HookDefinition], sandbox: &RhaiExecutorConfig) -> SyncResult<Self> {
        let mut runtime = Self::new();
        for definition in definitions {
            let executor = RhaiScriptExecutor::compile(&definition.hook_source, sandbox.clone())
                .map_err(|e| SyncError::invalid_hook(format!("{}: {e}", definition.name)))?;
            runtime.register(definition.clone(), Arc::new(executor));
        }
        Ok(runtime)
    }

    /// Register a hook with a custom executor.
    pub fn register(&mut self, definition: HookDefinition, executor: Arc<dyn HookExecutor>) {
        debug!(
            hook = %definition.name,
            executor_type = executor.executor_type(),
            extended_attributes = definition.extended_attributes.len(),
            "Registered hook"
        );
        self.hooks.push(RegisteredHook {
            permitted_attributes: definition.permitted_attributes(),
            definition,
            executor,
        });
    }

    /// Whether any hook is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Union of extended attribute names over all hooks.
    #[must_use]
    pub fn extended_attributes(&self) -> BTreeSet<String> {
        self.hooks
            .iter()
            .flat_map(|h| h.definition.extended_attributes.iter())
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect()
    }

    /// Run all hooks for one user.
    ///
    /// Hooks run in declaration order, each seeing the previous one's output.
    /// If any hook fails, the failure is logged at critical severity, the
    /// user's pre-hook targets are returned and `storage` is left as it was
    /// before this user. This never fails the run.
    pub fn run(&self, context: HookContext, storage: &mut HookStorage) -> HookRun {
        let fallback = HookRun {
            target_attributes: context.target_attributes.clone(),
            target_groups: context.target_groups.clone(),
            failed: false,
        };
        if self.hooks.is_empty() {
            return fallback;
        }

        let user = context
            .user_key
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let mut current = context;
        let mut working = storage.clone();

        for hook in &self.hooks {
            let start = Instant::now();
            let visible = current.restricted_to(&hook.permitted_attributes);
            debug!(
                hook = %hook.definition.name,
                user_key = %user,
                target_attributes = ?visible.target_attributes,
                target_groups = ?visible.target_groups,
                "Invoking hook"
            );

            match hook.executor.execute(&visible, &working) {
                Ok(outcome) => {
                    // Hidden attributes pass through untouched; undeclared writes are dropped.
                    for (name, value) in &outcome.target_attributes {
                        if !hook.permitted_attributes.contains(name) {
                            warn!(
                                hook = %hook.definition.name,
                                user_key = %user,
                                attribute = %name,
                                "Hook wrote undeclared attribute; ignored"
                            );
                            continue;
                        }
                        current.target_attributes.insert(name.clone(), value.clone());
                    }
                    current.target_attributes.retain(|name, _| {
                        !hook.permitted_attributes.contains(name)
                            || outcome.target_attributes.contains_key(name)
                    });
                    current.target_groups = outcome.target_groups;
                    working.replace(outcome.storage);

                    debug!(
                        hook = %hook.definition.name,
                        user_key = %user,
                        duration_ms = start.elapsed().as_millis() as u64,
                        target_attributes = ?current.target_attributes,
                        target_groups = ?current.target_groups,
                        hook_storage = %working.value(),
                        "Hook completed"
                    );
                }
                Err(e) => {
                    error!(
                        severity = "critical",
                        hook = %hook.definition.name,
                        user_key = %user,
                        error = %e,
                        "Hook failed; using mapping result for this user"
                    );
                    return HookRun {
                        failed: true,
                        ..fallback
                    };
                }
            }
        }

        *storage = working;
        HookRun {
            target_attributes: current.target_attributes,
            target_groups: current.target_groups,
            failed: false,
        }
    }
}
