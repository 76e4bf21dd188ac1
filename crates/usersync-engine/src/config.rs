//! Engine configuration.
//!
//! The structs here are the already-merged configuration surface the engine
//! consumes. YAML helpers exist for the CLI and tests; file discovery and
//! connector configuration live outside the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{SyncError, SyncResult};
use crate::hooks::HookDefinition;
use crate::reconciler::Limits;
use crate::rhai_executor::RhaiExecutorConfig;
use crate::types::{IdentityType, UserKey};

/// One configured mapping rule, before qualifier resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRuleConfig {
    /// Directory group name.
    pub directory_group: String,
    /// Qualified or unqualified dashboard groups.
    #[serde(default)]
    pub dashboard_groups: Vec<String>,
}

/// Identity type policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPolicyConfig {
    /// Identity type for directory users that do not state one.
    #[serde(default = "default_identity_type")]
    pub default_identity_type: IdentityType,
    /// Identity types this run may create, update and remove.
    #[serde(default = "default_managed_identity_types")]
    pub managed_identity_types: BTreeSet<IdentityType>,
}

fn default_identity_type() -> IdentityType {
    IdentityType::EnterpriseId
}

fn default_managed_identity_types() -> BTreeSet<IdentityType> {
    [IdentityType::EnterpriseId, IdentityType::FederatedId]
        .into_iter()
        .collect()
}

impl Default for IdentityPolicyConfig {
    fn default() -> Self {
        Self {
            default_identity_type: default_identity_type(),
            managed_identity_types: default_managed_identity_types(),
        }
    }
}

/// Which directory users take part in the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Only users in at least one of these directory groups are selected.
    #[serde(default)]
    pub directory_group_filter: Option<Vec<String>>,
    /// Only users whose username matches this regular expression are selected.
    #[serde(default)]
    pub username_filter: Option<String>,
    /// User keys to remove regardless of directory membership.
    #[serde(default)]
    pub remove_user_keys: Vec<String>,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Accessor organizations whose groups may be referenced as `org::group`.
    #[serde(default)]
    pub accessor_organizations: Vec<String>,
    /// Directory group to dashboard group rules.
    #[serde(default)]
    pub mappings: Vec<MappingRuleConfig>,
    /// Identity type policy.
    #[serde(default)]
    pub identity: IdentityPolicyConfig,
    /// Per-user transformation hooks.
    #[serde(default)]
    pub hooks: Vec<HookDefinition>,
    /// Hook sandbox limits.
    #[serde(default)]
    pub hook_sandbox: RhaiExecutorConfig,
    /// Blast-radius limits.
    #[serde(default)]
    pub limits: Limits,
    /// Country applied when directory data omits one.
    #[serde(default)]
    pub default_country_code: Option<String>,
    /// User selection.
    #[serde(default)]
    pub filters: FilterConfig,
    /// Whether group memberships are managed.
    #[serde(default = "default_true")]
    pub manage_groups: bool,
    /// Whether attributes of existing users are updated.
    #[serde(default = "default_true")]
    pub update_user_info: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            accessor_organizations: Vec::new(),
            mappings: Vec::new(),
            identity: IdentityPolicyConfig::default(),
            hooks: Vec::new(),
            hook_sandbox: RhaiExecutorConfig::default(),
            limits: Limits::default(),
            default_country_code: None,
            filters: FilterConfig::default(),
            manage_groups: default_true(),
            update_user_info: default_true(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SyncError::configuration(format!(
                "Failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(content: &str) -> SyncResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot express.
    ///
    /// Mapping qualifiers and hook scripts are validated when the engine is
    /// built, since that needs the resolved tables.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(country) = &self.default_country_code {
            let country = country.trim();
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(SyncError::configuration(format!(
                    "default_country_code must be a two-letter code, got '{country}'"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for org in &self.accessor_organizations {
            let org = org.trim();
            if org.is_empty() || org.contains("::") {
                return Err(SyncError::configuration(format!(
                    "Invalid accessor organization name '{org}'"
                )));
            }
            if !seen.insert(org) {
                return Err(SyncError::configuration(format!(
                    "Duplicate accessor organization '{org}'"
                )));
            }
        }

        if self.identity.managed_identity_types.is_empty() {
            return Err(SyncError::configuration(
                "managed_identity_types must name at least one identity type",
            ));
        }

        if let Some(pattern) = &self.filters.username_filter {
            regex::Regex::new(pattern).map_err(|e| {
                SyncError::configuration(format!("Invalid username_filter: {e}"))
            })?;
        }

        for key in &self.filters.remove_user_keys {
            UserKey::parse(key)?;
        }

        Ok(())
    }

    /// Accessor organization names as a set.
    #[must_use]
    pub fn accessor_set(&self) -> BTreeSet<String> {
        self.accessor_organizations
            .iter()
            .map(|o| o.trim().to_string())
            .collect()
    }

    /// The default country, upper-cased.
    #[must_use]
    pub fn default_country(&self) -> Option<String> {
        self.default_country_code
            .as_ref()
            .map(|c| c.trim().to_uppercase())
    }
}
