//! Rhai hook executor.
//!
//! Implements [`HookExecutor`] with a sandboxed Rhai engine. The script sees
//! five variables:
//!
//! | name                | access     | shape                      |
//! |---------------------|------------|----------------------------|
//! | `source_attributes` | read-only  | map of string / string[]   |
//! | `source_groups`     | read-only  | array of directory groups  |
//! | `target_attributes` | read-write | map of string / string[]   |
//! | `target_groups`     | read-write | array of dashboard groups  |
//! | `hook_storage`      | read-write | any value, `()` initially  |
//!
//! The engine has no file, network or module access, `eval` is disabled and
//! every execution is bounded by operation, call depth and size limits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use tracing::{debug, error, info, warn};

use crate::hooks::{HookContext, HookError, HookExecutor, HookOutcome, HookResult, HookStorage};
use crate::types::{AttributeValue, Attributes};

/// Default maximum number of operations in the Rhai engine.
const DEFAULT_MAX_OPERATIONS: u64 = 100_000;

/// Default maximum call stack depth.
const DEFAULT_MAX_CALL_STACK_DEPTH: usize = 64;

/// Default maximum string size in bytes.
const DEFAULT_MAX_STRING_SIZE: usize = 65536;

/// Default maximum array size.
const DEFAULT_MAX_ARRAY_SIZE: usize = 10_000;

/// Default maximum map size.
const DEFAULT_MAX_MAP_SIZE: usize = 10_000;

const SOURCE_ATTRIBUTES: &str = "source_attributes";
const SOURCE_GROUPS: &str = "source_groups";
const TARGET_ATTRIBUTES: &str = "target_attributes";
const TARGET_GROUPS: &str = "target_groups";
const HOOK_STORAGE: &str = "hook_storage";

/// Sandbox limits for the Rhai engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RhaiExecutorConfig {
    /// Maximum number of operations before termination.
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    /// Maximum call stack depth.
    #[serde(default = "default_max_call_stack_depth")]
    pub max_call_stack_depth: usize,
    /// Maximum string size in bytes.
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    /// Maximum array size.
    #[serde(default = "default_max_array_size")]
    pub max_array_size: usize,
    /// Maximum map size.
    #[serde(default = "default_max_map_size")]
    pub max_map_size: usize,
}

fn default_max_operations() -> u64 {
    DEFAULT_MAX_OPERATIONS
}

fn default_max_call_stack_depth() -> usize {
    DEFAULT_MAX_CALL_STACK_DEPTH
}

fn default_max_string_size() -> usize {
    DEFAULT_MAX_STRING_SIZE
}

fn default_max_array_size() -> usize {
    DEFAULT_MAX_ARRAY_SIZE
}

fn default_max_map_size() -> usize {
    DEFAULT_MAX_MAP_SIZE
}

impl Default for RhaiExecutorConfig {
    fn default() -> Self {
        Self {
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_call_stack_depth: DEFAULT_MAX_CALL_STACK_DEPTH,
            max_string_size: DEFAULT_MAX_STRING_SIZE,
            max_array_size: DEFAULT_MAX_ARRAY_SIZE,
            max_map_size: DEFAULT_MAX_MAP_SIZE,
        }
    }
}

/// A compiled hook script bound to its sandboxed engine.
pub struct RhaiScriptExecutor {
    engine: Engine,
    ast: AST,
}

impl RhaiScriptExecutor {
    /// Compile a hook script.
    pub fn compile(script_body: &str, config: RhaiExecutorConfig) -> HookResult<Self> {
        let engine = create_engine(&config);
        // Compile against a scope with the hook variables so strict_variables
        // accepts them. They are pushed as plain variables: constants would be
        // folded into the AST.
        let ast = engine
            .compile_with_scope(&template_scope(), script_body)
            .map_err(|e| HookError::InvalidConfiguration {
                message: format!("Compilation error: {e}"),
            })?;
        Ok(Self { engine, ast })
    }

    /// Validate a script for syntax errors.
    #[must_use]
    pub fn validate_script(
        script_body: &str,
        config: &RhaiExecutorConfig,
    ) -> Vec<ScriptValidationError> {
        let engine = create_engine(config);
        match engine.compile_with_scope(&template_scope(), script_body) {
            Ok(_) => vec![],
            Err(e) => vec![ScriptValidationError {
                line: e.position().line(),
                column: e.position().position(),
                message: e.to_string(),
            }],
        }
    }

    /// Build the per-user scope.
    fn build_scope(context: &HookContext, storage: &HookStorage) -> HookResult<Scope<'static>> {
        let mut scope = Scope::new();

        scope.push_constant(SOURCE_ATTRIBUTES, to_dynamic(&context.source_attributes)?);
        scope.push_constant(SOURCE_GROUPS, string_array(&context.source_groups));
        scope.push(TARGET_ATTRIBUTES, to_dynamic(&context.target_attributes)?);
        scope.push(TARGET_GROUPS, string_array(&context.target_groups));
        scope.push(HOOK_STORAGE, to_dynamic(storage.value())?);

        Ok(scope)
    }

    /// Read the target variables back out of the scope.
    fn extract_outcome(scope: &Scope) -> HookResult<HookOutcome> {
        let attributes = scope_json(scope, TARGET_ATTRIBUTES)?;
        let serde_json::Value::Object(entries) = attributes else {
            return Err(invalid_output(TARGET_ATTRIBUTES, "expected a map"));
        };
        let mut target_attributes = Attributes::new();
        for (name, value) in &entries {
            if value.is_object() {
                return Err(invalid_output(
                    TARGET_ATTRIBUTES,
                    format!("attribute '{name}' is a nested map"),
                ));
            }
            if let Some(value) = AttributeValue::from_json(value) {
                target_attributes.insert(name.clone(), value);
            }
        }

        let groups = scope_json(scope, TARGET_GROUPS)?;
        let serde_json::Value::Array(items) = groups else {
            return Err(invalid_output(TARGET_GROUPS, "expected an array"));
        };
        let mut target_groups = BTreeSet::new();
        for item in items {
            let serde_json::Value::String(name) = item else {
                return Err(invalid_output(TARGET_GROUPS, "group names must be strings"));
            };
            let name = name.trim();
            if !name.is_empty() {
                target_groups.insert(name.to_string());
            }
        }

        let storage = scope_json(scope, HOOK_STORAGE)?;

        Ok(HookOutcome {
            target_attributes,
            target_groups,
            storage,
        })
    }
}

impl HookExecutor for RhaiScriptExecutor {
    fn execute(&self, context: &HookContext, storage: &HookStorage) -> HookResult<HookOutcome> {
        let mut scope = Self::build_scope(context, storage)?;

        match self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
        {
            Ok(_) => Self::extract_outcome(&scope),
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "Rhai script execution failed");
                if matches!(
                    *e,
                    EvalAltResult::ErrorTooManyOperations(..)
                        | EvalAltResult::ErrorDataTooLarge(..)
                        | EvalAltResult::ErrorStackOverflow(..)
                ) {
                    return Err(HookError::ResourceLimit { message });
                }
                Err(HookError::ExecutionFailed { message })
            }
        }
    }

    fn executor_type(&self) -> &'static str {
        "rhai_script"
    }
}

/// Create a sandboxed Rhai engine with security constraints.
fn create_engine(config: &RhaiExecutorConfig) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_operations(config.max_operations);
    engine.set_max_call_levels(config.max_call_stack_depth);
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_array_size);
    engine.set_max_map_size(config.max_map_size);

    // Loops are bounded by max_operations.
    engine.set_allow_looping(true);
    engine.set_strict_variables(true);
    engine.disable_symbol("eval");
    // `import` resolves nothing; the default resolver reads scripts from disk.
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());

    engine.register_fn("log_info", |msg: &str| {
        info!(script_log = %msg, "Hook script log");
    });

    engine.register_fn("log_warn", |msg: &str| {
        warn!(script_log = %msg, "Hook script warning");
    });

    engine.register_fn("log_debug", |msg: &str| {
        debug!(script_log = %msg, "Hook script debug");
    });

    engine
}

fn template_scope() -> Scope<'static> {
    let mut scope = Scope::new();
    scope.push(SOURCE_ATTRIBUTES, rhai::Map::new());
    scope.push(SOURCE_GROUPS, rhai::Array::new());
    scope.push(TARGET_ATTRIBUTES, rhai::Map::new());
    scope.push(TARGET_GROUPS, rhai::Array::new());
    scope.push(HOOK_STORAGE, Dynamic::UNIT);
    scope
}

fn to_dynamic<T: Serialize>(value: &T) -> HookResult<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| HookError::ExecutionFailed {
        message: format!("Failed to expose value to script: {e}"),
    })
}

fn string_array(values: &BTreeSet<String>) -> rhai::Array {
    values.iter().map(|v| Dynamic::from(v.clone())).collect()
}

fn scope_json(scope: &Scope, variable: &str) -> HookResult<serde_json::Value> {
    let dynamic = scope
        .get_value::<Dynamic>(variable)
        .ok_or_else(|| invalid_output(variable, "variable is missing"))?;
    rhai::serde::from_dynamic::<serde_json::Value>(&dynamic)
        .map_err(|e| invalid_output(variable, e.to_string()))
}

fn invalid_output(variable: &str, message: impl Into<String>) -> HookError {
    HookError::InvalidOutput {
        variable: variable.to_string(),
        message: message.into(),
    }
}

/// Result of a script validation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScriptValidationError {
    /// Line number of the error (if available).
    pub line: Option<usize>,
    /// Column of the error (if available).
    pub column: Option<usize>,
    /// Error message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> HookContext {
        let mut ctx = HookContext::default();
        ctx.source_attributes
            .insert("email".to_string(), "john.doe@example.com".into());
        ctx.source_attributes
            .insert("bc".to_string(), "US-1234".into());
        ctx.source_groups.insert("Marketing".to_string());
        ctx.target_attributes
            .insert("email".to_string(), "john.doe@example.com".into());
        ctx.target_attributes
            .insert("country".to_string(), "DE".into());
        ctx.target_groups.insert("Acrobat".to_string());
        ctx
    }

    fn run(script: &str) -> HookResult<HookOutcome> {
        let executor = RhaiScriptExecutor::compile(script, RhaiExecutorConfig::default())?;
        executor.execute(&test_context(), &HookStorage::new())
    }

    #[test]
    fn test_validate_valid_script() {
        let errors =
            RhaiScriptExecutor::validate_script("let x = 42; x + 1", &RhaiExecutorConfig::default());
        assert!(errors.is_empty());
    }

    #[test]
    fn test_validate_invalid_script() {
        let errors =
            RhaiScriptExecutor::validate_script("let x = ;", &RhaiExecutorConfig::default());
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].message.is_empty());
    }

    #[test]
    fn test_validate_rejects_unknown_variable() {
        let errors = RhaiScriptExecutor::validate_script(
            "logger.info(\"x\");",
            &RhaiExecutorConfig::default(),
        );
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_compile_invalid_script() {
        assert!(RhaiScriptExecutor::compile("this is not valid rhai", RhaiExecutorConfig::default())
            .is_err());
    }

    #[test]
    fn test_country_from_source_attribute() {
        let outcome = run(
            r#"
            let bc = source_attributes["bc"];
            if type_of(bc) == "string" {
                target_attributes["country"] = bc.sub_string(0, 2);
            }
            "#,
        )
        .unwrap();
        assert_eq!(
            outcome.target_attributes.get("country"),
            Some(&AttributeValue::Single("US".to_string()))
        );
        assert_eq!(
            outcome.target_attributes.get("email"),
            Some(&AttributeValue::Single("john.doe@example.com".to_string()))
        );
        assert_eq!(outcome.target_groups.len(), 1);
    }

    #[test]
    fn test_missing_source_attribute_reads_as_unit() {
        let outcome = run(
            r#"
            let cc = source_attributes["costCenter"];
            if type_of(cc) == "string" {
                target_attributes["country"] = "XX";
            }
            "#,
        )
        .unwrap();
        assert_eq!(
            outcome.target_attributes.get("country"),
            Some(&AttributeValue::Single("DE".to_string()))
        );
    }

    #[test]
    fn test_groups_can_be_added_and_removed() {
        let outcome = run(
            r#"
            if source_groups.contains("Marketing") {
                target_groups.push("org1::Group A");
            }
            target_groups.retain(|g| g != "Acrobat");
            "#,
        )
        .unwrap();
        let groups: Vec<&str> = outcome.target_groups.iter().map(String::as_str).collect();
        assert_eq!(groups, vec!["org1::Group A"]);
    }

    #[test]
    fn test_unit_attribute_is_removed() {
        let outcome = run(r#"target_attributes["country"] = ();"#).unwrap();
        assert!(!outcome.target_attributes.contains_key("country"));
    }

    #[test]
    fn test_storage_round_trips() {
        let executor = RhaiScriptExecutor::compile(
            r#"
            if type_of(hook_storage) == "()" {
                hook_storage = #{ count: 0 };
            }
            hook_storage.count += 1;
            "#,
            RhaiExecutorConfig::default(),
        )
        .unwrap();

        let mut storage = HookStorage::new();
        for _ in 0..3 {
            let outcome = executor.execute(&test_context(), &storage).unwrap();
            storage.replace(outcome.storage);
        }
        assert_eq!(storage.value()["count"], serde_json::json!(3));
    }

    #[test]
    fn test_source_attributes_are_read_only() {
        let result = run(r#"source_attributes["email"] = "evil@example.com";"#);
        assert!(matches!(result, Err(HookError::ExecutionFailed { .. })));
    }

    #[test]
    fn test_thrown_error_fails() {
        let result = run(r#"throw "bad user";"#);
        assert!(matches!(result, Err(HookError::ExecutionFailed { .. })));
    }

    #[test]
    fn test_invalid_group_output() {
        let result = run("target_groups = 42;");
        assert!(matches!(result, Err(HookError::InvalidOutput { .. })));
    }

    #[test]
    fn test_max_operations_limit() {
        let config = RhaiExecutorConfig {
            max_operations: 100,
            ..Default::default()
        };
        let executor = RhaiScriptExecutor::compile(
            r#"
            let x = 0;
            while x < 1000000 {
                x += 1;
            }
            "#,
            config,
        )
        .unwrap();
        let result = executor.execute(&test_context(), &HookStorage::new());
        assert!(matches!(result, Err(HookError::ResourceLimit { .. })));
    }

    #[test]
    fn test_import_cannot_load_modules() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("secret.rhai");
        std::fs::write(&module, "export const secret = \"from-disk\";").unwrap();
        let script = format!(
            "import \"{}\" as m;\ntarget_attributes[\"country\"] = m::secret;",
            module.with_extension("").display()
        );

        let result = run(&script);
        assert!(matches!(result, Err(HookError::ExecutionFailed { .. })));
    }

    #[test]
    fn test_eval_is_disabled() {
        assert!(RhaiScriptExecutor::compile("eval(\"1\")", RhaiExecutorConfig::default()).is_err());
    }
}
