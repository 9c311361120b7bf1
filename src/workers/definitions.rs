//! Worker definition loader & validator (§4.I): worker definitions are
//! purely declarative records parsed from YAML through a four-layer
//! validation pipeline — safe parse, structural, pattern scan, semantic.
//! A definition must never carry executable code.

use std::sync::LazyLock;

use miette::Diagnostic;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::enforcement::WitnessRegistry;
use super::protocol::FeedbackChannel;

/// `{id, identity, constraints[], runtime{...}, trust_level, audit}` (§3
/// Worker definition, §6 worker definition file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDefinition {
    pub worker_id: String,
    pub identity: Identity,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
    pub runtime: RuntimeSpec,
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub onboarding_steps: Vec<String>,
}

/// Raw constraint entry as it appears in the definition file; `witness` and
/// `feedback` are the YAML field names, mapped onto the runtime
/// [`super::protocol::Constraint`]'s `witness_id`/`feedback_channel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub constraint_id: String,
    pub witness: String,
    pub value: String,
    pub feedback: FeedbackChannel,
}

impl ConstraintSpec {
    #[must_use]
    pub fn into_constraint(self) -> super::protocol::Constraint {
        super::protocol::Constraint {
            constraint_id: self.constraint_id,
            witness_id: self.witness,
            value: self.value,
            feedback_channel: self.feedback,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub container: Option<String>,
    pub workspace_template: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub session_persistence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Sandboxed,
    Restricted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Audit {
    #[serde(default)]
    pub log_all_actions: bool,
    #[serde(default)]
    pub execution_channel: String,
    #[serde(default)]
    pub retention_days: u32,
}

#[derive(Debug, Error, Diagnostic)]
pub enum DefinitionError {
    #[error("worker definition is not valid YAML: {0}")]
    #[diagnostic(
        code(stepgraph::workers::definition_malformed),
        help("Only plain YAML scalars/mappings/sequences are accepted; custom tags are rejected at the parse layer.")
    )]
    Malformed(String),

    #[error("worker definition field {field:?} has an impure value matching forbidden pattern {pattern:?}")]
    #[diagnostic(
        code(stepgraph::workers::definition_impure),
        help("Worker definitions are declarative data; they must not contain executable-code markers.")
    )]
    Impure { field: String, pattern: String },

    #[error("worker definition references unknown witness {witness_id:?} (constraint {constraint_id:?})")]
    #[diagnostic(code(stepgraph::workers::definition_unknown_witness))]
    UnknownWitness { constraint_id: String, witness_id: String },

    #[error("worker_id {0:?} must match [A-Za-z0-9_]+")]
    #[diagnostic(code(stepgraph::workers::definition_bad_id))]
    InvalidWorkerId(String),
}

/// Layer-3 forbidden-pattern list: host-language code markers that have no
/// business appearing inside a declarative worker definition.
static FORBIDDEN_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("dynamic eval", r"\beval\s*\("),
        ("dynamic eval", r"\bexec\s*\("),
        ("shell spawn", r"\bsubprocess\b"),
        ("shell spawn", r"\bos\.system\b"),
        ("shell spawn", r"\bsh\s+-c\b"),
        ("path escape", r"\.\./\.\."),
        ("path escape", r"\bfile://"),
        ("arbitrary import", r"\b__import__\b"),
        ("arbitrary import", r"\brequire\s*\("),
        ("lambda keyword", r"\blambda\b"),
        ("function keyword", r"\bfunction\s*\("),
        ("class keyword", r"\bclass\s+\w+\s*[:({]"),
    ]
    .into_iter()
    .map(|(label, pattern)| (label, Regex::new(pattern).expect("static forbidden pattern is valid regex")))
    .collect()
});

/// Layer 1: parse the raw YAML text, refusing any construct capable of
/// materialising arbitrary host objects. `serde_yaml` only ever deserialises
/// into the strongly-typed [`WorkerDefinition`] below — there is no
/// `!!python/object`-style arbitrary-constructor path in this pipeline, so a
/// successful parse already satisfies layer 1.
pub fn safe_parse(yaml: &str) -> Result<WorkerDefinition, DefinitionError> {
    serde_yaml::from_str(yaml).map_err(|err| DefinitionError::Malformed(err.to_string()))
}

/// Layer 2: structural completeness. `serde`'s required (non-`Option`,
/// non-`#[serde(default)]`) fields already enforce presence/typing during
/// `safe_parse`; this pass adds the checks serde's type system cannot
/// express (non-empty identifiers, non-empty workspace template).
pub fn validate_structural(def: &WorkerDefinition) -> Result<(), DefinitionError> {
    if def.worker_id.trim().is_empty() {
        return Err(DefinitionError::InvalidWorkerId(def.worker_id.clone()));
    }
    if def.runtime.workspace_template.trim().is_empty() {
        return Err(DefinitionError::Malformed("runtime.workspace_template must not be empty".to_string()));
    }
    Ok(())
}

/// Layer 3: every string-valued field scanned against [`FORBIDDEN_PATTERNS`].
pub fn scan_forbidden_patterns(def: &WorkerDefinition) -> Result<(), DefinitionError> {
    let fields: Vec<(&str, &str)> = std::iter::once(("identity.system_prompt", def.identity.system_prompt.as_str()))
        .chain(std::iter::once(("identity.name", def.identity.name.as_str())))
        .chain(def.identity.onboarding_steps.iter().map(|s| ("identity.onboarding_steps", s.as_str())))
        .chain(def.runtime.tools.iter().map(|s| ("runtime.tools", s.as_str())))
        .chain(def.constraints.iter().map(|c| ("constraints.value", c.value.as_str())))
        .collect();

    for (field, value) in fields {
        for (label, re) in FORBIDDEN_PATTERNS.iter() {
            if re.is_match(value) {
                return Err(DefinitionError::Impure { field: field.to_string(), pattern: (*label).to_string() });
            }
        }
    }
    Ok(())
}

/// Layer 4: semantic cross-checks against live registries — every
/// constraint's `witness_id` must resolve, `trust_level` is already
/// constrained to the enum by `serde`, and `worker_id` matches
/// `[A-Za-z0-9_]+`.
pub fn validate_semantic(def: &WorkerDefinition, witnesses: &WitnessRegistry) -> Result<(), DefinitionError> {
    if !def.worker_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DefinitionError::InvalidWorkerId(def.worker_id.clone()));
    }
    for constraint in &def.constraints {
        if !witnesses.contains(&constraint.witness) {
            return Err(DefinitionError::UnknownWitness {
                constraint_id: constraint.constraint_id.clone(),
                witness_id: constraint.witness.clone(),
            });
        }
    }
    Ok(())
}

/// Run all four validation layers over `yaml`, returning the parsed,
/// fully-validated definition.
pub fn load_and_validate(yaml: &str, witnesses: &WitnessRegistry) -> Result<WorkerDefinition, DefinitionError> {
    let def = safe_parse(yaml)?;
    validate_structural(&def)?;
    scan_forbidden_patterns(&def)?;
    validate_semantic(&def, witnesses)?;
    Ok(def)
}

/// Known-valid `trust_level` values, exposed for callers building their own
/// structural messages.
pub fn trust_levels() -> FxHashSet<&'static str> {
    ["trusted", "sandboxed", "restricted"].into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::enforcement::builtin_witness_registry;

    const VALID_YAML: &str = r#"
worker_id: billing_agent
identity:
  name: Billing Agent
  system_prompt: You help customers review invoices.
  onboarding_steps:
    - read the billing FAQ
constraints:
  - constraint_id: max_file_size
    witness: file_size
    value: "1000000"
    feedback: log
runtime:
  workspace_template: "/workspaces/{journey_id}"
  tools: ["read_invoice"]
  session_persistence: true
trust_level: sandboxed
audit:
  log_all_actions: true
  execution_channel: audit.log
  retention_days: 30
"#;

    #[test]
    fn parses_and_validates_a_clean_definition() {
        let registry = builtin_witness_registry();
        let def = load_and_validate(VALID_YAML, &registry).expect("valid definition");
        assert_eq!(def.worker_id, "billing_agent");
        assert_eq!(def.trust_level, TrustLevel::Sandboxed);
        assert_eq!(def.constraints.len(), 1);
    }

    #[test]
    fn rejects_impure_system_prompt() {
        let registry = builtin_witness_registry();
        let yaml = VALID_YAML.replace(
            "You help customers review invoices.",
            "You help customers; eval(\"rm -rf /\")",
        );
        let err = load_and_validate(&yaml, &registry).unwrap_err();
        assert!(matches!(err, DefinitionError::Impure { .. }));
    }

    #[test]
    fn rejects_unknown_witness() {
        let registry = builtin_witness_registry();
        let yaml = VALID_YAML.replace("witness: file_size", "witness: does_not_exist");
        let err = load_and_validate(&yaml, &registry).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownWitness { .. }));
    }

    #[test]
    fn rejects_malformed_worker_id() {
        let registry = builtin_witness_registry();
        let yaml = VALID_YAML.replace("worker_id: billing_agent", "worker_id: \"bad id!\"");
        let err = load_and_validate(&yaml, &registry).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidWorkerId(_)));
    }
}
