//! Environment config file loader (§6): `{checkpointer, observability,
//! llm_providers, server, auth}` parsed from YAML with `${NAME}` /
//! `${NAME:default}` substitution against `dotenvy`-populated environment
//! variables, applied to every string value before `serde_yaml` deserializes
//! the result.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use miette::Diagnostic;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    #[diagnostic(code(stepgraph::runtimes::config::read), help("Check the file exists and is readable."))]
    Read { path: String, #[source] source: std::io::Error },

    #[error("environment variable {name:?} referenced by ${{{name}}} is not set and has no default")]
    #[diagnostic(code(stepgraph::runtimes::config::missing_env), help("Set the variable or use `${{{name}:default}}` syntax."))]
    MissingEnvVar { name: String },

    #[error("checkpointer config is missing required field {field}")]
    #[diagnostic(code(stepgraph::runtimes::config::missing_field))]
    MissingField { field: String },

    #[error("checkpointer type {kind:?} is unsupported, or its storage feature is not compiled in")]
    #[diagnostic(code(stepgraph::runtimes::config::unsupported_checkpointer), help("Enable the `sqlite` or `postgres` feature, or use a supported type."))]
    UnsupportedCheckpointerType { kind: String },

    #[error("failed to parse config file {path} as YAML: {source}")]
    #[diagnostic(code(stepgraph::runtimes::config::parse))]
    Parse { path: String, #[source] source: serde_yaml::Error },
}

#[derive(Clone, Debug, Deserialize)]
pub struct CheckpointerFileConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: Option<String>,
    pub url: Option<String>,
    pub pool_size: Option<u32>,
}

impl CheckpointerFileConfig {
    /// Map `type: embedded|sql` to the matching [`CheckpointerType`], per
    /// whichever storage features are compiled in. `pool_size` is accepted
    /// by the schema but the current backends size their own pools (§4.D).
    pub fn to_checkpointer_type(&self) -> Result<super::checkpointer::CheckpointerType, ConfigError> {
        match self.kind.as_str() {
            #[cfg(feature = "sqlite")]
            "embedded" => {
                let path = self
                    .path
                    .clone()
                    .ok_or_else(|| ConfigError::MissingField { field: "checkpointer.path".to_string() })?;
                Ok(super::checkpointer::CheckpointerType::Embedded { path })
            }
            #[cfg(feature = "postgres")]
            "sql" => {
                let url = self
                    .url
                    .clone()
                    .ok_or_else(|| ConfigError::MissingField { field: "checkpointer.url".to_string() })?;
                Ok(super::checkpointer::CheckpointerType::Sql { url })
            }
            other => Err(ConfigError::UnsupportedCheckpointerType { kind: other.to_string() }),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ObservabilityFileConfig {
    #[serde(default)]
    pub console: Option<bool>,
    #[serde(default)]
    pub remote: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LlmProviderFileConfig {
    #[serde(default)]
    pub enabled: bool,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub workers: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthFileConfig {
    pub api_key: Option<String>,
}

/// The full `{checkpointer, observability, llm_providers, server, auth}`
/// shape of a per-environment config file (§6).
#[derive(Clone, Debug, Deserialize)]
pub struct FileConfig {
    pub checkpointer: Option<CheckpointerFileConfig>,
    #[serde(default)]
    pub observability: ObservabilityFileConfig,
    #[serde(default)]
    pub llm_providers: HashMap<String, LlmProviderFileConfig>,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

impl FileConfig {
    /// Read `path`, substitute `${NAME}`/`${NAME:default}` against the
    /// process environment (after loading a `.env` file if present via
    /// `dotenvy`), and parse the result as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw, &path.display().to_string())
    }

    /// Substitute and parse an in-memory YAML document. Split out from
    /// [`Self::load`] so tests can exercise substitution without touching
    /// the filesystem.
    pub fn parse(raw: &str, source_name: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env(raw)?;
        serde_yaml::from_str(&substituted).map_err(|source| ConfigError::Parse {
            path: source_name.to_string(),
            source,
        })
    }
}

static ENV_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:([^}]*))?\}").unwrap());

/// Replace every `${NAME}` or `${NAME:default}` occurrence in `input` with
/// the named environment variable, or its default if the variable is unset.
/// `${NAME}` with no default and no set variable is a fatal
/// [`ConfigError::MissingEnvVar`].
fn substitute_env(input: &str) -> Result<String, ConfigError> {
    let mut err = None;
    let result = ENV_PATTERN.replace_all(input, |caps: &regex::Captures| {
        let name = &caps[1];
        let default = caps.get(3).map(|m| m.as_str());
        match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                err.get_or_insert(name.to_string());
                String::new()
            }
        }
    });
    let result = result.into_owned();
    match err {
        Some(name) => Err(ConfigError::MissingEnvVar { name }),
        None => Ok(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_set_variable() {
        std::env::set_var("STEPGRAPH_TEST_VAR_A", "hello");
        let out = substitute_env("value: ${STEPGRAPH_TEST_VAR_A}").unwrap();
        assert_eq!(out, "value: hello");
        std::env::remove_var("STEPGRAPH_TEST_VAR_A");
    }

    #[test]
    fn falls_back_to_default_when_unset() {
        std::env::remove_var("STEPGRAPH_TEST_VAR_B");
        let out = substitute_env("value: ${STEPGRAPH_TEST_VAR_B:fallback}").unwrap();
        assert_eq!(out, "value: fallback");
    }

    #[test]
    fn missing_var_with_no_default_errors() {
        std::env::remove_var("STEPGRAPH_TEST_VAR_C");
        let err = substitute_env("value: ${STEPGRAPH_TEST_VAR_C}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { name } if name == "STEPGRAPH_TEST_VAR_C"));
    }

    #[test]
    fn parses_full_shape() {
        std::env::set_var("STEPGRAPH_TEST_DB_PATH", "/data/stepgraph.db");
        let yaml = r#"
checkpointer:
  type: embedded
  path: ${STEPGRAPH_TEST_DB_PATH}
observability:
  console: true
llm_providers:
  openai:
    enabled: true
    base_url: ${STEPGRAPH_TEST_OPENAI_URL:https://api.openai.com/v1}
    default_model: gpt-4o
server:
  workers: 4
auth:
  api_key: ${STEPGRAPH_TEST_API_KEY:dev-key}
"#;
        let cfg = FileConfig::parse(yaml, "test.yaml").unwrap();
        assert_eq!(cfg.checkpointer.unwrap().path.as_deref(), Some("/data/stepgraph.db"));
        assert_eq!(cfg.observability.console, Some(true));
        assert!(cfg.llm_providers["openai"].enabled);
        assert_eq!(cfg.llm_providers["openai"].base_url.as_deref(), Some("https://api.openai.com/v1"));
        assert_eq!(cfg.server.workers, Some(4));
        assert_eq!(cfg.auth.api_key.as_deref(), Some("dev-key"));
        std::env::remove_var("STEPGRAPH_TEST_DB_PATH");
    }
}
