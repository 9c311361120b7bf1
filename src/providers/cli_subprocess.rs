//! CLI-subprocess provider: spawns a JSON-emitting CLI agent (e.g. a local
//! `claude`-style binary), optionally via `docker exec <container>` (§4.G).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::channels::{PartialUpdate, StateSnapshot};

use super::{build_output, read_session_id, AgentProvider, ProviderError, TokenUsage};

#[derive(Debug, Deserialize)]
struct CliResponse {
    #[serde(default)]
    result: String,
    session_id: Option<String>,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    num_turns: u32,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    duration_api_ms: u64,
    #[serde(default)]
    is_error: bool,
}

/// Spawns `binary -p <prompt> --output-format json --model <model> --max-turns
/// N --allowedTools a,b,c [--resume <session>]`, reading one JSON document
/// from stdout. `container` prefixes the whole command with `docker exec
/// <container>`.
pub struct CliSubprocessProvider {
    role: String,
    binary: String,
    model: String,
    allowed_tools: Vec<String>,
    max_turns: u32,
    timeout_per_turn: Duration,
    cwd: Option<String>,
    container: Option<String>,
}

impl CliSubprocessProvider {
    #[must_use]
    pub fn new(role: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            binary: binary.into(),
            model: "sonnet".to_string(),
            allowed_tools: vec!["Read".into(), "Grep".into(), "Glob".into()],
            max_turns: 10,
            timeout_per_turn: Duration::from_secs(30),
            cwd: None,
            container: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    #[must_use]
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    #[must_use]
    pub fn with_timeout_per_turn(mut self, timeout: Duration) -> Self {
        self.timeout_per_turn = timeout;
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    fn build_command(&self, prompt: &str, session_id: Option<&str>) -> Command {
        let (program, mut args) = if let Some(container) = &self.container {
            ("docker".to_string(), vec!["exec".to_string(), container.clone(), self.binary.clone()])
        } else {
            (self.binary.clone(), Vec::new())
        };

        args.extend([
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
            "--allowedTools".to_string(),
            self.allowed_tools.join(","),
        ]);
        if let Some(session_id) = session_id {
            args.extend(["--resume".to_string(), session_id.to_string()]);
        }

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        if self.container.is_none() {
            if let Some(cwd) = &self.cwd {
                cmd.current_dir(cwd);
            }
        }
        cmd
    }

    fn timeout(&self) -> Duration {
        self.timeout_per_turn * self.max_turns
    }
}

#[async_trait]
impl AgentProvider for CliSubprocessProvider {
    async fn execute_task(&self, task: &str, state: &StateSnapshot) -> Result<PartialUpdate, ProviderError> {
        let session_id = read_session_id(&self.role, state);
        let mut command = self.build_command(task, session_id.as_deref());
        let timeout = self.timeout();

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| ProviderError::Timeout { provider: self.name(), elapsed_ms: timeout.as_millis() as u64 })?
            .map_err(|err| ProviderError::Failure { provider: self.name(), message: err.to_string() })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProviderError::Failure {
                provider: self.name(),
                message: if stderr.is_empty() { format!("exited with {}", output.status) } else { stderr },
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: CliResponse = serde_json::from_str(&stdout)
            .map_err(|err| ProviderError::Response { provider: self.name(), message: err.to_string() })?;

        if parsed.is_error {
            return Err(ProviderError::Failure { provider: self.name(), message: parsed.result });
        }

        let tokens = TokenUsage {
            cost: parsed.total_cost_usd,
            turns: parsed.num_turns,
            duration_ms: parsed.duration_ms,
            duration_api_ms: parsed.duration_api_ms,
        };

        Ok(build_output(&self.role, parsed.result, parsed.session_id.or(session_id), tokens))
    }

    fn name(&self) -> &'static str {
        "cli_subprocess"
    }

    fn metadata(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("provider".into(), Value::String("cli_subprocess".into()));
        map.insert("model".into(), Value::String(self.model.clone()));
        map.insert("role".into(), Value::String(self.role.clone()));
        map.insert(
            "container".into(),
            Value::String(self.container.clone().unwrap_or_else(|| "local".to_string())),
        );
        map
    }

    fn estimate_cost(&self, _input_tokens: u64, _output_tokens: u64) -> f64 {
        // The CLI reports actual spend in `total_cost_usd`; this estimate is
        // only used before a response exists.
        0.0
    }

    fn role(&self) -> &str {
        &self.role
    }
}
