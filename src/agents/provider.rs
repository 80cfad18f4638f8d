//! AI provider invocation.
//!
//! The provider is an opaque command-line subprocess (the `claude`
//! interactive CLI). Core code builds a command string plus captured env
//! from `providers.*` and `models.{capability}` config; it knows nothing
//! about the wire protocol behind it.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::process;
use crate::config::{Config, ProviderType};
use crate::errors::{Error, Result};
use crate::store::Capability;

/// Binary name of the embedded AI CLI.
pub const PROVIDER_BIN: &str = "claude";

/// Default deadline for one-shot (non-interactive) provider calls.
const PROMPT_DEADLINE: Duration = Duration::from_secs(120);

/// Fallback model when neither config nor manifest name one.
const FALLBACK_MODEL: &str = "sonnet";

/// One-shot completion interface; mocked in tests, shelled out to the CLI
/// in production.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// A resolved invocation of the provider CLI.
#[derive(Debug, Clone)]
pub struct ProviderCommand {
    pub program: String,
    pub model: String,
    pub env: HashMap<String, String>,
}

impl ProviderCommand {
    /// Resolve model and environment for a capability.
    ///
    /// Model precedence: `config.models[capability]` > manifest default >
    /// fallback (callers pass the manifest default when they have one).
    pub fn for_capability(
        config: &Config,
        capability: Capability,
        manifest_default: Option<&str>,
    ) -> Self {
        let model = config
            .model_for(capability.as_str())
            .or(manifest_default)
            .unwrap_or(FALLBACK_MODEL)
            .to_string();

        let mut env = HashMap::new();
        for provider in config.providers.values() {
            if provider.provider_type == ProviderType::Gateway {
                if let Some(base_url) = &provider.base_url {
                    env.insert("ANTHROPIC_BASE_URL".to_string(), base_url.clone());
                }
            }
            if let Some(token_env) = &provider.auth_token_env {
                if let Ok(token) = std::env::var(token_env) {
                    env.insert(token_env.clone(), token);
                }
            }
        }

        Self {
            program: PROVIDER_BIN.to_string(),
            model,
            env,
        }
    }

    /// Shell line that boots the interactive CLI inside an agent pane.
    /// The capability definition rides in via `--append-system-prompt`.
    pub fn interactive_shell_line(&self, system_prompt_file: &Path) -> String {
        format!(
            "{} --model {} --append-system-prompt \"$(cat {})\"",
            self.program,
            self.model,
            shell_quote(&system_prompt_file.to_string_lossy())
        )
    }
}

/// Production client: one `claude -p` subprocess per completion.
pub struct CliProvider {
    command: ProviderCommand,
    cwd: Option<std::path::PathBuf>,
}

impl CliProvider {
    pub fn new(command: ProviderCommand, cwd: Option<std::path::PathBuf>) -> Self {
        Self { command, cwd }
    }
}

#[async_trait]
impl ProviderClient for CliProvider {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let output = process::run_command_with_stdin(
            &self.command.program,
            &["-p", "--model", &self.command.model],
            self.cwd.as_deref(),
            prompt,
            Some(PROMPT_DEADLINE),
        )
        .await?;

        if !output.success() {
            return Err(Error::Agent(format!(
                "provider exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Deterministic scripted client for tests.
pub struct MockProvider {
    responses: std::sync::Mutex<Vec<Result<String>>>,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

impl MockProvider {
    /// Responses are handed out in order; an exhausted mock errors.
    pub fn with_responses(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn always(response: &str) -> Self {
        Self::with_responses(vec![Ok(response.to_string())])
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(Error::Agent("mock provider exhausted".to_string()));
        }
        responses.remove(0)
    }
}

/// Strip a fenced code block if the model wrapped its answer in one.
pub fn strip_code_fence(response: &str) -> String {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // drop the language tag line, then everything up to the closing fence
    let body = rest.split_once('\n').map_or("", |(_, b)| b);
    let body = body.rsplit_once("```").map_or(body, |(b, _)| b);
    body.trim_end().to_string()
}

fn shell_quote(path: &str) -> String {
    // paths under .overstory contain no spaces by construction, but agent
    // base dirs may
    if path.contains(' ') {
        format!("'{path}'")
    } else {
        path.to_string()
    }
}
