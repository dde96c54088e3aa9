//! Declarative engine configuration.
//!
//! Every section carries `#[serde(default)]` so a partially-filled config
//! deserializes cleanly; missing sections fall back to their `Default` impl.
//! Parsing a config file (and its format) is the host application's job —
//! this module only defines the shape and validates it.
//!
//! API keys never live in the config itself: a backend entry names the
//! environment variable that holds its key.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ai::context::ContextConfig;
use crate::ai::provider::LlmBackend;
use crate::ai::providers::{OpenAiCompatibleBackend, OpenAiCompatibleConfig};
use crate::ai::router::{BackendRegistration, ModelCatalog, RouterPolicy};
use crate::agent::DispatchConfig;
use crate::error::{EngineError, Result};
use crate::mcp::McpServerConfig;
use crate::security::SecurityConfig;
use crate::supervisor::SupervisorConfig;
use crate::tools::registry::RegistryConfig;

// ─── Backend entries ─────────────────────────────────────────────────────────

/// Well-known OpenAI-compatible deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    OpenAi,
    Anthropic,
    Ollama,
    OpenRouter,
    /// Any other OpenAI-compatible endpoint; requires `base_url`.
    Custom,
}

/// One LM backend registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub id: String,
    pub kind: BackendKind,
    /// Required for `Custom`; overrides the kind's default otherwise.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key. Absent for keyless local
    /// deployments.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Model ids per capability tier.
    pub models: ModelCatalog,
    /// Static cost ranking; lower is cheaper.
    #[serde(default)]
    pub cost_rank: u32,
    /// Whether the backend runs on this machine.
    #[serde(default)]
    pub local: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_context_limit() -> usize {
    128_000
}

impl BackendConfig {
    /// Instantiate the adapter this entry describes.
    pub fn build(&self) -> Result<BackendRegistration> {
        let api_key = match &self.api_key_env {
            Some(var) => std::env::var(var).map_err(|_| {
                EngineError::Config(format!(
                    "backend '{}': environment variable '{var}' is not set",
                    self.id
                ))
            })?,
            None => String::new(),
        };

        let mut config = match self.kind {
            BackendKind::OpenAi => OpenAiCompatibleConfig::openai(api_key),
            BackendKind::Anthropic => OpenAiCompatibleConfig::anthropic(api_key),
            BackendKind::Ollama => OpenAiCompatibleConfig::ollama(),
            BackendKind::OpenRouter => OpenAiCompatibleConfig::openrouter(api_key),
            BackendKind::Custom => {
                let base_url = self.base_url.clone().ok_or_else(|| {
                    EngineError::Config(format!(
                        "backend '{}': custom backends require base_url",
                        self.id
                    ))
                })?;
                OpenAiCompatibleConfig::new(api_key, base_url)
            }
        };
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        config = config
            .timeout(Duration::from_millis(self.request_timeout_ms))
            .context_limit(self.context_limit);

        let backend = OpenAiCompatibleBackend::new(config, self.id.clone())
            .map_err(|e| EngineError::Config(format!("backend '{}': {e}", self.id)))?;
        Ok(BackendRegistration {
            id: self.id.clone(),
            backend: std::sync::Arc::new(backend) as std::sync::Arc<dyn LlmBackend>,
            models: self.models.clone(),
            cost_rank: self.cost_rank,
            local: self.local,
        })
    }
}

// ─── EngineConfig ────────────────────────────────────────────────────────────

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// LM backends, in registration order.
    pub backends: Vec<BackendConfig>,
    pub router: RouterPolicy,
    pub context: ContextConfig,
    pub dispatch: DispatchConfig,
    pub registry: RegistryConfig,
    pub security: SecurityConfig,
    pub supervisor: SupervisorConfig,
    /// External tool servers to spawn and register.
    pub tool_servers: Vec<McpServerConfig>,
}

impl EngineConfig {
    /// Startup validation. Configuration problems are fatal here and never
    /// surface at runtime.
    pub fn validate(&self) -> Result<()> {
        let mut backend_ids = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.id.is_empty() {
                return Err(EngineError::Config("backend id must not be empty".into()));
            }
            if !backend_ids.insert(&backend.id) {
                return Err(EngineError::Config(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
            if backend.kind == BackendKind::Custom && backend.base_url.is_none() {
                return Err(EngineError::Config(format!(
                    "backend '{}': custom backends require base_url",
                    backend.id
                )));
            }
        }

        for id in &self.router.fallback_order {
            if !backend_ids.contains(id) {
                return Err(EngineError::Config(format!(
                    "fallback_order names unknown backend '{id}'"
                )));
            }
        }
        if let Some(default) = &self.router.default_provider {
            if !backend_ids.contains(default) {
                return Err(EngineError::Config(format!(
                    "default_provider names unknown backend '{default}'"
                )));
            }
        }

        let mut server_ids = std::collections::HashSet::new();
        for server in &self.tool_servers {
            if server.command.is_empty() {
                return Err(EngineError::Config(format!(
                    "tool server '{}' has an empty command",
                    server.id
                )));
            }
            if !server_ids.insert(&server.id) {
                return Err(EngineError::Config(format!(
                    "duplicate tool server id '{}'",
                    server.id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ollama_backend(id: &str) -> BackendConfig {
        BackendConfig {
            id: id.into(),
            kind: BackendKind::Ollama,
            base_url: None,
            api_key_env: None,
            models: ModelCatalog::uniform("llama3"),
            cost_rank: 0,
            local: true,
            request_timeout_ms: default_request_timeout_ms(),
            context_limit: default_context_limit(),
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn duplicate_backend_ids_rejected() {
        let config = EngineConfig {
            backends: vec![ollama_backend("a"), ollama_backend("a")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn fallback_order_must_name_known_backends() {
        let config = EngineConfig {
            backends: vec![ollama_backend("a")],
            router: RouterPolicy {
                fallback_order: vec!["a".into(), "ghost".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn custom_backend_requires_base_url() {
        let mut backend = ollama_backend("c");
        backend.kind = BackendKind::Custom;
        let config = EngineConfig {
            backends: vec![backend],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn empty_tool_server_command_rejected() {
        let config = EngineConfig {
            tool_servers: vec![McpServerConfig::new("files", "")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn keyless_local_backend_builds() {
        let registration = ollama_backend("local").build().unwrap();
        assert_eq!(registration.id, "local");
        assert!(registration.local);
        assert_eq!(registration.models.fast, "llama3");
    }

    #[test]
    fn missing_api_key_env_is_config_error() {
        let backend = BackendConfig {
            kind: BackendKind::OpenAi,
            api_key_env: Some("ORDIS_TEST_KEY_THAT_DOES_NOT_EXIST".into()),
            ..ollama_backend("remote")
        };
        assert!(matches!(backend.build(), Err(EngineError::Config(_))));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EngineConfig {
            backends: vec![ollama_backend("a")],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let back: EngineConfig = serde_json::from_str(r#"{"router": {"local_first": true}}"#).unwrap();
        assert!(back.router.local_first);
        assert_eq!(back.dispatch.max_turns, 10);
        assert_eq!(back.registry.max_parallel_tools, 4);
    }
}
