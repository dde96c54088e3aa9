//! [`ToolProvider`] and [`Managed`] façade over an [`McpClient`].
//!
//! Discovered server tools surface through the registry like any in-process
//! tool; the supervisor drives the subprocess lifecycle through the same
//! seam it uses for everything else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::client::McpClient;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::supervisor::{Managed, ProviderKind};
use crate::tools::traits::{ToolDescriptor, ToolProvider, ToolResult};

/// Health-probe deadline used by [`Managed::health_check`].
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// An external tool server exposed as a [`ToolProvider`].
pub struct McpToolProvider {
    client: Arc<McpClient>,
}

impl McpToolProvider {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }
}

#[async_trait]
impl ToolProvider for McpToolProvider {
    fn id(&self) -> &str {
        self.client.provider_id()
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        let config = self.client.config();
        self.client
            .tools()
            .into_iter()
            .map(|tool| ToolDescriptor {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
                provider_id: config.id.clone(),
                permission_level: config.permission_level,
                requires_confirmation: false,
            })
            .collect()
    }

    async fn call(&self, name: &str, arguments: Value, cancel: CancelToken) -> Result<ToolResult> {
        // MCP offers no standard cancel notification: cancellation abandons
        // the waiter (the pending entry is removed when this future drops)
        // and the child is left to finish on its own.
        tokio::select! {
            _ = cancel.cancelled() => Err(crate::error::EngineError::Cancelled),
            result = self.client.call_tool(name, arguments, None) => result,
        }
    }
}

#[async_trait]
impl Managed for McpToolProvider {
    fn id(&self) -> &str {
        self.client.provider_id()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::External
    }

    fn auto_restart(&self) -> bool {
        self.client.config().auto_restart
    }

    async fn start(&self) -> Result<()> {
        self.client.start().await
    }

    async fn health_check(&self) -> bool {
        self.client.ping(PING_TIMEOUT).await
    }

    async fn stop(&self) {
        self.client.shutdown().await;
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::mcp::client::McpServerConfig;
    use crate::security::{SecurityConfig, SecurityPolicy};
    use crate::tools::registry::{RegistryConfig, ToolRegistry};
    use crate::tools::traits::PermissionLevel;

    const FAKE_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"notifications/initialized"'*) ;;
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"files","version":"1.0.0"},"capabilities":{"tools":{}}}}' ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"list_dir","description":"List a directory","inputSchema":{"type":"object","properties":{"dest":{"type":"string"}}}}]}}' ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"x.txt y.txt"}],"isError":false}}' ;;
  esac
done
"#;

    fn provider(id: &str) -> McpToolProvider {
        let config = McpServerConfig::new(id, "sh")
            .with_args(vec!["-c".into(), FAKE_SERVER.into()]);
        McpToolProvider::new(Arc::new(McpClient::new(config, None)))
    }

    fn open_policy() -> Arc<SecurityPolicy> {
        Arc::new(
            SecurityPolicy::new(SecurityConfig {
                sandbox_block: vec![],
                blocked_patterns: vec![],
                confirmation_levels: vec![],
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn descriptors_appear_after_start() {
        let provider = provider("files");
        assert!(provider.descriptors().is_empty(), "no tools before start");

        Managed::start(&provider).await.unwrap();
        let descriptors = provider.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "list_dir");
        assert_eq!(descriptors[0].provider_id, "files");
        assert_eq!(descriptors[0].permission_level, PermissionLevel::Execute);

        Managed::stop(&provider).await;
    }

    #[tokio::test]
    async fn round_trip_through_registry() {
        // Round trip: the discovered schema both builds the LM catalog entry
        // and accepts a well-formed argument object at dispatch time.
        let provider = provider("files");
        Managed::start(&provider).await.unwrap();
        let client = Arc::clone(provider.client());

        let mut registry = ToolRegistry::new(open_policy(), RegistryConfig::default());
        registry.register(Arc::new(provider)).unwrap();

        let specs = registry.tools_for_llm();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "list_dir");

        let args = serde_json::json!({"dest": "."});
        assert!(
            crate::tools::schema::validate_arguments(&specs[0].input_schema, &args).is_ok(),
            "catalog schema accepts a well-formed argument object"
        );

        let result = registry
            .dispatch(
                &crate::ai::types::ToolCall {
                    id: "a".into(),
                    name: "list_dir".into(),
                    arguments: args,
                },
                None,
                CancelToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.text, "x.txt y.txt");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_returns_without_killing_child() {
        let provider = provider("files");
        Managed::start(&provider).await.unwrap();

        let token = CancelToken::new();
        token.cancel();
        let result = provider
            .call("list_dir", serde_json::json!({}), token)
            .await;
        assert!(matches!(result, Err(crate::error::EngineError::Cancelled)));
        assert!(provider.client().is_alive(), "child survives cancellation");

        Managed::stop(&provider).await;
    }
}
