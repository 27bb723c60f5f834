//! Tool discovery across configured servers

use std::sync::Arc;

use futures_util::future::join_all;

use super::registry::{RegisteredTool, ToolRegistry};
use super::runner::ToolRunner;

/// Query every configured server and replace the registry contents.
///
/// A server that fails to start or list is logged and skipped; its tools
/// simply disappear until the next discovery. Returns the number of tools
/// registered.
pub async fn discover(runner: &ToolRunner, registry: &Arc<ToolRegistry>, servers: &[String]) -> usize {
    let mut servers: Vec<&String> = servers.iter().collect();
    servers.sort();

    let listings = join_all(servers.iter().map(|server| async move {
        (server.as_str(), runner.list_tools(server).await)
    }))
    .await;

    let mut tools: Vec<RegisteredTool> = Vec::new();
    for (server, listing) in listings {
        match listing {
            Ok(found) => {
                tracing::info!(server, count = found.len(), "discovered tools");
                tools.extend(found);
            }
            Err(e) => tracing::warn!(server, "tool discovery failed: {}", e),
        }
    }

    let count = tools.len();
    registry.replace_all(tools);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, ProxyConfig};

    #[tokio::test]
    async fn test_failing_servers_are_skipped() {
        let config = ProxyConfig::from_toml(
            "[mcp_servers.ghost]\ncommand = \"definitely-not-a-real-binary-4f1c\"\n",
        )
        .unwrap();
        let runner = ToolRunner::new(ConfigHandle::new(config));
        let registry = Arc::new(ToolRegistry::new());
        registry.add(RegisteredTool::new("ghost", "stale", None, None));

        let count = discover(&runner, &registry, &["ghost".to_string()]).await;
        assert_eq!(count, 0);
        assert!(registry.is_empty());
    }
}
