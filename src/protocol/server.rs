//! MCP server with lifecycle management.

use crate::error::{McpError, ProtocolError, Result};
use crate::protocol::handler::{Dispatcher, Handler};
use crate::protocol::transport::{StdioTransport, Transport};
use crate::protocol::types::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Server state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Server created but not initialized.
    Created,
    /// Initialize request received, awaiting initialized notification.
    Initializing,
    /// Server is fully operational.
    Running,
    /// Shutdown requested.
    ShuttingDown,
    /// Server has stopped.
    Stopped,
}

/// MCP Server.
pub struct McpServer<H: Handler> {
    info: ServerInfo,
    capabilities: ServerCapabilities,
    handler: Arc<H>,
    state: Arc<RwLock<ServerState>>,
    running: AtomicBool,
}

impl<H: Handler + 'static> McpServer<H> {
    /// Create a new MCP server.
    pub fn new(handler: H, info: ServerInfo, capabilities: ServerCapabilities) -> Self {
        Self {
            info,
            capabilities,
            handler: Arc::new(handler),
            state: Arc::new(RwLock::new(ServerState::Created)),
            running: AtomicBool::new(false),
        }
    }

    /// Get current server state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Check if server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the server with stdio transport.
    #[instrument(skip(self), fields(server = %self.info.name))]
    pub async fn run(self) -> Result<()> {
        let transport = Arc::new(StdioTransport::stdio());
        self.run_with_transport(transport).await
    }

    /// Run the server with a custom transport. Returns after end of input
    /// or a `shutdown` request, once every in-flight request has answered.
    pub async fn run_with_transport<T: Transport + 'static>(self, transport: Arc<T>) -> Result<()> {
        info!(
            "Starting MCP server: {} v{}",
            self.info.name, self.info.version
        );
        self.running.store(true, Ordering::SeqCst);

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&self.handler)));
        let mut in_flight = JoinSet::new();

        while self.running.load(Ordering::SeqCst) {
            // Reap finished request tasks as we go.
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Request task failed: {}", e);
                }
            }

            let message = match transport.read_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!("EOF received, shutting down");
                    break;
                }
                Err(McpError::Protocol(ProtocolError::ParseError)) => {
                    let response = JsonRpcResponse::failure(None, ProtocolError::ParseError.into());
                    if let Err(e) = transport.write_response(&response).await {
                        error!("Failed to send error response: {}", e);
                    }
                    continue;
                }
                Err(e) => {
                    error!("Transport error: {}", e);
                    break;
                }
            };

            let request = match message {
                Message::Request(request) => request,
                Message::Response(response) => {
                    warn!("Unexpected response received: {:?}", response.id);
                    continue;
                }
            };

            // Lifecycle methods run in order on this loop. Everything else
            // gets its own task so a slow query never blocks the next request.
            let method = Method::parse(&request.method);
            self.update_state_for_method(method).await;

            if method.is_some_and(|m| m.is_lifecycle()) {
                respond(transport.as_ref(), &dispatcher, request).await;
                if method == Some(Method::Shutdown) {
                    info!("Shutdown request received");
                    self.running.store(false, Ordering::SeqCst);
                }
            } else {
                let transport = Arc::clone(&transport);
                let dispatcher = Arc::clone(&dispatcher);
                in_flight.spawn(async move {
                    respond(transport.as_ref(), &dispatcher, request).await;
                });
            }
        }

        if !in_flight.is_empty() {
            info!(pending = in_flight.len(), "Waiting for in-flight requests");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Request task failed: {}", e);
            }
        }

        *self.state.write().await = ServerState::Stopped;
        info!("Server stopped");
        Ok(())
    }

    /// Update server state based on the method being processed.
    async fn update_state_for_method(&self, method: Option<Method>) {
        let mut state = self.state.write().await;
        match method {
            Some(Method::Initialize) => {
                if *state == ServerState::Created {
                    *state = ServerState::Initializing;
                }
            }
            Some(Method::Initialized) => {
                if *state == ServerState::Initializing {
                    *state = ServerState::Running;
                    info!("Server initialized and running");
                }
            }
            Some(Method::Shutdown) => {
                *state = ServerState::ShuttingDown;
            }
            _ => {}
        }
    }

    /// Stop the server.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }
}

async fn respond<H: Handler, T: Transport + ?Sized>(
    transport: &T,
    dispatcher: &Dispatcher<H>,
    request: JsonRpcRequest,
) {
    let is_notification = request.is_notification();
    let response = dispatcher.dispatch(request).await;
    if !is_notification && let Err(e) = transport.write_response(&response).await {
        error!("Failed to send response: {}", e);
    }
}

/// Builder for MCP Server.
pub struct McpServerBuilder<H: Handler> {
    handler: Option<H>,
    name: String,
    version: String,
    capabilities: ServerCapabilities,
}

impl<H: Handler + 'static> McpServerBuilder<H> {
    pub fn new() -> Self {
        Self {
            handler: None,
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            capabilities: ServerCapabilities::default(),
        }
    }

    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_tools(mut self) -> Self {
        self.capabilities.tools = Some(ToolsCapability {
            list_changed: Some(false),
        });
        self
    }

    pub fn with_resources(mut self) -> Self {
        self.capabilities.resources = Some(ResourcesCapability {
            subscribe: Some(false),
            list_changed: Some(false),
        });
        self
    }

    pub fn build(self) -> Result<McpServer<H>> {
        let handler = self.handler.ok_or_else(|| McpError::Internal {
            message: "Handler is required".into(),
        })?;

        Ok(McpServer::new(
            handler,
            ServerInfo {
                name: self.name,
                version: self.version,
            },
            self.capabilities,
        ))
    }
}

impl<H: Handler + 'static> Default for McpServerBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolResult;
    use crate::protocol::transport::LineTransport;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct TestHandler;

    #[async_trait]
    impl Handler for TestHandler {
        async fn initialize(&self, _params: InitializeParams) -> ProtocolResult<InitializeResult> {
            Ok(InitializeResult {
                protocol_version: MCP_VERSION.into(),
                capabilities: ServerCapabilities::default(),
                server_info: ServerInfo {
                    name: "test".into(),
                    version: "1.0".into(),
                },
                instructions: None,
            })
        }

        async fn list_tools(&self) -> ProtocolResult<ListToolsResult> {
            Ok(ListToolsResult::default())
        }

        async fn call_tool(
            &self,
            _client: &ClientIdentity,
            params: CallToolParams,
        ) -> ProtocolResult<CallToolResult> {
            if params.name == "slow" {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(CallToolResult::text(params.name))
        }
    }

    #[test]
    fn test_server_builder() {
        let server = McpServerBuilder::new()
            .handler(TestHandler)
            .name("test-server")
            .version("0.1.0")
            .with_tools()
            .with_resources()
            .build()
            .unwrap();

        assert_eq!(server.info.name, "test-server");
        assert_eq!(server.info.version, "0.1.0");
        assert!(server.capabilities().tools.is_some());
        assert!(server.capabilities().resources.is_some());
    }

    #[tokio::test]
    async fn test_server_state() {
        let server = McpServerBuilder::new().handler(TestHandler).build().unwrap();
        assert_eq!(server.state().await, ServerState::Created);
    }

    #[tokio::test]
    async fn test_garbage_line_gets_parse_error() {
        let (client, server_io) = tokio::io::duplex(16 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let transport = Arc::new(LineTransport::new(BufReader::new(server_read), server_write));
        let server = McpServerBuilder::new().handler(TestHandler).build().unwrap();
        let running = tokio::spawn(server.run_with_transport(transport));

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"{not json\n").await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let response: JsonRpcResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response.id, None);
        assert_eq!(response.error().unwrap().code, -32700);

        client_write.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_call_does_not_block_next_request() {
        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let transport = Arc::new(LineTransport::new(BufReader::new(server_read), server_write));
        let server = McpServerBuilder::new().handler(TestHandler).build().unwrap();
        let running = tokio::spawn(server.run_with_transport(transport));

        let (client_read, mut client_write) = tokio::io::split(client);
        let calls = [
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"slow"}}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"fast"}}"#,
        ];
        for call in calls {
            client_write.write_all(call.as_bytes()).await.unwrap();
            client_write.write_all(b"\n").await.unwrap();
        }

        let mut lines = BufReader::new(client_read).lines();
        let first: JsonRpcResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.id, Some(RequestId::Number(2)));

        // End of input waits for the slow call before returning.
        client_write.shutdown().await.unwrap();
        let second: JsonRpcResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.id, Some(RequestId::Number(1)));
        running.await.unwrap().unwrap();
    }
}
