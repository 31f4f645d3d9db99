//! MCP request handler implementation.

use crate::error::ProtocolResult;
use crate::protocol::{
    CallToolParams, CallToolResult, ClientIdentity, ErrorBody, Handler, InitializeParams,
    InitializeResult, ListResourcesResult, ListToolsResult, MCP_VERSION, ReadResourceParams,
    ReadResourceResult, ResourcesCapability, ServerCapabilities, ServerInfo, ToolsCapability,
};
use crate::server::state::ServerState;
use crate::tools::ObjectCatalog;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct McpHandler {
    state: Arc<ServerState>,
}

impl McpHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }
}

#[async_trait]
impl Handler for McpHandler {
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult> {
        info!(
            "Initialize request from {} v{}",
            params.client_info.name, params.client_info.version
        );
        if params.protocol_version != MCP_VERSION {
            debug!(
                requested = %params.protocol_version,
                "Client asked for a different protocol version, answering with ours"
            );
        }

        let limits = self.state.gatekeeper.limits();
        let instructions = format!(
            "Read-only database access. Read the 'db://tables' and 'db://views' resources to \
             see what exists, use 'describe_table' to inspect a table's columns and \
             'query_database' to run a single SELECT statement (at most {} rows, {} by \
             default). Every request is rate limited per client and recorded in an audit trail.",
            limits.max_rows, limits.default_row_limit
        );

        Ok(InitializeResult {
            protocol_version: MCP_VERSION.into(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                resources: Some(ResourcesCapability {
                    subscribe: Some(false),
                    list_changed: Some(false),
                }),
            },
            server_info: ServerInfo {
                name: self.state.config.name.to_string(),
                version: self.state.config.version.to_string(),
            },
            instructions: Some(instructions),
        })
    }

    async fn initialized(&self) -> ProtocolResult<()> {
        info!("Server initialized successfully");
        Ok(())
    }

    async fn shutdown(&self) -> ProtocolResult<()> {
        info!("Shutdown request received");
        Ok(())
    }

    async fn list_tools(&self) -> ProtocolResult<ListToolsResult> {
        let tools = self.state.tools.list();
        debug!("Listing {} tools", tools.len());

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    /// Refusals are tool results with `isError`, not protocol errors, so the
    /// agent sees the error body.
    async fn call_tool(
        &self,
        client: &ClientIdentity,
        params: CallToolParams,
    ) -> ProtocolResult<CallToolResult> {
        let client_id = client.key();
        let sequence = self.state.next_request_id();
        debug!(tool = %params.name, %client_id, sequence, "Tool call");

        match self.state.tools.execute(params, &client_id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(error = %e, "Tool call failed");
                Ok(CallToolResult::failure(&ErrorBody::from(&e)))
            }
        }
    }

    async fn list_resources(&self) -> ProtocolResult<ListResourcesResult> {
        Ok(ObjectCatalog::resources())
    }

    async fn read_resource(
        &self,
        client: &ClientIdentity,
        params: ReadResourceParams,
    ) -> ProtocolResult<ReadResourceResult> {
        let sequence = self.state.next_request_id();
        debug!(uri = %params.uri, client_id = %client, sequence, "Resource read");
        self.state.catalog.read(&client.key(), &params.uri).await
    }
}
