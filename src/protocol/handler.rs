//! Method routing for one connection.
//!
//! The [`Dispatcher`] owns the connection's [`ClientIdentity`]. It is created
//! anonymous, renamed once `initialize` succeeds, and handed to every tool
//! call and resource read so the gatekeeper can key its rate limits and
//! audit events on it.

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[async_trait]
pub trait Handler: Send + Sync {
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult>;

    async fn initialized(&self) -> ProtocolResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> ProtocolResult<()> {
        Ok(())
    }

    async fn ping(&self) -> ProtocolResult<()> {
        Ok(())
    }

    async fn list_tools(&self) -> ProtocolResult<ListToolsResult>;

    async fn call_tool(
        &self,
        client: &ClientIdentity,
        params: CallToolParams,
    ) -> ProtocolResult<CallToolResult>;

    async fn list_resources(&self) -> ProtocolResult<ListResourcesResult> {
        Ok(ListResourcesResult::default())
    }

    async fn read_resource(
        &self,
        _client: &ClientIdentity,
        _params: ReadResourceParams,
    ) -> ProtocolResult<ReadResourceResult> {
        Err(ProtocolError::MethodNotFound(Method::ReadResource.as_str().into()))
    }
}

pub struct Dispatcher<H: Handler> {
    handler: Arc<H>,
    client: RwLock<ClientIdentity>,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            client: RwLock::new(ClientIdentity::new()),
        }
    }

    /// Snapshot of the connection's identity.
    pub fn client(&self) -> ClientIdentity {
        self.client.read().clone()
    }

    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match self.route(&request).await {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                warn!(code = e.code(), error = %e, "Request failed");
                JsonRpcResponse::failure(id, e.into())
            }
        }
    }

    async fn route(&self, request: &JsonRpcRequest) -> ProtocolResult<Value> {
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(ProtocolError::InvalidRequest(
                format!("unsupported jsonrpc version {}", request.jsonrpc).into(),
            ));
        }

        let method = request.known_method()?;
        debug!(?method, "Dispatching");

        match method {
            Method::Initialize => {
                let params: InitializeParams = request.decode_params()?;
                let announced = params.client_info.clone();
                let result = self.handler.initialize(params).await?;

                {
                    let mut client = self.client.write();
                    client.announce(&announced);
                    info!(client_id = %client, "Client identified");
                }
                encode(&result)
            }
            Method::Initialized => {
                self.handler.initialized().await?;
                Ok(Value::Null)
            }
            Method::Shutdown => {
                self.handler.shutdown().await?;
                Ok(Value::Null)
            }
            Method::Ping => {
                self.handler.ping().await?;
                Ok(serde_json::json!({}))
            }
            Method::ListTools => encode(&self.handler.list_tools().await?),
            Method::CallTool => {
                let params = request.decode_params()?;
                let client = self.client();
                encode(&self.handler.call_tool(&client, params).await?)
            }
            Method::ListResources => encode(&self.handler.list_resources().await?),
            Method::ReadResource => {
                let params = request.decode_params()?;
                let client = self.client();
                encode(&self.handler.read_resource(&client, params).await?)
            }
        }
    }
}

fn encode<T: Serialize>(value: &T) -> ProtocolResult<Value> {
    serde_json::to_value(value).map_err(|e| ProtocolError::InternalError(e.to_string().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatekeeperError;
    use serde_json::json;

    /// Echoes the caller's key back from every tool call.
    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
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
            client: &ClientIdentity,
            _params: CallToolParams,
        ) -> ProtocolResult<CallToolResult> {
            Ok(CallToolResult::text(client.key()))
        }

        async fn read_resource(
            &self,
            _client: &ClientIdentity,
            _params: ReadResourceParams,
        ) -> ProtocolResult<ReadResourceResult> {
            Err(ProtocolError::Refused(GatekeeperError::PoolExhausted {
                waited: std::time::Duration::from_millis(20),
            }))
        }
    }

    fn initialize(name: &str) -> JsonRpcRequest {
        JsonRpcRequest::call(
            1,
            Method::Initialize,
            Some(json!({
                "protocolVersion": MCP_VERSION,
                "capabilities": {},
                "clientInfo": {"name": name, "version": "1.0"}
            })),
        )
    }

    fn call_echo(id: i64) -> JsonRpcRequest {
        JsonRpcRequest::call(id, Method::CallTool, Some(json!({"name": "echo"})))
    }

    fn echoed(response: &JsonRpcResponse) -> String {
        response.result().unwrap()["content"][0]["text"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_identity_follows_handshake() {
        let dispatcher = Dispatcher::new(Arc::new(EchoHandler));
        let session = dispatcher.client().session();

        let before = echoed(&dispatcher.dispatch(call_echo(2)).await);
        assert_eq!(before, format!("anonymous:{session}"));

        let response = dispatcher.dispatch(initialize("claude-desktop")).await;
        assert!(response.error().is_none());

        let after = echoed(&dispatcher.dispatch(call_echo(3)).await);
        assert_eq!(after, format!("claude-desktop:{session}"));
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let dispatcher = Dispatcher::new(Arc::new(EchoHandler));
        let mut request = JsonRpcRequest::call(7, Method::Ping, None);
        request.jsonrpc = "1.0".into();

        let response = dispatcher.dispatch(request).await;
        assert_eq!(response.error().unwrap().code, -32600);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let dispatcher = Dispatcher::new(Arc::new(EchoHandler));
        let request: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "unknown/method"}))
                .unwrap();

        let response = dispatcher.dispatch(request).await;
        assert!(response.result().is_none());
        assert_eq!(response.error().unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_missing_params() {
        let dispatcher = Dispatcher::new(Arc::new(EchoHandler));
        let response = dispatcher
            .dispatch(JsonRpcRequest::call(4, Method::CallTool, None))
            .await;
        assert_eq!(response.error().unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_refused_read_carries_error_body() {
        let dispatcher = Dispatcher::new(Arc::new(EchoHandler));
        let request =
            JsonRpcRequest::call(5, Method::ReadResource, Some(json!({"uri": "db://tables"})));

        let response = dispatcher.dispatch(request).await;
        let error = response.error().unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.data.as_ref().unwrap()["code"], "POOL_EXHAUSTED");
    }

    #[tokio::test]
    async fn test_default_resource_list_is_empty() {
        let dispatcher = Dispatcher::new(Arc::new(EchoHandler));
        let response = dispatcher
            .dispatch(JsonRpcRequest::call(6, Method::ListResources, None))
            .await;
        assert_eq!(response.result().unwrap()["resources"], json!([]));
    }
}
