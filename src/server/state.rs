//! Shared state behind the MCP handler.

use crate::config::GatekeeperConfig;
use crate::gatekeeper::Gatekeeper;
use crate::tools::{ObjectCatalog, ToolRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct ServerState {
    pub config: GatekeeperConfig,
    pub gatekeeper: Arc<Gatekeeper>,
    pub tools: ToolRegistry,
    pub catalog: ObjectCatalog,
    request_count: AtomicU64,
}

impl ServerState {
    pub fn new(config: GatekeeperConfig, gatekeeper: Arc<Gatekeeper>, tools: ToolRegistry) -> Self {
        Self {
            config,
            catalog: ObjectCatalog::new(Arc::clone(&gatekeeper)),
            gatekeeper,
            tools,
            request_count: AtomicU64::new(0),
        }
    }

    pub fn next_request_id(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }
}

pub struct ServerStateBuilder {
    config: Option<GatekeeperConfig>,
    gatekeeper: Option<Arc<Gatekeeper>>,
}

impl ServerStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            gatekeeper: None,
        }
    }

    pub fn config(mut self, config: GatekeeperConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn gatekeeper(mut self, gatekeeper: Arc<Gatekeeper>) -> Self {
        self.gatekeeper = Some(gatekeeper);
        self
    }

    pub fn build(self) -> Result<ServerState, &'static str> {
        let gatekeeper = self.gatekeeper.ok_or("Gatekeeper is required")?;
        let config = self.config.unwrap_or_default();
        let tools = crate::tools::create_registry(Arc::clone(&gatekeeper));

        Ok(ServerState::new(config, gatekeeper, tools))
    }
}

impl Default for ServerStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
