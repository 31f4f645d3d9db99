//! MCP tools and resources, and the registry that serves them.

pub mod catalog;
pub mod query;
pub mod registry;
pub mod schema;

pub use catalog::ObjectCatalog;
pub use query::QueryDatabaseTool;
pub use registry::{ToolHandler, ToolRegistry, argument_detail};
pub use schema::DescribeTableTool;

use crate::gatekeeper::Gatekeeper;
use std::sync::Arc;

/// Register the gatekeeper's two tools.
pub fn create_registry(gatekeeper: Arc<Gatekeeper>) -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(QueryDatabaseTool::new(Arc::clone(&gatekeeper)));
    registry.register(DescribeTableTool::new(gatekeeper));
    registry
}
