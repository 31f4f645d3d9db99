//! `describe_table` tool.

use crate::audit::Operation;
use crate::error::{McpError, Result};
use crate::gatekeeper::Gatekeeper;
use crate::protocol::{CallToolResult, Tool};
use crate::tools::registry::{ToolHandler, argument_detail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct DescribeTableArgs {
    pub table_name: String,
}

pub struct DescribeTableTool {
    gatekeeper: Arc<Gatekeeper>,
}

impl DescribeTableTool {
    pub fn new(gatekeeper: Arc<Gatekeeper>) -> Self {
        Self { gatekeeper }
    }
}

#[async_trait]
impl ToolHandler for DescribeTableTool {
    fn definition(&self) -> Tool {
        crate::define_tool! {
            name: "describe_table",
            description: "List the columns of a table (name, data type, nullability, position) \
                          in ordinal order. Takes a bare table name without schema or quotes.",
            schema: {
                "type": "object",
                "properties": {
                    "table_name": {
                        "type": "string",
                        "description": "Table name, e.g. 'orders'"
                    }
                },
                "required": ["table_name"]
            }
        }
    }

    #[instrument(skip(self, arguments), fields(tool = "describe_table"))]
    async fn execute(&self, arguments: Value, client_id: &str) -> Result<CallToolResult> {
        let args: DescribeTableArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => {
                return self
                    .gatekeeper
                    .reject_arguments(client_id, Operation::Describe, &argument_detail(&e))
                    .await
                    .map_err(McpError::from);
            }
        };

        let description = self
            .gatekeeper
            .describe_table(client_id, &args.table_name)
            .await?;

        Ok(CallToolResult::json(&description))
    }
}
