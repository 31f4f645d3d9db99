//! `query_database` tool.

use crate::audit::Operation;
use crate::error::{McpError, Result};
use crate::gatekeeper::{Gatekeeper, RequestedLimit};
use crate::protocol::{CallToolResult, Tool};
use crate::tools::registry::{ToolHandler, argument_detail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct QueryDatabaseArgs {
    pub query: String,
    /// Kept raw so that `-1` or `"all"` reach the gatekeeper and are
    /// audited as invalid limits.
    #[serde(default)]
    pub limit: Option<Value>,
}

pub struct QueryDatabaseTool {
    gatekeeper: Arc<Gatekeeper>,
}

impl QueryDatabaseTool {
    pub fn new(gatekeeper: Arc<Gatekeeper>) -> Self {
        Self { gatekeeper }
    }
}

#[async_trait]
impl ToolHandler for QueryDatabaseTool {
    fn definition(&self) -> Tool {
        let limits = self.gatekeeper.limits();
        Tool {
            name: "query_database".into(),
            description: Some(format!(
                "Run one read-only SELECT statement. Statements that modify data, \
                 call administrative functions or contain more than one statement are \
                 rejected. At most {} rows are returned; without 'limit' the default is {}. \
                 Do not add LIMIT to the SQL, use the 'limit' parameter instead.",
                limits.max_rows, limits.default_row_limit
            )),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "A single SELECT statement"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of rows to return",
                        "minimum": 0,
                        "maximum": limits.max_rows
                    }
                },
                "required": ["query"]
            }),
        }
    }

    #[instrument(skip(self, arguments), fields(tool = "query_database"))]
    async fn execute(&self, arguments: Value, client_id: &str) -> Result<CallToolResult> {
        let args: QueryDatabaseArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => {
                return self
                    .gatekeeper
                    .reject_arguments(client_id, Operation::Query, &argument_detail(&e))
                    .await
                    .map_err(McpError::from);
            }
        };

        let limit = RequestedLimit::from_json(args.limit.as_ref());
        let response = self
            .gatekeeper
            .execute_query(client_id, &args.query, limit)
            .await?;

        Ok(CallToolResult::json(&response))
    }
}
