//! `db://tables` and `db://views`: the user tables and views, as resources.

use crate::database::ObjectKind;
use crate::error::{ProtocolError, ProtocolResult};
use crate::gatekeeper::Gatekeeper;
use crate::protocol::{ListResourcesResult, ReadResourceResult, Resource, ResourceContents};
use std::sync::Arc;
use tracing::instrument;

const SCHEME: &str = "db://";
const MIME_JSON: &str = "application/json";
const KINDS: [ObjectKind; 2] = [ObjectKind::Table, ObjectKind::View];

pub struct ObjectCatalog {
    gatekeeper: Arc<Gatekeeper>,
}

impl ObjectCatalog {
    pub fn new(gatekeeper: Arc<Gatekeeper>) -> Self {
        Self { gatekeeper }
    }

    pub fn uri(kind: ObjectKind) -> String {
        format!("{SCHEME}{}", kind.plural())
    }

    fn kind_of(uri: &str) -> Option<ObjectKind> {
        let rest = uri.strip_prefix(SCHEME)?;
        KINDS.into_iter().find(|kind| kind.plural() == rest)
    }

    pub fn resources() -> ListResourcesResult {
        let resources = KINDS
            .into_iter()
            .map(|kind| Resource {
                uri: Self::uri(kind),
                name: kind.plural().into(),
                description: Some(format!(
                    "User {} outside the system schemas, as {{kind, count, objects: [{{schema, name}}]}}",
                    kind.plural()
                )),
                mime_type: Some(MIME_JSON.into()),
            })
            .collect();

        ListResourcesResult {
            resources,
            next_cursor: None,
        }
    }

    /// Read one listing through the gatekeeper, so it is rate limited,
    /// pooled and audited like any tool call.
    #[instrument(skip(self, client_id))]
    pub async fn read(&self, client_id: &str, uri: &str) -> ProtocolResult<ReadResourceResult> {
        let kind = Self::kind_of(uri)
            .ok_or_else(|| ProtocolError::InvalidParams(format!("unknown resource {uri}").into()))?;

        let listing = self
            .gatekeeper
            .list_objects(client_id, kind)
            .await
            .map_err(ProtocolError::Refused)?;
        let text = serde_json::to_string_pretty(&listing)
            .map_err(|e| ProtocolError::InternalError(e.to_string().into()))?;

        Ok(ReadResourceResult {
            contents: vec![ResourceContents {
                uri: uri.to_string(),
                mime_type: Some(MIME_JSON.into()),
                text,
            }],
        })
    }
}
