//! Backend seams used by the connection pool.

use crate::database::result::{ColumnSchema, DatabaseObject, ObjectKind, QueryResult};
use crate::error::DbResult;
use async_trait::async_trait;

/// Opens new database sessions.
///
/// Implementations: [`PostgresConnector`](crate::database::PostgresConnector),
/// plus in-process doubles in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend name (e.g. "postgres").
    fn name(&self) -> &'static str;

    /// Opens a fresh session, already configured for read-only use.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ConnectionFailed`](crate::error::DatabaseError::ConnectionFailed)
    /// if the database cannot be reached or rejects the login.
    async fn connect(&self) -> DbResult<Box<dyn Session>>;
}

/// One live database session, owned by exactly one pool slot.
#[async_trait]
pub trait Session: Send + Sync {
    /// Runs an already-validated read statement, returning at most
    /// `max_rows` rows. The backend enforces the bound on the server side.
    async fn fetch(&self, sql: &str, max_rows: u64) -> DbResult<QueryResult>;

    /// Column metadata of `table`, ordered by ordinal position.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::TableNotFound`](crate::error::DatabaseError::TableNotFound)
    /// when the table does not exist or is not visible to the session.
    async fn describe_table(&self, table: &str) -> DbResult<Vec<ColumnSchema>>;

    /// User tables or views, system schemas excluded, ordered by schema
    /// then name.
    async fn list_objects(&self, kind: ObjectKind) -> DbResult<Vec<DatabaseObject>>;

    /// Best-effort cancellation of the statement currently running on this
    /// session.
    async fn cancel(&self) -> DbResult<()>;

    /// Whether the underlying connection has been closed.
    fn is_closed(&self) -> bool;
}
