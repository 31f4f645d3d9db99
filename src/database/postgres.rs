//! PostgreSQL backend using `tokio-postgres`.
//!
//! Every session is switched to read-only transactions right after login
//! and gets a server-side `statement_timeout`, so even a statement that
//! slipped past classification cannot write or run unbounded.

use crate::config::DatabaseConfig;
use crate::database::result::*;
use crate::database::traits::{Connector, Session};
use crate::error::{DatabaseError, DbResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::time::{Duration, Instant};
use tokio_postgres::types::Type;
use tokio_postgres::{CancelToken, Client, NoTls};
use tracing::{debug, error, info, instrument};

/// Alias of the wrapped statement, visible in server logs.
const WRAPPER_ALIAS: &str = "gatekeeper_rows";

const DESCRIBE_SQL: &str = r#"
    SELECT column_name::text, data_type::text, is_nullable::text, ordinal_position::int4
    FROM information_schema.columns
    WHERE table_schema = current_schema()
      AND (table_name::text = $1::text OR table_name::text = lower($1::text))
    ORDER BY ordinal_position
"#;

const LIST_TABLES_SQL: &str = r#"
    SELECT table_schema::text, table_name::text
    FROM information_schema.tables
    WHERE table_type = 'BASE TABLE'
      AND table_schema NOT IN ('pg_catalog', 'information_schema')
      AND table_schema NOT LIKE 'pg_toast%'
    ORDER BY table_schema, table_name
"#;

const LIST_VIEWS_SQL: &str = r#"
    SELECT table_schema::text, table_name::text
    FROM information_schema.views
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
      AND table_schema NOT LIKE 'pg_toast%'
    ORDER BY table_schema, table_name
"#;

fn listing_sql(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Table => LIST_TABLES_SQL,
        ObjectKind::View => LIST_VIEWS_SQL,
    }
}

/// Wrap an accepted statement so the server stops after `$1` rows.
///
/// The newlines keep a trailing line comment in `statement` from swallowing
/// the closing parenthesis.
pub fn limit_wrapped(statement: &str) -> String {
    format!("SELECT * FROM (\n{statement}\n) AS {WRAPPER_ALIAS} LIMIT $1")
}

/// Opens read-only PostgreSQL sessions.
pub struct PostgresConnector {
    config: DatabaseConfig,
    statement_timeout: Duration,
}

impl PostgresConnector {
    /// `statement_timeout` is set on each session as a server-side backstop
    /// to the gatekeeper's own query timeout.
    pub fn new(config: DatabaseConfig, statement_timeout: Duration) -> Self {
        info!(
            "Configured PostgreSQL backend: {}:{}/{}",
            config.host, config.port, config.database
        );
        Self {
            config,
            statement_timeout,
        }
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.database)
            .user(&self.config.username)
            .connect_timeout(self.config.connect_timeout)
            .application_name(&self.config.application_name);
        if !self.config.password.is_empty() {
            pg.password(&self.config.password);
        }
        pg
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self), fields(db = "postgres", host = %self.config.host))]
    async fn connect(&self) -> DbResult<Box<dyn Session>> {
        let (client, connection) = self
            .pg_config()
            .connect(NoTls)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection terminated");
            }
        });

        let setup = format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY; SET statement_timeout = {}",
            self.statement_timeout.as_millis()
        );
        client
            .batch_execute(&setup)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(format!("session setup failed: {e}")))?;

        debug!("PostgreSQL session ready");
        let cancel = client.cancel_token();
        Ok(Box::new(PostgresSession { client, cancel }))
    }
}

/// One read-only PostgreSQL session.
pub struct PostgresSession {
    client: Client,
    cancel: CancelToken,
}

impl PostgresSession {
    fn map_error(e: tokio_postgres::Error) -> DatabaseError {
        if e.is_closed() {
            return DatabaseError::ConnectionLost(e.to_string());
        }
        match e.as_db_error() {
            Some(db) => DatabaseError::QueryFailed(db.message().to_string()),
            None => DatabaseError::Postgres(e.to_string()),
        }
    }

    /// Extract cell value from a PostgreSQL row using the column type.
    fn get_cell_value(row: &tokio_postgres::Row, index: usize, ty: &Type) -> CellValue {
        fn cell<'a, T>(row: &'a tokio_postgres::Row, index: usize) -> CellValue
        where
            T: tokio_postgres::types::FromSql<'a> + Into<CellValue>,
        {
            match row.try_get::<_, Option<T>>(index) {
                Ok(v) => v.into(),
                Err(_) => CellValue::Null,
            }
        }

        match *ty {
            Type::BOOL => cell::<bool>(row, index),
            Type::INT2 => match row.try_get::<_, Option<i16>>(index) {
                Ok(v) => v.map(i64::from).into(),
                Err(_) => CellValue::Null,
            },
            Type::INT4 => cell::<i32>(row, index),
            Type::INT8 => cell::<i64>(row, index),
            Type::FLOAT4 => match row.try_get::<_, Option<f32>>(index) {
                Ok(v) => v.map(f64::from).into(),
                Err(_) => CellValue::Null,
            },
            Type::FLOAT8 => cell::<f64>(row, index),
            Type::NUMERIC => cell::<Decimal>(row, index),
            Type::TIMESTAMPTZ => match row.try_get::<_, Option<DateTime<Utc>>>(index) {
                Ok(v) => v.map_or(CellValue::Null, CellValue::DateTime),
                Err(_) => CellValue::Null,
            },
            Type::TIMESTAMP => match row.try_get::<_, Option<NaiveDateTime>>(index) {
                Ok(v) => v.map_or(CellValue::Null, CellValue::NaiveDateTime),
                Err(_) => CellValue::Null,
            },
            Type::DATE => match row.try_get::<_, Option<NaiveDate>>(index) {
                Ok(v) => v.map_or(CellValue::Null, CellValue::Date),
                Err(_) => CellValue::Null,
            },
            Type::JSON | Type::JSONB => match row.try_get::<_, Option<serde_json::Value>>(index) {
                Ok(v) => v.map_or(CellValue::Null, CellValue::Json),
                Err(_) => CellValue::Null,
            },
            Type::BYTEA => match row.try_get::<_, Option<Vec<u8>>>(index) {
                Ok(v) => v.map_or(CellValue::Null, CellValue::Bytes),
                Err(_) => CellValue::Null,
            },
            // Text-like types and anything else with a text representation.
            _ => cell::<String>(row, index),
        }
    }
}

#[async_trait]
impl Session for PostgresSession {
    #[instrument(skip(self, sql), fields(db = "postgres"))]
    async fn fetch(&self, sql: &str, max_rows: u64) -> DbResult<QueryResult> {
        let start = Instant::now();
        let limit = i64::try_from(max_rows).unwrap_or(i64::MAX);

        let stmt = self
            .client
            .prepare_typed(&limit_wrapped(sql), &[Type::INT8])
            .await
            .map_err(Self::map_error)?;

        let pg_rows = self
            .client
            .query(&stmt, &[&limit])
            .await
            .map_err(Self::map_error)?;

        let columns: Vec<Column> = stmt
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), c.type_().name()))
            .collect();

        let rows: Vec<Row> = pg_rows
            .iter()
            .map(|r| {
                stmt.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| Self::get_cell_value(r, i, c.type_()))
                    .collect()
            })
            .collect();

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(rows = rows.len(), elapsed_ms = elapsed, "Query complete");
        Ok(QueryResult::new(columns, rows, elapsed))
    }

    #[instrument(skip(self), fields(db = "postgres"))]
    async fn describe_table(&self, table: &str) -> DbResult<Vec<ColumnSchema>> {
        let rows = self
            .client
            .query(DESCRIBE_SQL, &[&table])
            .await
            .map_err(Self::map_error)?;

        if rows.is_empty() {
            return Err(DatabaseError::TableNotFound(table.to_string()));
        }

        rows.iter()
            .map(|row| {
                let nullable: String = row.try_get(2).map_err(Self::map_error)?;
                let position: i32 = row.try_get(3).map_err(Self::map_error)?;
                Ok(ColumnSchema {
                    name: row.try_get(0).map_err(Self::map_error)?,
                    data_type: row.try_get(1).map_err(Self::map_error)?,
                    nullable: nullable.eq_ignore_ascii_case("YES"),
                    position: u32::try_from(position).unwrap_or_default(),
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(db = "postgres"))]
    async fn list_objects(&self, kind: ObjectKind) -> DbResult<Vec<DatabaseObject>> {
        let rows = self
            .client
            .query(listing_sql(kind), &[])
            .await
            .map_err(Self::map_error)?;

        rows.iter()
            .map(|row| {
                Ok(DatabaseObject {
                    schema: row.try_get(0).map_err(Self::map_error)?,
                    name: row.try_get(1).map_err(Self::map_error)?,
                })
            })
            .collect()
    }

    async fn cancel(&self) -> DbResult<()> {
        self.cancel
            .cancel_query(NoTls)
            .await
            .map_err(|e| DatabaseError::Postgres(format!("cancel failed: {e}")))
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_wrapped() {
        let sql = limit_wrapped("SELECT id FROM users -- trailing");
        assert_eq!(
            sql,
            "SELECT * FROM (\nSELECT id FROM users -- trailing\n) AS gatekeeper_rows LIMIT $1"
        );
    }

    #[test]
    fn test_listing_excludes_system_schemas() {
        for kind in [ObjectKind::Table, ObjectKind::View] {
            let sql = listing_sql(kind);
            assert!(sql.contains("NOT IN ('pg_catalog', 'information_schema')"));
            assert!(sql.contains("ORDER BY table_schema, table_name"));
        }
        assert!(listing_sql(ObjectKind::Table).contains("'BASE TABLE'"));
        assert!(listing_sql(ObjectKind::View).contains("information_schema.views"));
    }

    #[test]
    fn test_pg_config() {
        let config = crate::config::DatabaseConfigBuilder::new()
            .host("db.internal")
            .port(6543)
            .database("app")
            .username("reader")
            .password("secret-pass")
            .build()
            .unwrap();
        let connector = PostgresConnector::new(config, Duration::from_secs(30));
        let pg = connector.pg_config();

        assert_eq!(pg.get_dbname(), Some("app"));
        assert_eq!(pg.get_user(), Some("reader"));
        assert_eq!(pg.get_ports(), &[6543]);
        assert_eq!(pg.get_password(), Some(b"secret-pass".as_slice()));
        assert_eq!(connector.name(), "postgres");
    }
}
