//! TimescaleDB-backed snapshot store

use super::{day_bounds, SnapshotRow, SnapshotStore, SnapshotTransaction};
use crate::config::DatabaseConfig;
use crate::error::{EngineError, PersistenceError, SetupError};
use crate::model::Protocol;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Rows per INSERT statement; keeps bind parameters well under the protocol limit
const INSERT_CHUNK: usize = 1000;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS ip_open_ports (
        ip_address VARCHAR(50) NOT NULL,
        identity_key VARCHAR(44) NOT NULL,
        protocol VARCHAR(10) NOT NULL,
        port INTEGER NOT NULL,
        service VARCHAR(100),
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const ADD_UNIQUE: &str = r#"
    ALTER TABLE ip_open_ports
    ADD CONSTRAINT ip_open_ports_unique UNIQUE (ip_address, port, protocol, timestamp)
"#;

const CREATE_HYPERTABLE: &str =
    "SELECT create_hypertable('ip_open_ports', 'timestamp', if_not_exists => TRUE)";

const CREATE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_ip_open_ports_lookup
    ON ip_open_ports (ip_address, identity_key, timestamp DESC)
"#;

const UNIQUE_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = 'ip_open_ports_unique')";

/// duplicate_table, duplicate_object
const ALREADY_EXISTS: &[&str] = &["42P07", "42710"];

/// Concurrent `IF NOT EXISTS` creates can also collide on the catalog's own
/// unique index (unique_violation)
const CATALOG_RACE: &[&str] = &["42P07", "42710", "23505"];

#[derive(Debug)]
pub struct PgSnapshotStore {
    pool: PgPool,
    provisioned: AtomicBool,
}

impl PgSnapshotStore {
    /// Open a connection pool from `config`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, EngineError> {
        info!("Connecting to database at {}", config.describe());
        let options = config.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout))
            .connect_with(options)
            .await
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            provisioned: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run one DDL statement, treating the listed SQLSTATEs as already done
    async fn run_step(&self, step: &'static str, sql: &str, benign: &[&str]) -> Result<(), SetupError> {
        match sqlx::query(sql).execute(&self.pool).await {
            Ok(_) => {
                debug!("Schema step '{}' applied", step);
                Ok(())
            }
            Err(e) if has_code(&e, benign) => {
                debug!("Schema step '{}' already satisfied", step);
                Ok(())
            }
            Err(e) => Err(SetupError::Step {
                step,
                cause: e.to_string(),
            }),
        }
    }

    /// Add the upsert key unless it is already in the catalog.
    ///
    /// A legacy table holding duplicate keys fails here with unique_violation;
    /// that is surfaced, since inserts cannot upsert without the constraint.
    async fn ensure_unique_constraint(&self) -> Result<(), SetupError> {
        let present: bool = sqlx::query_scalar(UNIQUE_EXISTS)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SetupError::Step {
                step: "unique constraint",
                cause: e.to_string(),
            })?;
        if present {
            debug!("Schema step 'unique constraint' already satisfied");
            return Ok(());
        }
        self.run_step("unique constraint", ADD_UNIQUE, ALREADY_EXISTS).await
    }
}

fn has_code(err: &sqlx::Error, codes: &[&str]) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| codes.contains(&code.as_ref())).unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn ensure_schema(&self) -> Result<(), SetupError> {
        if self.provisioned.load(Ordering::Acquire) {
            return Ok(());
        }

        self.run_step("table", CREATE_TABLE, CATALOG_RACE).await?;
        self.ensure_unique_constraint().await?;

        // Plain PostgreSQL without the timescaledb extension still works
        if let Err(e) = self.run_step("hypertable", CREATE_HYPERTABLE, ALREADY_EXISTS).await {
            warn!("Could not convert ip_open_ports to a hypertable: {}", e);
        }

        self.run_step("lookup index", CREATE_INDEX, CATALOG_RACE).await?;

        self.provisioned.store(true, Ordering::Release);
        info!("Snapshot schema ready");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn SnapshotTransaction>, PersistenceError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PersistenceError::Begin(e.to_string()))?;
        Ok(Box::new(PgSnapshotTransaction {
            tx,
            address: String::new(),
        }))
    }

    async fn rows_for(
        &self,
        address: &str,
        identity: &str,
        day: NaiveDate,
    ) -> Result<Vec<SnapshotRow>, PersistenceError> {
        let (start, end) = day_bounds(day);
        let rows = sqlx::query(
            r#"
            SELECT ip_address, identity_key, protocol, port, service, timestamp
            FROM ip_open_ports
            WHERE ip_address = $1 AND identity_key = $2
              AND timestamp >= $3 AND timestamp < $4
            ORDER BY port, protocol
            "#,
        )
        .bind(address)
        .bind(identity)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let protocol: String = row.try_get("protocol").map_err(query_err)?;
                let port: i32 = row.try_get("port").map_err(query_err)?;
                let service: Option<String> = row.try_get("service").map_err(query_err)?;
                let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(query_err)?;
                Ok(SnapshotRow {
                    address: row.try_get("ip_address").map_err(query_err)?,
                    identity: row.try_get("identity_key").map_err(query_err)?,
                    protocol: protocol.parse::<Protocol>().map_err(PersistenceError::Query)?,
                    port: u16::try_from(port)
                        .map_err(|_| PersistenceError::Query(format!("port out of range: {}", port)))?,
                    service: service.unwrap_or_else(|| "unknown".to_string()),
                    timestamp,
                })
            })
            .collect()
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!("Database pool closed");
    }
}

fn query_err(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Query(e.to_string())
}

struct PgSnapshotTransaction {
    tx: Transaction<'static, Postgres>,
    /// Host last touched, for error context
    address: String,
}

#[async_trait]
impl SnapshotTransaction for PgSnapshotTransaction {
    async fn delete_same_day(
        &mut self,
        address: &str,
        identity: &str,
        day: NaiveDate,
    ) -> Result<u64, PersistenceError> {
        self.address = address.to_string();
        let (start, end) = day_bounds(day);
        let result = sqlx::query(
            r#"
            DELETE FROM ip_open_ports
            WHERE ip_address = $1 AND identity_key = $2
              AND timestamp >= $3 AND timestamp < $4
            "#,
        )
        .bind(address)
        .bind(identity)
        .bind(start)
        .bind(end)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| PersistenceError::Delete {
            address: address.to_string(),
            cause: e.to_string(),
        })?;

        Ok(result.rows_affected())
    }

    async fn insert_batch(&mut self, rows: &[SnapshotRow]) -> Result<u64, PersistenceError> {
        let rows = collapse_duplicates(rows);
        if let Some(first) = rows.first() {
            self.address = first.address.clone();
        }
        let mut affected = 0;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO ip_open_ports (ip_address, identity_key, protocol, port, service, timestamp) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(&row.address)
                    .push_bind(&row.identity)
                    .push_bind(row.protocol.as_str())
                    .push_bind(i32::from(row.port))
                    .push_bind(&row.service)
                    .push_bind(row.timestamp);
            });
            builder.push(
                " ON CONFLICT (ip_address, port, protocol, timestamp) DO UPDATE SET \
                 service = EXCLUDED.service, identity_key = EXCLUDED.identity_key",
            );

            let result = builder
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(|e| PersistenceError::Insert {
                    address: chunk[0].address.clone(),
                    cause: e.to_string(),
                })?;
            affected += result.rows_affected();
        }

        Ok(affected)
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let PgSnapshotTransaction { tx, address } = *self;
        tx.commit().await.map_err(|e| PersistenceError::Commit {
            address,
            cause: e.to_string(),
        })
    }
}

/// One row per conflict key, last occurrence wins.
/// A single INSERT ... ON CONFLICT cannot touch the same key twice.
fn collapse_duplicates(rows: &[SnapshotRow]) -> Vec<SnapshotRow> {
    let mut position: HashMap<(&str, u16, Protocol, DateTime<Utc>), usize> = HashMap::new();
    let mut out: Vec<SnapshotRow> = Vec::with_capacity(rows.len());

    for row in rows {
        match position.get(&row.conflict_key()) {
            Some(&idx) => out[idx] = row.clone(),
            None => {
                position.insert(row.conflict_key(), out.len());
                out.push(row.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(port: u16, protocol: Protocol, service: &str) -> SnapshotRow {
        SnapshotRow {
            address: "10.0.0.1".to_string(),
            identity: "A".to_string(),
            protocol,
            port,
            service: service.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn duplicates_collapse_to_last_occurrence() {
        let rows = vec![
            row(22, Protocol::Tcp, "ssh"),
            row(53, Protocol::Udp, "domain"),
            row(22, Protocol::Tcp, "openssh"),
        ];
        let collapsed = collapse_duplicates(&rows);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].service, "openssh");
        assert_eq!(collapsed[1].port, 53);
    }

    #[test]
    fn same_port_different_protocol_is_kept() {
        let rows = vec![row(53, Protocol::Tcp, "domain"), row(53, Protocol::Udp, "domain")];
        assert_eq!(collapse_duplicates(&rows).len(), 2);
    }
}
