//! SQLite persistence for bindings, their resource rows and instances.

use std::{path::Path, str::FromStr, time::Duration};

use indoc::indoc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteQueryResult},
    QueryBuilder, Sqlite, SqlitePool, Transaction,
};
use tracing::{info, warn};

use crate::{config::DatabaseSettings, model::LifecycleStatus, Error, Result};

mod bindings;
mod id;
mod instances;

pub use id::IdGenerator;


const SCHEMA: [&str; 5] = [
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS service_binding (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL,
            cluster_name      TEXT NOT NULL,
            version           TEXT NOT NULL DEFAULT '',
            service_name      TEXT NOT NULL DEFAULT '',
            service_id        TEXT NOT NULL DEFAULT '',
            status            TEXT NOT NULL,
            error_message     TEXT NOT NULL DEFAULT '',
            workloads         TEXT NOT NULL DEFAULT '',
            permissions       TEXT NOT NULL DEFAULT '',
            crd               TEXT NOT NULL DEFAULT '',
            capability_plugin TEXT NOT NULL DEFAULT '',
            process_time      INTEGER NOT NULL DEFAULT 0,
            create_time       INTEGER NOT NULL DEFAULT 0,
            update_time       INTEGER NOT NULL DEFAULT 0,
            UNIQUE (name, cluster_name)
        )
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS resource (
            id                 TEXT PRIMARY KEY,
            service_binding_id TEXT NOT NULL REFERENCES service_binding (id),
            kind               TEXT NOT NULL,
            group_name         TEXT NOT NULL,
            api_version        TEXT NOT NULL,
            plural             TEXT NOT NULL,
            create_time        INTEGER NOT NULL DEFAULT 0,
            update_time        INTEGER NOT NULL DEFAULT 0
        )
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS instance (
            id                 TEXT PRIMARY KEY,
            name               TEXT NOT NULL,
            namespace          TEXT NOT NULL,
            cluster_name       TEXT NOT NULL,
            service_binding_id TEXT NOT NULL,
            resource_id        TEXT NOT NULL REFERENCES resource (id),
            raw_resource       TEXT NOT NULL DEFAULT '',
            status             TEXT NOT NULL,
            error_message      TEXT NOT NULL DEFAULT '',
            install_state      TEXT NOT NULL DEFAULT '',
            process_time       INTEGER NOT NULL DEFAULT 0,
            create_time        INTEGER NOT NULL DEFAULT 0,
            update_time        INTEGER NOT NULL DEFAULT 0
        )
    "#},
    "CREATE INDEX IF NOT EXISTS idx_resource_binding ON resource (service_binding_id)",
    "CREATE INDEX IF NOT EXISTS idx_instance_natural ON instance (name, namespace, cluster_name)",
];

/// Handle to the database. Cheap to share behind an `Arc`.
pub struct Store {
    pool: SqlitePool,
    ids: IdGenerator,
}

impl Store {
    /// Open (creating if needed) the database and bring its schema up to date.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let in_memory = settings.path == ":memory:";

        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = Path::new(&settings.path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::ConfigError(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            SqliteConnectOptions::from_str(&format!("sqlite:{}", settings.path))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        }
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

        // An in-memory database lives and dies with its only connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new()
                .max_connections(settings.max_open)
                .min_connections(settings.max_idle.min(settings.max_open))
                .max_lifetime(settings.max_lifetime)
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self {
            pool,
            ids: IdGenerator::default(),
        };
        store.migrate().await?;

        info!(path = %settings.path, "database ready");
        Ok(store)
    }

    /// A private database that disappears with the store.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&DatabaseSettings::in_memory()).await
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// A fresh row id.
    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

#[cfg(test)]
impl Store {
    /// Pretend a row was last written at `update_time`.
    pub(crate) async fn backdate_instance(&self, id: &str, update_time: i64) -> Result<()> {
        sqlx::query("UPDATE instance SET update_time = ? WHERE id = ?")
            .bind(update_time)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn backdate_binding(&self, id: &str, update_time: i64) -> Result<()> {
        sqlx::query("UPDATE service_binding SET update_time = ? WHERE id = ?")
            .bind(update_time)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Commit `tx` when `result` succeeded, roll it back otherwise.
pub(crate) async fn finish<T>(tx: Transaction<'_, Sqlite>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!("rollback failed after {e}: {rollback}");
            }
            Err(e)
        }
    }
}

/// A write guarded on the status the caller loaded matched no row: someone
/// else moved the row on, or removed it.
fn ensure_current(done: SqliteQueryResult, what: String, expected: LifecycleStatus) -> Result<()> {
    if done.rows_affected() == 0 {
        return Err(Error::Conflict(format!("{what} is no longer {expected}")));
    }
    Ok(())
}

/// Column equality conditions for queries. Only whitelisted columns are accepted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, String)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.conditions.push((column.to_string(), value.into()));
        self
    }

    fn push_where(
        &self,
        query: &mut QueryBuilder<'_, Sqlite>,
        alias: &str,
        allowed: &[&str],
    ) -> Result<()> {
        for (index, (column, value)) in self.conditions.iter().enumerate() {
            if !allowed.contains(&column.as_str()) {
                return Err(Error::ValidationError(format!(
                    "cannot filter on column {column:?}"
                )));
            }
            query.push(if index == 0 { " WHERE " } else { " AND " });
            query.push(format!("{alias}.{column} = "));
            query.push_bind(value.clone());
        }
        Ok(())
    }
}

fn push_status_set(query: &mut QueryBuilder<'_, Sqlite>, alias: &str, statuses: &[LifecycleStatus]) {
    query.push(format!(" WHERE {alias}.status IN ("));
    let mut separated = query.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
}

fn decode_blob<T: serde::de::DeserializeOwned + Default>(raw: &str) -> Result<T> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(raw)?)
}
