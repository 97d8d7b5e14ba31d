//! Storage collaborator: dataset lifecycle plus transactional sessions.
//!
//! [`SqliteStore`] keeps one SQLite pool per dataset (in memory or one file
//! per dataset under a directory) and a separate metadata database holding
//! the serialized schemas.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::RwLock;
use sqlx::{
    query::Query,
    sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Column as _, Executor, Row, Sqlite, SqliteConnection, SqlitePool, Transaction, TypeInfo,
    ValueRef,
};
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    error::EngineError,
    metadata::StoredSchema,
    value::{RowSet, Value},
};

/// Persistence consumed by the global context.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Ensures the metadata table exists.
    async fn prepare(&self) -> Result<()>;
    async fn list_schemas(&self) -> Result<Vec<StoredSchema>>;
    /// Creates the dataset's tables and records its schema. Either both
    /// happen or neither does.
    async fn create_dataset(&self, stored: &StoredSchema, ddl: &[String]) -> Result<()>;
    async fn delete_dataset(&self, dbid: &str) -> Result<()>;
    /// Opens a session spanning every dataset touched by one call chain.
    async fn begin(&self, mutative: bool) -> Result<Box<dyn Session>>;
}

/// One transaction per touched dataset, committed or rolled back together.
/// Read-only sessions never commit.
#[async_trait]
pub trait Session: Send {
    async fn execute(&mut self, dbid: &str, sql: &str, params: &[Value]) -> Result<RowSet>;
    async fn query(&mut self, dbid: &str, sql: &str, params: &[Value]) -> Result<RowSet>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Location {
    Memory,
    Directory(PathBuf),
}

#[derive(Debug)]
struct Inner {
    metadata: SqlitePool,
    location: Location,
    busy_timeout: Duration,
    pools: RwLock<HashMap<String, SqlitePool>>,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

impl SqliteStore {
    /// Opens the store described by `config.database_url`: `sqlite::memory:`
    /// or a directory that is created when missing.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let location = if config.is_memory() {
            Location::Memory
        } else {
            let dir = PathBuf::from(&config.database_url);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create data directory {}", dir.display()))?;
            Location::Directory(dir)
        };

        let metadata = match &location {
            Location::Memory => memory_pool().await?,
            Location::Directory(dir) => {
                file_pool(&dir.join("metadata.sqlite"), config.busy_timeout, true).await?
            }
        };
        info!(url = %config.database_url, "storage connected");

        Ok(Self {
            inner: Arc::new(Inner {
                metadata,
                location,
                busy_timeout: config.busy_timeout,
                pools: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub async fn connect_memory() -> Result<Self> {
        Self::connect(&EngineConfig::default()).await
    }
}

async fn memory_pool() -> Result<SqlitePool> {
    // every in-memory connection is its own database, so the pool keeps
    // exactly one alive forever
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn file_pool(path: &Path, busy_timeout: Duration, create: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .foreign_keys(true)
        .busy_timeout(busy_timeout);
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(8)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(pool)
}

fn dataset_path(dir: &Path, dbid: &str) -> PathBuf {
    dir.join(format!("{dbid}.sqlite"))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

impl Inner {
    async fn open_dataset(&self, dbid: &str, create: bool) -> Result<SqlitePool> {
        match &self.location {
            Location::Memory => memory_pool().await,
            Location::Directory(dir) => {
                file_pool(&dataset_path(dir, dbid), self.busy_timeout, create).await
            }
        }
    }

    /// Pool of a deployed dataset. Files left by an earlier process are
    /// opened lazily.
    async fn pool_for(&self, dbid: &str) -> Result<SqlitePool> {
        if let Some(pool) = self.pools.read().get(dbid).cloned() {
            return Ok(pool);
        }
        let Location::Directory(dir) = &self.location else {
            return Err(EngineError::DatasetNotFound(dbid.to_owned()).into());
        };
        if !tokio::fs::try_exists(dataset_path(dir, dbid)).await? {
            return Err(EngineError::DatasetNotFound(dbid.to_owned()).into());
        }
        let pool = self.open_dataset(dbid, false).await?;
        let pool = self
            .pools
            .write()
            .entry(dbid.to_owned())
            .or_insert(pool)
            .clone();
        Ok(pool)
    }

    /// Closes and removes a dataset's database.
    async fn discard(&self, dbid: &str, pool: SqlitePool) {
        pool.close().await;
        if let Location::Directory(dir) = &self.location {
            let path = dataset_path(dir, dbid);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(dbid, error = %err, "failed to remove dataset file");
                }
            }
        }
    }
}

#[async_trait]
impl DatasetStore for SqliteStore {
    async fn prepare(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.inner.metadata)
            .await
            .context("failed to migrate metadata database")?;
        Ok(())
    }

    async fn list_schemas(&self) -> Result<Vec<StoredSchema>> {
        let mut rows =
            sqlx::query("SELECT dbid, version, owner, name, schema FROM datasets ORDER BY dbid")
                .fetch(&self.inner.metadata);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_stored(row)?);
        }
        Ok(out)
    }

    async fn create_dataset(&self, stored: &StoredSchema, ddl: &[String]) -> Result<()> {
        let dbid = stored.dbid.as_str();
        let on_disk = match &self.inner.location {
            Location::Directory(dir) => tokio::fs::try_exists(dataset_path(dir, dbid)).await?,
            Location::Memory => false,
        };
        if on_disk || self.inner.pools.read().contains_key(dbid) {
            return Err(EngineError::DatasetExists(dbid.to_owned()).into());
        }
        let pool = self.inner.open_dataset(dbid, true).await?;

        if let Err(err) = apply_ddl(&pool, ddl).await {
            self.inner.discard(dbid, pool).await;
            return Err(err);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO datasets (dbid, version, owner, name, schema)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(dbid)
        .bind(stored.version)
        .bind(&stored.owner)
        .bind(&stored.name)
        .bind(&stored.schema)
        .execute(&self.inner.metadata)
        .await;
        if let Err(err) = inserted {
            self.inner.discard(dbid, pool).await;
            if is_unique_violation(&err) {
                return Err(EngineError::DatasetExists(dbid.to_owned()).into());
            }
            return Err(anyhow::Error::new(err).context("failed to record dataset metadata"));
        }

        self.inner.pools.write().insert(dbid.to_owned(), pool);
        debug!(dbid, tables = ddl.len(), "dataset stored");
        Ok(())
    }

    async fn delete_dataset(&self, dbid: &str) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM datasets WHERE dbid = ?")
            .bind(dbid)
            .execute(&self.inner.metadata)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(EngineError::DatasetNotFound(dbid.to_owned()).into());
        }

        let pool = self.inner.pools.write().remove(dbid);
        let pool = match pool {
            Some(pool) => Some(pool),
            None => match &self.inner.location {
                Location::Directory(_) => self.inner.open_dataset(dbid, false).await.ok(),
                Location::Memory => None,
            },
        };
        if let Some(pool) = pool {
            self.inner.discard(dbid, pool).await;
        }
        Ok(())
    }

    async fn begin(&self, mutative: bool) -> Result<Box<dyn Session>> {
        Ok(Box::new(SqliteSession {
            store: self.inner.clone(),
            mutative,
            transactions: BTreeMap::new(),
        }))
    }
}

async fn apply_ddl(pool: &SqlitePool, ddl: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for statement in ddl {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to apply DDL: {statement}"))?;
    }
    tx.commit().await?;
    Ok(())
}

fn map_stored(row: SqliteRow) -> Result<StoredSchema> {
    Ok(StoredSchema {
        dbid: row.try_get("dbid")?,
        version: row.try_get("version")?,
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        schema: row.try_get("schema")?,
    })
}

struct SqliteSession {
    store: Arc<Inner>,
    mutative: bool,
    transactions: BTreeMap<String, Transaction<'static, Sqlite>>,
}

impl SqliteSession {
    async fn transaction(&mut self, dbid: &str) -> Result<&mut SqliteConnection> {
        if !self.transactions.contains_key(dbid) {
            let pool = self.store.pool_for(dbid).await?;
            let tx = pool.begin().await?;
            self.transactions.insert(dbid.to_owned(), tx);
        }
        let tx = self
            .transactions
            .get_mut(dbid)
            .ok_or_else(|| anyhow!("transaction for {dbid} vanished"))?;
        Ok(&mut **tx)
    }
}

#[async_trait]
impl Session for SqliteSession {
    async fn execute(&mut self, dbid: &str, sql: &str, params: &[Value]) -> Result<RowSet> {
        if !self.mutative {
            bail!("write attempted in a read-only session: {sql}");
        }
        let conn = self.transaction(dbid).await?;
        run_statement(conn, sql, params).await
    }

    async fn query(&mut self, dbid: &str, sql: &str, params: &[Value]) -> Result<RowSet> {
        let conn = self.transaction(dbid).await?;
        run_statement(conn, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if !self.mutative {
            return self.rollback().await;
        }
        for (dbid, tx) in self.transactions {
            tx.commit()
                .await
                .with_context(|| format!("failed to commit dataset {dbid}"))?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        for (_, tx) in self.transactions {
            tx.rollback().await?;
        }
        Ok(())
    }
}

fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<i64>),
            Value::Int(value) => query.bind(*value),
            Value::Text(text) => query.bind(text.as_str()),
            Value::Bool(value) => query.bind(*value),
            Value::Blob(bytes) => query.bind(bytes.as_slice()),
            Value::Array(items) => query.bind(serde_json::to_string(items)?),
        };
    }
    Ok(query)
}

async fn run_statement(conn: &mut SqliteConnection, sql: &str, params: &[Value]) -> Result<RowSet> {
    let rows = bind_values(sqlx::query(sql), params)?
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("statement failed: {sql}"))?;

    let columns = match rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_owned()).collect(),
        None => (&mut *conn)
            .describe(sql)
            .await?
            .columns()
            .iter()
            .map(|c| c.name().to_owned())
            .collect(),
    };
    let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
    Ok(RowSet::new(columns, rows))
}

fn decode_row(row: &SqliteRow) -> Result<Vec<Value>> {
    (0..row.len()).map(|index| decode_value(row, index)).collect()
}

fn decode_value(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_owned();
    let column = &row.columns()[index];
    Ok(match storage.as_str() {
        "INTEGER" => {
            let value: i64 = row.try_get(index)?;
            if column.type_info().name().eq_ignore_ascii_case("BOOLEAN") {
                Value::Bool(value != 0)
            } else {
                Value::Int(value)
            }
        }
        "TEXT" => Value::Text(row.try_get(index)?),
        "BLOB" => Value::Blob(row.try_get(index)?),
        "REAL" => bail!("column {} holds a floating point value", column.name()),
        other => bail!("column {} has unsupported storage class {other}", column.name()),
    })
}
