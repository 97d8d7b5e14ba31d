//! Process-wide registry of deployed datasets.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strata_sql::{analyze, RuleFlags};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    cancel::CancelToken,
    config::EngineConfig,
    dataset::Dataset,
    ddl::generate_ddl,
    error::EngineError,
    extension::ExtensionRegistry,
    metadata::StoredSchema,
    runtime::{run_procedure, ScopeContext},
    schema::Schema,
    storage::{DatasetStore, Session},
    value::{RowSet, Value},
};

const QUERY_RULES: RuleFlags =
    RuleFlags::NO_CARTESIAN_PRODUCT.union(RuleFlags::REPLACE_NAMED_PARAMETERS);

/// A procedure invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub dataset: String,
    pub procedure: String,
    pub args: Vec<Value>,
    pub signer: Vec<u8>,
    pub caller: String,
    pub cancel: CancelToken,
}

impl ExecutionRequest {
    pub fn new(dataset: impl Into<String>, procedure: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            dataset: dataset.into(),
            procedure: procedure.into(),
            args,
            signer: Vec::new(),
            caller: String::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_signer(mut self, signer: impl Into<Vec<u8>>) -> Self {
        self.signer = signer.into();
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Listing entry for a deployed dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub dbid: String,
    pub name: String,
    pub owner: Vec<u8>,
}

/// Owns every loaded dataset. Deploy, drop and execute are serialized by a
/// single write gate; `call` and `query` run without it on read-only
/// sessions.
pub struct GlobalContext {
    registry: Arc<ExtensionRegistry>,
    store: Arc<dyn DatasetStore>,
    datasets: RwLock<HashMap<String, Arc<Dataset>>>,
    write_gate: Mutex<()>,
    config: EngineConfig,
}

impl GlobalContext {
    /// Prepares storage and loads every persisted dataset, dependencies
    /// first.
    pub async fn new(
        registry: Arc<ExtensionRegistry>,
        store: Arc<dyn DatasetStore>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        store.prepare().await?;
        let ctx = Self {
            registry,
            store,
            datasets: RwLock::new(HashMap::new()),
            write_gate: Mutex::new(()),
            config,
        };

        let mut schemas = BTreeMap::new();
        for stored in ctx.store.list_schemas().await? {
            let schema = stored.decode()?;
            schemas.insert(stored.dbid, schema);
        }
        for dbid in load_order(&schemas)? {
            let Some(schema) = schemas.remove(&dbid) else {
                continue;
            };
            let loaded = ctx.datasets.read().clone();
            let dataset = Dataset::load(schema, &ctx.registry, &loaded).await?;
            if dataset.dbid() != dbid {
                return Err(EngineError::InvalidSchema(format!(
                    "stored dataset {dbid} hashes to {}",
                    dataset.dbid()
                )));
            }
            ctx.datasets.write().insert(dbid, Arc::new(dataset));
        }
        info!(datasets = ctx.datasets.read().len(), "global context loaded");
        Ok(ctx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn dataset(&self, dbid: &str) -> Result<Arc<Dataset>, EngineError> {
        self.datasets
            .read()
            .get(dbid)
            .cloned()
            .ok_or_else(|| EngineError::DatasetNotFound(dbid.to_owned()))
    }

    /// Deploys `schema` owned by `signer` and returns its DBID. Nothing is
    /// kept when any step fails.
    #[instrument(skip(self, schema, signer), fields(schema = %schema.name))]
    pub async fn create_dataset(
        &self,
        mut schema: Schema,
        signer: &[u8],
    ) -> Result<String, EngineError> {
        let _gate = self.write_gate.lock().await;

        schema.owner = signer.to_vec();
        schema.clean()?;
        let dbid = schema.dbid();
        if self.datasets.read().contains_key(&dbid) {
            return Err(EngineError::DatasetExists(dbid));
        }

        let ddl = generate_ddl(&schema.tables)?;
        let stored = StoredSchema::encode(&dbid, &schema)?;
        let loaded = self.datasets.read().clone();
        let dataset = Dataset::load(schema, &self.registry, &loaded).await?;

        self.store.create_dataset(&stored, &ddl).await?;
        self.datasets.write().insert(dbid.clone(), Arc::new(dataset));
        info!(dbid = %dbid, tables = ddl.len(), "dataset deployed");
        Ok(dbid)
    }

    /// Drops a dataset. Only its owner may do so, and not while another
    /// dataset uses it.
    #[instrument(skip(self, signer))]
    pub async fn delete_dataset(&self, dbid: &str, signer: &[u8]) -> Result<(), EngineError> {
        let _gate = self.write_gate.lock().await;

        let dataset = self.dataset(dbid)?;
        if dataset.schema().owner != signer {
            return Err(EngineError::NotOwner(dbid.to_owned()));
        }
        let user = self
            .datasets
            .read()
            .values()
            .find(|other| other.dbid() != dbid && other.dependencies().any(|dep| dep == dbid))
            .map(|other| other.dbid().to_owned());
        if let Some(user) = user {
            return Err(EngineError::DatasetInUse {
                dbid: dbid.to_owned(),
                user,
            });
        }

        self.store.delete_dataset(dbid).await?;
        self.datasets.write().remove(dbid);
        info!(dbid, "dataset dropped");
        Ok(())
    }

    /// Runs a public procedure with write access and commits on success.
    #[instrument(skip(self, request), fields(dbid = %request.dataset, procedure = %request.procedure))]
    pub async fn execute(&self, request: ExecutionRequest) -> Result<Option<RowSet>, EngineError> {
        let _gate = self.write_gate.lock().await;
        self.invoke(request, true).await
    }

    /// Runs a public procedure read-only. Mutative procedures are refused.
    #[instrument(skip(self, request), fields(dbid = %request.dataset, procedure = %request.procedure))]
    pub async fn call(&self, request: ExecutionRequest) -> Result<Option<RowSet>, EngineError> {
        self.invoke(request, false).await
    }

    async fn invoke(
        &self,
        request: ExecutionRequest,
        mutative: bool,
    ) -> Result<Option<RowSet>, EngineError> {
        let dataset = self.dataset(&request.dataset)?;
        let procedure = dataset.procedure(&request.procedure)?;
        if !procedure.public {
            return Err(EngineError::PrivateProcedure(request.procedure));
        }

        let mut scope = ScopeContext::root(
            dataset.dbid(),
            &procedure.name,
            request.signer,
            request.caller,
            mutative,
            self.config.max_call_depth,
            request.cancel,
        );
        let mut session = self.store.begin(mutative).await?;
        let outcome = run_procedure(&dataset, procedure, &mut scope, session.as_mut(), request.args).await;
        match outcome {
            Ok(()) => {
                finish(session, true).await?;
                Ok(scope.take_result())
            }
            // the execution error wins; finish already logged a failed rollback
            Err(err) => {
                let _ = finish(session, false).await;
                Err(err)
            }
        }
    }

    /// Runs an ad-hoc read-only statement against a dataset.
    #[instrument(skip(self, sql))]
    pub async fn query(&self, dbid: &str, sql: &str) -> Result<RowSet, EngineError> {
        let dataset = self.dataset(dbid)?;
        let analyzed = analyze(sql, &dataset.schema().tables, QUERY_RULES)?;
        if analyzed.mutative {
            return Err(EngineError::MutativeQuery);
        }
        if !analyzed.parameters.is_empty() {
            return Err(EngineError::UnboundParameters(analyzed.parameters));
        }

        let mut session = self.store.begin(false).await?;
        let rows = session.query(dbid, &analyzed.sql, &[]).await;
        let finished = finish(session, false).await;
        let rows = rows?;
        finished?;
        Ok(rows)
    }

    /// Deployed datasets, optionally only those owned by `owner`, sorted by
    /// DBID.
    pub fn list_datasets(&self, owner: Option<&[u8]>) -> Vec<DatasetInfo> {
        let mut out: Vec<DatasetInfo> = self
            .datasets
            .read()
            .values()
            .filter(|dataset| owner.map_or(true, |owner| dataset.schema().owner == owner))
            .map(|dataset| DatasetInfo {
                dbid: dataset.dbid().to_owned(),
                name: dataset.schema().name.clone(),
                owner: dataset.schema().owner.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.dbid.cmp(&b.dbid));
        out
    }

    pub fn get_schema(&self, dbid: &str) -> Result<Schema, EngineError> {
        Ok(self.dataset(dbid)?.schema().clone())
    }
}

async fn finish(session: Box<dyn Session>, commit: bool) -> Result<(), EngineError> {
    let result = if commit {
        session.commit().await
    } else {
        session.rollback().await
    };
    result.map_err(|err| {
        warn!(error = %err, commit, "failed to finish session");
        EngineError::from(err)
    })
}

/// Topological order over "uses a dataset" edges; ties break by DBID.
/// Usages of datasets outside `schemas` are left for loading to report.
fn load_order(schemas: &BTreeMap<String, Schema>) -> Result<Vec<String>, EngineError> {
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = schemas
        .iter()
        .map(|(dbid, schema)| {
            let deps = schema
                .extensions
                .iter()
                .map(|usage| usage.name.as_str())
                .filter(|name| *name != dbid.as_str() && schemas.contains_key(*name))
                .collect();
            (dbid.as_str(), deps)
        })
        .collect();

    let mut order = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready: Vec<&str> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(dbid, _)| *dbid)
            .collect();
        let Some(next) = ready.first().copied() else {
            let stuck: Vec<&str> = pending.keys().copied().collect();
            return Err(EngineError::InvalidSchema(format!(
                "cyclic dataset dependencies among {stuck:?}"
            )));
        };
        pending.remove(next);
        for deps in pending.values_mut() {
            deps.remove(next);
        }
        order.push(next.to_owned());
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::schema::ExtensionUsage;

    /// Accepts every deployment; every statement and every rollback fails.
    struct BrokenStore;

    struct BrokenSession;

    #[async_trait]
    impl DatasetStore for BrokenStore {
        async fn prepare(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn list_schemas(&self) -> anyhow::Result<Vec<StoredSchema>> {
            Ok(Vec::new())
        }

        async fn create_dataset(&self, _stored: &StoredSchema, _ddl: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn delete_dataset(&self, _dbid: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn begin(&self, _mutative: bool) -> anyhow::Result<Box<dyn Session>> {
            Ok(Box::new(BrokenSession))
        }
    }

    #[async_trait]
    impl Session for BrokenSession {
        async fn execute(&mut self, _dbid: &str, _sql: &str, _params: &[Value]) -> anyhow::Result<RowSet> {
            Err(anyhow!("disk on fire"))
        }

        async fn query(&mut self, _dbid: &str, _sql: &str, _params: &[Value]) -> anyhow::Result<RowSet> {
            Err(anyhow!("disk on fire"))
        }

        async fn commit(self: Box<Self>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
            Err(anyhow!("rollback failed"))
        }
    }

    #[tokio::test]
    async fn execution_errors_survive_a_failed_rollback() {
        let ctx = GlobalContext::new(
            Arc::new(ExtensionRegistry::new()),
            Arc::new(BrokenStore),
            EngineConfig::default(),
        )
        .await
        .unwrap();
        let schema: Schema = serde_json::from_value(json!({
            "name": "notes",
            "tables": [{
                "name": "notes",
                "columns": [{"name": "id", "type": "int", "attributes": [{"kind": "PRIMARY_KEY"}]}]
            }],
            "procedures": [{
                "name": "add",
                "public": true,
                "statements": ["INSERT INTO notes (id) VALUES (1);"]
            }]
        }))
        .unwrap();
        let dbid = ctx.create_dataset(schema, b"me").await.unwrap();

        let err = ctx
            .execute(ExecutionRequest::new(&dbid, "add", vec![]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk on fire"), "{err}");

        let err = ctx.query(&dbid, "SELECT id FROM notes").await.unwrap_err();
        assert!(err.to_string().contains("disk on fire"), "{err}");
    }

    fn schema(uses: &[&str]) -> Schema {
        Schema {
            name: "s".into(),
            owner: vec![],
            extensions: uses
                .iter()
                .enumerate()
                .map(|(i, name)| ExtensionUsage {
                    name: name.to_string(),
                    alias: format!("a{i}"),
                    config: vec![],
                })
                .collect(),
            tables: vec![],
            procedures: vec![],
        }
    }

    #[test]
    fn dependencies_load_first_with_lexicographic_ties() {
        let schemas = BTreeMap::from([
            ("xa".to_string(), schema(&["xc"])),
            ("xb".to_string(), schema(&["keyvalue"])),
            ("xc".to_string(), schema(&[])),
            ("xd".to_string(), schema(&["xa", "xb"])),
        ]);
        assert_eq!(load_order(&schemas).unwrap(), vec!["xb", "xc", "xa", "xd"]);
    }

    #[test]
    fn cycles_are_reported() {
        let schemas = BTreeMap::from([
            ("xa".to_string(), schema(&["xb"])),
            ("xb".to_string(), schema(&["xa"])),
        ]);
        assert!(matches!(load_order(&schemas), Err(EngineError::InvalidSchema(_))));
    }
}
