use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    compiler::{compile_schema, CompiledProcedure},
    error::EngineError,
    extension::{DeploymentContext, ExtensionRegistry, Namespace},
    runtime::{run_procedure, ScopeContext},
    schema::Schema,
    storage::Session,
    value::Value,
};

/// A deployed schema with its compiled procedures and initialized
/// namespaces.
pub struct Dataset {
    dbid: String,
    schema: Schema,
    procedures: HashMap<String, CompiledProcedure>,
    namespaces: HashMap<String, Arc<dyn Namespace>>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("dbid", &self.dbid)
            .field("name", &self.schema.name)
            .field("procedures", &self.procedures.len())
            .field("namespaces", &self.namespaces.len())
            .finish()
    }
}

impl Dataset {
    /// Initializes every namespace of a cleaned schema and compiles its
    /// procedures. `loaded` resolves usages of other datasets.
    pub(crate) async fn load(
        schema: Schema,
        registry: &ExtensionRegistry,
        loaded: &HashMap<String, Arc<Dataset>>,
    ) -> Result<Self, EngineError> {
        let dbid = schema.dbid();
        let mut namespaces: HashMap<String, Arc<dyn Namespace>> = HashMap::new();
        for usage in &schema.extensions {
            let namespace: Arc<dyn Namespace> = if let Some(initializer) = registry.get(&usage.name)
            {
                let config = usage
                    .config
                    .iter()
                    .map(|entry| (entry.key.clone(), entry.value.clone()))
                    .collect();
                let ctx = DeploymentContext {
                    dbid: &dbid,
                    schema: &schema,
                };
                initializer.initialize(&ctx, &config).await?
            } else if let Some(dataset) = loaded.get(&usage.name) {
                dataset.clone()
            } else {
                return Err(EngineError::ExtensionNotRegistered(usage.name.clone()));
            };
            debug!(dbid = %dbid, alias = %usage.alias, provider = %usage.name, "namespace initialized");
            namespaces.insert(usage.alias.clone(), namespace);
        }

        let procedures = compile_schema(&schema, &namespaces)?;
        Ok(Self {
            dbid,
            schema,
            procedures,
            namespaces,
        })
    }

    pub fn dbid(&self) -> &str {
        &self.dbid
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn procedure(&self, name: &str) -> Result<&CompiledProcedure, EngineError> {
        self.procedures
            .get(name)
            .ok_or_else(|| EngineError::ProcedureNotFound(name.to_owned()))
    }

    pub(crate) fn namespace(&self, alias: &str) -> Result<&Arc<dyn Namespace>, EngineError> {
        self.namespaces
            .get(alias)
            .ok_or_else(|| EngineError::NamespaceNotFound(alias.to_owned()))
    }

    /// DBIDs of other datasets this one calls into.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.schema
            .extensions
            .iter()
            .filter(|usage| usage.name != self.dbid)
            .map(|usage| usage.name.as_str())
    }
}

/// Another dataset used as a namespace exposes its public procedures. The
/// first row of the procedure's result is returned.
#[async_trait]
impl Namespace for Dataset {
    async fn call(
        &self,
        scope: &mut ScopeContext,
        session: &mut dyn Session,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, EngineError> {
        let procedure = self.procedure(method)?;
        if !procedure.public {
            return Err(EngineError::PrivateProcedure(method.to_owned()));
        }
        scope.enter(&self.dbid, method);
        run_procedure(self, procedure, scope, session, args).await?;
        Ok(scope
            .take_result()
            .and_then(|rows| rows.rows.into_iter().next())
            .unwrap_or_default())
    }

    fn mutates(&self, method: &str) -> bool {
        self.procedures
            .get(method)
            .is_some_and(|procedure| procedure.mutative)
    }
}
