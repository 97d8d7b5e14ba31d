//! Namespaces callable from procedures and the registry of providers that
//! create them.

mod keyvalue;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::info;

pub use keyvalue::KeyValueExtension;

use crate::{
    error::EngineError, runtime::ScopeContext, schema::Schema, storage::Session, value::Value,
};

/// A capability reachable as `alias.method(args)`.
///
/// Implementations must be deterministic functions of the scope, the
/// arguments and the transactional view behind `session`, and must refuse to
/// mutate state when `scope.is_mutative()` is false.
#[async_trait]
pub trait Namespace: Send + Sync {
    async fn call(
        &self,
        scope: &mut ScopeContext,
        session: &mut dyn Session,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, EngineError>;

    /// Whether `method` writes. A view calling such a method fails to
    /// compile.
    fn mutates(&self, _method: &str) -> bool {
        false
    }
}

/// What an initializer sees of the dataset being deployed.
#[derive(Debug, Clone, Copy)]
pub struct DeploymentContext<'a> {
    pub dbid: &'a str,
    pub schema: &'a Schema,
}

/// Creates one namespace instance per `use ... as alias` at deploy or load.
/// Any error aborts the deployment.
#[async_trait]
pub trait ExtensionInitializer: Send + Sync {
    async fn initialize(
        &self,
        ctx: &DeploymentContext<'_>,
        config: &HashMap<String, String>,
    ) -> Result<Arc<dyn Namespace>, EngineError>;
}

/// Older extension shape: initialization returns metadata that is handed
/// back on every call.
#[async_trait]
pub trait LegacyExtension: Send + Sync {
    async fn initialize(
        &self,
        config: HashMap<String, String>,
    ) -> Result<HashMap<String, String>, EngineError>;

    async fn execute(
        &self,
        scope: &mut ScopeContext,
        metadata: &HashMap<String, String>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, EngineError>;
}

struct LegacyInitializer(Arc<dyn LegacyExtension>);

struct LegacyNamespace {
    extension: Arc<dyn LegacyExtension>,
    metadata: HashMap<String, String>,
}

#[async_trait]
impl ExtensionInitializer for LegacyInitializer {
    async fn initialize(
        &self,
        _ctx: &DeploymentContext<'_>,
        config: &HashMap<String, String>,
    ) -> Result<Arc<dyn Namespace>, EngineError> {
        let metadata = self.0.initialize(config.clone()).await?;
        Ok(Arc::new(LegacyNamespace {
            extension: self.0.clone(),
            metadata,
        }))
    }
}

#[async_trait]
impl Namespace for LegacyNamespace {
    async fn call(
        &self,
        scope: &mut ScopeContext,
        _session: &mut dyn Session,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, EngineError> {
        self.extension
            .execute(scope, &self.metadata, method, args)
            .await
    }
}

/// Providers by name. Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct ExtensionRegistry {
    initializers: HashMap<String, Arc<dyn ExtensionInitializer>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the bundled extensions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .initializers
            .insert(keyvalue::NAME.to_owned(), Arc::new(KeyValueExtension));
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        initializer: Arc<dyn ExtensionInitializer>,
    ) -> Result<(), EngineError> {
        let name = name.trim().to_ascii_lowercase();
        if self.initializers.contains_key(&name) {
            return Err(EngineError::DuplicateExtension(name));
        }
        info!(extension = %name, "extension registered");
        self.initializers.insert(name, initializer);
        Ok(())
    }

    pub fn register_legacy(
        &mut self,
        name: &str,
        extension: Arc<dyn LegacyExtension>,
    ) -> Result<(), EngineError> {
        self.register(name, Arc::new(LegacyInitializer(extension)))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ExtensionInitializer>> {
        self.initializers.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.initializers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
