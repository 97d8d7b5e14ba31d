//! Deterministic procedure execution over deployed datasets.
//!
//! A [`GlobalContext`] owns every deployed [`Dataset`]. Procedures are
//! compiled once at deploy or startup, then interpreted in caller-scoped
//! [`ScopeContext`]s against a [`DatasetStore`]. Extensions plug in through
//! the [`ExtensionRegistry`] built before the context.

pub mod cancel;
pub mod compiler;
pub mod config;
pub mod dataset;
pub mod ddl;
pub mod error;
pub mod extension;
pub mod global;
pub mod metadata;
pub mod runtime;
pub mod schema;
pub mod storage;
pub mod value;

pub use cancel::CancelToken;
pub use compiler::CompiledProcedure;
pub use config::EngineConfig;
pub use dataset::Dataset;
pub use error::EngineError;
pub use extension::{
    DeploymentContext, ExtensionInitializer, ExtensionRegistry, KeyValueExtension,
    LegacyExtension, Namespace,
};
pub use global::{DatasetInfo, ExecutionRequest, GlobalContext};
pub use runtime::ScopeContext;
pub use schema::{dbid, ExtensionConfig, ExtensionUsage, Modifier, Procedure, Schema};
pub use storage::{DatasetStore, Session, SqliteStore};
pub use value::{RowSet, Value};
