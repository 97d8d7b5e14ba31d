use strata_sql::{AnalyzeError, CatalogError};
use thiserror::Error;

/// Errors surfaced by the engine. Storage plumbing reports `anyhow` errors
/// which are folded into [`EngineError::Storage`] unless they carry one of
/// the typed sentinels below.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dataset {0} not found")]
    DatasetNotFound(String),
    #[error("dataset {0} already exists")]
    DatasetExists(String),
    #[error("dataset {dbid} is used by dataset {user}")]
    DatasetInUse { dbid: String, user: String },
    #[error("caller is not the owner of {0}")]
    NotOwner(String),
    #[error("procedure {0} requires an authenticated caller")]
    NotAuthenticated(String),
    #[error("procedure {0} not found")]
    ProcedureNotFound(String),
    #[error("procedure {0} is private")]
    PrivateProcedure(String),
    #[error("namespace {0} not found")]
    NamespaceNotFound(String),
    #[error("extension {0} is not registered")]
    ExtensionNotRegistered(String),
    #[error("extension {0} is already registered")]
    DuplicateExtension(String),
    #[error("extension {name}: {message}")]
    Extension { name: String, message: String },
    #[error("procedure {procedure} expects {expected} arguments, got {got}")]
    IncorrectNumberOfArguments {
        procedure: String,
        expected: usize,
        got: usize,
    },
    #[error("mutative procedure {0} cannot be called from a read-only scope")]
    MutativeProcedure(String),
    #[error("read-only procedure contains DML: {procedure}: {statement}")]
    ReadOnlyProcedureContainsDml { procedure: String, statement: String },
    #[error("read-only procedure {procedure} calls non-view procedure {callee}")]
    ReadOnlyProcedureCallsMutative { procedure: String, callee: String },
    #[error("invalid statement in procedure {procedure}: {reason}")]
    InvalidStatement { procedure: String, reason: String },
    #[error("call to {callee} returned {returned} values but {expected} receivers were given")]
    ReceiverMismatch {
        callee: String,
        expected: usize,
        returned: usize,
    },
    #[error("maximum call depth of {0} exceeded")]
    MaxCallDepth(usize),
    #[error("ad-hoc queries may not modify state")]
    MutativeQuery,
    #[error("ad-hoc query references unbound parameters: {0:?}")]
    UnboundParameters(Vec<String>),
    #[error("execution cancelled")]
    Cancelled,
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("unsupported schema metadata version {0}")]
    UnsupportedVersion(i64),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Analyze(#[from] AnalyzeError),
    #[error(transparent)]
    Storage(anyhow::Error),
}

impl EngineError {
    pub(crate) fn extension(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Extension {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        match value.downcast::<EngineError>() {
            Ok(engine_err) => engine_err,
            Err(other) => EngineError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_sentinels_survive_anyhow() {
        let wrapped = anyhow::Error::new(EngineError::DatasetNotFound("xabc".into()));
        assert!(matches!(
            EngineError::from(wrapped),
            EngineError::DatasetNotFound(dbid) if dbid == "xabc"
        ));

        let opaque = EngineError::from(anyhow::anyhow!("disk on fire"));
        assert!(matches!(opaque, EngineError::Storage(_)));
    }

    #[test]
    fn view_violation_message_is_stable() {
        let err = EngineError::ReadOnlyProcedureContainsDml {
            procedure: "peek".into(),
            statement: "INSERT INTO t (a) VALUES (1)".into(),
        };
        assert!(err.to_string().contains("read-only procedure contains DML"));
    }
}
