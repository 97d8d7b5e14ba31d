use thiserror::Error;

/// Errors raised while parsing, cleaning or rewriting a statement.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalyzeError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("expected exactly one statement, found {0}")]
    StatementCount(usize),
    #[error("unsupported syntax: {0}")]
    Unsupported(String),
    #[error("invalid identifier \"{token}\": {reason}")]
    InvalidIdentifier { token: String, reason: String },
    #[error("invalid bind parameter \"{token}\": {reason}")]
    InvalidBindParameter { token: String, reason: String },
    #[error("invalid literal \"{token}\": {reason}")]
    InvalidLiteral { token: String, reason: String },
    #[error("unsupported operator \"{0}\"")]
    InvalidOperator(String),
    #[error("unsupported collation \"{0}\"")]
    InvalidCollation(String),
    #[error("unknown or non-deterministic function \"{0}\"")]
    UnknownFunction(String),
    #[error("invalid arguments to function \"{function}\": {reason}")]
    InvalidFunctionArguments { function: String, reason: String },
    #[error("cartesian product: {0}")]
    CartesianProduct(String),
    #[error("cannot guarantee ordering: {0}")]
    Ordering(String),
    #[error("non-deterministic aggregate: {0}")]
    Aggregate(String),
    #[error("unknown table \"{0}\"")]
    UnknownTable(String),
    #[error("internal analyzer error: {0}")]
    Internal(String),
}

impl AnalyzeError {
    pub(crate) fn identifier(token: &str, reason: impl Into<String>) -> Self {
        AnalyzeError::InvalidIdentifier {
            token: token.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn literal(token: &str, reason: impl Into<String>) -> Self {
        AnalyzeError::InvalidLiteral {
            token: token.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while validating table metadata.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("invalid name \"{name}\": {reason}")]
    InvalidName { name: String, reason: String },
    #[error("duplicate name \"{0}\"")]
    DuplicateName(String),
    #[error("table \"{0}\" has no primary key")]
    MissingPrimaryKey(String),
    #[error("table \"{0}\" declares more than one primary key")]
    MultiplePrimaryKeys(String),
    #[error("table \"{table}\" has no column \"{column}\"")]
    UnknownColumn { table: String, column: String },
    #[error("unknown table \"{0}\"")]
    UnknownTable(String),
    #[error("invalid attribute on {table}.{column}: {reason}")]
    InvalidAttribute {
        table: String,
        column: String,
        reason: String,
    },
    #[error("foreign key on \"{table}\" is invalid: {reason}")]
    InvalidForeignKey { table: String, reason: String },
    #[error("index \"{index}\" on \"{table}\" is invalid: {reason}")]
    InvalidIndex {
        table: String,
        index: String,
        reason: String,
    },
}
