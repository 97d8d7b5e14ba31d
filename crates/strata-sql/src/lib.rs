//! Deterministic SQL analysis.
//!
//! Statements are parsed with `sqlparser`, converted into a closed syntax
//! tree and rewritten by a pipeline of passes so that every node executing
//! the result observes identical rows in identical order.

pub mod analyzer;
pub mod catalog;
pub mod clean;
pub mod error;
pub mod functions;
pub mod ident;
pub mod mutative;
pub mod params;
pub mod parse;
pub mod rules;
pub mod tree;

pub use analyzer::{analyze, analyze_statement, AnalyzedStatement, RuleFlags};
pub use catalog::{
    Attribute, AttributeKind, Column, DataType, ForeignKey, ForeignKeyAction, ForeignKeyEvent,
    Index, IndexKind, ReferentialAction, Table,
};
pub use error::{AnalyzeError, CatalogError};
