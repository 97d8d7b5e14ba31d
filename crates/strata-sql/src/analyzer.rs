//! Analyzer facade: parse, clean, apply the selected rules, classify.

use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
    panic::{self, AssertUnwindSafe},
};

use tracing::{debug, warn};

use crate::{
    catalog::Table,
    clean::clean_statement,
    error::AnalyzeError,
    mutative::is_mutative,
    params::ParameterRewriter,
    parse::parse_statement,
    rules::{
        aggregate::DeterministicAggregates, cartesian::NoCartesianProduct,
        order::GuaranteedOrder,
    },
    tree::{walk::walk_statement, Statement},
};

/// Bitmask selecting the optional analyzer passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RuleFlags(u32);

impl RuleFlags {
    pub const NONE: RuleFlags = RuleFlags(0);
    pub const NO_CARTESIAN_PRODUCT: RuleFlags = RuleFlags(1);
    pub const GUARANTEED_ORDER: RuleFlags = RuleFlags(1 << 1);
    pub const DETERMINISTIC_AGGREGATES: RuleFlags = RuleFlags(1 << 2);
    pub const REPLACE_NAMED_PARAMETERS: RuleFlags = RuleFlags(1 << 3);
    /// Every determinism rule. Parameter replacement is requested separately.
    pub const ALL_RULES: RuleFlags = RuleFlags(0b111);

    pub const fn contains(self, other: RuleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: RuleFlags) -> RuleFlags {
        RuleFlags(self.0 | other.0)
    }
}

impl BitOr for RuleFlags {
    type Output = RuleFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        RuleFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for RuleFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for RuleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06b}", self.0)
    }
}

/// Result of analyzing one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzedStatement {
    /// Rewritten SQL, ready for the storage engine.
    pub sql: String,
    pub mutative: bool,
    /// Names bound to `?1..?N` when parameters were replaced, else empty.
    pub parameters: Vec<String>,
    pub statement: Statement,
}

/// Parses and analyzes `sql` against `tables`.
pub fn analyze(sql: &str, tables: &[Table], flags: RuleFlags) -> Result<AnalyzedStatement, AnalyzeError> {
    let statement = parse_statement(sql)?;
    analyze_statement(statement, tables, flags).map_err(|err| {
        debug!(%err, sql, "statement rejected");
        err
    })
}

/// Analyzes an already parsed statement.
pub fn analyze_statement(
    statement: Statement,
    tables: &[Table],
    flags: RuleFlags,
) -> Result<AnalyzedStatement, AnalyzeError> {
    match panic::catch_unwind(AssertUnwindSafe(|| run_passes(statement, tables, flags))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            warn!(%message, "analyzer pass panicked");
            Err(AnalyzeError::Internal(message))
        }
    }
}

fn run_passes(
    mut statement: Statement,
    tables: &[Table],
    flags: RuleFlags,
) -> Result<AnalyzedStatement, AnalyzeError> {
    clean_statement(&mut statement)?;

    if flags.contains(RuleFlags::NO_CARTESIAN_PRODUCT) {
        walk_statement(&mut NoCartesianProduct, &mut statement)?;
    }
    if flags.contains(RuleFlags::DETERMINISTIC_AGGREGATES) {
        walk_statement(&mut DeterministicAggregates, &mut statement)?;
    }
    if flags.contains(RuleFlags::GUARANTEED_ORDER) {
        walk_statement(&mut GuaranteedOrder::new(tables), &mut statement)?;
    }

    let mutative = is_mutative(&mut statement)?;

    let parameters = if flags.contains(RuleFlags::REPLACE_NAMED_PARAMETERS) {
        let mut rewriter = ParameterRewriter::default();
        walk_statement(&mut rewriter, &mut statement)?;
        rewriter.into_names()
    } else {
        Vec::new()
    };

    Ok(AnalyzedStatement {
        sql: statement.to_string(),
        mutative,
        parameters,
        statement,
    })
}
