//! Deterministic aggregates: grouped results may only expose grouping keys
//! and aggregates, and grouped rows come back ordered by their keys.

use crate::{
    error::AnalyzeError,
    rules::{append_missing_terms, contains_aggregate, outer_columns},
    tree::{walk::*, *},
};

pub struct DeterministicAggregates;

fn aggregate(message: impl Into<String>) -> AnalyzeError {
    AnalyzeError::Aggregate(message.into())
}

fn same_column(a: &Expr, b: &Expr) -> bool {
    match (a, b) {
        (
            Expr::Column {
                table: a_table,
                column: a,
            },
            Expr::Column {
                table: b_table,
                column: b,
            },
        ) => a == b && (a_table == b_table || a_table.is_none() || b_table.is_none()),
        _ => false,
    }
}

/// An expression is grouped when it is a grouping key itself or every
/// column it reads is one.
fn is_grouped(expr: &Expr, group_by: &[Expr]) -> bool {
    if group_by.iter().any(|key| key == expr) {
        return true;
    }
    let mut columns = Vec::new();
    outer_columns(expr, &mut columns);
    columns
        .into_iter()
        .all(|column| group_by.iter().any(|key| same_column(key, column)))
}

fn check_core(core: &SelectCore) -> VisitResult {
    if core.group_by.is_empty() {
        let aggregates = core
            .columns
            .iter()
            .filter(|column| {
                matches!(column, ResultColumn::Expr { expr, .. } if contains_aggregate(expr))
            })
            .count();
        if aggregates > 0 && aggregates != core.columns.len() {
            return Err(aggregate(
                "aggregates cannot be mixed with plain columns without GROUP BY",
            ));
        }
        return Ok(());
    }

    if core.distinct {
        return Err(aggregate("DISTINCT cannot be combined with GROUP BY"));
    }
    for column in &core.columns {
        match column {
            ResultColumn::Star | ResultColumn::TableStar(_) => {
                return Err(aggregate("* cannot be selected in a grouped query"))
            }
            ResultColumn::Expr { expr, .. } => {
                if !contains_aggregate(expr) && !is_grouped(expr, &core.group_by) {
                    return Err(aggregate(format!(
                        "\"{expr}\" is neither grouped nor aggregated"
                    )));
                }
            }
        }
    }
    Ok(())
}

impl VisitorMut for DeterministicAggregates {
    fn exit_select(&mut self, node: &mut SelectStmt) -> VisitResult {
        if node.is_compound() && node.cores.iter().any(|core| !core.group_by.is_empty()) {
            return Err(aggregate("compound select members cannot use GROUP BY"));
        }
        for core in &node.cores {
            check_core(core)?;
        }
        if !node.is_compound() {
            let core = &node.cores[0];
            if !core.group_by.is_empty() {
                let keys = core.group_by.clone();
                let single = core.from.len() == 1 && core.from[0].joins.is_empty();
                append_missing_terms(node, keys, single);
            }
        }
        Ok(())
    }
}
