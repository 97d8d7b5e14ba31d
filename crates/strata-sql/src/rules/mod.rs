//! Determinism rules. Each rule is an independent [`VisitorMut`] pass.
//!
//! [`VisitorMut`]: crate::tree::walk::VisitorMut

pub mod aggregate;
pub mod cartesian;
pub mod order;

use crate::{
    functions,
    tree::{Expr, FunctionArgs, OrderingTerm, SelectStmt},
};

/// Direct sub-expressions evaluated at the same query level as `expr`.
/// Subquery bodies are not included.
pub(crate) fn outer_children(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::Literal(_) | Expr::BindParameter(_) | Expr::Placeholder(_) | Expr::Column { .. } => {
            Vec::new()
        }
        Expr::Unary { expr, .. }
        | Expr::IsNull { expr, .. }
        | Expr::Collate { expr, .. }
        | Expr::Cast { expr, .. }
        | Expr::Nested(expr)
        | Expr::InSelect { expr, .. } => vec![expr.as_ref()],
        Expr::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
        Expr::Function { args, .. } => match args {
            FunctionArgs::Star => Vec::new(),
            FunctionArgs::List(args) => args.iter().collect(),
        },
        Expr::InList { expr, list, .. } => std::iter::once(expr.as_ref()).chain(list).collect(),
        Expr::Between {
            expr, low, high, ..
        } => vec![expr.as_ref(), low.as_ref(), high.as_ref()],
        Expr::Like {
            expr,
            pattern,
            escape,
            ..
        } => {
            let mut children = vec![expr.as_ref(), pattern.as_ref()];
            children.extend(escape.as_deref());
            children
        }
        Expr::Case {
            operand,
            branches,
            else_result,
        } => {
            let mut children: Vec<&Expr> = operand.as_deref().into_iter().collect();
            for (when, then) in branches {
                children.push(when);
                children.push(then);
            }
            children.extend(else_result.as_deref());
            children
        }
        Expr::Exists { .. } | Expr::Subquery(_) => Vec::new(),
    }
}

pub(crate) fn contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Function { name, .. } if functions::is_aggregate(name) => true,
        _ => outer_children(expr).into_iter().any(contains_aggregate),
    }
}

/// Column references at the same query level as `expr`.
pub(crate) fn outer_columns<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    if let Expr::Column { .. } = expr {
        out.push(expr);
    }
    for child in outer_children(expr) {
        outer_columns(child, out);
    }
}

/// Whether `existing` already provides the ordering `required` asks for.
/// An unqualified column matches a qualified one when only one relation is
/// in scope.
pub(crate) fn term_covers(existing: &Expr, required: &Expr, single_relation: bool) -> bool {
    if existing == required {
        return true;
    }
    match (existing, required) {
        (
            Expr::Column {
                table: a_table,
                column: a,
            },
            Expr::Column {
                table: b_table,
                column: b,
            },
        ) => a == b && single_relation && (a_table.is_none() || b_table.is_none()),
        _ => false,
    }
}

/// Appends every required term not already present, keeping user terms first.
pub(crate) fn append_missing_terms(select: &mut SelectStmt, required: Vec<Expr>, single: bool) {
    for term in required {
        let present = select
            .order_by
            .iter()
            .any(|existing| term_covers(&existing.expr, &term, single));
        if !present {
            select.order_by.push(OrderingTerm::ascending(term));
        }
    }
}
