//! Mutable depth-first traversal over the syntax tree.
//!
//! A pass implements [`VisitorMut`] and overrides the hooks it needs. The
//! `walk_*` functions visit every child of every variant, so a new node kind
//! cannot be added without every traversal being updated with it.

use super::*;
use crate::error::AnalyzeError;

pub type VisitResult = Result<(), AnalyzeError>;

#[allow(unused_variables)]
pub trait VisitorMut {
    fn enter_statement(&mut self, node: &mut Statement) -> VisitResult {
        Ok(())
    }
    fn exit_statement(&mut self, node: &mut Statement) -> VisitResult {
        Ok(())
    }
    fn enter_select(&mut self, node: &mut SelectStmt) -> VisitResult {
        Ok(())
    }
    fn exit_select(&mut self, node: &mut SelectStmt) -> VisitResult {
        Ok(())
    }
    fn enter_cte(&mut self, node: &mut Cte) -> VisitResult {
        Ok(())
    }
    fn exit_cte(&mut self, node: &mut Cte) -> VisitResult {
        Ok(())
    }
    fn enter_select_core(&mut self, node: &mut SelectCore) -> VisitResult {
        Ok(())
    }
    fn exit_select_core(&mut self, node: &mut SelectCore) -> VisitResult {
        Ok(())
    }
    fn enter_from_item(&mut self, node: &mut FromItem) -> VisitResult {
        Ok(())
    }
    fn enter_relation(&mut self, node: &mut Relation) -> VisitResult {
        Ok(())
    }
    fn enter_join(&mut self, node: &mut Join) -> VisitResult {
        Ok(())
    }
    fn enter_result_column(&mut self, node: &mut ResultColumn) -> VisitResult {
        Ok(())
    }
    fn enter_ordering_term(&mut self, node: &mut OrderingTerm) -> VisitResult {
        Ok(())
    }
    fn enter_insert(&mut self, node: &mut InsertStmt) -> VisitResult {
        Ok(())
    }
    fn enter_upsert(&mut self, node: &mut Upsert) -> VisitResult {
        Ok(())
    }
    fn enter_update(&mut self, node: &mut UpdateStmt) -> VisitResult {
        Ok(())
    }
    fn enter_delete(&mut self, node: &mut DeleteStmt) -> VisitResult {
        Ok(())
    }
    fn enter_ddl(&mut self, node: &mut DdlStmt) -> VisitResult {
        Ok(())
    }
    fn enter_assignment(&mut self, node: &mut Assignment) -> VisitResult {
        Ok(())
    }
    fn enter_expr(&mut self, node: &mut Expr) -> VisitResult {
        Ok(())
    }
    fn exit_expr(&mut self, node: &mut Expr) -> VisitResult {
        Ok(())
    }
}

pub fn walk_statement<V: VisitorMut + ?Sized>(v: &mut V, node: &mut Statement) -> VisitResult {
    v.enter_statement(node)?;
    match node {
        Statement::Select(select) => walk_select(v, select)?,
        Statement::Insert(insert) => walk_insert(v, insert)?,
        Statement::Update(update) => walk_update(v, update)?,
        Statement::Delete(delete) => walk_delete(v, delete)?,
        Statement::Ddl(ddl) => v.enter_ddl(ddl)?,
    }
    v.exit_statement(node)
}

pub fn walk_select<V: VisitorMut + ?Sized>(v: &mut V, node: &mut SelectStmt) -> VisitResult {
    v.enter_select(node)?;
    for cte in &mut node.ctes {
        v.enter_cte(cte)?;
        walk_select(v, &mut cte.select)?;
        v.exit_cte(cte)?;
    }
    for core in &mut node.cores {
        walk_select_core(v, core)?;
    }
    for term in &mut node.order_by {
        v.enter_ordering_term(term)?;
        walk_expr(v, &mut term.expr)?;
    }
    if let Some(limit) = &mut node.limit {
        walk_expr(v, limit)?;
    }
    if let Some(offset) = &mut node.offset {
        walk_expr(v, offset)?;
    }
    v.exit_select(node)
}

pub fn walk_select_core<V: VisitorMut + ?Sized>(v: &mut V, node: &mut SelectCore) -> VisitResult {
    v.enter_select_core(node)?;
    for column in &mut node.columns {
        walk_result_column(v, column)?;
    }
    for item in &mut node.from {
        walk_from_item(v, item)?;
    }
    if let Some(filter) = &mut node.where_clause {
        walk_expr(v, filter)?;
    }
    for expr in &mut node.group_by {
        walk_expr(v, expr)?;
    }
    if let Some(having) = &mut node.having {
        walk_expr(v, having)?;
    }
    v.exit_select_core(node)
}

pub fn walk_from_item<V: VisitorMut + ?Sized>(v: &mut V, node: &mut FromItem) -> VisitResult {
    v.enter_from_item(node)?;
    walk_relation(v, &mut node.relation)?;
    for join in &mut node.joins {
        v.enter_join(join)?;
        walk_relation(v, &mut join.relation)?;
        match &mut join.constraint {
            JoinConstraint::On(expr) => walk_expr(v, expr)?,
            JoinConstraint::Using(_) | JoinConstraint::Natural | JoinConstraint::None => {}
        }
    }
    Ok(())
}

pub fn walk_relation<V: VisitorMut + ?Sized>(v: &mut V, node: &mut Relation) -> VisitResult {
    v.enter_relation(node)?;
    match node {
        Relation::Table { .. } => Ok(()),
        Relation::Subquery { select, .. } => walk_select(v, select),
    }
}

pub fn walk_result_column<V: VisitorMut + ?Sized>(
    v: &mut V,
    node: &mut ResultColumn,
) -> VisitResult {
    v.enter_result_column(node)?;
    match node {
        ResultColumn::Star | ResultColumn::TableStar(_) => Ok(()),
        ResultColumn::Expr { expr, .. } => walk_expr(v, expr),
    }
}

fn walk_returning<V: VisitorMut + ?Sized>(v: &mut V, columns: &mut [ResultColumn]) -> VisitResult {
    for column in columns {
        walk_result_column(v, column)?;
    }
    Ok(())
}

fn walk_assignments<V: VisitorMut + ?Sized>(
    v: &mut V,
    assignments: &mut [Assignment],
) -> VisitResult {
    for assignment in assignments {
        v.enter_assignment(assignment)?;
        walk_expr(v, &mut assignment.value)?;
    }
    Ok(())
}

pub fn walk_insert<V: VisitorMut + ?Sized>(v: &mut V, node: &mut InsertStmt) -> VisitResult {
    v.enter_insert(node)?;
    match &mut node.source {
        InsertSource::Values(rows) => {
            for expr in rows.iter_mut().flatten() {
                walk_expr(v, expr)?;
            }
        }
        InsertSource::Select(select) => walk_select(v, select)?,
    }
    if let Some(upsert) = &mut node.upsert {
        v.enter_upsert(upsert)?;
        match &mut upsert.action {
            UpsertAction::DoNothing => {}
            UpsertAction::DoUpdate {
                assignments,
                where_clause,
            } => {
                walk_assignments(v, assignments)?;
                if let Some(filter) = where_clause {
                    walk_expr(v, filter)?;
                }
            }
        }
    }
    walk_returning(v, &mut node.returning)
}

pub fn walk_update<V: VisitorMut + ?Sized>(v: &mut V, node: &mut UpdateStmt) -> VisitResult {
    v.enter_update(node)?;
    walk_assignments(v, &mut node.assignments)?;
    if let Some(from) = &mut node.from {
        walk_from_item(v, from)?;
    }
    if let Some(filter) = &mut node.where_clause {
        walk_expr(v, filter)?;
    }
    walk_returning(v, &mut node.returning)
}

pub fn walk_delete<V: VisitorMut + ?Sized>(v: &mut V, node: &mut DeleteStmt) -> VisitResult {
    v.enter_delete(node)?;
    if let Some(filter) = &mut node.where_clause {
        walk_expr(v, filter)?;
    }
    walk_returning(v, &mut node.returning)
}

pub fn walk_expr<V: VisitorMut + ?Sized>(v: &mut V, node: &mut Expr) -> VisitResult {
    v.enter_expr(node)?;
    match node {
        Expr::Literal(_) | Expr::BindParameter(_) | Expr::Placeholder(_) | Expr::Column { .. } => {}
        Expr::Unary { expr, .. }
        | Expr::IsNull { expr, .. }
        | Expr::Collate { expr, .. }
        | Expr::Cast { expr, .. }
        | Expr::Nested(expr) => walk_expr(v, expr)?,
        Expr::Binary { left, right, .. } => {
            walk_expr(v, left)?;
            walk_expr(v, right)?;
        }
        Expr::Function { args, .. } => match args {
            FunctionArgs::Star => {}
            FunctionArgs::List(args) => {
                for arg in args {
                    walk_expr(v, arg)?;
                }
            }
        },
        Expr::InList { expr, list, .. } => {
            walk_expr(v, expr)?;
            for item in list {
                walk_expr(v, item)?;
            }
        }
        Expr::InSelect { expr, select, .. } => {
            walk_expr(v, expr)?;
            walk_select(v, select)?;
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(v, expr)?;
            walk_expr(v, low)?;
            walk_expr(v, high)?;
        }
        Expr::Like {
            expr,
            pattern,
            escape,
            ..
        } => {
            walk_expr(v, expr)?;
            walk_expr(v, pattern)?;
            if let Some(escape) = escape {
                walk_expr(v, escape)?;
            }
        }
        Expr::Case {
            operand,
            branches,
            else_result,
        } => {
            if let Some(operand) = operand {
                walk_expr(v, operand)?;
            }
            for (when, then) in branches {
                walk_expr(v, when)?;
                walk_expr(v, then)?;
            }
            if let Some(otherwise) = else_result {
                walk_expr(v, otherwise)?;
            }
        }
        Expr::Exists { select, .. } | Expr::Subquery(select) => walk_select(v, select)?,
    }
    v.exit_expr(node)
}
