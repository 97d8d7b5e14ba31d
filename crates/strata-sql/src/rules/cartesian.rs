//! Rejects relations combined without an equality predicate.

use crate::{
    error::AnalyzeError,
    tree::{walk::*, *},
};

pub struct NoCartesianProduct;

fn cartesian(message: impl Into<String>) -> AnalyzeError {
    AnalyzeError::CartesianProduct(message.into())
}

fn reference(relation: &Relation) -> Result<String, AnalyzeError> {
    relation
        .reference_name()
        .map(str::to_owned)
        .ok_or_else(|| AnalyzeError::Unsupported("subquery in FROM without an alias".into()))
}

/// Qualifier of a column reference, looking through parentheses.
fn qualifier(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Column {
            table: Some(table), ..
        } => Some(table),
        Expr::Nested(inner) => qualifier(inner),
        _ => None,
    }
}

/// True when a top-level conjunct of `predicate` is `a.x = b.y` linking
/// `joined` to one of `prior`.
fn links(predicate: &Expr, joined: &str, prior: &[String]) -> bool {
    match predicate {
        Expr::Nested(inner) => links(inner, joined, prior),
        Expr::Binary {
            left,
            op: BinaryOperator::And,
            right,
        } => links(left, joined, prior) || links(right, joined, prior),
        Expr::Binary {
            left,
            op: BinaryOperator::Eq,
            right,
        } => match (qualifier(left), qualifier(right)) {
            (Some(a), Some(b)) => {
                (a == joined && b != joined && prior.iter().any(|p| p == b))
                    || (b == joined && a != joined && prior.iter().any(|p| p == a))
            }
            _ => false,
        },
        _ => false,
    }
}

fn check_joins(mut in_scope: Vec<String>, joins: &[Join]) -> VisitResult {
    for join in joins {
        let joined = reference(&join.relation)?;
        match &join.constraint {
            JoinConstraint::On(predicate) if links(predicate, &joined, &in_scope) => {}
            JoinConstraint::On(_) => {
                return Err(cartesian(format!(
                    "join on \"{joined}\" needs an equality predicate on qualified columns of a prior relation"
                )))
            }
            JoinConstraint::Using(_) | JoinConstraint::Natural | JoinConstraint::None => {
                return Err(cartesian(format!(
                    "join on \"{joined}\" must use an ON clause"
                )))
            }
        }
        in_scope.push(joined);
    }
    Ok(())
}

impl VisitorMut for NoCartesianProduct {
    fn enter_select_core(&mut self, node: &mut SelectCore) -> VisitResult {
        match node.from.as_slice() {
            [] => Ok(()),
            [item] => check_joins(vec![reference(&item.relation)?], &item.joins),
            _ => Err(cartesian("FROM lists more than one relation without a join")),
        }
    }

    fn enter_update(&mut self, node: &mut UpdateStmt) -> VisitResult {
        let Some(from) = &node.from else {
            return Ok(());
        };
        let target = node.alias.clone().unwrap_or_else(|| node.table.clone());
        let source = reference(&from.relation)?;
        let linked = node
            .where_clause
            .as_ref()
            .is_some_and(|predicate| links(predicate, &source, std::slice::from_ref(&target)));
        if !linked {
            return Err(cartesian(format!(
                "UPDATE ... FROM \"{source}\" needs an equality predicate with \"{target}\""
            )));
        }
        check_joins(vec![target, source], &from.joins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_statement;

    fn check(sql: &str) -> VisitResult {
        let mut stmt = parse_statement(sql)?;
        walk_statement(&mut NoCartesianProduct, &mut stmt)
    }

    #[test]
    fn comma_join_is_rejected() {
        assert!(matches!(
            check("SELECT * FROM users, posts"),
            Err(AnalyzeError::CartesianProduct(_))
        ));
    }

    #[test]
    fn join_without_equality_is_rejected() {
        assert!(check("SELECT * FROM users u JOIN posts p ON p.author > u.id").is_err());
        assert!(check("SELECT * FROM users u JOIN posts p ON p.author = p.id").is_err());
        assert!(check("SELECT * FROM users u CROSS JOIN posts p").is_err());
        assert!(check("SELECT * FROM users JOIN posts USING (id)").is_err());
    }

    #[test]
    fn equality_join_is_accepted() {
        check("SELECT * FROM users u JOIN posts p ON p.author = u.id").unwrap();
        check(
            "SELECT * FROM users u JOIN posts p ON u.id = p.author AND p.id > 3 \
             LEFT JOIN likes l ON (l.post = p.id)",
        )
        .unwrap();
    }

    #[test]
    fn nested_subqueries_are_checked() {
        assert!(check("SELECT id FROM users WHERE id IN (SELECT a.id FROM a, b)").is_err());
    }

    #[test]
    fn update_from_requires_link() {
        assert!(check("UPDATE users SET name = p.title FROM posts AS p WHERE p.id = 1").is_err());
        check("UPDATE users SET name = p.title FROM posts AS p WHERE p.author = users.id").unwrap();
    }
}
