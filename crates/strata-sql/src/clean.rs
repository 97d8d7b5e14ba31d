//! Statement cleaner: normalizes and validates every identifier, literal,
//! bind parameter, function and collation in a statement.

use crate::{
    error::AnalyzeError,
    functions,
    ident::check_identifier,
    tree::{walk::*, *},
};

pub fn clean_statement(stmt: &mut Statement) -> VisitResult {
    walk_statement(&mut Cleaner, stmt)
}

struct Cleaner;

fn identifier(name: &mut String) -> VisitResult {
    let lowered = name.to_ascii_lowercase();
    check_identifier(&lowered).map_err(|reason| AnalyzeError::identifier(name.as_str(), reason))?;
    *name = lowered;
    Ok(())
}

fn identifiers(names: &mut [String]) -> VisitResult {
    names.iter_mut().try_for_each(identifier)
}

fn optional_identifier(name: &mut Option<String>) -> VisitResult {
    name.as_mut().map_or(Ok(()), identifier)
}

/// Bind parameters keep their prefix; the rest follows identifier rules.
fn bind_parameter(name: &mut String) -> VisitResult {
    let invalid = |reason: &str| AnalyzeError::InvalidBindParameter {
        token: name.clone(),
        reason: reason.to_owned(),
    };
    let mut chars = name.chars();
    let prefix = chars.next().ok_or_else(|| invalid("empty parameter"))?;
    if prefix != '$' && prefix != '@' {
        return Err(invalid("parameters must start with $ or @"));
    }
    let rest = chars.as_str().to_ascii_lowercase();
    check_identifier(&rest).map_err(invalid)?;
    *name = format!("{prefix}{rest}");
    Ok(())
}

fn literal(literal: &mut Literal) -> VisitResult {
    match literal {
        Literal::Null | Literal::Bool(_) => Ok(()),
        Literal::Text(text) => {
            if text.contains('\0') {
                return Err(AnalyzeError::literal(text, "text contains a NUL byte"));
            }
            Ok(())
        }
        Literal::Number(digits) => {
            if digits.contains(&['.', 'e', 'E'][..]) {
                return Err(AnalyzeError::literal(
                    digits,
                    "floating point numbers are not deterministic",
                ));
            }
            let value: i64 = digits
                .parse()
                .map_err(|_| AnalyzeError::literal(digits.as_str(), "not a 64-bit integer"))?;
            *digits = value.to_string();
            Ok(())
        }
        Literal::Blob(hex) => {
            if hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(AnalyzeError::literal(hex, "blob must be an even number of hex digits"));
            }
            *hex = hex.to_ascii_lowercase();
            Ok(())
        }
    }
}

fn function(name: &mut String, distinct: bool, args: &FunctionArgs) -> VisitResult {
    identifier(name).map_err(|_| AnalyzeError::UnknownFunction(name.clone()))?;
    let def = functions::lookup(name).ok_or_else(|| AnalyzeError::UnknownFunction(name.clone()))?;
    let invalid = |reason: String| AnalyzeError::InvalidFunctionArguments {
        function: name.clone(),
        reason,
    };
    match args {
        FunctionArgs::Star if !def.accepts_star => Err(invalid("* is not accepted".into())),
        FunctionArgs::Star if distinct => Err(invalid("DISTINCT * is not accepted".into())),
        FunctionArgs::Star => Ok(()),
        FunctionArgs::List(list) => {
            if distinct && def.kind != functions::FunctionKind::Aggregate {
                return Err(invalid("DISTINCT is only valid for aggregates".into()));
            }
            def.check_arity(list.len()).map_err(invalid)
        }
    }
}

impl VisitorMut for Cleaner {
    fn enter_cte(&mut self, node: &mut Cte) -> VisitResult {
        identifier(&mut node.name)?;
        identifiers(&mut node.columns)
    }

    fn enter_relation(&mut self, node: &mut Relation) -> VisitResult {
        match node {
            Relation::Table { name, alias } => {
                identifier(name)?;
                optional_identifier(alias)
            }
            Relation::Subquery { alias, .. } => optional_identifier(alias),
        }
    }

    fn enter_join(&mut self, node: &mut Join) -> VisitResult {
        match &mut node.constraint {
            JoinConstraint::Using(columns) => identifiers(columns),
            JoinConstraint::On(_) | JoinConstraint::Natural | JoinConstraint::None => Ok(()),
        }
    }

    fn enter_result_column(&mut self, node: &mut ResultColumn) -> VisitResult {
        match node {
            ResultColumn::Star => Ok(()),
            ResultColumn::TableStar(table) => identifier(table),
            ResultColumn::Expr { alias, .. } => optional_identifier(alias),
        }
    }

    fn enter_insert(&mut self, node: &mut InsertStmt) -> VisitResult {
        identifier(&mut node.table)?;
        identifiers(&mut node.columns)
    }

    fn enter_upsert(&mut self, node: &mut Upsert) -> VisitResult {
        identifiers(&mut node.target)
    }

    fn enter_update(&mut self, node: &mut UpdateStmt) -> VisitResult {
        identifier(&mut node.table)?;
        optional_identifier(&mut node.alias)
    }

    fn enter_delete(&mut self, node: &mut DeleteStmt) -> VisitResult {
        identifier(&mut node.table)?;
        optional_identifier(&mut node.alias)
    }

    fn enter_ddl(&mut self, _node: &mut DdlStmt) -> VisitResult {
        Ok(())
    }

    fn enter_assignment(&mut self, node: &mut Assignment) -> VisitResult {
        identifier(&mut node.column)
    }

    fn enter_expr(&mut self, node: &mut Expr) -> VisitResult {
        match node {
            Expr::Literal(value) => literal(value),
            Expr::BindParameter(name) => bind_parameter(name),
            Expr::Placeholder(index) => Err(AnalyzeError::InvalidBindParameter {
                token: format!("?{index}"),
                reason: "positional parameters are not accepted".into(),
            }),
            Expr::Column { table, column } => {
                optional_identifier(table)?;
                identifier(column)
            }
            Expr::Function {
                name,
                distinct,
                args,
            } => function(name, *distinct, args),
            Expr::Collate { collation, .. } => {
                let lowered = collation.to_ascii_lowercase();
                if lowered != "nocase" && lowered != "binary" {
                    return Err(AnalyzeError::InvalidCollation(collation.clone()));
                }
                *collation = lowered;
                Ok(())
            }
            Expr::Like {
                escape: Some(escape),
                ..
            } => match escape.as_ref() {
                Expr::Literal(Literal::Text(text)) if text.chars().count() == 1 => Ok(()),
                other => Err(AnalyzeError::literal(
                    &other.to_string(),
                    "ESCAPE must be a single character",
                )),
            },
            Expr::Unary { .. }
            | Expr::Binary { .. }
            | Expr::IsNull { .. }
            | Expr::InList { .. }
            | Expr::InSelect { .. }
            | Expr::Between { .. }
            | Expr::Like { escape: None, .. }
            | Expr::Case { .. }
            | Expr::Exists { .. }
            | Expr::Subquery(_)
            | Expr::Cast { .. }
            | Expr::Nested(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_statement;

    fn clean(sql: &str) -> Result<String, AnalyzeError> {
        let mut stmt = parse_statement(sql)?;
        clean_statement(&mut stmt)?;
        Ok(stmt.to_string())
    }

    #[test]
    fn lowercases_identifiers_and_parameters() {
        assert_eq!(
            clean("SELECT Name FROM Users WHERE ID = $Id AND owner = @Caller").unwrap(),
            "SELECT name FROM users WHERE id = $id AND owner = @caller"
        );
    }

    #[test]
    fn normalizes_literals() {
        assert_eq!(
            clean("SELECT 007, X'AbCd' FROM users").unwrap(),
            "SELECT 7, X'abcd' FROM users"
        );
    }

    #[test]
    fn rejects_floats() {
        assert!(matches!(
            clean("SELECT 1.5 FROM users"),
            Err(AnalyzeError::InvalidLiteral { .. })
        ));
    }

    #[test]
    fn rejects_non_deterministic_functions() {
        assert!(matches!(
            clean("SELECT random() FROM users"),
            Err(AnalyzeError::UnknownFunction(name)) if name == "random"
        ));
        assert!(matches!(
            clean("SELECT upper(name, name) FROM users"),
            Err(AnalyzeError::InvalidFunctionArguments { .. })
        ));
    }

    #[test]
    fn rejects_reserved_and_malformed_identifiers() {
        assert!(matches!(
            clean("SELECT \"select\" FROM users"),
            Err(AnalyzeError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            clean("SELECT \"_hidden\" FROM users"),
            Err(AnalyzeError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn rejects_unknown_collation() {
        assert!(matches!(
            clean("SELECT name FROM users ORDER BY name COLLATE rtrim"),
            Err(AnalyzeError::InvalidCollation(_))
        ));
        assert!(clean("SELECT name FROM users ORDER BY name COLLATE NOCASE").is_ok());
    }
}
