//! Converts `sqlparser` output into the closed syntax tree.
//!
//! Anything the tree cannot represent is rejected here with
//! [`AnalyzeError::Unsupported`], so later passes never see it.

use sqlparser::{ast as sp, dialect::GenericDialect, parser::Parser};

use crate::{error::AnalyzeError, tree::*};

type Result<T> = std::result::Result<T, AnalyzeError>;

fn unsupported(what: impl std::fmt::Display) -> AnalyzeError {
    AnalyzeError::Unsupported(what.to_string())
}

/// Parses exactly one statement.
pub fn parse_statement(sql: &str) -> Result<Statement> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|err| AnalyzeError::Syntax(err.to_string()))?;
    if statements.len() != 1 {
        return Err(AnalyzeError::StatementCount(statements.len()));
    }
    convert_statement(statements.remove(0))
}

/// Parses a comma separated expression list such as the arguments of a
/// procedure call. An empty or blank input yields no expressions.
pub fn parse_expressions(text: &str) -> Result<Vec<Expr>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let wrapped = format!("SELECT {text}");
    match parse_statement(&wrapped)? {
        Statement::Select(SelectStmt {
            ctes,
            mut cores,
            order_by,
            limit,
            offset,
            ..
        }) if ctes.is_empty()
            && cores.len() == 1
            && order_by.is_empty()
            && limit.is_none()
            && offset.is_none() =>
        {
            let core = cores.remove(0);
            if !core.from.is_empty()
                || core.where_clause.is_some()
                || !core.group_by.is_empty()
                || core.distinct
            {
                return Err(unsupported(format!("expression list \"{text}\"")));
            }
            core.columns
                .into_iter()
                .map(|column| match column {
                    ResultColumn::Expr { expr, alias: None } => Ok(expr),
                    other => Err(unsupported(format!("argument \"{other}\""))),
                })
                .collect()
        }
        _ => Err(unsupported(format!("expression list \"{text}\""))),
    }
}

fn convert_statement(stmt: sp::Statement) -> Result<Statement> {
    match stmt {
        sp::Statement::Query(query) => Ok(Statement::Select(convert_query(*query)?)),
        sp::Statement::Insert {
            table_name,
            columns,
            source,
            on,
            returning,
            ..
        } => convert_insert(table_name, columns, *source, on, returning).map(Statement::Insert),
        sp::Statement::Update {
            table,
            assignments,
            from,
            selection,
            returning,
            ..
        } => {
            if !table.joins.is_empty() {
                return Err(unsupported("UPDATE with joins"));
            }
            let (table, alias) = plain_table(table.relation)?;
            Ok(Statement::Update(UpdateStmt {
                table,
                alias,
                assignments: convert_assignments(assignments)?,
                from: from.map(convert_from_item).transpose()?,
                where_clause: selection.map(convert_expr).transpose()?,
                returning: convert_returning(returning)?,
            }))
        }
        sp::Statement::Delete {
            tables,
            mut from,
            using,
            selection,
            returning,
            ..
        } => {
            if !tables.is_empty() || using.is_some() || from.len() != 1 {
                return Err(unsupported("multi-table DELETE"));
            }
            let target = from.remove(0);
            if !target.joins.is_empty() {
                return Err(unsupported("DELETE with joins"));
            }
            let (table, alias) = plain_table(target.relation)?;
            Ok(Statement::Delete(DeleteStmt {
                table,
                alias,
                where_clause: selection.map(convert_expr).transpose()?,
                returning: convert_returning(returning)?,
            }))
        }
        stmt @ sp::Statement::CreateTable { .. } => Ok(ddl(DdlKind::CreateTable, &stmt)),
        stmt @ sp::Statement::CreateIndex { .. } => Ok(ddl(DdlKind::CreateIndex, &stmt)),
        stmt @ sp::Statement::AlterTable { .. } => Ok(ddl(DdlKind::AlterTable, &stmt)),
        stmt @ sp::Statement::Drop { .. } => Ok(ddl(DdlKind::Drop, &stmt)),
        other => Err(unsupported(format!("statement \"{other}\""))),
    }
}

fn ddl(kind: DdlKind, stmt: &sp::Statement) -> Statement {
    Statement::Ddl(DdlStmt {
        kind,
        sql: stmt.to_string(),
    })
}

fn convert_insert(
    table_name: sp::ObjectName,
    columns: Vec<sp::Ident>,
    source: sp::Query,
    on: Option<sp::OnInsert>,
    returning: Option<Vec<sp::SelectItem>>,
) -> Result<InsertStmt> {
    let plain_values = source.with.is_none()
        && source.order_by.is_empty()
        && source.limit.is_none()
        && source.offset.is_none()
        && matches!(source.body.as_ref(), sp::SetExpr::Values(_));

    let source = if plain_values {
        let sp::SetExpr::Values(values) = *source.body else {
            return Err(AnalyzeError::Internal("insert source changed shape".into()));
        };
        let rows = values
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(convert_expr).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?;
        InsertSource::Values(rows)
    } else {
        InsertSource::Select(Box::new(convert_query(source)?))
    };

    let upsert = match on {
        None => None,
        Some(sp::OnInsert::OnConflict(sp::OnConflict {
            conflict_target,
            action,
        })) => {
            let target = match conflict_target {
                None => Vec::new(),
                Some(sp::ConflictTarget::Columns(columns)) => idents(columns),
                Some(sp::ConflictTarget::OnConstraint(name)) => {
                    return Err(unsupported(format!("ON CONFLICT ON CONSTRAINT {name}")))
                }
            };
            let action = match action {
                sp::OnConflictAction::DoNothing => UpsertAction::DoNothing,
                sp::OnConflictAction::DoUpdate(sp::DoUpdate {
                    assignments,
                    selection,
                }) => UpsertAction::DoUpdate {
                    assignments: convert_assignments(assignments)?,
                    where_clause: selection.map(convert_expr).transpose()?,
                },
            };
            Some(Upsert { target, action })
        }
        Some(other) => return Err(unsupported(other)),
    };

    Ok(InsertStmt {
        table: object_name(table_name)?,
        columns: idents(columns),
        source,
        upsert,
        returning: convert_returning(returning)?,
    })
}

fn idents(idents: Vec<sp::Ident>) -> Vec<String> {
    idents.into_iter().map(|ident| ident.value).collect()
}

fn object_name(name: sp::ObjectName) -> Result<String> {
    let mut parts = name.0;
    if parts.len() != 1 {
        return Err(unsupported(format!(
            "qualified name \"{}\"",
            sp::ObjectName(parts)
        )));
    }
    Ok(parts.remove(0).value)
}

fn plain_table(factor: sp::TableFactor) -> Result<(String, Option<String>)> {
    match convert_relation(factor)? {
        Relation::Table { name, alias } => Ok((name, alias)),
        Relation::Subquery { .. } => Err(unsupported("subquery as modification target")),
    }
}

fn convert_assignments(assignments: Vec<sp::Assignment>) -> Result<Vec<Assignment>> {
    assignments
        .into_iter()
        .map(|sp::Assignment { mut id, value }| {
            if id.len() != 1 {
                return Err(unsupported(format!(
                    "assignment target \"{}\"",
                    sp::ObjectName(id)
                )));
            }
            Ok(Assignment {
                column: id.remove(0).value,
                value: convert_expr(value)?,
            })
        })
        .collect()
}

fn convert_returning(returning: Option<Vec<sp::SelectItem>>) -> Result<Vec<ResultColumn>> {
    returning
        .unwrap_or_default()
        .into_iter()
        .map(convert_select_item)
        .collect()
}

fn convert_query(query: sp::Query) -> Result<SelectStmt> {
    let sp::Query {
        with,
        body,
        order_by,
        limit,
        offset,
        fetch,
        ..
    } = query;
    if fetch.is_some() {
        return Err(unsupported("FETCH"));
    }

    let ctes = match with {
        None => Vec::new(),
        Some(with) if with.recursive => {
            return Err(unsupported("recursive common table expressions"))
        }
        Some(with) => with
            .cte_tables
            .into_iter()
            .map(|cte| {
                Ok(Cte {
                    name: cte.alias.name.value,
                    columns: idents(cte.alias.columns),
                    select: convert_query(*cte.query)?,
                })
            })
            .collect::<Result<Vec<_>>>()?,
    };

    let mut cores = Vec::new();
    let mut compound_ops = Vec::new();
    flatten_set_expr(*body, &mut cores, &mut compound_ops)?;

    Ok(SelectStmt {
        ctes,
        cores,
        compound_ops,
        order_by: order_by
            .into_iter()
            .map(convert_order_by)
            .collect::<Result<_>>()?,
        limit: limit.map(convert_expr).transpose()?,
        offset: offset.map(|offset| convert_expr(offset.value)).transpose()?,
    })
}

fn flatten_set_expr(
    expr: sp::SetExpr,
    cores: &mut Vec<SelectCore>,
    ops: &mut Vec<CompoundOperator>,
) -> Result<()> {
    match expr {
        sp::SetExpr::Select(select) => {
            cores.push(convert_select(*select)?);
            Ok(())
        }
        sp::SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
        } => {
            flatten_set_expr(*left, cores, ops)?;
            let compound = match (op, set_quantifier) {
                (sp::SetOperator::Union, sp::SetQuantifier::All) => CompoundOperator::UnionAll,
                (sp::SetOperator::Union, sp::SetQuantifier::None | sp::SetQuantifier::Distinct) => {
                    CompoundOperator::Union
                }
                (
                    sp::SetOperator::Intersect,
                    sp::SetQuantifier::None | sp::SetQuantifier::Distinct,
                ) => CompoundOperator::Intersect,
                (sp::SetOperator::Except, sp::SetQuantifier::None | sp::SetQuantifier::Distinct) => {
                    CompoundOperator::Except
                }
                (op, quantifier) => return Err(unsupported(format!("{op} {quantifier}"))),
            };
            ops.push(compound);
            match *right {
                sp::SetExpr::Select(select) => {
                    cores.push(convert_select(*select)?);
                    Ok(())
                }
                other => Err(unsupported(format!("compound member \"{other}\""))),
            }
        }
        other => Err(unsupported(format!("query body \"{other}\""))),
    }
}

fn convert_select(select: sp::Select) -> Result<SelectCore> {
    let sp::Select {
        distinct,
        top,
        projection,
        into,
        from,
        selection,
        group_by,
        having,
        ..
    } = select;
    if top.is_some() {
        return Err(unsupported("TOP"));
    }
    if into.is_some() {
        return Err(unsupported("SELECT INTO"));
    }
    let distinct = match distinct {
        None => false,
        Some(sp::Distinct::Distinct) => true,
        Some(sp::Distinct::On(_)) => return Err(unsupported("DISTINCT ON")),
    };

    Ok(SelectCore {
        distinct,
        columns: projection
            .into_iter()
            .map(convert_select_item)
            .collect::<Result<_>>()?,
        from: from
            .into_iter()
            .map(convert_from_item)
            .collect::<Result<_>>()?,
        where_clause: selection.map(convert_expr).transpose()?,
        group_by: group_by
            .into_iter()
            .map(convert_expr)
            .collect::<Result<_>>()?,
        having: having.map(convert_expr).transpose()?,
    })
}

fn convert_select_item(item: sp::SelectItem) -> Result<ResultColumn> {
    Ok(match item {
        sp::SelectItem::UnnamedExpr(expr) => ResultColumn::Expr {
            expr: convert_expr(expr)?,
            alias: None,
        },
        sp::SelectItem::ExprWithAlias { expr, alias } => ResultColumn::Expr {
            expr: convert_expr(expr)?,
            alias: Some(alias.value),
        },
        sp::SelectItem::QualifiedWildcard(name, _) => ResultColumn::TableStar(object_name(name)?),
        sp::SelectItem::Wildcard(_) => ResultColumn::Star,
    })
}

fn convert_from_item(item: sp::TableWithJoins) -> Result<FromItem> {
    let relation = convert_relation(item.relation)?;
    let joins = item
        .joins
        .into_iter()
        .map(|join| {
            let (operator, constraint) = match join.join_operator {
                sp::JoinOperator::Inner(constraint) => (JoinOperator::Inner, constraint),
                sp::JoinOperator::LeftOuter(constraint) => (JoinOperator::Left, constraint),
                sp::JoinOperator::RightOuter(constraint) => (JoinOperator::Right, constraint),
                sp::JoinOperator::FullOuter(constraint) => (JoinOperator::Full, constraint),
                sp::JoinOperator::CrossJoin => (JoinOperator::Cross, sp::JoinConstraint::None),
                other => return Err(unsupported(format!("join operator {other:?}"))),
            };
            let constraint = match constraint {
                sp::JoinConstraint::On(expr) => JoinConstraint::On(convert_expr(expr)?),
                sp::JoinConstraint::Using(columns) => JoinConstraint::Using(idents(columns)),
                sp::JoinConstraint::Natural => JoinConstraint::Natural,
                sp::JoinConstraint::None => JoinConstraint::None,
            };
            Ok(Join {
                operator,
                relation: convert_relation(join.relation)?,
                constraint,
            })
        })
        .collect::<Result<_>>()?;
    Ok(FromItem { relation, joins })
}

fn relation_alias(alias: Option<sp::TableAlias>) -> Result<Option<String>> {
    match alias {
        None => Ok(None),
        Some(alias) if !alias.columns.is_empty() => {
            Err(unsupported(format!("column list on alias \"{alias}\"")))
        }
        Some(alias) => Ok(Some(alias.name.value)),
    }
}

fn convert_relation(factor: sp::TableFactor) -> Result<Relation> {
    match factor {
        sp::TableFactor::Table {
            name,
            alias,
            args,
            with_hints,
            ..
        } => {
            if args.is_some() {
                return Err(unsupported("table-valued function"));
            }
            if !with_hints.is_empty() {
                return Err(unsupported("table hints"));
            }
            Ok(Relation::Table {
                name: object_name(name)?,
                alias: relation_alias(alias)?,
            })
        }
        sp::TableFactor::Derived {
            lateral,
            subquery,
            alias,
        } => {
            if lateral {
                return Err(unsupported("LATERAL"));
            }
            Ok(Relation::Subquery {
                select: Box::new(convert_query(*subquery)?),
                alias: relation_alias(alias)?,
            })
        }
        other => Err(unsupported(format!("relation \"{other}\""))),
    }
}

fn convert_order_by(term: sp::OrderByExpr) -> Result<OrderingTerm> {
    let sp::OrderByExpr {
        expr,
        asc,
        nulls_first,
        ..
    } = term;
    Ok(OrderingTerm {
        expr: convert_expr(expr)?,
        direction: asc.map(|asc| {
            if asc {
                OrderDirection::Asc
            } else {
                OrderDirection::Desc
            }
        }),
        nulls: nulls_first.map(|first| {
            if first {
                NullsOrder::First
            } else {
                NullsOrder::Last
            }
        }),
    })
}

fn boxed(expr: sp::Expr) -> Result<Box<Expr>> {
    convert_expr(expr).map(Box::new)
}

fn convert_expr(expr: sp::Expr) -> Result<Expr> {
    Ok(match expr {
        sp::Expr::Identifier(ident) => {
            // the generic dialect reads `@name` as a plain identifier
            if ident.quote_style.is_none() && ident.value.starts_with('@') {
                Expr::BindParameter(ident.value)
            } else {
                Expr::Column {
                    table: None,
                    column: ident.value,
                }
            }
        }
        sp::Expr::CompoundIdentifier(mut parts) => {
            if parts.len() != 2 {
                return Err(unsupported(format!(
                    "column reference \"{}\"",
                    sp::ObjectName(parts)
                )));
            }
            let column = parts.remove(1).value;
            let table = parts.remove(0).value;
            Expr::Column {
                table: Some(table),
                column,
            }
        }
        sp::Expr::Value(value) => convert_value(value)?,
        sp::Expr::BinaryOp { left, op, right } => Expr::Binary {
            left: boxed(*left)?,
            op: convert_binary_operator(op)?,
            right: boxed(*right)?,
        },
        sp::Expr::UnaryOp { op, expr } => {
            let op = match op {
                sp::UnaryOperator::Minus => UnaryOperator::Minus,
                sp::UnaryOperator::Plus => UnaryOperator::Plus,
                sp::UnaryOperator::Not => UnaryOperator::Not,
                sp::UnaryOperator::PGBitwiseNot => UnaryOperator::BitNot,
                other => return Err(AnalyzeError::InvalidOperator(other.to_string())),
            };
            Expr::Unary {
                op,
                expr: boxed(*expr)?,
            }
        }
        sp::Expr::Nested(inner) => Expr::Nested(boxed(*inner)?),
        sp::Expr::IsNull(inner) => Expr::IsNull {
            expr: boxed(*inner)?,
            negated: false,
        },
        sp::Expr::IsNotNull(inner) => Expr::IsNull {
            expr: boxed(*inner)?,
            negated: true,
        },
        sp::Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: boxed(*expr)?,
            list: list.into_iter().map(convert_expr).collect::<Result<_>>()?,
            negated,
        },
        sp::Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => Expr::InSelect {
            expr: boxed(*expr)?,
            select: Box::new(convert_query(*subquery)?),
            negated,
        },
        sp::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Expr::Between {
            expr: boxed(*expr)?,
            low: boxed(*low)?,
            high: boxed(*high)?,
            negated,
        },
        sp::Expr::Like {
            negated,
            expr,
            pattern,
            escape_char,
        } => Expr::Like {
            expr: boxed(*expr)?,
            pattern: boxed(*pattern)?,
            escape: escape_char
                .map(|c| Box::new(Expr::Literal(Literal::Text(c.to_string())))),
            negated,
        },
        sp::Expr::Function(function) => convert_function(function)?,
        sp::Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if conditions.len() != results.len() {
                return Err(AnalyzeError::Syntax("CASE branches are incomplete".into()));
            }
            Expr::Case {
                operand: operand.map(|operand| boxed(*operand)).transpose()?,
                branches: conditions
                    .into_iter()
                    .zip(results)
                    .map(|(when, then)| Ok((convert_expr(when)?, convert_expr(then)?)))
                    .collect::<Result<_>>()?,
                else_result: else_result.map(|otherwise| boxed(*otherwise)).transpose()?,
            }
        }
        sp::Expr::Exists { subquery, negated } => Expr::Exists {
            select: Box::new(convert_query(*subquery)?),
            negated,
        },
        sp::Expr::Subquery(query) => Expr::Subquery(Box::new(convert_query(*query)?)),
        sp::Expr::Collate { expr, collation } => Expr::Collate {
            expr: boxed(*expr)?,
            collation: object_name(collation)?,
        },
        sp::Expr::Cast {
            expr, data_type, ..
        } => Expr::Cast {
            expr: boxed(*expr)?,
            to: convert_cast_type(data_type)?,
        },
        other => return Err(unsupported(format!("expression \"{other}\""))),
    })
}

fn convert_value(value: sp::Value) -> Result<Expr> {
    let literal = match value {
        sp::Value::Number(digits, false) => Literal::Number(digits),
        sp::Value::Number(digits, true) => {
            return Err(AnalyzeError::literal(&digits, "long literal suffix"))
        }
        sp::Value::SingleQuotedString(text) => Literal::Text(text),
        sp::Value::Boolean(value) => Literal::Bool(value),
        sp::Value::Null => Literal::Null,
        sp::Value::HexStringLiteral(hex) => Literal::Blob(hex),
        sp::Value::Placeholder(name) => return Ok(Expr::BindParameter(name)),
        other => return Err(AnalyzeError::literal(&other.to_string(), "unsupported literal")),
    };
    Ok(Expr::Literal(literal))
}

fn convert_function(function: sp::Function) -> Result<Expr> {
    let sp::Function {
        name,
        args,
        over,
        distinct,
        order_by,
        ..
    } = function;
    let name = object_name(name)?;
    if over.is_some() {
        return Err(unsupported(format!("window function \"{name}\"")));
    }
    if !order_by.is_empty() {
        return Err(unsupported(format!("ordered aggregate \"{name}\"")));
    }

    let mut star = false;
    let mut list = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(expr)) => {
                list.push(convert_expr(expr)?)
            }
            sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard) => star = true,
            other => return Err(unsupported(format!("function argument \"{other}\""))),
        }
    }
    let args = match (star, list.is_empty()) {
        (true, true) => FunctionArgs::Star,
        (true, false) => return Err(unsupported(format!("mixed arguments to \"{name}\""))),
        (false, _) => FunctionArgs::List(list),
    };
    Ok(Expr::Function {
        name,
        distinct,
        args,
    })
}

fn convert_cast_type(data_type: sp::DataType) -> Result<CastType> {
    match data_type {
        sp::DataType::Int(_) | sp::DataType::Integer(_) | sp::DataType::BigInt(_) => {
            Ok(CastType::Int)
        }
        sp::DataType::Text | sp::DataType::Varchar(_) => Ok(CastType::Text),
        sp::DataType::Blob(_) | sp::DataType::Bytea => Ok(CastType::Blob),
        sp::DataType::Boolean => Ok(CastType::Bool),
        other => Err(unsupported(format!("cast to {other}"))),
    }
}

fn convert_binary_operator(op: sp::BinaryOperator) -> Result<BinaryOperator> {
    Ok(match op {
        sp::BinaryOperator::Plus => BinaryOperator::Add,
        sp::BinaryOperator::Minus => BinaryOperator::Subtract,
        sp::BinaryOperator::Multiply => BinaryOperator::Multiply,
        sp::BinaryOperator::Divide => BinaryOperator::Divide,
        sp::BinaryOperator::Modulo => BinaryOperator::Modulo,
        sp::BinaryOperator::StringConcat => BinaryOperator::Concat,
        sp::BinaryOperator::Eq => BinaryOperator::Eq,
        sp::BinaryOperator::NotEq => BinaryOperator::NotEq,
        sp::BinaryOperator::Lt => BinaryOperator::Lt,
        sp::BinaryOperator::LtEq => BinaryOperator::LtEq,
        sp::BinaryOperator::Gt => BinaryOperator::Gt,
        sp::BinaryOperator::GtEq => BinaryOperator::GtEq,
        sp::BinaryOperator::And => BinaryOperator::And,
        sp::BinaryOperator::Or => BinaryOperator::Or,
        sp::BinaryOperator::BitwiseAnd => BinaryOperator::BitAnd,
        sp::BinaryOperator::BitwiseOr => BinaryOperator::BitOr,
        other => return Err(AnalyzeError::InvalidOperator(other.to_string())),
    })
}
