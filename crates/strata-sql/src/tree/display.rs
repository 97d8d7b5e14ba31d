//! SQLite flavoured rendering of the syntax tree.

use std::fmt::{self, Display, Formatter};

use super::*;

struct Separated<'a, T>(&'a [T], &'static str);

impl<T: Display> Display for Separated<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(self.1)?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

fn comma<T>(items: &[T]) -> Separated<'_, T> {
    Separated(items, ", ")
}

impl Display for Statement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(stmt) => stmt.fmt(f),
            Statement::Insert(stmt) => stmt.fmt(f),
            Statement::Update(stmt) => stmt.fmt(f),
            Statement::Delete(stmt) => stmt.fmt(f),
            Statement::Ddl(stmt) => f.write_str(&stmt.sql),
        }
    }
}

impl Display for SelectStmt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if !self.ctes.is_empty() {
            write!(f, "WITH {} ", comma(&self.ctes))?;
        }
        for (i, core) in self.cores.iter().enumerate() {
            if i > 0 {
                let op = self
                    .compound_ops
                    .get(i - 1)
                    .copied()
                    .unwrap_or(CompoundOperator::Union);
                write!(f, " {op} ")?;
            }
            write!(f, "{core}")?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY {}", comma(&self.order_by))?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}

impl Display for CompoundOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompoundOperator::Union => "UNION",
            CompoundOperator::UnionAll => "UNION ALL",
            CompoundOperator::Intersect => "INTERSECT",
            CompoundOperator::Except => "EXCEPT",
        })
    }
}

impl Display for Cte {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.columns.is_empty() {
            write!(f, " ({})", comma(&self.columns))?;
        }
        write!(f, " AS ({})", self.select)
    }
}

impl Display for SelectCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        if self.distinct {
            f.write_str("DISTINCT ")?;
        }
        write!(f, "{}", comma(&self.columns))?;
        if !self.from.is_empty() {
            write!(f, " FROM {}", comma(&self.from))?;
        }
        if let Some(filter) = &self.where_clause {
            write!(f, " WHERE {filter}")?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", comma(&self.group_by))?;
        }
        if let Some(having) = &self.having {
            write!(f, " HAVING {having}")?;
        }
        Ok(())
    }
}

impl Display for FromItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relation)?;
        for join in &self.joins {
            write!(f, " {join}")?;
        }
        Ok(())
    }
}

impl Display for Relation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let alias = match self {
            Relation::Table { name, alias } => {
                f.write_str(name)?;
                alias
            }
            Relation::Subquery { select, alias } => {
                write!(f, "({select})")?;
                alias
            }
        };
        if let Some(alias) = alias {
            write!(f, " AS {alias}")?;
        }
        Ok(())
    }
}

impl Display for Join {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if matches!(self.constraint, JoinConstraint::Natural) {
            f.write_str("NATURAL ")?;
        }
        let keyword = match self.operator {
            JoinOperator::Inner => "JOIN",
            JoinOperator::Left => "LEFT JOIN",
            JoinOperator::Right => "RIGHT JOIN",
            JoinOperator::Full => "FULL JOIN",
            JoinOperator::Cross => "CROSS JOIN",
        };
        write!(f, "{keyword} {}", self.relation)?;
        match &self.constraint {
            JoinConstraint::On(expr) => write!(f, " ON {expr}"),
            JoinConstraint::Using(columns) => write!(f, " USING ({})", comma(columns)),
            JoinConstraint::Natural | JoinConstraint::None => Ok(()),
        }
    }
}

impl Display for ResultColumn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ResultColumn::Star => f.write_str("*"),
            ResultColumn::TableStar(table) => write!(f, "{table}.*"),
            ResultColumn::Expr { expr, alias } => {
                write!(f, "{expr}")?;
                if let Some(alias) = alias {
                    write!(f, " AS {alias}")?;
                }
                Ok(())
            }
        }
    }
}

impl Display for OrderingTerm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        match self.direction {
            Some(OrderDirection::Asc) => f.write_str(" ASC")?,
            Some(OrderDirection::Desc) => f.write_str(" DESC")?,
            None => {}
        }
        match self.nulls {
            Some(NullsOrder::First) => f.write_str(" NULLS FIRST"),
            Some(NullsOrder::Last) => f.write_str(" NULLS LAST"),
            None => Ok(()),
        }
    }
}

fn write_returning(f: &mut Formatter<'_>, returning: &[ResultColumn]) -> fmt::Result {
    if returning.is_empty() {
        return Ok(());
    }
    write!(f, " RETURNING {}", comma(returning))
}

impl Display for InsertStmt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT INTO {}", self.table)?;
        if !self.columns.is_empty() {
            write!(f, " ({})", comma(&self.columns))?;
        }
        match &self.source {
            InsertSource::Values(rows) => {
                f.write_str(" VALUES ")?;
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "({})", comma(row))?;
                }
            }
            InsertSource::Select(select) => write!(f, " {select}")?,
        }
        if let Some(upsert) = &self.upsert {
            write!(f, " {upsert}")?;
        }
        write_returning(f, &self.returning)
    }
}

impl Display for Upsert {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("ON CONFLICT")?;
        if !self.target.is_empty() {
            write!(f, " ({})", comma(&self.target))?;
        }
        match &self.action {
            UpsertAction::DoNothing => f.write_str(" DO NOTHING"),
            UpsertAction::DoUpdate {
                assignments,
                where_clause,
            } => {
                write!(f, " DO UPDATE SET {}", comma(assignments))?;
                if let Some(filter) = where_clause {
                    write!(f, " WHERE {filter}")?;
                }
                Ok(())
            }
        }
    }
}

impl Display for Assignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.column, self.value)
    }
}

impl Display for UpdateStmt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "UPDATE {}", self.table)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {alias}")?;
        }
        write!(f, " SET {}", comma(&self.assignments))?;
        if let Some(from) = &self.from {
            write!(f, " FROM {from}")?;
        }
        if let Some(filter) = &self.where_clause {
            write!(f, " WHERE {filter}")?;
        }
        write_returning(f, &self.returning)
    }
}

impl Display for DeleteStmt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "DELETE FROM {}", self.table)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {alias}")?;
        }
        if let Some(filter) = &self.where_clause {
            write!(f, " WHERE {filter}")?;
        }
        write_returning(f, &self.returning)
    }
}

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("NULL"),
            Literal::Number(digits) => f.write_str(digits),
            Literal::Text(text) => write!(f, "'{}'", text.replace('\'', "''")),
            Literal::Bool(true) => f.write_str("TRUE"),
            Literal::Bool(false) => f.write_str("FALSE"),
            Literal::Blob(hex) => write!(f, "X'{hex}'"),
        }
    }
}

impl Display for UnaryOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOperator::Minus => "-",
            UnaryOperator::Plus => "+",
            UnaryOperator::Not => "NOT ",
            UnaryOperator::BitNot => "~",
        })
    }
}

impl Display for BinaryOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Concat => "||",
            BinaryOperator::Eq => "=",
            BinaryOperator::NotEq => "<>",
            BinaryOperator::Lt => "<",
            BinaryOperator::LtEq => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::GtEq => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
            BinaryOperator::BitAnd => "&",
            BinaryOperator::BitOr => "|",
        })
    }
}

impl Display for CastType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CastType::Int => "INTEGER",
            CastType::Text => "TEXT",
            CastType::Blob => "BLOB",
            CastType::Bool => "BOOLEAN",
        })
    }
}

fn not(negated: bool) -> &'static str {
    if negated {
        "NOT "
    } else {
        ""
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(literal) => literal.fmt(f),
            Expr::BindParameter(name) => f.write_str(name),
            Expr::Placeholder(index) => write!(f, "?{index}"),
            Expr::Column { table, column } => match table {
                Some(table) => write!(f, "{table}.{column}"),
                None => f.write_str(column),
            },
            // "- -1" must not collapse into a "--" comment
            Expr::Unary { op, expr } => match expr.as_ref() {
                Expr::Unary { .. } => write!(f, "{op} {expr}"),
                _ => write!(f, "{op}{expr}"),
            },
            Expr::Binary { left, op, right } => write!(f, "{left} {op} {right}"),
            Expr::Function {
                name,
                distinct,
                args,
            } => {
                write!(f, "{name}(")?;
                if *distinct {
                    f.write_str("DISTINCT ")?;
                }
                match args {
                    FunctionArgs::Star => f.write_str("*")?,
                    FunctionArgs::List(args) => write!(f, "{}", comma(args))?,
                }
                f.write_str(")")
            }
            Expr::IsNull { expr, negated } => write!(f, "{expr} IS {}NULL", not(*negated)),
            Expr::InList {
                expr,
                list,
                negated,
            } => write!(f, "{expr} {}IN ({})", not(*negated), comma(list)),
            Expr::InSelect {
                expr,
                select,
                negated,
            } => write!(f, "{expr} {}IN ({select})", not(*negated)),
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(f, "{expr} {}BETWEEN {low} AND {high}", not(*negated)),
            Expr::Like {
                expr,
                pattern,
                escape,
                negated,
            } => {
                write!(f, "{expr} {}LIKE {pattern}", not(*negated))?;
                if let Some(escape) = escape {
                    write!(f, " ESCAPE {escape}")?;
                }
                Ok(())
            }
            Expr::Case {
                operand,
                branches,
                else_result,
            } => {
                f.write_str("CASE")?;
                if let Some(operand) = operand {
                    write!(f, " {operand}")?;
                }
                for (when, then) in branches {
                    write!(f, " WHEN {when} THEN {then}")?;
                }
                if let Some(otherwise) = else_result {
                    write!(f, " ELSE {otherwise}")?;
                }
                f.write_str(" END")
            }
            Expr::Exists { select, negated } => write!(f, "{}EXISTS ({select})", not(*negated)),
            Expr::Subquery(select) => write!(f, "({select})"),
            Expr::Collate { expr, collation } => write!(f, "{expr} COLLATE {collation}"),
            Expr::Cast { expr, to } => write!(f, "CAST({expr} AS {to})"),
            Expr::Nested(expr) => write!(f, "({expr})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_text_literals_with_escaped_quotes() {
        let expr = Expr::Literal(Literal::Text("it's".into()));
        assert_eq!(expr.to_string(), "'it''s'");
    }

    #[test]
    fn renders_compound_select_with_ordinals() {
        let core = SelectCore {
            distinct: false,
            columns: vec![ResultColumn::Expr {
                expr: Expr::column(None, "id"),
                alias: None,
            }],
            from: vec![FromItem {
                relation: Relation::Table {
                    name: "users".into(),
                    alias: None,
                },
                joins: vec![],
            }],
            where_clause: None,
            group_by: vec![],
            having: None,
        };
        let stmt = SelectStmt {
            ctes: vec![],
            cores: vec![core.clone(), core],
            compound_ops: vec![CompoundOperator::UnionAll],
            order_by: vec![OrderingTerm::ascending(Expr::integer(1))],
            limit: None,
            offset: None,
        };
        assert_eq!(
            stmt.to_string(),
            "SELECT id FROM users UNION ALL SELECT id FROM users ORDER BY 1"
        );
    }
}
