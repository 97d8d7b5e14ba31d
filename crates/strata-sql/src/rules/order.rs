//! Guaranteed ordering: every select ends up totally ordered.
//!
//! Runs on select exit, so subqueries and common table expressions are
//! ordered before the statements that contain them. Derived relations
//! (CTEs and subqueries in FROM) treat all of their columns as the key.

use crate::{
    catalog::Table,
    error::AnalyzeError,
    rules::{append_missing_terms, contains_aggregate},
    tree::{walk::*, *},
};

pub struct GuaranteedOrder<'a> {
    tables: &'a [Table],
    ctes: Vec<Derived>,
}

#[derive(Debug, Clone)]
struct Derived {
    name: String,
    columns: Vec<String>,
}

/// A relation as seen by one select core.
struct Source {
    reference: String,
    columns: Vec<String>,
    key: Vec<String>,
}

fn ordering(message: impl Into<String>) -> AnalyzeError {
    AnalyzeError::Ordering(message.into())
}

impl<'a> GuaranteedOrder<'a> {
    pub fn new(tables: &'a [Table]) -> Self {
        Self {
            tables,
            ctes: Vec::new(),
        }
    }

    fn named_source(&self, name: &str, reference: String) -> Result<Source, AnalyzeError> {
        // CTEs shadow tables; the most recent definition wins
        if let Some(derived) = self.ctes.iter().rev().find(|d| d.name == name) {
            return Ok(Source {
                reference,
                columns: derived.columns.clone(),
                key: derived.columns.clone(),
            });
        }
        let table = self
            .tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| AnalyzeError::UnknownTable(name.to_owned()))?;
        let key = table
            .primary_key()
            .map_err(|err| ordering(err.to_string()))?;
        Ok(Source {
            reference,
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            key,
        })
    }

    fn source(&self, relation: &Relation) -> Result<Source, AnalyzeError> {
        match relation {
            Relation::Table { name, alias } => {
                self.named_source(name, alias.clone().unwrap_or_else(|| name.clone()))
            }
            Relation::Subquery { select, alias } => {
                let reference = alias
                    .clone()
                    .ok_or_else(|| ordering("subquery in FROM needs an alias"))?;
                let columns = self.result_names(select)?;
                Ok(Source {
                    reference,
                    key: columns.clone(),
                    columns,
                })
            }
        }
    }

    fn sources(&self, core: &SelectCore) -> Result<Vec<Source>, AnalyzeError> {
        let mut sources = Vec::new();
        for item in &core.from {
            sources.push(self.source(&item.relation)?);
            for join in &item.joins {
                sources.push(self.source(&join.relation)?);
            }
        }
        Ok(sources)
    }

    /// Output column names of a select, taken from its first core.
    fn result_names(&self, select: &SelectStmt) -> Result<Vec<String>, AnalyzeError> {
        let core = select
            .cores
            .first()
            .ok_or_else(|| AnalyzeError::Internal("select without cores".into()))?;
        let sources = self.sources(core)?;
        let mut names = Vec::new();
        for column in &core.columns {
            match column {
                ResultColumn::Expr {
                    alias: Some(alias), ..
                } => names.push(alias.clone()),
                ResultColumn::Expr {
                    expr: Expr::Column { column, .. },
                    alias: None,
                } => names.push(column.clone()),
                ResultColumn::Expr { expr, alias: None } => {
                    return Err(ordering(format!(
                        "derived column \"{expr}\" needs an alias"
                    )))
                }
                ResultColumn::Star => {
                    names.extend(sources.iter().flat_map(|s| s.columns.iter().cloned()))
                }
                ResultColumn::TableStar(table) => {
                    names.extend(find_source(&sources, table)?.columns.iter().cloned())
                }
            }
        }
        Ok(names)
    }

    fn result_width(&self, core: &SelectCore) -> Result<usize, AnalyzeError> {
        let sources = self.sources(core)?;
        let mut width = 0;
        for column in &core.columns {
            width += match column {
                ResultColumn::Expr { .. } => 1,
                ResultColumn::Star => sources.iter().map(|s| s.columns.len()).sum(),
                ResultColumn::TableStar(table) => find_source(&sources, table)?.columns.len(),
            };
        }
        Ok(width)
    }

    /// Terms a single core needs to be totally ordered.
    fn core_terms(&self, core: &SelectCore) -> Result<(Vec<Expr>, bool), AnalyzeError> {
        if core.from.is_empty() {
            return Ok((Vec::new(), true));
        }
        let mut sources = self.sources(core)?;
        let single = sources.len() == 1;

        if !core.group_by.is_empty() {
            if core.distinct {
                return Err(ordering("DISTINCT cannot be combined with GROUP BY"));
            }
            return Ok((core.group_by.clone(), single));
        }

        if core.distinct {
            let mut terms = Vec::new();
            for column in &core.columns {
                match column {
                    ResultColumn::Expr { expr, .. } => terms.push(expr.clone()),
                    ResultColumn::Star => {
                        for source in &sources {
                            terms.extend(qualified(source, &source.columns));
                        }
                    }
                    ResultColumn::TableStar(table) => {
                        let source = find_source(&sources, table)?;
                        terms.extend(qualified(source, &source.columns));
                    }
                }
            }
            return Ok((terms, single));
        }

        let aggregated = core.columns.iter().any(|column| {
            matches!(column, ResultColumn::Expr { expr, .. } if contains_aggregate(expr))
        });
        if aggregated {
            // a single aggregate row needs no ordering
            return Ok((Vec::new(), single));
        }

        sources.sort_by(|a, b| a.reference.cmp(&b.reference));
        let mut terms = Vec::new();
        for source in &sources {
            let mut key = source.key.clone();
            key.sort();
            terms.extend(qualified(source, &key));
        }
        Ok((terms, single))
    }
}

fn find_source<'s>(sources: &'s [Source], reference: &str) -> Result<&'s Source, AnalyzeError> {
    sources
        .iter()
        .find(|s| s.reference == reference)
        .ok_or_else(|| AnalyzeError::UnknownTable(reference.to_owned()))
}

fn qualified<'s>(source: &'s Source, columns: &'s [String]) -> impl Iterator<Item = Expr> + 's {
    columns
        .iter()
        .map(move |column| Expr::column(Some(source.reference.as_str()), column))
}

impl VisitorMut for GuaranteedOrder<'_> {
    fn exit_cte(&mut self, node: &mut Cte) -> VisitResult {
        let columns = if node.columns.is_empty() {
            self.result_names(&node.select)?
        } else {
            node.columns.clone()
        };
        self.ctes.push(Derived {
            name: node.name.clone(),
            columns,
        });
        Ok(())
    }

    fn exit_select(&mut self, node: &mut SelectStmt) -> VisitResult {
        if node.is_compound() {
            if node.cores.iter().any(|core| !core.group_by.is_empty()) {
                return Err(ordering("compound select members cannot use GROUP BY"));
            }
            let width = self.result_width(&node.cores[0])?;
            for core in &node.cores[1..] {
                if self.result_width(core)? != width {
                    return Err(ordering("compound select members return different column counts"));
                }
            }
            let ordinals = (1..=width).map(|i| Expr::integer(i as i64)).collect();
            append_missing_terms(node, ordinals, false);
            return Ok(());
        }

        let (terms, single) = self.core_terms(&node.cores[0])?;
        append_missing_terms(node, terms, single);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{Attribute, AttributeKind, Column, DataType, Index, IndexKind},
        parse::parse_statement,
    };

    fn tables() -> Vec<Table> {
        let pk = || Attribute::new(AttributeKind::PrimaryKey);
        vec![
            Table {
                name: "users".into(),
                columns: vec![
                    Column::new("id", DataType::Int).with_attribute(pk()),
                    Column::new("name", DataType::Text),
                ],
                indexes: vec![],
                foreign_keys: vec![],
            },
            Table {
                name: "posts".into(),
                columns: vec![
                    Column::new("id", DataType::Int),
                    Column::new("author", DataType::Int),
                    Column::new("title", DataType::Text),
                ],
                indexes: vec![Index {
                    name: "posts_pk".into(),
                    columns: vec!["id".into(), "author".into()],
                    kind: IndexKind::Primary,
                }],
                foreign_keys: vec![],
            },
        ]
    }

    fn order(sql: &str) -> Result<String, AnalyzeError> {
        let tables = tables();
        let mut stmt = parse_statement(sql)?;
        walk_statement(&mut GuaranteedOrder::new(&tables), &mut stmt)?;
        Ok(stmt.to_string())
    }

    #[test]
    fn orders_by_primary_key() {
        assert_eq!(
            order("SELECT name FROM users").unwrap(),
            "SELECT name FROM users ORDER BY users.id"
        );
    }

    #[test]
    fn orders_joins_by_every_key_sorted_by_reference() {
        assert_eq!(
            order("SELECT u.name FROM users AS u JOIN posts AS p ON p.author = u.id").unwrap(),
            "SELECT u.name FROM users AS u JOIN posts AS p ON p.author = u.id \
             ORDER BY p.author, p.id, u.id"
        );
    }

    #[test]
    fn keeps_user_terms_first_and_is_idempotent() {
        let once = order("SELECT name FROM users ORDER BY name DESC").unwrap();
        assert_eq!(once, "SELECT name FROM users ORDER BY name DESC, users.id");
        assert_eq!(order(&once).unwrap(), once);
    }

    #[test]
    fn orders_subqueries_and_ctes() {
        assert_eq!(
            order("WITH c AS (SELECT id FROM users) SELECT id FROM c").unwrap(),
            "WITH c AS (SELECT id FROM users ORDER BY users.id) SELECT id FROM c ORDER BY c.id"
        );
        assert_eq!(
            order("SELECT s.id FROM (SELECT id FROM users) AS s").unwrap(),
            "SELECT s.id FROM (SELECT id FROM users ORDER BY users.id) AS s ORDER BY s.id"
        );
    }

    #[test]
    fn compound_selects_use_ordinals() {
        assert_eq!(
            order("SELECT id, name FROM users UNION SELECT id, title FROM posts").unwrap(),
            "SELECT id, name FROM users UNION SELECT id, title FROM posts ORDER BY 1, 2"
        );
    }

    #[test]
    fn aggregates_without_grouping_are_left_alone() {
        assert_eq!(
            order("SELECT count(*) FROM users").unwrap(),
            "SELECT count(*) FROM users"
        );
    }

    #[test]
    fn unknown_tables_are_reported() {
        assert_eq!(
            order("SELECT x FROM missing").unwrap_err(),
            AnalyzeError::UnknownTable("missing".into())
        );
    }
}
