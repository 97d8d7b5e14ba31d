//! SQLite DDL for a cleaned set of tables.

use strata_sql::{
    catalog::text_literal_value, Attribute, AttributeKind, Column, DataType, ForeignKey,
    ForeignKeyEvent, IndexKind, ReferentialAction, Table,
};

use crate::error::EngineError;

/// Statements creating every table followed by its secondary indexes.
pub fn generate_ddl(tables: &[Table]) -> Result<Vec<String>, EngineError> {
    let mut statements = Vec::new();
    for table in tables {
        statements.push(create_table(table)?);
        for index in &table.indexes {
            let unique = match index.kind {
                IndexKind::Primary => continue,
                IndexKind::Btree => "",
                IndexKind::UniqueBtree => "UNIQUE ",
            };
            statements.push(format!(
                "CREATE {unique}INDEX {} ON {} ({})",
                index.name,
                table.name,
                index.columns.join(", ")
            ));
        }
    }
    Ok(statements)
}

fn create_table(table: &Table) -> Result<String, EngineError> {
    let mut parts = table
        .columns
        .iter()
        .map(column_definition)
        .collect::<Result<Vec<_>, _>>()?;

    let composite = table
        .indexes
        .iter()
        .find(|index| index.kind == IndexKind::Primary);
    if let Some(primary) = composite {
        parts.push(format!("PRIMARY KEY ({})", primary.columns.join(", ")));
    }
    // fails for tables that were never cleaned
    table.primary_key()?;

    parts.extend(table.foreign_keys.iter().map(foreign_key));
    Ok(format!("CREATE TABLE {} ({})", table.name, parts.join(", ")))
}

fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Int => "INT",
        DataType::Text => "TEXT",
        DataType::Bool => "BOOLEAN",
        DataType::Blob => "BLOB",
    }
}

fn column_definition(column: &Column) -> Result<String, EngineError> {
    let mut out = format!("{} {}", column.name, sql_type(column.data_type));
    let name = &column.name;
    for Attribute { kind, value } in &column.attributes {
        let value = value.as_deref().map(str::trim).unwrap_or_default();
        match kind {
            AttributeKind::PrimaryKey => out.push_str(" PRIMARY KEY NOT NULL"),
            AttributeKind::Unique => out.push_str(" UNIQUE"),
            AttributeKind::NotNull => {
                if !column.has_attribute(AttributeKind::PrimaryKey) {
                    out.push_str(" NOT NULL");
                }
            }
            AttributeKind::Default => {
                out.push_str(" DEFAULT ");
                out.push_str(&default_literal(column, value)?);
            }
            AttributeKind::Min => out.push_str(&format!(" CHECK ({name} >= {value})")),
            AttributeKind::Max => out.push_str(&format!(" CHECK ({name} <= {value})")),
            AttributeKind::MinLength => {
                out.push_str(&format!(" CHECK (length({name}) >= {value})"))
            }
            AttributeKind::MaxLength => {
                out.push_str(&format!(" CHECK (length({name}) <= {value})"))
            }
        }
    }
    Ok(out)
}

/// Text defaults are re-quoted from their parsed contents so that nothing
/// but the literal reaches the statement.
fn default_literal(column: &Column, value: &str) -> Result<String, EngineError> {
    Ok(match (column.data_type, value.to_ascii_lowercase().as_str()) {
        (DataType::Bool, "true") => "1".to_owned(),
        (DataType::Bool, "false") => "0".to_owned(),
        (_, "null") => "NULL".to_owned(),
        (DataType::Text, _) => {
            let text = text_literal_value(value).ok_or_else(|| {
                EngineError::InvalidSchema(format!(
                    "default of column {} is not a single string literal",
                    column.name
                ))
            })?;
            format!("'{}'", text.replace('\'', "''"))
        }
        _ => value.to_owned(),
    })
}

fn foreign_key(fk: &ForeignKey) -> String {
    let mut out = format!(
        "FOREIGN KEY ({}) REFERENCES {} ({})",
        fk.child_keys.join(", "),
        fk.parent_table,
        fk.parent_keys.join(", ")
    );
    for action in &fk.actions {
        let event = match action.on {
            ForeignKeyEvent::Update => "UPDATE",
            ForeignKeyEvent::Delete => "DELETE",
        };
        let reaction = match action.action {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
            ReferentialAction::Cascade => "CASCADE",
        };
        out.push_str(&format!(" ON {event} {reaction}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use strata_sql::{ForeignKeyAction, Index};

    use super::*;

    fn pk() -> Attribute {
        Attribute::new(AttributeKind::PrimaryKey)
    }

    #[test]
    fn renders_columns_and_constraints() {
        let table = Table {
            name: "users".into(),
            columns: vec![
                Column::new("id", DataType::Int).with_attribute(pk()),
                Column::new("name", DataType::Text)
                    .with_attribute(Attribute::new(AttributeKind::NotNull))
                    .with_attribute(Attribute::with_value(AttributeKind::MaxLength, "64")),
                Column::new("age", DataType::Int)
                    .with_attribute(Attribute::with_value(AttributeKind::Min, "0")),
                Column::new("active", DataType::Bool)
                    .with_attribute(Attribute::with_value(AttributeKind::Default, "TRUE")),
            ],
            indexes: vec![Index {
                name: "users_name".into(),
                columns: vec!["name".into()],
                kind: IndexKind::UniqueBtree,
            }],
            foreign_keys: vec![],
        };
        assert_eq!(
            generate_ddl(&[table]).unwrap(),
            vec![
                "CREATE TABLE users (id INT PRIMARY KEY NOT NULL, \
                 name TEXT NOT NULL CHECK (length(name) <= 64), \
                 age INT CHECK (age >= 0), active BOOLEAN DEFAULT 1)"
                    .to_string(),
                "CREATE UNIQUE INDEX users_name ON users (name)".to_string(),
            ]
        );
    }

    #[test]
    fn renders_composite_keys_and_foreign_keys() {
        let table = Table {
            name: "follows".into(),
            columns: vec![
                Column::new("follower", DataType::Int),
                Column::new("followed", DataType::Int),
            ],
            indexes: vec![Index {
                name: "follows_pk".into(),
                columns: vec!["follower".into(), "followed".into()],
                kind: IndexKind::Primary,
            }],
            foreign_keys: vec![ForeignKey {
                child_keys: vec!["follower".into()],
                parent_table: "users".into(),
                parent_keys: vec!["id".into()],
                actions: vec![ForeignKeyAction {
                    on: ForeignKeyEvent::Delete,
                    action: ReferentialAction::Cascade,
                }],
            }],
        };
        assert_eq!(
            generate_ddl(&[table]).unwrap(),
            vec![
                "CREATE TABLE follows (follower INT, followed INT, \
                 PRIMARY KEY (follower, followed), \
                 FOREIGN KEY (follower) REFERENCES users (id) ON DELETE CASCADE)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn text_defaults_render_as_a_single_literal() {
        let column = |default: &str| {
            Column::new("note", DataType::Text)
                .with_attribute(Attribute::with_value(AttributeKind::Default, default))
        };
        let table = |default: &str| Table {
            name: "notes".into(),
            columns: vec![Column::new("id", DataType::Int).with_attribute(pk()), column(default)],
            indexes: vec![],
            foreign_keys: vec![],
        };

        assert_eq!(
            generate_ddl(&[table("'it''s'")]).unwrap()[0],
            "CREATE TABLE notes (id INT PRIMARY KEY NOT NULL, note TEXT DEFAULT 'it''s')"
        );
        assert!(matches!(
            generate_ddl(&[table("'a' CHECK (abs(random()) % 2 = 0) COLLATE 'binary'")]),
            Err(EngineError::InvalidSchema(_))
        ));
    }

    #[test]
    fn tables_without_a_key_are_rejected() {
        let table = Table {
            name: "loose".into(),
            columns: vec![Column::new("a", DataType::Int)],
            indexes: vec![],
            foreign_keys: vec![],
        };
        assert!(matches!(generate_ddl(&[table]), Err(EngineError::Catalog(_))));
    }
}
