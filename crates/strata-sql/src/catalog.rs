//! Table metadata consumed by the analyzer and persisted with each schema.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{error::CatalogError, ident::normalize_identifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    Text,
    Bool,
    Blob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub kind: AttributeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Attribute {
    pub fn new(kind: AttributeKind) -> Self {
        Self { kind, value: None }
    }

    pub fn with_value(kind: AttributeKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeKind {
    PrimaryKey,
    Unique,
    NotNull,
    Default,
    Min,
    Max,
    MinLength,
    MaxLength,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(rename = "type")]
    pub kind: IndexKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexKind {
    Btree,
    UniqueBtree,
    Primary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub child_keys: Vec<String>,
    pub parent_table: String,
    pub parent_keys: Vec<String>,
    #[serde(default)]
    pub actions: Vec<ForeignKeyAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyAction {
    pub on: ForeignKeyEvent,
    #[serde(rename = "do")]
    pub action: ReferentialAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForeignKeyEvent {
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferentialAction {
    NoAction,
    Restrict,
    SetNull,
    SetDefault,
    Cascade,
}

fn clean_name(name: &mut String) -> Result<(), CatalogError> {
    *name = normalize_identifier(name).map_err(|reason| CatalogError::InvalidName {
        name: name.clone(),
        reason: reason.to_owned(),
    })?;
    Ok(())
}

fn clean_names(names: &mut [String]) -> Result<(), CatalogError> {
    names.iter_mut().try_for_each(clean_name)
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Columns of the table's single primary key, in declaration order.
    pub fn primary_key(&self) -> Result<Vec<String>, CatalogError> {
        let mut from_attribute = self
            .columns
            .iter()
            .filter(|column| column.has_attribute(AttributeKind::PrimaryKey))
            .map(|column| column.name.clone());
        let mut from_index = self
            .indexes
            .iter()
            .filter(|index| index.kind == IndexKind::Primary);

        match (
            from_attribute.next(),
            from_attribute.next(),
            from_index.next(),
            from_index.next(),
        ) {
            (Some(column), None, None, None) => Ok(vec![column]),
            (None, None, Some(index), None) => Ok(index.columns.clone()),
            (None, None, None, None) => Err(CatalogError::MissingPrimaryKey(self.name.clone())),
            _ => Err(CatalogError::MultiplePrimaryKeys(self.name.clone())),
        }
    }

    /// Normalizes names and checks everything that does not need the other
    /// tables of the schema.
    pub fn clean(&mut self) -> Result<(), CatalogError> {
        clean_name(&mut self.name)?;

        let mut seen = HashSet::new();
        for column in &mut self.columns {
            column.clean(&self.name)?;
            if !seen.insert(column.name.clone()) {
                return Err(CatalogError::DuplicateName(format!(
                    "{}.{}",
                    self.name, column.name
                )));
            }
        }

        for index in &mut self.indexes {
            clean_name(&mut index.name)?;
            clean_names(&mut index.columns)?;
        }
        for fk in &mut self.foreign_keys {
            clean_name(&mut fk.parent_table)?;
            clean_names(&mut fk.child_keys)?;
            clean_names(&mut fk.parent_keys)?;
        }

        self.primary_key()?;

        for index in &self.indexes {
            if index.columns.is_empty() {
                return Err(CatalogError::InvalidIndex {
                    table: self.name.clone(),
                    index: index.name.clone(),
                    reason: "index has no columns".into(),
                });
            }
            if let Some(missing) = index.columns.iter().find(|c| self.column(c).is_none()) {
                return Err(CatalogError::UnknownColumn {
                    table: self.name.clone(),
                    column: missing.clone(),
                });
            }
        }

        for fk in &self.foreign_keys {
            if fk.child_keys.is_empty() || fk.child_keys.len() != fk.parent_keys.len() {
                return Err(CatalogError::InvalidForeignKey {
                    table: self.name.clone(),
                    reason: "child and parent key counts must match".into(),
                });
            }
            if let Some(missing) = fk.child_keys.iter().find(|c| self.column(c).is_none()) {
                return Err(CatalogError::UnknownColumn {
                    table: self.name.clone(),
                    column: missing.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn has_attribute(&self, kind: AttributeKind) -> bool {
        self.attributes.iter().any(|attr| attr.kind == kind)
    }

    fn clean(&mut self, table: &str) -> Result<(), CatalogError> {
        clean_name(&mut self.name)?;
        let invalid = |reason: String| CatalogError::InvalidAttribute {
            table: table.to_owned(),
            column: self.name.clone(),
            reason,
        };

        let mut seen = HashSet::new();
        for attr in &self.attributes {
            if !seen.insert(attr.kind) {
                return Err(invalid(format!("{:?} declared twice", attr.kind)));
            }
            match attr.kind {
                AttributeKind::PrimaryKey | AttributeKind::Unique | AttributeKind::NotNull => {
                    if attr.value.is_some() {
                        return Err(invalid(format!("{:?} takes no value", attr.kind)));
                    }
                }
                AttributeKind::Min | AttributeKind::Max => {
                    if self.data_type != DataType::Int {
                        return Err(invalid(format!("{:?} requires an int column", attr.kind)));
                    }
                    integer_value(attr).map_err(invalid)?;
                }
                AttributeKind::MinLength | AttributeKind::MaxLength => {
                    if self.data_type != DataType::Text {
                        return Err(invalid(format!("{:?} requires a text column", attr.kind)));
                    }
                    let length = integer_value(attr).map_err(invalid)?;
                    if length < 0 {
                        return Err(invalid("length bounds cannot be negative".into()));
                    }
                }
                AttributeKind::Default => {
                    let value = attr
                        .value
                        .as_deref()
                        .ok_or_else(|| invalid("DEFAULT requires a value".into()))?;
                    check_default(self.data_type, value).map_err(invalid)?;
                }
            }
        }
        Ok(())
    }
}

fn integer_value(attr: &Attribute) -> Result<i64, String> {
    let raw = attr
        .value
        .as_deref()
        .ok_or_else(|| format!("{:?} requires a value", attr.kind))?;
    raw.trim()
        .parse::<i64>()
        .map_err(|_| format!("{:?} value \"{raw}\" is not an integer", attr.kind))
}

/// Contents of a single-quoted SQL string literal with `''` escapes, or
/// `None` when `raw` is anything more than one such literal.
pub fn text_literal_value(raw: &str) -> Option<String> {
    let inner = raw.trim().strip_prefix('\'')?.strip_suffix('\'')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\'' && chars.next() != Some('\'') {
            return None;
        }
        out.push(c);
    }
    Some(out)
}

fn check_default(data_type: DataType, value: &str) -> Result<(), String> {
    let value = value.trim();
    let ok = match data_type {
        DataType::Int => value.parse::<i64>().is_ok(),
        DataType::Text => text_literal_value(value).is_some(),
        DataType::Bool => matches!(value.to_ascii_lowercase().as_str(), "true" | "false"),
        DataType::Blob => {
            value.len() >= 3
                && (value.starts_with("x'") || value.starts_with("X'"))
                && value.ends_with('\'')
                && value[2..value.len() - 1].len() % 2 == 0
                && value[2..value.len() - 1]
                    .chars()
                    .all(|c| c.is_ascii_hexdigit())
        }
    };
    if ok || value.eq_ignore_ascii_case("null") {
        Ok(())
    } else {
        Err(format!("default \"{value}\" does not match column type"))
    }
}

/// Checks relations between tables: unique table names and foreign key
/// targets. Expects every table to be cleaned already.
pub fn validate_tables(tables: &[Table]) -> Result<(), CatalogError> {
    let mut names = HashSet::new();
    for table in tables {
        if !names.insert(table.name.as_str()) {
            return Err(CatalogError::DuplicateName(table.name.clone()));
        }
    }

    for table in tables {
        for fk in &table.foreign_keys {
            let parent = tables
                .iter()
                .find(|t| t.name == fk.parent_table)
                .ok_or_else(|| CatalogError::UnknownTable(fk.parent_table.clone()))?;
            if let Some(missing) = fk.parent_keys.iter().find(|c| parent.column(c).is_none()) {
                return Err(CatalogError::UnknownColumn {
                    table: parent.name.clone(),
                    column: missing.clone(),
                });
            }
        }
    }
    Ok(())
}
