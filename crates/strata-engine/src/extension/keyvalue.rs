//! `keyvalue`: get/set over a two-column table of the deploying schema.
//!
//! ```text
//! use keyvalue { table: 'settings', key: 'name', value: 'setting' } as kv;
//! ```

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use super::{DeploymentContext, ExtensionInitializer, Namespace};
use crate::{error::EngineError, runtime::ScopeContext, storage::Session, value::Value};

pub(super) const NAME: &str = "keyvalue";

pub struct KeyValueExtension;

struct KeyValue {
    get_sql: String,
    set_sql: String,
}

fn error(message: impl ToString) -> EngineError {
    EngineError::extension(NAME, message)
}

fn setting<'c>(config: &'c HashMap<String, String>, key: &str) -> Result<&'c str, EngineError> {
    config
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| error(format!("missing config key \"{key}\"")))
}

#[async_trait]
impl ExtensionInitializer for KeyValueExtension {
    async fn initialize(
        &self,
        ctx: &DeploymentContext<'_>,
        config: &HashMap<String, String>,
    ) -> Result<Arc<dyn Namespace>, EngineError> {
        let table_name = setting(config, "table")?;
        let key = setting(config, "key")?;
        let value = setting(config, "value")?;

        let table = ctx
            .schema
            .table(table_name)
            .ok_or_else(|| error(format!("table \"{table_name}\" does not exist")))?;
        let primary = table.primary_key().map_err(error)?;
        if primary != [key] {
            return Err(error(format!(
                "column \"{key}\" must be the sole primary key of \"{table_name}\""
            )));
        }
        if key == value || table.column(value).is_none() {
            return Err(error(format!(
                "table \"{table_name}\" has no value column \"{value}\""
            )));
        }

        Ok(Arc::new(KeyValue {
            get_sql: format!("SELECT {value} FROM {table_name} WHERE {key} = ?1"),
            set_sql: format!(
                "INSERT INTO {table_name} ({key}, {value}) VALUES (?1, ?2) \
                 ON CONFLICT ({key}) DO UPDATE SET {value} = excluded.{value}"
            ),
        }))
    }
}

#[async_trait]
impl Namespace for KeyValue {
    async fn call(
        &self,
        scope: &mut ScopeContext,
        session: &mut dyn Session,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, EngineError> {
        match (method, args.as_slice()) {
            ("get", [_]) => {
                let rows = session.query(scope.dbid(), &self.get_sql, &args).await?;
                let value = rows
                    .first_row()
                    .and_then(|row| row.first())
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(vec![value])
            }
            ("set", [_, _]) => {
                if !scope.is_mutative() {
                    return Err(error("set is not allowed in a read-only call"));
                }
                session.execute(scope.dbid(), &self.set_sql, &args).await?;
                Ok(Vec::new())
            }
            ("get", _) | ("set", _) => Err(error(format!(
                "{method} does not take {} arguments",
                args.len()
            ))),
            _ => Err(error(format!("unknown method \"{method}\""))),
        }
    }

    fn mutates(&self, method: &str) -> bool {
        method == "set"
    }
}
