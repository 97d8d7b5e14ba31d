//! Persisted schema blobs and their format versions.

use serde_json::{Map, Value as Json};
use tracing::info;

use crate::{error::EngineError, schema::Schema};

/// Format written by this build.
pub const SCHEMA_VERSION: i64 = 1;

/// One row of the metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSchema {
    pub dbid: String,
    pub version: i64,
    pub owner: Vec<u8>,
    pub name: String,
    pub schema: String,
}

impl StoredSchema {
    pub fn encode(dbid: &str, schema: &Schema) -> Result<Self, EngineError> {
        let blob = serde_json::to_string(schema)
            .map_err(|err| EngineError::InvalidSchema(format!("encode schema: {err}")))?;
        Ok(Self {
            dbid: dbid.to_owned(),
            version: SCHEMA_VERSION,
            owner: schema.owner.clone(),
            name: schema.name.clone(),
            schema: blob,
        })
    }

    /// Decodes the blob, migrating older formats forward.
    pub fn decode(&self) -> Result<Schema, EngineError> {
        if self.version > SCHEMA_VERSION || self.version < 0 {
            return Err(EngineError::UnsupportedVersion(self.version));
        }
        let mut raw: Json = serde_json::from_str(&self.schema)
            .map_err(|err| EngineError::InvalidSchema(format!("{}: {err}", self.dbid)))?;
        if self.version == 0 {
            info!(dbid = %self.dbid, "migrating schema metadata from version 0");
            migrate_v0(&mut raw);
        }
        serde_json::from_value(raw)
            .map_err(|err| EngineError::InvalidSchema(format!("{}: {err}", self.dbid)))
    }
}

/// Version 0 named procedure parameters `inputs` and had no visibility flag;
/// every procedure was public.
fn migrate_v0(raw: &mut Json) {
    let Some(procedures) = raw.get_mut("procedures").and_then(Json::as_array_mut) else {
        return;
    };
    for procedure in procedures.iter_mut().filter_map(Json::as_object_mut) {
        rename(procedure, "inputs", "parameters");
        procedure
            .entry("public")
            .or_insert(Json::Bool(true));
    }
}

fn rename(object: &mut Map<String, Json>, from: &str, to: &str) {
    if let Some(value) = object.remove(from) {
        object.entry(to).or_insert(value);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stored(version: i64, schema: Json) -> StoredSchema {
        StoredSchema {
            dbid: "xdb".into(),
            version,
            owner: vec![],
            name: "legacy".into(),
            schema: schema.to_string(),
        }
    }

    #[test]
    fn version_zero_procedures_become_public_with_parameters() {
        let schema = stored(
            0,
            json!({
                "name": "legacy",
                "procedures": [
                    {"name": "add", "inputs": ["$a"], "statements": []},
                    {"name": "hidden", "inputs": [], "public": false}
                ]
            }),
        )
        .decode()
        .unwrap();
        assert_eq!(schema.procedures[0].parameters, vec!["$a"]);
        assert!(schema.procedures[0].public);
        assert!(!schema.procedures[1].public);
    }

    #[test]
    fn current_version_round_trips() {
        let mut schema: Schema = serde_json::from_value(json!({"name": "now", "owner": "ff"})).unwrap();
        schema.clean().unwrap();
        let row = StoredSchema::encode(&schema.dbid(), &schema).unwrap();
        assert_eq!(row.version, SCHEMA_VERSION);
        assert_eq!(row.decode().unwrap(), schema);
    }

    #[test]
    fn newer_versions_are_rejected() {
        assert!(matches!(
            stored(SCHEMA_VERSION + 1, json!({"name": "future"})).decode(),
            Err(EngineError::UnsupportedVersion(2))
        ));
    }
}
