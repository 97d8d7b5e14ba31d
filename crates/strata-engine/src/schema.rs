//! The deployable schema model.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use strata_sql::{
    catalog::validate_tables,
    ident::{check_name_shape, normalize_identifier},
    Table,
};

use crate::error::EngineError;

/// A named, owned logical database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    #[serde(default, with = "hex_bytes")]
    pub owner: Vec<u8>,
    #[serde(default)]
    pub extensions: Vec<ExtensionUsage>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub procedures: Vec<Procedure>,
}

/// `use <name> { key: value } as <alias>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionUsage {
    /// Registered provider name, or the DBID of another dataset.
    pub name: String,
    pub alias: String,
    #[serde(default)]
    pub config: Vec<ExtensionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
    #[serde(default)]
    pub statements: Vec<String>,
}

impl Procedure {
    pub fn is_view(&self) -> bool {
        self.modifiers.contains(&Modifier::View)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Modifier {
    View,
    Owner,
    Authenticated,
    /// Kept so that newer schemas still load; has no effect.
    Unknown(String),
}

impl From<String> for Modifier {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "view" => Modifier::View,
            "owner" => Modifier::Owner,
            "authenticated" => Modifier::Authenticated,
            _ => Modifier::Unknown(value),
        }
    }
}

impl From<Modifier> for String {
    fn from(value: Modifier) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modifier::View => f.write_str("view"),
            Modifier::Owner => f.write_str("owner"),
            Modifier::Authenticated => f.write_str("authenticated"),
            Modifier::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Deterministic dataset identifier: `x` followed by the hex SHA-224 of the
/// lower-cased name and the owner bytes.
pub fn dbid(name: &str, owner: &[u8]) -> String {
    let mut hasher = Sha224::new();
    hasher.update(name.to_ascii_lowercase().as_bytes());
    hasher.update(owner);
    format!("x{}", hex::encode(hasher.finalize()))
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::InvalidSchema(message.into())
}

fn clean_identifier(raw: &str, what: &str) -> Result<String, EngineError> {
    normalize_identifier(raw).map_err(|reason| invalid(format!("{what} \"{raw}\": {reason}")))
}

/// Config keys never reach SQL, so keywords such as `table` are allowed.
fn clean_config_key(raw: &str) -> Result<String, EngineError> {
    let key = raw.trim().to_ascii_lowercase();
    check_name_shape(&key)
        .map_err(|reason| invalid(format!("extension config key \"{raw}\": {reason}")))?;
    Ok(key)
}

fn clean_parameter(raw: &str, procedure: &str) -> Result<String, EngineError> {
    let trimmed = raw.trim();
    let name = trimmed.strip_prefix('$').ok_or_else(|| {
        invalid(format!(
            "parameter \"{raw}\" of procedure {procedure} must start with $"
        ))
    })?;
    Ok(format!(
        "${}",
        clean_identifier(name, &format!("parameter of procedure {procedure}"))?
    ))
}

fn strip_quotes(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value)
        .to_owned()
}

impl Schema {
    pub fn dbid(&self) -> String {
        dbid(&self.name, &self.owner)
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.name == name)
    }

    pub fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures.iter().find(|procedure| procedure.name == name)
    }

    /// Normalizes every name to lower case and validates the schema as a
    /// whole. Names of tables, procedures and extension aliases share one
    /// namespace.
    pub fn clean(&mut self) -> Result<(), EngineError> {
        self.name = clean_identifier(&self.name, "schema name")?;

        let mut names = HashSet::new();
        let mut claim = |name: &str| -> Result<(), EngineError> {
            if names.insert(name.to_owned()) {
                Ok(())
            } else {
                Err(invalid(format!("name \"{name}\" is declared more than once")))
            }
        };

        for table in &mut self.tables {
            table.clean()?;
            claim(&table.name)?;
        }
        validate_tables(&self.tables)?;

        let mut indexes = HashSet::new();
        for index in self.tables.iter().flat_map(|table| &table.indexes) {
            if !indexes.insert(index.name.as_str()) {
                return Err(invalid(format!("index \"{}\" is declared more than once", index.name)));
            }
        }

        for usage in &mut self.extensions {
            usage.name = usage.name.trim().to_ascii_lowercase();
            if usage.name.is_empty() {
                return Err(invalid("extension name is empty"));
            }
            usage.alias = clean_identifier(&usage.alias, "extension alias")?;
            claim(&usage.alias)?;

            let mut keys = HashSet::new();
            for entry in &mut usage.config {
                entry.key = clean_config_key(&entry.key)?;
                entry.value = strip_quotes(&entry.value);
                if !keys.insert(entry.key.clone()) {
                    return Err(invalid(format!(
                        "config key \"{}\" repeated for extension {}",
                        entry.key, usage.alias
                    )));
                }
            }
        }

        for procedure in &mut self.procedures {
            procedure.name = clean_identifier(&procedure.name, "procedure name")?;
            claim(&procedure.name)?;

            let mut seen = HashSet::new();
            for parameter in &mut procedure.parameters {
                *parameter = clean_parameter(parameter, &procedure.name)?;
                if !seen.insert(parameter.clone()) {
                    return Err(invalid(format!(
                        "parameter {parameter} repeated in procedure {}",
                        procedure.name
                    )));
                }
            }
            let mut modifiers = HashSet::new();
            procedure
                .modifiers
                .retain(|modifier| modifiers.insert(modifier.clone()));
        }
        Ok(())
    }
}

/// Owner bytes travel as hex in the persisted JSON.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> Schema {
        serde_json::from_value(json!({
            "name": "Social",
            "owner": "0a0b",
            "extensions": [
                {"name": "KeyValue", "alias": "KV", "config": [{"key": "Table", "value": "'kv'"}]}
            ],
            "tables": [{
                "name": "Users",
                "columns": [
                    {"name": "ID", "type": "int", "attributes": [{"kind": "PRIMARY_KEY"}]},
                    {"name": "name", "type": "text"}
                ]
            }],
            "procedures": [{
                "name": "Create_User",
                "parameters": ["$ID", "$name"],
                "public": true,
                "modifiers": ["OWNER", "sometimes"],
                "statements": ["INSERT INTO users (id, name) VALUES ($id, $name);"]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn clean_normalizes_names() {
        let mut schema = schema();
        schema.clean().unwrap();
        assert_eq!(schema.name, "social");
        assert_eq!(schema.tables[0].name, "users");
        assert_eq!(schema.extensions[0].name, "keyvalue");
        assert_eq!(schema.extensions[0].alias, "kv");
        assert_eq!(schema.extensions[0].config[0].key, "table");
        assert_eq!(schema.extensions[0].config[0].value, "kv");
        let procedure = &schema.procedures[0];
        assert_eq!(procedure.name, "create_user");
        assert_eq!(procedure.parameters, vec!["$id", "$name"]);
        assert_eq!(
            procedure.modifiers,
            vec![Modifier::Owner, Modifier::Unknown("sometimes".into())]
        );
    }

    #[test]
    fn clean_rejects_shared_names_and_bad_parameters() {
        let mut clash = schema();
        clash.procedures[0].name = "users".into();
        assert!(matches!(clash.clean(), Err(EngineError::InvalidSchema(_))));

        let mut bare = schema();
        bare.procedures[0].parameters = vec!["id".into()];
        assert!(bare.clean().is_err());

        let mut repeated = schema();
        repeated.procedures[0].parameters = vec!["$id".into(), "$ID".into()];
        assert!(repeated.clean().is_err());
    }

    #[test]
    fn clean_drops_repeated_modifiers_anywhere() {
        let mut schema = schema();
        schema.procedures[0].modifiers = vec![
            Modifier::Owner,
            Modifier::View,
            Modifier::from("owner".to_string()),
        ];
        schema.clean().unwrap();
        assert_eq!(schema.procedures[0].modifiers, vec![Modifier::Owner, Modifier::View]);
    }

    #[test]
    fn config_keys_may_be_keywords_but_not_malformed() {
        let mut schema = schema();
        schema.extensions[0].config = vec![
            ExtensionConfig {
                key: "Table".into(),
                value: "'kv'".into(),
            },
            ExtensionConfig {
                key: "key".into(),
                value: "'k'".into(),
            },
        ];
        schema.clean().unwrap();
        assert_eq!(schema.extensions[0].config[0].key, "table");

        let mut bad = self::schema();
        bad.extensions[0].config[0].key = "bad-key".into();
        assert!(matches!(bad.clean(), Err(EngineError::InvalidSchema(_))));
    }

    #[test]
    fn clean_reports_catalog_errors() {
        let mut schema = schema();
        schema.tables[0].columns[0].attributes.clear();
        assert!(matches!(schema.clean(), Err(EngineError::Catalog(_))));
    }

    #[test]
    fn dbid_is_case_insensitive_in_name_only() {
        let owner = [1u8, 2, 3];
        let id = dbid("Social", &owner);
        assert_eq!(id, dbid("social", &owner));
        assert_ne!(id, dbid("social", &[1u8, 2]));
        assert_eq!(id.len(), 1 + 56);
        assert!(id.starts_with('x'));
    }

    #[test]
    fn owner_round_trips_as_hex() {
        let schema = schema();
        assert_eq!(schema.owner, vec![0x0a, 0x0b]);
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["owner"], "0a0b");
        assert_eq!(json["procedures"][0]["modifiers"][1], "sometimes");
    }
}
