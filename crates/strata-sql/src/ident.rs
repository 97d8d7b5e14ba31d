//! Identifier rules shared by the statement cleaner and the schema model.

pub const MAX_IDENTIFIER_LENGTH: usize = 32;

/// SQL keywords that may not be used as bare identifiers.
const RESERVED: &[&str] = &[
    "add", "all", "alter", "and", "as", "asc", "between", "by", "case", "cast", "check", "collate",
    "constraint", "create", "cross", "default", "delete", "desc", "distinct", "drop", "else",
    "end", "escape", "except", "exists", "false", "foreign", "from", "full", "group", "having",
    "in", "index", "inner", "insert", "intersect", "into", "is", "join", "left", "like", "limit",
    "natural", "not", "null", "offset", "on", "or", "order", "outer", "primary", "references",
    "returning", "right", "select", "set", "table", "then", "true", "union", "unique", "update",
    "using", "values", "when", "where", "with",
];

pub fn is_reserved(word: &str) -> bool {
    RESERVED.binary_search(&word).is_ok()
}

/// Checks an already lower-cased name against `[a-z][a-z0-9_]*` and the
/// length limit. Keywords pass; use [`check_identifier`] for anything that
/// ends up in SQL.
pub fn check_name_shape(name: &str) -> Result<(), &'static str> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err("identifier is empty"),
        Some(first) if !first.is_ascii_lowercase() => {
            return Err("identifier must start with a letter")
        }
        Some(_) => {}
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err("identifier may only contain letters, digits and underscores");
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err("identifier is longer than 32 characters");
    }
    Ok(())
}

/// Checks an already lower-cased identifier. Returns the reason on failure.
pub fn check_identifier(name: &str) -> Result<(), &'static str> {
    check_name_shape(name)?;
    if is_reserved(name) {
        return Err("identifier is a reserved keyword");
    }
    Ok(())
}

/// Lower-cases and trims `raw`, then validates it.
pub fn normalize_identifier(raw: &str) -> Result<String, &'static str> {
    let name = raw.trim().to_ascii_lowercase();
    check_identifier(&name)?;
    Ok(name)
}
