use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::ValidationError;

/// PostgreSQL truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier pattern compiles")
});

pub fn validate_identifier(raw: &str) -> Result<&str, ValidationError> {
    if raw.len() > MAX_IDENTIFIER_LEN || !IDENTIFIER.is_match(raw) {
        return Err(ValidationError::InvalidIdentifier(raw.to_string()));
    }
    Ok(raw)
}

/// A schema-qualified table name whose parts passed the identifier grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableRef {
    schema: String,
    name: String,
}

impl TableRef {
    pub fn new(schema: &str, name: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            schema: validate_identifier(schema)?.to_string(),
            name: validate_identifier(name)?.to_string(),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sibling table `<name>_archive` in the same schema.
    pub fn archive(&self) -> Result<TableRef, ValidationError> {
        TableRef::new(&self.schema, &format!("{}_archive", self.name))
    }

    /// `"schema"."name"`, safe to splice into DDL.
    pub fn quoted(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }

    /// Key used for guards, advisory locks and logs.
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}
