//! Table identity types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::identifier::{parse_identifier, parse_qualified_name, qualify_pg, validate_identifier};
use crate::error::{HdbError, Result};

/// A schema-qualified relation, stored unquoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema (namespace) name.
    pub schema: String,

    /// Relation name.
    pub relation: String,
}

impl TableRef {
    /// Create a table reference from raw catalog names.
    pub fn new(schema: impl Into<String>, relation: impl Into<String>) -> Result<Self> {
        let table = Self {
            schema: schema.into(),
            relation: relation.into(),
        };
        validate_identifier(&table.schema)?;
        validate_identifier(&table.relation)?;
        Ok(table)
    }

    /// Parse user input such as `public.orders` or `"sch.ema"."t"`.
    pub fn parse(input: &str) -> Result<Self> {
        let (schema, relation) = parse_qualified_name(input)?;
        Ok(Self { schema, relation })
    }

    /// The quoted, schema-qualified form used in SQL.
    pub fn quoted(&self) -> Result<String> {
        qualify_pg(&self.schema, &self.relation)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\".\"{}\"",
            self.schema.replace('"', "\"\""),
            self.relation.replace('"', "\"\"")
        )
    }
}

impl FromStr for TableRef {
    type Err = HdbError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parse a list of schema names from user input.
pub fn parse_schema_names(items: &[String]) -> Result<Vec<String>> {
    items.iter().map(|s| parse_identifier(s)).collect()
}

/// Parse a list of qualified table names from user input.
pub fn parse_table_names(items: &[String]) -> Result<Vec<TableRef>> {
    items.iter().map(|s| TableRef::parse(s)).collect()
}
