//! Table discovery and filter resolution.
//!
//! Only top-level heap tables are eligible: no system or toolkit namespaces,
//! no external tables (`relstorage = 'x'`) and no partition children, which
//! are reached through their parent's `INSERT ... SELECT`.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{FilterSet, Inclusion};
use crate::core::{quote_literal, TableRef};
use crate::db::Database;
use crate::error::{HdbError, Result};

/// Namespaces that never hold user data.
pub const SYSTEM_NAMESPACES: &[&str] = &[
    "pg_catalog",
    "information_schema",
    "pg_aoseg",
    "pg_bitmapindex",
    "pg_toast",
    "gp_toolkit",
];

/// Discovers the tables a job covers.
pub struct TableCatalog {
    db: Arc<dyn Database>,
    bridge_schemas: Vec<String>,
}

impl TableCatalog {
    /// `bridge_schemas` are hidden from discovery along with the system namespaces.
    pub fn new(db: Arc<dyn Database>, bridge_schemas: Vec<String>) -> Self {
        Self { db, bridge_schemas }
    }

    /// SQL listing eligible tables for `filter`, ordered by schema then relation.
    pub fn discovery_query(&self, filter: &FilterSet) -> Result<String> {
        let hidden = SYSTEM_NAMESPACES
            .iter()
            .map(|s| s.to_string())
            .chain(self.bridge_schemas.iter().cloned())
            .collect::<Vec<_>>();

        let mut sql = String::from(
            "SELECT n.nspname::text, c.relname::text\n\
             FROM pg_catalog.pg_class c\n\
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace\n\
             WHERE c.relkind = 'r'\n\
             AND c.relstorage <> 'x'\n",
        );
        sql.push_str(&format!("AND n.nspname NOT IN ({})\n", literal_list(&hidden)?));
        sql.push_str("AND n.nspname !~ '^pg_(toast_)?temp_'\n");
        sql.push_str(
            "AND c.oid NOT IN (SELECT parchildrelid FROM pg_catalog.pg_partition_rule)\n",
        );

        match &filter.include {
            Inclusion::All => {}
            Inclusion::Tables(tables) => {
                sql.push_str(&format!("AND ({})\n", table_predicate(tables)?));
            }
            Inclusion::Schemas(schemas) => {
                sql.push_str(&format!("AND n.nspname IN ({})\n", literal_list(schemas)?));
            }
        }
        if !filter.exclude_tables.is_empty() {
            sql.push_str(&format!(
                "AND NOT ({})\n",
                table_predicate(&filter.exclude_tables)?
            ));
        }
        if !filter.exclude_schemas.is_empty() {
            sql.push_str(&format!(
                "AND n.nspname NOT IN ({})\n",
                literal_list(&filter.exclude_schemas)?
            ));
        }

        sql.push_str("ORDER BY n.nspname, c.relname");
        Ok(sql)
    }

    /// Eligible tables in stable `(schema, relation)` order.
    pub async fn discover(&self, filter: &FilterSet) -> Result<Vec<TableRef>> {
        let sql = self.discovery_query(filter)?;
        let mut tables = self.db.query_tables(&sql).await?;
        tables.sort();
        tables.dedup();
        debug!("Discovered {} table(s) in {}", tables.len(), self.db.name());
        Ok(tables)
    }

    /// Check that every included table or schema was found.
    pub async fn verify(&self, filter: &FilterSet, discovered: &[TableRef]) -> Result<()> {
        match &filter.include {
            Inclusion::All => {
                if discovered.is_empty() {
                    warn!("No eligible tables found in {}", self.db.name());
                }
                Ok(())
            }
            Inclusion::Tables(tables) => {
                if discovered.len() == tables.len() {
                    return Ok(());
                }
                let missing = tables
                    .iter()
                    .filter(|t| !discovered.contains(t))
                    .map(|t| t.to_string())
                    .collect();
                Err(HdbError::FilterResolution {
                    kind: "Table",
                    expected: tables.len(),
                    found: discovered.len(),
                    missing,
                })
            }
            Inclusion::Schemas(schemas) => {
                let mut missing = Vec::new();
                for schema in schemas {
                    if !self.db.schema_exists(schema).await? {
                        missing.push(schema.clone());
                    }
                }
                if !missing.is_empty() {
                    return Err(HdbError::FilterResolution {
                        kind: "Schema",
                        expected: schemas.len(),
                        found: schemas.len() - missing.len(),
                        missing,
                    });
                }
                for schema in schemas {
                    if !discovered.iter().any(|t| &t.schema == schema) {
                        warn!("Schema {} has no eligible tables", schema);
                    }
                }
                Ok(())
            }
        }
    }

    /// Discover, then verify. Fails before anything is created.
    pub async fn resolve(&self, filter: &FilterSet) -> Result<Vec<TableRef>> {
        let tables = self.discover(filter).await?;
        self.verify(filter, &tables).await?;
        info!("Resolved {} table(s)", tables.len());
        Ok(tables)
    }
}

fn literal_list(values: &[String]) -> Result<String> {
    Ok(values
        .iter()
        .map(|v| quote_literal(v))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

fn table_predicate(tables: &[TableRef]) -> Result<String> {
    Ok(tables
        .iter()
        .map(|t| {
            Ok(format!(
                "(n.nspname = {} AND c.relname = {})",
                quote_literal(&t.schema)?,
                quote_literal(&t.relation)?
            ))
        })
        .collect::<Result<Vec<_>>>()?
        .join(" OR "))
}
