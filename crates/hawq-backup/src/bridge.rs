//! PXF bridge table naming and SQL generation.
//!
//! A bridge table is an external table whose `LOCATION` points at the table's
//! directory under the backup's data directory. Backup streams rows out with
//! `INSERT INTO <bridge> SELECT * FROM <table>` through a writable bridge;
//! restore reads them back with `INSERT INTO <table> SELECT * FROM <bridge>`
//! through a readable one.
//!
//! Bridge names are `<schema>_<relation>`, cut to the identifier length limit.
//! That mapping is not injective (`s_1.t` and `s.1_t` agree), so the builder
//! remembers every name it hands out in a job and refuses to alias two tables.

use serde::Serialize;
use std::collections::HashMap;

use crate::core::identifier::MAX_IDENTIFIER_LENGTH;
use crate::core::{qualify_pg, quote_literal, quote_pg, TableRef};
use crate::error::{HdbError, Result};

/// PXF profile used for both directions.
pub const PXF_PROFILE: &str = "HdfsTextSimple";

/// Direction of a bridge table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeDirection {
    /// Writable external table, rows flow database -> HDFS.
    Outbound,
    /// Readable external table, rows flow HDFS -> database.
    Inbound,
}

/// Everything needed to move one table through its bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeTableSpec {
    pub bridge_schema: String,
    pub bridge_name: String,
    pub source_table: TableRef,
    pub location_uri: String,
    pub direction: BridgeDirection,
    /// `CREATE [WRITABLE] EXTERNAL TABLE ...`
    pub create_sql: String,
    /// The insert-select that moves the rows.
    pub transfer_sql: String,
}

/// Builds bridge table specs for one job and one direction of data flow.
#[derive(Debug)]
pub struct BridgeBuilder {
    bridge_schema: String,
    pxf_host: String,
    pxf_port: u16,
    data_dir: String,
    allocated: HashMap<String, TableRef>,
}

impl BridgeBuilder {
    pub fn new(
        bridge_schema: impl Into<String>,
        pxf_host: impl Into<String>,
        pxf_port: u16,
        data_dir: impl Into<String>,
    ) -> Self {
        Self {
            bridge_schema: bridge_schema.into(),
            pxf_host: pxf_host.into(),
            pxf_port,
            data_dir: data_dir.into().trim_end_matches('/').to_string(),
            allocated: HashMap::new(),
        }
    }

    pub fn bridge_schema(&self) -> &str {
        &self.bridge_schema
    }

    /// Deterministic bridge name for a table.
    pub fn bridge_name(table: &TableRef) -> String {
        truncate_identifier(&format!("{}_{}", table.schema, table.relation))
    }

    /// Reserve the bridge name for `table`, failing if another table holds it.
    fn allocate(&mut self, table: &TableRef) -> Result<String> {
        let name = Self::bridge_name(table);
        match self.allocated.get(&name) {
            Some(existing) if existing != table => Err(HdbError::BridgeNamingCollision {
                name,
                first: existing.to_string(),
                second: table.to_string(),
            }),
            Some(_) => Ok(name),
            None => {
                self.allocated.insert(name.clone(), table.clone());
                Ok(name)
            }
        }
    }

    /// PXF location of a table's data directory.
    pub fn location_uri(&self, table: &TableRef) -> Result<String> {
        for part in [&table.schema, &table.relation] {
            if part.contains(['/', '?', '#', '\'']) || part == "." || part == ".." {
                return Err(HdbError::Config(format!(
                    "Name {} cannot be used as an HDFS path component",
                    table
                )));
            }
        }
        Ok(format!(
            "pxf://{}:{}{}/{}/{}?profile={}",
            self.pxf_host, self.pxf_port, self.data_dir, table.schema, table.relation, PXF_PROFILE
        ))
    }

    /// Writable bridge plus `INSERT INTO bridge SELECT * FROM table`.
    pub fn build_outbound(&mut self, table: &TableRef) -> Result<BridgeTableSpec> {
        self.build(table, BridgeDirection::Outbound)
    }

    /// Readable bridge plus `INSERT INTO table SELECT * FROM bridge`.
    pub fn build_inbound(&mut self, table: &TableRef) -> Result<BridgeTableSpec> {
        self.build(table, BridgeDirection::Inbound)
    }

    fn build(&mut self, table: &TableRef, direction: BridgeDirection) -> Result<BridgeTableSpec> {
        let location_uri = self.location_uri(table)?;
        let bridge_name = self.allocate(table)?;
        let bridge = qualify_pg(&self.bridge_schema, &bridge_name)?;
        let source = table.quoted()?;

        let (keyword, transfer_sql) = match direction {
            BridgeDirection::Outbound => (
                "CREATE WRITABLE EXTERNAL TABLE",
                format!("INSERT INTO {} SELECT * FROM {}", bridge, source),
            ),
            BridgeDirection::Inbound => (
                "CREATE EXTERNAL TABLE",
                format!("INSERT INTO {} SELECT * FROM {}", source, bridge),
            ),
        };
        let create_sql = format!(
            "{} {} (LIKE {}) LOCATION ({}) FORMAT 'TEXT' (DELIMITER = E'\\t')",
            keyword,
            bridge,
            source,
            quote_literal(&location_uri)?
        );

        Ok(BridgeTableSpec {
            bridge_schema: self.bridge_schema.clone(),
            bridge_name,
            source_table: table.clone(),
            location_uri,
            direction,
            create_sql,
            transfer_sql,
        })
    }
}

/// `CREATE SCHEMA` for the bridge schema.
pub fn create_schema_sql(schema: &str) -> Result<String> {
    Ok(format!("CREATE SCHEMA {}", quote_pg(schema)?))
}

/// `DROP SCHEMA ... CASCADE`, removing every bridge table with it.
pub fn drop_schema_sql(schema: &str) -> Result<String> {
    Ok(format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_pg(schema)?))
}

/// Cut a name to the identifier limit without splitting a character.
fn truncate_identifier(name: &str) -> String {
    if name.len() <= MAX_IDENTIFIER_LENGTH {
        return name.to_string();
    }
    let mut end = MAX_IDENTIFIER_LENGTH;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(schema: &str, relation: &str) -> TableRef {
        TableRef::new(schema, relation).unwrap()
    }

    fn builder() -> BridgeBuilder {
        BridgeBuilder::new(
            "hawqbackup_schema",
            "localhost",
            51200,
            "/hawq_backup/20240101120000/orders/data",
        )
    }

    #[test]
    fn test_outbound_sql() {
        let spec = builder().build_outbound(&table("s", "a")).unwrap();
        assert_eq!(spec.bridge_name, "s_a");
        assert_eq!(
            spec.location_uri,
            "pxf://localhost:51200/hawq_backup/20240101120000/orders/data/s/a?profile=HdfsTextSimple"
        );
        assert_eq!(
            spec.create_sql,
            "CREATE WRITABLE EXTERNAL TABLE \"hawqbackup_schema\".\"s_a\" (LIKE \"s\".\"a\") \
             LOCATION ('pxf://localhost:51200/hawq_backup/20240101120000/orders/data/s/a?profile=HdfsTextSimple') \
             FORMAT 'TEXT' (DELIMITER = E'\\t')"
        );
        assert_eq!(
            spec.transfer_sql,
            "INSERT INTO \"hawqbackup_schema\".\"s_a\" SELECT * FROM \"s\".\"a\""
        );
    }

    #[test]
    fn test_inbound_sql_reverses_flow() {
        let mut b = BridgeBuilder::new("hawqrestore_schema", "pxfhost", 51200, "/b/1/db/data/");
        let spec = b.build_inbound(&table("s", "a")).unwrap();
        assert!(spec.create_sql.starts_with("CREATE EXTERNAL TABLE \"hawqrestore_schema\".\"s_a\""));
        assert!(spec.location_uri.starts_with("pxf://pxfhost:51200/b/1/db/data/s/a?"));
        assert_eq!(
            spec.transfer_sql,
            "INSERT INTO \"s\".\"a\" SELECT * FROM \"hawqrestore_schema\".\"s_a\""
        );
        assert_eq!(spec.direction, BridgeDirection::Inbound);
    }

    #[test]
    fn test_bridge_name_is_deterministic() {
        let mut b = builder();
        let first = b.build_outbound(&table("sales", "orders")).unwrap();
        let again = b.build_outbound(&table("sales", "orders")).unwrap();
        assert_eq!(first.bridge_name, again.bridge_name);
        assert_eq!(BridgeBuilder::bridge_name(&table("sales", "orders")), "sales_orders");
    }

    #[test]
    fn test_distinct_tables_never_alias() {
        let pairs = [
            (table("s1", "t"), table("s", "1t")),
            (table("s_1", "t"), table("s", "1_t")),
            (table("a_b", "c"), table("a", "b_c")),
        ];
        for (left, right) in pairs {
            let mut b = builder();
            let first = b.build_outbound(&left).unwrap();
            match b.build_outbound(&right) {
                Ok(second) => assert_ne!(first.bridge_name, second.bridge_name),
                Err(HdbError::BridgeNamingCollision { name, .. }) => {
                    assert_eq!(name, first.bridge_name)
                }
                Err(e) => panic!("unexpected error {}", e),
            }
        }
    }

    #[test]
    fn test_long_names_truncate_and_collide_loudly() {
        let long = "x".repeat(60);
        let left = table(&long, "orders_2023");
        let right = table(&long, "orders_2024");
        let mut b = builder();
        let first = b.build_outbound(&left).unwrap();
        assert_eq!(first.bridge_name.len(), MAX_IDENTIFIER_LENGTH);
        assert!(matches!(
            b.build_outbound(&right),
            Err(HdbError::BridgeNamingCollision { .. })
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let name = format!("{}é", "a".repeat(62));
        let cut = truncate_identifier(&name);
        assert_eq!(cut, "a".repeat(62));
    }

    #[test]
    fn test_quotes_in_names_are_escaped() {
        let spec = builder().build_outbound(&table("Mixed", "Ca\"se")).unwrap();
        assert!(spec.create_sql.contains("(LIKE \"Mixed\".\"Ca\"\"se\")"));
        assert!(spec.create_sql.contains("\"Mixed_Ca\"\"se\""));
    }

    #[test]
    fn test_path_hostile_names_rejected() {
        assert!(builder().build_outbound(&table("s", "a/b")).is_err());
        assert!(builder().build_outbound(&table("s", "it's")).is_err());
        assert!(builder().build_outbound(&table("..", "t")).is_err());
    }

    #[test]
    fn test_schema_sql() {
        assert_eq!(
            drop_schema_sql("hawqbackup_schema").unwrap(),
            "DROP SCHEMA IF EXISTS \"hawqbackup_schema\" CASCADE"
        );
        assert_eq!(
            create_schema_sql("hawqbackup_schema").unwrap(),
            "CREATE SCHEMA \"hawqbackup_schema\""
        );
    }
}
