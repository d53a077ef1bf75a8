//! Core identity and identifier handling.
//!
//! - [`identifier`]: quoting, validation and parsing of user-supplied names
//! - [`schema`]: the [`TableRef`] type that every other module passes around

pub mod identifier;
pub mod schema;

pub use identifier::{parse_identifier, qualify_pg, quote_literal, quote_pg, split_list};
pub use schema::{parse_schema_names, parse_table_names, TableRef};
