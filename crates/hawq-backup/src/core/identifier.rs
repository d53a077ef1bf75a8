//! Identifier validation, quoting and parsing for SQL generation.
//!
//! SQL identifiers cannot be bound as statement parameters, and neither can the
//! `LOCATION` clause of an external table. Every name that ends up in generated
//! SQL therefore goes through this module:
//!
//! 1. Validate identifiers for suspicious patterns (null bytes, excessive length)
//! 2. Wrap identifiers in double quotes, doubling embedded quotes
//! 3. Escape string literals by doubling single quotes
//!
//! User input such as `--table="sch.ema".orders` is parsed here as well. A
//! qualified name must contain exactly one dot outside double quotes; dots
//! inside a quoted part belong to the name.

use crate::error::{HdbError, Result};

/// Maximum identifier length in bytes (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier for security issues.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes (injection vector)
/// - Identifiers exceeding maximum length
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HdbError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(HdbError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(HdbError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// Escapes double quotes by doubling them and wraps in double quotes.
/// Validates the identifier before quoting.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a PostgreSQL table name with schema.
///
/// Returns `"schema"."table"` with proper quoting.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Quote a string literal, doubling single quotes.
///
/// Backslashes are doubled as well so the result is safe with
/// `standard_conforming_strings` off, which is the HAWQ default.
pub fn quote_literal(value: &str) -> Result<String> {
    if value.contains('\0') {
        return Err(HdbError::Config(format!(
            "SECURITY: Literal contains null byte: {:?}",
            value
        )));
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "''");
    if value.contains('\\') {
        Ok(format!("E'{}'", escaped))
    } else {
        Ok(format!("'{}'", escaped))
    }
}

/// One part of a possibly-qualified name, before validation.
#[derive(Debug, PartialEq)]
struct NamePart {
    text: String,
    quoted: bool,
}

/// Split `input` on dots that are outside double quotes.
fn split_parts(input: &str) -> Result<Vec<NamePart>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut closed = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                    closed = true;
                }
            } else {
                current.push(c);
            }
            continue;
        }

        match c {
            '.' => {
                parts.push(NamePart {
                    text: std::mem::take(&mut current),
                    quoted,
                });
                quoted = false;
                closed = false;
            }
            '"' => {
                if !current.is_empty() || closed {
                    return Err(HdbError::Config(format!(
                        "Misplaced double quote in name: {}",
                        input
                    )));
                }
                in_quotes = true;
                quoted = true;
            }
            _ => {
                if closed {
                    return Err(HdbError::Config(format!(
                        "Unexpected characters after closing quote in name: {}",
                        input
                    )));
                }
                current.push(c);
            }
        }
    }

    if in_quotes {
        return Err(HdbError::Config(format!("Unterminated quote in name: {}", input)));
    }

    parts.push(NamePart {
        text: current,
        quoted,
    });
    Ok(parts)
}

fn finish_part(part: NamePart, input: &str) -> Result<String> {
    let text = if part.quoted {
        part.text
    } else {
        part.text.trim().to_string()
    };
    if text.is_empty() {
        return Err(HdbError::Config(format!("Empty name component in: {}", input)));
    }
    validate_identifier(&text)?;
    Ok(text)
}

/// Parse a single (schema) name. A name containing a dot must be quoted.
pub fn parse_identifier(input: &str) -> Result<String> {
    let mut parts = split_parts(input.trim())?;
    if parts.len() != 1 {
        return Err(HdbError::Config(format!(
            "The name '{}' is not valid. Make sure you use double quotes if your name contains dots",
            input
        )));
    }
    finish_part(parts.remove(0), input)
}

/// Parse a `schema.table` name into its unquoted components.
pub fn parse_qualified_name(input: &str) -> Result<(String, String)> {
    let parts: [NamePart; 2] = match split_parts(input.trim())?.try_into() {
        Ok(parts) => parts,
        Err(parts) if parts.len() == 1 => {
            return Err(HdbError::Config(format!(
                "Table '{}' must be schema-qualified (schema.table)",
                input
            )))
        }
        Err(_) => {
            return Err(HdbError::Config(format!(
                "The table name '{}' is not valid. Names containing dots must be enclosed in double quotes",
                input
            )))
        }
    };
    let [schema, table] = parts;
    Ok((finish_part(schema, input)?, finish_part(table, input)?))
}

/// Split a comma-separated option value, ignoring commas inside double quotes.
pub fn split_list(input: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                let item = current.trim();
                if !item.is_empty() {
                    items.push(item.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let item = current.trim();
    if !item.is_empty() {
        items.push(item.to_string());
    }
    items
}
