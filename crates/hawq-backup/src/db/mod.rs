//! Database access used by the coordinators.
//!
//! The coordinators never touch the driver directly. They see a [`Database`]
//! bound to one database name, obtained from a [`Connector`], so tests can
//! run every state machine against an in-memory fake.

pub mod postgres;
pub mod tls;

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::TableRef;
use crate::error::Result;

pub use postgres::{PgConnector, PgDatabase};

/// Query capability over one database.
#[async_trait]
pub trait Database: Send + Sync {
    /// Name of the connected database.
    fn name(&self) -> &str;

    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()>;

    /// Run a query returning `(schema, relation)` rows.
    async fn query_tables(&self, sql: &str) -> Result<Vec<TableRef>>;

    /// Whether a namespace with this exact name exists.
    async fn schema_exists(&self, schema: &str) -> Result<bool>;

    /// Run one statement in autocommit mode, returning the affected row count.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run statements in order inside one transaction. Nothing is committed
    /// unless every statement succeeds. Returns the last statement's row count.
    async fn run_in_transaction(&self, statements: &[String]) -> Result<u64>;

    /// Take `ACCESS SHARE` locks on every table in a single statement, on a
    /// session of its own that keeps them until [`LockSession::release`].
    async fn lock_tables(&self, tables: &[TableRef]) -> Result<Box<dyn LockSession>>;
}

/// A session holding table locks. Dropping it without `release` abandons
/// the session, which also ends the locking transaction.
#[async_trait]
pub trait LockSession: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Opens [`Database`] handles by name.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `database` with room for `max_sessions` concurrent sessions.
    async fn connect(&self, database: &str, max_sessions: usize) -> Result<Arc<dyn Database>>;
}

/// Lock session for an empty table set.
pub struct NoLocks;

#[async_trait]
impl LockSession for NoLocks {
    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// `LOCK TABLE a, b, ... IN ACCESS SHARE MODE`.
pub fn lock_statement(tables: &[TableRef]) -> Result<String> {
    let names = tables
        .iter()
        .map(|t| t.quoted())
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("LOCK TABLE {} IN ACCESS SHARE MODE", names.join(", ")))
}
