//! HAWQ/PostgreSQL implementation of [`Database`] over deadpool-postgres.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::tls::SslMode;
use super::{lock_statement, Connector, Database, LockSession, NoLocks};
use crate::config::ConnectionConfig;
use crate::core::TableRef;
use crate::error::{HdbError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection pool bound to one database.
pub struct PgDatabase {
    pool: Pool,
    database: String,
}

impl PgDatabase {
    /// Build the pool and prove the database is reachable.
    pub async fn connect(
        config: &ConnectionConfig,
        database: &str,
        max_sessions: usize,
    ) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(database);
        pg_config.user(&config.user);
        if let Some(ref password) = config.password {
            pg_config.password(password);
        }
        pg_config.application_name("hawq-backup");
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(CONNECT_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let max_sessions = max_sessions.max(1);
        let pool = match SslMode::parse(&config.ssl_mode)?.connector()? {
            None => {
                warn!("TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_sessions)
                    .build()
                    .map_err(|e| HdbError::pool(e, "creating connection pool"))?
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_sessions)
                    .build()
                    .map_err(|e| HdbError::pool(e, "creating connection pool"))?
            }
        };

        let client = pool
            .get()
            .await
            .map_err(|e| HdbError::connectivity(database, e))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| HdbError::connectivity(database, e))?;

        info!(
            "Connected to {}:{}/{} as {}",
            config.host, config.port, database, config.user
        );

        Ok(Self {
            pool,
            database: database.to_string(),
        })
    }

    async fn session(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| HdbError::pool(e, context.to_string()))
    }
}

#[async_trait]
impl Database for PgDatabase {
    fn name(&self) -> &str {
        &self.database
    }

    async fn ping(&self) -> Result<()> {
        let client = self.session("ping").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn query_tables(&self, sql: &str) -> Result<Vec<TableRef>> {
        let client = self.session("listing tables").await?;
        debug!("{}", sql);
        let rows = client.query(sql, &[]).await?;
        rows.iter()
            .map(|row| TableRef::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect()
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        let client = self.session("checking schema").await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)",
                &[&schema],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let client = self.session("executing statement").await?;
        debug!("{}", sql);
        Ok(client.execute(sql, &[]).await?)
    }

    async fn run_in_transaction(&self, statements: &[String]) -> Result<u64> {
        let mut client = self.session("running transaction").await?;
        let tx = client.transaction().await?;
        let mut rows = 0;
        for statement in statements {
            debug!("{}", statement);
            rows = tx.execute(statement.as_str(), &[]).await?;
        }
        tx.commit().await?;
        Ok(rows)
    }

    async fn lock_tables(&self, tables: &[TableRef]) -> Result<Box<dyn LockSession>> {
        if tables.is_empty() {
            return Ok(Box::new(NoLocks));
        }
        let sql = lock_statement(tables)?;
        let client = self.session("acquiring table locks").await?;
        client.batch_execute("BEGIN").await?;
        debug!("{}", sql);
        if let Err(e) = client.batch_execute(&sql).await {
            let _ = Object::take(client);
            return Err(e.into());
        }
        info!("Locked {} table(s) in ACCESS SHARE mode", tables.len());
        Ok(Box::new(PgLockSession {
            client: Some(client),
        }))
    }
}

/// Pooled session with an open transaction holding the locks.
struct PgLockSession {
    client: Option<Object>,
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn release(mut self: Box<Self>) -> Result<()> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.batch_execute("COMMIT").await {
                let _ = Object::take(client);
                return Err(e.into());
            }
            debug!("Released table locks");
        }
        Ok(())
    }
}

impl Drop for PgLockSession {
    fn drop(&mut self) {
        // Detach from the pool; closing the connection ends the transaction.
        if let Some(client) = self.client.take() {
            let _ = Object::take(client);
        }
    }
}

/// Opens [`PgDatabase`] pools from the shared connection settings.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: ConnectionConfig,
}

impl PgConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, database: &str, max_sessions: usize) -> Result<Arc<dyn Database>> {
        let db = PgDatabase::connect(&self.config, database, max_sessions).await?;
        Ok(Arc::new(db))
    }
}
