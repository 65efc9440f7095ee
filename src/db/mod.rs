//! Database connection pool, migrations, transactions, and health check.
//!
//! Every operation acquires a pooled connection for exactly one statement
//! or one transaction, and the pool takes it back on every exit path.

pub mod tasks;

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

/// Boxed future borrowed from a transaction's connection.
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

/// Database handle. Owns the connection pool shared by all adapters.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, 10).await
    }

    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Run `body` inside one transaction.
    ///
    /// Commits if the body returns `Ok`, rolls back otherwise (the
    /// transaction rolls back when dropped uncommitted). The body gets the
    /// open connection, so anything it calls joins the same transaction;
    /// nested scopes collapse into this one.
    pub async fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> TxFuture<'c, T> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let value = body(&mut *tx).await?;
        tx.commit().await?;
        Ok(value)
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
