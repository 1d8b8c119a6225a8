//! Administrative access to the tenant database server.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::MySqlPool;

use super::CapabilityError;

/// Trait for administrative SQL against the hosting MySQL server.
///
/// `params` bind into `?` placeholders. Identifier positions (database and
/// user names) cannot be bound in SQL; callers splice them only after
/// request validation has restricted them to `[A-Za-z0-9_]`.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Executes one administrative statement.
    async fn execute(&self, sql: &str, params: &[&str]) -> Result<(), CapabilityError>;
}

/// MySQL-backed database admin using a lazy connection pool.
#[derive(Clone)]
pub struct MySqlDatabaseAdmin {
    pool: MySqlPool,
}

impl MySqlDatabaseAdmin {
    /// Creates an admin around an existing pool.
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Creates an admin with a lazily-connected pool.
    pub fn connect_lazy(url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self {
            pool: MySqlPool::connect_lazy(url)?,
        })
    }
}

#[async_trait]
impl DatabaseAdmin for MySqlDatabaseAdmin {
    async fn execute(&self, sql: &str, params: &[&str]) -> Result<(), CapabilityError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(*param);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryDatabaseState {
    statements: Vec<(String, Vec<String>)>,
    failures_remaining: u32,
}

/// In-memory database admin for testing.
///
/// Records every statement with its bound parameters and can be scripted
/// to fail the next N calls with a transient pool error.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabaseAdmin {
    state: Arc<RwLock<InMemoryDatabaseState>>,
}

impl InMemoryDatabaseAdmin {
    /// Creates a new in-memory database admin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` statements fail with a transient error.
    pub fn fail_times(&self, n: u32) {
        self.state.write().unwrap().failures_remaining = n;
    }

    /// Returns every executed statement with its parameters.
    pub fn statements(&self) -> Vec<(String, Vec<String>)> {
        self.state.read().unwrap().statements.clone()
    }

    /// Returns true if a statement starting with the prefix was executed.
    pub fn executed(&self, prefix: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .statements
            .iter()
            .any(|(sql, _)| sql.starts_with(prefix))
    }

    /// Returns the number of executed statements.
    pub fn statement_count(&self) -> usize {
        self.state.read().unwrap().statements.len()
    }
}

#[async_trait]
impl DatabaseAdmin for InMemoryDatabaseAdmin {
    async fn execute(&self, sql: &str, params: &[&str]) -> Result<(), CapabilityError> {
        let mut state = self.state.write().unwrap();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(CapabilityError::Database(sqlx::Error::PoolTimedOut));
        }
        state.statements.push((
            sql.to_string(),
            params.iter().map(|p| p.to_string()).collect(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_statements_and_params() {
        let db = InMemoryDatabaseAdmin::new();
        db.execute(
            "CREATE USER IF NOT EXISTS ?@'localhost' IDENTIFIED BY ?",
            &["wp_user", "hunter2"],
        )
        .await
        .unwrap();

        let statements = db.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].1, vec!["wp_user", "hunter2"]);
        assert!(db.executed("CREATE USER"));
    }

    #[tokio::test]
    async fn scripted_failures_are_transient_and_consumed() {
        let db = InMemoryDatabaseAdmin::new();
        db.fail_times(1);

        let err = db.execute("FLUSH PRIVILEGES", &[]).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Database(_)));

        db.execute("FLUSH PRIVILEGES", &[]).await.unwrap();
        assert_eq!(db.statement_count(), 1);
    }
}
