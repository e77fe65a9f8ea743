use std::cmp::Ordering;
use std::ops::Deref;

use anyhow::{anyhow, Context};
use sqlx::migrate::{Migrate, MigrateDatabase, Migrator};
use sqlx::pool::PoolOptions;
use sqlx::{Executor, Pool, Postgres, Transaction};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::DatabaseConfig;
use crate::error::{ErrorKind, ServiceError};

pub mod methods;
pub mod types;

// Statically link in migration files
static MIGRATOR: Migrator = sqlx::migrate!("schemas/database");

/// Hard cap applied to every list query.
pub const MAX_PAGE_SIZE: i64 = 100;

/// Clamps a caller-supplied page size to the allowed range.
#[must_use]
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

pub struct Database {
    pub pool: Pool<Postgres>,
}

impl Deref for Database {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    #[instrument(skip_all)]
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        info!(url = %&config.database, "Connecting to database");

        // Create database if requested and does not exist
        if config.migrate && !Postgres::database_exists(config.database.expose()).await? {
            warn!(url = %&config.database, "Database does not exist, creating database");
            Postgres::create_database(config.database.expose()).await?;
        }

        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.max_connections)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    conn.execute("SET DEFAULT_TRANSACTION_ISOLATION TO 'SERIALIZABLE'")
                        .await?;
                    Ok(())
                })
            })
            .connect(config.database.expose())
            .await
            .context("error connecting to database")?;

        let latest = MIGRATOR
            .migrations
            .last()
            .expect("Missing migrations")
            .version;

        if config.migrate {
            info!(url = %&config.database, "Running migrations");
            MIGRATOR.run(&pool).await?;
        }

        // Validate database schema version
        let mut conn = pool.acquire().await?;

        if conn.dirty_version().await?.is_some() {
            error!(
                url = %&config.database,
                expected = latest,
                "Database is in incomplete migration state.",
            );
            return Err(anyhow!("Database is in incomplete migration state."));
        }

        let version = conn
            .list_applied_migrations()
            .await?
            .last()
            .expect("Missing migrations")
            .version;

        match version.cmp(&latest) {
            Ordering::Less => {
                return Err(anyhow!(
                    "Database is not up to date, try rerunning with database.migrate = true"
                ));
            }
            Ordering::Greater => {
                return Err(anyhow!(
                    "Database version is newer than this version of the software, please update."
                ));
            }
            Ordering::Equal => {
                info!(url = %&config.database, version, latest, "Database version is up to date.");
            }
        }

        drop(conn);

        Ok(Self { pool })
    }

    /// Begins a transaction at the requested isolation level. Queries from
    /// `DbMethods` compose inside it; the caller commits or rolls back.
    pub async fn begin_tx(
        &self,
        isolation_level: IsolationLevel,
    ) -> Result<Transaction<'static, Postgres>, Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(isolation_level.as_sql())
            .execute(&mut *tx)
            .await?;

        Ok(tx)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    /// Classifies the failure into the stable error taxonomy: unique and
    /// exclusion violations are conflicts, other constraint violations are
    /// invalid input, connectivity problems are unavailable, and the rest
    /// is internal.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sqlx(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            Self::Sqlx(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_),
            ) => ErrorKind::Unavailable,
            Self::Sqlx(sqlx::Error::Database(db_err)) => match db_err.code().as_deref() {
                Some("23505" | "23P01") => ErrorKind::Conflict,
                // Serialization failures and deadlocks clear up on retry.
                Some("40001" | "40P01") => ErrorKind::Unavailable,
                Some(code) if code.starts_with("23") => ErrorKind::Invalid,
                _ => ErrorKind::Internal,
            },
            _ => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlx(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some("23505")
        )
    }

    #[must_use]
    pub fn is_serialization_failure(&self) -> bool {
        matches!(
            self,
            Self::Sqlx(sqlx::Error::Database(db_err))
                if matches!(db_err.code().as_deref(), Some("40001" | "40P01"))
        )
    }
}

impl From<Error> for ServiceError {
    fn from(err: Error) -> Self {
        ServiceError::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_limit_bounds() {
        assert_eq!(clamp_limit(None), MAX_PAGE_SIZE);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(1000)), MAX_PAGE_SIZE);
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = Error::Sqlx(sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn pool_timeout_maps_to_unavailable() {
        let err = Error::Sqlx(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(ErrorKind::Unavailable.is_retryable());
    }

    /// A database error carrying a Postgres SQLSTATE, for exercising the
    /// classification without a server.
    #[derive(Debug)]
    struct FakePgError {
        code: &'static str,
    }

    impl std::fmt::Display for FakePgError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "constraint violation ({})", self.code)
        }
    }

    impl std::error::Error for FakePgError {}

    impl sqlx::error::DatabaseError for FakePgError {
        fn message(&self) -> &str {
            "constraint violation"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(std::borrow::Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            match self.code {
                "23505" => sqlx::error::ErrorKind::UniqueViolation,
                "23503" => sqlx::error::ErrorKind::ForeignKeyViolation,
                "23514" => sqlx::error::ErrorKind::CheckViolation,
                _ => sqlx::error::ErrorKind::Other,
            }
        }
    }

    fn pg_error(code: &'static str) -> Error {
        Error::Sqlx(sqlx::Error::Database(Box::new(FakePgError { code })))
    }

    /// A second deposit with an already-recorded chain hash trips the
    /// partial unique index; the classification must surface `conflict`,
    /// which is never retried, so the balance is credited exactly once.
    #[test]
    fn duplicate_deposit_hash_classifies_as_conflict() {
        let err = pg_error("23505");

        assert!(err.is_unique_violation());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn serialization_failures_and_deadlocks_are_retryable() {
        for code in ["40001", "40P01"] {
            let err = pg_error(code);

            assert!(err.is_serialization_failure());
            assert_eq!(err.kind(), ErrorKind::Unavailable);
            assert!(err.kind().is_retryable());
        }
    }

    #[test]
    fn other_constraint_violations_are_invalid_input() {
        // Check constraints (e.g. reserved <= balance) and foreign keys.
        assert_eq!(pg_error("23514").kind(), ErrorKind::Invalid);
        assert_eq!(pg_error("23503").kind(), ErrorKind::Invalid);

        assert_eq!(pg_error("57014").kind(), ErrorKind::Internal);
    }
}
