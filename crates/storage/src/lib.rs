use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use billing_accounts_core::types::{AccountStatus, BillingAccount};

/// SQLite error code raised when a unique index rejects an insert.
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to operate on billing accounts.
    pub fn accounts(&self) -> AccountRepository {
        AccountRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for billing account records.
#[derive(Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    /// Fetches the ACTIVE account for the given owner, when one exists.
    pub async fn find_active_by_owner(
        &self,
        owner_reference: &str,
    ) -> Result<Option<BillingAccount>, AccountError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, owner_reference, status, created_at \
             FROM billing_accounts \
             WHERE owner_reference = ? AND status = 'ACTIVE'",
        )
        .bind(owner_reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccountRow::into_domain).transpose()
    }

    /// Inserts a new account unless an ACTIVE one already exists for the owner.
    ///
    /// The partial unique index on `(owner_reference) WHERE status = 'ACTIVE'`
    /// arbitrates concurrent inserts. A loser of that race reads the winning
    /// row back and reports it as [`AccountInsertOutcome::Existing`], so the
    /// caller never observes a constraint error for a duplicate creation.
    pub async fn insert_if_absent(
        &self,
        account: &NewBillingAccount<'_>,
    ) -> Result<AccountInsertOutcome, AccountError> {
        let result = sqlx::query(
            "INSERT INTO billing_accounts (id, owner_reference, status, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(account.owner_reference)
        .bind(account.status.as_str())
        .bind(to_rfc3339(account.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(AccountInsertOutcome::Inserted(BillingAccount {
                account_id: account.id.clone(),
                owner_reference: account.owner_reference.to_string(),
                status: account.status,
                created_at: account.created_at,
            })),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(SQLITE_CONSTRAINT_UNIQUE) =>
            {
                let winner = self
                    .find_active_by_owner(account.owner_reference)
                    .await?
                    .ok_or(AccountError::ConflictReadback)?;
                Ok(AccountInsertOutcome::Existing(winner))
            }
            Err(err) => Err(AccountError::Database(err)),
        }
    }
}

/// Result of attempting to insert a billing account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountInsertOutcome {
    Inserted(BillingAccount),
    Existing(BillingAccount),
}

impl AccountInsertOutcome {
    /// Returns the persisted account regardless of which side won the race.
    pub fn into_account(self) -> (BillingAccount, bool) {
        match self {
            Self::Inserted(account) => (account, true),
            Self::Existing(account) => (account, false),
        }
    }
}

/// Errors that can occur while reading or writing billing accounts.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("unknown account status in database: {0}")]
    UnknownStatus(String),
    #[error("unique index reported a conflict but no active account was found")]
    ConflictReadback,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Data required to create a new billing account row.
#[derive(Clone)]
pub struct NewBillingAccount<'a> {
    pub id: String,
    pub owner_reference: &'a str,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

impl<'a> NewBillingAccount<'a> {
    /// Builds an ACTIVE account with a freshly generated identifier.
    ///
    /// The timestamp is truncated to milliseconds up front so the value
    /// echoed on the creation path is identical to what every later read
    /// decodes from the stored RFC 3339 text.
    pub fn active(owner_reference: &'a str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_reference,
            status: AccountStatus::Active,
            created_at: created_at.trunc_subsecs(3),
        }
    }
}

/// Raw billing account row as stored in SQLite.
#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: String,
    owner_reference: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl AccountRow {
    fn into_domain(self) -> Result<BillingAccount, AccountError> {
        let status = AccountStatus::from_db(&self.status)
            .ok_or_else(|| AccountError::UnknownStatus(self.status.clone()))?;
        Ok(BillingAccount {
            account_id: self.id,
            owner_reference: self.owner_reference,
            status,
            created_at: self.created_at,
        })
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
