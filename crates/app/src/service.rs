use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use billing_accounts_core::types::{BillingAccount, CreateAccountRequest, RequestValidationError};
use billing_accounts_storage::{AccountError, Database, NewBillingAccount};

/// Executes billing account creation against the persistence layer.
///
/// The service is transport-agnostic: the HTTP router calls into it the same
/// way a different RPC adapter would. Each invocation is stateless apart from
/// the database handle, so the service may be cloned freely across workers.
#[derive(Clone)]
pub struct BillingAccountService {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

/// Outcome of a creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationResult {
    pub account: BillingAccount,
    /// `true` when this request persisted the account, `false` when an
    /// ACTIVE account for the owner already existed.
    pub created: bool,
}

impl BillingAccountService {
    pub fn new(database: Database, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        Self { database, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Creates a billing account for the owner named in the request.
    ///
    /// Creation is idempotent on the owner reference: repeating a request
    /// returns the original account with `created = false` and performs no
    /// write. Concurrent requests for the same owner are arbitrated by the
    /// database's unique index; a request that loses the race receives the
    /// winning account rather than an error.
    pub async fn create_billing_account(
        &self,
        request: &CreateAccountRequest,
    ) -> Result<CreationResult, ServiceError> {
        info!(
            stage = "service",
            owner_reference = %request.owner_reference,
            "createBillingAccount request received"
        );

        let owner = request.validated_owner()?;
        let repo = self.database.accounts();

        if let Some(existing) = repo.find_active_by_owner(owner).await? {
            return Ok(CreationResult {
                account: existing,
                created: false,
            });
        }

        let record = NewBillingAccount::active(owner, self.now());
        let (account, created) = repo.insert_if_absent(&record).await?.into_account();

        Ok(CreationResult { account, created })
    }
}

/// Error taxonomy surfaced to callers of the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Caller error; retrying the same request will fail again.
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] RequestValidationError),
    /// The persistence layer could not be reached; retriable by the caller.
    /// No retry happens here, retry policy belongs to the client.
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    /// Unexpected failure; details are logged, not surfaced.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable kind included in every error response.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<AccountError> for ServiceError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::Database(db_err) if is_unreachable(&db_err) => {
                Self::Unavailable(db_err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

fn is_unreachable(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_accounts_core::types::AccountStatus;
    use chrono::TimeZone;

    async fn setup_service() -> BillingAccountService {
        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");
        BillingAccountService::new(database, Arc::new(Utc::now))
    }

    fn request(owner: &str) -> CreateAccountRequest {
        CreateAccountRequest {
            owner_reference: owner.to_string(),
        }
    }

    #[tokio::test]
    async fn fresh_owner_creates_an_active_account() {
        let service = setup_service().await;

        let result = service
            .create_billing_account(&request("patient-42"))
            .await
            .expect("create");

        assert!(result.created);
        assert_eq!(result.account.owner_reference, "patient-42");
        assert_eq!(result.account.status, AccountStatus::Active);
        assert!(!result.account.account_id.is_empty());
    }

    #[tokio::test]
    async fn repeated_owner_returns_the_original_account() {
        let service = setup_service().await;

        let first = service
            .create_billing_account(&request("patient-42"))
            .await
            .expect("first create");
        let second = service
            .create_billing_account(&request("patient-42"))
            .await
            .expect("second create");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.account, first.account);
    }

    #[tokio::test]
    async fn distinct_owners_get_distinct_accounts() {
        let service = setup_service().await;

        let a = service
            .create_billing_account(&request("patient-1"))
            .await
            .expect("create a");
        let b = service
            .create_billing_account(&request("patient-2"))
            .await
            .expect("create b");

        assert!(a.created);
        assert!(b.created);
        assert_ne!(a.account.account_id, b.account.account_id);
    }

    #[tokio::test]
    async fn empty_owner_fails_validation_without_writing() {
        let service = setup_service().await;

        let err = service
            .create_billing_account(&request("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        assert_eq!(err.kind(), "invalid_argument");

        let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM billing_accounts")
            .fetch_one(service.database.pool())
            .await
            .expect("count rows");
        assert_eq!(rows.0, 0);
    }

    #[tokio::test]
    async fn closed_pool_surfaces_as_unavailable() {
        let service = setup_service().await;
        service.database.pool().close().await;

        let err = service
            .create_billing_account(&request("patient-42"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
        assert_eq!(err.kind(), "unavailable");
    }

    #[tokio::test]
    async fn created_at_comes_from_the_injected_clock() {
        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");
        let fixed = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let service = BillingAccountService::new(database, Arc::new(move || fixed));

        let result = service
            .create_billing_account(&request("patient-42"))
            .await
            .expect("create");
        assert_eq!(result.account.created_at, fixed);
    }

    #[tokio::test]
    async fn concurrent_creations_converge_on_one_account() {
        let service = setup_service().await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.create_billing_account(&request("patient-42")).await
            }));
        }

        let mut account_ids = Vec::new();
        let mut created_count = 0;
        for handle in handles {
            let result = handle.await.expect("task").expect("create");
            if result.created {
                created_count += 1;
            }
            account_ids.push(result.account.account_id);
        }

        assert_eq!(created_count, 1, "exactly one request should persist");
        account_ids.sort();
        account_ids.dedup();
        assert_eq!(account_ids.len(), 1, "all responses name the same account");

        let rows: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM billing_accounts WHERE owner_reference = 'patient-42' AND status = 'ACTIVE'",
        )
        .fetch_one(service.database.pool())
        .await
        .expect("count rows");
        assert_eq!(rows.0, 1);
    }
}
