use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A billing account record as persisted and returned to callers.
///
/// The account anchors the billing relationship for an external owner
/// (patient, customer, ...). Identity and creation timestamp are immutable
/// once the record exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAccount {
    pub account_id: String,
    pub owner_reference: String,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status persisted in the database.
///
/// Accounts start ACTIVE. The CLOSED state exists in the model so the
/// uniqueness rule can be scoped to active accounts, but no operation in
/// this service performs the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Closed,
}

impl AccountStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
        }
    }

    /// Parses the database representation back into the enum.
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Incoming creation request as decoded from the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    // Absent and empty are equivalent: both fail validation, not decoding.
    #[serde(default)]
    pub owner_reference: String,
}

impl CreateAccountRequest {
    /// Validates the request and returns the normalized owner reference.
    ///
    /// The owner reference is required and must contain at least one
    /// non-whitespace character. Surrounding whitespace is stripped so that
    /// `" patient-42 "` and `"patient-42"` address the same account.
    pub fn validated_owner(&self) -> Result<&str, RequestValidationError> {
        let trimmed = self.owner_reference.trim();
        if trimmed.is_empty() {
            return Err(RequestValidationError::MissingOwnerReference);
        }
        Ok(trimmed)
    }
}

/// Validation failures for creation requests.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestValidationError {
    #[error("owner_reference is required and must be non-empty")]
    MissingOwnerReference,
}
