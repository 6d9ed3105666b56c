pub mod types;

pub use types::{AccountStatus, BillingAccount, CreateAccountRequest, RequestValidationError};
