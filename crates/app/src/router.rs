use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use billing_accounts_core::types::CreateAccountRequest;
use billing_accounts_storage::Database;

use crate::problem::ProblemResponse;
use crate::service::{BillingAccountService, CreationResult};
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    service: BillingAccountService,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database) -> Self {
        let clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> = Arc::new(Utc::now);
        let service = BillingAccountService::new(storage.clone(), clock);
        Self {
            metrics,
            storage,
            service,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.service = BillingAccountService::new(self.storage.clone(), clock);
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn service(&self) -> &BillingAccountService {
        &self.service
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/v1/billing-accounts", post(create_account))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

/// Response body for the creation endpoint.
#[derive(Debug, Serialize)]
struct AccountResponse {
    account_id: String,
    owner_reference: String,
    status: &'static str,
    created: bool,
    created_at: DateTime<Utc>,
}

impl From<CreationResult> for AccountResponse {
    fn from(result: CreationResult) -> Self {
        Self {
            account_id: result.account.account_id,
            owner_reference: result.account.owner_reference,
            status: result.account.status.as_str(),
            created: result.created,
            created_at: result.account.created_at,
        }
    }
}

async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Response {
    let started = Instant::now();
    let result = state.service().create_billing_account(&request).await;
    histogram!("account_create_latency_seconds").record(started.elapsed().as_secs_f64());

    match result {
        Ok(outcome) => {
            let label = if outcome.created {
                "created"
            } else {
                "already_existed"
            };
            counter!("account_create_requests_total", "result" => label).increment(1);

            let status = if outcome.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(AccountResponse::from(outcome))).into_response()
        }
        Err(err) => {
            counter!("account_create_requests_total", "result" => err.kind()).increment(1);
            ProblemResponse::from_service_error(&err).into_response()
        }
    }
}
