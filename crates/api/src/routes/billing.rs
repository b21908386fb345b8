//! Billing routes for Stripe integration

use axum::{
    body::Bytes,
    extract::{Extension, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;
use wedmatch_billing::{
    BillingService, ChargeSession, HistorySummary, PaymentHistoryEntry, ReconcileRequest,
    ReconcileResponse, WebhookAck,
};
use wedmatch_shared::PlanKind;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

fn billing_service(state: &AppState) -> Result<&BillingService, ApiError> {
    state
        .billing
        .as_deref()
        .ok_or(ApiError::ServiceUnavailable)
}

// ============================================================================
// Webhook
// ============================================================================

/// Handle Stripe webhook events.
///
/// Anything that passes signature verification is acknowledged with 200,
/// including deliveries whose processing failed: the failure is recorded on
/// the event row and the member's own reconcile call still applies the charge.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = billing_service(&state)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = ?e, "Stripe webhook rejected");
        ApiError::from(e)
    })?;

    let event_id = event.id.clone();
    let status = match billing.webhooks.handle_event(event).await {
        Ok(WebhookAck::Processed) => "processed",
        Ok(WebhookAck::Duplicate) => "duplicate",
        Ok(WebhookAck::Ignored) => "ignored",
        Err(e) => {
            tracing::error!(event_id = %event_id, error = %e, "Webhook handling error");
            "error"
        }
    };

    Ok((
        StatusCode::OK,
        Json(json!({ "received": true, "status": status })),
    ))
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Apply a confirmed charge to the caller's entitlement.
///
/// `requestsOverride` is reserved for server-side callers and dropped here.
pub async fn reconcile(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(mut req): Json<ReconcileRequest>,
) -> Result<Json<ReconcileResponse>, ApiError> {
    let billing = billing_service(&state)?;
    auth_user.require_self(req.user_id).map_err(|_| {
        tracing::warn!(
            caller = %auth_user.user_id,
            user_id = %req.user_id,
            "Reconcile requested for another member"
        );
        ApiError::Forbidden
    })?;

    if req.requests_override.take().is_some() {
        tracing::warn!(user_id = %req.user_id, "Ignoring requestsOverride sent by client");
    }

    let outcome = billing.engine.reconcile(&req).await?;
    Ok(Json(ReconcileResponse::from(&outcome)))
}

// ============================================================================
// Charge creation
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChargeRequest {
    pub user_id: Uuid,
    pub plan_name: String,
}

fn authorize_charge(auth_user: &AuthUser, req: &CreateChargeRequest) -> Result<PlanKind, ApiError> {
    auth_user
        .require_self(req.user_id)
        .map_err(|_| ApiError::Forbidden)?;
    PlanKind::lookup(&req.plan_name)
        .ok_or_else(|| ApiError::Validation(format!("Unknown plan: {}", req.plan_name)))
}

/// Create a payment intent for a one-time plan
pub async fn create_payment_intent(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateChargeRequest>,
) -> Result<Json<ChargeSession>, ApiError> {
    let billing = billing_service(&state)?;
    let plan = authorize_charge(&auth_user, &req)?;

    let session = billing.checkout.create_payment_intent(req.user_id, plan).await?;
    Ok(Json(session))
}

/// Create an incomplete subscription for a recurring plan
pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateChargeRequest>,
) -> Result<Json<ChargeSession>, ApiError> {
    let billing = billing_service(&state)?;
    let plan = authorize_charge(&auth_user, &req)?;

    let session = billing.checkout.create_subscription(req.user_id, plan).await?;
    Ok(Json(session))
}

// ============================================================================
// Payment history
// ============================================================================

/// Optional RFC 3339 bounds, e.g. `?start=2026-01-01T00:00:00Z`
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<PaymentHistoryEntry>,
    pub summary: HistorySummary,
}

/// Get the caller's payment history
pub async fn get_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let billing = billing_service(&state)?;
    if let (Some(start), Some(end)) = (query.start, query.end) {
        if start > end {
            return Err(ApiError::Validation("start must not be after end".to_string()));
        }
    }

    let entries = billing
        .history
        .get_history(auth_user.user_id, query.start, query.end)
        .await?;
    let summary = HistorySummary::from_entries(auth_user.user_id, &entries);

    Ok(Json(HistoryResponse { entries, summary }))
}

/// Download the caller's payment history as CSV
pub async fn export_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let billing = billing_service(&state)?;
    let csv = billing
        .history
        .export_history_csv(auth_user.user_id, query.start, query.end)
        .await?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"payment-history.csv\"",
            ),
        ],
        csv,
    ))
}
