use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    Json,
};
use chrono::Utc;
use sqlx::PgPool;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    error::AppResult,
    identity::{ActorProvider, StaticActor},
    ledger::{
        expenses::ExpenseService,
        models::{Expense, PayerPendingSummary, PaymentMode, Settlement, SettlementDetail},
    },
    middleware::ValidatedJson,
    reconciliation::ReconciliationEngine,
};

/// Header naming the user performing the request
pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: ReconciliationEngine,
    pub expenses: ExpenseService,
    pub default_actor: String,
    /// Present when running against PostgreSQL
    pub pool: Option<PgPool>,
}

/// Acting user for the request, from `x-actor-id` or the configured default
pub struct RequestActor(pub Arc<dyn ActorProvider>);

#[async_trait]
impl FromRequestParts<AppState> for RequestActor {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| state.default_actor.clone());

        Ok(RequestActor(Arc::new(StaticActor::new(actor))))
    }
}

type Outcome<T> = AppResult<Json<OperationOutcome<T>>>;

fn ok<T>(data: T) -> Outcome<T> {
    Ok(Json(OperationOutcome::success(data)))
}

// ========== PENDING REIMBURSEMENTS ==========

/// GET /scopes/:scope_id/payment-modes/eligible
pub async fn get_eligible_payment_modes(
    State(state): State<AppState>,
    Path(scope_id): Path<Uuid>,
) -> Outcome<EligibleModesResponse> {
    let mut payment_mode_ids: Vec<Uuid> = state
        .engine
        .eligible_payment_modes(scope_id)
        .await?
        .into_iter()
        .collect();
    payment_mode_ids.sort();

    ok(EligibleModesResponse {
        scope_id,
        payment_mode_ids,
    })
}

/// GET /scopes/:scope_id/expenses/unsettled?payer_id=
pub async fn list_unsettled_expenses(
    State(state): State<AppState>,
    Path(scope_id): Path<Uuid>,
    Query(filter): Query<PayerFilter>,
) -> Outcome<Vec<Expense>> {
    let expenses = state
        .engine
        .list_unsettled_expenses(scope_id, filter.payer_id)
        .await?;
    ok(expenses)
}

/// GET /scopes/:scope_id/expenses/pending-total?payer_id=
pub async fn get_pending_total(
    State(state): State<AppState>,
    Path(scope_id): Path<Uuid>,
    Query(filter): Query<PayerFilter>,
) -> Outcome<PendingTotalResponse> {
    let pending_total = state
        .engine
        .compute_pending_total(scope_id, filter.payer_id)
        .await?;

    ok(PendingTotalResponse {
        scope_id,
        payer_id: filter.payer_id,
        pending_total,
    })
}

/// GET /scopes/:scope_id/expenses/pending-by-payer
pub async fn get_pending_by_payer(
    State(state): State<AppState>,
    Path(scope_id): Path<Uuid>,
) -> Outcome<Vec<PayerPendingSummary>> {
    ok(state.engine.pending_by_payer(scope_id).await?)
}

// ========== PAYMENT MODES & EXPENSES ==========

/// POST /scopes/:scope_id/payment-modes
pub async fn create_payment_mode(
    State(state): State<AppState>,
    Path(scope_id): Path<Uuid>,
    RequestActor(actor): RequestActor,
    ValidatedJson(request): ValidatedJson<CreatePaymentModeRequest>,
) -> AppResult<(StatusCode, Json<OperationOutcome<PaymentMode>>)> {
    let mode = state
        .expenses
        .with_actor(actor)
        .create_payment_mode(scope_id, request.into())
        .await?;
    Ok((StatusCode::CREATED, Json(OperationOutcome::success(mode))))
}

/// POST /scopes/:scope_id/expenses
pub async fn create_expense(
    State(state): State<AppState>,
    Path(scope_id): Path<Uuid>,
    RequestActor(actor): RequestActor,
    ValidatedJson(request): ValidatedJson<CreateExpenseRequest>,
) -> AppResult<(StatusCode, Json<OperationOutcome<Expense>>)> {
    let expense = state
        .expenses
        .with_actor(actor)
        .create_expense(scope_id, request.into())
        .await?;
    Ok((StatusCode::CREATED, Json(OperationOutcome::success(expense))))
}

/// PUT /expenses/:id
pub async fn update_expense(
    State(state): State<AppState>,
    Path(expense_id): Path<Uuid>,
    RequestActor(actor): RequestActor,
    ValidatedJson(request): ValidatedJson<UpdateExpenseRequest>,
) -> Outcome<Expense> {
    let expense = state
        .expenses
        .with_actor(actor)
        .update_expense(expense_id, request.into())
        .await?;
    ok(expense)
}

// ========== SETTLEMENTS ==========

/// GET /scopes/:scope_id/settlements?status=
pub async fn list_settlements(
    State(state): State<AppState>,
    Path(scope_id): Path<Uuid>,
    Query(filter): Query<SettlementFilter>,
) -> Outcome<Vec<Settlement>> {
    ok(state.engine.list_settlements(scope_id, filter.status).await?)
}

/// POST /scopes/:scope_id/settlements
pub async fn create_settlement(
    State(state): State<AppState>,
    Path(scope_id): Path<Uuid>,
    RequestActor(actor): RequestActor,
    ValidatedJson(request): ValidatedJson<CreateSettlementRequest>,
) -> AppResult<(StatusCode, Json<OperationOutcome<SettlementDetail>>)> {
    info!(
        "Creating settlement '{}' in scope {} for {} expenses",
        request.reference,
        scope_id,
        request.expense_ids.len()
    );

    let detail = state
        .engine
        .with_actor(actor)
        .create_settlement(
            scope_id,
            &request.reference,
            request.contact_id,
            &request.expense_ids,
            request.notes,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(OperationOutcome::success(detail))))
}

/// GET /settlements/:id
pub async fn get_settlement(
    State(state): State<AppState>,
    Path(settlement_id): Path<Uuid>,
) -> Outcome<SettlementDetail> {
    ok(state.engine.get_settlement(settlement_id).await?)
}

/// POST /settlements/:id/complete
pub async fn complete_settlement(
    State(state): State<AppState>,
    Path(settlement_id): Path<Uuid>,
    RequestActor(actor): RequestActor,
    ValidatedJson(request): ValidatedJson<CompleteSettlementRequest>,
) -> Outcome<Settlement> {
    let settlement = state
        .engine
        .with_actor(actor)
        .complete_settlement(
            settlement_id,
            request.payment_mode_id,
            request.transaction_reference,
        )
        .await?;
    ok(settlement)
}

/// POST /settlements/:id/cancel
pub async fn cancel_settlement(
    State(state): State<AppState>,
    Path(settlement_id): Path<Uuid>,
    RequestActor(actor): RequestActor,
) -> Outcome<SettlementDetail> {
    let engine = state.engine.with_actor(actor);
    engine.cancel_settlement(settlement_id).await?;
    ok(engine.get_settlement(settlement_id).await?)
}

/// DELETE /settlements/:id
pub async fn delete_settlement(
    State(state): State<AppState>,
    Path(settlement_id): Path<Uuid>,
    RequestActor(actor): RequestActor,
) -> Outcome<Uuid> {
    state
        .engine
        .with_actor(actor)
        .delete_settlement(settlement_id)
        .await?;
    ok(settlement_id)
}

/// GET /health - Health check
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (storage, healthy) = match &state.pool {
        Some(pool) => {
            let reachable = sqlx::query("SELECT 1").execute(pool).await.is_ok();
            if !reachable {
                warn!("Health check: database unreachable");
            }
            ("postgres", reachable)
        }
        None => ("memory", true),
    };

    Json(HealthResponse {
        status: if healthy {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        storage: storage.to_string(),
        timestamp: Utc::now(),
    })
}
