use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        cancel_settlement, complete_settlement, create_expense, create_payment_mode,
        create_settlement, delete_settlement, get_eligible_payment_modes, get_pending_by_payer,
        get_pending_total, get_settlement, health_check, list_settlements,
        list_unsettled_expenses, update_expense, AppState,
    },
    middleware::create_cors_layer,
};

pub fn create_app(state: AppState, cors_origins: &[String]) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Pending reimbursements
                .route(
                    "/scopes/:scope_id/payment-modes/eligible",
                    get(get_eligible_payment_modes),
                )
                .route(
                    "/scopes/:scope_id/expenses/unsettled",
                    get(list_unsettled_expenses),
                )
                .route(
                    "/scopes/:scope_id/expenses/pending-total",
                    get(get_pending_total),
                )
                .route(
                    "/scopes/:scope_id/expenses/pending-by-payer",
                    get(get_pending_by_payer),
                )
                // Payment modes and expenses
                .route("/scopes/:scope_id/payment-modes", post(create_payment_mode))
                .route("/scopes/:scope_id/expenses", post(create_expense))
                .route("/expenses/:id", put(update_expense))
                // Settlements
                .route(
                    "/scopes/:scope_id/settlements",
                    get(list_settlements).post(create_settlement),
                )
                .route(
                    "/settlements/:id",
                    get(get_settlement).delete(delete_settlement),
                )
                .route("/settlements/:id/complete", post(complete_settlement))
                .route("/settlements/:id/cancel", post(cancel_settlement)),
        )
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::{ActorProvider, StaticActor},
        ledger::{expenses::ExpenseService, InMemorySettlementStore, SettlementStore},
        reconciliation::{ReconciliationConfig, ReconciliationEngine},
    };
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn test_app() -> Router {
        let store: Arc<dyn SettlementStore> = Arc::new(InMemorySettlementStore::new());
        let actor: Arc<dyn ActorProvider> = Arc::new(StaticActor::new("system"));
        let state = AppState {
            engine: ReconciliationEngine::new(
                ReconciliationConfig::default(),
                store.clone(),
                actor.clone(),
            ),
            expenses: ExpenseService::new(store, actor),
            default_actor: "system".to_string(),
            pool: None,
        };
        create_app(state, &[])
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-actor-id", "clerk-7");
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_settlement_round_trip_over_http() {
        let app = test_app();
        let scope = Uuid::new_v4();

        let (status, mode) = send(
            &app,
            "POST",
            &format!("/api/v1/scopes/{scope}/payment-modes"),
            Some(json!({ "name": "Personal card", "requires_settlement": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let mode_id = mode["data"]["id"].as_str().unwrap().to_string();

        let (status, expense) = send(
            &app,
            "POST",
            &format!("/api/v1/scopes/{scope}/expenses"),
            Some(json!({
                "description": "Taxi fare",
                "payment_date": "2024-06-01",
                "payment_amount": "100.00",
                "payment_mode_id": mode_id,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(expense["data"]["reimbursement_status"], "pending");
        assert_eq!(expense["data"]["created_by"], "clerk-7");
        let expense_id = expense["data"]["id"].as_str().unwrap().to_string();

        let (_, total) = send(
            &app,
            "GET",
            &format!("/api/v1/scopes/{scope}/expenses/pending-total"),
            None,
        )
        .await;
        assert_eq!(total["data"]["pending_total"], "100.00");

        let (status, draft) = send(
            &app,
            "POST",
            &format!("/api/v1/scopes/{scope}/settlements"),
            Some(json!({
                "reference": "S-1",
                "contact_id": Uuid::new_v4(),
                "expense_ids": [expense_id],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(draft["data"]["settlement"]["status"], "draft");
        let settlement_id = draft["data"]["settlement"]["id"].as_str().unwrap().to_string();

        let (status, completed) = send(
            &app,
            "POST",
            &format!("/api/v1/settlements/{settlement_id}/complete"),
            Some(json!({ "transaction_reference": "TX-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(completed["success"], true);
        assert_eq!(completed["data"]["status"], "completed");

        let (status, again) = send(
            &app,
            "POST",
            &format!("/api/v1/settlements/{settlement_id}/complete"),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(again["success"], false);
        assert_eq!(
            again["messages"][0],
            "Settlement is Completed; only Draft settlements can be completed."
        );

        let (status, rejected) = send(
            &app,
            "POST",
            &format!("/api/v1/scopes/{scope}/settlements"),
            Some(json!({
                "reference": "S-3",
                "contact_id": Uuid::new_v4(),
                "expense_ids": [expense_id],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(rejected["messages"][0], "Expense 'Taxi fare' is already settled.");
    }

    #[tokio::test]
    async fn test_invalid_body_and_unknown_settlement() {
        let app = test_app();
        let scope = Uuid::new_v4();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/scopes/{scope}/settlements"),
            Some(json!({ "reference": "", "contact_id": Uuid::new_v4(), "expense_ids": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/v1/settlements/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, health) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["storage"], "memory");
    }
}
