use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::ledger::expenses::{ExpenseChanges, NewExpense, NewPaymentMode};
use crate::ledger::models::SettlementStatus;

// ========== OUTCOME ENVELOPE ==========

/// Result envelope returned by every endpoint.
///
/// Failures carry human-readable messages and no data.
#[derive(Debug, Serialize)]
pub struct OperationOutcome<T> {
    pub success: bool,
    pub messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> OperationOutcome<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            messages: Vec::new(),
            data: Some(data),
        }
    }

    pub fn failure(messages: Vec<String>) -> Self {
        Self {
            success: false,
            messages,
            data: None,
        }
    }
}

// ========== REQUEST MODELS ==========

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePaymentModeRequest {
    #[validate(length(min = 1, max = 100, message = "must be between 1 and 100 characters"))]
    pub name: String,
    pub requires_settlement: bool,
}

impl From<CreatePaymentModeRequest> for NewPaymentMode {
    fn from(request: CreatePaymentModeRequest) -> Self {
        NewPaymentMode {
            name: request.name,
            requires_settlement: request.requires_settlement,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateExpenseRequest {
    #[validate(length(min = 1, max = 255, message = "must be between 1 and 255 characters"))]
    pub description: String,
    pub payment_date: NaiveDate,
    #[serde(with = "rust_decimal::serde::str")]
    pub payment_amount: Decimal,
    /// Opening reimbursed balance, defaults to zero
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub reimbursed_amount: Option<Decimal>,
    pub payment_mode_id: Uuid,
    pub paid_by_id: Option<Uuid>,
}

impl From<CreateExpenseRequest> for NewExpense {
    fn from(request: CreateExpenseRequest) -> Self {
        NewExpense {
            description: request.description,
            payment_date: request.payment_date,
            payment_amount: request.payment_amount,
            reimbursed_amount: request.reimbursed_amount,
            payment_mode_id: request.payment_mode_id,
            paid_by_id: request.paid_by_id,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateExpenseRequest {
    #[validate(length(min = 1, max = 255, message = "must be between 1 and 255 characters"))]
    pub description: Option<String>,
    pub payment_date: Option<NaiveDate>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub payment_amount: Option<Decimal>,
    pub payment_mode_id: Option<Uuid>,
    pub paid_by_id: Option<Uuid>,
}

impl From<UpdateExpenseRequest> for ExpenseChanges {
    fn from(request: UpdateExpenseRequest) -> Self {
        ExpenseChanges {
            description: request.description,
            payment_date: request.payment_date,
            payment_amount: request.payment_amount,
            payment_mode_id: request.payment_mode_id,
            paid_by_id: request.paid_by_id,
        }
    }
}

/// Request to group expenses into a Draft settlement
#[derive(Debug, Deserialize, Validate)]
pub struct CreateSettlementRequest {
    #[validate(length(min = 1, max = 100, message = "must be between 1 and 100 characters"))]
    pub reference: String,
    pub contact_id: Uuid,
    #[validate(length(min = 1, message = "select at least one expense"))]
    pub expense_ids: Vec<Uuid>,
    #[validate(length(max = 1000, message = "cannot exceed 1000 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CompleteSettlementRequest {
    pub payment_mode_id: Option<Uuid>,
    #[validate(length(max = 100, message = "cannot exceed 100 characters"))]
    pub transaction_reference: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PayerFilter {
    pub payer_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettlementFilter {
    pub status: Option<SettlementStatus>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct EligibleModesResponse {
    pub scope_id: Uuid,
    pub payment_mode_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct PendingTotalResponse {
    pub scope_id: Uuid,
    pub payer_id: Option<Uuid>,
    #[serde(with = "rust_decimal::serde::str")]
    pub pending_total: Decimal,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub storage: String,
    pub timestamp: DateTime<Utc>,
}
