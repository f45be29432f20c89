use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::error::SettlementError;

/// Reimbursement state of a single expense
///
/// INVARIANT (amounts drive the state):
/// - Settled      <=> reimbursed == payment
/// - Partial      <=> 0 < reimbursed < payment
/// - Pending      <=> reimbursed == 0 and the payment mode requires settlement
/// - NotApplicable when the payment mode does not require settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "reimbursement_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReimbursementStatus {
    NotApplicable,
    Pending,
    Partial,
    Settled,
}

impl fmt::Display for ReimbursementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ReimbursementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReimbursementStatus::NotApplicable => "not_applicable",
            ReimbursementStatus::Pending => "pending",
            ReimbursementStatus::Partial => "partial",
            ReimbursementStatus::Settled => "settled",
        }
    }

    /// Status implied by the amounts and the payment mode's settlement flag
    pub fn derive(payment_amount: Decimal, reimbursed_amount: Decimal, eligible: bool) -> Self {
        if reimbursed_amount.is_zero() {
            if eligible {
                ReimbursementStatus::Pending
            } else {
                ReimbursementStatus::NotApplicable
            }
        } else if reimbursed_amount >= payment_amount {
            ReimbursementStatus::Settled
        } else {
            ReimbursementStatus::Partial
        }
    }
}

/// Settlement batch lifecycle: Draft -> Completed | Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "settlement_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Draft,
    Completed,
    Cancelled,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SettlementStatus::Draft => "Draft",
            SettlementStatus::Completed => "Completed",
            SettlementStatus::Cancelled => "Cancelled",
        };
        write!(f, "{}", label)
    }
}

impl SettlementStatus {
    /// Validate settlement state machine transitions
    /// Valid transitions:
    /// - Draft → Completed, Cancelled
    /// - Terminal states (Completed, Cancelled) → NO TRANSITIONS ALLOWED
    pub fn validate_transition(self, to: SettlementStatus) -> Result<(), SettlementError> {
        let action = match to {
            SettlementStatus::Completed => "completed",
            SettlementStatus::Cancelled => "cancelled",
            SettlementStatus::Draft => "reopened",
        };

        match (self, to) {
            (SettlementStatus::Draft, SettlementStatus::Completed)
            | (SettlementStatus::Draft, SettlementStatus::Cancelled) => Ok(()),
            (from, _) => Err(SettlementError::InvalidState {
                current: from.to_string(),
                expected: SettlementStatus::Draft.to_string(),
                action,
            }),
        }
    }

    /// Completed settlements are financially binding and cannot be removed
    pub fn can_delete(&self) -> bool {
        !matches!(self, SettlementStatus::Completed)
    }
}

/// Payment mode metadata; only the settlement flag matters to reconciliation
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentMode {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub requires_settlement: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Expense ledger entry (reimbursement-relevant fields)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Expense {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub description: String,
    pub payment_date: NaiveDate,

    #[serde(with = "rust_decimal::serde::str")]
    pub payment_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub reimbursed_amount: Decimal,
    pub reimbursement_status: ReimbursementStatus,

    pub payment_mode_id: Uuid,
    pub paid_by_id: Option<Uuid>,
    /// Draft settlement currently holding this expense, if any
    pub claimed_by_settlement_id: Option<Uuid>,

    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Expense {
    /// Outstanding reimbursement claim
    pub fn pending_amount(&self) -> Decimal {
        self.payment_amount - self.reimbursed_amount
    }

    pub fn is_settled(&self) -> bool {
        self.reimbursement_status == ReimbursementStatus::Settled
    }

    /// Check the amount bounds and status consistency of this entry
    pub fn check_invariants(&self, eligible: bool) -> Result<(), SettlementError> {
        if self.reimbursed_amount < Decimal::ZERO {
            return Err(SettlementError::validation(format!(
                "Expense '{}' has a negative reimbursed amount.",
                self.description
            )));
        }
        if self.reimbursed_amount > self.payment_amount {
            return Err(SettlementError::validation(format!(
                "Expense '{}' reimbursed amount {} exceeds payment amount {}.",
                self.description, self.reimbursed_amount, self.payment_amount
            )));
        }

        let expected =
            ReimbursementStatus::derive(self.payment_amount, self.reimbursed_amount, eligible);
        if self.reimbursement_status != expected {
            return Err(SettlementError::validation(format!(
                "Expense '{}' status {} does not match its amounts (expected {}).",
                self.description, self.reimbursement_status, expected
            )));
        }

        Ok(())
    }
}

/// Settlement batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Settlement {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub reference: String,
    pub contact_id: Uuid,

    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    pub status: SettlementStatus,

    // Populated on completion
    pub payment_mode_id: Option<Uuid>,
    pub transaction_reference: Option<String>,
    pub settlement_date: DateTime<Utc>,
    pub notes: Option<String>,

    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One expense cleared by a settlement, with the amount captured at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SettlementItem {
    pub id: Uuid,
    pub settlement_id: Uuid,
    pub expense_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Settlement together with the items it owns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementDetail {
    pub settlement: Settlement,
    pub items: Vec<SettlementItem>,
}

impl SettlementDetail {
    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(|item| item.amount).sum()
    }

    /// sum(items.amount) == total_amount
    pub fn is_balanced(&self) -> bool {
        self.items_total() == self.settlement.total_amount
    }
}

/// Pending reimbursement aggregated per payer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayerPendingSummary {
    pub paid_by_id: Option<Uuid>,
    pub expense_count: usize,
    #[serde(with = "rust_decimal::serde::str")]
    pub pending_total: Decimal,
}
