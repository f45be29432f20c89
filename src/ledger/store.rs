use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppResult, SettlementError};

/// Predicate over expenses within one organization scope
#[derive(Debug, Clone, Default)]
pub struct ExpenseQuery {
    pub organization_id: Uuid,
    /// Restrict to these payment modes (empty set matches nothing)
    pub payment_mode_ids: Option<Vec<Uuid>>,
    pub paid_by_id: Option<Uuid>,
    /// Exclude expenses whose status is Settled
    pub unsettled_only: bool,
}

impl ExpenseQuery {
    pub fn for_scope(organization_id: Uuid) -> Self {
        Self {
            organization_id,
            ..Default::default()
        }
    }

    pub fn matches(&self, expense: &Expense) -> bool {
        expense.organization_id == self.organization_id
            && self
                .payment_mode_ids
                .as_ref()
                .map_or(true, |modes| modes.contains(&expense.payment_mode_id))
            && self
                .paid_by_id
                .map_or(true, |payer| expense.paid_by_id == Some(payer))
            && !(self.unsettled_only && expense.is_settled())
    }
}

/// Predicate over settlements within one organization scope
#[derive(Debug, Clone)]
pub struct SettlementQuery {
    pub organization_id: Uuid,
    pub status: Option<SettlementStatus>,
}

impl SettlementQuery {
    pub fn matches(&self, settlement: &Settlement) -> bool {
        settlement.organization_id == self.organization_id
            && self.status.map_or(true, |status| settlement.status == status)
    }
}

/// Snapshot of the expense fields a write was computed from.
/// Writes only apply if the stored row still matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpenseGuard {
    pub payment_amount: Decimal,
    pub reimbursed_amount: Decimal,
    pub claimed_by_settlement_id: Option<Uuid>,
}

impl ExpenseGuard {
    pub fn of(expense: &Expense) -> Self {
        Self {
            payment_amount: expense.payment_amount,
            reimbursed_amount: expense.reimbursed_amount,
            claimed_by_settlement_id: expense.claimed_by_settlement_id,
        }
    }

    pub fn holds_for(&self, expense: &Expense) -> bool {
        *self == Self::of(expense)
    }
}

/// Claim taken on an expense by a new draft settlement
#[derive(Debug, Clone)]
pub struct ExpenseClaim {
    pub expense_id: Uuid,
    pub guard: ExpenseGuard,
}

/// Everything written when a draft settlement is created
#[derive(Debug, Clone)]
pub struct SettlementBatch {
    pub settlement: Settlement,
    pub items: Vec<SettlementItem>,
    pub claims: Vec<ExpenseClaim>,
}

/// New reimbursement state for one expense, applied on completion
#[derive(Debug, Clone)]
pub struct ExpenseUpdate {
    pub expense_id: Uuid,
    pub guard: ExpenseGuard,
    pub reimbursed_amount: Decimal,
    pub reimbursement_status: ReimbursementStatus,
}

/// Everything written when a settlement is completed
#[derive(Debug, Clone)]
pub struct CompletionPlan {
    pub settlement_id: Uuid,
    pub payment_mode_id: Option<Uuid>,
    pub transaction_reference: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub actor: String,
    pub updates: Vec<ExpenseUpdate>,
}

/// Persistence gateway for the reconciliation core.
///
/// `insert_settlement_batch`, `commit_completion`, `cancel_settlement` and
/// `delete_settlement` are units of work: they either apply fully or leave
/// storage untouched.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    // ========== PAYMENT MODES ==========

    async fn get_payment_mode(&self, id: Uuid) -> AppResult<Option<PaymentMode>>;

    async fn find_payment_modes(
        &self,
        organization_id: Uuid,
        requires_settlement: Option<bool>,
    ) -> AppResult<Vec<PaymentMode>>;

    async fn insert_payment_mode(&self, mode: &PaymentMode) -> AppResult<()>;

    // ========== EXPENSES ==========

    async fn get_expense(&self, id: Uuid) -> AppResult<Option<Expense>>;

    /// Matching expenses ordered by payment date, most recent first
    async fn find_expenses(&self, query: &ExpenseQuery) -> AppResult<Vec<Expense>>;

    async fn insert_expense(&self, expense: &Expense) -> AppResult<()>;

    /// Replace an expense if the stored row still matches `guard`
    async fn update_expense(&self, expense: &Expense, guard: ExpenseGuard) -> AppResult<()>;

    // ========== SETTLEMENTS ==========

    async fn get_settlement(&self, id: Uuid) -> AppResult<Option<Settlement>>;

    /// Matching settlements ordered by settlement date, most recent first
    async fn find_settlements(&self, query: &SettlementQuery) -> AppResult<Vec<Settlement>>;

    async fn settlement_items(&self, settlement_id: Uuid) -> AppResult<Vec<SettlementItem>>;

    /// Insert a draft settlement with its items and claim every included expense
    async fn insert_settlement_batch(&self, batch: &SettlementBatch) -> AppResult<()>;

    /// Apply all expense updates and flip the settlement to Completed
    async fn commit_completion(&self, plan: &CompletionPlan) -> AppResult<()>;

    /// Flip a draft settlement to Cancelled and release its claims
    async fn cancel_settlement(&self, id: Uuid, actor: &str, at: DateTime<Utc>) -> AppResult<()>;

    /// Remove a non-completed settlement with its items and release its claims
    async fn delete_settlement(&self, id: Uuid) -> AppResult<()>;
}

/// Why a claim on `expense` could not be taken
pub(crate) fn claim_rejection(expense: &Expense) -> SettlementError {
    if expense.is_settled() {
        return SettlementError::AlreadySettled {
            expense_id: expense.id,
            name: expense.description.clone(),
        };
    }

    match expense.claimed_by_settlement_id {
        Some(settlement_id) => SettlementError::AlreadyClaimed {
            expense_id: expense.id,
            name: expense.description.clone(),
            settlement_id,
        },
        None => SettlementError::Conflict(format!(
            "expense '{}' changed while the settlement was being created",
            expense.description
        )),
    }
}

pub(crate) fn stale_expense(expense_id: Uuid) -> SettlementError {
    SettlementError::Conflict(format!("expense {} changed since it was read", expense_id))
}
