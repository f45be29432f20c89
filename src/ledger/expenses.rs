use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use super::store::{ExpenseGuard, SettlementStore};
use super::validation::{apply_status_defaults, validate_expense};
use crate::error::{AppResult, SettlementError};
use crate::identity::ActorProvider;

#[derive(Debug, Clone, Deserialize)]
pub struct NewPaymentMode {
    pub name: String,
    pub requires_settlement: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewExpense {
    pub description: String,
    pub payment_date: NaiveDate,
    #[serde(with = "rust_decimal::serde::str")]
    pub payment_amount: Decimal,
    /// Opening balance for expenses imported part-way through reimbursement
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub reimbursed_amount: Option<Decimal>,
    pub payment_mode_id: Uuid,
    pub paid_by_id: Option<Uuid>,
}

/// Ordinary expense edit; reimbursement fields are not editable here
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpenseChanges {
    pub description: Option<String>,
    pub payment_date: Option<NaiveDate>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub payment_amount: Option<Decimal>,
    pub payment_mode_id: Option<Uuid>,
    pub paid_by_id: Option<Uuid>,
}

/// Expense save path: runs the validation layer before anything is stored
#[derive(Clone)]
pub struct ExpenseService {
    store: Arc<dyn SettlementStore>,
    actor: Arc<dyn ActorProvider>,
}

impl ExpenseService {
    pub fn new(store: Arc<dyn SettlementStore>, actor: Arc<dyn ActorProvider>) -> Self {
        Self { store, actor }
    }

    pub fn with_actor(&self, actor: Arc<dyn ActorProvider>) -> Self {
        Self {
            store: self.store.clone(),
            actor,
        }
    }

    pub async fn create_payment_mode(
        &self,
        scope_id: Uuid,
        request: NewPaymentMode,
    ) -> AppResult<PaymentMode> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(SettlementError::validation("Payment mode name is required.").into());
        }

        let mode = PaymentMode {
            id: Uuid::new_v4(),
            organization_id: scope_id,
            name: name.to_string(),
            requires_settlement: request.requires_settlement,
            is_active: true,
            created_at: Utc::now(),
        };
        self.store.insert_payment_mode(&mode).await?;

        info!(
            "Payment mode '{}' created in scope {} (requires settlement: {})",
            mode.name, scope_id, mode.requires_settlement
        );
        Ok(mode)
    }

    async fn scoped_payment_mode(&self, scope_id: Uuid, id: Uuid) -> AppResult<PaymentMode> {
        self.store
            .get_payment_mode(id)
            .await?
            .filter(|mode| mode.organization_id == scope_id)
            .ok_or_else(|| SettlementError::not_found("Payment mode", id).into())
    }

    pub async fn create_expense(&self, scope_id: Uuid, request: NewExpense) -> AppResult<Expense> {
        let mode = self
            .scoped_payment_mode(scope_id, request.payment_mode_id)
            .await?;

        let actor = self.actor.current_actor_id();
        let now = Utc::now();
        let mut expense = Expense {
            id: Uuid::new_v4(),
            organization_id: scope_id,
            description: request.description.trim().to_string(),
            payment_date: request.payment_date,
            payment_amount: request.payment_amount,
            reimbursed_amount: request.reimbursed_amount.unwrap_or(Decimal::ZERO),
            reimbursement_status: ReimbursementStatus::NotApplicable,
            payment_mode_id: mode.id,
            paid_by_id: request.paid_by_id,
            claimed_by_settlement_id: None,
            created_by: actor.clone(),
            updated_by: actor,
            created_at: now,
            updated_at: now,
        };

        validate_expense(&expense)?;
        apply_status_defaults(&mut expense, mode.requires_settlement);

        self.store.insert_expense(&expense).await?;
        info!(
            "Expense {} '{}' recorded: {} ({})",
            expense.id, expense.description, expense.payment_amount, expense.reimbursement_status
        );
        Ok(expense)
    }

    pub async fn update_expense(&self, id: Uuid, changes: ExpenseChanges) -> AppResult<Expense> {
        let current = self
            .store
            .get_expense(id)
            .await?
            .ok_or_else(|| SettlementError::not_found("Expense", id))?;

        let amount_changed = changes
            .payment_amount
            .map_or(false, |amount| amount != current.payment_amount);
        let mode_changed = changes
            .payment_mode_id
            .map_or(false, |mode| mode != current.payment_mode_id);

        if let Some(settlement_id) = current.claimed_by_settlement_id {
            if amount_changed || mode_changed {
                return Err(SettlementError::validation(format!(
                    "Expense '{}' is included in draft settlement {}; its amount and payment mode cannot change.",
                    current.description, settlement_id
                ))
                .into());
            }
        }

        let mode = self
            .scoped_payment_mode(
                current.organization_id,
                changes.payment_mode_id.unwrap_or(current.payment_mode_id),
            )
            .await?;

        let mut updated = current.clone();
        if let Some(description) = changes.description {
            updated.description = description.trim().to_string();
        }
        if let Some(date) = changes.payment_date {
            updated.payment_date = date;
        }
        if let Some(amount) = changes.payment_amount {
            updated.payment_amount = amount;
        }
        if changes.paid_by_id.is_some() {
            updated.paid_by_id = changes.paid_by_id;
        }
        updated.payment_mode_id = mode.id;
        updated.updated_by = self.actor.current_actor_id();
        updated.updated_at = Utc::now();

        validate_expense(&updated)?;
        apply_status_defaults(&mut updated, mode.requires_settlement);

        self.store
            .update_expense(&updated, ExpenseGuard::of(&current))
            .await?;
        info!("Expense {} updated ({})", updated.id, updated.reimbursement_status);
        Ok(updated)
    }
}
