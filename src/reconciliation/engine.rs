use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::eligibility;
use crate::error::{AppResult, SettlementError};
use crate::identity::ActorProvider;
use crate::ledger::{
    models::*,
    store::{
        CompletionPlan, ExpenseClaim, ExpenseGuard, ExpenseUpdate, SettlementBatch,
        SettlementQuery, SettlementStore,
    },
    validation::{add_amounts, normalize_optional, validate_reference, validate_selection},
};

/// Reconciliation engine configuration
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Attempts at committing a completion before giving up
    pub completion_max_attempts: u32,
    /// Backoff before the first retry, doubled on each further retry
    pub completion_backoff_ms: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            completion_max_attempts: 3,
            completion_backoff_ms: 50,
        }
    }
}

/// Identifies the writes of one `complete_settlement` call
struct CompletionStamp {
    completed_at: DateTime<Utc>,
    actor: String,
}

impl CompletionStamp {
    fn matches(&self, settlement: &Settlement) -> bool {
        settlement.status == SettlementStatus::Completed
            && settlement.settlement_date == self.completed_at
            && settlement.updated_by == self.actor
    }
}

/// Reconciliation engine - creates, completes and cancels settlement batches
///
/// Holds no ledger state between calls: every operation re-reads storage and
/// hands the store a single unit of work to apply.
#[derive(Clone)]
pub struct ReconciliationEngine {
    config: ReconciliationConfig,
    store: Arc<dyn SettlementStore>,
    actor: Arc<dyn ActorProvider>,
}

impl ReconciliationEngine {
    pub fn new(
        config: ReconciliationConfig,
        store: Arc<dyn SettlementStore>,
        actor: Arc<dyn ActorProvider>,
    ) -> Self {
        Self {
            config,
            store,
            actor,
        }
    }

    /// Same engine, stamping records with a different actor
    pub fn with_actor(&self, actor: Arc<dyn ActorProvider>) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            actor,
        }
    }

    // ========== PENDING REIMBURSEMENT QUERIES ==========

    pub async fn eligible_payment_modes(&self, scope_id: Uuid) -> AppResult<HashSet<Uuid>> {
        eligibility::eligible_payment_modes(self.store.as_ref(), scope_id).await
    }

    pub async fn list_unsettled_expenses(
        &self,
        scope_id: Uuid,
        payer_id: Option<Uuid>,
    ) -> AppResult<Vec<Expense>> {
        eligibility::list_unsettled_expenses(self.store.as_ref(), scope_id, payer_id).await
    }

    pub async fn compute_pending_total(
        &self,
        scope_id: Uuid,
        payer_id: Option<Uuid>,
    ) -> AppResult<Decimal> {
        eligibility::compute_pending_total(self.store.as_ref(), scope_id, payer_id).await
    }

    pub async fn pending_by_payer(&self, scope_id: Uuid) -> AppResult<Vec<PayerPendingSummary>> {
        eligibility::pending_by_payer(self.store.as_ref(), scope_id).await
    }

    // ========== SETTLEMENT LIFECYCLE ==========

    /// Group expenses into a new Draft settlement.
    ///
    /// Captures each expense's pending amount into an item and claims the
    /// expense for this draft. Expense amounts are not touched.
    pub async fn create_settlement(
        &self,
        scope_id: Uuid,
        reference: &str,
        contact_id: Uuid,
        expense_ids: &[Uuid],
        notes: Option<String>,
    ) -> AppResult<SettlementDetail> {
        let reference = validate_reference(reference)?;
        let expense_ids = validate_selection(expense_ids)?;
        let notes = notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        let eligible_modes = self.eligible_payment_modes(scope_id).await?;

        let settlement_id = Uuid::new_v4();
        let actor = self.actor.current_actor_id();
        let now = Utc::now();

        let mut total_amount = Decimal::ZERO;
        let mut items = Vec::with_capacity(expense_ids.len());
        let mut claims = Vec::with_capacity(expense_ids.len());

        for expense_id in expense_ids {
            let expense = self
                .store
                .get_expense(expense_id)
                .await?
                .filter(|e| e.organization_id == scope_id)
                .ok_or_else(|| SettlementError::not_found("Expense", expense_id))?;

            if expense.is_settled() {
                warn!(
                    "Rejected settlement '{}': expense {} already settled",
                    reference, expense.id
                );
                return Err(SettlementError::AlreadySettled {
                    expense_id: expense.id,
                    name: expense.description,
                }
                .into());
            }

            if !eligible_modes.contains(&expense.payment_mode_id) {
                return Err(SettlementError::validation(format!(
                    "Expense '{}' was not paid through a reimbursable payment mode.",
                    expense.description
                ))
                .into());
            }

            if let Some(claimed_by) = expense.claimed_by_settlement_id {
                warn!(
                    "Rejected settlement '{}': expense {} claimed by draft {}",
                    reference, expense.id, claimed_by
                );
                return Err(SettlementError::AlreadyClaimed {
                    expense_id: expense.id,
                    name: expense.description,
                    settlement_id: claimed_by,
                }
                .into());
            }

            let pending = expense.pending_amount();
            if pending <= Decimal::ZERO {
                return Err(SettlementError::validation(format!(
                    "Expense '{}' has no pending amount to settle.",
                    expense.description
                ))
                .into());
            }

            total_amount = add_amounts(total_amount, pending)?;
            items.push(SettlementItem {
                id: Uuid::new_v4(),
                settlement_id,
                expense_id: expense.id,
                amount: pending,
                created_at: now,
            });
            claims.push(ExpenseClaim {
                expense_id: expense.id,
                guard: ExpenseGuard::of(&expense),
            });
        }

        let settlement = Settlement {
            id: settlement_id,
            organization_id: scope_id,
            reference,
            contact_id,
            total_amount,
            status: SettlementStatus::Draft,
            payment_mode_id: None,
            transaction_reference: None,
            settlement_date: now,
            notes,
            created_by: actor.clone(),
            updated_by: actor,
            created_at: now,
            updated_at: now,
        };

        let batch = SettlementBatch {
            settlement,
            items,
            claims,
        };
        self.store.insert_settlement_batch(&batch).await?;

        info!(
            settlement_id = %batch.settlement.id,
            scope_id = %scope_id,
            expense_count = batch.items.len(),
            total = %batch.settlement.total_amount,
            "Draft settlement '{}' created",
            batch.settlement.reference
        );

        Ok(SettlementDetail {
            settlement: batch.settlement,
            items: batch.items,
        })
    }

    /// Apply every item to its expense and mark the settlement Completed.
    ///
    /// The store commits all expense updates and the status flip together;
    /// a conflicting concurrent write causes a fresh re-read and retry.
    pub async fn complete_settlement(
        &self,
        settlement_id: Uuid,
        payment_mode_id: Option<Uuid>,
        transaction_reference: Option<String>,
    ) -> AppResult<Settlement> {
        let transaction_reference = normalize_optional(transaction_reference)?;
        let max_attempts = self.config.completion_max_attempts.max(1);
        let mut backoff_ms = self.config.completion_backoff_ms;
        let mut attempt = 1;

        // Fixed across attempts so a retry can recognise its own earlier commit.
        // Microsecond precision matches what PostgreSQL stores.
        let stamp = CompletionStamp {
            completed_at: Utc::now().trunc_subsecs(6),
            actor: self.actor.current_actor_id(),
        };

        loop {
            match self
                .try_complete(
                    settlement_id,
                    payment_mode_id,
                    transaction_reference.clone(),
                    &stamp,
                    attempt > 1,
                )
                .await
            {
                Ok(settlement) => return Ok(settlement),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "Completing settlement {} failed (attempt {}/{}): {}. Retrying in {}ms",
                        settlement_id, attempt, max_attempts, e, backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(
                            "Completing settlement {} failed after {} attempts: {}",
                            settlement_id, attempt, e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn try_complete(
        &self,
        settlement_id: Uuid,
        payment_mode_id: Option<Uuid>,
        transaction_reference: Option<String>,
        stamp: &CompletionStamp,
        retrying: bool,
    ) -> AppResult<Settlement> {
        let settlement = self.load_settlement(settlement_id).await?;

        // A failed acknowledgement does not mean the commit was lost
        if retrying && stamp.matches(&settlement) {
            info!(
                settlement_id = %settlement_id,
                "Settlement '{}' was completed by an earlier attempt",
                settlement.reference
            );
            return Ok(settlement);
        }

        settlement
            .status
            .validate_transition(SettlementStatus::Completed)?;

        if let Some(mode_id) = payment_mode_id {
            self.store
                .get_payment_mode(mode_id)
                .await?
                .filter(|mode| mode.organization_id == settlement.organization_id)
                .ok_or_else(|| SettlementError::not_found("Payment mode", mode_id))?;
        }

        let items = self.store.settlement_items(settlement_id).await?;
        let mut updates = Vec::with_capacity(items.len());

        for item in &items {
            let expense = self
                .store
                .get_expense(item.expense_id)
                .await?
                .ok_or_else(|| SettlementError::not_found("Expense", item.expense_id))?;

            let reimbursed_amount = add_amounts(expense.reimbursed_amount, item.amount)?;
            if reimbursed_amount > expense.payment_amount {
                warn!(
                    "Settlement {} item for expense {} exceeds its remaining balance",
                    settlement_id, expense.id
                );
                return Err(SettlementError::validation(format!(
                    "Expense '{}' changed after settlement '{}' was drafted: {} would exceed its remaining {}.",
                    expense.description,
                    settlement.reference,
                    item.amount,
                    expense.pending_amount()
                ))
                .into());
            }

            let reimbursement_status = if reimbursed_amount >= expense.payment_amount {
                ReimbursementStatus::Settled
            } else {
                ReimbursementStatus::Partial
            };

            updates.push(ExpenseUpdate {
                expense_id: expense.id,
                guard: ExpenseGuard::of(&expense),
                reimbursed_amount,
                reimbursement_status,
            });
        }

        let plan = CompletionPlan {
            settlement_id,
            payment_mode_id,
            transaction_reference,
            completed_at: stamp.completed_at,
            actor: stamp.actor.clone(),
            updates,
        };
        self.store.commit_completion(&plan).await?;

        let completed = self.load_settlement(settlement_id).await?;
        info!(
            settlement_id = %settlement_id,
            expense_count = plan.updates.len(),
            total = %completed.total_amount,
            "Settlement '{}' completed",
            completed.reference
        );
        Ok(completed)
    }

    /// Cancel a Draft settlement; expenses stay exactly as they were
    pub async fn cancel_settlement(&self, settlement_id: Uuid) -> AppResult<()> {
        let settlement = self.load_settlement(settlement_id).await?;
        settlement
            .status
            .validate_transition(SettlementStatus::Cancelled)?;

        self.store
            .cancel_settlement(settlement_id, &self.actor.current_actor_id(), Utc::now())
            .await?;

        info!("Settlement '{}' ({}) cancelled", settlement.reference, settlement_id);
        Ok(())
    }

    /// Delete a settlement and its items unless it has been completed
    pub async fn delete_settlement(&self, settlement_id: Uuid) -> AppResult<()> {
        let settlement = self.load_settlement(settlement_id).await?;
        if !settlement.status.can_delete() {
            return Err(SettlementError::InvalidState {
                current: settlement.status.to_string(),
                expected: "Draft or Cancelled".to_string(),
                action: "deleted",
            }
            .into());
        }

        self.store.delete_settlement(settlement_id).await?;

        info!("Settlement '{}' ({}) deleted", settlement.reference, settlement_id);
        Ok(())
    }

    pub async fn get_settlement(&self, settlement_id: Uuid) -> AppResult<SettlementDetail> {
        let settlement = self.load_settlement(settlement_id).await?;
        let items = self.store.settlement_items(settlement_id).await?;
        Ok(SettlementDetail { settlement, items })
    }

    pub async fn list_settlements(
        &self,
        scope_id: Uuid,
        status: Option<SettlementStatus>,
    ) -> AppResult<Vec<Settlement>> {
        self.store
            .find_settlements(&SettlementQuery {
                organization_id: scope_id,
                status,
            })
            .await
    }

    async fn load_settlement(&self, settlement_id: Uuid) -> AppResult<Settlement> {
        self.store
            .get_settlement(settlement_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("Settlement", settlement_id).into())
    }
}
