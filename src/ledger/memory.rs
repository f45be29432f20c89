use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::{AppResult, SettlementError};

#[derive(Default)]
struct LedgerState {
    payment_modes: HashMap<Uuid, PaymentMode>,
    expenses: HashMap<Uuid, Expense>,
    settlements: HashMap<Uuid, Settlement>,
    items: HashMap<Uuid, Vec<SettlementItem>>,
}

impl LedgerState {
    fn settlement(&self, id: Uuid) -> Result<&Settlement, SettlementError> {
        self.settlements
            .get(&id)
            .ok_or_else(|| SettlementError::not_found("Settlement", id))
    }

    fn release_claims(&mut self, settlement_id: Uuid) {
        for expense in self.expenses.values_mut() {
            if expense.claimed_by_settlement_id == Some(settlement_id) {
                expense.claimed_by_settlement_id = None;
            }
        }
    }
}

/// In-process settlement store.
///
/// Every unit of work validates against the current state under the write
/// lock before mutating anything, so a rejected operation leaves no trace.
#[derive(Default)]
pub struct InMemorySettlementStore {
    state: RwLock<LedgerState>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn get_payment_mode(&self, id: Uuid) -> AppResult<Option<PaymentMode>> {
        Ok(self.state.read().payment_modes.get(&id).cloned())
    }

    async fn find_payment_modes(
        &self,
        organization_id: Uuid,
        requires_settlement: Option<bool>,
    ) -> AppResult<Vec<PaymentMode>> {
        let state = self.state.read();
        let mut modes: Vec<PaymentMode> = state
            .payment_modes
            .values()
            .filter(|m| {
                m.organization_id == organization_id
                    && requires_settlement.map_or(true, |flag| m.requires_settlement == flag)
            })
            .cloned()
            .collect();
        modes.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(modes)
    }

    async fn insert_payment_mode(&self, mode: &PaymentMode) -> AppResult<()> {
        self.state.write().payment_modes.insert(mode.id, mode.clone());
        Ok(())
    }

    async fn get_expense(&self, id: Uuid) -> AppResult<Option<Expense>> {
        Ok(self.state.read().expenses.get(&id).cloned())
    }

    async fn find_expenses(&self, query: &ExpenseQuery) -> AppResult<Vec<Expense>> {
        let state = self.state.read();
        let mut expenses: Vec<Expense> = state
            .expenses
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        expenses.sort_by(|a, b| {
            b.payment_date
                .cmp(&a.payment_date)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(expenses)
    }

    async fn insert_expense(&self, expense: &Expense) -> AppResult<()> {
        self.state.write().expenses.insert(expense.id, expense.clone());
        Ok(())
    }

    async fn update_expense(&self, expense: &Expense, guard: ExpenseGuard) -> AppResult<()> {
        let mut state = self.state.write();
        let stored = state
            .expenses
            .get_mut(&expense.id)
            .ok_or_else(|| SettlementError::not_found("Expense", expense.id))?;

        if !guard.holds_for(stored) {
            return Err(stale_expense(expense.id).into());
        }

        // Reconciliation-owned fields stay as stored
        let mut updated = expense.clone();
        updated.reimbursed_amount = stored.reimbursed_amount;
        updated.claimed_by_settlement_id = stored.claimed_by_settlement_id;
        *stored = updated;
        Ok(())
    }

    async fn get_settlement(&self, id: Uuid) -> AppResult<Option<Settlement>> {
        Ok(self.state.read().settlements.get(&id).cloned())
    }

    async fn find_settlements(&self, query: &SettlementQuery) -> AppResult<Vec<Settlement>> {
        let state = self.state.read();
        let mut settlements: Vec<Settlement> = state
            .settlements
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        settlements.sort_by(|a, b| {
            b.settlement_date
                .cmp(&a.settlement_date)
                .then(a.id.cmp(&b.id))
        });
        Ok(settlements)
    }

    async fn settlement_items(&self, settlement_id: Uuid) -> AppResult<Vec<SettlementItem>> {
        Ok(self
            .state
            .read()
            .items
            .get(&settlement_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_settlement_batch(&self, batch: &SettlementBatch) -> AppResult<()> {
        let mut state = self.state.write();
        let settlement_id = batch.settlement.id;

        for claim in &batch.claims {
            let expense = state
                .expenses
                .get(&claim.expense_id)
                .ok_or_else(|| SettlementError::not_found("Expense", claim.expense_id))?;

            if expense.is_settled() || expense.claimed_by_settlement_id.is_some() {
                return Err(claim_rejection(expense).into());
            }
            if !claim.guard.holds_for(expense) {
                return Err(stale_expense(expense.id).into());
            }
        }

        for claim in &batch.claims {
            if let Some(expense) = state.expenses.get_mut(&claim.expense_id) {
                expense.claimed_by_settlement_id = Some(settlement_id);
            }
        }
        state.settlements.insert(settlement_id, batch.settlement.clone());
        state.items.insert(settlement_id, batch.items.clone());
        Ok(())
    }

    async fn commit_completion(&self, plan: &CompletionPlan) -> AppResult<()> {
        let mut state = self.state.write();

        state
            .settlement(plan.settlement_id)?
            .status
            .validate_transition(SettlementStatus::Completed)?;

        for update in &plan.updates {
            let expense = state
                .expenses
                .get(&update.expense_id)
                .ok_or_else(|| SettlementError::not_found("Expense", update.expense_id))?;
            if !update.guard.holds_for(expense) {
                return Err(stale_expense(update.expense_id).into());
            }
        }

        for update in &plan.updates {
            if let Some(expense) = state.expenses.get_mut(&update.expense_id) {
                expense.reimbursed_amount = update.reimbursed_amount;
                expense.reimbursement_status = update.reimbursement_status;
                expense.claimed_by_settlement_id = None;
                expense.updated_by = plan.actor.clone();
                expense.updated_at = plan.completed_at;
            }
        }
        state.release_claims(plan.settlement_id);

        if let Some(settlement) = state.settlements.get_mut(&plan.settlement_id) {
            settlement.status = SettlementStatus::Completed;
            settlement.settlement_date = plan.completed_at;
            settlement.payment_mode_id = plan.payment_mode_id;
            settlement.transaction_reference = plan.transaction_reference.clone();
            settlement.updated_by = plan.actor.clone();
            settlement.updated_at = plan.completed_at;
        }
        Ok(())
    }

    async fn cancel_settlement(&self, id: Uuid, actor: &str, at: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.state.write();

        state
            .settlement(id)?
            .status
            .validate_transition(SettlementStatus::Cancelled)?;

        state.release_claims(id);
        if let Some(settlement) = state.settlements.get_mut(&id) {
            settlement.status = SettlementStatus::Cancelled;
            settlement.updated_by = actor.to_string();
            settlement.updated_at = at;
        }
        Ok(())
    }

    async fn delete_settlement(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state.write();

        let status = state.settlement(id)?.status;
        if !status.can_delete() {
            return Err(SettlementError::InvalidState {
                current: status.to_string(),
                expected: "Draft or Cancelled".to_string(),
                action: "deleted",
            }
            .into());
        }

        state.release_claims(id);
        state.items.remove(&id);
        state.settlements.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn expense(scope: Uuid, mode: Uuid, payment: Decimal) -> Expense {
        let now = Utc::now();
        Expense {
            id: Uuid::new_v4(),
            organization_id: scope,
            description: "Dinner".to_string(),
            payment_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            payment_amount: payment,
            reimbursed_amount: Decimal::ZERO,
            reimbursement_status: ReimbursementStatus::Pending,
            payment_mode_id: mode,
            paid_by_id: None,
            claimed_by_settlement_id: None,
            created_by: "tester".to_string(),
            updated_by: "tester".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn draft(scope: Uuid, expenses: &[&Expense]) -> SettlementBatch {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let items: Vec<SettlementItem> = expenses
            .iter()
            .map(|e| SettlementItem {
                id: Uuid::new_v4(),
                settlement_id: id,
                expense_id: e.id,
                amount: e.pending_amount(),
                created_at: now,
            })
            .collect();
        SettlementBatch {
            settlement: Settlement {
                id,
                organization_id: scope,
                reference: "S-1".to_string(),
                contact_id: Uuid::new_v4(),
                total_amount: items.iter().map(|i| i.amount).sum(),
                status: SettlementStatus::Draft,
                payment_mode_id: None,
                transaction_reference: None,
                settlement_date: now,
                notes: None,
                created_by: "tester".to_string(),
                updated_by: "tester".to_string(),
                created_at: now,
                updated_at: now,
            },
            items,
            claims: expenses
                .iter()
                .map(|e| ExpenseClaim {
                    expense_id: e.id,
                    guard: ExpenseGuard::of(e),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_rejected_batch_claims_nothing() {
        let store = InMemorySettlementStore::new();
        let scope = Uuid::new_v4();
        let mode = Uuid::new_v4();
        let free = expense(scope, mode, dec!(10));
        let mut taken = expense(scope, mode, dec!(20));
        taken.claimed_by_settlement_id = Some(Uuid::new_v4());
        store.insert_expense(&free).await.unwrap();
        store.insert_expense(&taken).await.unwrap();

        let batch = draft(scope, &[&free, &taken]);
        let err = store.insert_settlement_batch(&batch).await.unwrap_err();
        assert!(matches!(
            err.as_settlement(),
            Some(SettlementError::AlreadyClaimed { .. })
        ));

        let free_now = store.get_expense(free.id).await.unwrap().unwrap();
        assert_eq!(free_now.claimed_by_settlement_id, None);
        assert!(store.get_settlement(batch.settlement.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_completion_applies_nothing() {
        let store = InMemorySettlementStore::new();
        let scope = Uuid::new_v4();
        let mode = Uuid::new_v4();
        let first = expense(scope, mode, dec!(10));
        let second = expense(scope, mode, dec!(20));
        store.insert_expense(&first).await.unwrap();
        store.insert_expense(&second).await.unwrap();

        let batch = draft(scope, &[&first, &second]);
        store.insert_settlement_batch(&batch).await.unwrap();

        let first = store.get_expense(first.id).await.unwrap().unwrap();
        let mut second = store.get_expense(second.id).await.unwrap().unwrap();
        let second_guard = ExpenseGuard::of(&second);

        // Someone edits the second expense after the plan was computed
        second.payment_amount = dec!(25);
        store.update_expense(&second, second_guard).await.unwrap();

        let plan = CompletionPlan {
            settlement_id: batch.settlement.id,
            payment_mode_id: None,
            transaction_reference: None,
            completed_at: Utc::now(),
            actor: "tester".to_string(),
            updates: vec![
                ExpenseUpdate {
                    expense_id: first.id,
                    guard: ExpenseGuard::of(&first),
                    reimbursed_amount: dec!(10),
                    reimbursement_status: ReimbursementStatus::Settled,
                },
                ExpenseUpdate {
                    expense_id: second.id,
                    guard: second_guard,
                    reimbursed_amount: dec!(20),
                    reimbursement_status: ReimbursementStatus::Settled,
                },
            ],
        };
        let err = store.commit_completion(&plan).await.unwrap_err();
        assert!(err.is_retryable());

        let first_now = store.get_expense(first.id).await.unwrap().unwrap();
        assert_eq!(first_now.reimbursed_amount, Decimal::ZERO);
        assert_eq!(first_now.claimed_by_settlement_id, Some(batch.settlement.id));

        let settlement = store.get_settlement(batch.settlement.id).await.unwrap().unwrap();
        assert_eq!(settlement.status, SettlementStatus::Draft);
    }

    #[tokio::test]
    async fn test_expense_ordering() {
        let store = InMemorySettlementStore::new();
        let scope = Uuid::new_v4();
        let mode = Uuid::new_v4();

        let mut older = expense(scope, mode, dec!(1));
        older.payment_date = NaiveDate::from_ymd_opt(2023, 12, 1).unwrap();
        let newer = expense(scope, mode, dec!(2));
        store.insert_expense(&older).await.unwrap();
        store.insert_expense(&newer).await.unwrap();
        store.insert_expense(&expense(Uuid::new_v4(), mode, dec!(3))).await.unwrap();

        let found = store.find_expenses(&ExpenseQuery::for_scope(scope)).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }
}
