use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::{AppResult, SettlementError};

const PAYMENT_MODE_COLUMNS: &str =
    "id, organization_id, name, requires_settlement, is_active, created_at";

const EXPENSE_COLUMNS: &str = r#"
    id, organization_id, description, payment_date,
    payment_amount, reimbursed_amount, reimbursement_status,
    payment_mode_id, paid_by_id, claimed_by_settlement_id,
    created_by, updated_by, created_at, updated_at
"#;

const SETTLEMENT_COLUMNS: &str = r#"
    id, organization_id, reference, contact_id, total_amount, status,
    payment_mode_id, transaction_reference, settlement_date, notes,
    created_by, updated_by, created_at, updated_at
"#;

/// PostgreSQL settlement store - every unit of work is one transaction
pub struct PgSettlementStore {
    pub pool: PgPool,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Serialize batch creation per organization scope
    async fn lock_scope(
        tx: &mut Transaction<'_, Postgres>,
        organization_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(organization_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn lock_settlement_status(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> AppResult<SettlementStatus> {
        let status: Option<SettlementStatus> = sqlx::query_scalar(
            r#"
            SELECT status
            FROM settlements
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        status.ok_or_else(|| SettlementError::not_found("Settlement", id).into())
    }

    async fn fetch_expense(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> AppResult<Option<Expense>> {
        let sql = format!("SELECT {} FROM expenses WHERE id = $1", EXPENSE_COLUMNS);
        Ok(sqlx::query_as::<_, Expense>(&sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?)
    }

    async fn release_claims(
        tx: &mut Transaction<'_, Postgres>,
        settlement_id: Uuid,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE expenses
            SET claimed_by_settlement_id = NULL
            WHERE claimed_by_settlement_id = $1
            "#,
        )
        .bind(settlement_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    // ========== PAYMENT MODES ==========

    async fn get_payment_mode(&self, id: Uuid) -> AppResult<Option<PaymentMode>> {
        let sql = format!("SELECT {} FROM payment_modes WHERE id = $1", PAYMENT_MODE_COLUMNS);
        Ok(sqlx::query_as::<_, PaymentMode>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_payment_modes(
        &self,
        organization_id: Uuid,
        requires_settlement: Option<bool>,
    ) -> AppResult<Vec<PaymentMode>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM payment_modes
            WHERE organization_id = $1
              AND ($2::BOOLEAN IS NULL OR requires_settlement = $2)
            ORDER BY name, id
            "#,
            PAYMENT_MODE_COLUMNS
        );
        Ok(sqlx::query_as::<_, PaymentMode>(&sql)
            .bind(organization_id)
            .bind(requires_settlement)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_payment_mode(&self, mode: &PaymentMode) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_modes (id, organization_id, name, requires_settlement, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(mode.id)
        .bind(mode.organization_id)
        .bind(&mode.name)
        .bind(mode.requires_settlement)
        .bind(mode.is_active)
        .bind(mode.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========== EXPENSES ==========

    async fn get_expense(&self, id: Uuid) -> AppResult<Option<Expense>> {
        let sql = format!("SELECT {} FROM expenses WHERE id = $1", EXPENSE_COLUMNS);
        Ok(sqlx::query_as::<_, Expense>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_expenses(&self, query: &ExpenseQuery) -> AppResult<Vec<Expense>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM expenses WHERE organization_id = ", EXPENSE_COLUMNS));
        builder.push_bind(query.organization_id);

        if let Some(modes) = &query.payment_mode_ids {
            builder.push(" AND payment_mode_id = ANY(");
            builder.push_bind(modes.clone());
            builder.push(")");
        }
        if let Some(payer) = query.paid_by_id {
            builder.push(" AND paid_by_id = ");
            builder.push_bind(payer);
        }
        if query.unsettled_only {
            builder.push(" AND reimbursement_status <> ");
            builder.push_bind(ReimbursementStatus::Settled);
        }
        builder.push(" ORDER BY payment_date DESC, created_at DESC, id");

        Ok(builder
            .build_query_as::<Expense>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_expense(&self, expense: &Expense) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO expenses (
                id, organization_id, description, payment_date,
                payment_amount, reimbursed_amount, reimbursement_status,
                payment_mode_id, paid_by_id, claimed_by_settlement_id,
                created_by, updated_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(expense.id)
        .bind(expense.organization_id)
        .bind(&expense.description)
        .bind(expense.payment_date)
        .bind(expense.payment_amount)
        .bind(expense.reimbursed_amount)
        .bind(expense.reimbursement_status)
        .bind(expense.payment_mode_id)
        .bind(expense.paid_by_id)
        .bind(expense.claimed_by_settlement_id)
        .bind(&expense.created_by)
        .bind(&expense.updated_by)
        .bind(expense.created_at)
        .bind(expense.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_expense(&self, expense: &Expense, guard: ExpenseGuard) -> AppResult<()> {
        // reimbursed_amount and the claim marker are owned by reconciliation
        let result = sqlx::query(
            r#"
            UPDATE expenses
            SET description = $2,
                payment_date = $3,
                payment_amount = $4,
                reimbursement_status = $5,
                payment_mode_id = $6,
                paid_by_id = $7,
                updated_by = $8,
                updated_at = $9
            WHERE id = $1
              AND payment_amount = $10
              AND reimbursed_amount = $11
              AND claimed_by_settlement_id IS NOT DISTINCT FROM $12
            "#,
        )
        .bind(expense.id)
        .bind(&expense.description)
        .bind(expense.payment_date)
        .bind(expense.payment_amount)
        .bind(expense.reimbursement_status)
        .bind(expense.payment_mode_id)
        .bind(expense.paid_by_id)
        .bind(&expense.updated_by)
        .bind(expense.updated_at)
        .bind(guard.payment_amount)
        .bind(guard.reimbursed_amount)
        .bind(guard.claimed_by_settlement_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_expense(expense.id).await? {
                Some(_) => Err(stale_expense(expense.id).into()),
                None => Err(SettlementError::not_found("Expense", expense.id).into()),
            };
        }

        Ok(())
    }

    // ========== SETTLEMENTS ==========

    async fn get_settlement(&self, id: Uuid) -> AppResult<Option<Settlement>> {
        let sql = format!("SELECT {} FROM settlements WHERE id = $1", SETTLEMENT_COLUMNS);
        Ok(sqlx::query_as::<_, Settlement>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_settlements(&self, query: &SettlementQuery) -> AppResult<Vec<Settlement>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM settlements
            WHERE organization_id = $1
              AND ($2::settlement_status IS NULL OR status = $2)
            ORDER BY settlement_date DESC, id
            "#,
            SETTLEMENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Settlement>(&sql)
            .bind(query.organization_id)
            .bind(query.status)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn settlement_items(&self, settlement_id: Uuid) -> AppResult<Vec<SettlementItem>> {
        Ok(sqlx::query_as::<_, SettlementItem>(
            r#"
            SELECT id, settlement_id, expense_id, amount, created_at
            FROM settlement_items
            WHERE settlement_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(settlement_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_settlement_batch(&self, batch: &SettlementBatch) -> AppResult<()> {
        let settlement = &batch.settlement;
        let mut tx = self.begin_tx().await?;

        Self::lock_scope(&mut tx, settlement.organization_id).await?;

        sqlx::query(
            r#"
            INSERT INTO settlements (
                id, organization_id, reference, contact_id, total_amount, status,
                payment_mode_id, transaction_reference, settlement_date, notes,
                created_by, updated_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(settlement.id)
        .bind(settlement.organization_id)
        .bind(&settlement.reference)
        .bind(settlement.contact_id)
        .bind(settlement.total_amount)
        .bind(settlement.status)
        .bind(settlement.payment_mode_id)
        .bind(&settlement.transaction_reference)
        .bind(settlement.settlement_date)
        .bind(&settlement.notes)
        .bind(&settlement.created_by)
        .bind(&settlement.updated_by)
        .bind(settlement.created_at)
        .bind(settlement.updated_at)
        .execute(&mut *tx)
        .await?;

        for claim in &batch.claims {
            let result = sqlx::query(
                r#"
                UPDATE expenses
                SET claimed_by_settlement_id = $2
                WHERE id = $1
                  AND claimed_by_settlement_id IS NULL
                  AND reimbursement_status <> 'settled'
                  AND payment_amount = $3
                  AND reimbursed_amount = $4
                "#,
            )
            .bind(claim.expense_id)
            .bind(settlement.id)
            .bind(claim.guard.payment_amount)
            .bind(claim.guard.reimbursed_amount)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                let current = Self::fetch_expense(&mut tx, claim.expense_id).await?;
                tx.rollback().await?;
                return Err(match current {
                    Some(expense) => claim_rejection(&expense),
                    None => SettlementError::not_found("Expense", claim.expense_id),
                }
                .into());
            }
        }

        for item in &batch.items {
            sqlx::query(
                r#"
                INSERT INTO settlement_items (id, settlement_id, expense_id, amount, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(item.id)
            .bind(item.settlement_id)
            .bind(item.expense_id)
            .bind(item.amount)
            .bind(item.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Stored settlement {} with {} items",
            settlement.id,
            batch.items.len()
        );
        Ok(())
    }

    async fn commit_completion(&self, plan: &CompletionPlan) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        let status = Self::lock_settlement_status(&mut tx, plan.settlement_id).await?;
        if let Err(e) = status.validate_transition(SettlementStatus::Completed) {
            tx.rollback().await?;
            return Err(e.into());
        }

        for update in &plan.updates {
            let result = sqlx::query(
                r#"
                UPDATE expenses
                SET reimbursed_amount = $2,
                    reimbursement_status = $3,
                    claimed_by_settlement_id = NULL,
                    updated_by = $4,
                    updated_at = $5
                WHERE id = $1
                  AND payment_amount = $6
                  AND reimbursed_amount = $7
                  AND claimed_by_settlement_id IS NOT DISTINCT FROM $8
                "#,
            )
            .bind(update.expense_id)
            .bind(update.reimbursed_amount)
            .bind(update.reimbursement_status)
            .bind(&plan.actor)
            .bind(plan.completed_at)
            .bind(update.guard.payment_amount)
            .bind(update.guard.reimbursed_amount)
            .bind(update.guard.claimed_by_settlement_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(stale_expense(update.expense_id).into());
            }
        }

        Self::release_claims(&mut tx, plan.settlement_id).await?;

        sqlx::query(
            r#"
            UPDATE settlements
            SET status = $2,
                settlement_date = $3,
                payment_mode_id = $4,
                transaction_reference = $5,
                updated_by = $6,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(plan.settlement_id)
        .bind(SettlementStatus::Completed)
        .bind(plan.completed_at)
        .bind(plan.payment_mode_id)
        .bind(&plan.transaction_reference)
        .bind(&plan.actor)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            "Settlement {} committed: {} expenses updated",
            plan.settlement_id,
            plan.updates.len()
        );
        Ok(())
    }

    async fn cancel_settlement(&self, id: Uuid, actor: &str, at: DateTime<Utc>) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        let status = Self::lock_settlement_status(&mut tx, id).await?;
        if let Err(e) = status.validate_transition(SettlementStatus::Cancelled) {
            tx.rollback().await?;
            return Err(e.into());
        }

        let released = Self::release_claims(&mut tx, id).await?;

        sqlx::query(
            r#"
            UPDATE settlements
            SET status = $2, updated_by = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(SettlementStatus::Cancelled)
        .bind(actor)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Settlement {} cancelled, {} claims released", id, released);
        Ok(())
    }

    async fn delete_settlement(&self, id: Uuid) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        let status = Self::lock_settlement_status(&mut tx, id).await?;
        if !status.can_delete() {
            tx.rollback().await?;
            return Err(SettlementError::InvalidState {
                current: status.to_string(),
                expected: "Draft or Cancelled".to_string(),
                action: "deleted",
            }
            .into());
        }

        Self::release_claims(&mut tx, id).await?;

        // settlement_items cascade
        sqlx::query("DELETE FROM settlements WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
