use rust_decimal::Decimal;
use std::collections::HashSet;
use uuid::Uuid;

use super::models::{Expense, ReimbursementStatus};
use crate::error::SettlementError;

pub const MAX_REFERENCE_LEN: usize = 100;

/// Amounts are stored as NUMERIC(18,2): at most 2 decimal places, below 10^16
pub const AMOUNT_SCALE: u32 = 2;
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_874_919_424, 2_328_306, 0, false, 0);

fn check_amount(description: &str, field: &str, amount: Decimal) -> Result<(), SettlementError> {
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(SettlementError::validation(format!(
            "Expense '{}' {} cannot have more than {} decimal places.",
            description, field, AMOUNT_SCALE
        )));
    }
    if amount.abs() >= MAX_AMOUNT {
        return Err(SettlementError::validation(format!(
            "Expense '{}' {} must be less than {}.",
            description, field, MAX_AMOUNT
        )));
    }
    Ok(())
}

/// Field rules checked whenever an expense is saved
pub fn validate_expense(expense: &Expense) -> Result<(), SettlementError> {
    if expense.description.trim().is_empty() {
        return Err(SettlementError::validation("Expense description is required."));
    }
    check_amount(&expense.description, "payment amount", expense.payment_amount)?;
    check_amount(&expense.description, "reimbursed amount", expense.reimbursed_amount)?;
    if expense.payment_amount <= Decimal::ZERO {
        return Err(SettlementError::validation(format!(
            "Expense '{}' payment amount must be greater than zero.",
            expense.description
        )));
    }
    if expense.reimbursed_amount < Decimal::ZERO {
        return Err(SettlementError::validation(format!(
            "Expense '{}' reimbursed amount cannot be negative.",
            expense.description
        )));
    }
    if expense.reimbursed_amount > expense.payment_amount {
        return Err(SettlementError::validation(format!(
            "Expense '{}' reimbursed amount cannot exceed the payment amount.",
            expense.description
        )));
    }
    Ok(())
}

/// Bring the reimbursement status in line with the amounts and payment mode.
///
/// A NotApplicable expense paid through a mode that requires settlement is
/// promoted to Pending here, at save time.
pub fn apply_status_defaults(expense: &mut Expense, requires_settlement: bool) {
    expense.reimbursement_status = ReimbursementStatus::derive(
        expense.payment_amount,
        expense.reimbursed_amount,
        requires_settlement,
    );
}

/// Running total that reports overflow instead of panicking
pub fn add_amounts(total: Decimal, amount: Decimal) -> Result<Decimal, SettlementError> {
    total
        .checked_add(amount)
        .ok_or_else(|| SettlementError::validation("Amount total exceeds the supported range."))
}

/// Trimmed settlement reference, required and bounded
pub fn validate_reference(reference: &str) -> Result<String, SettlementError> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(SettlementError::validation("Settlement reference is required."));
    }
    if reference.chars().count() > MAX_REFERENCE_LEN {
        return Err(SettlementError::validation(format!(
            "Settlement reference cannot exceed {} characters.",
            MAX_REFERENCE_LEN
        )));
    }
    Ok(reference.to_string())
}

/// Non-empty selection with duplicates removed, first occurrence wins
pub fn validate_selection(expense_ids: &[Uuid]) -> Result<Vec<Uuid>, SettlementError> {
    if expense_ids.is_empty() {
        return Err(SettlementError::validation(
            "Select at least one expense to settle.",
        ));
    }

    let mut seen = HashSet::with_capacity(expense_ids.len());
    Ok(expense_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect())
}

/// Optional free-text reference, blank treated as absent
pub fn normalize_optional(value: Option<String>) -> Result<Option<String>, SettlementError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if v.is_empty() => Ok(None),
        Some(v) if v.chars().count() > MAX_REFERENCE_LEN => Err(SettlementError::validation(
            format!("Transaction reference cannot exceed {} characters.", MAX_REFERENCE_LEN),
        )),
        other => Ok(other),
    }
}
