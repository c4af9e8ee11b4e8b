use std::collections::BTreeMap;

use crate::schemas::{Expense, MemberId, SpendingGroup};

pub type Balance = BTreeMap<MemberId, f64>;

fn round_cents(amount: f64) -> f64 {
    let cents = (amount * 100.0).round() / 100.0;
    // Avoid handing out "-0.0".
    if cents == 0.0 {
        0.0
    } else {
        cents
    }
}

/// Net balance per member of `group`: positive means the member is owed money.
///
/// Expects already-normalized expenses, so every id is canonical.
pub fn compute_group_balance(group: &SpendingGroup, expenses: &[Expense]) -> Balance {
    let mut balance: Balance = group.members.iter().map(|member| (member.id, 0.0)).collect();
    let mut transfer = |payer: MemberId, debtor: MemberId, amount: f64| {
        *balance.entry(payer).or_insert(0.0) += amount;
        *balance.entry(debtor).or_insert(0.0) -= amount;
    };

    for expense in expenses
        .iter()
        .filter(|expense| expense.group_id == group.id && !expense.is_settled)
    {
        if expense.splits.is_empty() {
            if expense.involved_member_ids.is_empty() {
                continue;
            }
            let share = expense.total_amount / expense.involved_member_ids.len() as f64;
            for &debtor in &expense.involved_member_ids {
                transfer(expense.paid_by_member_id, debtor, share);
            }
            continue;
        }
        for split in expense.splits.iter().filter(|split| !split.is_settled) {
            transfer(expense.paid_by_member_id, split.member_id, split.amount);
        }
    }

    balance
        .into_iter()
        .map(|(member, amount)| (member, round_cents(amount)))
        .collect()
}
