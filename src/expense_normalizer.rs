//! Rewrites expense member references through an alias graph.

use std::collections::{BTreeMap, BTreeSet};

use crate::identity::IdentityGraph;
use crate::names::names_match;
use crate::schemas::{Expense, ExpenseSplit, MemberId, Session};

/// Rewrite payer, involved members, splits and participant names to canonical ids.
///
/// Splits landing on the same canonical member are merged: amounts are summed
/// and the merged split is settled only if every part was. The expense-level
/// `is_settled` flag is carried over untouched.
pub fn normalize_expense(expense: &Expense, aliases: &IdentityGraph) -> Expense {
    let mut involved_member_ids: Vec<MemberId> =
        Vec::with_capacity(expense.involved_member_ids.len());
    for &id in &expense.involved_member_ids {
        let canonical = aliases.canonical(id);
        if !involved_member_ids.contains(&canonical) {
            involved_member_ids.push(canonical);
        }
    }

    let mut splits: Vec<ExpenseSplit> = Vec::with_capacity(expense.splits.len());
    for split in &expense.splits {
        let member_id = aliases.canonical(split.member_id);
        match splits.iter_mut().find(|merged| merged.member_id == member_id) {
            Some(merged) => {
                merged.amount += split.amount;
                merged.is_settled &= split.is_settled;
            }
            None => splits.push(ExpenseSplit {
                member_id,
                amount: split.amount,
                is_settled: split.is_settled,
            }),
        }
    }

    // An id's own entry outranks names carried by its aliases.
    let mut participant_names = BTreeMap::new();
    for (&id, name) in &expense.participant_names {
        if aliases.canonical(id) == id {
            participant_names.insert(id, name.clone());
        }
    }
    for (&id, name) in &expense.participant_names {
        participant_names
            .entry(aliases.canonical(id))
            .or_insert_with(|| name.clone());
    }

    Expense {
        id: expense.id,
        group_id: expense.group_id,
        description: expense.description.clone(),
        date: expense.date,
        total_amount: expense.total_amount,
        paid_by_member_id: aliases.canonical(expense.paid_by_member_id),
        involved_member_ids,
        splits,
        is_settled: expense.is_settled,
        participant_names,
    }
}

/// Every member id an expense mentions.
pub fn referenced_ids(expense: &Expense) -> BTreeSet<MemberId> {
    let mut ids: BTreeSet<MemberId> = expense.involved_member_ids.iter().copied().collect();
    ids.insert(expense.paid_by_member_id);
    ids.extend(expense.splits.iter().map(|split| split.member_id));
    ids.extend(expense.participant_names.keys().copied());
    ids
}

/// Alias graph for expenses whose group was never fetched.
///
/// Only what the expenses say about themselves is used: participant names that
/// look like the signed-in user, plus remote-declared equivalences between ids
/// the expenses actually mention.
pub fn orphan_aliases(
    expenses: &[Expense],
    session: &Session,
    declared: &IdentityGraph,
) -> IdentityGraph {
    let mut graph = IdentityGraph::new();
    graph.pin(session.member_id);

    let mut mentioned = BTreeSet::new();
    for expense in expenses {
        mentioned.extend(referenced_ids(expense));
        for (&id, name) in &expense.participant_names {
            if id == session.member_id || names_match(name, &session.name) {
                graph.union(session.member_id, id);
            }
        }
    }

    let mut by_declared: BTreeMap<MemberId, MemberId> = BTreeMap::new();
    for id in mentioned {
        graph.insert(id);
        if !declared.contains(id) {
            continue;
        }
        let class = declared.canonical(id);
        match by_declared.get(&class) {
            Some(&first) => {
                graph.union(first, id);
            }
            None => {
                by_declared.insert(class, id);
            }
        }
    }
    graph
}
