//! Builds groups for expenses that point at a group nobody fetched.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use tracing::info;

use crate::names::normalize_name;
use crate::schemas::{AccountFriend, Expense, GroupId, Member, MemberId, Session, SpendingGroup};

/// Names resolved by earlier synthesis runs, reused so a member keeps its name.
pub type NameCache = HashMap<MemberId, String>;

pub struct GroupSynthesizer<'a> {
    session: &'a Session,
    friends: &'a [AccountFriend],
    cache: &'a mut NameCache,
}

impl<'a> GroupSynthesizer<'a> {
    pub fn new(
        session: &'a Session,
        friends: &'a [AccountFriend],
        cache: &'a mut NameCache,
    ) -> Self {
        Self {
            session,
            friends,
            cache,
        }
    }

    /// One group per distinct `group_id` among `orphans`, ordered by group id.
    pub fn synthesize(&mut self, orphans: &[Expense]) -> Vec<SpendingGroup> {
        let mut by_group: BTreeMap<GroupId, Vec<&Expense>> = BTreeMap::new();
        for expense in orphans {
            by_group.entry(expense.group_id).or_default().push(expense);
        }
        let groups: Vec<SpendingGroup> = by_group
            .into_iter()
            .map(|(group_id, mut expenses)| {
                expenses.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
                self.build(group_id, &expenses)
            })
            .collect();
        if !groups.is_empty() {
            info!(count = groups.len(), "synthesized groups for orphan expenses");
        }
        groups
    }

    fn build(&mut self, group_id: GroupId, expenses: &[&Expense]) -> SpendingGroup {
        let mut member_ids = vec![self.session.member_id];
        for expense in expenses {
            let ids = std::iter::once(expense.paid_by_member_id)
                .chain(expense.involved_member_ids.iter().copied());
            for id in ids {
                if !member_ids.contains(&id) {
                    member_ids.push(id);
                }
            }
        }

        let members: Vec<Member> = member_ids
            .iter()
            .map(|&id| Member::new(id, self.resolve_name(id, expenses)))
            .collect();
        let others: Vec<&str> = members
            .iter()
            .filter(|member| member.id != self.session.member_id)
            .map(|member| member.name.as_str())
            .collect();
        let name = synthesized_name(&others, expenses);

        SpendingGroup {
            id: group_id,
            name,
            created_at: expenses
                .iter()
                .map(|expense| expense.date)
                .min()
                .unwrap_or_default(),
            is_direct: Some(members.len() == 2),
            members,
        }
    }

    fn resolve_name(&mut self, id: MemberId, expenses: &[&Expense]) -> String {
        if id == self.session.member_id {
            return self.session.name.clone();
        }
        if let Some(cached) = self.cache.get(&id) {
            return cached.clone();
        }
        let resolved = self
            .most_common_participant_name(id, expenses)
            .or_else(|| self.friend_name(id));
        match resolved {
            Some(name) => {
                self.cache.insert(id, name.clone());
                name
            }
            None => fallback_name(id),
        }
    }

    fn most_common_participant_name(
        &self,
        id: MemberId,
        expenses: &[&Expense],
    ) -> Option<String> {
        let mut tally: HashMap<&str, usize> = HashMap::new();
        for expense in expenses {
            if let Some(name) = expense.participant_names.get(&id) {
                let name = name.trim();
                if !name.is_empty() {
                    *tally.entry(name).or_default() += 1;
                }
            }
        }
        let own = normalize_name(&self.session.name);
        if tally.keys().any(|name| normalize_name(name) != own) {
            tally.retain(|name, _| normalize_name(name) != own);
        }
        tally
            .into_iter()
            .max_by_key(|&(name, count)| (count, Reverse(name)))
            .map(|(name, _)| name.to_owned())
    }

    fn friend_name(&self, id: MemberId) -> Option<String> {
        self.friends
            .iter()
            .find(|friend| friend.identity_ids().any(|known| known == id))
            .map(|friend| friend.display_name().trim().to_owned())
            .filter(|name| !name.is_empty())
    }
}

pub fn fallback_name(id: MemberId) -> String {
    let simple = id.simple().to_string();
    format!("Friend {}", simple.get(..8).unwrap_or(&simple))
}

fn synthesized_name(others: &[&str], expenses: &[&Expense]) -> String {
    match others {
        [only] => (*only).to_owned(),
        [first, second] => format!("{first} & {second}"),
        [first, second, third] => format!("Group with {first}, {second}, {third}"),
        _ => expenses
            .iter()
            .map(|expense| expense.description.trim())
            .find(|description| !description.is_empty())
            .map_or_else(
                || "Imported Group".to_owned(),
                |description| format!("{description} Group"),
            ),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::*;

    fn id(n: u128) -> MemberId {
        Uuid::from_u128(n)
    }

    const GROUP: u128 = 0x600D;

    fn session() -> Session {
        Session {
            account_id: "acct-me".to_owned(),
            email: "me@example.com".to_owned(),
            member_id: id(100),
            name: "Sam Carter".to_owned(),
        }
    }

    fn orphan(n: u128, involved: &[u128], names: &[(u128, &str)], description: &str) -> Expense {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        Expense {
            id: Uuid::from_u128(1000 + n),
            group_id: Uuid::from_u128(GROUP),
            description: description.to_owned(),
            date: base + Duration::days(n as i64),
            total_amount: 10.0,
            paid_by_member_id: id(involved[0]),
            involved_member_ids: involved.iter().map(|&m| id(m)).collect(),
            splits: Vec::new(),
            is_settled: false,
            participant_names: names
                .iter()
                .map(|&(m, name)| (id(m), name.to_owned()))
                .collect(),
        }
    }

    fn synthesize(orphans: &[Expense], friends: &[AccountFriend]) -> Vec<SpendingGroup> {
        let session = session();
        let mut cache = NameCache::new();
        GroupSynthesizer::new(&session, friends, &mut cache).synthesize(orphans)
    }

    #[test]
    fn direct_orphan_is_named_after_the_other_member() {
        let groups = synthesize(&[orphan(0, &[100, 1], &[(1, "Alice")], "Lunch")], &[]);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.id, Uuid::from_u128(GROUP));
        assert_eq!(
            group.members,
            vec![Member::new(id(100), "Sam Carter"), Member::new(id(1), "Alice")]
        );
        assert_eq!(group.is_direct, Some(true));
        assert_eq!(group.name, "Alice");
    }

    #[test]
    fn current_user_is_added_when_missing() {
        let names = [(1, "Alice"), (2, "Bob")];
        let groups = synthesize(&[orphan(0, &[1, 2], &names, "")], &[]);
        let group = &groups[0];
        assert!(group.member(id(100)).is_some());
        assert_eq!(group.members.len(), 3);
        assert_eq!(group.is_direct, Some(false));
        assert_eq!(group.name, "Alice & Bob");
    }

    #[test]
    fn stale_current_user_name_is_ignored() {
        let names = [(100, "Old Me"), (1, "Alice")];
        let groups = synthesize(&[orphan(0, &[100, 1], &names, "")], &[]);
        assert_eq!(groups[0].member(id(100)).unwrap().name, "Sam Carter");
    }

    #[test]
    fn most_frequent_name_wins_and_own_name_is_a_last_resort() {
        let expenses = [
            orphan(0, &[100, 1], &[(1, "Sam Carter")], ""),
            orphan(1, &[100, 1], &[(1, "Al")], ""),
            orphan(2, &[100, 1], &[(1, "Alice")], ""),
            orphan(3, &[100, 1], &[(1, "Alice")], ""),
            orphan(4, &[100, 1], &[(1, "Sam Carter")], ""),
            orphan(5, &[100, 1], &[(1, "Sam Carter")], ""),
        ];
        let groups = synthesize(&expenses, &[]);
        assert_eq!(groups[0].member(id(1)).unwrap().name, "Alice");

        let only_own = synthesize(&[orphan(0, &[100, 1], &[(1, "Sam Carter")], "")], &[]);
        assert_eq!(only_own[0].member(id(1)).unwrap().name, "Sam Carter");
    }

    #[test]
    fn cached_names_take_priority_over_expense_names() {
        let session = session();
        let mut cache = NameCache::from([(id(1), "Ally".to_owned())]);
        let groups = GroupSynthesizer::new(&session, &[], &mut cache)
            .synthesize(&[orphan(0, &[100, 1], &[(1, "Alice")], "")]);
        assert_eq!(groups[0].name, "Ally");
    }

    #[test]
    fn friend_names_and_fallbacks_fill_the_gaps() {
        let mut friend = AccountFriend::named(id(50), "Teal'c");
        friend.alias_member_ids.push(id(2));
        friend.nickname = Some("T".to_owned());
        let groups = synthesize(&[orphan(0, &[100, 2, 3], &[], "")], &[friend]);
        let group = &groups[0];
        assert_eq!(group.member(id(2)).unwrap().name, "T");
        assert_eq!(group.member(id(3)).unwrap().name, fallback_name(id(3)));
        assert!(fallback_name(id(3)).starts_with("Friend 00000000"));
    }

    #[test]
    fn larger_groups_use_description_or_default() {
        let names = [(1, "A"), (2, "B"), (3, "C"), (4, "D")];
        let three = synthesize(&[orphan(0, &[100, 1, 2, 3], &names, "")], &[]);
        assert_eq!(three[0].name, "Group with A, B, C");

        let expenses = [
            orphan(0, &[1, 2, 3, 4], &names, "  "),
            orphan(1, &[1], &names, "Ski trip"),
        ];
        let four = synthesize(&expenses, &[]);
        assert_eq!(four[0].name, "Ski trip Group");
        assert_eq!(four[0].created_at, expenses[0].date);

        let unnamed = synthesize(&[orphan(0, &[1, 2, 3, 4], &names, "")], &[]);
        assert_eq!(unnamed[0].name, "Imported Group");
    }
}
