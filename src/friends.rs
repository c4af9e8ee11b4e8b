//! Merges group members, remote friend records and imported friends into one
//! deduplicated friend list.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::IdentityGraph;
use crate::names::same_text;
use crate::schemas::{AccountFriend, Member, MemberId, Session, SpendingGroup};

/// Where a reconciled friend entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendOrigin {
    /// Only known as a member of some group.
    Group,
    /// Tracked by the remote friend store.
    Remote,
    /// Added locally by the user, independently of any group.
    Imported,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FriendEntry {
    #[serde(flatten)]
    pub friend: AccountFriend,
    pub origin: FriendOrigin,
}

impl FriendEntry {
    /// Shown in the list but never explicitly imported or linked.
    pub fn is_group_only(&self) -> bool {
        self.origin == FriendOrigin::Group
            && self.friend.status.is_none()
            && !self.friend.has_linked_account
    }

    pub fn is_pending(&self) -> bool {
        self.friend.status.is_some_and(|status| status.is_pending())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FriendSources<'a> {
    pub groups: &'a [SpendingGroup],
    pub remote: &'a [AccountFriend],
    pub imported: &'a [AccountFriend],
    /// Aliases known across every group of the account.
    pub identities: &'a IdentityGraph,
}

/// Build the displayable friend list, one entry per identity, current user excluded.
pub fn reconcile_friends(session: &Session, sources: FriendSources<'_>) -> Vec<FriendEntry> {
    let records: Vec<FriendEntry> = sources
        .remote
        .iter()
        .map(|friend| (friend, FriendOrigin::Remote))
        .chain(sources.imported.iter().map(|friend| (friend, FriendOrigin::Imported)))
        .filter(|(friend, _)| !is_current_user(friend, session))
        .map(|(friend, origin)| FriendEntry {
            friend: friend.clone(),
            origin,
        })
        .collect();

    let mut graph = sources.identities.clone();
    for record in &records {
        graph.insert(record.friend.member_id);
        for alias in &record.friend.alias_member_ids {
            graph.union(record.friend.member_id, *alias);
        }
    }

    let covered: HashSet<MemberId> = records
        .iter()
        .map(|record| graph.canonical(record.friend.member_id))
        .collect();
    let me = graph.canonical(session.member_id);

    let mut buckets: BTreeMap<MemberId, Vec<FriendEntry>> = BTreeMap::new();
    for record in records {
        buckets
            .entry(graph.canonical(record.friend.member_id))
            .or_default()
            .push(record);
    }
    let merged: Vec<FriendEntry> = buckets.into_values().filter_map(merge_bucket).collect();

    let members: Vec<&Member> = sources
        .groups
        .iter()
        .flat_map(|group| &group.members)
        .collect();
    let mut group_entries: Vec<FriendEntry> = Vec::new();
    for member in &members {
        let canonical = graph.canonical(member.id);
        if member.id == session.member_id || canonical == me || covered.contains(&canonical) {
            continue;
        }
        match group_entries
            .iter_mut()
            .find(|entry| entry.friend.member_id == canonical)
        {
            Some(entry) => {
                let aliases = &mut entry.friend.alias_member_ids;
                if member.id != canonical && !aliases.contains(&member.id) {
                    aliases.push(member.id);
                    aliases.sort();
                }
            }
            None => {
                let name = members
                    .iter()
                    .find(|other| other.id == canonical)
                    .unwrap_or(member)
                    .name
                    .clone();
                let mut friend = AccountFriend::named(canonical, name);
                if member.id != canonical {
                    friend.alias_member_ids.push(member.id);
                }
                group_entries.push(FriendEntry {
                    friend,
                    origin: FriendOrigin::Group,
                });
            }
        }
    }

    let mut entries: Vec<FriendEntry> = Vec::with_capacity(merged.len() + group_entries.len());
    for record in merged {
        let duplicate_of = if record.friend.has_linked_account {
            None
        } else {
            group_entries
                .iter()
                .position(|entry| is_textual_duplicate(entry, &record.friend))
        };
        match duplicate_of.and_then(|index| group_entries.get_mut(index)) {
            Some(entry) => {
                debug!(
                    kept = %entry.friend.member_id,
                    suppressed = %record.friend.member_id,
                    "folded unlinked remote friend into group member"
                );
                absorb(entry, record);
            }
            None => entries.push(record),
        }
    }
    entries.extend(group_entries);

    entries.sort_by(|a, b| {
        a.friend
            .display_name()
            .to_lowercase()
            .cmp(&b.friend.display_name().to_lowercase())
            .then(a.friend.member_id.cmp(&b.friend.member_id))
    });
    entries
}

/// Entries that may be picked for a new direct expense.
pub fn selectable_direct_expense_friends(entries: &[FriendEntry]) -> Vec<FriendEntry> {
    entries
        .iter()
        .filter(|entry| !entry.is_group_only() && !entry.is_pending())
        .cloned()
        .collect()
}

/// Entries that belong in the remote friend store; group-only members stay local.
pub fn syncable_friends(entries: &[FriendEntry]) -> Vec<AccountFriend> {
    entries
        .iter()
        .filter(|entry| entry.origin != FriendOrigin::Group)
        .map(|entry| entry.friend.clone())
        .collect()
}

/// A group member whose name equals the record's name or nickname under another id.
fn is_textual_duplicate(group_entry: &FriendEntry, record: &AccountFriend) -> bool {
    group_entry.friend.member_id != record.member_id
        && (same_text(&group_entry.friend.name, &record.name)
            || record
                .nickname
                .as_deref()
                .is_some_and(|nickname| same_text(&group_entry.friend.name, nickname)))
}

fn is_current_user(friend: &AccountFriend, session: &Session) -> bool {
    friend.identity_ids().any(|id| id == session.member_id)
        || friend.linked_account_id.as_deref() == Some(session.account_id.as_str())
}

/// Collapse records of one identity. A linked record wins, then remote over
/// imported, then one carrying a status, then the smallest member id.
fn merge_bucket(mut bucket: Vec<FriendEntry>) -> Option<FriendEntry> {
    bucket.sort_by_key(|entry| {
        (
            !entry.friend.has_linked_account,
            entry.origin != FriendOrigin::Remote,
            entry.friend.status.is_none(),
            entry.friend.member_id,
        )
    });
    let mut records = bucket.into_iter();
    let mut winner = records.next()?;
    for other in records {
        absorb(&mut winner, other);
    }
    Some(winner)
}

fn absorb(into: &mut FriendEntry, other: FriendEntry) {
    let target = &mut into.friend;
    for id in other.friend.identity_ids() {
        if id != target.member_id && !target.alias_member_ids.contains(&id) {
            target.alias_member_ids.push(id);
        }
    }
    target.alias_member_ids.sort();
    if target.nickname.is_none() {
        target.nickname = other.friend.nickname;
    }
    if target.status.is_none() {
        target.status = other.friend.status;
    }
    if into.origin == FriendOrigin::Group
        || (into.origin == FriendOrigin::Imported && other.origin == FriendOrigin::Remote)
    {
        into.origin = other.origin;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::schemas::FriendStatus;

    fn id(n: u128) -> MemberId {
        Uuid::from_u128(n)
    }

    fn session() -> Session {
        Session {
            account_id: "acct-me".to_owned(),
            email: "me@example.com".to_owned(),
            member_id: id(100),
            name: "Me".to_owned(),
        }
    }

    fn group(members: &[(u128, &str)]) -> SpendingGroup {
        SpendingGroup {
            id: Uuid::new_v4(),
            name: "G".to_owned(),
            members: members
                .iter()
                .map(|&(n, name)| Member::new(id(n), name))
                .collect(),
            created_at: Utc::now(),
            is_direct: None,
        }
    }

    fn linked(n: u128, name: &str, account: &str) -> AccountFriend {
        AccountFriend {
            has_linked_account: true,
            linked_account_id: Some(account.to_owned()),
            linked_account_email: Some(format!("{account}@example.com")),
            status: Some(FriendStatus::Accepted),
            ..AccountFriend::named(id(n), name)
        }
    }

    fn reconcile(
        groups: &[SpendingGroup],
        remote: &[AccountFriend],
        imported: &[AccountFriend],
    ) -> Vec<FriendEntry> {
        reconcile_friends(
            &session(),
            FriendSources {
                groups,
                remote,
                imported,
                identities: &IdentityGraph::new(),
            },
        )
    }

    fn assert_no_equivalent_entries(entries: &[FriendEntry]) {
        for (index, entry) in entries.iter().enumerate() {
            for other in entries.iter().skip(index + 1) {
                let overlap = entry
                    .friend
                    .identity_ids()
                    .any(|id| other.friend.identity_ids().any(|o| o == id));
                assert!(!overlap, "{entry:?} and {other:?} are the same person");
            }
        }
    }

    #[test]
    fn overlapping_aliases_collapse_and_linked_record_wins() {
        let mut unlinked = AccountFriend::named(id(1), "Alice");
        unlinked.alias_member_ids = vec![id(2)];
        let mut link = linked(3, "Alice Liddell", "acct-alice");
        link.alias_member_ids = vec![id(2)];

        let entries = reconcile(&[], &[unlinked, link], &[]);
        assert_eq!(entries.len(), 1);
        let friend = &entries[0].friend;
        assert_eq!(friend.member_id, id(3));
        assert!(friend.has_linked_account);
        assert_eq!(friend.alias_member_ids, vec![id(1), id(2)]);
        assert_no_equivalent_entries(&entries);
    }

    #[test]
    fn unlinked_remote_duplicate_folds_into_group_member() {
        let groups = [group(&[(100, "Me"), (5, "Bob")])];
        let mut remote = AccountFriend::named(id(9), "bob");
        remote.status = Some(FriendStatus::Accepted);

        let entries = reconcile(&groups, &[remote], &[]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].friend.member_id, id(5));
        assert_eq!(entries[0].friend.alias_member_ids, vec![id(9)]);
        assert_eq!(entries[0].origin, FriendOrigin::Remote);
    }

    #[test]
    fn nickname_match_also_folds() {
        let groups = [group(&[(5, "Bobby")])];
        let mut remote = AccountFriend::named(id(9), "Robert");
        remote.nickname = Some("bobby".to_owned());
        let entries = reconcile(&groups, &[remote], &[]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].friend.member_id, id(5));
    }

    #[test]
    fn linked_remote_duplicate_is_kept_next_to_group_member() {
        let groups = [group(&[(5, "Bob")])];
        let entries = reconcile(&groups, &[linked(9, "Bob", "acct-bob")], &[]);
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .any(|e| e.friend.member_id == id(9) && e.friend.has_linked_account));
        assert!(entries.iter().any(|e| e.friend.member_id == id(5)));
    }

    #[test]
    fn current_user_never_appears() {
        let groups = [group(&[(100, "Me"), (5, "Bob")])];
        let mut me_alias = AccountFriend::named(id(77), "Me Too");
        me_alias.alias_member_ids = vec![id(100)];
        let me_linked = linked(78, "Myself", "acct-me");
        let entries = reconcile(&groups, &[me_alias, me_linked], &[]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].friend.member_id, id(5));
    }

    #[test]
    fn entries_are_sorted_by_display_name() {
        let groups = [group(&[(1, "charlie"), (2, "Alice"), (3, "bob")])];
        let entries = reconcile(&groups, &[], &[]);
        let names: Vec<&str> = entries.iter().map(|e| e.friend.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "bob", "charlie"]);
    }

    #[test]
    fn selectable_friends_skip_group_only_and_pending() {
        let groups = [group(&[(1, "Group Only")])];
        let mut pending = AccountFriend::named(id(2), "Pending");
        pending.status = Some(FriendStatus::RequestSent);
        let accepted = linked(3, "Linked", "acct-3");
        let imported = AccountFriend::named(id(4), "Imported");

        let entries = reconcile(&groups, &[pending, accepted], &[imported]);
        assert_eq!(entries.len(), 4);
        let selectable: Vec<MemberId> = selectable_direct_expense_friends(&entries)
            .iter()
            .map(|e| e.friend.member_id)
            .collect();
        assert_eq!(selectable, vec![id(4), id(3)]);
    }

    #[test]
    fn group_only_members_are_never_synced() {
        let groups = [group(&[(1, "Local"), (2, "Tracked")])];
        let remote = AccountFriend::named(id(2), "Tracked");
        let entries = reconcile(&groups, &[remote], &[AccountFriend::named(id(3), "Mine")]);
        let synced: Vec<MemberId> = syncable_friends(&entries)
            .iter()
            .map(|f| f.member_id)
            .collect();
        assert_eq!(synced, vec![id(3), id(2)]);
    }

    #[test]
    fn aliases_learned_in_one_group_hold_in_every_group() {
        let groups = [
            group(&[(100, "Me"), (10, "Alice"), (11, "alice")]),
            group(&[(100, "Me"), (11, "Alice"), (12, "Bob")]),
        ];
        let mut identities = IdentityGraph::new();
        identities.union(id(10), id(11));

        let entries = reconcile_friends(
            &session(),
            FriendSources {
                groups: &groups,
                remote: &[],
                imported: &[],
                identities: &identities,
            },
        );

        let ids: Vec<MemberId> = entries.iter().map(|e| e.friend.member_id).collect();
        assert_eq!(ids, vec![id(10), id(12)]);
        assert_eq!(entries[0].friend.name, "Alice");
        assert_eq!(entries[0].friend.alias_member_ids, vec![id(11)]);
        assert_no_equivalent_entries(&entries);
    }

    #[test]
    fn remote_record_under_an_alias_covers_the_group_member() {
        let groups = [group(&[(10, "Alice"), (11, "Alice")])];
        let mut identities = IdentityGraph::new();
        identities.union(id(10), id(11));
        let remote = [linked(11, "Alice", "acct-alice")];

        let entries = reconcile_friends(
            &session(),
            FriendSources {
                groups: &groups,
                remote: &remote,
                imported: &[],
                identities: &identities,
            },
        );

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].friend.member_id, id(11));
        assert!(entries[0].friend.has_linked_account);
    }

    #[test]
    fn imported_and_remote_copies_of_one_friend_collapse() {
        let remote = AccountFriend::named(id(2), "Dup");
        let imported = AccountFriend::named(id(2), "Dup");
        let entries = reconcile(&[], &[remote], &[imported]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin, FriendOrigin::Remote);
        assert!(entries[0].friend.alias_member_ids.is_empty());
    }
}
