//! Keeps cached link status in line with the remote friend store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mockable::Clock;

use crate::schemas::{AccountFriend, MemberId};

pub struct LinkStateReconciler {
    clock: Arc<dyn Clock>,
    debounce: Duration,
    last_run: Option<DateTime<Utc>>,
}

impl LinkStateReconciler {
    pub fn new(clock: Arc<dyn Clock>, debounce: Duration) -> Self {
        Self {
            clock,
            debounce,
            last_run: None,
        }
    }

    /// False while the previous run is younger than the debounce window.
    pub fn should_reconcile(&self) -> bool {
        match self.last_run {
            Some(last_run) => self.clock.utc() - last_run >= self.debounce,
            None => true,
        }
    }

    pub fn invalidate(&mut self) {
        self.last_run = None;
    }

    /// Overlay remote link fields onto the local list.
    ///
    /// For a `member_id` known on both sides the remote link fields win and the
    /// rest of the local record is kept. Entries known to one side only are kept
    /// as they are. The result is sorted by name.
    pub fn reconcile(
        &mut self,
        local: &[AccountFriend],
        remote: &[AccountFriend],
    ) -> Vec<AccountFriend> {
        self.last_run = Some(self.clock.utc());

        let mut merged: BTreeMap<MemberId, AccountFriend> = local
            .iter()
            .map(|friend| (friend.member_id, friend.clone()))
            .collect();
        for theirs in remote {
            merged
                .entry(theirs.member_id)
                .and_modify(|ours| {
                    ours.has_linked_account = theirs.has_linked_account;
                    ours.linked_account_id = theirs.linked_account_id.clone();
                    ours.linked_account_email = theirs.linked_account_email.clone();
                })
                .or_insert_with(|| theirs.clone());
        }

        let mut friends: Vec<AccountFriend> = merged.into_values().collect();
        friends.sort_by(|a, b| a.name.cmp(&b.name).then(a.member_id.cmp(&b.member_id)));
        friends
    }
}

/// True iff `member_id` is a friend linked to exactly `account_id`.
pub fn validate_link_completion(
    member_id: MemberId,
    account_id: &str,
    friends: &[AccountFriend],
) -> bool {
    friends.iter().any(|friend| {
        friend.member_id == member_id
            && friend.has_linked_account
            && friend.linked_account_id.as_deref() == Some(account_id)
    })
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::test_support::ManualClock;

    fn id(n: u128) -> MemberId {
        Uuid::from_u128(n)
    }

    fn linked(n: u128, name: &str, account: &str) -> AccountFriend {
        AccountFriend {
            has_linked_account: true,
            linked_account_id: Some(account.to_owned()),
            linked_account_email: Some(format!("{account}@example.com")),
            ..AccountFriend::named(id(n), name)
        }
    }

    #[test]
    fn debounce_skips_until_window_passes() {
        let clock = ManualClock::shared();
        let mut reconciler = LinkStateReconciler::new(clock.clone(), Duration::seconds(30));
        assert!(reconciler.should_reconcile());

        reconciler.reconcile(&[], &[]);
        assert!(!reconciler.should_reconcile());

        clock.advance(Duration::seconds(29));
        assert!(!reconciler.should_reconcile());
        clock.advance(Duration::seconds(1));
        assert!(reconciler.should_reconcile());
    }

    #[test]
    fn invalidate_resets_the_debounce() {
        let clock = ManualClock::shared();
        let mut reconciler = LinkStateReconciler::new(clock, Duration::seconds(30));
        reconciler.reconcile(&[], &[]);
        reconciler.invalidate();
        assert!(reconciler.should_reconcile());
    }

    #[test]
    fn remote_link_fields_overwrite_local_ones() {
        let mut reconciler = LinkStateReconciler::new(ManualClock::shared(), Duration::zero());
        let mut local = AccountFriend::named(id(1), "Zed");
        local.nickname = Some("Z".to_owned());
        let remote = linked(1, "Zed (remote)", "acct-z");
        let local_only = AccountFriend::named(id(2), "Amy");
        let remote_only = linked(3, "Moe", "acct-m");

        let friends = reconciler.reconcile(&[local, local_only], &[remote, remote_only]);
        let names: Vec<&str> = friends.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Amy", "Moe", "Zed"]);

        let zed = &friends[2];
        assert!(zed.has_linked_account);
        assert_eq!(zed.linked_account_id.as_deref(), Some("acct-z"));
        assert_eq!(zed.nickname.as_deref(), Some("Z"));
    }

    #[test]
    fn remote_unlink_is_propagated() {
        let mut reconciler = LinkStateReconciler::new(ManualClock::shared(), Duration::zero());
        let local = linked(1, "Zed", "acct-z");
        let remote = AccountFriend::named(id(1), "Zed");
        let friends = reconciler.reconcile(&[local], &[remote]);
        assert!(!friends[0].has_linked_account);
        assert_eq!(friends[0].linked_account_id, None);
    }

    #[test]
    fn link_completion_requires_matching_account() {
        let friends = [linked(1, "Zed", "acct-z"), AccountFriend::named(id(2), "Amy")];
        assert!(validate_link_completion(id(1), "acct-z", &friends));
        assert!(!validate_link_completion(id(1), "acct-other", &friends));
        assert!(!validate_link_completion(id(2), "acct-z", &friends));
        assert!(!validate_link_completion(id(3), "acct-z", &friends));
    }
}
