//! In-memory stores. Every conditional write happens under one lock, which is
//! enough for a single process and gives tests the same semantics as the
//! MongoDB adapters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    is_legacy_mock, AccountStore, ExpenseStore, GroupStore, InviteStore, LinkRequestStore,
    LocalCache,
};
use crate::accounts::normalize_email;
use crate::error::SyncError;
use crate::schemas::{
    Account, AccountFriend, CacheSnapshot, Expense, ExpenseId, GroupId, InviteToken, LinkClaim,
    LinkRequest, LinkRequestStatus, Member, SpendingGroup,
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared switch that makes a fake behave like an unreachable backend.
#[derive(Default)]
struct Reachability(AtomicBool);

impl Reachability {
    fn check(&self) -> Result<(), SyncError> {
        if self.0.load(Ordering::SeqCst) {
            Err(SyncError::Network("store unreachable".to_owned()))
        } else {
            Ok(())
        }
    }

    fn set_offline(&self, offline: bool) {
        self.0.store(offline, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MemoryGroupStore {
    groups: Mutex<Vec<SpendingGroup>>,
    reachability: Reachability,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: Vec<SpendingGroup>) -> Self {
        Self {
            groups: Mutex::new(groups),
            reachability: Reachability::default(),
        }
    }

    pub fn groups(&self) -> Vec<SpendingGroup> {
        locked(&self.groups).clone()
    }

    pub fn set_offline(&self, offline: bool) {
        self.reachability.set_offline(offline);
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn fetch_groups(&self) -> Result<Vec<SpendingGroup>, SyncError> {
        self.reachability.check()?;
        Ok(self.groups())
    }

    async fn upsert_group(&self, group: &SpendingGroup) -> Result<(), SyncError> {
        self.reachability.check()?;
        let mut groups = locked(&self.groups);
        match groups.iter_mut().find(|existing| existing.id == group.id) {
            Some(existing) => *existing = group.clone(),
            None => groups.push(group.clone()),
        }
        Ok(())
    }

    async fn delete_groups(&self, ids: &[GroupId]) -> Result<(), SyncError> {
        self.reachability.check()?;
        locked(&self.groups).retain(|group| !ids.contains(&group.id));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryExpenseStore {
    expenses: Mutex<Vec<Expense>>,
    reachability: Reachability,
}

impl MemoryExpenseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expenses(expenses: Vec<Expense>) -> Self {
        Self {
            expenses: Mutex::new(expenses),
            reachability: Reachability::default(),
        }
    }

    pub fn expenses(&self) -> Vec<Expense> {
        locked(&self.expenses).clone()
    }

    pub fn set_offline(&self, offline: bool) {
        self.reachability.set_offline(offline);
    }
}

#[async_trait]
impl ExpenseStore for MemoryExpenseStore {
    async fn fetch_expenses(&self) -> Result<Vec<Expense>, SyncError> {
        self.reachability.check()?;
        Ok(self.expenses())
    }

    async fn upsert_expense(
        &self,
        expense: &Expense,
        participants: &[Member],
    ) -> Result<(), SyncError> {
        self.reachability.check()?;
        let mut stored = expense.clone();
        for participant in participants {
            stored
                .participant_names
                .insert(participant.id, participant.name.clone());
        }
        let mut expenses = locked(&self.expenses);
        match expenses.iter_mut().find(|existing| existing.id == expense.id) {
            Some(existing) => *existing = stored,
            None => expenses.push(stored),
        }
        Ok(())
    }

    async fn delete_expense(&self, id: ExpenseId) -> Result<(), SyncError> {
        self.reachability.check()?;
        locked(&self.expenses).retain(|expense| expense.id != id);
        Ok(())
    }

    async fn clear_legacy_mock_expenses(&self) -> Result<u64, SyncError> {
        self.reachability.check()?;
        let mut expenses = locked(&self.expenses);
        let before = expenses.len();
        expenses.retain(|expense| !is_legacy_mock(expense));
        Ok((before - expenses.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<BTreeMap<String, Account>>,
    friends: Mutex<BTreeMap<String, Vec<AccountFriend>>>,
    friend_syncs: AtomicUsize,
    reachability: Reachability,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the remote friend list of `account_email`.
    pub fn put_friends(&self, account_email: &str, friends: Vec<AccountFriend>) {
        locked(&self.friends).insert(account_email.trim().to_lowercase(), friends);
    }

    pub fn friends_of(&self, account_email: &str) -> Vec<AccountFriend> {
        locked(&self.friends)
            .get(&account_email.trim().to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `sync_friends` calls that reached the store.
    pub fn friend_syncs(&self) -> usize {
        self.friend_syncs.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.reachability.set_offline(offline);
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn create_account(&self, email: &str, display_name: &str) -> Result<Account, SyncError> {
        self.reachability.check()?;
        let email = normalize_email(email)?;
        let mut accounts = locked(&self.accounts);
        if accounts.contains_key(&email) {
            return Err(SyncError::AccountDuplicate(email));
        }
        let account = Account {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            display_name: display_name.to_owned(),
            created_at: Utc::now(),
        };
        accounts.insert(email, account.clone());
        Ok(account)
    }

    async fn lookup_account(&self, email: &str) -> Result<Account, SyncError> {
        self.reachability.check()?;
        let email = normalize_email(email)?;
        locked(&self.accounts)
            .get(&email)
            .cloned()
            .ok_or(SyncError::AccountNotFound(email))
    }

    async fn sync_friends(
        &self,
        account_email: &str,
        friends: &[AccountFriend],
    ) -> Result<(), SyncError> {
        self.reachability.check()?;
        let email = normalize_email(account_email)?;
        locked(&self.friends).insert(email, friends.to_vec());
        self.friend_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_friends(&self, account_email: &str) -> Result<Vec<AccountFriend>, SyncError> {
        self.reachability.check()?;
        let email = normalize_email(account_email)?;
        Ok(locked(&self.friends).get(&email).cloned().unwrap_or_default())
    }

    async fn update_friend_link_status(
        &self,
        account_email: &str,
        claim: &LinkClaim,
    ) -> Result<(), SyncError> {
        self.reachability.check()?;
        let email = normalize_email(account_email)?;
        let mut friends = locked(&self.friends);
        let list = friends.entry(email).or_default();
        if let Some(friend) = list
            .iter_mut()
            .find(|friend| friend.member_id == claim.linked_member_id)
        {
            friend.has_linked_account = true;
            friend.linked_account_id = Some(claim.linked_account_id.clone());
            friend.linked_account_email = Some(claim.linked_account_email.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryInviteStore {
    tokens: Mutex<HashMap<Uuid, InviteToken>>,
}

impl MemoryInviteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InviteStore for MemoryInviteStore {
    async fn insert_invite(&self, token: &InviteToken) -> Result<(), SyncError> {
        locked(&self.tokens).insert(token.id, token.clone());
        Ok(())
    }

    async fn find_invite(&self, id: Uuid) -> Result<Option<InviteToken>, SyncError> {
        Ok(locked(&self.tokens).get(&id).cloned())
    }

    async fn claim_invite(
        &self,
        id: Uuid,
        claimer: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InviteToken>, SyncError> {
        let mut tokens = locked(&self.tokens);
        match tokens.get_mut(&id) {
            Some(token) if !token.is_claimed() && !token.is_expired(now) => {
                token.claimed_by = Some(claimer.to_owned());
                token.claimed_at = Some(now);
                Ok(Some(token.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn active_invites(
        &self,
        creator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<InviteToken>, SyncError> {
        let mut active: Vec<InviteToken> = locked(&self.tokens)
            .values()
            .filter(|token| {
                token.creator_id == creator_id && !token.is_claimed() && !token.is_expired(now)
            })
            .cloned()
            .collect();
        active.sort_by_key(|token| token.created_at);
        Ok(active)
    }

    async fn delete_invite(&self, id: Uuid) -> Result<bool, SyncError> {
        Ok(locked(&self.tokens).remove(&id).is_some())
    }
}

#[derive(Default)]
pub struct MemoryLinkRequestStore {
    requests: Mutex<HashMap<Uuid, LinkRequest>>,
}

impl MemoryLinkRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LinkRequestStore for MemoryLinkRequestStore {
    async fn insert_request(&self, request: &LinkRequest) -> Result<(), SyncError> {
        locked(&self.requests).insert(request.id, request.clone());
        Ok(())
    }

    async fn find_request(&self, id: Uuid) -> Result<Option<LinkRequest>, SyncError> {
        Ok(locked(&self.requests).get(&id).cloned())
    }

    async fn resolve_request(
        &self,
        id: Uuid,
        status: LinkRequestStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<LinkRequest>, SyncError> {
        let mut requests = locked(&self.requests);
        match requests.get_mut(&id) {
            Some(request) if request.status == LinkRequestStatus::Pending => {
                request.status = status;
                if status == LinkRequestStatus::Rejected {
                    request.rejected_at = Some(at);
                }
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_request(&self, id: Uuid) -> Result<bool, SyncError> {
        Ok(locked(&self.requests).remove(&id).is_some())
    }

    async fn requests_for_recipient(&self, email: &str) -> Result<Vec<LinkRequest>, SyncError> {
        let email = email.trim().to_lowercase();
        let mut found: Vec<LinkRequest> = locked(&self.requests)
            .values()
            .filter(|request| request.recipient_email == email)
            .cloned()
            .collect();
        found.sort_by_key(|request| request.created_at);
        Ok(found)
    }

    async fn requests_from(&self, requester_id: &str) -> Result<Vec<LinkRequest>, SyncError> {
        let mut found: Vec<LinkRequest> = locked(&self.requests)
            .values()
            .filter(|request| request.requester_id == requester_id)
            .cloned()
            .collect();
        found.sort_by_key(|request| request.created_at);
        Ok(found)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    snapshot: Mutex<Option<CacheSnapshot>>,
    saves: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Option<CacheSnapshot> {
        locked(&self.snapshot).clone()
    }
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn load(&self) -> Result<CacheSnapshot, SyncError> {
        Ok(self.stored().unwrap_or_default())
    }

    async fn save(&self, snapshot: &CacheSnapshot) -> Result<(), SyncError> {
        *locked(&self.snapshot) = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        *locked(&self.snapshot) = None;
        Ok(())
    }
}
