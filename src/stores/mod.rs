//! Collaborator contracts consumed by the reconciliation core.
//!
//! Every store has an in-memory implementation (`memory`) used by tests and
//! local runs, and a MongoDB implementation (`mongo`) used by the server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SyncError;
use crate::schemas::{
    Account, AccountFriend, CacheSnapshot, Expense, ExpenseId, GroupId, InviteToken, LinkClaim,
    LinkRequest, LinkRequestStatus, Member, SpendingGroup,
};

pub mod memory;
pub mod mongo;

/// Description prefix the old demo seeder stamped on generated expenses.
pub const LEGACY_MOCK_PREFIX: &str = "[mock]";

pub fn is_legacy_mock(expense: &Expense) -> bool {
    expense
        .description
        .get(..LEGACY_MOCK_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(LEGACY_MOCK_PREFIX))
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn fetch_groups(&self) -> Result<Vec<SpendingGroup>, SyncError>;
    async fn upsert_group(&self, group: &SpendingGroup) -> Result<(), SyncError>;
    async fn delete_groups(&self, ids: &[GroupId]) -> Result<(), SyncError>;
}

#[async_trait]
pub trait ExpenseStore: Send + Sync {
    async fn fetch_expenses(&self) -> Result<Vec<Expense>, SyncError>;
    /// `participants` supplies the display names stored alongside the expense.
    async fn upsert_expense(
        &self,
        expense: &Expense,
        participants: &[Member],
    ) -> Result<(), SyncError>;
    async fn delete_expense(&self, id: ExpenseId) -> Result<(), SyncError>;
    /// Returns how many legacy mock expenses were removed.
    async fn clear_legacy_mock_expenses(&self) -> Result<u64, SyncError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with `AccountDuplicate` when the normalized email is taken.
    async fn create_account(&self, email: &str, display_name: &str) -> Result<Account, SyncError>;
    /// Fails with `AccountNotFound` when nobody registered the normalized email.
    async fn lookup_account(&self, email: &str) -> Result<Account, SyncError>;
    /// Replaces the whole friend list stored for `account_email`.
    async fn sync_friends(
        &self,
        account_email: &str,
        friends: &[AccountFriend],
    ) -> Result<(), SyncError>;
    async fn fetch_friends(&self, account_email: &str) -> Result<Vec<AccountFriend>, SyncError>;
    /// Mark the friend `claim.linked_member_id` of `account_email` as linked.
    async fn update_friend_link_status(
        &self,
        account_email: &str,
        claim: &LinkClaim,
    ) -> Result<(), SyncError>;
}

#[async_trait]
pub trait InviteStore: Send + Sync {
    async fn insert_invite(&self, token: &InviteToken) -> Result<(), SyncError>;
    async fn find_invite(&self, id: Uuid) -> Result<Option<InviteToken>, SyncError>;
    /// Atomic compare-and-set: binds the token to `claimer` only if it is still
    /// unclaimed and unexpired at `now`. `None` means the condition failed.
    async fn claim_invite(
        &self,
        id: Uuid,
        claimer: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InviteToken>, SyncError>;
    /// Unclaimed, unexpired tokens minted by `creator_id`.
    async fn active_invites(
        &self,
        creator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<InviteToken>, SyncError>;
    /// Returns whether a token was removed.
    async fn delete_invite(&self, id: Uuid) -> Result<bool, SyncError>;
}

#[async_trait]
pub trait LinkRequestStore: Send + Sync {
    async fn insert_request(&self, request: &LinkRequest) -> Result<(), SyncError>;
    async fn find_request(&self, id: Uuid) -> Result<Option<LinkRequest>, SyncError>;
    /// Moves a pending request to `status`; `None` when it was no longer pending.
    async fn resolve_request(
        &self,
        id: Uuid,
        status: LinkRequestStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<LinkRequest>, SyncError>;
    async fn delete_request(&self, id: Uuid) -> Result<bool, SyncError>;
    async fn requests_for_recipient(&self, email: &str) -> Result<Vec<LinkRequest>, SyncError>;
    async fn requests_from(&self, requester_id: &str) -> Result<Vec<LinkRequest>, SyncError>;
}

#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn load(&self) -> Result<CacheSnapshot, SyncError>;
    async fn save(&self, snapshot: &CacheSnapshot) -> Result<(), SyncError>;
    async fn clear(&self) -> Result<(), SyncError>;
}
