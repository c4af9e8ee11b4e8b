use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MemberId = Uuid;
pub type GroupId = Uuid;
pub type ExpenseId = Uuid;
pub type AccountId = String;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
}

impl Member {
    pub fn new(id: MemberId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingGroup {
    pub id: GroupId,
    pub name: String,
    pub members: Vec<Member>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_direct: Option<bool>,
}

impl SpendingGroup {
    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|member| member.id == id)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseSplit {
    pub member_id: MemberId,
    pub amount: f64,
    #[serde(default)]
    pub is_settled: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: ExpenseId,
    pub group_id: GroupId,
    pub description: String,
    pub date: DateTime<Utc>,
    pub total_amount: f64,
    pub paid_by_member_id: MemberId,
    pub involved_member_ids: Vec<MemberId>,
    pub splits: Vec<ExpenseSplit>,
    #[serde(default)]
    pub is_settled: bool,
    /// Display names the writer of this expense knew for each participant.
    #[serde(default)]
    pub participant_names: BTreeMap<MemberId, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendStatus {
    Accepted,
    RequestSent,
    RequestReceived,
}

impl FriendStatus {
    /// A link request is still in flight for this friend.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::RequestSent | Self::RequestReceived)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountFriend {
    pub member_id: MemberId,
    pub name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub has_linked_account: bool,
    #[serde(default)]
    pub linked_account_id: Option<AccountId>,
    #[serde(default)]
    pub linked_account_email: Option<String>,
    #[serde(default)]
    pub alias_member_ids: Vec<MemberId>,
    #[serde(default)]
    pub status: Option<FriendStatus>,
}

impl AccountFriend {
    /// An unlinked friend with no status and no aliases.
    pub fn named(member_id: MemberId, name: impl Into<String>) -> Self {
        Self {
            member_id,
            name: name.into(),
            nickname: None,
            has_linked_account: false,
            linked_account_id: None,
            linked_account_email: None,
            alias_member_ids: Vec::new(),
            status: None,
        }
    }

    pub fn display_name(&self) -> &str {
        match self.nickname.as_deref().map(str::trim) {
            Some(nickname) if !nickname.is_empty() => nickname,
            _ => &self.name,
        }
    }

    /// The friend's own id followed by every declared alias.
    pub fn identity_ids(&self) -> impl Iterator<Item = MemberId> + '_ {
        std::iter::once(self.member_id).chain(self.alias_member_ids.iter().copied())
    }
}

/// The signed-in user.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub account_id: AccountId,
    pub email: String,
    /// The user's real member id; always the canonical id of their aliases.
    pub member_id: MemberId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    pub id: Uuid,
    pub requester_id: AccountId,
    pub requester_email: String,
    pub requester_name: String,
    pub recipient_email: String,
    pub target_member_id: MemberId,
    pub target_member_name: String,
    pub status: LinkRequestStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
}

impl LinkRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteToken {
    pub id: Uuid,
    pub creator_id: AccountId,
    pub creator_email: String,
    pub target_member_id: MemberId,
    pub target_member_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_by: Option<AccountId>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl InviteToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }
}

/// What a successful claim or accepted link request binds together.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkClaim {
    pub linked_member_id: MemberId,
    pub linked_account_id: AccountId,
    pub linked_account_email: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkFailureRecord {
    pub member_id: MemberId,
    pub account_id: AccountId,
    pub account_email: String,
    pub reason: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// What the local cache holds between runs.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct CacheSnapshot {
    pub groups: Vec<SpendingGroup>,
    pub expenses: Vec<Expense>,
}
