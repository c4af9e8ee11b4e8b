//! MongoDB-backed stores.
//!
//! Reads go through permissive document types: a record missing a required
//! field is dropped and logged, and an id that is not a UUID is replaced with a
//! UUID v5 of the raw string so the same bad record always maps to the same id.
//! Group and expense documents carry an `ownerId` so one database can serve
//! many accounts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, IndexOptions, ReplaceOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AccountStore, ExpenseStore, GroupStore, InviteStore, LinkRequestStore};
use crate::accounts::normalize_email;
use crate::error::SyncError;
use crate::schemas::{
    Account, AccountFriend, AccountId, Expense, ExpenseId, ExpenseSplit, FriendStatus, GroupId,
    InviteToken, LinkClaim, LinkRequest, LinkRequestStatus, Member, SpendingGroup,
};

const GROUPS: &str = "Groups";
const EXPENSES: &str = "Expenses";
const ACCOUNTS: &str = "Accounts";
const FRIENDS: &str = "Friends";
const INVITES: &str = "Invites";
const LINK_REQUESTS: &str = "LinkRequests";

const DUPLICATE_KEY: i32 = 11000;

impl From<mongodb::error::Error> for SyncError {
    fn from(err: mongodb::error::Error) -> Self {
        match *err.kind {
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. } => SyncError::Network(err.to_string()),
            _ => SyncError::underlying(err),
        }
    }
}

impl From<bson::ser::Error> for SyncError {
    fn from(err: bson::ser::Error) -> Self {
        SyncError::underlying(err)
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Parse a stored id, falling back to a stable UUID derived from the raw text.
pub fn parse_id(raw: &str) -> Uuid {
    Uuid::parse_str(raw.trim()).unwrap_or_else(|_| {
        debug!(raw, "stored id is not a uuid; deriving one");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes())
    })
}

fn to_bson_time(time: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(time)
}

/// Decode every document that parses, logging and dropping the rest.
fn decode_batch<D, T>(
    collection: &str,
    documents: Vec<Document>,
    convert: impl Fn(D) -> Option<T>,
) -> Vec<T>
where
    D: DeserializeOwned,
{
    let total = documents.len();
    let decoded: Vec<T> = documents
        .into_iter()
        .filter_map(|document| match bson::from_document::<D>(document) {
            Ok(parsed) => convert(parsed),
            Err(err) => {
                warn!(collection, error = %err, "undecodable document");
                None
            }
        })
        .collect();
    if decoded.len() < total {
        warn!(collection, dropped = total - decoded.len(), "dropped malformed records");
    }
    decoded
}

async fn find_all(
    collection: &Collection<Document>,
    filter: Document,
) -> Result<Vec<Document>, SyncError> {
    let cursor = collection.find(filter, None).await?;
    Ok(cursor.try_collect().await?)
}

/// Create the unique indexes the conditional writes rely on.
pub async fn ensure_indexes(db: &Database) -> Result<(), SyncError> {
    let unique = |keys: Document| {
        IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build()
    };
    db.collection::<Document>(ACCOUNTS)
        .create_index(unique(doc! { "email": 1 }), None)
        .await?;
    db.collection::<Document>(INVITES)
        .create_index(unique(doc! { "id": 1 }), None)
        .await?;
    db.collection::<Document>(LINK_REQUESTS)
        .create_index(unique(doc! { "id": 1 }), None)
        .await?;
    db.collection::<Document>(FRIENDS)
        .create_index(unique(doc! { "ownerEmail": 1, "memberId": 1 }), None)
        .await?;
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDocument {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDocument {
    pub id: Option<String>,
    pub owner_id: Option<String>,
    pub name: Option<String>,
    pub members: Option<Vec<MemberDocument>>,
    pub created_at: Option<bson::DateTime>,
    pub is_direct: Option<bool>,
}

impl GroupDocument {
    fn from_domain(owner_id: &str, group: &SpendingGroup) -> Self {
        Self {
            id: Some(group.id.to_string()),
            owner_id: Some(owner_id.to_owned()),
            name: Some(group.name.clone()),
            members: Some(
                group
                    .members
                    .iter()
                    .map(|member| MemberDocument {
                        id: Some(member.id.to_string()),
                        name: Some(member.name.clone()),
                    })
                    .collect(),
            ),
            created_at: Some(to_bson_time(group.created_at)),
            is_direct: group.is_direct,
        }
    }

    pub fn into_domain(self) -> Option<SpendingGroup> {
        let members = self
            .members?
            .into_iter()
            .filter_map(|member| Some(Member::new(parse_id(&member.id?), member.name?)))
            .collect();
        Some(SpendingGroup {
            id: parse_id(&self.id?),
            name: self.name?,
            members,
            created_at: self.created_at?.to_chrono(),
            is_direct: self.is_direct,
        })
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitDocument {
    pub member_id: Option<String>,
    pub amount: Option<f64>,
    pub is_settled: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseDocument {
    pub id: Option<String>,
    pub owner_id: Option<String>,
    pub group_id: Option<String>,
    pub description: Option<String>,
    pub date: Option<bson::DateTime>,
    pub total_amount: Option<f64>,
    pub paid_by_member_id: Option<String>,
    pub involved_member_ids: Option<Vec<String>>,
    pub splits: Option<Vec<SplitDocument>>,
    pub is_settled: Option<bool>,
    pub participant_names: Option<BTreeMap<String, String>>,
}

impl ExpenseDocument {
    fn from_domain(owner_id: &str, expense: &Expense) -> Self {
        Self {
            id: Some(expense.id.to_string()),
            owner_id: Some(owner_id.to_owned()),
            group_id: Some(expense.group_id.to_string()),
            description: Some(expense.description.clone()),
            date: Some(to_bson_time(expense.date)),
            total_amount: Some(expense.total_amount),
            paid_by_member_id: Some(expense.paid_by_member_id.to_string()),
            involved_member_ids: Some(
                expense
                    .involved_member_ids
                    .iter()
                    .map(Uuid::to_string)
                    .collect(),
            ),
            splits: Some(
                expense
                    .splits
                    .iter()
                    .map(|split| SplitDocument {
                        member_id: Some(split.member_id.to_string()),
                        amount: Some(split.amount),
                        is_settled: Some(split.is_settled),
                    })
                    .collect(),
            ),
            is_settled: Some(expense.is_settled),
            participant_names: Some(
                expense
                    .participant_names
                    .iter()
                    .map(|(id, name)| (id.to_string(), name.clone()))
                    .collect(),
            ),
        }
    }

    pub fn into_domain(self) -> Option<Expense> {
        let splits = self
            .splits
            .unwrap_or_default()
            .into_iter()
            .filter_map(|split| {
                Some(ExpenseSplit {
                    member_id: parse_id(&split.member_id?),
                    amount: split.amount?,
                    is_settled: split.is_settled.unwrap_or(false),
                })
            })
            .collect();
        Some(Expense {
            id: parse_id(&self.id?),
            group_id: parse_id(&self.group_id?),
            description: self.description.unwrap_or_default(),
            date: self.date?.to_chrono(),
            total_amount: self.total_amount?,
            paid_by_member_id: parse_id(&self.paid_by_member_id?),
            involved_member_ids: self
                .involved_member_ids
                .unwrap_or_default()
                .iter()
                .map(|id| parse_id(id))
                .collect(),
            splits,
            is_settled: self.is_settled.unwrap_or(false),
            participant_names: self
                .participant_names
                .unwrap_or_default()
                .into_iter()
                .map(|(id, name)| (parse_id(&id), name))
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountDocument {
    id: String,
    email: String,
    display_name: String,
    created_at: bson::DateTime,
}

impl From<AccountDocument> for Account {
    fn from(document: AccountDocument) -> Self {
        Self {
            id: document.id,
            email: document.email,
            display_name: document.display_name,
            created_at: document.created_at.to_chrono(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendDocument {
    pub owner_email: Option<String>,
    pub member_id: Option<String>,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub has_linked_account: Option<bool>,
    pub linked_account_id: Option<String>,
    pub linked_account_email: Option<String>,
    pub alias_member_ids: Option<Vec<String>>,
    pub status: Option<FriendStatus>,
}

impl FriendDocument {
    fn from_domain(owner_email: &str, friend: &AccountFriend) -> Self {
        Self {
            owner_email: Some(owner_email.to_owned()),
            member_id: Some(friend.member_id.to_string()),
            name: Some(friend.name.clone()),
            nickname: friend.nickname.clone(),
            has_linked_account: Some(friend.has_linked_account),
            linked_account_id: friend.linked_account_id.clone(),
            linked_account_email: friend.linked_account_email.clone(),
            alias_member_ids: Some(friend.alias_member_ids.iter().map(Uuid::to_string).collect()),
            status: friend.status,
        }
    }

    pub fn into_domain(self) -> Option<AccountFriend> {
        Some(AccountFriend {
            member_id: parse_id(&self.member_id?),
            name: self.name?,
            nickname: self.nickname,
            has_linked_account: self.has_linked_account.unwrap_or(false),
            linked_account_id: self.linked_account_id,
            linked_account_email: self.linked_account_email,
            alias_member_ids: self
                .alias_member_ids
                .unwrap_or_default()
                .iter()
                .map(|id| parse_id(id))
                .collect(),
            status: self.status,
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct InviteDocument {
    id: String,
    creator_id: String,
    creator_email: String,
    target_member_id: String,
    target_member_name: String,
    created_at: bson::DateTime,
    expires_at: bson::DateTime,
    claimed_by: Option<String>,
    claimed_at: Option<bson::DateTime>,
}

impl From<&InviteToken> for InviteDocument {
    fn from(token: &InviteToken) -> Self {
        Self {
            id: token.id.to_string(),
            creator_id: token.creator_id.clone(),
            creator_email: token.creator_email.clone(),
            target_member_id: token.target_member_id.to_string(),
            target_member_name: token.target_member_name.clone(),
            created_at: to_bson_time(token.created_at),
            expires_at: to_bson_time(token.expires_at),
            claimed_by: token.claimed_by.clone(),
            claimed_at: token.claimed_at.map(to_bson_time),
        }
    }
}

impl From<InviteDocument> for InviteToken {
    fn from(document: InviteDocument) -> Self {
        Self {
            id: parse_id(&document.id),
            creator_id: document.creator_id,
            creator_email: document.creator_email,
            target_member_id: parse_id(&document.target_member_id),
            target_member_name: document.target_member_name,
            created_at: document.created_at.to_chrono(),
            expires_at: document.expires_at.to_chrono(),
            claimed_by: document.claimed_by,
            claimed_at: document.claimed_at.map(bson::DateTime::to_chrono),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkRequestDocument {
    id: String,
    requester_id: String,
    requester_email: String,
    requester_name: String,
    recipient_email: String,
    target_member_id: String,
    target_member_name: String,
    status: LinkRequestStatus,
    created_at: bson::DateTime,
    expires_at: bson::DateTime,
    rejected_at: Option<bson::DateTime>,
}

impl From<&LinkRequest> for LinkRequestDocument {
    fn from(request: &LinkRequest) -> Self {
        Self {
            id: request.id.to_string(),
            requester_id: request.requester_id.clone(),
            requester_email: request.requester_email.clone(),
            requester_name: request.requester_name.clone(),
            recipient_email: request.recipient_email.clone(),
            target_member_id: request.target_member_id.to_string(),
            target_member_name: request.target_member_name.clone(),
            status: request.status,
            created_at: to_bson_time(request.created_at),
            expires_at: to_bson_time(request.expires_at),
            rejected_at: request.rejected_at.map(to_bson_time),
        }
    }
}

impl From<LinkRequestDocument> for LinkRequest {
    fn from(document: LinkRequestDocument) -> Self {
        Self {
            id: parse_id(&document.id),
            requester_id: document.requester_id,
            requester_email: document.requester_email,
            requester_name: document.requester_name,
            recipient_email: document.recipient_email,
            target_member_id: parse_id(&document.target_member_id),
            target_member_name: document.target_member_name,
            status: document.status,
            created_at: document.created_at.to_chrono(),
            expires_at: document.expires_at.to_chrono(),
            rejected_at: document.rejected_at.map(bson::DateTime::to_chrono),
        }
    }
}

fn upsert() -> ReplaceOptions {
    ReplaceOptions::builder().upsert(true).build()
}

fn status_name(status: LinkRequestStatus) -> &'static str {
    match status {
        LinkRequestStatus::Pending => "pending",
        LinkRequestStatus::Accepted => "accepted",
        LinkRequestStatus::Rejected => "rejected",
    }
}

pub struct MongoGroupStore {
    raw: Collection<Document>,
    typed: Collection<GroupDocument>,
    owner_id: AccountId,
}

impl MongoGroupStore {
    pub fn new(db: &Database, owner_id: impl Into<AccountId>) -> Self {
        let raw = db.collection::<Document>(GROUPS);
        Self {
            typed: raw.clone_with_type(),
            raw,
            owner_id: owner_id.into(),
        }
    }
}

#[async_trait]
impl GroupStore for MongoGroupStore {
    async fn fetch_groups(&self) -> Result<Vec<SpendingGroup>, SyncError> {
        let documents = find_all(&self.raw, doc! { "ownerId": &self.owner_id }).await?;
        Ok(decode_batch(GROUPS, documents, GroupDocument::into_domain))
    }

    async fn upsert_group(&self, group: &SpendingGroup) -> Result<(), SyncError> {
        let document = GroupDocument::from_domain(&self.owner_id, group);
        self.typed
            .replace_one(
                doc! { "id": group.id.to_string(), "ownerId": &self.owner_id },
                document,
                upsert(),
            )
            .await?;
        Ok(())
    }

    async fn delete_groups(&self, ids: &[GroupId]) -> Result<(), SyncError> {
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        self.raw
            .delete_many(doc! { "id": { "$in": ids }, "ownerId": &self.owner_id }, None)
            .await?;
        Ok(())
    }
}

pub struct MongoExpenseStore {
    raw: Collection<Document>,
    typed: Collection<ExpenseDocument>,
    owner_id: AccountId,
}

impl MongoExpenseStore {
    pub fn new(db: &Database, owner_id: impl Into<AccountId>) -> Self {
        let raw = db.collection::<Document>(EXPENSES);
        Self {
            typed: raw.clone_with_type(),
            raw,
            owner_id: owner_id.into(),
        }
    }
}

#[async_trait]
impl ExpenseStore for MongoExpenseStore {
    async fn fetch_expenses(&self) -> Result<Vec<Expense>, SyncError> {
        let documents = find_all(&self.raw, doc! { "ownerId": &self.owner_id }).await?;
        Ok(decode_batch(EXPENSES, documents, ExpenseDocument::into_domain))
    }

    async fn upsert_expense(
        &self,
        expense: &Expense,
        participants: &[Member],
    ) -> Result<(), SyncError> {
        let mut document = ExpenseDocument::from_domain(&self.owner_id, expense);
        let names = document.participant_names.get_or_insert_with(BTreeMap::new);
        for participant in participants {
            names.insert(participant.id.to_string(), participant.name.clone());
        }
        self.typed
            .replace_one(
                doc! { "id": expense.id.to_string(), "ownerId": &self.owner_id },
                document,
                upsert(),
            )
            .await?;
        Ok(())
    }

    async fn delete_expense(&self, id: ExpenseId) -> Result<(), SyncError> {
        self.raw
            .delete_one(doc! { "id": id.to_string(), "ownerId": &self.owner_id }, None)
            .await?;
        Ok(())
    }

    async fn clear_legacy_mock_expenses(&self) -> Result<u64, SyncError> {
        let result = self
            .raw
            .delete_many(
                doc! {
                    "ownerId": &self.owner_id,
                    "description": { "$regex": "^\\[mock\\]", "$options": "i" },
                },
                None,
            )
            .await?;
        Ok(result.deleted_count)
    }
}

pub struct MongoAccountStore {
    accounts: Collection<AccountDocument>,
    friends_raw: Collection<Document>,
    friends: Collection<FriendDocument>,
}

impl MongoAccountStore {
    pub fn new(db: &Database) -> Self {
        let friends_raw = db.collection::<Document>(FRIENDS);
        Self {
            accounts: db.collection(ACCOUNTS),
            friends: friends_raw.clone_with_type(),
            friends_raw,
        }
    }
}

#[async_trait]
impl AccountStore for MongoAccountStore {
    async fn create_account(&self, email: &str, display_name: &str) -> Result<Account, SyncError> {
        let email = normalize_email(email)?;
        let document = AccountDocument {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            display_name: display_name.to_owned(),
            created_at: bson::DateTime::now(),
        };
        match self.accounts.insert_one(&document, None).await {
            Ok(_) => Ok(document.into()),
            Err(err) if is_duplicate_key(&err) => Err(SyncError::AccountDuplicate(email)),
            Err(err) => Err(err.into()),
        }
    }

    async fn lookup_account(&self, email: &str) -> Result<Account, SyncError> {
        let email = normalize_email(email)?;
        self.accounts
            .find_one(doc! { "email": &email }, None)
            .await?
            .map(Account::from)
            .ok_or(SyncError::AccountNotFound(email))
    }

    async fn sync_friends(
        &self,
        account_email: &str,
        friends: &[AccountFriend],
    ) -> Result<(), SyncError> {
        let email = normalize_email(account_email)?;
        self.friends_raw
            .delete_many(doc! { "ownerEmail": &email }, None)
            .await?;
        if !friends.is_empty() {
            let documents: Vec<FriendDocument> = friends
                .iter()
                .map(|friend| FriendDocument::from_domain(&email, friend))
                .collect();
            self.friends.insert_many(documents, None).await?;
        }
        Ok(())
    }

    async fn fetch_friends(&self, account_email: &str) -> Result<Vec<AccountFriend>, SyncError> {
        let email = normalize_email(account_email)?;
        let documents = find_all(&self.friends_raw, doc! { "ownerEmail": &email }).await?;
        Ok(decode_batch(FRIENDS, documents, FriendDocument::into_domain))
    }

    async fn update_friend_link_status(
        &self,
        account_email: &str,
        claim: &LinkClaim,
    ) -> Result<(), SyncError> {
        let email = normalize_email(account_email)?;
        self.friends_raw
            .update_one(
                doc! { "ownerEmail": &email, "memberId": claim.linked_member_id.to_string() },
                doc! { "$set": {
                    "hasLinkedAccount": true,
                    "linkedAccountId": &claim.linked_account_id,
                    "linkedAccountEmail": &claim.linked_account_email,
                } },
                None,
            )
            .await?;
        Ok(())
    }
}

pub struct MongoInviteStore {
    invites: Collection<InviteDocument>,
}

impl MongoInviteStore {
    pub fn new(db: &Database) -> Self {
        Self {
            invites: db.collection(INVITES),
        }
    }
}

#[async_trait]
impl InviteStore for MongoInviteStore {
    async fn insert_invite(&self, token: &InviteToken) -> Result<(), SyncError> {
        self.invites
            .insert_one(InviteDocument::from(token), None)
            .await?;
        Ok(())
    }

    async fn find_invite(&self, id: Uuid) -> Result<Option<InviteToken>, SyncError> {
        let found = self
            .invites
            .find_one(doc! { "id": id.to_string() }, None)
            .await?;
        Ok(found.map(InviteToken::from))
    }

    async fn claim_invite(
        &self,
        id: Uuid,
        claimer: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InviteToken>, SyncError> {
        // A single-document conditional update is atomic on the server, so only
        // one of several racing claimers can see `claimedBy: null` match.
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let claimed = self
            .invites
            .find_one_and_update(
                doc! {
                    "id": id.to_string(),
                    "claimedBy": Bson::Null,
                    "expiresAt": { "$gt": to_bson_time(now) },
                },
                doc! { "$set": { "claimedBy": claimer, "claimedAt": to_bson_time(now) } },
                options,
            )
            .await?;
        Ok(claimed.map(InviteToken::from))
    }

    async fn active_invites(
        &self,
        creator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<InviteToken>, SyncError> {
        let cursor = self
            .invites
            .find(
                doc! {
                    "creatorId": creator_id,
                    "claimedBy": Bson::Null,
                    "expiresAt": { "$gt": to_bson_time(now) },
                },
                None,
            )
            .await?;
        let documents: Vec<InviteDocument> = cursor.try_collect().await?;
        let mut active: Vec<InviteToken> = documents.into_iter().map(InviteToken::from).collect();
        active.sort_by_key(|token| token.created_at);
        Ok(active)
    }

    async fn delete_invite(&self, id: Uuid) -> Result<bool, SyncError> {
        let result = self
            .invites
            .delete_one(doc! { "id": id.to_string() }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }
}

pub struct MongoLinkRequestStore {
    requests: Collection<LinkRequestDocument>,
}

impl MongoLinkRequestStore {
    pub fn new(db: &Database) -> Self {
        Self {
            requests: db.collection(LINK_REQUESTS),
        }
    }

    async fn find_many(&self, filter: Document) -> Result<Vec<LinkRequest>, SyncError> {
        let cursor = self.requests.find(filter, None).await?;
        let documents: Vec<LinkRequestDocument> = cursor.try_collect().await?;
        let mut requests: Vec<LinkRequest> = documents.into_iter().map(LinkRequest::from).collect();
        requests.sort_by_key(|request| request.created_at);
        Ok(requests)
    }
}

#[async_trait]
impl LinkRequestStore for MongoLinkRequestStore {
    async fn insert_request(&self, request: &LinkRequest) -> Result<(), SyncError> {
        self.requests
            .insert_one(LinkRequestDocument::from(request), None)
            .await?;
        Ok(())
    }

    async fn find_request(&self, id: Uuid) -> Result<Option<LinkRequest>, SyncError> {
        let found = self
            .requests
            .find_one(doc! { "id": id.to_string() }, None)
            .await?;
        Ok(found.map(LinkRequest::from))
    }

    async fn resolve_request(
        &self,
        id: Uuid,
        status: LinkRequestStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<LinkRequest>, SyncError> {
        let mut set = doc! { "status": status_name(status) };
        if status == LinkRequestStatus::Rejected {
            set.insert("rejectedAt", to_bson_time(at));
        }
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let resolved = self
            .requests
            .find_one_and_update(
                doc! { "id": id.to_string(), "status": status_name(LinkRequestStatus::Pending) },
                doc! { "$set": set },
                options,
            )
            .await?;
        Ok(resolved.map(LinkRequest::from))
    }

    async fn delete_request(&self, id: Uuid) -> Result<bool, SyncError> {
        let result = self
            .requests
            .delete_one(doc! { "id": id.to_string() }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }

    async fn requests_for_recipient(&self, email: &str) -> Result<Vec<LinkRequest>, SyncError> {
        let email = normalize_email(email)?;
        self.find_many(doc! { "recipientEmail": email }).await
    }

    async fn requests_from(&self, requester_id: &str) -> Result<Vec<LinkRequest>, SyncError> {
        self.find_many(doc! { "requesterId": requester_id }).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn decode_groups(documents: Vec<Document>) -> Vec<SpendingGroup> {
        decode_batch(GROUPS, documents, GroupDocument::into_domain)
    }

    #[test]
    fn malformed_groups_are_dropped_and_bad_ids_derived() {
        let created =
            bson::DateTime::from_chrono(Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap());
        let good_id = Uuid::from_u128(1).to_string();
        let documents = vec![
            doc! {
                "id": &good_id,
                "name": "Flat",
                "members": [{ "id": "legacy-7", "name": "Ann" }, { "name": "no id" }],
                "createdAt": created,
            },
            doc! { "id": "missing-name", "members": [], "createdAt": created },
            doc! { "id": 42, "name": "wrong type", "members": [], "createdAt": created },
        ];

        let groups = decode_groups(documents);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, Uuid::from_u128(1));
        assert_eq!(groups[0].members, vec![Member::new(parse_id("legacy-7"), "Ann")]);
        assert_eq!(groups[0].is_direct, None);
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(parse_id("legacy-7"), parse_id("legacy-7"));
        assert_ne!(parse_id("legacy-7"), parse_id("legacy-8"));
        let real = Uuid::new_v4();
        assert_eq!(parse_id(&format!(" {real} ")), real);
    }

    #[test]
    fn expense_documents_fill_optional_fields() {
        let date = Utc.with_ymd_and_hms(2024, 2, 3, 10, 0, 0).unwrap();
        let document = doc! {
            "id": Uuid::from_u128(5).to_string(),
            "groupId": Uuid::from_u128(6).to_string(),
            "date": bson::DateTime::from_chrono(date),
            "totalAmount": 12,
            "paidByMemberId": Uuid::from_u128(7).to_string(),
            "splits": [
                { "memberId": Uuid::from_u128(7).to_string(), "amount": 12.0 },
                { "amount": 1.0 },
            ],
        };
        let expenses = decode_batch(EXPENSES, vec![document], ExpenseDocument::into_domain);
        assert_eq!(expenses.len(), 1);
        let expense = &expenses[0];
        assert_eq!(expense.total_amount, 12.0);
        assert_eq!(expense.description, "");
        assert_eq!(expense.date, date);
        assert_eq!(expense.splits.len(), 1);
        assert!(!expense.splits[0].is_settled);
        assert!(expense.involved_member_ids.is_empty());
    }

    #[test]
    fn friend_documents_round_trip_link_fields() {
        let mut friend = AccountFriend::named(Uuid::from_u128(3), "Cy");
        friend.has_linked_account = true;
        friend.linked_account_id = Some("acct-cy".to_owned());
        friend.alias_member_ids = vec![Uuid::from_u128(4)];
        friend.status = Some(FriendStatus::Accepted);

        let document =
            bson::to_document(&FriendDocument::from_domain("me@example.com", &friend)).unwrap();
        assert_eq!(document.get_str("ownerEmail").unwrap(), "me@example.com");
        let decoded = decode_batch(FRIENDS, vec![document], FriendDocument::into_domain);
        assert_eq!(decoded, vec![friend]);
    }
}
