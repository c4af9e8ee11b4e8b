//! Owns the canonical in-memory state for one signed-in account.
//!
//! Every operation takes the state lock for its whole duration, remote calls
//! included, so mutations and pipeline runs never interleave. The pipeline is
//! idempotent: feeding it its own output changes nothing.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use actix::Addr;
use chrono::Duration as ChronoDuration;
use mockable::Clock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balance::{compute_group_balance, Balance};
use crate::error::SyncError;
use crate::expense_normalizer::{normalize_expense, orphan_aliases};
use crate::friends::{
    reconcile_friends, selectable_direct_expense_friends, syncable_friends, FriendEntry,
    FriendOrigin, FriendSources,
};
use crate::group_normalizer::normalize_group;
use crate::identity::IdentityGraph;
use crate::link_failures::LinkFailureTracker;
use crate::link_state::{validate_link_completion, LinkStateReconciler};
use crate::persistence::{CacheWriter, Discard, Flush, Persist};
use crate::schemas::{
    AccountFriend, CacheSnapshot, Expense, ExpenseId, FriendStatus, GroupId, LinkClaim,
    LinkFailureRecord, Member, MemberId, Session, SpendingGroup,
};
use crate::stores::{is_legacy_mock, AccountStore, ExpenseStore, GroupStore, LocalCache};
use crate::synthesizer::{GroupSynthesizer, NameCache};

/// Largest gap tolerated between an expense total and the sum of its splits.
pub const SPLIT_TOLERANCE: f64 = 0.01;

#[derive(Clone)]
pub struct SyncStores {
    pub groups: Arc<dyn GroupStore>,
    pub expenses: Arc<dyn ExpenseStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub cache: Arc<dyn LocalCache>,
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub link_debounce: ChronoDuration,
    pub fetch_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            link_debounce: ChronoDuration::seconds(30),
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

/// A consistent read of the orchestrator state.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub groups: Vec<SpendingGroup>,
    pub expenses: Vec<Expense>,
    pub friends: Vec<FriendEntry>,
    pub pending_link_failures: Vec<LinkFailureRecord>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub resolved: Vec<MemberId>,
    pub still_failing: Vec<MemberId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.still_failing.is_empty()
    }
}

struct SyncState {
    session: Option<Session>,
    groups: Vec<SpendingGroup>,
    expenses: Vec<Expense>,
    remote_friends: Vec<AccountFriend>,
    imported_friends: Vec<AccountFriend>,
    friends: Vec<FriendEntry>,
    /// Alias graph per group, used to rewrite expenses filed under it.
    aliases: HashMap<GroupId, IdentityGraph>,
    /// Every alias known to the account, across groups and declared friends.
    identities: IdentityGraph,
    names: NameCache,
    link_state: LinkStateReconciler,
    failures: LinkFailureTracker,
    last_pushed: Option<Vec<AccountFriend>>,
}

impl SyncState {
    fn new(clock: &Arc<dyn Clock>, settings: &SyncSettings) -> Self {
        Self {
            session: None,
            groups: Vec::new(),
            expenses: Vec::new(),
            remote_friends: Vec::new(),
            imported_friends: Vec::new(),
            friends: Vec::new(),
            aliases: HashMap::new(),
            identities: IdentityGraph::new(),
            names: NameCache::new(),
            link_state: LinkStateReconciler::new(Arc::clone(clock), settings.link_debounce),
            failures: LinkFailureTracker::new(Arc::clone(clock)),
            last_pushed: None,
        }
    }

    fn session(&self) -> Result<Session, SyncError> {
        self.session.clone().ok_or(SyncError::SessionMissing)
    }

    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            groups: self.groups.clone(),
            expenses: self.expenses.clone(),
            friends: self.friends.clone(),
            pending_link_failures: self.failures.pending_failures(),
        }
    }

    fn group(&self, id: GroupId) -> Result<&SpendingGroup, SyncError> {
        self.groups
            .iter()
            .find(|group| group.id == id)
            .ok_or(SyncError::GroupNotFound(id))
    }

    fn refresh_friends(&mut self, session: &Session) {
        self.friends = reconcile_friends(
            session,
            FriendSources {
                groups: &self.groups,
                remote: &self.remote_friends,
                imported: &self.imported_friends,
                identities: &self.identities,
            },
        );
    }

    /// Run the normalization pipeline over raw groups and expenses.
    ///
    /// `known` carries alias graphs learned by earlier runs; they are folded
    /// into the graphs of the same groups.
    fn rebuild(
        &mut self,
        session: &Session,
        groups: Vec<SpendingGroup>,
        expenses: Vec<Expense>,
        known: HashMap<GroupId, IdentityGraph>,
    ) {
        let declared = declared_aliases(self.remote_friends.iter().chain(&self.imported_friends));

        let mut aliases_by_group: HashMap<GroupId, IdentityGraph> = HashMap::new();
        let mut normalized_groups: Vec<SpendingGroup> = Vec::with_capacity(groups.len());
        for group in unique_by_id(groups, |group| group.id) {
            let normalized = normalize_group(&group, session, &declared);
            let mut aliases = normalized.aliases;
            if let Some(learned) = known.get(&group.id) {
                aliases.absorb(learned);
            }
            aliases_by_group.insert(group.id, aliases);
            normalized_groups.push(normalized.group);
        }

        let mut normalized_expenses: Vec<Expense> = Vec::with_capacity(expenses.len());
        let mut orphans: Vec<Expense> = Vec::new();
        for expense in unique_by_id(expenses, |expense| expense.id) {
            match aliases_by_group.get(&expense.group_id) {
                Some(aliases) => normalized_expenses.push(normalize_expense(&expense, aliases)),
                None => orphans.push(expense),
            }
        }

        if !orphans.is_empty() {
            let aliases = orphan_aliases(&orphans, session, &declared);
            let orphans: Vec<Expense> = orphans
                .iter()
                .map(|expense| normalize_expense(expense, &aliases))
                .collect();
            let friends: Vec<AccountFriend> = self
                .remote_friends
                .iter()
                .chain(&self.imported_friends)
                .cloned()
                .collect();
            let synthesized =
                GroupSynthesizer::new(session, &friends, &mut self.names).synthesize(&orphans);
            for group in &synthesized {
                aliases_by_group.insert(group.id, aliases.clone());
            }
            normalized_groups.extend(synthesized);
            normalized_expenses.extend(orphans);
        }

        normalized_expenses.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        self.groups = normalized_groups;
        self.expenses = normalized_expenses;
        let mut identities = declared;
        identities.pin(session.member_id);
        for aliases in aliases_by_group.values() {
            identities.absorb(aliases);
        }
        self.identities = identities;
        self.aliases = aliases_by_group;
        self.refresh_friends(session);
    }

    /// Re-run the pipeline over what is already held.
    fn rebuild_in_place(&mut self, session: &Session) {
        let groups = std::mem::take(&mut self.groups);
        let expenses = std::mem::take(&mut self.expenses);
        let known = std::mem::take(&mut self.aliases);
        self.rebuild(session, groups, expenses, known);
    }

    /// Re-apply links whose remote update has not landed yet.
    fn overlay_pending_links(&mut self) {
        for record in self.failures.pending_failures() {
            let claim = LinkClaim {
                linked_member_id: record.member_id,
                linked_account_id: record.account_id,
                linked_account_email: record.account_email,
            };
            for friend in self
                .remote_friends
                .iter_mut()
                .chain(self.imported_friends.iter_mut())
                .filter(|friend| friend.member_id == claim.linked_member_id)
            {
                mark_linked(friend, &claim);
            }
        }
    }
}

fn declared_aliases<'a>(friends: impl Iterator<Item = &'a AccountFriend>) -> IdentityGraph {
    let mut graph = IdentityGraph::new();
    for friend in friends {
        graph.insert(friend.member_id);
        for &alias in &friend.alias_member_ids {
            graph.union(friend.member_id, alias);
        }
    }
    graph
}

fn find_friend(friends: &[FriendEntry], member_id: MemberId) -> Option<FriendEntry> {
    friends
        .iter()
        .find(|entry| entry.friend.identity_ids().any(|id| id == member_id))
        .cloned()
}

/// Keep the first occurrence of every id.
fn unique_by_id<T, K>(items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T>
where
    K: std::hash::Hash + Eq,
{
    let mut seen = HashSet::new();
    let total = items.len();
    let unique: Vec<T> = items.into_iter().filter(|item| seen.insert(key(item))).collect();
    if unique.len() < total {
        debug!(duplicates = total - unique.len(), "dropped duplicate records");
    }
    unique
}

fn mark_linked(friend: &mut AccountFriend, claim: &LinkClaim) {
    friend.has_linked_account = true;
    friend.linked_account_id = Some(claim.linked_account_id.clone());
    friend.linked_account_email = Some(claim.linked_account_email.clone());
    friend.status = Some(FriendStatus::Accepted);
}

fn upsert_friend(list: &mut Vec<AccountFriend>, friend: AccountFriend) {
    match list.iter_mut().find(|known| known.member_id == friend.member_id) {
        Some(known) => *known = friend,
        None => list.push(friend),
    }
}

pub fn validate_expense(expense: &Expense) -> Result<(), SyncError> {
    if expense.total_amount.is_nan() || expense.total_amount <= 0.0 {
        return Err(SyncError::ExpenseInvalidAmount);
    }
    if !expense.splits.is_empty() {
        let splits: f64 = expense.splits.iter().map(|split| split.amount).sum();
        if (splits - expense.total_amount).abs() > SPLIT_TOLERANCE {
            return Err(SyncError::ExpenseSplitMismatch {
                total: expense.total_amount,
                splits,
            });
        }
    }
    Ok(())
}

pub struct SyncOrchestrator {
    stores: SyncStores,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    writer: Option<Addr<CacheWriter>>,
    state: Mutex<SyncState>,
}

impl SyncOrchestrator {
    pub fn new(stores: SyncStores, clock: Arc<dyn Clock>, settings: SyncSettings) -> Self {
        let state = Mutex::new(SyncState::new(&clock, &settings));
        Self {
            stores,
            clock,
            settings,
            writer: None,
            state,
        }
    }

    /// Route cache writes through a debouncing writer instead of saving inline.
    pub fn with_writer(mut self, writer: Addr<CacheWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    async fn remote<T>(
        &self,
        call: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        tokio::time::timeout(self.settings.fetch_timeout, call)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    async fn persist(&self, state: &SyncState) {
        let snapshot = CacheSnapshot {
            groups: state.groups.clone(),
            expenses: state.expenses.clone(),
        };
        match &self.writer {
            Some(writer) => writer.do_send(Persist(snapshot)),
            None => {
                if let Err(err) = self.stores.cache.save(&snapshot).await {
                    warn!(error = %err, "failed to save local cache");
                }
            }
        }
    }

    /// Push the syncable friend list when it differs from the last push.
    async fn push_friends(&self, state: &mut SyncState, session: &Session) {
        let syncable = syncable_friends(&state.friends);
        if state.last_pushed.as_ref() == Some(&syncable) {
            return;
        }
        let pushed = self
            .remote(self.stores.accounts.sync_friends(&session.email, &syncable))
            .await;
        match pushed {
            Ok(()) => {
                debug!(count = syncable.len(), "pushed friend list");
                state.last_pushed = Some(syncable);
            }
            Err(err) => warn!(error = %err, "failed to push friend list"),
        }
    }

    /// Start a session from the local cache. Remote data arrives with [`Self::sync`].
    pub async fn sign_in(&self, session: Session) -> Result<SyncSnapshot, SyncError> {
        let mut state = self.state.lock().await;
        *state = SyncState::new(&self.clock, &self.settings);

        let cached = self.stores.cache.load().await.unwrap_or_else(|err| {
            warn!(error = %err, "ignoring unreadable local cache");
            CacheSnapshot::default()
        });
        let expenses: Vec<Expense> = cached
            .expenses
            .into_iter()
            .filter(|expense| !is_legacy_mock(expense))
            .collect();
        state.rebuild(&session, cached.groups, expenses, HashMap::new());

        match self
            .remote(self.stores.expenses.clear_legacy_mock_expenses())
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!(removed, "cleared legacy mock expenses"),
            Err(err) => warn!(error = %err, "could not clear legacy mock expenses"),
        }

        info!(account_id = %session.account_id, "signed in");
        state.session = Some(session);
        Ok(state.snapshot())
    }

    pub async fn sign_out(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if let Some(writer) = &self.writer {
            writer.send(Discard).await?;
        }
        state.failures.clear_all();
        self.stores.cache.clear().await?;
        if let Some(session) = state.session.take() {
            info!(account_id = %session.account_id, "signed out");
        }
        *state = SyncState::new(&self.clock, &self.settings);
        Ok(())
    }

    /// Write any snapshot still queued in the cache writer.
    pub async fn flush(&self) -> Result<(), SyncError> {
        match &self.writer {
            Some(writer) => writer.send(Flush).await?,
            None => Ok(()),
        }
    }

    pub async fn session(&self) -> Option<Session> {
        self.state.lock().await.session.clone()
    }

    /// Fetch everything remote and rebuild the canonical state.
    pub async fn sync(&self) -> Result<SyncSnapshot, SyncError> {
        let mut state = self.state.lock().await;
        let session = state.session()?;

        let (groups, expenses, friends) = self
            .remote(async {
                futures::try_join!(
                    self.stores.groups.fetch_groups(),
                    self.stores.expenses.fetch_expenses(),
                    self.stores.accounts.fetch_friends(&session.email),
                )
            })
            .await?;
        info!(
            groups = groups.len(),
            expenses = expenses.len(),
            friends = friends.len(),
            "fetched remote state"
        );

        state.remote_friends = state.link_state.reconcile(&[], &friends);
        state.overlay_pending_links();
        state.rebuild(&session, groups, expenses, HashMap::new());
        self.push_friends(&mut state, &session).await;
        self.persist(&state).await;
        Ok(state.snapshot())
    }

    pub async fn snapshot(&self) -> SyncSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn friends(&self) -> Vec<FriendEntry> {
        self.state.lock().await.friends.clone()
    }

    pub async fn selectable_friends(&self) -> Vec<FriendEntry> {
        selectable_direct_expense_friends(&self.state.lock().await.friends)
    }

    pub async fn balances(&self, group_id: GroupId) -> Result<Balance, SyncError> {
        let state = self.state.lock().await;
        let group = state.group(group_id)?;
        Ok(compute_group_balance(group, &state.expenses))
    }

    pub async fn add_group(
        &self,
        name: &str,
        members: Vec<Member>,
    ) -> Result<SpendingGroup, SyncError> {
        let mut state = self.state.lock().await;
        let session = state.session()?;

        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::GroupInvalidConfiguration(
                "group name is blank".to_owned(),
            ));
        }
        let members = unique_by_id(members, |member| member.id);
        if members.len() < 2 {
            return Err(SyncError::GroupInvalidConfiguration(
                "a group needs at least two members".to_owned(),
            ));
        }

        let group = SpendingGroup {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            is_direct: Some(members.len() == 2),
            members,
            created_at: self.clock.utc(),
        };
        self.remote(self.stores.groups.upsert_group(&group)).await?;
        info!(group_id = %group.id, "added group");

        state.groups.push(group.clone());
        state.rebuild_in_place(&session);
        self.push_friends(&mut state, &session).await;
        self.persist(&state).await;
        Ok(state.group(group.id).cloned().unwrap_or(group))
    }

    /// Delete groups and every expense filed under them.
    pub async fn delete_groups(&self, ids: &[GroupId]) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let session = state.session()?;
        for &id in ids {
            state.group(id)?;
        }

        let doomed: Vec<ExpenseId> = state
            .expenses
            .iter()
            .filter(|expense| ids.contains(&expense.group_id))
            .map(|expense| expense.id)
            .collect();
        let mut deleted: HashSet<ExpenseId> = HashSet::new();
        let mut outcome = Ok(());
        for &expense_id in &doomed {
            match self
                .remote(self.stores.expenses.delete_expense(expense_id))
                .await
            {
                Ok(()) => {
                    deleted.insert(expense_id);
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        if outcome.is_ok() {
            outcome = self.remote(self.stores.groups.delete_groups(ids)).await;
        }

        // Whatever was deleted remotely goes locally too, even on failure.
        state.expenses.retain(|expense| !deleted.contains(&expense.id));
        if outcome.is_ok() {
            state.groups.retain(|group| !ids.contains(&group.id));
            state.expenses.retain(|expense| !ids.contains(&expense.group_id));
            info!(groups = ids.len(), expenses = doomed.len(), "deleted groups");
        } else {
            warn!(deleted = deleted.len(), of = doomed.len(), "group deletion stopped early");
        }
        state.rebuild_in_place(&session);
        self.persist(&state).await;
        outcome
    }

    /// Insert or replace an expense in a known group. The expense is stored
    /// with canonical member ids.
    pub async fn add_expense(&self, expense: Expense) -> Result<Expense, SyncError> {
        let mut state = self.state.lock().await;
        self.save_expense(&mut state, expense).await
    }

    /// Replace a known expense. Fails with `ExpenseNotFound` for unknown ids.
    pub async fn update_expense(&self, expense: Expense) -> Result<Expense, SyncError> {
        let mut state = self.state.lock().await;
        state.session()?;
        if !state.expenses.iter().any(|known| known.id == expense.id) {
            return Err(SyncError::ExpenseNotFound(expense.id));
        }
        self.save_expense(&mut state, expense).await
    }

    async fn save_expense(
        &self,
        state: &mut SyncState,
        expense: Expense,
    ) -> Result<Expense, SyncError> {
        let session = state.session()?;
        validate_expense(&expense)?;
        let group = state.group(expense.group_id)?;
        let expense = match state.aliases.get(&group.id) {
            Some(aliases) => normalize_expense(&expense, aliases),
            None => expense,
        };
        let participants = participants_of(group, &expense);

        self.remote(self.stores.expenses.upsert_expense(&expense, &participants))
            .await?;
        debug!(expense_id = %expense.id, group_id = %expense.group_id, "saved expense");

        let id = expense.id;
        upsert_expense(&mut state.expenses, expense);
        state.rebuild_in_place(&session);
        self.persist(state).await;
        state
            .expenses
            .iter()
            .find(|expense| expense.id == id)
            .cloned()
            .ok_or(SyncError::ExpenseNotFound(id))
    }

    pub async fn delete_expense(&self, id: ExpenseId) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let session = state.session()?;
        if !state.expenses.iter().any(|expense| expense.id == id) {
            return Err(SyncError::ExpenseNotFound(id));
        }
        self.remote(self.stores.expenses.delete_expense(id)).await?;
        state.expenses.retain(|expense| expense.id != id);
        state.rebuild_in_place(&session);
        self.persist(&state).await;
        Ok(())
    }

    /// Add a friend that is not tied to any group.
    pub async fn import_friend(
        &self,
        name: &str,
        nickname: Option<&str>,
    ) -> Result<FriendEntry, SyncError> {
        let mut state = self.state.lock().await;
        let session = state.session()?;

        let mut friend = AccountFriend::named(Uuid::new_v4(), name.trim());
        friend.nickname = nickname
            .map(str::trim)
            .filter(|nickname| !nickname.is_empty())
            .map(str::to_owned);
        let member_id = friend.member_id;
        state.imported_friends.push(friend.clone());
        state.refresh_friends(&session);
        self.push_friends(&mut state, &session).await;

        let entry = state
            .friends
            .iter()
            .find(|entry| entry.friend.identity_ids().any(|id| id == member_id))
            .cloned();
        Ok(entry.unwrap_or(FriendEntry {
            friend,
            origin: FriendOrigin::Imported,
        }))
    }

    /// Mark the friend named by `claim` as linked to the claiming account.
    ///
    /// A failed remote status update does not fail the link; it is recorded
    /// for the next network-recovery sweep.
    pub async fn apply_link(&self, claim: &LinkClaim) -> Result<AccountFriend, SyncError> {
        let mut state = self.state.lock().await;
        let session = state.session()?;
        if claim.linked_account_id == session.account_id {
            return Err(SyncError::LinkSelfNotAllowed);
        }

        let entry = match find_friend(&state.friends, claim.linked_member_id) {
            Some(entry) => entry,
            None => {
                // Not seen locally yet; the remote friend list may know the member.
                if let Err(err) = self.refresh_link_state(&mut state, &session).await {
                    state.failures.record_failure(
                        claim.linked_member_id,
                        &claim.linked_account_id,
                        &claim.linked_account_email,
                        &err.to_string(),
                    );
                    return Err(err);
                }
                find_friend(&state.friends, claim.linked_member_id).ok_or_else(|| {
                    SyncError::LinkInvalid(format!("unknown member {}", claim.linked_member_id))
                })?
            }
        };
        let member_id = entry.friend.member_id;
        if entry.friend.has_linked_account
            && entry.friend.linked_account_id.as_deref() != Some(claim.linked_account_id.as_str())
        {
            return Err(SyncError::LinkMemberAlreadyLinked(member_id));
        }
        let taken = state.friends.iter().any(|other| {
            other.friend.member_id != member_id
                && other.friend.linked_account_id.as_deref()
                    == Some(claim.linked_account_id.as_str())
        });
        if taken {
            return Err(SyncError::LinkAccountAlreadyLinked(
                claim.linked_account_id.clone(),
            ));
        }

        let mut linked = entry.friend;
        mark_linked(&mut linked, claim);
        if entry.origin == FriendOrigin::Imported {
            upsert_friend(&mut state.imported_friends, linked.clone());
        } else {
            upsert_friend(&mut state.remote_friends, linked.clone());
        }
        state.refresh_friends(&session);
        info!(member_id = %member_id, account_id = %claim.linked_account_id, "linked friend");

        self.push_friends(&mut state, &session).await;
        let remote_claim = LinkClaim {
            linked_member_id: member_id,
            ..claim.clone()
        };
        let updated = self
            .remote(
                self.stores
                    .accounts
                    .update_friend_link_status(&session.email, &remote_claim),
            )
            .await;
        match updated {
            Ok(()) => {
                state.failures.mark_resolved(member_id);
            }
            Err(err) => {
                state.failures.record_failure(
                    member_id,
                    &claim.linked_account_id,
                    &claim.linked_account_email,
                    &err.to_string(),
                );
            }
        }
        Ok(linked)
    }

    async fn refresh_link_state(
        &self,
        state: &mut SyncState,
        session: &Session,
    ) -> Result<Vec<AccountFriend>, SyncError> {
        let fetched = self
            .remote(self.stores.accounts.fetch_friends(&session.email))
            .await?;
        state.remote_friends = state.link_state.reconcile(&state.remote_friends, &fetched);
        state.overlay_pending_links();
        state.refresh_friends(session);
        Ok(fetched)
    }

    /// Pull remote link status unless a recent run makes it redundant.
    /// Returns whether a reconciliation ran.
    pub async fn reconcile_link_state(&self) -> Result<bool, SyncError> {
        let mut state = self.state.lock().await;
        let session = state.session()?;
        if !state.link_state.should_reconcile() {
            debug!("link state reconciled recently; skipping");
            return Ok(false);
        }
        self.refresh_link_state(&mut state, &session).await?;
        self.push_friends(&mut state, &session).await;
        Ok(true)
    }

    /// Full link reconciliation plus a retry sweep over recorded link failures.
    ///
    /// Without a session this does nothing.
    pub async fn reconcile_after_network_recovery(&self) -> Result<RecoveryReport, SyncError> {
        let mut state = self.state.lock().await;
        let Some(session) = state.session.clone() else {
            return Ok(RecoveryReport::default());
        };

        state.link_state.invalidate();
        let fetched = self.refresh_link_state(&mut state, &session).await?;
        self.push_friends(&mut state, &session).await;

        let mut report = RecoveryReport::default();
        for record in state.failures.pending_failures() {
            if validate_link_completion(record.member_id, &record.account_id, &fetched) {
                state.failures.mark_resolved(record.member_id);
                report.resolved.push(record.member_id);
                continue;
            }
            let claim = LinkClaim {
                linked_member_id: record.member_id,
                linked_account_id: record.account_id.clone(),
                linked_account_email: record.account_email.clone(),
            };
            let retried = self
                .remote(
                    self.stores
                        .accounts
                        .update_friend_link_status(&session.email, &claim),
                )
                .await;
            match retried {
                Ok(()) => {
                    state.failures.mark_resolved(record.member_id);
                    report.resolved.push(record.member_id);
                }
                Err(err) => {
                    state.failures.record_failure(
                        record.member_id,
                        &record.account_id,
                        &record.account_email,
                        &err.to_string(),
                    );
                    report.still_failing.push(record.member_id);
                }
            }
        }
        if !report.is_empty() {
            info!(
                resolved = report.resolved.len(),
                still_failing = report.still_failing.len(),
                "link failure sweep finished"
            );
        }
        Ok(report)
    }
}

fn participants_of(group: &SpendingGroup, expense: &Expense) -> Vec<Member> {
    group
        .members
        .iter()
        .filter(|member| {
            member.id == expense.paid_by_member_id
                || expense.involved_member_ids.contains(&member.id)
                || expense.splits.iter().any(|split| split.member_id == member.id)
        })
        .cloned()
        .collect()
}

fn upsert_expense(list: &mut Vec<Expense>, expense: Expense) {
    match list.iter_mut().find(|known| known.id == expense.id) {
        Some(known) => *known = expense,
        None => list.push(expense),
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
