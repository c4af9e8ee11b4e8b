//! Email-addressed link requests, the lighter sibling of invite links.

use std::sync::Arc;

use chrono::Duration;
use mockable::Clock;
use tracing::info;
use uuid::Uuid;

use crate::accounts::{normalize_email, same_email};
use crate::error::SyncError;
use crate::schemas::{LinkClaim, LinkRequest, LinkRequestStatus, MemberId, Session};
use crate::stores::{AccountStore, LinkRequestStore};

pub const REQUEST_LIFETIME_DAYS: i64 = 7;

pub struct LinkRequestService {
    requests: Arc<dyn LinkRequestStore>,
    accounts: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
}

impl LinkRequestService {
    pub fn new(
        requests: Arc<dyn LinkRequestStore>,
        accounts: Arc<dyn AccountStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            requests,
            accounts,
            clock,
        }
    }

    pub async fn create(
        &self,
        session: Option<&Session>,
        recipient_email: &str,
        target_member_id: MemberId,
        target_member_name: &str,
    ) -> Result<LinkRequest, SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        let recipient_email = normalize_email(recipient_email)?;
        if same_email(&recipient_email, &session.email) {
            return Err(SyncError::LinkSelfNotAllowed);
        }
        self.accounts.lookup_account(&recipient_email).await?;

        let now = self.clock.utc();
        let duplicate = self
            .requests
            .requests_from(&session.account_id)
            .await?
            .iter()
            .any(|request| {
                request.status == LinkRequestStatus::Pending
                    && !request.is_expired(now)
                    && request.target_member_id == target_member_id
                    && same_email(&request.recipient_email, &recipient_email)
            });
        if duplicate {
            return Err(SyncError::LinkDuplicateRequest);
        }

        let request = LinkRequest {
            id: Uuid::new_v4(),
            requester_id: session.account_id.clone(),
            requester_email: session.email.clone(),
            requester_name: session.name.clone(),
            recipient_email,
            target_member_id,
            target_member_name: target_member_name.trim().to_owned(),
            status: LinkRequestStatus::Pending,
            created_at: now,
            expires_at: now + Duration::days(REQUEST_LIFETIME_DAYS),
            rejected_at: None,
        };
        self.requests.insert_request(&request).await?;
        info!(request_id = %request.id, member_id = %target_member_id, "created link request");
        Ok(request)
    }

    /// Loads a request addressed to the signed-in user, failing if it expired.
    async fn addressed_to(&self, session: &Session, id: Uuid) -> Result<LinkRequest, SyncError> {
        let request = self
            .requests
            .find_request(id)
            .await?
            .ok_or_else(|| SyncError::LinkInvalid(id.to_string()))?;
        if !same_email(&request.recipient_email, &session.email) {
            return Err(SyncError::Unauthorized);
        }
        if request.is_expired(self.clock.utc()) {
            return Err(SyncError::LinkExpired);
        }
        Ok(request)
    }

    pub async fn accept(
        &self,
        session: Option<&Session>,
        id: Uuid,
    ) -> Result<(LinkRequest, LinkClaim), SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        self.addressed_to(session, id).await?;
        let accepted = self
            .requests
            .resolve_request(id, LinkRequestStatus::Accepted, self.clock.utc())
            .await?
            .ok_or_else(|| SyncError::LinkInvalid(id.to_string()))?;
        info!(request_id = %id, "accepted link request");
        let claim = LinkClaim {
            linked_member_id: accepted.target_member_id,
            linked_account_id: session.account_id.clone(),
            linked_account_email: session.email.clone(),
        };
        Ok((accepted, claim))
    }

    pub async fn decline(
        &self,
        session: Option<&Session>,
        id: Uuid,
    ) -> Result<LinkRequest, SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        self.addressed_to(session, id).await?;
        let declined = self
            .requests
            .resolve_request(id, LinkRequestStatus::Rejected, self.clock.utc())
            .await?
            .ok_or_else(|| SyncError::LinkInvalid(id.to_string()))?;
        info!(request_id = %id, "declined link request");
        Ok(declined)
    }

    /// Withdraw a request the signed-in user sent.
    pub async fn cancel(&self, session: Option<&Session>, id: Uuid) -> Result<(), SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        let request = self
            .requests
            .find_request(id)
            .await?
            .ok_or_else(|| SyncError::LinkInvalid(id.to_string()))?;
        if request.requester_id != session.account_id {
            return Err(SyncError::Unauthorized);
        }
        if !self.requests.delete_request(id).await? {
            return Err(SyncError::LinkInvalid(id.to_string()));
        }
        Ok(())
    }

    /// Pending, unexpired requests addressed to the signed-in user.
    pub async fn incoming(&self, session: Option<&Session>) -> Result<Vec<LinkRequest>, SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        let now = self.clock.utc();
        let mut requests = self.requests.requests_for_recipient(&session.email).await?;
        requests.retain(|request| {
            request.status == LinkRequestStatus::Pending && !request.is_expired(now)
        });
        Ok(requests)
    }

    /// Pending, unexpired requests the signed-in user sent.
    pub async fn outgoing(&self, session: Option<&Session>) -> Result<Vec<LinkRequest>, SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        let now = self.clock.utc();
        let mut requests = self.requests.requests_from(&session.account_id).await?;
        requests.retain(|request| {
            request.status == LinkRequestStatus::Pending && !request.is_expired(now)
        });
        Ok(requests)
    }

    /// Incoming requests that were answered or ran out, newest first.
    pub async fn previous(&self, session: Option<&Session>) -> Result<Vec<LinkRequest>, SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        let now = self.clock.utc();
        let mut requests = self.requests.requests_for_recipient(&session.email).await?;
        requests.retain(|request| {
            request.status != LinkRequestStatus::Pending || request.is_expired(now)
        });
        requests.reverse();
        Ok(requests)
    }
}
