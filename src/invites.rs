//! Shareable invite links that bind one member placeholder to one account.
//!
//! A token is `active` until it is claimed or its expiry passes; both are
//! terminal. Claiming is delegated to the store's conditional write so that
//! racing claimers on different processes still produce a single winner.

use std::sync::Arc;

use chrono::Duration;
use mockable::Clock;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::schemas::{InviteToken, LinkClaim, MemberId, Session};
use crate::stores::InviteStore;

pub const INVITE_LIFETIME_DAYS: i64 = 30;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteLink {
    pub token: InviteToken,
    pub url: String,
    pub share_text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InviteValidation {
    Valid { token: InviteToken },
    NotFound,
    Expired,
    AlreadyClaimed,
}

impl InviteValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

pub struct InviteClaimCoordinator {
    store: Arc<dyn InviteStore>,
    clock: Arc<dyn Clock>,
    base_url: String,
}

impl InviteClaimCoordinator {
    pub fn new(store: Arc<dyn InviteStore>, clock: Arc<dyn Clock>, base_url: &str) -> Self {
        Self {
            store,
            clock,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    pub async fn generate(
        &self,
        session: Option<&Session>,
        target_member_id: MemberId,
        target_member_name: &str,
    ) -> Result<InviteLink, SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        if target_member_id == session.member_id {
            return Err(SyncError::LinkSelfNotAllowed);
        }
        let now = self.clock.utc();
        let token = InviteToken {
            id: Uuid::new_v4(),
            creator_id: session.account_id.clone(),
            creator_email: session.email.clone(),
            target_member_id,
            target_member_name: target_member_name.trim().to_owned(),
            created_at: now,
            expires_at: now + Duration::days(INVITE_LIFETIME_DAYS),
            claimed_by: None,
            claimed_at: None,
        };
        self.store.insert_invite(&token).await?;
        info!(invite_id = %token.id, member_id = %target_member_id, "generated invite");

        let url = format!("{}/{}", self.base_url, token.id);
        let share_text = format!(
            "{} invited you to OpenSplit as {}. Open {} to link your account.",
            session.name, token.target_member_name, url
        );
        Ok(InviteLink {
            token,
            url,
            share_text,
        })
    }

    pub async fn validate(&self, token_id: Uuid) -> Result<InviteValidation, SyncError> {
        let now = self.clock.utc();
        Ok(match self.store.find_invite(token_id).await? {
            None => InviteValidation::NotFound,
            Some(token) if token.is_claimed() => InviteValidation::AlreadyClaimed,
            Some(token) if token.is_expired(now) => InviteValidation::Expired,
            Some(token) => InviteValidation::Valid { token },
        })
    }

    /// Bind the token to the signed-in account. Exactly one of any number of
    /// concurrent claims on the same token succeeds.
    pub async fn claim(
        &self,
        session: Option<&Session>,
        token_id: Uuid,
    ) -> Result<(InviteToken, LinkClaim), SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        let existing = self
            .store
            .find_invite(token_id)
            .await?
            .ok_or_else(|| SyncError::LinkInvalid(token_id.to_string()))?;
        if existing.creator_id == session.account_id {
            return Err(SyncError::LinkSelfNotAllowed);
        }

        let now = self.clock.utc();
        match self
            .store
            .claim_invite(token_id, &session.account_id, now)
            .await?
        {
            Some(token) => {
                info!(invite_id = %token_id, account_id = %session.account_id, "invite claimed");
                let claim = LinkClaim {
                    linked_member_id: token.target_member_id,
                    linked_account_id: session.account_id.clone(),
                    linked_account_email: session.email.clone(),
                };
                Ok((token, claim))
            }
            None => {
                let err = match self.validate(token_id).await? {
                    InviteValidation::NotFound => SyncError::LinkInvalid(token_id.to_string()),
                    InviteValidation::Expired => SyncError::LinkExpired,
                    InviteValidation::AlreadyClaimed | InviteValidation::Valid { .. } => {
                        SyncError::LinkAlreadyClaimed
                    }
                };
                warn!(invite_id = %token_id, error = %err, "invite claim rejected");
                Err(err)
            }
        }
    }

    pub async fn fetch_active(
        &self,
        session: Option<&Session>,
    ) -> Result<Vec<InviteToken>, SyncError> {
        let session = session.ok_or(SyncError::SessionMissing)?;
        self.store
            .active_invites(&session.account_id, self.clock.utc())
            .await
    }

    pub async fn revoke(&self, token_id: Uuid, caller_id: &str) -> Result<(), SyncError> {
        let token = self
            .store
            .find_invite(token_id)
            .await?
            .ok_or_else(|| SyncError::LinkInvalid(token_id.to_string()))?;
        if token.creator_id != caller_id {
            return Err(SyncError::Unauthorized);
        }
        if !self.store.delete_invite(token_id).await? {
            return Err(SyncError::LinkInvalid(token_id.to_string()));
        }
        info!(invite_id = %token_id, "revoked invite");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use rstest::{fixture, rstest};

    use super::*;
    use crate::stores::memory::MemoryInviteStore;
    use crate::test_support::{member_id, session_for, ManualClock};

    struct Harness {
        clock: Arc<ManualClock>,
        coordinator: Arc<InviteClaimCoordinator>,
        creator: Session,
    }

    #[fixture]
    fn harness() -> Harness {
        let clock = ManualClock::shared();
        let coordinator = InviteClaimCoordinator::new(
            Arc::new(MemoryInviteStore::new()),
            clock.clone(),
            "https://opensplit.test/invite/",
        );
        Harness {
            clock,
            coordinator: Arc::new(coordinator),
            creator: session_for("acct-owner", "owner@example.com", 1, "Olive"),
        }
    }

    fn claimer(n: u128) -> Session {
        session_for(&format!("acct-{n}"), &format!("user{n}@example.com"), 100 + n, "Guest")
    }

    #[rstest]
    #[tokio::test]
    async fn generated_invites_expire_after_thirty_days(harness: Harness) {
        let link = harness
            .coordinator
            .generate(Some(&harness.creator), member_id(7), " Sam ")
            .await
            .unwrap();

        assert_eq!(link.url, format!("https://opensplit.test/invite/{}", link.token.id));
        assert!(link.share_text.contains(&link.url));
        assert_eq!(link.token.target_member_name, "Sam");
        assert_eq!(link.token.expires_at - link.token.created_at, Duration::days(30));

        let validation = harness.coordinator.validate(link.token.id).await.unwrap();
        assert!(validation.is_valid());

        harness.clock.advance(Duration::days(30));
        assert_eq!(
            harness.coordinator.validate(link.token.id).await.unwrap(),
            InviteValidation::Expired
        );
        assert!(matches!(
            harness.coordinator.claim(Some(&claimer(1)), link.token.id).await,
            Err(SyncError::LinkExpired)
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn generation_requires_a_session(harness: Harness) {
        assert!(matches!(
            harness.coordinator.generate(None, member_id(7), "Sam").await,
            Err(SyncError::SessionMissing)
        ));
        assert!(matches!(
            harness
                .coordinator
                .generate(Some(&harness.creator), member_id(1), "Me")
                .await,
            Err(SyncError::LinkSelfNotAllowed)
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn claim_returns_the_link_and_blocks_reuse(harness: Harness) {
        let link = harness
            .coordinator
            .generate(Some(&harness.creator), member_id(7), "Sam")
            .await
            .unwrap();
        let sam = claimer(1);

        let (token, claim) = harness
            .coordinator
            .claim(Some(&sam), link.token.id)
            .await
            .unwrap();
        assert_eq!(token.claimed_by.as_deref(), Some("acct-1"));
        assert_eq!(
            claim,
            LinkClaim {
                linked_member_id: member_id(7),
                linked_account_id: "acct-1".to_owned(),
                linked_account_email: "user1@example.com".to_owned(),
            }
        );
        assert!(matches!(
            harness.coordinator.claim(Some(&claimer(2)), link.token.id).await,
            Err(SyncError::LinkAlreadyClaimed)
        ));
        assert!(harness
            .coordinator
            .fetch_active(Some(&harness.creator))
            .await
            .unwrap()
            .is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn creators_cannot_claim_their_own_invites(harness: Harness) {
        let link = harness
            .coordinator
            .generate(Some(&harness.creator), member_id(7), "Sam")
            .await
            .unwrap();
        assert!(matches!(
            harness
                .coordinator
                .claim(Some(&harness.creator), link.token.id)
                .await,
            Err(SyncError::LinkSelfNotAllowed)
        ));
        assert!(matches!(
            harness.coordinator.claim(Some(&claimer(1)), Uuid::nil()).await,
            Err(SyncError::LinkInvalid(_))
        ));
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_concurrent_claim_wins(harness: Harness) {
        let link = harness
            .coordinator
            .generate(Some(&harness.creator), member_id(7), "Sam")
            .await
            .unwrap();

        let attempts = (1..=16).map(|n| {
            let coordinator = Arc::clone(&harness.coordinator);
            let token_id = link.token.id;
            tokio::spawn(async move { coordinator.claim(Some(&claimer(n)), token_id).await })
        });
        let outcomes: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let winners = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(SyncError::LinkAlreadyClaimed)))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 15);
    }

    #[rstest]
    #[tokio::test]
    async fn only_the_creator_may_revoke(harness: Harness) {
        let link = harness
            .coordinator
            .generate(Some(&harness.creator), member_id(7), "Sam")
            .await
            .unwrap();

        assert!(matches!(
            harness.coordinator.revoke(link.token.id, "acct-other").await,
            Err(SyncError::Unauthorized)
        ));
        harness
            .coordinator
            .revoke(link.token.id, "acct-owner")
            .await
            .unwrap();
        assert!(matches!(
            harness.coordinator.revoke(link.token.id, "acct-owner").await,
            Err(SyncError::LinkInvalid(_))
        ));
        assert_eq!(
            harness.coordinator.validate(link.token.id).await.unwrap(),
            InviteValidation::NotFound
        );
    }
}
