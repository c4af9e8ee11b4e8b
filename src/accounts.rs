use std::sync::Arc;

use tracing::info;

use crate::error::SyncError;
use crate::schemas::{Account, LinkClaim};
use crate::stores::AccountStore;

/// Trim and lowercase; anything without an `@` is rejected.
pub fn normalize_email(raw: &str) -> Result<String, SyncError> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(SyncError::InvalidEmail(raw.to_owned())),
    }
}

/// Equality under the same folding `normalize_email` applies.
pub fn same_email(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

pub struct AccountService {
    store: Arc<dyn AccountStore>,
}

impl AccountService {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, email: &str, display_name: &str) -> Result<Account, SyncError> {
        let email = normalize_email(email)?;
        let account = self.store.create_account(&email, display_name.trim()).await?;
        info!(account_id = %account.id, "registered account");
        Ok(account)
    }

    pub async fn lookup(&self, email: &str) -> Result<Account, SyncError> {
        let email = normalize_email(email)?;
        self.store.lookup_account(&email).await
    }

    /// Record a completed link on the stored friend list of `owner_email`.
    pub async fn record_link(&self, owner_email: &str, claim: &LinkClaim) -> Result<(), SyncError> {
        let email = normalize_email(owner_email)?;
        self.store.update_friend_link_status(&email, claim).await
    }
}
