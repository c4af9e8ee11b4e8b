//! Error taxonomy shared by the reconciliation core, the stores and the HTTP layer.

use thiserror::Error;
use uuid::Uuid;

use crate::schemas::MemberId;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The operation needs a signed-in session and none is active.
    #[error("no active session")]
    SessionMissing,
    #[error("invalid email address: {0:?}")]
    InvalidEmail(String),
    #[error("no account registered for {0}")]
    AccountNotFound(String),
    #[error("an account is already registered for {0}")]
    AccountDuplicate(String),

    #[error("network error: {0}")]
    Network(String),
    #[error("remote request timed out")]
    Timeout,
    #[error("remote api responded with status {status}")]
    Api { status: u16 },

    #[error("expense amount must be greater than zero")]
    ExpenseInvalidAmount,
    #[error("splits add up to {splits:.2} but the expense total is {total:.2}")]
    ExpenseSplitMismatch { total: f64, splits: f64 },
    #[error("expense {0} not found")]
    ExpenseNotFound(Uuid),
    #[error("group {0} not found")]
    GroupNotFound(Uuid),
    #[error("invalid group configuration: {0}")]
    GroupInvalidConfiguration(String),

    #[error("link has expired")]
    LinkExpired,
    #[error("link has already been claimed")]
    LinkAlreadyClaimed,
    #[error("link is invalid: {0}")]
    LinkInvalid(String),
    #[error("cannot link an account to itself")]
    LinkSelfNotAllowed,
    #[error("a pending link request already exists for this member")]
    LinkDuplicateRequest,
    #[error("member {0} is already linked to another account")]
    LinkMemberAlreadyLinked(MemberId),
    #[error("account {0} is already linked to another member")]
    LinkAccountAlreadyLinked(String),
    #[error("caller is not allowed to perform this operation")]
    Unauthorized,

    #[error("missing configuration: {0}")]
    ConfigurationMissing(&'static str),
    #[error(transparent)]
    Underlying(Box<dyn std::error::Error + Send + Sync>),
}

impl SyncError {
    pub fn underlying(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Underlying(Box::new(err))
    }

    /// Stable snake_case code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionMissing => "session_missing",
            Self::InvalidEmail(_) => "invalid_email",
            Self::AccountNotFound(_) => "account_not_found",
            Self::AccountDuplicate(_) => "account_duplicate",
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::Api { .. } => "api",
            Self::ExpenseInvalidAmount => "expense_invalid_amount",
            Self::ExpenseSplitMismatch { .. } => "expense_split_mismatch",
            Self::ExpenseNotFound(_) => "expense_not_found",
            Self::GroupNotFound(_) => "group_not_found",
            Self::GroupInvalidConfiguration(_) => "group_invalid_configuration",
            Self::LinkExpired => "link_expired",
            Self::LinkAlreadyClaimed => "link_already_claimed",
            Self::LinkInvalid(_) => "link_invalid",
            Self::LinkSelfNotAllowed => "link_self_not_allowed",
            Self::LinkDuplicateRequest => "link_duplicate_request",
            Self::LinkMemberAlreadyLinked(_) => "link_member_already_linked",
            Self::LinkAccountAlreadyLinked(_) => "link_account_already_linked",
            Self::Unauthorized => "unauthorized",
            Self::ConfigurationMissing(_) => "configuration_missing",
            Self::Underlying(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::underlying(err)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::underlying(err)
    }
}
