//! Provider adapters. One trait covers both families: the push-capable
//! OAuth provider and the polling IMAP provider. Callers pick an adapter
//! once per account via [`provider_for_account`] and never branch on the
//! provider kind again.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::db::models::{
    Credentials, EmailAccount, NormalizedMessage, OAuthTokens, ProviderKind,
};

pub mod imap;
pub mod outlook;

pub use imap::ImapProvider;
pub use outlook::OutlookProvider;

/// Window during which one task's token refresh is reused by every other
/// task touching the same account instead of refreshing again.
pub const REFRESH_GATE_SECONDS: i64 = 300;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Retryable without operator involvement: rate limits, 5xx, timeouts.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The access credential was rejected. A token refresh may repair it.
    #[error("authorization expired: {0}")]
    AuthExpired(String),

    /// Refresh was already attempted and the credential still fails, or the
    /// refresh grant itself is dead. The account must be re-linked.
    #[error("reconnect required: {0}")]
    ReconnectRequired(String),

    /// The provider no longer knows the referenced resource.
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_reconnect_required(&self) -> bool {
        matches!(self, Self::ReconnectRequired(_))
    }
}

/// A provider call result carrying any credential rotation that happened
/// during the call. Callers persist `refreshed` before acting on `value`;
/// losing a rotated refresh token strands the account.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome<T> {
    pub value: T,
    pub refreshed: Option<OAuthTokens>,
}

impl<T> CallOutcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            refreshed: None,
        }
    }

    pub fn with_refresh(value: T, tokens: OAuthTokens) -> Self {
        Self {
            value,
            refreshed: Some(tokens),
        }
    }
}

pub type ProviderResult<T> = Result<CallOutcome<T>, ProviderError>;

/// Result of a by-id fetch. Ids that failed individually are reported
/// rather than failing the whole batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub messages: Vec<NormalizedMessage>,
    pub failed_ids: Vec<String>,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Newest messages first, up to `limit`.
    async fn fetch_recent(&self, limit: usize) -> ProviderResult<Vec<NormalizedMessage>>;

    /// Messages received at or after `since` (RFC 3339), optionally capped.
    async fn fetch_since(
        &self,
        since: &str,
        limit: Option<usize>,
    ) -> ProviderResult<Vec<NormalizedMessage>>;

    /// Specific messages by provider id; tolerates per-id failure.
    async fn fetch_by_ids(&self, ids: &[String]) -> ProviderResult<FetchReport>;

    async fn mark_read(&self, provider_message_id: &str) -> ProviderResult<()>;

    async fn mark_unread(&self, provider_message_id: &str) -> ProviderResult<()>;

    async fn trash(&self, provider_message_id: &str) -> ProviderResult<()>;

    async fn untrash(&self, provider_message_id: &str) -> ProviderResult<()>;

    async fn add_label(&self, provider_message_id: &str, label: &str) -> ProviderResult<()>;

    async fn remove_label(&self, provider_message_id: &str, label: &str) -> ProviderResult<()>;
}

/// Build the adapter matching an account's provider kind. Credentials are
/// loaded once at account load; mid-call rotations flow back through
/// [`CallOutcome::refreshed`].
pub fn provider_for_account(
    account: &EmailAccount,
    credentials: Credentials,
) -> Result<Box<dyn MailProvider>> {
    match (account.provider, credentials) {
        (ProviderKind::Outlook, Credentials::Oauth(tokens)) => {
            Ok(Box::new(OutlookProvider::new(account.clone(), tokens)?))
        }
        (ProviderKind::Imap, Credentials::Imap(credentials)) => {
            Ok(Box::new(ImapProvider::new(account.clone(), credentials)))
        }
        (provider, _) => anyhow::bail!(
            "account {} is configured for {provider} but its stored credentials are for a different provider",
            account.account_id
        ),
    }
}

struct RefreshGrant {
    refreshed_at: i64,
    tokens: OAuthTokens,
}

static REFRESH_GATES: OnceLock<Mutex<HashMap<String, RefreshGrant>>> = OnceLock::new();

fn refresh_gates() -> &'static Mutex<HashMap<String, RefreshGrant>> {
    REFRESH_GATES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Tokens from a refresh another task already performed for this account
/// within the gate window. `now` is unix seconds.
pub fn recent_refresh(account_id: &str, now: i64) -> Option<OAuthTokens> {
    let gates = refresh_gates().lock().ok()?;
    gates.get(account_id).and_then(|grant| {
        if now - grant.refreshed_at < REFRESH_GATE_SECONDS {
            Some(grant.tokens.clone())
        } else {
            None
        }
    })
}

pub fn record_refresh(account_id: &str, tokens: &OAuthTokens, now: i64) {
    if let Ok(mut gates) = refresh_gates().lock() {
        gates.insert(
            account_id.to_string(),
            RefreshGrant {
                refreshed_at: now,
                tokens: tokens.clone(),
            },
        );
    }
}

/// Forget any gated refresh for an account. Call when an account is
/// re-linked or removed so stale tokens cannot be adopted.
pub fn clear_refresh_gate(account_id: &str) {
    if let Ok(mut gates) = refresh_gates().lock() {
        gates.remove(account_id);
    }
}

/// Split an RFC 2369 List-Unsubscribe header value into its first
/// http(s) target and first mailto target. Entries may or may not be
/// angle-bracketed; unknown schemes are ignored.
pub(crate) fn parse_unsubscribe_value(value: &str) -> (Option<String>, Option<String>) {
    let mut url = None;
    let mut mailto = None;

    for entry in value.split(',') {
        let target = entry
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .trim();
        if target.is_empty() {
            continue;
        }

        if target.starts_with("mailto:") {
            if mailto.is_none() {
                mailto = Some(target.to_string());
            }
        } else if target.starts_with("https://") || target.starts_with("http://") {
            if url.is_none() {
                url = Some(target.to_string());
            }
        }
    }

    (url, mailto)
}

/// Serializes tests that mutate process environment variables.
#[cfg(test)]
pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());
