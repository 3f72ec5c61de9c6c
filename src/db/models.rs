use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Push-capable OAuth provider (Graph-shaped REST + webhook subscriptions).
    Outlook,
    /// Password-authenticated polling provider.
    Imap,
}

impl ProviderKind {
    pub fn push_capable(self) -> bool {
        matches!(self, Self::Outlook)
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Outlook => write!(f, "outlook"),
            Self::Imap => write!(f, "imap"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outlook" => Ok(Self::Outlook),
            "imap" => Ok(Self::Imap),
            other => Err(format!("invalid provider kind: {other}")),
        }
    }
}

/// Sync phase derived from persisted account state. `Backfilling` means a
/// backfill has been attempted but has not completed yet.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    New,
    Backfilling,
    Steady,
}

impl Display for SyncPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Steady => write!(f, "steady"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailAccount {
    pub account_id: String,
    pub user_id: String,
    pub email_address: String,
    pub display_name: Option<String>,
    pub provider: ProviderKind,
    pub enabled: bool,
    pub initial_sync_complete: bool,
    pub last_sync_at: Option<String>,
    pub last_sync_error: Option<String>,
    /// Local row id of the account's PushSubscription, when one exists.
    pub subscription_id: Option<String>,
    pub config: Option<serde_json::Value>,
}

impl EmailAccount {
    pub fn sync_phase(&self) -> SyncPhase {
        if self.initial_sync_complete {
            SyncPhase::Steady
        } else if self.last_sync_at.is_some() || self.last_sync_error.is_some() {
            SyncPhase::Backfilling
        } else {
            SyncPhase::New
        }
    }

    /// String config lookup with the same trim/empty filtering the rest of
    /// the codebase applies to env vars.
    pub fn config_string(&self, key: &str) -> Option<String> {
        self.config
            .as_ref()
            .and_then(|config| config.get(key))
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn config_usize(&self, key: &str) -> Option<usize> {
        self.config
            .as_ref()
            .and_then(|config| config.get(key))
            .and_then(|value| value.as_u64())
            .map(|value| value as usize)
    }
}

/// OAuth access/refresh token pair for the push provider family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// RFC 3339; `None` means "unknown, treat as expired".
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImapCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Per-account secret material, stored in the `credentials` column either
/// sealed (AES-256-GCM envelope) or as plain JSON when no key is configured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Credentials {
    Oauth(OAuthTokens),
    Imap(ImapCredentials),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedMessage {
    /// Local row id (UUIDv4). On a duplicate store the previously stored
    /// row's id wins; see `Database::store_message`.
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub received_at: String,
    pub is_read: Option<bool>,
    pub has_attachments: Option<bool>,
    pub unsubscribe_url: Option<String>,
    pub unsubscribe_mailto: Option<String>,
}

/// Outcome of a message upsert: the surviving row id and whether this call
/// created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResult {
    pub message_id: String,
    pub was_new: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushSubscription {
    pub id: String,
    pub account_id: String,
    pub provider: ProviderKind,
    /// Provider-side subscription id; changes when the subscription is
    /// replaced after expiry.
    pub external_id: String,
    /// Correlation secret echoed by every inbound notification.
    pub client_state: String,
    pub callback_url: String,
    pub expires_at: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Badge {
    pub name: String,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub importance: f64,
    pub category: Option<String>,
}

/// The fixed set of named scores every analysis carries, each in [0,1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ScoreSet {
    pub work_related: f64,
    pub personal: f64,
    pub urgency: f64,
    pub financial: f64,
    pub social: f64,
    pub promotional: f64,
    pub requires_action: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedAnalysis {
    pub message_id: String,
    pub summary: String,
    pub badges: Vec<Badge>,
    pub scores: ScoreSet,
    /// Derived master importance, weighted over `scores` plus badge boosts.
    pub importance_score: f64,
    pub metadata: Option<serde_json::Value>,
    pub model: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Diagnostic history of one enrichment attempt. Best-effort: writes may
/// fail without affecting the message or its analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentRecord {
    pub id: i64,
    pub message_id: String,
    pub prompt: Option<String>,
    pub response: Option<String>,
    pub duration_ms: i64,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<String>,
}

fn parse_json_array(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

fn parse_json_value(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
}

fn provider_from_column(raw: String) -> SqlResult<ProviderKind> {
    ProviderKind::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            raw.len(),
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

impl EmailAccount {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let provider = provider_from_column(row.get("provider")?)?;

        Ok(Self {
            account_id: row.get("account_id")?,
            user_id: row.get("user_id")?,
            email_address: row.get("email_address")?,
            display_name: row.get("display_name")?,
            provider,
            enabled: row.get("enabled")?,
            initial_sync_complete: row.get("initial_sync_complete")?,
            last_sync_at: row.get("last_sync_at")?,
            last_sync_error: row.get("last_sync_error")?,
            subscription_id: row.get("subscription_id")?,
            config: parse_json_value(row.get("config")?),
        })
    }
}

impl NormalizedMessage {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            account_id: row.get("account_id")?,
            provider_message_id: row.get("provider_message_id")?,
            thread_id: row.get("thread_id")?,
            from_address: row.get("from_address")?,
            from_name: row.get("from_name")?,
            to_addresses: parse_json_array(row.get("to_addresses")?),
            cc_addresses: parse_json_array(row.get("cc_addresses")?),
            subject: row.get("subject")?,
            body_text: row.get("body_text")?,
            body_html: row.get("body_html")?,
            received_at: row.get("received_at")?,
            is_read: row.get("is_read")?,
            has_attachments: row.get("has_attachments")?,
            unsubscribe_url: row.get("unsubscribe_url")?,
            unsubscribe_mailto: row.get("unsubscribe_mailto")?,
        })
    }
}

impl PushSubscription {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let provider = provider_from_column(row.get("provider")?)?;

        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            provider,
            external_id: row.get("external_id")?,
            client_state: row.get("client_state")?,
            callback_url: row.get("callback_url")?,
            expires_at: row.get("expires_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl EnrichedAnalysis {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let badges_raw: String = row.get("badges")?;
        let scores_raw: String = row.get("scores")?;

        Ok(Self {
            message_id: row.get("message_id")?,
            summary: row.get("summary")?,
            badges: serde_json::from_str(&badges_raw).unwrap_or_default(),
            scores: serde_json::from_str(&scores_raw).unwrap_or_default(),
            importance_score: row.get("importance_score")?,
            metadata: parse_json_value(row.get("metadata")?),
            model: row.get("model")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl EnrichmentRecord {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            prompt: row.get("prompt")?,
            response: row.get("response")?,
            duration_ms: row.get("duration_ms")?,
            success: row.get("success")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl SyncState {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Credentials, EmailAccount, ImapCredentials, NormalizedMessage, ProviderKind, SyncPhase,
    };

    fn account(initial_sync_complete: bool, last_sync_at: Option<&str>) -> EmailAccount {
        EmailAccount {
            account_id: "acc-1".to_string(),
            user_id: "user-1".to_string(),
            email_address: "person@example.com".to_string(),
            display_name: Some("Person".to_string()),
            provider: ProviderKind::Outlook,
            enabled: true,
            initial_sync_complete,
            last_sync_at: last_sync_at.map(str::to_string),
            last_sync_error: None,
            subscription_id: None,
            config: None,
        }
    }

    #[test]
    fn provider_kind_display_and_parse() {
        assert_eq!(ProviderKind::Outlook.to_string(), "outlook");
        assert_eq!(
            "imap".parse::<ProviderKind>().expect("parse provider"),
            ProviderKind::Imap
        );
        assert!(ProviderKind::Outlook.push_capable());
        assert!(!ProviderKind::Imap.push_capable());
    }

    #[test]
    fn sync_phase_follows_persisted_state() {
        assert_eq!(account(false, None).sync_phase(), SyncPhase::New);
        assert_eq!(
            account(false, Some("2026-03-01T00:00:00Z")).sync_phase(),
            SyncPhase::Backfilling
        );
        assert_eq!(
            account(true, Some("2026-03-01T00:00:00Z")).sync_phase(),
            SyncPhase::Steady
        );
    }

    #[test]
    fn credentials_serde_round_trip() {
        let creds = Credentials::Imap(ImapCredentials {
            host: "mail.example.com".to_string(),
            port: 993,
            username: "person@example.com".to_string(),
            password: "hunter2".to_string(),
        });

        let json = serde_json::to_string(&creds).expect("serialize credentials");
        let back: Credentials = serde_json::from_str(&json).expect("deserialize credentials");
        assert_eq!(back, creds);
    }

    #[test]
    fn config_string_trims_and_filters_empty() {
        let mut acc = account(false, None);
        acc.config = Some(serde_json::json!({
            "client_id": "  abc  ",
            "blank": "   ",
            "backfill_limit": 25
        }));

        assert_eq!(acc.config_string("client_id").as_deref(), Some("abc"));
        assert_eq!(acc.config_string("blank"), None);
        assert_eq!(acc.config_string("missing"), None);
        assert_eq!(acc.config_usize("backfill_limit"), Some(25));
    }

    #[test]
    fn normalized_message_serde_round_trip() {
        let message = NormalizedMessage {
            id: "row-1".to_string(),
            user_id: "user-1".to_string(),
            account_id: "acc-1".to_string(),
            provider_message_id: "AAMk-123".to_string(),
            thread_id: Some("conv-1".to_string()),
            from_address: Some("sender@example.com".to_string()),
            from_name: Some("Sender".to_string()),
            to_addresses: vec!["person@example.com".to_string()],
            cc_addresses: vec![],
            subject: Some("Invoice attached".to_string()),
            body_text: Some("See attached".to_string()),
            body_html: None,
            received_at: "2026-02-01T12:00:00Z".to_string(),
            is_read: Some(false),
            has_attachments: Some(true),
            unsubscribe_url: None,
            unsubscribe_mailto: None,
        };

        let json = serde_json::to_string(&message).expect("serialize message");
        let back: NormalizedMessage = serde_json::from_str(&json).expect("deserialize message");
        assert_eq!(back, message);
    }
}
