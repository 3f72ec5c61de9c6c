use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use self::models::{
    Badge, Credentials, EmailAccount, EnrichedAnalysis, EnrichmentRecord, NormalizedMessage,
    PushSubscription, StoreResult, SyncState,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;
pub mod seal;

const BADGE_VOCABULARY_SCAN_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct AccountMessageCount {
    pub account_id: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub total_accounts: i64,
    pub total_messages: i64,
    pub total_analyses: i64,
    pub total_subscriptions: i64,
    pub messages_by_account: Vec<AccountMessageCount>,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // `mip serve` reads from a second connection while the worker
        // writes; WAL plus a busy timeout keeps both usable.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        self.run_migrations()
    }

    fn run_migrations(&mut self) -> Result<(), DbError> {
        migrations::migrate(&mut self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        if let Some(path) = std::env::var("MIP_DB_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            return Ok(PathBuf::from(path));
        }

        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mip").join("mip.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- Accounts ---

    pub fn insert_account(&self, account: &EmailAccount) -> Result<(), DbError> {
        let config_json = account
            .config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO accounts (
                account_id, user_id, email_address, display_name, provider, enabled,
                initial_sync_complete, last_sync_at, last_sync_error, subscription_id, config
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                account.account_id,
                account.user_id,
                account.email_address,
                account.display_name,
                account.provider.to_string(),
                account.enabled,
                account.initial_sync_complete,
                account.last_sync_at,
                account.last_sync_error,
                account.subscription_id,
                config_json,
            ],
        )?;

        Ok(())
    }

    pub fn get_account(&self, account_id: &str) -> Result<Option<EmailAccount>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT account_id, user_id, email_address, display_name, provider, enabled,
                   initial_sync_complete, last_sync_at, last_sync_error, subscription_id, config
            FROM accounts
            WHERE account_id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([account_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(EmailAccount::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_accounts(&self) -> Result<Vec<EmailAccount>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT account_id, user_id, email_address, display_name, provider, enabled,
                   initial_sync_complete, last_sync_at, last_sync_error, subscription_id, config
            FROM accounts
            ORDER BY email_address ASC
            "#,
        )?;

        let accounts = stmt
            .query_map([], EmailAccount::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn list_enabled_accounts(&self) -> Result<Vec<EmailAccount>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT account_id, user_id, email_address, display_name, provider, enabled,
                   initial_sync_complete, last_sync_at, last_sync_error, subscription_id, config
            FROM accounts
            WHERE enabled = true
            ORDER BY email_address ASC
            "#,
        )?;

        let accounts = stmt
            .query_map([], EmailAccount::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    /// Remove an account together with its messages, analyses, history
    /// and subscription rows. Deletion order respects the foreign keys.
    pub fn remove_account(&self, account_id: &str) -> Result<usize, DbError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r#"
            DELETE FROM enrichment_history
            WHERE message_id IN (SELECT id FROM messages WHERE account_id = ?)
            "#,
            [account_id],
        )?;
        tx.execute("DELETE FROM messages WHERE account_id = ?", [account_id])?;
        tx.execute(
            "DELETE FROM subscriptions WHERE account_id = ?",
            [account_id],
        )?;
        let deleted = tx.execute("DELETE FROM accounts WHERE account_id = ?", [account_id])?;
        tx.commit()?;
        Ok(deleted)
    }

    pub fn set_account_enabled(&self, account_id: &str, enabled: bool) -> Result<usize, DbError> {
        let updated = self.conn.execute(
            "UPDATE accounts SET enabled = ? WHERE account_id = ?",
            params![enabled, account_id],
        )?;
        Ok(updated)
    }

    pub fn mark_sync_success(&self, account_id: &str, synced_at: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE accounts SET last_sync_at = ?, last_sync_error = NULL WHERE account_id = ?",
            params![synced_at, account_id],
        )?;
        Ok(())
    }

    pub fn mark_sync_error(&self, account_id: &str, error: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE accounts SET last_sync_error = ? WHERE account_id = ?",
            params![error, account_id],
        )?;
        Ok(())
    }

    pub fn set_initial_sync_complete(&self, account_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE accounts SET initial_sync_complete = true WHERE account_id = ?",
            [account_id],
        )?;
        Ok(())
    }

    pub fn set_account_subscription(
        &self,
        account_id: &str,
        subscription_id: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE accounts SET subscription_id = ? WHERE account_id = ?",
            params![subscription_id, account_id],
        )?;
        Ok(())
    }

    // --- Credentials ---

    pub fn store_credentials(
        &self,
        account_id: &str,
        credentials: &Credentials,
    ) -> Result<(), DbError> {
        let column = match seal::sealing_key()
            .map_err(|e| DbError::Config(format!("resolve credential key: {e}")))?
        {
            Some(key) => seal::seal_credentials(credentials, &key)
                .map_err(|e| DbError::Config(format!("seal credentials: {e}")))?,
            None => serde_json::to_string(credentials)?,
        };

        self.conn.execute(
            "UPDATE accounts SET credentials = ? WHERE account_id = ?",
            params![column, account_id],
        )?;
        Ok(())
    }

    /// Load an account's credentials, unsealing when a key is configured.
    /// Plain-JSON rows written before a key existed are re-sealed on read.
    pub fn load_credentials(&self, account_id: &str) -> Result<Option<Credentials>, DbError> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT credentials FROM accounts WHERE account_id = ?",
                [account_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(Some(raw)) = raw else {
            return Ok(None);
        };

        let key = seal::sealing_key()
            .map_err(|e| DbError::Config(format!("resolve credential key: {e}")))?;

        if let Some(key) = key {
            match seal::unseal_credentials(&raw, &key) {
                Ok(credentials) => return Ok(Some(credentials)),
                Err(unseal_error) => {
                    if let Ok(plain) = serde_json::from_str::<Credentials>(&raw) {
                        // One-time migration for rows written with no key.
                        self.store_credentials(account_id, &plain)?;
                        return Ok(Some(plain));
                    }
                    return Err(DbError::Config(format!(
                        "unreadable credentials for account {account_id}: {unseal_error}"
                    )));
                }
            }
        }

        match serde_json::from_str::<Credentials>(&raw) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(_) => Err(DbError::Config(format!(
                "credentials for account {account_id} are sealed but {} is not set",
                seal::CREDENTIAL_KEY_ENV
            ))),
        }
    }

    // --- Messages ---

    /// Idempotent upsert keyed by `(user_id, provider_message_id)`. A
    /// conflicting insert is success with `was_new = false` and the
    /// previously stored row's id.
    pub fn store_message(&self, message: &NormalizedMessage) -> Result<StoreResult, DbError> {
        let to_addresses = serde_json::to_string(&message.to_addresses)?;
        let cc_addresses = serde_json::to_string(&message.cc_addresses)?;

        let inserted = self.conn.execute(
            r#"
            INSERT INTO messages (
                id, user_id, account_id, provider_message_id, thread_id, from_address, from_name,
                to_addresses, cc_addresses, subject, body_text, body_html, received_at,
                is_read, has_attachments, unsubscribe_url, unsubscribe_mailto
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, provider_message_id) DO NOTHING
            "#,
            params![
                message.id,
                message.user_id,
                message.account_id,
                message.provider_message_id,
                message.thread_id,
                message.from_address,
                message.from_name,
                to_addresses,
                cc_addresses,
                message.subject,
                message.body_text,
                message.body_html,
                message.received_at,
                message.is_read,
                message.has_attachments,
                message.unsubscribe_url,
                message.unsubscribe_mailto,
            ],
        )?;

        if inserted > 0 {
            return Ok(StoreResult {
                message_id: message.id.clone(),
                was_new: true,
            });
        }

        let existing_id: String = self.conn.query_row(
            "SELECT id FROM messages WHERE user_id = ? AND provider_message_id = ?",
            params![message.user_id, message.provider_message_id],
            |row| row.get(0),
        )?;

        Ok(StoreResult {
            message_id: existing_id,
            was_new: false,
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<NormalizedMessage>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, account_id, provider_message_id, thread_id, from_address, from_name,
                   to_addresses, cc_addresses, subject, body_text, body_html, received_at,
                   is_read, has_attachments, unsubscribe_url, unsubscribe_mailto
            FROM messages
            WHERE id = ?
            "#,
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(NormalizedMessage::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_message_by_provider_id(
        &self,
        user_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<NormalizedMessage>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, account_id, provider_message_id, thread_id, from_address, from_name,
                   to_addresses, cc_addresses, subject, body_text, body_html, received_at,
                   is_read, has_attachments, unsubscribe_url, unsubscribe_mailto
            FROM messages
            WHERE user_id = ? AND provider_message_id = ?
            "#,
        )?;

        let mut rows = stmt.query(params![user_id, provider_message_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(NormalizedMessage::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    // --- Subscriptions ---

    pub fn insert_subscription(&self, subscription: &PushSubscription) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO subscriptions (
                id, account_id, provider, external_id, client_state, callback_url, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                subscription.id,
                subscription.account_id,
                subscription.provider.to_string(),
                subscription.external_id,
                subscription.client_state,
                subscription.callback_url,
                subscription.expires_at,
            ],
        )?;
        Ok(())
    }

    /// In-place renewal: same local row, same external id, new expiry.
    pub fn update_subscription_expiry(
        &self,
        subscription_id: &str,
        expires_at: &str,
    ) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            UPDATE subscriptions
            SET expires_at = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![expires_at, subscription_id],
        )?;
        Ok(())
    }

    /// Replacement after the provider lost the old subscription: delete the
    /// old row, insert the new one, and repoint the account, all in one
    /// transaction.
    pub fn replace_subscription(
        &self,
        old_subscription_id: &str,
        replacement: &PushSubscription,
    ) -> Result<(), DbError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM subscriptions WHERE id = ?",
            [old_subscription_id],
        )?;
        tx.execute(
            r#"
            INSERT INTO subscriptions (
                id, account_id, provider, external_id, client_state, callback_url, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                replacement.id,
                replacement.account_id,
                replacement.provider.to_string(),
                replacement.external_id,
                replacement.client_state,
                replacement.callback_url,
                replacement.expires_at,
            ],
        )?;
        tx.execute(
            "UPDATE accounts SET subscription_id = ? WHERE account_id = ?",
            params![replacement.id, replacement.account_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_subscription(&self, id: &str) -> Result<Option<PushSubscription>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, account_id, provider, external_id, client_state, callback_url,
                   expires_at, created_at, updated_at
            FROM subscriptions
            WHERE id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(PushSubscription::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_subscription_by_account(
        &self,
        account_id: &str,
    ) -> Result<Option<PushSubscription>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, account_id, provider, external_id, client_state, callback_url,
                   expires_at, created_at, updated_at
            FROM subscriptions
            WHERE account_id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([account_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(PushSubscription::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_subscription_by_client_state(
        &self,
        client_state: &str,
    ) -> Result<Option<PushSubscription>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, account_id, provider, external_id, client_state, callback_url,
                   expires_at, created_at, updated_at
            FROM subscriptions
            WHERE client_state = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([client_state])?;
        if let Some(row) = rows.next()? {
            Ok(Some(PushSubscription::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_subscriptions_expiring_before(
        &self,
        cutoff: &str,
    ) -> Result<Vec<PushSubscription>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, account_id, provider, external_id, client_state, callback_url,
                   expires_at, created_at, updated_at
            FROM subscriptions
            WHERE expires_at <= ?
            ORDER BY expires_at ASC
            "#,
        )?;

        let subscriptions = stmt
            .query_map([cutoff], PushSubscription::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subscriptions)
    }

    pub fn remove_subscription(&self, id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM subscriptions WHERE id = ?", [id])?;
        Ok(deleted)
    }

    // --- Enrichment ---

    /// Insert or overwrite the analysis for a message. Re-analysis replaces
    /// in place; `created_at` survives, `updated_at` advances.
    pub fn upsert_analysis(&self, analysis: &EnrichedAnalysis) -> Result<(), DbError> {
        let badges = serde_json::to_string(&analysis.badges)?;
        let scores = serde_json::to_string(&analysis.scores)?;
        let metadata = analysis
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            r#"
            INSERT INTO analyses (message_id, summary, badges, scores, importance_score, metadata, model)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                summary = excluded.summary,
                badges = excluded.badges,
                scores = excluded.scores,
                importance_score = excluded.importance_score,
                metadata = excluded.metadata,
                model = excluded.model,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            "#,
            params![
                analysis.message_id,
                analysis.summary,
                badges,
                scores,
                analysis.importance_score,
                metadata,
                analysis.model,
            ],
        )?;
        Ok(())
    }

    pub fn get_analysis(&self, message_id: &str) -> Result<Option<EnrichedAnalysis>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT message_id, summary, badges, scores, importance_score, metadata, model,
                   created_at, updated_at
            FROM analyses
            WHERE message_id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([message_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(EnrichedAnalysis::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Badge labels this user's past analyses have used, newest first and
    /// deduplicated by name. Feeds the prompt so the model reuses labels
    /// instead of inventing synonyms.
    pub fn badge_vocabulary(&self, user_id: &str, limit: usize) -> Result<Vec<Badge>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT a.badges
            FROM analyses a
            JOIN messages m ON m.id = a.message_id
            WHERE m.user_id = ?
            ORDER BY a.updated_at DESC
            LIMIT ?
            "#,
        )?;

        let rows = stmt
            .query_map(params![user_id, BADGE_VOCABULARY_SCAN_LIMIT as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut seen = Vec::new();
        let mut vocabulary: Vec<Badge> = Vec::new();
        for raw in rows {
            let badges: Vec<Badge> = match serde_json::from_str(&raw) {
                Ok(badges) => badges,
                Err(_) => continue,
            };
            for badge in badges {
                let key = badge.name.trim().to_ascii_lowercase();
                if key.is_empty() || seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                vocabulary.push(badge);
                if vocabulary.len() >= limit {
                    return Ok(vocabulary);
                }
            }
        }

        Ok(vocabulary)
    }

    /// Diagnostic history write. Callers treat failures as non-fatal.
    pub fn insert_enrichment_record(
        &self,
        message_id: &str,
        prompt: Option<&str>,
        response: Option<&str>,
        duration_ms: i64,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO enrichment_history (message_id, prompt, response, duration_ms, success, error)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![message_id, prompt, response, duration_ms, success, error],
        )?;
        Ok(())
    }

    pub fn list_enrichment_records(
        &self,
        message_id: &str,
    ) -> Result<Vec<EnrichmentRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, message_id, prompt, response, duration_ms, success, error, created_at
            FROM enrichment_history
            WHERE message_id = ?
            ORDER BY id DESC
            "#,
        )?;

        let records = stmt
            .query_map([message_id], EnrichmentRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    // --- Sync state ---

    pub fn get_sync_state(&self, key: &str) -> Result<Option<SyncState>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM sync_state WHERE key = ? LIMIT 1")?;
        let mut rows = stmt.query([key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SyncState::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn set_sync_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    pub fn clear_sync_state(&self, key: &str) -> Result<(), DbError> {
        self.conn
            .execute("DELETE FROM sync_state WHERE key = ?", [key])?;
        Ok(())
    }

    // --- Stats ---

    pub fn get_stats(&self) -> Result<PipelineStats, DbError> {
        let total_accounts: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        let total_messages: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let total_analyses: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM analyses", [], |row| row.get(0))?;
        let total_subscriptions: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM subscriptions", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            "SELECT account_id, COUNT(*) AS count FROM messages GROUP BY account_id ORDER BY count DESC",
        )?;
        let messages_by_account = stmt
            .query_map([], |row| {
                Ok(AccountMessageCount {
                    account_id: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(PipelineStats {
            total_accounts,
            total_messages,
            total_analyses,
            total_subscriptions,
            messages_by_account,
        })
    }
}

/// Current UTC time in the RFC 3339 second-precision format every timestamp
/// column uses.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{now_rfc3339, Database};
    use crate::db::models::{
        Badge, Credentials, EmailAccount, EnrichedAnalysis, ImapCredentials, NormalizedMessage,
        ProviderKind, PushSubscription, ScoreSet,
    };
    use uuid::Uuid;

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mip-test-{}.db", Uuid::new_v4()));
        path
    }

    fn sample_account(account_id: &str) -> EmailAccount {
        EmailAccount {
            account_id: account_id.to_string(),
            user_id: "user-1".to_string(),
            email_address: format!("{account_id}@example.com"),
            display_name: Some("Owner".to_string()),
            provider: ProviderKind::Outlook,
            enabled: true,
            initial_sync_complete: false,
            last_sync_at: None,
            last_sync_error: None,
            subscription_id: None,
            config: None,
        }
    }

    fn sample_message(row_id: &str, provider_message_id: &str) -> NormalizedMessage {
        NormalizedMessage {
            id: row_id.to_string(),
            user_id: "user-1".to_string(),
            account_id: "acc-1".to_string(),
            provider_message_id: provider_message_id.to_string(),
            thread_id: Some("conv-1".to_string()),
            from_address: Some("sender@example.com".to_string()),
            from_name: Some("Sender".to_string()),
            to_addresses: vec!["owner@example.com".to_string()],
            cc_addresses: vec![],
            subject: Some("Project kickoff".to_string()),
            body_text: Some("Let us meet tomorrow".to_string()),
            body_html: None,
            received_at: "2026-02-01T12:00:00Z".to_string(),
            is_read: Some(false),
            has_attachments: Some(false),
            unsubscribe_url: None,
            unsubscribe_mailto: None,
        }
    }

    fn sample_subscription(id: &str, account_id: &str, client_state: &str) -> PushSubscription {
        PushSubscription {
            id: id.to_string(),
            account_id: account_id.to_string(),
            provider: ProviderKind::Outlook,
            external_id: format!("ext-{id}"),
            client_state: client_state.to_string(),
            callback_url: "https://mip.example.com/webhooks/mail".to_string(),
            expires_at: "2026-02-04T12:00:00Z".to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn store_message_is_idempotent_per_user_and_provider_id() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.insert_account(&sample_account("acc-1"))
            .expect("insert account");

        let first = db
            .store_message(&sample_message("row-1", "AAMk-1"))
            .expect("first store");
        assert!(first.was_new);
        assert_eq!(first.message_id, "row-1");

        // Same provider message arriving again, e.g. webhook racing a poll.
        let second = db
            .store_message(&sample_message("row-2", "AAMk-1"))
            .expect("second store");
        assert!(!second.was_new);
        assert_eq!(second.message_id, "row-1");

        let stats = db.get_stats().expect("stats");
        assert_eq!(stats.total_messages, 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn distinct_provider_ids_store_separately() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.insert_account(&sample_account("acc-1"))
            .expect("insert account");

        db.store_message(&sample_message("row-1", "AAMk-1"))
            .expect("store one");
        db.store_message(&sample_message("row-2", "AAMk-2"))
            .expect("store two");

        assert_eq!(db.get_stats().expect("stats").total_messages, 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn credentials_round_trip_without_sealing_key() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.insert_account(&sample_account("acc-1"))
            .expect("insert account");

        let credentials = Credentials::Imap(ImapCredentials {
            host: "mail.example.com".to_string(),
            port: 993,
            username: "owner@example.com".to_string(),
            password: "hunter2".to_string(),
        });
        db.store_credentials("acc-1", &credentials)
            .expect("store credentials");

        let loaded = db
            .load_credentials("acc-1")
            .expect("load credentials")
            .expect("credentials exist");
        assert_eq!(loaded, credentials);

        assert!(db
            .load_credentials("acc-missing")
            .expect("load missing account")
            .is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn subscription_lifecycle_and_lookup() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.insert_account(&sample_account("acc-1"))
            .expect("insert account");

        let subscription = sample_subscription("sub-1", "acc-1", "secret-1");
        db.insert_subscription(&subscription)
            .expect("insert subscription");
        db.set_account_subscription("acc-1", Some("sub-1"))
            .expect("point account at subscription");

        let by_secret = db
            .get_subscription_by_client_state("secret-1")
            .expect("lookup by secret")
            .expect("subscription exists");
        assert_eq!(by_secret.id, "sub-1");
        assert!(db
            .get_subscription_by_client_state("wrong-secret")
            .expect("lookup miss")
            .is_none());

        db.update_subscription_expiry("sub-1", "2026-02-07T12:00:00Z")
            .expect("renew in place");
        let renewed = db
            .get_subscription("sub-1")
            .expect("get renewed")
            .expect("still there");
        assert_eq!(renewed.expires_at, "2026-02-07T12:00:00Z");
        assert_eq!(renewed.external_id, "ext-sub-1");

        let expiring = db
            .list_subscriptions_expiring_before("2026-02-08T00:00:00Z")
            .expect("list expiring");
        assert_eq!(expiring.len(), 1);

        let replacement = sample_subscription("sub-2", "acc-1", "secret-2");
        db.replace_subscription("sub-1", &replacement)
            .expect("replace subscription");

        assert!(db
            .get_subscription("sub-1")
            .expect("old gone lookup")
            .is_none());
        let account = db
            .get_account("acc-1")
            .expect("get account")
            .expect("account exists");
        assert_eq!(account.subscription_id.as_deref(), Some("sub-2"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn analysis_upsert_overwrites_in_place() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.insert_account(&sample_account("acc-1"))
            .expect("insert account");
        db.store_message(&sample_message("row-1", "AAMk-1"))
            .expect("store message");

        let mut analysis = EnrichedAnalysis {
            message_id: "row-1".to_string(),
            summary: "Kickoff tomorrow".to_string(),
            badges: vec![Badge {
                name: "Meeting".to_string(),
                color: Some("#2563eb".to_string()),
                icon: Some("calendar".to_string()),
                importance: 0.9,
                category: Some("work".to_string()),
            }],
            scores: ScoreSet {
                urgency: 0.8,
                requires_action: 0.7,
                ..ScoreSet::default()
            },
            importance_score: 0.75,
            metadata: None,
            model: Some("test-model".to_string()),
            created_at: None,
            updated_at: None,
        };
        db.upsert_analysis(&analysis).expect("first upsert");

        analysis.summary = "Rescheduled to Friday".to_string();
        db.upsert_analysis(&analysis).expect("second upsert");

        let stored = db
            .get_analysis("row-1")
            .expect("get analysis")
            .expect("analysis exists");
        assert_eq!(stored.summary, "Rescheduled to Friday");
        assert_eq!(stored.badges.len(), 1);
        assert_eq!(db.get_stats().expect("stats").total_analyses, 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn badge_vocabulary_dedupes_by_name() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.insert_account(&sample_account("acc-1"))
            .expect("insert account");
        db.store_message(&sample_message("row-1", "AAMk-1"))
            .expect("store one");
        db.store_message(&sample_message("row-2", "AAMk-2"))
            .expect("store two");

        for (row, badge_names) in [("row-1", vec!["Finance", "Urgent"]), ("row-2", vec!["finance", "Travel"])] {
            let analysis = EnrichedAnalysis {
                message_id: row.to_string(),
                summary: "s".to_string(),
                badges: badge_names
                    .into_iter()
                    .map(|name| Badge {
                        name: name.to_string(),
                        color: None,
                        icon: None,
                        importance: 0.5,
                        category: None,
                    })
                    .collect(),
                scores: ScoreSet::default(),
                importance_score: 0.5,
                metadata: None,
                model: None,
                created_at: None,
                updated_at: None,
            };
            db.upsert_analysis(&analysis).expect("upsert analysis");
        }

        let vocabulary = db.badge_vocabulary("user-1", 10).expect("vocabulary");
        let names: Vec<&str> = vocabulary.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names.len(), 3, "case-insensitive dedupe: {names:?}");
        assert!(names.contains(&"Urgent"));
        assert!(names.contains(&"Travel"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn enrichment_history_is_recorded_and_listed() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        db.insert_account(&sample_account("acc-1"))
            .expect("insert account");
        db.store_message(&sample_message("row-1", "AAMk-1"))
            .expect("store message");

        db.insert_enrichment_record("row-1", Some("prompt"), Some("{}"), 120, true, None)
            .expect("success record");
        db.insert_enrichment_record("row-1", Some("prompt"), None, 30, false, Some("timeout"))
            .expect("failure record");

        let records = db.list_enrichment_records("row-1").expect("list records");
        assert_eq!(records.len(), 2);
        assert!(!records[0].success, "newest first");
        assert!(records[1].success);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn sync_state_set_get_clear() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        db.set_sync_state("cursor", "abc123").expect("set state");
        let state = db.get_sync_state("cursor").expect("get state");
        assert_eq!(state.expect("state").value.as_deref(), Some("abc123"));

        db.clear_sync_state("cursor").expect("clear state");
        assert!(db.get_sync_state("cursor").expect("get cleared").is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn now_rfc3339_is_second_precision_utc() {
        let now = now_rfc3339();
        assert!(now.ends_with('Z'));
        assert_eq!(now.len(), "2026-01-01T00:00:00Z".len());
    }
}
