use anyhow::Result;
use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            email_address TEXT NOT NULL,
            display_name TEXT,
            provider TEXT NOT NULL CHECK(provider IN ('outlook', 'imap')),
            enabled BOOLEAN NOT NULL DEFAULT true,
            initial_sync_complete BOOLEAN NOT NULL DEFAULT false,
            last_sync_at TEXT,
            last_sync_error TEXT,
            subscription_id TEXT,
            credentials TEXT,
            config TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            account_id TEXT REFERENCES accounts(account_id),
            provider_message_id TEXT NOT NULL,
            thread_id TEXT,
            from_address TEXT,
            from_name TEXT,
            to_addresses TEXT,
            cc_addresses TEXT,
            subject TEXT,
            body_text TEXT,
            body_html TEXT,
            received_at TEXT NOT NULL,
            is_read BOOLEAN,
            has_attachments BOOLEAN,
            unsubscribe_url TEXT,
            unsubscribe_mailto TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(account_id),
            provider TEXT NOT NULL,
            external_id TEXT NOT NULL,
            client_state TEXT NOT NULL UNIQUE,
            callback_url TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS analyses (
            message_id TEXT PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            summary TEXT NOT NULL,
            badges TEXT NOT NULL,
            scores TEXT NOT NULL,
            importance_score REAL NOT NULL,
            metadata TEXT,
            model TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS enrichment_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL,
            prompt TEXT,
            response TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            success BOOLEAN NOT NULL,
            error TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_user_provider
            ON messages(user_id, provider_message_id);
        CREATE INDEX IF NOT EXISTS idx_messages_account_id ON messages(account_id);
        CREATE INDEX IF NOT EXISTS idx_messages_received_at ON messages(received_at);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_account_id ON subscriptions(account_id);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_expires_at ON subscriptions(expires_at);
        CREATE INDEX IF NOT EXISTS idx_history_message_id ON enrichment_history(message_id);
        "#,
    )?;

    Ok(())
}
