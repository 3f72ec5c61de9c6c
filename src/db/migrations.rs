//! Ordered schema steps stamped through `sync_state`. Each step runs in
//! its own transaction, so a failed upgrade leaves the database on the
//! last version that fully applied.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::schema;

const SCHEMA_VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial pipeline schema",
    apply: schema::create_schema,
}];

fn latest_version() -> u32 {
    MIGRATIONS.last().map(|step| step.version).unwrap_or(0)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    ensure_version_store(conn)?;

    let applied = recorded_version(conn)?;
    if applied > latest_version() {
        return Err(anyhow!(
            "database schema is at v{applied}, newer than this build's v{}",
            latest_version()
        ));
    }

    for step in MIGRATIONS.iter().filter(|step| step.version > applied) {
        let tx = conn
            .unchecked_transaction()
            .with_context(|| format!("begin migration v{}", step.version))?;
        (step.apply)(&tx)
            .with_context(|| format!("apply migration v{} ({})", step.version, step.name))?;
        record_version(&tx, step.version)?;
        tx.commit()
            .with_context(|| format!("commit migration v{}", step.version))?;
    }

    Ok(())
}

/// The version record lives in `sync_state`, which the v1 step itself
/// creates; bootstrap just that table so a fresh database can be stamped.
fn ensure_version_store(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
    )
    .context("bootstrap the schema version store")
}

fn recorded_version(conn: &Connection) -> Result<u32> {
    let stored: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read recorded schema version")?;

    match stored.flatten() {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .with_context(|| format!("schema version is not a number: {raw}")),
    }
}

fn record_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_state (key, value, updated_at)
         VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![SCHEMA_VERSION_KEY, version.to_string()],
    )
    .with_context(|| format!("record schema version v{version}"))?;

    Ok(())
}
