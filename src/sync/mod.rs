//! Sync orchestration. Each enabled account moves through
//! NEW → BACKFILLING → STEADY: a one-time bounded historical backfill
//! (push providers get their webhook subscription first, so nothing sent
//! during backfill is missed), then either webhook-driven processing
//! (push) or periodic polling since the last sync point (IMAP). Failures
//! are recorded per account and never stop the rest of a sweep.

pub mod lease;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::models::{EmailAccount, NormalizedMessage, SyncPhase};
use crate::db::{now_rfc3339, Database};
use crate::enrich::{self, CompletionBackend};
use crate::providers::{provider_for_account, MailProvider};
use crate::subscriptions::{self, persist_rotated_tokens};

/// Default historical cap for push-capable providers; overridable per
/// account with the `backfill_limit` config key.
pub const PUSH_BACKFILL_LIMIT: usize = 100;
/// Historical lookback for polling providers.
pub const IMAP_BACKFILL_DAYS: i64 = 30;
/// Steady-state fallback window when an account has never recorded a
/// successful sync.
pub const STEADY_FALLBACK_HOURS: i64 = 24;

const NOTIFICATION_LEASE_ATTEMPTS: usize = 3;
const NOTIFICATION_LEASE_RETRY_SECONDS: u64 = 2;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub fetched: usize,
    pub new_messages: usize,
    pub enriched: usize,
    pub enrichment_failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub accounts: usize,
    pub skipped: usize,
    pub failed: usize,
    pub new_messages: usize,
    pub enriched: usize,
}

/// One pass over every enabled account (optionally narrowed to one by id
/// or address). Takes the per-account lease around each pass so a timer
/// tick, a startup backfill, and a manual sync cannot race on the same
/// account.
pub async fn sweep_accounts(
    db: &Database,
    backend: Arc<dyn CompletionBackend>,
    callback_url: Option<&str>,
    only_account: Option<&str>,
) -> Result<SweepReport> {
    let accounts = db.list_enabled_accounts()?;
    let mut report = SweepReport::default();

    for account in accounts {
        if let Some(only) = only_account {
            if only != account.account_id && only != account.email_address {
                continue;
            }
        }
        report.accounts += 1;

        match lease::acquire(db, &account.account_id, Utc::now()) {
            Ok(true) => {}
            Ok(false) => {
                debug!("account {} is already being synced, skipping", account.account_id);
                report.skipped += 1;
                continue;
            }
            Err(error) => {
                warn!("lease for account {}: {error}", account.account_id);
                report.failed += 1;
                continue;
            }
        }

        let pass = run_account_pass(db, backend.clone(), &account, callback_url).await;

        if let Err(error) = lease::release(db, &account.account_id) {
            warn!("release lease for account {}: {error}", account.account_id);
        }

        match pass {
            Ok(result) => {
                report.new_messages += result.new_messages;
                report.enriched += result.enriched;
            }
            Err(error) => {
                warn!("sync for account {} failed: {error:#}", account.account_id);
                if let Err(db_error) =
                    db.mark_sync_error(&account.account_id, &format!("{error:#}"))
                {
                    warn!("record sync error for {}: {db_error}", account.account_id);
                }
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn run_account_pass(
    db: &Database,
    backend: Arc<dyn CompletionBackend>,
    account: &EmailAccount,
    callback_url: Option<&str>,
) -> Result<PassReport> {
    let provider = build_provider(db, account)?;
    account_pass(db, backend, account, provider.as_ref(), callback_url).await
}

/// One sync pass for one account against an already-built provider.
pub async fn account_pass(
    db: &Database,
    backend: Arc<dyn CompletionBackend>,
    account: &EmailAccount,
    provider: &dyn MailProvider,
    callback_url: Option<&str>,
) -> Result<PassReport> {
    match account.sync_phase() {
        SyncPhase::New | SyncPhase::Backfilling => {
            backfill(db, backend, account, provider, callback_url).await
        }
        SyncPhase::Steady => steady_poll(db, backend, account, provider, callback_url).await,
    }
}

async fn backfill(
    db: &Database,
    backend: Arc<dyn CompletionBackend>,
    account: &EmailAccount,
    provider: &dyn MailProvider,
    callback_url: Option<&str>,
) -> Result<PassReport> {
    info!(
        "backfilling account {} ({})",
        account.account_id, account.email_address
    );

    // Subscribe before fetching so messages arriving mid-backfill still
    // produce a notification.
    if account.provider.push_capable() {
        match callback_url {
            Some(url) => {
                subscriptions::ensure_subscription(db, account, url).await?;
            }
            None => warn!(
                "no callback url configured, backfilling {} without a push subscription",
                account.account_id
            ),
        }
    }

    let mut outcome = if account.provider.push_capable() {
        provider.fetch_recent(backfill_limit(account)).await?
    } else {
        let since = (Utc::now() - Duration::days(IMAP_BACKFILL_DAYS))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        provider.fetch_since(&since, None).await?
    };
    persist_rotated_tokens(db, &account.account_id, outcome.refreshed.take());

    let report = process_batch(db, backend, &outcome.value).await?;

    db.set_initial_sync_complete(&account.account_id)?;
    db.mark_sync_success(&account.account_id, &now_rfc3339())?;
    info!(
        "backfill for {} done: {} fetched, {} new, {} enriched",
        account.account_id, report.fetched, report.new_messages, report.enriched
    );
    Ok(report)
}

async fn steady_poll(
    db: &Database,
    backend: Arc<dyn CompletionBackend>,
    account: &EmailAccount,
    provider: &dyn MailProvider,
    callback_url: Option<&str>,
) -> Result<PassReport> {
    // Push accounts are driven by webhook notifications, not the timer.
    // The tick still re-establishes a subscription that is gone, either
    // deleted upstream or never created because the account was
    // backfilled before a callback URL existed.
    if account.provider.push_capable() {
        if let Some(url) = callback_url {
            subscriptions::ensure_subscription(db, account, url).await?;
        }
        return Ok(PassReport::default());
    }

    let since = account.last_sync_at.clone().unwrap_or_else(|| {
        (Utc::now() - Duration::hours(STEADY_FALLBACK_HOURS))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string()
    });

    let mut outcome = provider.fetch_since(&since, None).await?;
    persist_rotated_tokens(db, &account.account_id, outcome.refreshed.take());

    let report = process_batch(db, backend, &outcome.value).await?;
    db.mark_sync_success(&account.account_id, &now_rfc3339())?;

    if report.new_messages > 0 {
        info!(
            "poll for {}: {} fetched since {since}, {} new, {} enriched",
            account.account_id, report.fetched, report.new_messages, report.enriched
        );
    }
    Ok(report)
}

/// Store then enrich a batch. Only messages that were actually new reach
/// the enrichment pass; re-ingesting an already-stored id is a no-op.
pub async fn process_batch(
    db: &Database,
    backend: Arc<dyn CompletionBackend>,
    messages: &[NormalizedMessage],
) -> Result<PassReport> {
    let mut report = PassReport {
        fetched: messages.len(),
        ..PassReport::default()
    };

    let mut fresh = Vec::new();
    for message in messages {
        let stored = db.store_message(message)?;
        if stored.was_new {
            fresh.push(message.clone());
        }
    }
    report.new_messages = fresh.len();

    if !fresh.is_empty() {
        let summary = enrich::enrich_batch(db, backend, &fresh).await?;
        report.enriched = summary.enriched;
        report.enrichment_failed = summary.failed;
    }

    Ok(report)
}

/// Targeted fetch for webhook notifications: resolve the account, take
/// its lease (waiting briefly if a sweep holds it), fetch the named
/// messages, and run them through the same store-then-enrich chain.
pub async fn notification_fetch_job(
    db: &Database,
    backend: Arc<dyn CompletionBackend>,
    account_id: &str,
    provider_message_ids: &[String],
) -> Result<PassReport> {
    let account = db
        .get_account(account_id)?
        .with_context(|| format!("account {account_id} not found"))?;

    let mut acquired = false;
    for attempt in 0..NOTIFICATION_LEASE_ATTEMPTS {
        if lease::acquire(db, account_id, Utc::now())? {
            acquired = true;
            break;
        }
        if attempt + 1 < NOTIFICATION_LEASE_ATTEMPTS {
            tokio::time::sleep(std::time::Duration::from_secs(
                NOTIFICATION_LEASE_RETRY_SECONDS,
            ))
            .await;
        }
    }
    if !acquired {
        warn!(
            "account {account_id} stayed leased, dropping notification fetch for {} ids",
            provider_message_ids.len()
        );
        return Ok(PassReport::default());
    }

    let result = async {
        let provider = build_provider(db, &account)?;
        process_notification_fetch(
            db,
            backend,
            &account,
            provider.as_ref(),
            provider_message_ids,
        )
        .await
    }
    .await;

    if let Err(error) = lease::release(db, account_id) {
        warn!("release lease for account {account_id}: {error}");
    }

    if let Err(error) = &result {
        warn!("notification fetch for {account_id} failed: {error:#}");
        if let Err(db_error) = db.mark_sync_error(account_id, &format!("{error:#}")) {
            warn!("record sync error for {account_id}: {db_error}");
        }
    }
    result
}

/// Lease-free core of the webhook fetch path.
pub async fn process_notification_fetch(
    db: &Database,
    backend: Arc<dyn CompletionBackend>,
    account: &EmailAccount,
    provider: &dyn MailProvider,
    provider_message_ids: &[String],
) -> Result<PassReport> {
    let mut outcome = provider.fetch_by_ids(provider_message_ids).await?;
    persist_rotated_tokens(db, &account.account_id, outcome.refreshed.take());

    let fetch_report = outcome.value;
    if !fetch_report.failed_ids.is_empty() {
        warn!(
            "account {}: {} of {} notified messages could not be fetched",
            account.account_id,
            fetch_report.failed_ids.len(),
            provider_message_ids.len()
        );
    }

    let report = process_batch(db, backend, &fetch_report.messages).await?;
    db.mark_sync_success(&account.account_id, &now_rfc3339())?;
    Ok(report)
}

fn build_provider(db: &Database, account: &EmailAccount) -> Result<Box<dyn MailProvider>> {
    let credentials = db
        .load_credentials(&account.account_id)?
        .with_context(|| format!("account {} has no stored credentials", account.account_id))?;
    provider_for_account(account, credentials)
}

fn backfill_limit(account: &EmailAccount) -> usize {
    account
        .config_usize("backfill_limit")
        .unwrap_or(PUSH_BACKFILL_LIMIT)
}
