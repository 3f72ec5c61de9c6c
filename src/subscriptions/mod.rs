//! Push subscription lifecycle. Creates provider webhook registrations
//! before backfill, renews them inside the renewal window, and mints a
//! replacement when the provider reports one already gone. Every
//! subscription carries an unguessable correlation secret the webhook
//! handler checks exactly.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::models::{Credentials, EmailAccount, OAuthTokens, PushSubscription};
use crate::db::Database;
use crate::providers::outlook::{OutlookProvider, SubscriptionHandle};
use crate::providers::ProviderError;

/// Subscriptions expiring within this window get renewed by the sweep.
pub const RENEWAL_WINDOW_MINUTES: i64 = 360;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RenewalReport {
    pub renewed: usize,
    pub replaced: usize,
    pub failed: usize,
}

/// Make sure an account has a live subscription pointing at
/// `callback_url`. Reuses a recorded subscription that is not close to
/// expiry, renews one that is, and creates one from scratch otherwise.
pub async fn ensure_subscription(
    db: &Database,
    account: &EmailAccount,
    callback_url: &str,
) -> Result<PushSubscription> {
    if !account.provider.push_capable() {
        bail!(
            "account {} ({}) cannot take push subscriptions",
            account.account_id,
            account.provider
        );
    }

    if let Some(existing) = db.get_subscription_by_account(&account.account_id)? {
        if existing.expires_at > renewal_cutoff(Utc::now()) {
            debug!(
                "subscription {} for {} still live until {}",
                existing.id, account.account_id, existing.expires_at
            );
            return Ok(existing);
        }
        return renew_or_replace(db, &existing).await;
    }

    let provider = provider_for(db, account)?;
    let client_state = Uuid::new_v4().to_string();
    let mut outcome = provider
        .create_subscription(callback_url, &client_state)
        .await
        .with_context(|| format!("create subscription for {}", account.account_id))?;
    persist_rotated_tokens(db, &account.account_id, outcome.refreshed.take());

    let subscription = subscription_record(account, outcome.value, client_state, callback_url);
    db.insert_subscription(&subscription)?;
    db.set_account_subscription(&account.account_id, Some(&subscription.id))?;
    info!(
        "subscription {} created for {} (expires {})",
        subscription.external_id, account.account_id, subscription.expires_at
    );
    Ok(subscription)
}

/// Renew in place; when the provider says the subscription is already
/// gone, create a replacement and swap the account's reference
/// atomically.
pub async fn renew_or_replace(
    db: &Database,
    subscription: &PushSubscription,
) -> Result<PushSubscription> {
    let Some(account) = db.get_account(&subscription.account_id)? else {
        db.remove_subscription(&subscription.id)?;
        bail!(
            "subscription {} had no account, removed",
            subscription.id
        );
    };

    let provider = provider_for(db, &account)?;
    match provider.renew_subscription(&subscription.external_id).await {
        Ok(mut outcome) => {
            persist_rotated_tokens(db, &account.account_id, outcome.refreshed.take());
            let expires_at = outcome.value;
            db.update_subscription_expiry(&subscription.id, &expires_at)?;
            info!(
                "subscription {} renewed until {expires_at}",
                subscription.external_id
            );
            Ok(PushSubscription {
                expires_at,
                ..subscription.clone()
            })
        }
        Err(ProviderError::NotFound(detail)) => {
            info!(
                "subscription {} gone upstream ({detail}), replacing",
                subscription.external_id
            );
            let client_state = Uuid::new_v4().to_string();
            let mut outcome = provider
                .create_subscription(&subscription.callback_url, &client_state)
                .await
                .with_context(|| {
                    format!("replace subscription for {}", account.account_id)
                })?;
            persist_rotated_tokens(db, &account.account_id, outcome.refreshed.take());

            let replacement = subscription_record(
                &account,
                outcome.value,
                client_state,
                &subscription.callback_url,
            );
            db.replace_subscription(&subscription.id, &replacement)?;
            info!(
                "subscription {} replaced by {} (expires {})",
                subscription.external_id, replacement.external_id, replacement.expires_at
            );
            Ok(replacement)
        }
        Err(error) => Err(error.into()),
    }
}

/// Sweep everything expiring inside the renewal window. Failures are
/// per-subscription; one dead account does not stop the others.
pub async fn run_renewal_check(db: &Database) -> Result<RenewalReport> {
    let cutoff = renewal_cutoff(Utc::now());
    let expiring = db.list_subscriptions_expiring_before(&cutoff)?;
    if expiring.is_empty() {
        return Ok(RenewalReport::default());
    }

    let mut report = RenewalReport::default();
    for subscription in expiring {
        match renew_or_replace(db, &subscription).await {
            Ok(renewed) if renewed.id == subscription.id => report.renewed += 1,
            Ok(_) => report.replaced += 1,
            Err(error) => {
                warn!(
                    "renewal for subscription {} failed: {error:#}",
                    subscription.id
                );
                report.failed += 1;
            }
        }
    }

    info!(
        "renewal sweep: {} renewed, {} replaced, {} failed",
        report.renewed, report.replaced, report.failed
    );
    Ok(report)
}

/// Tear down an account's subscription. Upstream deletion is
/// best-effort: the local record goes away either way, and an orphaned
/// provider registration expires on its own within days.
pub async fn delete_subscription(db: &Database, account: &EmailAccount) -> Result<()> {
    let Some(subscription) = db.get_subscription_by_account(&account.account_id)? else {
        return Ok(());
    };

    match provider_for(db, account) {
        Ok(provider) => match provider.delete_subscription(&subscription.external_id).await {
            Ok(mut outcome) => {
                persist_rotated_tokens(db, &account.account_id, outcome.refreshed.take())
            }
            Err(error) => warn!(
                "delete subscription {} upstream: {error}",
                subscription.external_id
            ),
        },
        Err(error) => warn!(
            "no usable credentials to delete subscription {}: {error:#}",
            subscription.external_id
        ),
    }

    db.remove_subscription(&subscription.id)?;
    db.set_account_subscription(&account.account_id, None)?;
    Ok(())
}

pub(crate) fn persist_rotated_tokens(
    db: &Database,
    account_id: &str,
    refreshed: Option<OAuthTokens>,
) {
    let Some(tokens) = refreshed else { return };
    match db.store_credentials(account_id, &Credentials::Oauth(tokens)) {
        Ok(()) => debug!("rotated oauth tokens persisted for {account_id}"),
        Err(error) => warn!("persist rotated oauth tokens for {account_id}: {error}"),
    }
}

fn provider_for(db: &Database, account: &EmailAccount) -> Result<OutlookProvider> {
    let credentials = db
        .load_credentials(&account.account_id)?
        .with_context(|| format!("account {} has no stored credentials", account.account_id))?;
    let Credentials::Oauth(tokens) = credentials else {
        bail!(
            "account {} does not hold oauth credentials",
            account.account_id
        );
    };
    OutlookProvider::new(account.clone(), tokens)
}

fn renewal_cutoff(now: DateTime<Utc>) -> String {
    (now + Duration::minutes(RENEWAL_WINDOW_MINUTES))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

fn subscription_record(
    account: &EmailAccount,
    handle: SubscriptionHandle,
    client_state: String,
    callback_url: &str,
) -> PushSubscription {
    PushSubscription {
        id: Uuid::new_v4().to_string(),
        account_id: account.account_id.clone(),
        provider: account.provider,
        external_id: handle.external_id,
        client_state,
        callback_url: callback_url.to_string(),
        expires_at: handle.expires_at,
        created_at: None,
        updated_at: None,
    }
}
