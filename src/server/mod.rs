//! HTTP surface for push notifications plus the background loops that
//! keep accounts current: a fetch worker draining webhook jobs, a
//! periodic poll sweep (whose first tick doubles as the startup
//! backfill), and a subscription renewal check. The webhook handler
//! itself only authenticates and enqueues; fetching, dedup and
//! enrichment all happen off the request path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::enrich::CompletionBackend;
use crate::subscriptions;
use crate::sync;

/// Route the provider calls back on; joined onto the public base URL
/// when subscriptions are created.
pub const WEBHOOK_PATH: &str = "/webhooks/mail";

/// Notifications waiting for the fetch worker. The queue is bounded so
/// a notification storm cannot pile up unbounded work. A dropped job is
/// not recovered by the poll sweep (push accounts fetch nothing on the
/// tick); its messages wait for the next notification that names them.
const FETCH_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Publicly reachable base URL. Without one, push subscriptions are
    /// not created and push accounts fall back to polling only.
    pub base_url: Option<String>,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub renewal_interval: Duration,
}

/// A targeted fetch queued by the webhook handler.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FetchJob {
    account_id: String,
    message_ids: Vec<String>,
}

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    jobs: mpsc::Sender<FetchJob>,
}

pub async fn run_server(config: ServerConfig, backend: Arc<dyn CompletionBackend>) -> Result<()> {
    // One connection per loop; WAL mode in `Database::open` keeps the
    // handler, the worker and the tickers from blocking each other.
    let handler_db = Database::open(&config.db_path)?;
    let worker_db = Database::open(&config.db_path)?;
    let poll_db = Database::open(&config.db_path)?;
    let renewal_db = Database::open(&config.db_path)?;

    let callback_url = config.base_url.as_deref().map(callback_url_from_base);
    if callback_url.is_none() {
        warn!("no public base URL configured, push subscriptions will not be created");
    }

    let (jobs_tx, jobs_rx) = mpsc::channel(FETCH_QUEUE_DEPTH);
    let state = AppState {
        db: Arc::new(Mutex::new(handler_db)),
        jobs: jobs_tx,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route(
            WEBHOOK_PATH,
            get(receive_notification).post(receive_notification),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!("listening on {}", listener.local_addr()?);

    // The loops hold their database connections across awaits, which
    // keeps their futures off `tokio::spawn`; racing them against the
    // server on this task works because every step in them yields.
    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()) => {
            result.context("serve webhook endpoint")?;
        }
        _ = fetch_worker(worker_db, backend.clone(), jobs_rx) => {}
        _ = poll_ticker(poll_db, backend, callback_url, config.poll_interval) => {}
        _ = renewal_ticker(renewal_db, config.renewal_interval) => {}
    }

    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {error}");
        return;
    }
    info!("shutdown signal received");
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
struct ValidationParams {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

/// Envelope posted by the provider; a malformed one is acknowledged and
/// dropped rather than rejected, since any non-200 only provokes
/// retries of the same payload.
#[derive(Debug, Deserialize)]
struct NotificationEnvelope {
    #[serde(default)]
    value: Vec<ChangeNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeNotification {
    subscription_id: Option<String>,
    client_state: Option<String>,
    change_type: Option<String>,
    resource_data: Option<ResourceData>,
}

#[derive(Debug, Deserialize)]
struct ResourceData {
    id: Option<String>,
}

/// Both provider branches land here: subscription validation requests
/// get their token echoed back as plain text before any processing, and
/// change notifications are authenticated, queued and acknowledged
/// without touching the network.
async fn receive_notification(
    State(state): State<AppState>,
    params: Option<Query<ValidationParams>>,
    body: axum::body::Bytes,
) -> Response {
    if let Some(token) = params.and_then(|Query(params)| params.validation_token) {
        return ([(header::CONTENT_TYPE, "text/plain")], token).into_response();
    }

    let body = String::from_utf8_lossy(&body);
    if let Some(token) = validation_token_in_body(&body) {
        return ([(header::CONTENT_TYPE, "text/plain")], token).into_response();
    }

    let events = parse_envelope(&body);
    let jobs = {
        let db = state
            .db
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        route_events(&db, &events)
    };
    let accepted: usize = jobs.iter().map(|job| job.message_ids.len()).sum();
    for job in jobs {
        if let Err(error) = state.jobs.try_send(job) {
            warn!("fetch queue rejected a notification job: {error}");
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "status": "received", "accepted": accepted })),
    )
        .into_response()
}

/// Some validation requests put the token in a JSON body instead of the
/// query string.
fn validation_token_in_body(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("validationToken")?
        .as_str()
        .map(str::to_string)
}

fn parse_envelope(body: &str) -> Vec<ChangeNotification> {
    match serde_json::from_str::<NotificationEnvelope>(body) {
        Ok(envelope) => envelope.value,
        Err(error) => {
            debug!("ignoring unparseable notification body: {error}");
            Vec::new()
        }
    }
}

/// Match each event's correlation secret against a stored subscription
/// and group the surviving message ids per account. Unknown secrets and
/// echoes from replaced subscriptions are dropped without an error.
fn route_events(db: &Database, events: &[ChangeNotification]) -> Vec<FetchJob> {
    let mut by_account: HashMap<String, Vec<String>> = HashMap::new();

    for event in events {
        let Some(client_state) = event.client_state.as_deref() else {
            debug!("dropping notification without a client state");
            continue;
        };
        let subscription = match db.get_subscription_by_client_state(client_state) {
            Ok(Some(subscription)) => subscription,
            Ok(None) => {
                debug!("dropping notification with unknown client state");
                continue;
            }
            Err(error) => {
                warn!("subscription lookup failed: {error}");
                continue;
            }
        };
        // A replaced subscription keeps its account but gets a new
        // external id; late echoes from the old one no longer match.
        if event.subscription_id.as_deref() != Some(subscription.external_id.as_str()) {
            debug!(
                "dropping notification for stale subscription {:?} (current is {})",
                event.subscription_id, subscription.external_id
            );
            continue;
        }
        if event.change_type.as_deref() == Some("deleted") {
            continue;
        }
        let Some(id) = event.resource_data.as_ref().and_then(|data| data.id.clone()) else {
            debug!("dropping notification without a resource id");
            continue;
        };
        by_account
            .entry(subscription.account_id.clone())
            .or_default()
            .push(id);
    }

    by_account
        .into_iter()
        .map(|(account_id, message_ids)| FetchJob {
            account_id,
            message_ids,
        })
        .collect()
}

/// Drains webhook jobs one at a time. Failures are already logged and
/// recorded on the account inside the fetch itself.
async fn fetch_worker(
    db: Database,
    backend: Arc<dyn CompletionBackend>,
    mut jobs: mpsc::Receiver<FetchJob>,
) {
    while let Some(job) = jobs.recv().await {
        if let Ok(report) =
            sync::notification_fetch_job(&db, backend.clone(), &job.account_id, &job.message_ids)
                .await
        {
            if report.new_messages > 0 {
                info!(
                    "account {}: stored {} pushed message(s)",
                    job.account_id, report.new_messages
                );
            }
        }
    }
}

async fn poll_ticker(
    db: Database,
    backend: Arc<dyn CompletionBackend>,
    callback_url: Option<String>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        // The first tick completes immediately, which is the startup
        // sweep that backfills any account not yet marked complete.
        ticker.tick().await;
        match sync::sweep_accounts(&db, backend.clone(), callback_url.as_deref(), None).await {
            Ok(report) => {
                if report.new_messages > 0 || report.failed > 0 {
                    info!(
                        "sweep: {} account(s), {} new message(s), {} failed",
                        report.accounts, report.new_messages, report.failed
                    );
                }
            }
            Err(error) => error!("poll sweep failed: {error:#}"),
        }
    }
}

async fn renewal_ticker(db: Database, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match subscriptions::run_renewal_check(&db).await {
            Ok(report) => {
                if report.renewed > 0 || report.replaced > 0 || report.failed > 0 {
                    info!(
                        "subscription renewal: {} renewed, {} replaced, {} failed",
                        report.renewed, report.replaced, report.failed
                    );
                }
            }
            Err(error) => error!("subscription renewal check failed: {error:#}"),
        }
    }
}

fn callback_url_from_base(base: &str) -> String {
    format!("{}{WEBHOOK_PATH}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{callback_url_from_base, parse_envelope, route_events, validation_token_in_body};
    use crate::db::models::{EmailAccount, ProviderKind, PushSubscription};
    use crate::db::Database;

    fn temp_db() -> Database {
        let path = std::env::temp_dir().join(format!("mip-server-{}.db", Uuid::new_v4()));
        Database::open(&path).expect("open temp db")
    }

    fn outlook_account(account_id: &str) -> EmailAccount {
        EmailAccount {
            account_id: account_id.to_string(),
            user_id: "user-1".to_string(),
            email_address: format!("{account_id}@example.com"),
            display_name: None,
            provider: ProviderKind::Outlook,
            enabled: true,
            initial_sync_complete: true,
            last_sync_at: None,
            last_sync_error: None,
            subscription_id: None,
            config: None,
        }
    }

    fn subscription(account_id: &str, external_id: &str, client_state: &str) -> PushSubscription {
        PushSubscription {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            provider: ProviderKind::Outlook,
            external_id: external_id.to_string(),
            client_state: client_state.to_string(),
            callback_url: "https://mip.example.com/webhooks/mail".to_string(),
            expires_at: "2026-03-01T00:00:00Z".to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn callback_url_joins_onto_the_base() {
        assert_eq!(
            callback_url_from_base("https://mip.example.com"),
            "https://mip.example.com/webhooks/mail"
        );
        assert_eq!(
            callback_url_from_base("https://mip.example.com/"),
            "https://mip.example.com/webhooks/mail"
        );
    }

    #[test]
    fn validation_token_is_found_in_json_bodies_only() {
        assert_eq!(
            validation_token_in_body(r#"{"validationToken": "abc-123"}"#).as_deref(),
            Some("abc-123")
        );
        assert_eq!(validation_token_in_body(r#"{"value": []}"#), None);
        assert_eq!(validation_token_in_body("not json"), None);
        assert_eq!(
            validation_token_in_body(r#"{"validationToken": 7}"#),
            None,
            "non-string tokens are not echoed"
        );
    }

    #[test]
    fn malformed_bodies_parse_to_nothing() {
        assert!(parse_envelope("not json at all").is_empty());
        assert!(parse_envelope("{}").is_empty());

        // Partial events survive the parse and are dropped in routing.
        let events = parse_envelope(r#"{"value": [{"changeType": "created"}]}"#);
        assert_eq!(events.len(), 1);

        let db = temp_db();
        assert!(route_events(&db, &events).is_empty());
    }

    #[test]
    fn unknown_client_state_is_dropped() {
        let db = temp_db();
        let events = parse_envelope(
            r#"{"value": [{
                "subscriptionId": "sub-1",
                "clientState": "never-issued",
                "changeType": "created",
                "resourceData": {"id": "AAMk-1"}
            }]}"#,
        );

        assert!(route_events(&db, &events).is_empty());
    }

    #[test]
    fn stale_external_id_is_dropped() {
        let db = temp_db();
        db.insert_account(&outlook_account("acc-1"))
            .expect("insert account");
        db.insert_subscription(&subscription("acc-1", "sub-current", "secret-1"))
            .expect("insert subscription");

        // The secret matches, but the subscription was replaced and the
        // echo still names the old external id.
        let events = parse_envelope(
            r#"{"value": [{
                "subscriptionId": "sub-old",
                "clientState": "secret-1",
                "changeType": "created",
                "resourceData": {"id": "AAMk-1"}
            }]}"#,
        );

        assert!(route_events(&db, &events).is_empty());
    }

    #[test]
    fn matching_events_group_by_account() {
        let db = temp_db();
        db.insert_account(&outlook_account("acc-1"))
            .expect("insert account");
        db.insert_subscription(&subscription("acc-1", "sub-current", "secret-1"))
            .expect("insert subscription");

        let events = parse_envelope(
            r#"{"value": [
                {
                    "subscriptionId": "sub-current",
                    "clientState": "secret-1",
                    "changeType": "created",
                    "resourceData": {"id": "AAMk-1"}
                },
                {
                    "subscriptionId": "sub-current",
                    "clientState": "secret-1",
                    "changeType": "created",
                    "resourceData": {"id": "AAMk-2"}
                },
                {
                    "subscriptionId": "sub-current",
                    "clientState": "secret-1",
                    "changeType": "deleted",
                    "resourceData": {"id": "AAMk-3"}
                }
            ]}"#,
        );

        let jobs = route_events(&db, &events);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].account_id, "acc-1");
        assert_eq!(jobs[0].message_ids, vec!["AAMk-1", "AAMk-2"]);
    }
}
