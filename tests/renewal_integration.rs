use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{patch, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use mip::db::models::{Credentials, EmailAccount, OAuthTokens, ProviderKind, PushSubscription};
use mip::db::Database;
use mip::subscriptions::{run_renewal_check, RenewalReport};
use serde_json::{json, Value};
use uuid::Uuid;

const LIVE_EXTERNAL_ID: &str = "sub-live-1";
const REPLACEMENT_EXTERNAL_ID: &str = "sub-replacement-9";
const CALLBACK_URL: &str = "https://mip.example.com/webhooks/mail";

fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("mip-renewal-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root
}

fn push_account(api_base: &str) -> EmailAccount {
    EmailAccount {
        account_id: "acc-push".to_string(),
        user_id: "user-main".to_string(),
        email_address: "owner@example.com".to_string(),
        display_name: None,
        provider: ProviderKind::Outlook,
        enabled: true,
        initial_sync_complete: true,
        last_sync_at: None,
        last_sync_error: None,
        subscription_id: None,
        config: Some(json!({ "api_base": api_base, "client_id": "test-client" })),
    }
}

fn expiring_subscription(external_id: &str, client_state: &str, expires_at: &str) -> PushSubscription {
    PushSubscription {
        id: Uuid::new_v4().to_string(),
        account_id: "acc-push".to_string(),
        provider: ProviderKind::Outlook,
        external_id: external_id.to_string(),
        client_state: client_state.to_string(),
        callback_url: CALLBACK_URL.to_string(),
        expires_at: expires_at.to_string(),
        created_at: None,
        updated_at: None,
    }
}

fn minutes_from_now(minutes: i64) -> String {
    (Utc::now() + Duration::minutes(minutes))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

/// What the scripted provider endpoint saw, so assertions can check the
/// wire traffic and not just the database state it left behind.
#[derive(Default)]
struct ProviderLog {
    renewed_ids: Vec<String>,
    created_client_states: Vec<String>,
}

type SharedLog = Arc<Mutex<ProviderLog>>;

/// PATCH handler: knows one live subscription and extends it two days
/// out; anything else gets the provider's "already gone" answer.
async fn renew_subscription(State(log): State<SharedLog>, Path(id): Path<String>) -> Response {
    log.lock().expect("provider log").renewed_ids.push(id.clone());

    if id == LIVE_EXTERNAL_ID {
        let extended = (Utc::now() + Duration::days(2))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        return Json(json!({ "id": id, "expirationDateTime": extended })).into_response();
    }

    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": { "code": "ResourceNotFound", "message": "subscription has expired" }
        })),
    )
        .into_response()
}

async fn create_subscription(State(log): State<SharedLog>, Json(body): Json<Value>) -> Json<Value> {
    let client_state = body["clientState"].as_str().unwrap_or_default().to_string();
    log.lock()
        .expect("provider log")
        .created_client_states
        .push(client_state);

    let expires = (Utc::now() + Duration::days(3))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();
    Json(json!({ "id": REPLACEMENT_EXTERNAL_ID, "expirationDateTime": expires }))
}

#[tokio::test]
async fn subscription_renewal_end_to_end_validation() -> Result<()> {
    let log: SharedLog = Arc::default();
    let app = Router::new()
        .route("/subscriptions", post(create_subscription))
        .route("/subscriptions/:id", patch(renew_subscription))
        .with_state(log.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let api_base = format!("http://{}", listener.local_addr()?);
    let endpoint = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let root = temp_root();
    let db = Database::open(&root.join("mip.db"))?;
    db.insert_account(&push_account(&api_base))?;
    db.store_credentials(
        "acc-push",
        &Credentials::Oauth(OAuthTokens {
            access_token: "at-live".to_string(),
            refresh_token: "rt-live".to_string(),
            expires_at: Some("2027-01-01T00:00:00Z".to_string()),
        }),
    )?;

    // A subscription inside the renewal window gets extended in place:
    // same row, same secret, expiry strictly past the old deadline.
    let soon = minutes_from_now(45);
    let original = expiring_subscription(LIVE_EXTERNAL_ID, "secret-original", &soon);
    db.insert_subscription(&original)?;
    db.set_account_subscription("acc-push", Some(&original.id))?;

    let report = run_renewal_check(&db).await?;
    assert_eq!(
        report,
        RenewalReport {
            renewed: 1,
            replaced: 0,
            failed: 0
        }
    );

    let renewed = db
        .get_subscription_by_account("acc-push")?
        .expect("renewed subscription");
    assert_eq!(renewed.id, original.id);
    assert_eq!(renewed.external_id, LIVE_EXTERNAL_ID);
    assert_eq!(renewed.client_state, "secret-original");
    assert!(
        renewed.expires_at > soon,
        "renewal must extend past {soon}, got {}",
        renewed.expires_at
    );

    // Just renewed means outside the window: the next sweep is a no-op.
    assert_eq!(run_renewal_check(&db).await?, RenewalReport::default());

    // When the provider has already dropped the registration, the sweep
    // mints a replacement with a fresh secret and repoints the account.
    db.remove_subscription(&original.id)?;
    let orphaned = expiring_subscription("sub-dropped-7", "secret-dropped", &minutes_from_now(30));
    db.insert_subscription(&orphaned)?;
    db.set_account_subscription("acc-push", Some(&orphaned.id))?;

    let report = run_renewal_check(&db).await?;
    assert_eq!(
        report,
        RenewalReport {
            renewed: 0,
            replaced: 1,
            failed: 0
        }
    );

    let replacement = db
        .get_subscription_by_account("acc-push")?
        .expect("replacement subscription");
    assert_ne!(replacement.id, orphaned.id);
    assert_eq!(replacement.external_id, REPLACEMENT_EXTERNAL_ID);
    assert_ne!(
        replacement.client_state, orphaned.client_state,
        "a replacement must mint a fresh secret"
    );
    assert_eq!(replacement.callback_url, CALLBACK_URL);
    assert!(replacement.expires_at > orphaned.expires_at);

    let account = db.get_account("acc-push")?.expect("account still there");
    assert_eq!(
        account.subscription_id.as_deref(),
        Some(replacement.id.as_str()),
        "account must point at the replacement"
    );
    assert!(db.get_subscription(&orphaned.id)?.is_none());
    assert_eq!(db.get_stats()?.total_subscriptions, 1);

    {
        let log = log.lock().expect("provider log");
        assert_eq!(
            log.renewed_ids,
            vec![LIVE_EXTERNAL_ID.to_string(), "sub-dropped-7".to_string()]
        );
        assert_eq!(
            log.created_client_states,
            vec![replacement.client_state.clone()],
            "the fresh secret must be the one sent upstream"
        );
    }

    endpoint.abort();
    let _ = std::fs::remove_dir_all(root);
    Ok(())
}
