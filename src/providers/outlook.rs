//! Push-capable OAuth provider speaking a Graph-shaped REST API. Every
//! authorized call funnels through [`OutlookProvider::execute`], which owns
//! the refresh-once-then-reconnect policy; callers see rotated tokens only
//! through [`CallOutcome::refreshed`].

use std::sync::Mutex;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::db::models::{EmailAccount, NormalizedMessage, OAuthTokens, ProviderKind};
use crate::providers::{
    parse_unsubscribe_value, recent_refresh, record_refresh, CallOutcome, FetchReport,
    MailProvider, ProviderError, ProviderResult,
};

const API_BASE: &str = "https://graph.microsoft.com/v1.0";
const API_BASE_ENV: &str = "MIP_API_BASE";
const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const TOKEN_URL_ENV: &str = "MIP_TOKEN_URL";
const CLIENT_ID_ENV: &str = "MIP_CLIENT_ID";
const CLIENT_SECRET_ENV: &str = "MIP_CLIENT_SECRET";
const OAUTH_SCOPE: &str = "https://graph.microsoft.com/.default offline_access";
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const TOKEN_SKEW_SECONDS: i64 = 60;
const HTTP_TIMEOUT_SECONDS: u64 = 30;
const FETCH_PAGE_SIZE: usize = 50;
const REDACTED_BODY_MAX_LEN: usize = 200;

/// Longest subscription lifetime the provider accepts, just under three days.
pub const SUBSCRIPTION_MAX_MINUTES: i64 = 4230;

const MESSAGE_SELECT_FIELDS: &str = concat!(
    "id,subject,from,toRecipients,ccRecipients,receivedDateTime,sentDateTime,",
    "body,isRead,hasAttachments,conversationId,categories,internetMessageHeaders"
);

pub struct OutlookProvider {
    account: EmailAccount,
    http: Client,
    tokens: Mutex<OAuthTokens>,
}

/// Provider-side identity of a created or renewed push subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub external_id: String,
    pub expires_at: String,
}

struct ApiRequest {
    method: Method,
    url: String,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    fn get(url: String) -> Self {
        Self {
            method: Method::GET,
            url,
            body: None,
        }
    }

    fn post(url: String, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url,
            body: Some(body),
        }
    }

    fn patch(url: String, body: serde_json::Value) -> Self {
        Self {
            method: Method::PATCH,
            url,
            body: Some(body),
        }
    }

    fn delete(url: String) -> Self {
        Self {
            method: Method::DELETE,
            url,
            body: None,
        }
    }
}

impl OutlookProvider {
    pub fn new(account: EmailAccount, tokens: OAuthTokens) -> Result<Self> {
        let http = Client::builder()
            .timeout(StdDuration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .context("build http client")?;

        Ok(Self {
            account,
            http,
            tokens: Mutex::new(tokens),
        })
    }

    fn api_base(&self) -> String {
        std::env::var(API_BASE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.account.config_string("api_base"))
            .unwrap_or_else(|| API_BASE.to_string())
    }

    fn token_url(&self) -> String {
        std::env::var(TOKEN_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.account.config_string("token_url"))
            .unwrap_or_else(|| TOKEN_URL.to_string())
    }

    fn client_id(&self) -> Result<String, ProviderError> {
        std::env::var(CLIENT_ID_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.account.config_string("client_id"))
            .ok_or_else(|| {
                ProviderError::Fatal(anyhow!(
                    "missing oauth client id ({CLIENT_ID_ENV}/account.config)"
                ))
            })
    }

    fn client_secret(&self) -> Option<String> {
        std::env::var(CLIENT_SECRET_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.account.config_string("client_secret"))
    }

    fn current_tokens(&self) -> OAuthTokens {
        match self.tokens.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn adopt_tokens(&self, fresh: &OAuthTokens) {
        match self.tokens.lock() {
            Ok(mut guard) => *guard = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
    }

    /// Wrap `value` in a [`CallOutcome`], attaching the current tokens when
    /// they rotated since the operation started.
    fn outcome_since<T>(&self, entry_access_token: &str, value: T) -> CallOutcome<T> {
        let current = self.current_tokens();
        if current.access_token != entry_access_token {
            CallOutcome::with_refresh(value, current)
        } else {
            CallOutcome::new(value)
        }
    }

    /// One authorized API call. On a 401 the token is refreshed (or adopted
    /// from the per-account gate) and the call retried exactly once; a second
    /// rejection becomes `ReconnectRequired`.
    async fn execute(&self, request: &ApiRequest) -> Result<String, ProviderError> {
        for pass in 0..2 {
            let tokens = self.current_tokens();
            match self.send_authorized(request, &tokens.access_token).await {
                Ok(body) => return Ok(body),
                Err(ProviderError::AuthExpired(detail)) => {
                    if pass > 0 {
                        return Err(ProviderError::ReconnectRequired(format!(
                            "access token rejected after refresh: {detail}"
                        )));
                    }
                    let fresh = self.obtain_refreshed_tokens(&tokens, &detail).await?;
                    self.adopt_tokens(&fresh);
                }
                Err(error) => return Err(error),
            }
        }

        Err(ProviderError::ReconnectRequired(
            "access token rejected after refresh".to_string(),
        ))
    }

    async fn send_authorized(
        &self,
        request: &ApiRequest,
        token: &str,
    ) -> Result<String, ProviderError> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let mut builder = self
                .http
                .request(request.method.clone(), &request.url)
                .bearer_auth(token)
                .header("accept", "application/json");
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|error| {
                ProviderError::Transient(format!("request {} failed: {error}", request.url))
            })?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::Transient(format!(
                        "rate limited after {MAX_RATE_LIMIT_RETRIES} retries: {}",
                        redact_response_body(&body)
                    )));
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let body = response.text().await.map_err(|error| {
                ProviderError::Transient(format!("read response body: {error}"))
            })?;

            if status.is_success() {
                return Ok(body);
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(ProviderError::AuthExpired(redact_response_body(&body)));
            }
            if status == StatusCode::NOT_FOUND {
                return Err(ProviderError::NotFound(format!(
                    "{}: {}",
                    request.url,
                    redact_response_body(&body)
                )));
            }
            if status.is_server_error() {
                return Err(ProviderError::Transient(format!(
                    "status={status} body={}",
                    redact_response_body(&body)
                )));
            }
            return Err(ProviderError::Fatal(anyhow!(
                "request {} failed: status={status} body={}",
                request.url,
                redact_response_body(&body)
            )));
        }

        Err(ProviderError::Transient(
            "rate limit retries exhausted".to_string(),
        ))
    }

    /// Decide how to repair a rejected access token: adopt a grant another
    /// task already produced inside the gate window, refuse when our own
    /// gated grant was the token that just failed, or perform the refresh.
    async fn obtain_refreshed_tokens(
        &self,
        failed: &OAuthTokens,
        detail: &str,
    ) -> Result<OAuthTokens, ProviderError> {
        let now = Utc::now().timestamp();

        if let Some(grant) = recent_refresh(&self.account.account_id, now) {
            if grant.access_token != failed.access_token {
                return Ok(grant);
            }
            return Err(ProviderError::ReconnectRequired(format!(
                "recently refreshed token still rejected: {detail}"
            )));
        }

        let fresh = self.refresh_tokens(&failed.refresh_token).await?;
        record_refresh(&self.account.account_id, &fresh, now);
        Ok(fresh)
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<OAuthTokens, ProviderError> {
        let token_url = self.token_url();
        let client_id = self.client_id()?;

        let mut form = vec![
            ("client_id", client_id),
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("scope", OAUTH_SCOPE.to_string()),
        ];
        if let Some(secret) = self.client_secret() {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(|error| {
                ProviderError::Transient(format!("token endpoint {token_url} unreachable: {error}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            ProviderError::Transient(format!("read token response: {error}"))
        })?;

        if !status.is_success() {
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(ProviderError::Transient(format!(
                    "token refresh failed: status={status} body={}",
                    redact_response_body(&body)
                )));
            }
            // 4xx from the token endpoint (invalid_grant and friends) means
            // the refresh token itself is dead.
            return Err(ProviderError::ReconnectRequired(format!(
                "token refresh rejected: status={status} body={}",
                redact_response_body(&body)
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body).map_err(|error| {
            ProviderError::Fatal(anyhow!("decode token refresh response: {error}"))
        })?;

        let expires_at = Utc::now()
            + Duration::seconds((payload.expires_in as i64).saturating_sub(TOKEN_SKEW_SECONDS));

        Ok(OAuthTokens {
            access_token: payload.access_token,
            // The endpoint may rotate the refresh token; keep the old one
            // when it does not.
            refresh_token: payload
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at: Some(expires_at.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        })
    }

    fn messages_url(&self, query: &[(&str, String)]) -> Result<String, ProviderError> {
        let endpoint = format!("{}/me/messages", self.api_base());
        let mut url = Url::parse(&endpoint)
            .map_err(|error| ProviderError::Fatal(anyhow!("parse url {endpoint}: {error}")))?;
        for (key, value) in query {
            url.query_pairs_mut().append_pair(key, value);
        }
        Ok(url.to_string())
    }

    async fn fetch_message_list(
        &self,
        first_url: String,
        limit: Option<usize>,
    ) -> Result<Vec<NormalizedMessage>, ProviderError> {
        let mut messages = Vec::new();
        let mut next_url = first_url;

        loop {
            let body = self.execute(&ApiRequest::get(next_url)).await?;
            let page: MessagesPage = serde_json::from_str(&body).map_err(|error| {
                ProviderError::Fatal(anyhow!("decode messages page: {error}"))
            })?;

            for raw in page.value {
                if limit.is_some_and(|cap| messages.len() >= cap) {
                    return Ok(messages);
                }
                match self.normalize(raw).await {
                    Ok(message) => messages.push(message),
                    Err(error) => warn!(
                        "skipping unmappable message for account {}: {error}",
                        self.account.account_id
                    ),
                }
            }

            match page.next_link {
                Some(url) if !limit.is_some_and(|cap| messages.len() >= cap) => next_url = url,
                _ => break,
            }
        }

        Ok(messages)
    }

    async fn fetch_one(&self, provider_message_id: &str) -> Result<NormalizedMessage, ProviderError> {
        let url = format!(
            "{}/me/messages/{provider_message_id}?$select={MESSAGE_SELECT_FIELDS}",
            self.api_base()
        );
        let body = self.execute(&ApiRequest::get(url)).await?;
        let raw: ApiMessage = serde_json::from_str(&body)
            .map_err(|error| ProviderError::Fatal(anyhow!("decode message: {error}")))?;
        self.normalize(raw).await
    }

    async fn patch_message(
        &self,
        provider_message_id: &str,
        body: serde_json::Value,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/me/messages/{provider_message_id}", self.api_base());
        self.execute(&ApiRequest::patch(url, body)).await?;
        Ok(())
    }

    async fn move_message(
        &self,
        provider_message_id: &str,
        destination: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/me/messages/{provider_message_id}/move", self.api_base());
        let body = serde_json::json!({ "destinationId": destination });
        self.execute(&ApiRequest::post(url, body)).await?;
        Ok(())
    }

    async fn fetch_categories(
        &self,
        provider_message_id: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let url = format!(
            "{}/me/messages/{provider_message_id}?$select=categories",
            self.api_base()
        );
        let body = self.execute(&ApiRequest::get(url)).await?;
        let raw: ApiMessage = serde_json::from_str(&body)
            .map_err(|error| ProviderError::Fatal(anyhow!("decode categories: {error}")))?;
        Ok(raw.categories.unwrap_or_default())
    }

    async fn normalize(&self, raw: ApiMessage) -> Result<NormalizedMessage, ProviderError> {
        let provider_message_id = raw
            .id
            .clone()
            .ok_or_else(|| ProviderError::Fatal(anyhow!("message missing id")))?;

        let (from_name, from_address) = raw
            .from
            .as_ref()
            .and_then(ApiRecipient::name_address_pair)
            .unwrap_or((None, None));

        let to_addresses = raw
            .to_recipients
            .as_deref()
            .map(recipient_addresses)
            .unwrap_or_default();
        let cc_addresses = raw
            .cc_recipients
            .as_deref()
            .map(recipient_addresses)
            .unwrap_or_default();

        let (body_text, mut body_html) = body_fields(raw.body.as_ref());

        if let Some(html) = body_html.as_deref() {
            if html.contains("cid:") {
                match self.inline_cid_images(&provider_message_id, html).await {
                    Ok(rewritten) => body_html = Some(rewritten),
                    Err(error) => warn!(
                        "inlining images for message {provider_message_id}: {error}"
                    ),
                }
            }
        }

        let (unsubscribe_url, unsubscribe_mailto) = raw
            .internet_message_headers
            .as_deref()
            .map(unsubscribe_targets)
            .unwrap_or((None, None));

        let received_at = raw
            .received_date_time
            .or(raw.sent_date_time)
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());

        Ok(NormalizedMessage {
            id: Uuid::new_v4().to_string(),
            user_id: self.account.user_id.clone(),
            account_id: self.account.account_id.clone(),
            provider_message_id,
            thread_id: raw.conversation_id,
            from_address,
            from_name,
            to_addresses,
            cc_addresses,
            subject: raw.subject,
            body_text,
            body_html,
            received_at,
            is_read: raw.is_read,
            has_attachments: raw.has_attachments,
            unsubscribe_url,
            unsubscribe_mailto,
        })
    }

    async fn inline_cid_images(
        &self,
        provider_message_id: &str,
        html: &str,
    ) -> Result<String, ProviderError> {
        let url = format!(
            "{}/me/messages/{provider_message_id}/attachments?$select=contentId,contentType,contentBytes,isInline",
            self.api_base()
        );
        let body = self.execute(&ApiRequest::get(url)).await?;
        let page: AttachmentsPage = serde_json::from_str(&body)
            .map_err(|error| ProviderError::Fatal(anyhow!("decode attachments: {error}")))?;
        Ok(rewrite_cid_references(html, &page.value))
    }

    // --- Push subscriptions (inherent: the polling family has none) ---

    pub async fn create_subscription(
        &self,
        callback_url: &str,
        client_state: &str,
    ) -> ProviderResult<SubscriptionHandle> {
        let entry = self.current_tokens();
        let requested_expiry = subscription_expiry_from(Utc::now());

        let body = serde_json::json!({
            "changeType": "created",
            "notificationUrl": callback_url,
            "resource": "/me/messages",
            "expirationDateTime": requested_expiry,
            "clientState": client_state,
        });
        let url = format!("{}/subscriptions", self.api_base());
        let response = self.execute(&ApiRequest::post(url, body)).await?;

        let payload: SubscriptionResponse = serde_json::from_str(&response).map_err(|error| {
            ProviderError::Fatal(anyhow!("decode subscription response: {error}"))
        })?;

        Ok(self.outcome_since(
            &entry.access_token,
            SubscriptionHandle {
                external_id: payload.id,
                expires_at: payload.expiration_date_time.unwrap_or(requested_expiry),
            },
        ))
    }

    /// Extend an existing subscription. Surfaces `NotFound` untouched so the
    /// renewal sweep can fall back to creating a replacement.
    pub async fn renew_subscription(&self, external_id: &str) -> ProviderResult<String> {
        let entry = self.current_tokens();
        let requested_expiry = subscription_expiry_from(Utc::now());

        let url = format!("{}/subscriptions/{external_id}", self.api_base());
        let body = serde_json::json!({ "expirationDateTime": requested_expiry });
        let response = self.execute(&ApiRequest::patch(url, body)).await?;

        let payload: SubscriptionResponse = serde_json::from_str(&response).map_err(|error| {
            ProviderError::Fatal(anyhow!("decode subscription renewal: {error}"))
        })?;

        Ok(self.outcome_since(
            &entry.access_token,
            payload.expiration_date_time.unwrap_or(requested_expiry),
        ))
    }

    /// Delete is idempotent: a subscription the provider already dropped
    /// counts as deleted.
    pub async fn delete_subscription(&self, external_id: &str) -> ProviderResult<()> {
        let entry = self.current_tokens();
        let url = format!("{}/subscriptions/{external_id}", self.api_base());

        match self.execute(&ApiRequest::delete(url)).await {
            Ok(_) => {}
            Err(ProviderError::NotFound(_)) => {}
            Err(error) => return Err(error),
        }

        Ok(self.outcome_since(&entry.access_token, ()))
    }
}

#[async_trait]
impl MailProvider for OutlookProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn fetch_recent(&self, limit: usize) -> ProviderResult<Vec<NormalizedMessage>> {
        let entry = self.current_tokens();
        let url = self.messages_url(&[
            ("$top", limit.min(FETCH_PAGE_SIZE).to_string()),
            ("$select", MESSAGE_SELECT_FIELDS.to_string()),
            ("$orderby", "receivedDateTime desc".to_string()),
        ])?;
        let messages = self.fetch_message_list(url, Some(limit)).await?;
        Ok(self.outcome_since(&entry.access_token, messages))
    }

    async fn fetch_since(
        &self,
        since: &str,
        limit: Option<usize>,
    ) -> ProviderResult<Vec<NormalizedMessage>> {
        let entry = self.current_tokens();
        let page_size = limit.map_or(FETCH_PAGE_SIZE, |cap| cap.min(FETCH_PAGE_SIZE));
        let url = self.messages_url(&[
            ("$top", page_size.to_string()),
            ("$select", MESSAGE_SELECT_FIELDS.to_string()),
            ("$orderby", "receivedDateTime desc".to_string()),
            ("$filter", format!("receivedDateTime ge {since}")),
        ])?;
        let messages = self.fetch_message_list(url, limit).await?;
        Ok(self.outcome_since(&entry.access_token, messages))
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> ProviderResult<FetchReport> {
        let entry = self.current_tokens();
        let mut report = FetchReport::default();

        for id in ids {
            match self.fetch_one(id).await {
                Ok(message) => report.messages.push(message),
                // A dead credential dooms every remaining id the same way.
                Err(error @ ProviderError::ReconnectRequired(_)) => return Err(error),
                Err(error) => {
                    warn!("fetch by id {id} failed: {error}");
                    report.failed_ids.push(id.clone());
                }
            }
        }

        Ok(self.outcome_since(&entry.access_token, report))
    }

    async fn mark_read(&self, provider_message_id: &str) -> ProviderResult<()> {
        let entry = self.current_tokens();
        self.patch_message(provider_message_id, serde_json::json!({ "isRead": true }))
            .await?;
        Ok(self.outcome_since(&entry.access_token, ()))
    }

    async fn mark_unread(&self, provider_message_id: &str) -> ProviderResult<()> {
        let entry = self.current_tokens();
        self.patch_message(provider_message_id, serde_json::json!({ "isRead": false }))
            .await?;
        Ok(self.outcome_since(&entry.access_token, ()))
    }

    async fn trash(&self, provider_message_id: &str) -> ProviderResult<()> {
        let entry = self.current_tokens();
        self.move_message(provider_message_id, "deleteditems").await?;
        Ok(self.outcome_since(&entry.access_token, ()))
    }

    async fn untrash(&self, provider_message_id: &str) -> ProviderResult<()> {
        let entry = self.current_tokens();
        self.move_message(provider_message_id, "inbox").await?;
        Ok(self.outcome_since(&entry.access_token, ()))
    }

    async fn add_label(&self, provider_message_id: &str, label: &str) -> ProviderResult<()> {
        let entry = self.current_tokens();
        let mut categories = self.fetch_categories(provider_message_id).await?;

        if !categories
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(label))
        {
            categories.push(label.to_string());
            self.patch_message(
                provider_message_id,
                serde_json::json!({ "categories": categories }),
            )
            .await?;
        }

        Ok(self.outcome_since(&entry.access_token, ()))
    }

    async fn remove_label(&self, provider_message_id: &str, label: &str) -> ProviderResult<()> {
        let entry = self.current_tokens();
        let categories = self.fetch_categories(provider_message_id).await?;

        let remaining: Vec<String> = categories
            .iter()
            .filter(|existing| !existing.eq_ignore_ascii_case(label))
            .cloned()
            .collect();

        if remaining.len() != categories.len() {
            self.patch_message(
                provider_message_id,
                serde_json::json!({ "categories": remaining }),
            )
            .await?;
        }

        Ok(self.outcome_since(&entry.access_token, ()))
    }
}

fn subscription_expiry_from(now: chrono::DateTime<Utc>) -> String {
    (now + Duration::minutes(SUBSCRIPTION_MAX_MINUTES))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }
    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}

fn body_fields(body: Option<&ApiBody>) -> (Option<String>, Option<String>) {
    let Some(body) = body else {
        return (None, None);
    };

    let content = body
        .content
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let Some(content) = content else {
        return (None, None);
    };

    if body
        .content_type
        .as_deref()
        .is_some_and(|kind| kind.eq_ignore_ascii_case("html"))
    {
        let plain = std::panic::catch_unwind(|| {
            html2text::from_read(content.as_bytes(), 120)
                .lines()
                .map(str::trim_end)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .unwrap_or_default();
        let body_text = if plain.is_empty() { None } else { Some(plain) };
        return (body_text, Some(content.to_string()));
    }

    (Some(content.to_string()), None)
}

fn recipient_addresses(recipients: &[ApiRecipient]) -> Vec<String> {
    recipients
        .iter()
        .filter_map(ApiRecipient::address)
        .map(str::to_string)
        .collect()
}

/// Replace `cid:` references in an HTML body with data: URIs built from the
/// message's inline attachments. References with no matching attachment are
/// left alone.
fn rewrite_cid_references(html: &str, attachments: &[ApiAttachment]) -> String {
    let mut rewritten = html.to_string();

    for attachment in attachments {
        if !attachment.is_inline.unwrap_or(false) {
            continue;
        }
        let (Some(content_id), Some(content_bytes)) = (
            attachment.content_id.as_deref(),
            attachment.content_bytes.as_deref(),
        ) else {
            continue;
        };

        let content_type = attachment
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let data_uri = format!("data:{content_type};base64,{content_bytes}");
        rewritten = rewritten.replace(&format!("cid:{content_id}"), &data_uri);
    }

    rewritten
}

/// Pull the https and mailto targets out of an RFC 2369 List-Unsubscribe
/// header, when present.
fn unsubscribe_targets(headers: &[ApiHeader]) -> (Option<String>, Option<String>) {
    let Some(value) = headers
        .iter()
        .find(|header| {
            header
                .name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case("List-Unsubscribe"))
        })
        .and_then(|header| header.value.as_deref())
    else {
        return (None, None);
    };

    parse_unsubscribe_value(value)
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesPage {
    value: Vec<ApiMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiMessage {
    id: Option<String>,
    subject: Option<String>,
    from: Option<ApiRecipient>,
    #[serde(rename = "toRecipients")]
    to_recipients: Option<Vec<ApiRecipient>>,
    #[serde(rename = "ccRecipients")]
    cc_recipients: Option<Vec<ApiRecipient>>,
    body: Option<ApiBody>,
    #[serde(rename = "isRead")]
    is_read: Option<bool>,
    #[serde(rename = "hasAttachments")]
    has_attachments: Option<bool>,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    categories: Option<Vec<String>>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
    #[serde(rename = "sentDateTime")]
    sent_date_time: Option<String>,
    #[serde(rename = "internetMessageHeaders")]
    internet_message_headers: Option<Vec<ApiHeader>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<ApiEmailAddress>,
}

impl ApiRecipient {
    fn address(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|email| email.address.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn name_address_pair(&self) -> Option<(Option<String>, Option<String>)> {
        let email = self.email_address.as_ref()?;
        let name = email
            .name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let address = email
            .address
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Some((name, address))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiBody {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiHeader {
    name: Option<String>,
    value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AttachmentsPage {
    value: Vec<ApiAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiAttachment {
    #[serde(rename = "contentId")]
    content_id: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "contentBytes")]
    content_bytes: Option<String>,
    #[serde(rename = "isInline")]
    is_inline: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionResponse {
    id: String,
    #[serde(rename = "expirationDateTime")]
    expiration_date_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        rewrite_cid_references, subscription_expiry_from, unsubscribe_targets, ApiAttachment,
        ApiHeader, ApiMessage, OAuthTokenResponse, OutlookProvider, API_BASE, API_BASE_ENV,
    };
    use crate::db::models::{EmailAccount, OAuthTokens, ProviderKind};
    use crate::providers::ENV_LOCK;

    fn account() -> EmailAccount {
        EmailAccount {
            account_id: "acc-out".to_string(),
            user_id: "user-1".to_string(),
            email_address: "owner@example.com".to_string(),
            display_name: Some("Owner".to_string()),
            provider: ProviderKind::Outlook,
            enabled: true,
            initial_sync_complete: false,
            last_sync_at: None,
            last_sync_error: None,
            subscription_id: None,
            config: Some(json!({ "client_id": "client-a" })),
        }
    }

    fn tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: None,
        }
    }

    fn provider() -> OutlookProvider {
        OutlookProvider::new(account(), tokens()).expect("build provider")
    }

    #[test]
    fn oauth_token_response_deserializes_with_optional_rotation() {
        let payload = r#"{"access_token":"abc","expires_in":3600}"#;
        let decoded: OAuthTokenResponse =
            serde_json::from_str(payload).expect("decode token response");
        assert_eq!(decoded.access_token, "abc");
        assert!(decoded.refresh_token.is_none());

        let rotated = r#"{"access_token":"abc","refresh_token":"xyz","expires_in":3600}"#;
        let decoded: OAuthTokenResponse =
            serde_json::from_str(rotated).expect("decode rotated response");
        assert_eq!(decoded.refresh_token.as_deref(), Some("xyz"));
    }

    #[test]
    fn api_base_prefers_env_then_config_then_default() {
        let _lock = ENV_LOCK.lock().expect("lock env mutation");
        std::env::remove_var(API_BASE_ENV);

        assert_eq!(provider().api_base(), API_BASE);

        let mut with_config = account();
        with_config.config = Some(json!({ "api_base": "https://config.example.com/api" }));
        let from_config =
            OutlookProvider::new(with_config, tokens()).expect("build provider with config");
        assert_eq!(from_config.api_base(), "https://config.example.com/api");

        std::env::set_var(API_BASE_ENV, "https://env.example.com/api");
        assert_eq!(from_config.api_base(), "https://env.example.com/api");
        std::env::remove_var(API_BASE_ENV);
    }

    #[test]
    fn unsubscribe_header_yields_url_and_mailto() {
        let headers = vec![
            ApiHeader {
                name: Some("X-Spam-Score".to_string()),
                value: Some("0.1".to_string()),
            },
            ApiHeader {
                name: Some("list-unsubscribe".to_string()),
                value: Some(
                    "<https://news.example.com/unsub?id=7>, <mailto:unsub@news.example.com>"
                        .to_string(),
                ),
            },
        ];

        let (url, mailto) = unsubscribe_targets(&headers);
        assert_eq!(url.as_deref(), Some("https://news.example.com/unsub?id=7"));
        assert_eq!(mailto.as_deref(), Some("mailto:unsub@news.example.com"));
    }

    #[test]
    fn cid_references_become_data_uris() {
        let html = r#"<p>Logo: <img src="cid:logo@example"></p>"#;
        let attachments = vec![ApiAttachment {
            content_id: Some("logo@example".to_string()),
            content_type: Some("image/png".to_string()),
            content_bytes: Some("aWNvbg==".to_string()),
            is_inline: Some(true),
        }];

        let rewritten = rewrite_cid_references(html, &attachments);
        assert!(rewritten.contains("src=\"data:image/png;base64,aWNvbg==\""));
        assert!(!rewritten.contains("cid:logo@example"));
    }

    #[test]
    fn cid_rewrite_skips_non_inline_and_unmatched() {
        let html = r#"<img src="cid:a"><img src="cid:b">"#;
        let attachments = vec![
            ApiAttachment {
                content_id: Some("a".to_string()),
                content_type: Some("image/png".to_string()),
                content_bytes: Some("AAAA".to_string()),
                is_inline: Some(false),
            },
            ApiAttachment {
                content_id: None,
                content_type: Some("image/jpeg".to_string()),
                content_bytes: Some("BBBB".to_string()),
                is_inline: Some(true),
            },
        ];

        let rewritten = rewrite_cid_references(html, &attachments);
        assert_eq!(rewritten, html);
    }

    #[tokio::test]
    async fn normalize_maps_html_body_and_headers() {
        let raw: ApiMessage = serde_json::from_value(json!({
            "id": "AAMk-77",
            "subject": "Weekly digest",
            "from": { "emailAddress": { "name": "News", "address": "news@example.com" } },
            "toRecipients": [{ "emailAddress": { "address": "owner@example.com" } }],
            "body": { "contentType": "html", "content": "<p>Hello <b>reader</b></p>" },
            "isRead": false,
            "hasAttachments": false,
            "conversationId": "conv-9",
            "receivedDateTime": "2026-02-03T08:30:00Z",
            "internetMessageHeaders": [
                { "name": "List-Unsubscribe", "value": "<https://news.example.com/u/9>" }
            ]
        }))
        .expect("decode fixture");

        let message = provider().normalize(raw).await.expect("normalize");
        assert_eq!(message.provider_message_id, "AAMk-77");
        assert_eq!(message.account_id, "acc-out");
        assert_eq!(message.user_id, "user-1");
        assert_eq!(message.thread_id.as_deref(), Some("conv-9"));
        assert_eq!(message.from_address.as_deref(), Some("news@example.com"));
        assert_eq!(message.to_addresses, vec!["owner@example.com".to_string()]);
        assert_eq!(
            message.body_html.as_deref(),
            Some("<p>Hello <b>reader</b></p>")
        );
        let text = message.body_text.expect("text body");
        assert!(text.contains("Hello"));
        assert_eq!(
            message.unsubscribe_url.as_deref(),
            Some("https://news.example.com/u/9")
        );
        assert!(message.unsubscribe_mailto.is_none());
        assert_eq!(message.received_at, "2026-02-03T08:30:00Z");
        assert!(!message.id.is_empty(), "local row id is generated");
    }

    #[tokio::test]
    async fn normalize_without_id_is_an_error() {
        let raw: ApiMessage =
            serde_json::from_value(json!({ "subject": "no id" })).expect("decode fixture");
        let error = provider().normalize(raw).await.expect_err("missing id");
        assert!(error.to_string().contains("missing id"));
    }

    #[test]
    fn subscription_expiry_is_inside_provider_bound() {
        let now = chrono::Utc::now();
        let expiry = subscription_expiry_from(now);
        let parsed = chrono::DateTime::parse_from_rfc3339(&expiry).expect("parse expiry");
        let minutes = (parsed.with_timezone(&chrono::Utc) - now).num_minutes();
        assert!(minutes > 0 && minutes <= super::SUBSCRIPTION_MAX_MINUTES);
    }
}
