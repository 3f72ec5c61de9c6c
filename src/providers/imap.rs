//! Polling IMAP provider. All socket work is blocking and runs on the
//! blocking pool; one session is cached per adapter and revalidated with
//! NOOP before reuse. Password auth has no refresh path, so a rejected
//! login surfaces as `ReconnectRequired` immediately.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use imap::types::Flag;
use mailparse::{MailHeaderMap, ParsedMail};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::models::{EmailAccount, ImapCredentials, NormalizedMessage, ProviderKind};
use crate::providers::{
    parse_unsubscribe_value, CallOutcome, FetchReport, MailProvider, ProviderError, ProviderResult,
};

const INBOX: &str = "INBOX";
const DEFAULT_TRASH_FOLDER: &str = "Trash";
const FETCH_QUERY: &str = "(UID FLAGS BODY.PEEK[])";

type TlsSession = imap::Session<native_tls::TlsStream<std::net::TcpStream>>;

pub struct ImapProvider {
    account: EmailAccount,
    credentials: Arc<ImapCredentials>,
    session: Arc<Mutex<Option<TlsSession>>>,
}

impl ImapProvider {
    pub fn new(account: EmailAccount, credentials: ImapCredentials) -> Self {
        Self {
            account,
            credentials: Arc::new(credentials),
            session: Arc::new(Mutex::new(None)),
        }
    }

    fn trash_folder(&self) -> String {
        self.account
            .config_string("trash_folder")
            .unwrap_or_else(|| DEFAULT_TRASH_FOLDER.to_string())
    }

    fn take_session(&self) -> Option<TlsSession> {
        self.session.lock().ok().and_then(|mut guard| guard.take())
    }

    async fn with_session<F, R>(&self, run: F) -> Result<R, ProviderError>
    where
        F: FnOnce(&mut TlsSession) -> Result<R, ProviderError> + Send + 'static,
        R: Send + 'static,
    {
        let credentials = self.credentials.clone();
        let cached = self.take_session();
        let pool = self.session.clone();

        tokio::task::spawn_blocking(move || {
            let mut session = reuse_or_connect(cached, &credentials)?;
            let result = run(&mut session);
            if let Ok(mut guard) = pool.lock() {
                *guard = Some(session);
            }
            result
        })
        .await
        .map_err(|error| ProviderError::Fatal(anyhow!("join imap task: {error}")))?
    }
}

fn reuse_or_connect(
    cached: Option<TlsSession>,
    credentials: &ImapCredentials,
) -> Result<TlsSession, ProviderError> {
    if let Some(mut session) = cached {
        if session.noop().is_ok() {
            return Ok(session);
        }
        debug!("cached imap session stale, reconnecting");
    }
    connect(credentials)
}

fn connect(credentials: &ImapCredentials) -> Result<TlsSession, ProviderError> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|error| ProviderError::Transient(format!("tls init: {error}")))?;

    let client = imap::connect(
        (credentials.host.as_str(), credentials.port),
        credentials.host.as_str(),
        &tls,
    )
    .map_err(|error| {
        ProviderError::Transient(format!("imap connect {}:{}: {error}", credentials.host, credentials.port))
    })?;

    client.login(&credentials.username, &credentials.password).map_err(|(error, _)| {
        ProviderError::ReconnectRequired(format!("imap login {}: {error}", credentials.username))
    })
}

fn imap_call_error(op: &str, error: imap::Error) -> ProviderError {
    ProviderError::Transient(format!("imap {op}: {error}"))
}

fn uid_str(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// A bare EXPUNGE clears every \Deleted message in the selected folder,
/// including deferred deletes other clients still hold. Scope it to our
/// UIDs wherever the server speaks UIDPLUS (RFC 4315).
fn expunge_uids<S: std::io::Read + std::io::Write>(
    session: &mut imap::Session<S>,
    ids: &str,
) -> Result<(), ProviderError> {
    let uidplus = session
        .capabilities()
        .map(|caps| caps.has_str("UIDPLUS"))
        .unwrap_or(false);

    if uidplus {
        session
            .uid_expunge(ids)
            .map_err(|error| imap_call_error("uid expunge", error))?;
    } else {
        session
            .expunge()
            .map_err(|error| imap_call_error("expunge", error))?;
    }
    Ok(())
}

/// Resolve a stored provider message id to UIDs in the selected folder.
/// Synthetic ids carry their own uid; everything else searches by the
/// Message-ID header.
fn find_message_uids(
    session: &mut TlsSession,
    provider_message_id: &str,
    uid_validity: u32,
) -> Result<Vec<u32>, ProviderError> {
    if let Some(rest) = provider_message_id.strip_prefix("uid:") {
        let mut parts = rest.splitn(2, ':');
        let validity: u32 = parts
            .next()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let uid: u32 = parts
            .next()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        if uid == 0 || validity != uid_validity {
            return Err(ProviderError::NotFound(format!(
                "synthetic id {provider_message_id} no longer resolves (uidvalidity changed)"
            )));
        }
        return Ok(vec![uid]);
    }

    let sanitized = provider_message_id.replace(['"', '\\'], "");
    let results = session
        .uid_search(format!("HEADER Message-ID \"{sanitized}\""))
        .map_err(|error| imap_call_error("search", error))?;

    if results.is_empty() {
        return Err(ProviderError::NotFound(format!(
            "message not found: {provider_message_id}"
        )));
    }

    let mut uids: Vec<u32> = results.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

fn since_to_imap_date(since: &str) -> Result<String, ProviderError> {
    let parsed = DateTime::parse_from_rfc3339(since).map_err(|error| {
        ProviderError::Fatal(anyhow!("parse since timestamp {since}: {error}"))
    })?;
    Ok(parsed.with_timezone(&Utc).format("%d-%b-%Y").to_string())
}

/// IMAP keywords are bare atoms; squash anything that would break the
/// STORE syntax.
fn sanitize_keyword(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn fetch_to_normalized(
    fetch: &imap::types::Fetch,
    uid_validity: u32,
    account: &EmailAccount,
) -> Option<NormalizedMessage> {
    let raw = fetch.body()?;
    let uid = fetch.uid.unwrap_or(0);
    let fallback_id = format!("uid:{uid_validity}:{uid}");
    let is_read = fetch.flags().iter().any(|flag| matches!(flag, Flag::Seen));
    Some(normalize_mail(raw, fallback_id, is_read, account))
}

fn normalize_mail(
    raw: &[u8],
    fallback_id: String,
    is_read: bool,
    account: &EmailAccount,
) -> NormalizedMessage {
    let parsed = match mailparse::parse_mail(raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!("mailparse failed, storing lossy body: {error}");
            return NormalizedMessage {
                id: Uuid::new_v4().to_string(),
                user_id: account.user_id.clone(),
                account_id: account.account_id.clone(),
                provider_message_id: fallback_id,
                thread_id: None,
                from_address: None,
                from_name: None,
                to_addresses: Vec::new(),
                cc_addresses: Vec::new(),
                subject: None,
                body_text: Some(String::from_utf8_lossy(raw).to_string()),
                body_html: None,
                received_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                is_read: Some(is_read),
                has_attachments: Some(false),
                unsubscribe_url: None,
                unsubscribe_mailto: None,
            };
        }
    };

    let headers = &parsed.headers;

    let provider_message_id = headers
        .get_first_value("Message-ID")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback_id);

    let (from_name, from_address) = headers
        .get_first_value("From")
        .map(|value| first_address(&value))
        .unwrap_or((None, None));

    let to_addresses = headers
        .get_first_value("To")
        .map(|value| address_list(&value))
        .unwrap_or_default();
    let cc_addresses = headers
        .get_first_value("Cc")
        .map(|value| address_list(&value))
        .unwrap_or_default();

    let received_at = headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();

    let (unsubscribe_url, unsubscribe_mailto) = headers
        .get_first_value("List-Unsubscribe")
        .map(|value| parse_unsubscribe_value(&value))
        .unwrap_or((None, None));

    let body_text = first_part_of_type(&parsed, "text/plain");
    let mut body_html = first_part_of_type(&parsed, "text/html");

    if let Some(html) = body_html.as_deref() {
        if html.contains("cid:") {
            let mut inline = Vec::new();
            collect_inline_images(&parsed, &mut inline);
            if !inline.is_empty() {
                body_html = Some(rewrite_cid_references(html, &inline));
            }
        }
    }

    let body_text = body_text.or_else(|| {
        body_html.as_deref().map(|html| {
            std::panic::catch_unwind(|| {
                html2text::from_read(html.as_bytes(), 120)
                    .lines()
                    .map(str::trim_end)
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim()
                    .to_string()
            })
            .unwrap_or_default()
        })
        .filter(|text| !text.is_empty())
    });

    NormalizedMessage {
        id: Uuid::new_v4().to_string(),
        user_id: account.user_id.clone(),
        account_id: account.account_id.clone(),
        provider_message_id,
        thread_id: headers
            .get_first_value("Thread-Topic")
            .or_else(|| headers.get_first_value("References"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        from_address,
        from_name,
        to_addresses,
        cc_addresses,
        subject: headers
            .get_first_value("Subject")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        body_text,
        body_html,
        received_at,
        is_read: Some(is_read),
        has_attachments: Some(has_attachments(&parsed)),
        unsubscribe_url,
        unsubscribe_mailto,
    }
}

fn first_address(raw: &str) -> (Option<String>, Option<String>) {
    match mailparse::addrparse(raw) {
        Ok(list) => list
            .iter()
            .next()
            .map(|addr| match addr {
                mailparse::MailAddr::Single(single) => {
                    (single.display_name.clone(), Some(single.addr.clone()))
                }
                mailparse::MailAddr::Group(group) => (
                    Some(group.group_name.clone()),
                    group.addrs.first().map(|single| single.addr.clone()),
                ),
            })
            .unwrap_or((None, None)),
        Err(_) => (None, None),
    }
}

fn address_list(raw: &str) -> Vec<String> {
    match mailparse::addrparse(raw) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                mailparse::MailAddr::Single(single) => vec![single.addr.clone()],
                mailparse::MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|single| single.addr.clone())
                    .collect(),
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn first_part_of_type(parsed: &ParsedMail<'_>, target: &str) -> Option<String> {
    if parsed.subparts.is_empty() {
        if parsed.ctype.mimetype.eq_ignore_ascii_case(target) {
            return parsed
                .get_body()
                .ok()
                .map(|body| body.trim().to_string())
                .filter(|body| !body.is_empty());
        }
        return None;
    }

    for part in &parsed.subparts {
        if let Some(text) = first_part_of_type(part, target) {
            return Some(text);
        }
    }
    None
}

fn has_attachments(parsed: &ParsedMail<'_>) -> bool {
    for part in &parsed.subparts {
        if part.get_content_disposition().disposition == mailparse::DispositionType::Attachment {
            return true;
        }
        if has_attachments(part) {
            return true;
        }
    }
    false
}

/// (content id without angle brackets, mime type, base64 payload)
type InlineImage = (String, String, String);

fn collect_inline_images(parsed: &ParsedMail<'_>, out: &mut Vec<InlineImage>) {
    for part in &parsed.subparts {
        let content_id = part
            .headers
            .get_first_value("Content-ID")
            .map(|value| value.trim().trim_matches(['<', '>']).to_string())
            .filter(|value| !value.is_empty());

        if let Some(content_id) = content_id {
            let inline = part.get_content_disposition().disposition
                == mailparse::DispositionType::Inline
                || part.ctype.mimetype.starts_with("image/");
            if inline {
                if let Ok(bytes) = part.get_body_raw() {
                    out.push((content_id, part.ctype.mimetype.clone(), BASE64.encode(bytes)));
                }
            }
        }

        collect_inline_images(part, out);
    }
}

fn rewrite_cid_references(html: &str, images: &[InlineImage]) -> String {
    let mut rewritten = html.to_string();
    for (content_id, mimetype, payload) in images {
        let data_uri = format!("data:{mimetype};base64,{payload}");
        rewritten = rewritten.replace(&format!("cid:{content_id}"), &data_uri);
    }
    rewritten
}

#[async_trait]
impl MailProvider for ImapProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    async fn fetch_recent(&self, limit: usize) -> ProviderResult<Vec<NormalizedMessage>> {
        if limit == 0 {
            return Ok(CallOutcome::new(Vec::new()));
        }

        let account = self.account.clone();
        let messages = self
            .with_session(move |session| {
                let mailbox = session
                    .select(INBOX)
                    .map_err(|error| imap_call_error("select", error))?;
                let total = mailbox.exists;
                if total == 0 {
                    return Ok(Vec::new());
                }

                let start = total.saturating_sub(limit.saturating_sub(1) as u32).max(1);
                let range = format!("{start}:{total}");
                let fetches = session
                    .fetch(&range, FETCH_QUERY)
                    .map_err(|error| imap_call_error("fetch", error))?;

                let uid_validity = mailbox.uid_validity.unwrap_or(0);
                let mut messages: Vec<NormalizedMessage> = fetches
                    .iter()
                    .filter_map(|fetch| fetch_to_normalized(fetch, uid_validity, &account))
                    .collect();
                messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
                messages.truncate(limit);
                Ok(messages)
            })
            .await?;

        Ok(CallOutcome::new(messages))
    }

    async fn fetch_since(
        &self,
        since: &str,
        limit: Option<usize>,
    ) -> ProviderResult<Vec<NormalizedMessage>> {
        let imap_date = since_to_imap_date(since)?;
        let account = self.account.clone();

        let messages = self
            .with_session(move |session| {
                let mailbox = session
                    .select(INBOX)
                    .map_err(|error| imap_call_error("select", error))?;

                let results = session
                    .uid_search(format!("SINCE {imap_date}"))
                    .map_err(|error| imap_call_error("search", error))?;
                if results.is_empty() {
                    return Ok(Vec::new());
                }

                let mut uids: Vec<u32> = results.into_iter().collect();
                uids.sort_unstable();

                let fetches = session
                    .uid_fetch(uid_str(&uids), FETCH_QUERY)
                    .map_err(|error| imap_call_error("fetch", error))?;

                let uid_validity = mailbox.uid_validity.unwrap_or(0);
                let mut messages: Vec<NormalizedMessage> = fetches
                    .iter()
                    .filter_map(|fetch| fetch_to_normalized(fetch, uid_validity, &account))
                    .collect();
                messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
                if let Some(cap) = limit {
                    messages.truncate(cap);
                }
                Ok(messages)
            })
            .await?;

        Ok(CallOutcome::new(messages))
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> ProviderResult<FetchReport> {
        let ids = ids.to_vec();
        let account = self.account.clone();

        let report = self
            .with_session(move |session| {
                let mailbox = session
                    .select(INBOX)
                    .map_err(|error| imap_call_error("select", error))?;
                let uid_validity = mailbox.uid_validity.unwrap_or(0);

                let mut report = FetchReport::default();
                for id in &ids {
                    let fetched = find_message_uids(session, id, uid_validity).and_then(|uids| {
                        session
                            .uid_fetch(uid_str(&uids), FETCH_QUERY)
                            .map_err(|error| imap_call_error("fetch", error))
                    });

                    match fetched {
                        Ok(fetches) => {
                            match fetches
                                .iter()
                                .find_map(|fetch| fetch_to_normalized(fetch, uid_validity, &account))
                            {
                                Some(message) => report.messages.push(message),
                                None => {
                                    warn!("fetch by id {id} returned no parseable body");
                                    report.failed_ids.push(id.clone());
                                }
                            }
                        }
                        Err(error) => {
                            warn!("fetch by id {id} failed: {error}");
                            report.failed_ids.push(id.clone());
                        }
                    }
                }
                Ok(report)
            })
            .await?;

        Ok(CallOutcome::new(report))
    }

    async fn mark_read(&self, provider_message_id: &str) -> ProviderResult<()> {
        let id = provider_message_id.to_string();
        self.with_session(move |session| {
            let mailbox = session
                .select(INBOX)
                .map_err(|error| imap_call_error("select", error))?;
            let uids = find_message_uids(session, &id, mailbox.uid_validity.unwrap_or(0))?;
            session
                .uid_store(uid_str(&uids), "+FLAGS (\\Seen)")
                .map_err(|error| imap_call_error("store", error))?;
            Ok(())
        })
        .await?;
        Ok(CallOutcome::new(()))
    }

    async fn mark_unread(&self, provider_message_id: &str) -> ProviderResult<()> {
        let id = provider_message_id.to_string();
        self.with_session(move |session| {
            let mailbox = session
                .select(INBOX)
                .map_err(|error| imap_call_error("select", error))?;
            let uids = find_message_uids(session, &id, mailbox.uid_validity.unwrap_or(0))?;
            session
                .uid_store(uid_str(&uids), "-FLAGS (\\Seen)")
                .map_err(|error| imap_call_error("store", error))?;
            Ok(())
        })
        .await?;
        Ok(CallOutcome::new(()))
    }

    async fn trash(&self, provider_message_id: &str) -> ProviderResult<()> {
        let id = provider_message_id.to_string();
        let trash = self.trash_folder();
        self.with_session(move |session| {
            let mailbox = session
                .select(INBOX)
                .map_err(|error| imap_call_error("select", error))?;
            let uids = find_message_uids(session, &id, mailbox.uid_validity.unwrap_or(0))?;
            let ids = uid_str(&uids);

            session
                .uid_copy(&ids, &trash)
                .map_err(|error| imap_call_error("copy", error))?;
            session
                .uid_store(&ids, "+FLAGS (\\Deleted)")
                .map_err(|error| imap_call_error("store", error))?;
            expunge_uids(session, &ids)?;
            Ok(())
        })
        .await?;
        Ok(CallOutcome::new(()))
    }

    async fn untrash(&self, provider_message_id: &str) -> ProviderResult<()> {
        let id = provider_message_id.to_string();
        let trash = self.trash_folder();
        self.with_session(move |session| {
            let mailbox = session
                .select(&trash)
                .map_err(|error| imap_call_error("select", error))?;
            let uids = find_message_uids(session, &id, mailbox.uid_validity.unwrap_or(0))?;
            let ids = uid_str(&uids);

            session
                .uid_copy(&ids, INBOX)
                .map_err(|error| imap_call_error("copy", error))?;
            session
                .uid_store(&ids, "+FLAGS (\\Deleted)")
                .map_err(|error| imap_call_error("store", error))?;
            expunge_uids(session, &ids)?;
            Ok(())
        })
        .await?;
        Ok(CallOutcome::new(()))
    }

    async fn add_label(&self, provider_message_id: &str, label: &str) -> ProviderResult<()> {
        let id = provider_message_id.to_string();
        let keyword = sanitize_keyword(label);
        self.with_session(move |session| {
            let mailbox = session
                .select(INBOX)
                .map_err(|error| imap_call_error("select", error))?;
            let uids = find_message_uids(session, &id, mailbox.uid_validity.unwrap_or(0))?;
            session
                .uid_store(uid_str(&uids), format!("+FLAGS ({keyword})"))
                .map_err(|error| imap_call_error("store", error))?;
            Ok(())
        })
        .await?;
        Ok(CallOutcome::new(()))
    }

    async fn remove_label(&self, provider_message_id: &str, label: &str) -> ProviderResult<()> {
        let id = provider_message_id.to_string();
        let keyword = sanitize_keyword(label);
        self.with_session(move |session| {
            let mailbox = session
                .select(INBOX)
                .map_err(|error| imap_call_error("select", error))?;
            let uids = find_message_uids(session, &id, mailbox.uid_validity.unwrap_or(0))?;
            session
                .uid_store(uid_str(&uids), format!("-FLAGS ({keyword})"))
                .map_err(|error| imap_call_error("store", error))?;
            Ok(())
        })
        .await?;
        Ok(CallOutcome::new(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    use super::{
        address_list, expunge_uids, first_address, normalize_mail, sanitize_keyword,
        since_to_imap_date,
    };
    use crate::db::models::{EmailAccount, ProviderKind};

    fn account() -> EmailAccount {
        EmailAccount {
            account_id: "acc-imap".to_string(),
            user_id: "user-1".to_string(),
            email_address: "owner@example.com".to_string(),
            display_name: None,
            provider: ProviderKind::Imap,
            enabled: true,
            initial_sync_complete: false,
            last_sync_at: None,
            last_sync_error: None,
            subscription_id: None,
            config: None,
        }
    }

    #[test]
    fn keyword_sanitization() {
        assert_eq!(sanitize_keyword("Finance"), "Finance");
        assert_eq!(sanitize_keyword("Follow Up!"), "Follow_Up_");
        assert_eq!(sanitize_keyword("  "), "_");
        assert_eq!(sanitize_keyword("a.b-c_d"), "a.b-c_d");
    }

    #[test]
    fn since_timestamp_becomes_imap_date() {
        assert_eq!(
            since_to_imap_date("2026-02-01T12:30:00Z").expect("convert date"),
            "01-Feb-2026"
        );
        assert!(since_to_imap_date("not a date").is_err());
    }

    #[test]
    fn address_parsing_handles_names_and_lists() {
        let (name, addr) = first_address("News Desk <news@example.com>");
        assert_eq!(name.as_deref(), Some("News Desk"));
        assert_eq!(addr.as_deref(), Some("news@example.com"));

        let list = address_list("a@example.com, B Person <b@example.com>");
        assert_eq!(
            list,
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );

        assert_eq!(first_address("<<<"), (None, None));
    }

    #[test]
    fn plain_message_normalizes_with_fallback_id() {
        let raw = concat!(
            "From: Alex <alex@example.com>\r\n",
            "To: owner@example.com\r\n",
            "Subject: Lunch?\r\n",
            "Date: Mon, 2 Feb 2026 10:00:00 +0000\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Tomorrow at noon?\r\n"
        );

        let message = normalize_mail(raw.as_bytes(), "uid:7:42".to_string(), true, &account());
        assert_eq!(message.provider_message_id, "uid:7:42");
        assert_eq!(message.subject.as_deref(), Some("Lunch?"));
        assert_eq!(message.from_address.as_deref(), Some("alex@example.com"));
        assert_eq!(message.from_name.as_deref(), Some("Alex"));
        assert_eq!(message.to_addresses, vec!["owner@example.com".to_string()]);
        assert_eq!(message.body_text.as_deref(), Some("Tomorrow at noon?"));
        assert!(message.body_html.is_none());
        assert_eq!(message.received_at, "2026-02-02T10:00:00Z");
        assert_eq!(message.is_read, Some(true));
        assert_eq!(message.has_attachments, Some(false));
    }

    #[test]
    fn multipart_message_inlines_images_and_extracts_unsubscribe() {
        let raw = concat!(
            "From: News <news@example.com>\r\n",
            "To: owner@example.com\r\n",
            "Subject: Weekly\r\n",
            "Date: Mon, 2 Feb 2026 10:00:00 +0000\r\n",
            "Message-ID: <weekly-9@news.example.com>\r\n",
            "List-Unsubscribe: <https://news.example.com/u/9>, <mailto:u@news.example.com>\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/related; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>Logo <img src=\"cid:logo1\"></p>\r\n",
            "--b1\r\n",
            "Content-Type: image/png\r\n",
            "Content-ID: <logo1>\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "Content-Disposition: inline\r\n",
            "\r\n",
            "aWNvbg==\r\n",
            "--b1--\r\n"
        );

        let message = normalize_mail(raw.as_bytes(), "uid:7:43".to_string(), false, &account());
        assert_eq!(
            message.provider_message_id,
            "<weekly-9@news.example.com>"
        );
        let html = message.body_html.expect("html body");
        assert!(html.contains("data:image/png;base64,aWNvbg=="), "{html}");
        assert!(!html.contains("cid:logo1"));

        let text = message.body_text.expect("derived text body");
        assert!(text.contains("Logo"));

        assert_eq!(
            message.unsubscribe_url.as_deref(),
            Some("https://news.example.com/u/9")
        );
        assert_eq!(
            message.unsubscribe_mailto.as_deref(),
            Some("mailto:u@news.example.com")
        );
        assert_eq!(message.is_read, Some(false));
    }

    #[test]
    fn attachment_disposition_is_detected() {
        let raw = concat!(
            "From: hr@example.com\r\n",
            "To: owner@example.com\r\n",
            "Subject: Contract\r\n",
            "Date: Mon, 2 Feb 2026 11:00:00 +0000\r\n",
            "Message-ID: <contract@example.com>\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"b2\"\r\n",
            "\r\n",
            "--b2\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Signed copy attached.\r\n",
            "--b2\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Disposition: attachment; filename=\"contract.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0=\r\n",
            "--b2--\r\n"
        );

        let message = normalize_mail(raw.as_bytes(), "uid:7:44".to_string(), false, &account());
        assert_eq!(message.has_attachments, Some(true));
        assert_eq!(message.body_text.as_deref(), Some("Signed copy attached."));
    }

    #[test]
    fn unparseable_bytes_fall_back_to_lossy_text() {
        let message = normalize_mail(b"\xff\xfe\x00", "uid:1:1".to_string(), false, &account());
        assert_eq!(message.provider_message_id, "uid:1:1");
        assert!(message.body_text.is_some());
    }

    /// Replays canned server lines while recording every command the
    /// session writes, so folder operations can run without a socket.
    struct ScriptedStream {
        replies: io::Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.replies.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written
                .lock()
                .expect("written lock")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn scripted_session(replies: &str) -> (imap::Session<ScriptedStream>, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let stream = ScriptedStream {
            replies: io::Cursor::new(replies.as_bytes().to_vec()),
            written: written.clone(),
        };
        let session = imap::Client::new(stream)
            .login("mailbox@example.com", "secret")
            .map_err(|(error, _)| error)
            .expect("scripted login");
        (session, written)
    }

    fn sent_commands(written: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&written.lock().expect("written lock")).to_string()
    }

    #[test]
    fn expunge_is_scoped_to_uids_when_server_has_uidplus() {
        let (mut session, written) = scripted_session(concat!(
            "* OK ready\r\n",
            "a1 OK logged in\r\n",
            "* CAPABILITY IMAP4rev1 UIDPLUS\r\n",
            "a2 OK capability done\r\n",
            "* 7 EXPUNGE\r\n",
            "a3 OK expunged\r\n",
            "* BYE\r\n",
            "a4 OK logout done\r\n",
        ));

        expunge_uids(&mut session, "7").expect("scoped expunge");

        let sent = sent_commands(&written);
        assert!(sent.contains("UID EXPUNGE 7"), "{sent}");
        assert!(
            !sent.lines().any(|line| line.trim_end() == "a3 EXPUNGE"),
            "a folder-wide expunge would drop other clients' deferred deletes: {sent}"
        );
    }

    #[test]
    fn expunge_falls_back_to_folder_wide_without_uidplus() {
        let (mut session, written) = scripted_session(concat!(
            "* OK ready\r\n",
            "a1 OK logged in\r\n",
            "* CAPABILITY IMAP4rev1\r\n",
            "a2 OK capability done\r\n",
            "* 3 EXPUNGE\r\n",
            "a3 OK expunged\r\n",
            "* BYE\r\n",
            "a4 OK logout done\r\n",
        ));

        expunge_uids(&mut session, "7").expect("fallback expunge");

        let sent = sent_commands(&written);
        assert!(!sent.contains("UID EXPUNGE"), "{sent}");
        assert!(sent.contains("a3 EXPUNGE"), "{sent}");
    }
}
