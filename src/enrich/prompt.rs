//! Prompt construction and completion-output parsing for the enrichment
//! pass. The model is asked for one JSON object; anything that does not
//! parse into the required shape discards the whole enrichment rather
//! than applying it partially.

use serde::Deserialize;
use tracing::debug;

use crate::db::models::{Badge, NormalizedMessage};

const BODY_PREVIEW_CHARS: usize = 1200;

pub const SYSTEM_PROMPT: &str = "You are an email triage engine. You read one email and \
return a single JSON object describing it. Respond with JSON only: no markdown fences, \
no commentary.";

const ANALYSIS_PROMPT: &str = r##"Analyze this email and respond with ONLY a JSON object.

Email:
From: {from}
Subject: {subject}
Received: {received}
Body (truncated): {body}

{domain_note}
Badge names this user already uses (reuse them when they fit instead of inventing synonyms): {badge_vocabulary}

Required JSON shape:
{
  "summary": "one or two sentences",
  "scores": {
    "work_related": 0.0, "personal": 0.0, "urgency": 0.0, "financial": 0.0,
    "social": 0.0, "promotional": 0.0, "requires_action": 0.0
  },
  "badges": [
    { "name": "Finance", "color": "#22C55E", "icon": "banknote", "importance": 0.7, "category": "Money" }
  ],
  "metadata": { "meeting_time": null, "deadline": null, "tracking_number": null }
}

Every score and badge importance must be a number between 0 and 1."##;

/// Sender domains we recognize without asking the model. Matched against
/// the part after `@`, including subdomains.
const KNOWN_SERVICES: &[(&str, &str, &str)] = &[
    ("github.com", "GitHub", "Development"),
    ("gitlab.com", "GitLab", "Development"),
    ("atlassian.net", "Atlassian", "Development"),
    ("linkedin.com", "LinkedIn", "Social"),
    ("facebookmail.com", "Facebook", "Social"),
    ("twitter.com", "Twitter", "Social"),
    ("amazon.com", "Amazon", "Shopping"),
    ("ebay.com", "eBay", "Shopping"),
    ("paypal.com", "PayPal", "Finance"),
    ("stripe.com", "Stripe", "Finance"),
    ("intuit.com", "Intuit", "Finance"),
    ("google.com", "Google", "Productivity"),
    ("microsoft.com", "Microsoft", "Productivity"),
    ("apple.com", "Apple", "Productivity"),
    ("dropbox.com", "Dropbox", "Productivity"),
    ("slack.com", "Slack", "Work"),
    ("zoom.us", "Zoom", "Meetings"),
    ("calendly.com", "Calendly", "Meetings"),
    ("doordash.com", "DoorDash", "Food"),
    ("uber.com", "Uber", "Travel"),
    ("airbnb.com", "Airbnb", "Travel"),
    ("booking.com", "Booking.com", "Travel"),
    ("netflix.com", "Netflix", "Entertainment"),
    ("spotify.com", "Spotify", "Entertainment"),
    ("substack.com", "Substack", "Newsletter"),
    ("medium.com", "Medium", "Newsletter"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct DomainIntel {
    pub company: String,
    pub category: String,
}

pub fn domain_intel(from_address: &str) -> Option<DomainIntel> {
    let domain = from_address.rsplit('@').next()?.trim().to_ascii_lowercase();
    if domain.is_empty() {
        return None;
    }

    KNOWN_SERVICES.iter().find_map(|(suffix, company, category)| {
        let matched = domain == *suffix || domain.ends_with(&format!(".{suffix}"));
        matched.then(|| DomainIntel {
            company: (*company).to_string(),
            category: (*category).to_string(),
        })
    })
}

pub fn build_prompt(
    message: &NormalizedMessage,
    intel: Option<&DomainIntel>,
    vocabulary: &[Badge],
) -> String {
    let body_preview: String = message
        .body_text
        .as_deref()
        .or(message.body_html.as_deref())
        .unwrap_or("")
        .chars()
        .take(BODY_PREVIEW_CHARS)
        .collect();

    let from = match (&message.from_name, &message.from_address) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.clone(),
        (Some(name), None) => name.clone(),
        (None, None) => "(unknown sender)".to_string(),
    };

    let domain_note = match intel {
        Some(intel) => format!(
            "Sender domain intelligence: {} is a known {} service.",
            intel.company, intel.category
        ),
        None => "Sender domain intelligence: none.".to_string(),
    };

    let badge_names = if vocabulary.is_empty() {
        "(none yet)".to_string()
    } else {
        vocabulary
            .iter()
            .map(|badge| badge.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    ANALYSIS_PROMPT
        .replace("{from}", &from)
        .replace(
            "{subject}",
            message.subject.as_deref().unwrap_or("(no subject)"),
        )
        .replace("{received}", &message.received_at)
        .replace("{body}", &body_preview)
        .replace("{domain_note}", &domain_note)
        .replace("{badge_vocabulary}", &badge_names)
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawAnalysis {
    pub summary: String,
    pub scores: RawScores,
    #[serde(default)]
    pub badges: Vec<RawBadge>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawScores {
    #[serde(default, alias = "work")]
    pub work_related: f64,
    #[serde(default)]
    pub personal: f64,
    #[serde(default, alias = "urgent")]
    pub urgency: f64,
    #[serde(default)]
    pub financial: f64,
    #[serde(default)]
    pub social: f64,
    #[serde(default)]
    pub promotional: f64,
    #[serde(default, alias = "requiresAction", alias = "action_required")]
    pub requires_action: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawBadge {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default = "default_badge_importance")]
    pub importance: f64,
    #[serde(default)]
    pub category: Option<String>,
}

fn default_badge_importance() -> f64 {
    0.5
}

/// Models wrap JSON in prose and code fences no matter how firmly the
/// prompt forbids it; take the outermost brace pair and parse that.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Parse completion output into an analysis, or nothing. A missing or
/// blank summary counts as a parse failure: enrichment is all-or-nothing.
pub(crate) fn parse_analysis(raw: &str) -> Option<RawAnalysis> {
    let json = extract_json_object(raw)?;
    match serde_json::from_str::<RawAnalysis>(json) {
        Ok(parsed) if !parsed.summary.trim().is_empty() => Some(parsed),
        Ok(_) => {
            debug!("completion output has empty summary, discarding");
            None
        }
        Err(error) => {
            debug!("completion output is not valid analysis JSON: {error}");
            None
        }
    }
}
