//! AI enrichment pass. Builds a personalized prompt per message, runs the
//! completion calls with bounded concurrency, then validates and persists
//! the results. Enrichment is strictly additive: any failure here leaves
//! the stored message untouched and is retried only on explicit request.

pub mod completion;
pub mod prompt;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, warn};

pub use completion::{CompletionBackend, HttpCompletion};
pub use prompt::{build_prompt, domain_intel, DomainIntel, SYSTEM_PROMPT};

use crate::db::models::{Badge, EnrichedAnalysis, NormalizedMessage, ScoreSet};
use crate::db::Database;
use prompt::{RawAnalysis, RawScores};

pub const MAX_CONCURRENT_ENRICHMENTS: usize = 4;
const BADGE_VOCABULARY_LIMIT: usize = 12;
const HIGH_IMPORTANCE_BADGE: f64 = 0.8;
const BADGE_BOOST: f64 = 0.05;

const COMPANY_BADGE_COLOR: &str = "#6366F1";
const COMPANY_BADGE_ICON: &str = "building";
const COMPANY_BADGE_IMPORTANCE: f64 = 0.4;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentSummary {
    pub enriched: usize,
    pub failed: usize,
}

struct PreparedEnrichment {
    message_id: String,
    prompt: String,
    intel: Option<DomainIntel>,
}

struct CompletionAttempt {
    job: PreparedEnrichment,
    outcome: Result<String, String>,
    duration_ms: i64,
}

/// Enrich a batch of already-persisted messages. Database reads and writes
/// stay on this task; only the completion calls fan out, at most
/// [`MAX_CONCURRENT_ENRICHMENTS`] in flight. One bad completion never
/// affects the other messages in the batch.
pub async fn enrich_batch(
    db: &Database,
    backend: Arc<dyn CompletionBackend>,
    messages: &[NormalizedMessage],
) -> Result<EnrichmentSummary> {
    if messages.is_empty() {
        return Ok(EnrichmentSummary::default());
    }

    let mut pending = Vec::with_capacity(messages.len());
    for message in messages {
        pending.push(prepare(db, message)?);
    }

    let model = backend.model_name();
    let mut pending = pending.into_iter();
    let mut join_set = tokio::task::JoinSet::new();
    let mut summary = EnrichmentSummary::default();

    loop {
        while join_set.len() < MAX_CONCURRENT_ENRICHMENTS {
            let Some(job) = pending.next() else { break };
            let backend = backend.clone();
            join_set.spawn(async move {
                let started = Instant::now();
                let outcome = backend
                    .complete(SYSTEM_PROMPT, &job.prompt)
                    .await
                    .map_err(|error| error.to_string());
                CompletionAttempt {
                    job,
                    outcome,
                    duration_ms: started.elapsed().as_millis() as i64,
                }
            });
        }

        match join_set.join_next().await {
            Some(Ok(attempt)) => {
                if finish_attempt(db, attempt, &model) {
                    summary.enriched += 1;
                } else {
                    summary.failed += 1;
                }
            }
            Some(Err(join_error)) => {
                warn!("enrichment task failed to complete: {join_error}");
                summary.failed += 1;
            }
            None => break,
        }
    }

    Ok(summary)
}

fn prepare(db: &Database, message: &NormalizedMessage) -> Result<PreparedEnrichment> {
    let vocabulary = db.badge_vocabulary(&message.user_id, BADGE_VOCABULARY_LIMIT)?;
    let intel = message.from_address.as_deref().and_then(domain_intel);
    let prompt = build_prompt(message, intel.as_ref(), &vocabulary);

    Ok(PreparedEnrichment {
        message_id: message.id.clone(),
        prompt,
        intel,
    })
}

/// Validate and persist one completion attempt. Returns whether an
/// analysis was stored. History is written on every path, best-effort.
fn finish_attempt(db: &Database, attempt: CompletionAttempt, model: &str) -> bool {
    let CompletionAttempt {
        job,
        outcome,
        duration_ms,
    } = attempt;

    let raw_response = match outcome {
        Ok(raw) => raw,
        Err(error) => {
            warn!("enrichment call for message {} failed: {error}", job.message_id);
            record_history(db, &job.message_id, &job.prompt, None, duration_ms, false, Some(&error));
            return false;
        }
    };

    let Some(parsed) = prompt::parse_analysis(&raw_response) else {
        warn!(
            "enrichment output for message {} was not usable, skipping",
            job.message_id
        );
        record_history(
            db,
            &job.message_id,
            &job.prompt,
            Some(&raw_response),
            duration_ms,
            false,
            Some("completion output failed validation"),
        );
        return false;
    };

    let analysis = analysis_from_raw(&job.message_id, parsed, job.intel.as_ref(), model);
    if let Err(error) = db.upsert_analysis(&analysis) {
        warn!("persist analysis for message {}: {error}", job.message_id);
        record_history(
            db,
            &job.message_id,
            &job.prompt,
            Some(&raw_response),
            duration_ms,
            false,
            Some(&error.to_string()),
        );
        return false;
    }

    debug!(
        "message {} enriched, importance {:.2}",
        job.message_id, analysis.importance_score
    );
    record_history(db, &job.message_id, &job.prompt, Some(&raw_response), duration_ms, true, None);
    true
}

fn record_history(
    db: &Database,
    message_id: &str,
    prompt: &str,
    response: Option<&str>,
    duration_ms: i64,
    success: bool,
    error: Option<&str>,
) {
    if let Err(history_error) =
        db.insert_enrichment_record(message_id, Some(prompt), response, duration_ms, success, error)
    {
        warn!("record enrichment history for {message_id}: {history_error}");
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn clamped_scores(raw: &RawScores) -> ScoreSet {
    ScoreSet {
        work_related: clamp_unit(raw.work_related),
        personal: clamp_unit(raw.personal),
        urgency: clamp_unit(raw.urgency),
        financial: clamp_unit(raw.financial),
        social: clamp_unit(raw.social),
        promotional: clamp_unit(raw.promotional),
        requires_action: clamp_unit(raw.requires_action),
    }
}

/// Weighted average over the named scores, urgency and requires-action
/// heaviest, plus a small boost per high-importance badge. Capped at 1.
fn master_score(scores: &ScoreSet, badges: &[Badge]) -> f64 {
    let weighted = scores.urgency * 0.25
        + scores.requires_action * 0.25
        + scores.work_related * 0.15
        + scores.financial * 0.12
        + scores.personal * 0.10
        + scores.social * 0.08
        + scores.promotional * 0.05;

    let boost = badges
        .iter()
        .filter(|badge| badge.importance >= HIGH_IMPORTANCE_BADGE)
        .count() as f64
        * BADGE_BOOST;

    (weighted + boost).min(1.0)
}

fn analysis_from_raw(
    message_id: &str,
    raw: RawAnalysis,
    intel: Option<&DomainIntel>,
    model: &str,
) -> EnrichedAnalysis {
    let scores = clamped_scores(&raw.scores);

    let mut badges: Vec<Badge> = raw
        .badges
        .into_iter()
        .map(|badge| Badge {
            name: badge.name,
            color: badge.color,
            icon: badge.icon,
            importance: clamp_unit(badge.importance),
            category: badge.category,
        })
        .collect();

    if let Some(intel) = intel {
        let already_badged = badges
            .iter()
            .any(|badge| badge.name.eq_ignore_ascii_case(&intel.company));
        if !already_badged {
            badges.push(Badge {
                name: intel.company.clone(),
                color: Some(COMPANY_BADGE_COLOR.to_string()),
                icon: Some(COMPANY_BADGE_ICON.to_string()),
                importance: COMPANY_BADGE_IMPORTANCE,
                category: Some("Company".to_string()),
            });
        }
    }

    let importance_score = master_score(&scores, &badges);

    EnrichedAnalysis {
        message_id: message_id.to_string(),
        summary: raw.summary.trim().to_string(),
        badges,
        scores,
        importance_score,
        metadata: raw.metadata,
        model: Some(model.to_string()),
        created_at: None,
        updated_at: None,
    }
}
