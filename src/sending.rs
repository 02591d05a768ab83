//! Campaign sending state machine
//!
//! A campaign moves `draft → sending → {sent | retrying}` and `retrying → {sent |
//! retrying | failed}`. Every call processes at most one chunk and all progress lives
//! in the persisted [`SendingSettings`], so the process may be stopped between any
//! two calls and resume where it left off.
//!
//! Each pass first persists a lease (`in_flight_since`, `in_flight_until`) with a
//! version check. The lease deadline covers the worst-case duration of the slice
//! being sent. A concurrent call against the same campaign then sees either the
//! lease or a version conflict and is rejected before it can read a stale
//! `failed_emails` list.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

use crate::chunk::{chunk_range, process_sending_chunk, total_chunks};
use crate::config::Config;
use crate::database::{self, random_id, AppState};
use crate::error::AppError;
use crate::model::{
    AnalyticsRecord, ChunkResult, CreateNewsletterRequest, Dispatch, DispatchResponse,
    NewsletterRecord, NewsletterStatus, PassKind, SendingSettings,
};
use crate::recipients::validate_and_hash_emails;
use crate::tracking::{add_tracking_to_newsletter, link_hosts};

/// Builds a draft campaign from an operator request and configuration defaults
pub fn new_draft(
    config: &Config,
    req: CreateNewsletterRequest,
) -> Result<NewsletterRecord, AppError> {
    let chunk_size = req.chunk_size.unwrap_or(config.chunk_size);
    if chunk_size == 0 {
        return Err(AppError::Validation("chunkSize must be greater than 0".into()));
    }
    if req.recipient_lists.is_empty() {
        return Err(AppError::Validation("recipientLists must not be empty".into()));
    }

    let now = Utc::now();
    Ok(NewsletterRecord {
        id: random_id(12),
        status: NewsletterStatus::Draft,
        settings: SendingSettings {
            from_email: req.from_email.unwrap_or_else(|| config.from_email.clone()),
            from_name: req.from_name.unwrap_or_else(|| config.from_name.clone()),
            reply_to_email: req
                .reply_to_email
                .unwrap_or_else(|| config.reply_to_email.clone()),
            chunk_size,
            chunk_delay_ms: req.chunk_delay_ms.unwrap_or(config.chunk_delay_ms),
            email_timeout_ms: req.email_timeout_ms.unwrap_or(config.email_timeout_ms),
            recipient_lists: req.recipient_lists,
            total_recipients: 0,
            successful_sends: 0,
            failed_sends: 0,
            failed_emails: Vec::new(),
            chunk_results: Vec::new(),
            retry_in_progress: false,
            sending_started_at: None,
            sending_completed_at: None,
            recipients: Vec::new(),
            next_chunk: 0,
            invalid_emails: Vec::new(),
            duplicates_removed: 0,
            retry_attempts: 0,
            max_retry_attempts: req.max_retry_attempts.unwrap_or(config.max_retry_attempts),
            in_flight_since: None,
            in_flight_until: None,
        },
        analytics_id: None,
        version: 0,
        created_at: now,
        updated_at: now,
    })
}

fn lease_is_live(settings: &SendingSettings, config: &Config, now: DateTime<Utc>) -> bool {
    match (settings.in_flight_until, settings.in_flight_since) {
        (Some(until), _) => now < until,
        // records written before the deadline existed
        (None, Some(since)) => (now - since).num_seconds() < config.send_lease_secs,
        (None, None) => false,
    }
}

/// Latest time a pass over `slice_len` recipients can still be running
///
/// Every delivery is bounded by `email_timeout_ms`; `send_lease_secs` is added on
/// top for tracking, persistence and scheduling.
fn lease_deadline(
    settings: &SendingSettings,
    config: &Config,
    now: DateTime<Utc>,
    slice_len: usize,
) -> DateTime<Utc> {
    let budget_ms = settings
        .email_timeout_ms
        .saturating_mul(slice_len as u64)
        .saturating_add((config.send_lease_secs.max(0) as u64).saturating_mul(1000));
    let budget = i64::try_from(budget_ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(budget).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn claim_lease(
    settings: &mut SendingSettings,
    config: &Config,
    now: DateTime<Utc>,
    slice_len: usize,
) {
    settings.in_flight_since = Some(now);
    settings.in_flight_until = Some(lease_deadline(settings, config, now, slice_len));
}

fn release_lease(settings: &mut SendingSettings) {
    settings.in_flight_since = None;
    settings.in_flight_until = None;
}

fn first_slice_len(settings: &SendingSettings) -> usize {
    chunk_range(settings.recipients.len(), settings.chunk_size, settings.next_chunk)
        .map_or(0, |range| range.len())
}

/// Allows click redirects to every host the outgoing content links to
fn allow_link_hosts(
    state: &AppState,
    record: &NewsletterRecord,
    html: &str,
) -> Result<(), AppError> {
    let hosts = link_hosts(html, &state.config.base_url);
    if hosts.is_empty() {
        return Ok(());
    }
    let analytics_id = record
        .analytics_id
        .as_deref()
        .ok_or_else(|| AppError::Validation("Newsletter has no analytics record".into()))?;
    database::add_link_hosts(&state.db, analytics_id, &hosts)?;
    Ok(())
}

fn load(state: &AppState, id: &str) -> Result<NewsletterRecord, AppError> {
    database::get_newsletter(&state.db, id)?
        .ok_or_else(|| AppError::NotFound(format!("Newsletter {id} not found")))
}

/// Resolves the recipient lists and moves a draft into `sending`, creating its
/// analytics record. Returns the persisted record with the lease already held.
fn start_campaign(
    state: &AppState,
    mut record: NewsletterRecord,
    now: DateTime<Utc>,
) -> Result<(NewsletterRecord, AnalyticsRecord), AppError> {
    let raw = database::load_recipients(&state.db, &record.settings.recipient_lists)?;
    let processed = validate_and_hash_emails(&raw);

    info!(
        newsletter_id = %record.id,
        valid = processed.valid_emails.len(),
        invalid = processed.invalid_emails.len(),
        duplicates = processed.duplicates_removed,
        "recipient lists resolved"
    );

    let expected = record.version;
    let settings = &mut record.settings;
    settings.total_recipients = processed.valid_emails.len();
    settings.recipients = processed.valid_emails;
    settings.invalid_emails = processed.invalid_emails;
    settings.duplicates_removed = processed.duplicates_removed;
    settings.next_chunk = 0;
    settings.sending_started_at = Some(now);
    let slice_len = first_slice_len(settings);
    claim_lease(settings, &state.config, now, slice_len);
    record.status = NewsletterStatus::Sending;

    let analytics = AnalyticsRecord {
        id: random_id(16),
        newsletter_id: record.id.clone(),
        pixel_token: random_id(32),
        total_recipients: record.settings.total_recipients,
        total_opens: 0,
        unique_opens: 0,
        link_hosts: Default::default(),
        created_at: now,
    };
    record.analytics_id = Some(analytics.id.clone());

    let saved = database::start_newsletter(&state.db, &record, expected, &analytics)?;
    Ok((saved, analytics))
}

fn pixel_token(state: &AppState, record: &NewsletterRecord) -> Result<String, AppError> {
    let analytics_id = record
        .analytics_id
        .as_deref()
        .ok_or_else(|| AppError::Validation("Newsletter has no analytics record".into()))?;
    database::get_analytics(&state.db, analytics_id)?
        .map(|a| a.pixel_token)
        .ok_or_else(|| AppError::NotFound(format!("Analytics {analytics_id} not found")))
}

fn mark_sent(record: &mut NewsletterRecord, now: DateTime<Utc>) {
    record.status = NewsletterStatus::Sent;
    record.settings.retry_in_progress = false;
    record.settings.sending_completed_at = Some(now);
}

/// Sends the next chunk of the first pass
///
/// Starts the campaign on the first call. When the last chunk has been merged the
/// campaign becomes `sent`, or `retrying` if any recipient failed.
pub async fn send_next_chunk(
    state: &AppState,
    dispatch: &Dispatch,
) -> Result<DispatchResponse, AppError> {
    let now = Utc::now();
    let record = load(state, &dispatch.newsletter_id)?;

    match record.status {
        NewsletterStatus::Draft | NewsletterStatus::Sending => {}
        NewsletterStatus::Retrying => {
            return Err(AppError::Validation(
                "Newsletter is awaiting retry, use retry-chunk".into(),
            ))
        }
        NewsletterStatus::Sent | NewsletterStatus::Failed => {
            return Err(AppError::Validation(format!(
                "Newsletter has already finished sending ({:?})",
                record.status
            )))
        }
    }
    if record.settings.retry_in_progress {
        return Err(AppError::Validation("A retry is in progress".into()));
    }
    if lease_is_live(&record.settings, &state.config, now) {
        return Err(AppError::Conflict(
            "Another chunk is currently being sent for this newsletter".into(),
        ));
    }

    let (claimed, token, invalid_emails) = if record.status == NewsletterStatus::Draft {
        let (claimed, analytics) = start_campaign(state, record, now)?;
        let invalid = claimed.settings.invalid_emails.clone();
        (claimed, analytics.pixel_token, invalid)
    } else {
        let expected = record.version;
        let mut record = record;
        let slice_len = first_slice_len(&record.settings);
        claim_lease(&mut record.settings, &state.config, now, slice_len);
        let claimed = database::update_newsletter(&state.db, &record, expected)?;
        let token = pixel_token(state, &claimed)?;
        (claimed, token, Vec::new())
    };
    allow_link_hosts(state, &claimed, &dispatch.html)?;

    let settings = &claimed.settings;
    let chunk_index = settings.next_chunk;
    let total = settings.recipients.len();
    let range = chunk_range(total, settings.chunk_size, chunk_index).unwrap_or(total..total);

    let html = add_tracking_to_newsletter(&dispatch.html, &token, &state.config.base_url);
    let chunk = process_sending_chunk(
        state.transport.as_ref(),
        settings,
        &settings.recipients[range],
        &html,
        &dispatch.subject,
    )
    .await;

    info!(
        newsletter_id = %claimed.id,
        chunk_index,
        sent = chunk.sent_count,
        failed = chunk.failed_count,
        "chunk processed"
    );

    let mut next = claimed.clone();
    merge_initial_chunk(&mut next, &chunk, chunk_index, Utc::now());

    let saved = match database::update_newsletter(&state.db, &next, claimed.version) {
        Ok(saved) => saved,
        Err(source) => {
            return Err(AppError::Persistence {
                source,
                chunk: Box::new(chunk),
            })
        }
    };

    let has_more = saved.status == NewsletterStatus::Sending;
    Ok(response(&saved, chunk, chunk_index, has_more, invalid_emails))
}

/// Folds a first-pass chunk into the campaign and advances the state machine
pub fn merge_initial_chunk(
    record: &mut NewsletterRecord,
    chunk: &ChunkResult,
    chunk_index: usize,
    now: DateTime<Utc>,
) {
    let settings = &mut record.settings;
    settings.successful_sends += chunk.sent_count;
    settings
        .failed_emails
        .extend(chunk.failed().map(str::to_string));
    settings.failed_sends = settings.failed_emails.len();
    settings
        .chunk_results
        .push(chunk.summarize(chunk_index, PassKind::Initial));
    settings.next_chunk = chunk_index + 1;
    release_lease(settings);

    let pass_complete =
        settings.next_chunk >= total_chunks(settings.recipients.len(), settings.chunk_size);
    if !pass_complete {
        return;
    }

    if settings.failed_emails.is_empty() {
        mark_sent(record, now);
    } else {
        record.status = NewsletterStatus::Retrying;
        record.settings.retry_in_progress = true;
    }
}

/// Re-sends to exactly the recipients that have not succeeded yet
///
/// Recipients that succeeded in an earlier pass are never contacted again.
pub async fn retry_failed_chunk(
    state: &AppState,
    dispatch: &Dispatch,
) -> Result<DispatchResponse, AppError> {
    let now = Utc::now();
    let record = load(state, &dispatch.newsletter_id)?;

    if !record.settings.retry_in_progress {
        return Err(AppError::Validation(
            "No retry in progress for this newsletter".into(),
        ));
    }
    if record.settings.failed_emails.is_empty() {
        return Err(AppError::Validation("No failed emails to retry".into()));
    }
    if lease_is_live(&record.settings, &state.config, now) {
        return Err(AppError::Conflict(
            "Another chunk is currently being sent for this newsletter".into(),
        ));
    }

    let expected = record.version;
    let mut record = record;
    let slice_len = record.settings.failed_emails.len();
    claim_lease(&mut record.settings, &state.config, now, slice_len);
    let claimed = database::update_newsletter(&state.db, &record, expected)?;
    let token = pixel_token(state, &claimed)?;
    allow_link_hosts(state, &claimed, &dispatch.html)?;

    let settings = &claimed.settings;
    let html = add_tracking_to_newsletter(&dispatch.html, &token, &state.config.base_url);
    let chunk = process_sending_chunk(
        state.transport.as_ref(),
        settings,
        &settings.failed_emails,
        &html,
        &dispatch.subject,
    )
    .await;

    let chunk_index = settings.chunk_results.len();
    info!(
        newsletter_id = %claimed.id,
        attempt = settings.retry_attempts + 1,
        sent = chunk.sent_count,
        failed = chunk.failed_count,
        "retry processed"
    );

    let mut next = claimed.clone();
    merge_retry_chunk(&mut next, &chunk, chunk_index, Utc::now());
    if next.status == NewsletterStatus::Failed {
        warn!(
            newsletter_id = %next.id,
            remaining = next.settings.failed_emails.len(),
            "retry limit reached, giving up"
        );
    }

    let saved = match database::update_newsletter(&state.db, &next, claimed.version) {
        Ok(saved) => saved,
        Err(source) => {
            return Err(AppError::Persistence {
                source,
                chunk: Box::new(chunk),
            })
        }
    };

    Ok(response(&saved, chunk, chunk_index, false, Vec::new()))
}

/// Folds a retry chunk into the campaign and advances the state machine
pub fn merge_retry_chunk(
    record: &mut NewsletterRecord,
    chunk: &ChunkResult,
    chunk_index: usize,
    now: DateTime<Utc>,
) {
    let succeeded: HashSet<&str> = chunk.succeeded().collect();
    let settings = &mut record.settings;

    let before = settings.failed_emails.len();
    settings
        .failed_emails
        .retain(|email| !succeeded.contains(email.as_str()));
    settings.successful_sends += before - settings.failed_emails.len();
    settings.failed_sends = settings.failed_emails.len();
    settings
        .chunk_results
        .push(chunk.summarize(chunk_index, PassKind::Retry));
    settings.retry_attempts += 1;
    release_lease(settings);

    if settings.failed_emails.is_empty() {
        mark_sent(record, now);
        return;
    }

    let exhausted =
        settings.max_retry_attempts > 0 && settings.retry_attempts >= settings.max_retry_attempts;
    if exhausted {
        record.status = NewsletterStatus::Failed;
        settings.retry_in_progress = false;
        settings.sending_completed_at = Some(now);
    } else {
        record.status = NewsletterStatus::Retrying;
        settings.retry_in_progress = true;
    }
}

fn response(
    record: &NewsletterRecord,
    chunk: ChunkResult,
    chunk_index: usize,
    has_more: bool,
    invalid_emails: Vec<String>,
) -> DispatchResponse {
    let settings = &record.settings;
    DispatchResponse {
        success: true,
        newsletter_id: record.id.clone(),
        status: record.status,
        chunk_index,
        total_chunks: total_chunks(settings.recipients.len(), settings.chunk_size),
        has_more,
        next_chunk_delay_ms: if has_more || record.status == NewsletterStatus::Retrying {
            settings.chunk_delay_ms
        } else {
            0
        },
        chunk,
        total_recipients: settings.total_recipients,
        successful_sends: settings.successful_sends,
        failed_sends: settings.failed_sends,
        failed_emails: settings.failed_emails.clone(),
        invalid_emails,
    }
}

/// Drives a whole first pass in-process, sleeping `chunk_delay_ms` between chunks
///
/// For single-process deployments where no external scheduler issues the calls.
/// Returns the response of the last chunk.
pub async fn run_campaign(
    state: &AppState,
    dispatch: &Dispatch,
) -> Result<DispatchResponse, AppError> {
    loop {
        let outcome = send_next_chunk(state, dispatch).await?;
        if !outcome.has_more {
            return Ok(outcome);
        }
        tokio::time::sleep(Duration::from_millis(outcome.next_chunk_delay_ms)).await;
    }
}
