//! Data models for the newsletter dispatch service
//!
//! This module defines the persisted campaign and analytics records as well as the
//! request/response payloads of the HTTP API. JSON field names are camelCase so the
//! campaign settings blob keeps the shape operators already rely on.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a campaign
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NewsletterStatus {
    Draft,
    Sending,
    Retrying,
    Sent,
    Failed,
}

/// A newsletter campaign stored in the database
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewsletterRecord {
    /// Unique identifier of the campaign
    pub id: String,

    pub status: NewsletterStatus,

    /// Sending configuration and durable progress of the campaign
    pub settings: SendingSettings,

    /// Analytics record created at first dispatch
    #[serde(default)]
    pub analytics_id: Option<String>,

    /// Optimistic concurrency token, bumped on every persisted write
    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sender identity, pacing and cumulative progress of one campaign
///
/// `recipients`, `next_chunk` and `failed_emails` together form the durable cursor:
/// a process killed between two chunks resumes from exactly these fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendingSettings {
    pub from_email: String,
    pub from_name: String,
    pub reply_to_email: String,
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
    pub email_timeout_ms: u64,
    pub recipient_lists: BTreeSet<String>,

    #[serde(default)]
    pub total_recipients: usize,
    #[serde(default)]
    pub successful_sends: usize,
    #[serde(default)]
    pub failed_sends: usize,

    /// Processed recipients without a successful outcome, in processing order
    #[serde(default)]
    pub failed_emails: Vec<String>,

    #[serde(default)]
    pub chunk_results: Vec<ChunkSummary>,

    #[serde(default)]
    pub retry_in_progress: bool,

    #[serde(default)]
    pub sending_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sending_completed_at: Option<DateTime<Utc>>,

    /// Deduplicated send list, snapshotted at first dispatch
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Index of the next unsent chunk of the first pass
    #[serde(default)]
    pub next_chunk: usize,

    /// Addresses excluded because they failed validation
    #[serde(default)]
    pub invalid_emails: Vec<String>,

    #[serde(default)]
    pub duplicates_removed: usize,

    #[serde(default)]
    pub retry_attempts: u32,

    /// `0` disables the limit
    #[serde(default)]
    pub max_retry_attempts: u32,

    /// Set while a pass is executing; cleared when its result is merged
    #[serde(default)]
    pub in_flight_since: Option<DateTime<Utc>>,

    /// Latest time the holding pass can still be running. Sized from the slice it
    /// sends, so a slow but healthy pass is never mistaken for an abandoned one.
    #[serde(default)]
    pub in_flight_until: Option<DateTime<Utc>>,
}

/// Whether a chunk belonged to the first pass or to a retry pass
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PassKind {
    Initial,
    Retry,
}

/// Persisted outcome of one chunk
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummary {
    pub chunk_index: usize,
    pub kind: PassKind,
    pub sent_count: usize,
    pub failed_count: usize,
    pub completed_at: DateTime<Utc>,
    /// Recipients that failed in this chunk
    #[serde(default)]
    pub failed_emails: Vec<String>,
}

/// Outcome of a single recipient within a chunk
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecipientResult {
    pub email: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// In-memory result of one chunk, returned to the caller
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub sent_count: usize,
    pub failed_count: usize,
    pub completed_at: DateTime<Utc>,
    pub results: Vec<RecipientResult>,
}

impl ChunkResult {
    /// Addresses that succeeded, in processing order
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.email.as_str())
    }

    /// Addresses that failed, in processing order
    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.email.as_str())
    }

    pub fn summarize(&self, chunk_index: usize, kind: PassKind) -> ChunkSummary {
        ChunkSummary {
            chunk_index,
            kind,
            sent_count: self.sent_count,
            failed_count: self.failed_count,
            completed_at: self.completed_at,
            failed_emails: self.failed().map(str::to_string).collect(),
        }
    }
}

/// Engagement counters of one sent campaign
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
    pub id: String,
    pub newsletter_id: String,
    /// Opaque token embedded in pixel and click URLs
    pub pixel_token: String,
    pub total_recipients: usize,
    /// Every pixel hit
    pub total_opens: u64,
    /// Distinct fingerprints that ever opened
    pub unique_opens: u64,
    /// Hosts of the links rewritten for this campaign; click redirects are
    /// limited to these and the service's own host
    #[serde(default)]
    pub link_hosts: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

/// One distinct client that opened a campaign
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintRecord {
    pub analytics_id: String,
    pub fingerprint: String,
    pub open_count: u64,
    pub first_open_at: DateTime<Utc>,
    pub last_open_at: DateTime<Utc>,
}

/// Kind of content a tracked link points at
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Appointment,
    #[serde(rename = "statusreport")]
    StatusReport,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkType::Appointment => "appointment",
            LinkType::StatusReport => "statusreport",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "appointment" => Some(LinkType::Appointment),
            "statusreport" => Some(LinkType::StatusReport),
            _ => None,
        }
    }
}

/// Click counters of one tracked URL within a campaign
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkClickRecord {
    pub analytics_id: String,
    pub url: String,
    pub link_type: LinkType,
    pub link_id: Option<String>,
    pub click_count: u64,
    pub unique_clicks: u64,
    pub first_click: DateTime<Utc>,
    pub last_click: DateTime<Utc>,
}

/// Body of `POST /newsletter/send` and `POST /newsletter/retry-chunk`
///
/// Fields are optional so that a missing field can be reported as a validation
/// error rather than a deserialization failure.
///
/// # Example
/// ```json
/// {
///   "newsletterId": "k3Jd92LmQx0a",
///   "html": "<html><body>...</body></html>",
///   "subject": "Newsletter March"
/// }
/// ```
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub newsletter_id: Option<String>,
    pub html: Option<String>,
    pub subject: Option<String>,
}

/// Validated form of [`DispatchRequest`]
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub newsletter_id: String,
    pub html: String,
    pub subject: String,
}

impl DispatchRequest {
    /// Returns `None` when any field is absent or blank
    pub fn into_dispatch(self) -> Option<Dispatch> {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Some(Dispatch {
            newsletter_id: present(self.newsletter_id)?,
            html: present(self.html)?,
            subject: present(self.subject)?,
        })
    }
}

/// Response of a send or retry pass
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub success: bool,
    pub newsletter_id: String,
    pub status: NewsletterStatus,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// More chunks of the first pass remain
    pub has_more: bool,
    /// How long the caller should wait before the next call
    pub next_chunk_delay_ms: u64,
    pub chunk: ChunkResult,
    pub total_recipients: usize,
    pub successful_sends: usize,
    pub failed_sends: usize,
    pub failed_emails: Vec<String>,
    /// Addresses excluded by validation, reported on the first chunk only
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_emails: Vec<String>,
}

/// Request payload for creating a draft campaign
///
/// Every field except `recipientLists` falls back to the service configuration.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateNewsletterRequest {
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub reply_to_email: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_delay_ms: Option<u64>,
    pub email_timeout_ms: Option<u64>,
    pub max_retry_attempts: Option<u32>,
    #[serde(default)]
    pub recipient_lists: BTreeSet<String>,
}

/// Request payload for storing a recipient list
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RecipientListRequest {
    pub emails: Vec<String>,
}

/// Query parameters of the click redirect
///
/// Query string: `?url=aHR0cHM6Ly9...&type=appointment&id=42`
#[derive(Deserialize, Debug, Default)]
pub struct ClickParams {
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub link_type: Option<String>,
    pub id: Option<String>,
}
