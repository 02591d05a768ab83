//! Database initialization, table definitions and transactional helpers
//!
//! This module handles the setup of the embedded redb database and every read or
//! write the service performs. Values are JSON-serialized records keyed by string.
//!
//! redb allows a single write transaction at a time, so each helper that reads and
//! then writes inside one transaction is atomic with respect to every other writer.
//! Campaign updates additionally carry a version check so that a caller holding a
//! stale copy cannot overwrite newer progress.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{distr::Alphanumeric, Rng};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::Config;
use crate::error::StoreError;
use crate::model::{
    AnalyticsRecord, FingerprintRecord, LinkClickRecord, LinkType, NewsletterRecord,
};
use crate::transport::EmailTransport;

/// Campaign records
///
/// Key: newsletter id
/// Value: JSON-serialized NewsletterRecord
pub const TABLE_NEWSLETTERS: TableDefinition<&str, &str> = TableDefinition::new("newsletters_v1");

/// Raw recipient lists, resolved into a send list at first dispatch
///
/// Key: list id
/// Value: JSON array of addresses
pub const TABLE_RECIPIENT_LISTS: TableDefinition<&str, &str> =
    TableDefinition::new("recipient_lists_v1");

/// Analytics records
///
/// Key: analytics id
/// Value: JSON-serialized AnalyticsRecord
pub const TABLE_ANALYTICS: TableDefinition<&str, &str> = TableDefinition::new("analytics_v1");

/// Pixel token index
///
/// Key: pixel token
/// Value: analytics id
pub const TABLE_PIXEL_TOKENS: TableDefinition<&str, &str> = TableDefinition::new("pixel_tokens_v1");

/// One row per analytics record and distinct opener
///
/// Key: "{analytics_id}:{fingerprint}"
/// Value: JSON-serialized FingerprintRecord
pub const TABLE_OPEN_FINGERPRINTS: TableDefinition<&str, &str> =
    TableDefinition::new("open_fingerprints_v1");

/// One row per analytics record and tracked URL
///
/// Key: "{analytics_id}:{url}"
/// Value: JSON-serialized LinkClickRecord
pub const TABLE_LINK_CLICKS: TableDefinition<&str, &str> = TableDefinition::new("link_clicks_v1");

/// Dedup set for unique clicks
///
/// Key: "{analytics_id}:{fingerprint}:{url}"
/// Value: RFC 3339 timestamp of the first click
pub const TABLE_CLICK_FINGERPRINTS: TableDefinition<&str, &str> =
    TableDefinition::new("click_fingerprints_v1");

/// Application state shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    /// Thread-safe reference to the embedded database
    pub db: Arc<Database>,

    /// Mail provider used by the chunk executor
    pub transport: Arc<dyn EmailTransport>,

    pub config: Arc<Config>,
}

/// Initializes the embedded database and creates required tables
///
/// # Example
///
/// ```no_run
/// # use newsletter::database::init_db;
/// let db = init_db("data.db").expect("Failed to initialize database");
/// ```
pub fn init_db(db_path: &str) -> Result<Database, StoreError> {
    let db = Database::create(db_path)?;

    let write_txn = db.begin_write()?;
    {
        write_txn.open_table(TABLE_NEWSLETTERS)?;
        write_txn.open_table(TABLE_RECIPIENT_LISTS)?;
        write_txn.open_table(TABLE_ANALYTICS)?;
        write_txn.open_table(TABLE_PIXEL_TOKENS)?;
        write_txn.open_table(TABLE_OPEN_FINGERPRINTS)?;
        write_txn.open_table(TABLE_LINK_CLICKS)?;
        write_txn.open_table(TABLE_CLICK_FINGERPRINTS)?;
    }
    write_txn.commit()?;

    Ok(db)
}

/// Random alphanumeric identifier
pub fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn read_json<T, R>(table: &R, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static str>,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

fn write_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static str>,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_string(value)?;
    table.insert(key, json.as_str())?;
    Ok(())
}

/// Exclusive upper bound for keys starting with `"{prefix}:"`.
/// `';'` is the character right after `':'`.
fn prefix_range(prefix: &str) -> (String, String) {
    (format!("{prefix}:"), format!("{prefix};"))
}

// ---------------------------------------------------------------------------
// Newsletters
// ---------------------------------------------------------------------------

pub fn get_newsletter(db: &Database, id: &str) -> Result<Option<NewsletterRecord>, StoreError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(TABLE_NEWSLETTERS)?;
    read_json(&table, id)
}

/// Inserts a new campaign, failing if the id is taken
pub fn insert_newsletter(db: &Database, record: &NewsletterRecord) -> Result<(), StoreError> {
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(TABLE_NEWSLETTERS)?;
        if table.get(record.id.as_str())?.is_some() {
            return Err(StoreError::VersionConflict {
                id: record.id.clone(),
                expected: 0,
                found: record.version,
            });
        }
        write_json(&mut table, &record.id, record)?;
    }
    write_txn.commit()?;
    Ok(())
}

fn check_and_write_newsletter(
    txn: &WriteTransaction,
    record: &NewsletterRecord,
    expected_version: u64,
) -> Result<NewsletterRecord, StoreError> {
    let mut table = txn.open_table(TABLE_NEWSLETTERS)?;
    let current: NewsletterRecord = read_json(&table, &record.id)?
        .ok_or_else(|| StoreError::Missing(record.id.clone()))?;

    if current.version != expected_version {
        return Err(StoreError::VersionConflict {
            id: record.id.clone(),
            expected: expected_version,
            found: current.version,
        });
    }

    let mut next = record.clone();
    next.version = expected_version + 1;
    next.updated_at = Utc::now();
    write_json(&mut table, &next.id, &next)?;
    Ok(next)
}

/// Compare-and-swap update of a campaign
///
/// The write succeeds only if the stored version still equals `expected_version`.
/// Returns the record as persisted, with its version bumped.
pub fn update_newsletter(
    db: &Database,
    record: &NewsletterRecord,
    expected_version: u64,
) -> Result<NewsletterRecord, StoreError> {
    let write_txn = db.begin_write()?;
    let saved = check_and_write_newsletter(&write_txn, record, expected_version)?;
    write_txn.commit()?;
    Ok(saved)
}

/// Same as [`update_newsletter`] and creates the analytics record in the same
/// transaction, so a campaign never starts without one.
pub fn start_newsletter(
    db: &Database,
    record: &NewsletterRecord,
    expected_version: u64,
    analytics: &AnalyticsRecord,
) -> Result<NewsletterRecord, StoreError> {
    let write_txn = db.begin_write()?;
    let saved = check_and_write_newsletter(&write_txn, record, expected_version)?;
    {
        let mut table = write_txn.open_table(TABLE_ANALYTICS)?;
        write_json(&mut table, &analytics.id, analytics)?;
        let mut tokens = write_txn.open_table(TABLE_PIXEL_TOKENS)?;
        tokens.insert(analytics.pixel_token.as_str(), analytics.id.as_str())?;
    }
    write_txn.commit()?;
    Ok(saved)
}

// ---------------------------------------------------------------------------
// Recipient lists
// ---------------------------------------------------------------------------

pub fn put_recipient_list(db: &Database, list_id: &str, emails: &[String]) -> Result<(), StoreError> {
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(TABLE_RECIPIENT_LISTS)?;
        write_json(&mut table, list_id, &emails)?;
    }
    write_txn.commit()?;
    Ok(())
}

/// Concatenates the given lists in order. Unknown list ids contribute nothing.
pub fn load_recipients<'a, I>(db: &Database, list_ids: I) -> Result<Vec<String>, StoreError>
where
    I: IntoIterator<Item = &'a String>,
{
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(TABLE_RECIPIENT_LISTS)?;

    let mut all = Vec::new();
    for list_id in list_ids {
        match read_json::<Vec<String>, _>(&table, list_id)? {
            Some(emails) => all.extend(emails),
            None => tracing::warn!(list_id = %list_id, "recipient list not found"),
        }
    }
    Ok(all)
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

pub fn get_analytics(db: &Database, analytics_id: &str) -> Result<Option<AnalyticsRecord>, StoreError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(TABLE_ANALYTICS)?;
    read_json(&table, analytics_id)
}

/// Resolves a pixel token to its analytics record
pub fn analytics_for_token(
    db: &Database,
    pixel_token: &str,
) -> Result<Option<AnalyticsRecord>, StoreError> {
    let read_txn = db.begin_read()?;
    let tokens = read_txn.open_table(TABLE_PIXEL_TOKENS)?;
    let Some(analytics_id) = tokens.get(pixel_token)?.map(|guard| guard.value().to_string())
    else {
        return Ok(None);
    };
    let table = read_txn.open_table(TABLE_ANALYTICS)?;
    read_json(&table, &analytics_id)
}

/// Adds hosts to the click redirect allowlist of an analytics record
pub fn add_link_hosts(
    db: &Database,
    analytics_id: &str,
    hosts: &BTreeSet<String>,
) -> Result<(), StoreError> {
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(TABLE_ANALYTICS)?;
        let mut analytics: AnalyticsRecord = read_json(&table, analytics_id)?
            .ok_or_else(|| StoreError::Missing(analytics_id.to_string()))?;
        if hosts.is_subset(&analytics.link_hosts) {
            return Ok(());
        }
        analytics.link_hosts.extend(hosts.iter().cloned());
        write_json(&mut table, analytics_id, &analytics)?;
    }
    write_txn.commit()?;
    Ok(())
}

/// All link click rows of one analytics record
pub fn list_link_clicks(db: &Database, analytics_id: &str) -> Result<Vec<LinkClickRecord>, StoreError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(TABLE_LINK_CLICKS)?;
    let (start, end) = prefix_range(analytics_id);

    let mut rows = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let (_, value) = entry?;
        rows.push(serde_json::from_str(value.value())?);
    }
    Ok(rows)
}

/// All opener rows of one analytics record
pub fn list_fingerprints(
    db: &Database,
    analytics_id: &str,
) -> Result<Vec<FingerprintRecord>, StoreError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(TABLE_OPEN_FINGERPRINTS)?;
    let (start, end) = prefix_range(analytics_id);

    let mut rows = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let (_, value) = entry?;
        rows.push(serde_json::from_str(value.value())?);
    }
    Ok(rows)
}

/// Counters after a recorded open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOutcome {
    pub first_open: bool,
    pub total_opens: u64,
    pub unique_opens: u64,
}

/// Records a pixel hit
///
/// Insert-or-increment of the fingerprint row and the analytics counters happen in
/// one write transaction. Returns `None` for an unknown token.
pub fn record_open(
    db: &Database,
    pixel_token: &str,
    fingerprint: &str,
    at: DateTime<Utc>,
) -> Result<Option<OpenOutcome>, StoreError> {
    let write_txn = db.begin_write()?;
    let outcome = {
        let tokens = write_txn.open_table(TABLE_PIXEL_TOKENS)?;
        let analytics_id = match tokens.get(pixel_token)? {
            Some(guard) => guard.value().to_string(),
            None => return Ok(None),
        };

        let mut analytics_table = write_txn.open_table(TABLE_ANALYTICS)?;
        let Some(mut analytics) = read_json::<AnalyticsRecord, _>(&analytics_table, &analytics_id)?
        else {
            return Ok(None);
        };

        let mut fingerprints = write_txn.open_table(TABLE_OPEN_FINGERPRINTS)?;
        let key = format!("{analytics_id}:{fingerprint}");
        let first_open = match read_json::<FingerprintRecord, _>(&fingerprints, &key)? {
            Some(mut row) => {
                row.open_count += 1;
                row.last_open_at = at;
                write_json(&mut fingerprints, &key, &row)?;
                false
            }
            None => {
                let row = FingerprintRecord {
                    analytics_id: analytics_id.clone(),
                    fingerprint: fingerprint.to_string(),
                    open_count: 1,
                    first_open_at: at,
                    last_open_at: at,
                };
                write_json(&mut fingerprints, &key, &row)?;
                true
            }
        };

        analytics.total_opens += 1;
        if first_open {
            analytics.unique_opens += 1;
        }
        write_json(&mut analytics_table, &analytics_id, &analytics)?;

        OpenOutcome {
            first_open,
            total_opens: analytics.total_opens,
            unique_opens: analytics.unique_opens,
        }
    };
    write_txn.commit()?;
    Ok(Some(outcome))
}

/// A click to record against a campaign
#[derive(Debug, Clone)]
pub struct ClickEvent<'a> {
    pub url: &'a str,
    pub link_type: LinkType,
    pub link_id: Option<&'a str>,
    pub fingerprint: &'a str,
    pub at: DateTime<Utc>,
}

/// Counters after a recorded click
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickOutcome {
    pub first_click_by_client: bool,
    pub click_count: u64,
    pub unique_clicks: u64,
}

/// Records a tracked link click
///
/// Upserts the link row and the fingerprint-link dedup row in one write
/// transaction. Returns `None` for an unknown token.
pub fn record_click(
    db: &Database,
    pixel_token: &str,
    click: &ClickEvent<'_>,
) -> Result<Option<ClickOutcome>, StoreError> {
    let write_txn = db.begin_write()?;
    let outcome = {
        let tokens = write_txn.open_table(TABLE_PIXEL_TOKENS)?;
        let analytics_id = match tokens.get(pixel_token)? {
            Some(guard) => guard.value().to_string(),
            None => return Ok(None),
        };

        let mut dedup = write_txn.open_table(TABLE_CLICK_FINGERPRINTS)?;
        let dedup_key = format!("{analytics_id}:{}:{}", click.fingerprint, click.url);
        let first_click_by_client = dedup.get(dedup_key.as_str())?.is_none();
        if first_click_by_client {
            let stamp = click.at.to_rfc3339();
            dedup.insert(dedup_key.as_str(), stamp.as_str())?;
        }

        let mut links = write_txn.open_table(TABLE_LINK_CLICKS)?;
        let link_key = format!("{analytics_id}:{}", click.url);
        let mut row = read_json::<LinkClickRecord, _>(&links, &link_key)?.unwrap_or_else(|| {
            LinkClickRecord {
                analytics_id: analytics_id.clone(),
                url: click.url.to_string(),
                link_type: click.link_type,
                link_id: click.link_id.map(str::to_string),
                click_count: 0,
                unique_clicks: 0,
                first_click: click.at,
                last_click: click.at,
            }
        });
        row.click_count += 1;
        if first_click_by_client {
            row.unique_clicks += 1;
        }
        row.last_click = click.at;
        write_json(&mut links, &link_key, &row)?;

        ClickOutcome {
            first_click_by_client,
            click_count: row.click_count,
            unique_clicks: row.unique_clicks,
        }
    };
    write_txn.commit()?;
    Ok(Some(outcome))
}

/// Deletes analytics created before `cutoff` with every row that belongs to them
///
/// Returns the number of analytics records removed.
pub fn purge_analytics_before(db: &Database, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
    let write_txn = db.begin_write()?;
    let purged = {
        let mut analytics_table = write_txn.open_table(TABLE_ANALYTICS)?;
        let mut expired: Vec<AnalyticsRecord> = Vec::new();
        for entry in analytics_table.iter()? {
            let (_, value) = entry?;
            let record: AnalyticsRecord = serde_json::from_str(value.value())?;
            if record.created_at < cutoff {
                expired.push(record);
            }
        }

        let mut tokens = write_txn.open_table(TABLE_PIXEL_TOKENS)?;
        let mut fingerprints = write_txn.open_table(TABLE_OPEN_FINGERPRINTS)?;
        let mut links = write_txn.open_table(TABLE_LINK_CLICKS)?;
        let mut dedup = write_txn.open_table(TABLE_CLICK_FINGERPRINTS)?;

        for record in &expired {
            analytics_table.remove(record.id.as_str())?;
            tokens.remove(record.pixel_token.as_str())?;
            remove_prefix(&mut fingerprints, &record.id)?;
            remove_prefix(&mut links, &record.id)?;
            remove_prefix(&mut dedup, &record.id)?;
        }
        expired.len()
    };
    write_txn.commit()?;
    Ok(purged)
}

fn remove_prefix(
    table: &mut Table<'_, &'static str, &'static str>,
    prefix: &str,
) -> Result<(), StoreError> {
    let (start, end) = prefix_range(prefix);
    let mut keys = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let (key, _) = entry?;
        keys.push(key.value().to_string());
    }
    for key in keys {
        table.remove(key.as_str())?;
    }
    Ok(())
}
