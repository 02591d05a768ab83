//! HTTP request handlers
//!
//! Operator endpoints create campaigns, store recipient lists and drive the sending
//! state machine one chunk per request. The tracking endpoints are public and never
//! reveal whether a token is valid: the pixel is always served and a click always
//! ends in a redirect.

use std::collections::BTreeSet;

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::database::{self, AppState, ClickEvent};
use crate::error::AppError;
use crate::fingerprint::fingerprint;
use crate::model::{
    ClickParams, CreateNewsletterRequest, Dispatch, DispatchRequest, LinkType,
    RecipientListRequest,
};
use crate::sending;
use crate::tracking::{classify_link, decode_target, resolve_target, TRANSPARENT_GIF};

/// Turns the raw JSON body into a validated dispatch
///
/// An unreadable body is an unexpected failure (500); a readable body missing
/// `newsletterId`, `html` or `subject` is a client error (400).
fn parse_dispatch(
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<Dispatch, AppError> {
    let Json(request) =
        payload.map_err(|rejection| AppError::MalformedBody(rejection.body_text()))?;
    request.into_dispatch().ok_or(AppError::MissingFields)
}

/// Creates a draft campaign
///
/// # Response
///
/// - **201 Created** - the stored campaign
/// - **400 Bad Request** - invalid settings
pub async fn create_newsletter(
    State(state): State<AppState>,
    Json(payload): Json<CreateNewsletterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let record = sending::new_draft(&state.config, payload)?;
    database::insert_newsletter(&state.db, &record)?;
    debug!(newsletter_id = %record.id, "draft created");
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn get_newsletter(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let record = database::get_newsletter(&state.db, &id)?
        .ok_or_else(|| AppError::NotFound(format!("Newsletter {id} not found")))?;
    Ok(Json(record))
}

/// Engagement summary of a campaign: counters plus one row per tracked link
pub async fn get_newsletter_analytics(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let record = database::get_newsletter(&state.db, &id)?
        .ok_or_else(|| AppError::NotFound(format!("Newsletter {id} not found")))?;
    let analytics_id = record
        .analytics_id
        .ok_or_else(|| AppError::NotFound("Newsletter has not been sent yet".into()))?;
    let analytics = database::get_analytics(&state.db, &analytics_id)?
        .ok_or_else(|| AppError::NotFound(format!("Analytics {analytics_id} not found")))?;
    let links = database::list_link_clicks(&state.db, &analytics_id)?;

    Ok(Json(json!({
        "analytics": analytics,
        "links": links,
    })))
}

/// Stores (or replaces) a recipient list
///
/// Addresses are kept raw; cleaning and validation happen when a campaign using the
/// list is first dispatched.
pub async fn put_recipient_list(
    Path(list_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<RecipientListRequest>,
) -> Result<impl IntoResponse, AppError> {
    database::put_recipient_list(&state.db, &list_id, &payload.emails)?;
    Ok(Json(json!({
        "listId": list_id,
        "count": payload.emails.len(),
    })))
}

/// Sends the next chunk of a campaign
///
/// # Request Body
///
/// ```json
/// { "newsletterId": "k3Jd92LmQx0a", "html": "<html>...</html>", "subject": "March" }
/// ```
///
/// # Response
///
/// - **200 OK** - chunk outcome and updated campaign progress
/// - **400 Bad Request** - missing fields or campaign not in a sendable state
/// - **404 Not Found** - unknown campaign
/// - **409 Conflict** - another pass is in flight
/// - **500 Internal Server Error** - malformed body or persistence failure
pub async fn send_newsletter(
    State(state): State<AppState>,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let dispatch = parse_dispatch(payload)?;
    let outcome = sending::send_next_chunk(&state, &dispatch).await?;
    Ok(Json(outcome))
}

/// Retries the recipients of a campaign that have not succeeded yet
///
/// Same body and status codes as [`send_newsletter`]. Requires a retry to be in
/// progress and at least one failed recipient.
pub async fn retry_chunk(
    State(state): State<AppState>,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let dispatch = parse_dispatch(payload)?;
    let outcome = sending::retry_failed_chunk(&state, &dispatch).await?;
    Ok(Json(outcome))
}

/// Serves the open pixel and records the open
///
/// Always answers 200 with a transparent GIF, whatever the token.
pub async fn track_pixel(
    Path(token): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let fp = fingerprint(&headers);
    match database::record_open(&state.db, &token, &fp, Utc::now()) {
        Ok(Some(outcome)) => debug!(
            first_open = outcome.first_open,
            total_opens = outcome.total_opens,
            "open recorded"
        ),
        Ok(None) => debug!("pixel hit for unknown token"),
        Err(err) => warn!(error = %err, "failed to record open"),
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, private"),
        ],
        Body::from(TRANSPARENT_GIF.to_vec()),
    )
        .into_response()
}

/// Records a click and redirects to the original link
///
/// Unknown tokens, undecodable targets, links that are not trackable and hosts
/// the campaign never linked to all redirect to the application home instead.
pub async fn track_click(
    Path(token): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ClickParams>, QueryRejection>,
) -> Response {
    let home = state.config.base_url.as_str();
    let params = params.map(|Query(p)| p).unwrap_or_default();

    let Some(target) = params
        .url
        .as_deref()
        .and_then(decode_target)
        .and_then(|url| resolve_target(&url, home))
    else {
        debug!("click with undecodable target");
        return found(home);
    };

    let Some(link) = classify_link(target.as_str()) else {
        debug!("click target is not a tracked link");
        return found(home);
    };

    let analytics = match database::analytics_for_token(&state.db, &token) {
        Ok(Some(analytics)) => analytics,
        Ok(None) => {
            debug!("click for unknown token");
            return found(home);
        }
        Err(err) => {
            warn!(error = %err, "failed to resolve click token");
            return found(home);
        }
    };
    if !host_allowed(&target, home, &analytics.link_hosts) {
        warn!(host = ?target.host_str(), "click target outside campaign hosts");
        return found(home);
    }

    // the query may name the type explicitly; the URL itself is the fallback
    let link_type = params
        .link_type
        .as_deref()
        .and_then(LinkType::parse)
        .unwrap_or(link.link_type);
    let link_id = params.id.as_deref().or(link.link_id.as_deref());

    let fp = fingerprint(&headers);
    let click = ClickEvent {
        url: target.as_str(),
        link_type,
        link_id,
        fingerprint: &fp,
        at: Utc::now(),
    };

    match database::record_click(&state.db, &token, &click) {
        Ok(Some(outcome)) => debug!(
            link_type = link_type.as_str(),
            clicks = outcome.click_count,
            unique = outcome.unique_clicks,
            "click recorded"
        ),
        Ok(None) => debug!("click token purged before recording"),
        Err(err) => warn!(error = %err, "failed to record click"),
    }
    found(target.as_str())
}

/// The service's own host is always allowed
fn host_allowed(target: &Url, home: &str, campaign_hosts: &BTreeSet<String>) -> bool {
    let Some(host) = target.host_str() else {
        return false;
    };
    campaign_hosts.contains(host) || Url::parse(home).is_ok_and(|h| h.host_str() == Some(host))
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}
