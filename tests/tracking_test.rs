//! Integration tests for engagement tracking
//!
//! Covers HTML rewriting, the open pixel, the click redirect and the retention
//! purge of analytics data.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use common::{addresses, create_campaign, dispatch_body, request, response_json, setup_test_app, TestApp, BASE_URL};
use newsletter::database::{
    get_analytics, get_newsletter, list_fingerprints, list_link_clicks, purge_analytics_before,
};
use newsletter::model::LinkType;
use newsletter::tracking::{
    add_tracking_to_newsletter, classify_link, decode_target, encode_target, link_hosts,
    resolve_target, TRANSPARENT_GIF,
};

/// Sends a one-recipient campaign and returns its pixel token and analytics id
async fn sent_campaign(t: &TestApp) -> (String, String) {
    let id = create_campaign(&t.app, &addresses(1), json!({})).await;
    let response = request(&t.app, "POST", "/newsletter/send", Some(dispatch_body(&id))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let record = get_newsletter(&t.state.db, &id).unwrap().unwrap();
    let analytics_id = record.analytics_id.unwrap();
    let analytics = get_analytics(&t.state.db, &analytics_id).unwrap().unwrap();
    (analytics.pixel_token, analytics_id)
}

fn get_with_client(uri: &str, user_agent: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("user-agent", user_agent)
        .header("accept-language", "de-DE,de;q=0.9")
        .header("accept-encoding", "gzip, br")
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

fn hrefs(html: &str) -> Vec<String> {
    html.split("href=\"")
        .skip(1)
        .map(|rest| rest[..rest.find('"').unwrap()].to_string())
        .collect()
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

#[test]
fn test_rewrites_only_trackable_links() {
    let html = r#"<html><body>
<a href="https://example.org/termine/42">Termin</a>
<a href="https://example.org/#report-7">Bericht</a>
<a href="https://example.org/impressum">Impressum</a>
</body></html>"#;

    let out = add_tracking_to_newsletter(html, "tok123", BASE_URL);
    let links = hrefs(&out);

    assert_eq!(links.len(), 3);
    assert!(links[0].starts_with("http://news.test/track/click/tok123?url="));
    assert_eq!(query_param(&links[0], "type").as_deref(), Some("appointment"));
    assert_eq!(query_param(&links[0], "id").as_deref(), Some("42"));

    assert_eq!(query_param(&links[1], "type").as_deref(), Some("statusreport"));
    assert_eq!(query_param(&links[1], "id").as_deref(), Some("7"));

    assert_eq!(links[2], "https://example.org/impressum");
}

#[test]
fn test_click_url_decodes_to_original() {
    let original = "https://example.org/termine/42";
    let out = add_tracking_to_newsletter(
        &format!(r#"<a href="{original}">x</a>"#),
        "tok",
        BASE_URL,
    );
    let link = &hrefs(&out)[0];
    let encoded = query_param(link, "url").unwrap();

    assert_eq!(decode_target(&encoded).as_deref(), Some(original));
}

#[test]
fn test_pixel_inserted_before_closing_body() {
    let out = add_tracking_to_newsletter("<html><body><p>Hi</p></BODY></html>", "tok", BASE_URL);
    let pixel = out.find("http://news.test/track/pixel/tok").unwrap();
    let close = out.find("</BODY>").unwrap();
    assert!(pixel < close);
    assert!(out.ends_with("</BODY></html>"));
}

#[test]
fn test_pixel_appended_without_body() {
    let out = add_tracking_to_newsletter("<p>Hi</p>", "tok", BASE_URL);
    assert!(out.starts_with("<p>Hi</p><img src=\"http://news.test/track/pixel/tok\""));
    assert!(out.ends_with("/>"));
}

#[test]
fn test_tracking_is_not_applied_twice() {
    let html = r#"<body><a href="/termine/9">x</a></body>"#;
    let once = add_tracking_to_newsletter(html, "tok", BASE_URL);
    let twice = add_tracking_to_newsletter(&once, "tok", BASE_URL);

    assert_eq!(once, twice);
    assert_eq!(twice.matches("/track/pixel/tok").count(), 1);
    assert_eq!(twice.matches("/track/click/").count(), 1);
}

#[test]
fn test_single_quoted_href_is_rewritten() {
    let out = add_tracking_to_newsletter("<a href='/termine/abc'>x</a>", "tok", BASE_URL);
    assert!(out.contains("href='http://news.test/track/click/tok?url="));
}

#[test]
fn test_classify_and_decode() {
    let link = classify_link("https://example.org/termine/2024-fest?ref=mail").unwrap();
    assert_eq!(link.link_type, LinkType::Appointment);
    assert_eq!(link.link_id.as_deref(), Some("2024-fest"));

    assert!(classify_link("https://example.org/gruppen/1").is_none());

    let encoded = encode_target("https://example.org/termine/1?a=b&c=d");
    assert!(!encoded.contains('='));
    assert_eq!(
        decode_target(&format!("{encoded}==")).as_deref(),
        Some("https://example.org/termine/1?a=b&c=d")
    );
    assert_eq!(decode_target("%%%"), None);
}

#[test]
fn test_link_hosts_and_resolution() {
    let html = r#"<a href="https://Example.org/termine/1">a</a>
<a href='https://reports.example.net/#report-2'>b</a>
<a href="https://elsewhere.example/impressum">c</a>
<a href="/termine/3">d</a>"#;

    let hosts: Vec<String> = link_hosts(html, BASE_URL).into_iter().collect();
    assert_eq!(hosts, vec!["example.org", "news.test", "reports.example.net"]);

    assert_eq!(
        resolve_target("#report-7", BASE_URL).unwrap().as_str(),
        "http://news.test/#report-7"
    );
    assert_eq!(
        resolve_target("//evil.example/termine/1", BASE_URL).unwrap().host_str(),
        Some("evil.example")
    );
    assert!(resolve_target("javascript:alert(1)", BASE_URL).is_none());
    assert!(resolve_target("mailto:a@example.org", BASE_URL).is_none());
}

#[tokio::test]
async fn test_pixel_hits_deduplicate_by_fingerprint() {
    let t = setup_test_app();
    let (token, analytics_id) = sent_campaign(&t).await;
    let uri = format!("/track/pixel/{token}");

    for _ in 0..5 {
        let response = t
            .app
            .clone()
            .oneshot(get_with_client(&uri, "Mail/1.0", "203.0.113.9"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let analytics = get_analytics(&t.state.db, &analytics_id).unwrap().unwrap();
    assert_eq!(analytics.total_opens, 5);
    assert_eq!(analytics.unique_opens, 1);

    let rows = list_fingerprints(&t.state.db, &analytics_id).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].open_count, 5);
    assert!(rows[0].first_open_at <= rows[0].last_open_at);

    // a different client counts as a new unique open
    t.app
        .clone()
        .oneshot(get_with_client(&uri, "Mail/1.0", "198.51.100.4"))
        .await
        .unwrap();
    let analytics = get_analytics(&t.state.db, &analytics_id).unwrap().unwrap();
    assert_eq!(analytics.total_opens, 6);
    assert_eq!(analytics.unique_opens, 2);
    assert_eq!(list_fingerprints(&t.state.db, &analytics_id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_pixel_served_for_unknown_token() {
    let t = setup_test_app();

    let response = request(&t.app, "GET", "/track/pixel/does-not-exist", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/gif");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], &TRANSPARENT_GIF[..]);
}

#[tokio::test]
async fn test_click_redirects_and_counts() {
    let t = setup_test_app();
    let (token, analytics_id) = sent_campaign(&t).await;
    let original = "https://example.org/termine/42";
    let uri = format!(
        "/track/click/{token}?url={}&type=appointment&id=42",
        encode_target(original)
    );

    for ip in ["203.0.113.9", "203.0.113.9", "198.51.100.4"] {
        let response = t
            .app
            .clone()
            .oneshot(get_with_client(&uri, "Mail/1.0", ip))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), original);
    }

    let links = list_link_clicks(&t.state.db, &analytics_id).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].url, original);
    assert_eq!(links[0].link_type, LinkType::Appointment);
    assert_eq!(links[0].link_id.as_deref(), Some("42"));
    assert_eq!(links[0].click_count, 3);
    assert_eq!(links[0].unique_clicks, 2);
}

#[tokio::test]
async fn test_click_with_unknown_token_goes_home() {
    let t = setup_test_app();
    let uri = format!(
        "/track/click/nope?url={}&type=appointment",
        encode_target("https://example.org/termine/1")
    );

    let response = request(&t.app, "GET", &uri, None).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers().get("location").unwrap(), BASE_URL);
}

#[tokio::test]
async fn test_click_with_bad_target_goes_home() {
    let t = setup_test_app();
    let (token, analytics_id) = sent_campaign(&t).await;

    for query in [
        "url=!!!not-base64&type=appointment".to_string(),
        String::new(),
        format!("url={}&type=appointment", encode_target("javascript:alert(1)")),
        format!("url={}", encode_target("https://evil.example/phish")),
    ] {
        let response = request(&t.app, "GET", &format!("/track/click/{token}?{query}"), None).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), BASE_URL);
    }

    assert!(list_link_clicks(&t.state.db, &analytics_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_click_to_foreign_host_goes_home() {
    let t = setup_test_app();
    let (token, analytics_id) = sent_campaign(&t).await;

    let analytics = get_analytics(&t.state.db, &analytics_id).unwrap().unwrap();
    assert!(analytics.link_hosts.contains("example.org"));

    for target in ["https://evil.example/termine/1", "//evil.example/termine/1"] {
        let uri = format!(
            "/track/click/{token}?url={}&type=appointment&id=1",
            encode_target(target)
        );
        let response = request(&t.app, "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), BASE_URL);
    }

    assert!(list_link_clicks(&t.state.db, &analytics_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_relative_link_resolves_against_base_url() {
    let t = setup_test_app();
    let (token, _) = sent_campaign(&t).await;
    let uri = format!("/track/click/{token}?url={}&type=appointment", encode_target("/termine/5"));

    let response = request(&t.app, "GET", &uri, None).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "http://news.test/termine/5"
    );
}

#[tokio::test]
async fn test_analytics_endpoint_reports_counters() {
    let t = setup_test_app();
    let id = create_campaign(&t.app, &addresses(2), json!({})).await;
    request(&t.app, "POST", "/newsletter/send", Some(dispatch_body(&id))).await;
    let record = get_newsletter(&t.state.db, &id).unwrap().unwrap();
    let analytics = get_analytics(&t.state.db, record.analytics_id.as_deref().unwrap())
        .unwrap()
        .unwrap();

    request(&t.app, "GET", &format!("/track/pixel/{}", analytics.pixel_token), None).await;

    let response = request(&t.app, "GET", &format!("/newsletter/{id}/analytics"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response.into_body()).await;
    assert_eq!(body["analytics"]["totalRecipients"], 2);
    assert_eq!(body["analytics"]["totalOpens"], 1);
    assert_eq!(body["analytics"]["uniqueOpens"], 1);
    assert_eq!(body["links"], json!([]));
}

#[tokio::test]
async fn test_sent_html_carries_tracking() {
    let t = setup_test_app();
    let (token, _) = sent_campaign(&t).await;

    let html = t.transport.last_html().unwrap();
    assert_eq!(html.matches(&format!("/track/pixel/{token}")).count(), 1);
    assert!(html.contains(&format!("/track/click/{token}?url=")));
    assert!(!html.contains("href=\"https://example.org/termine/42\""));
}

#[tokio::test]
async fn test_purge_removes_expired_analytics() {
    let t = setup_test_app();
    let (token, analytics_id) = sent_campaign(&t).await;
    request(&t.app, "GET", &format!("/track/pixel/{token}"), None).await;
    let uri = format!(
        "/track/click/{token}?url={}",
        encode_target("https://example.org/termine/42")
    );
    request(&t.app, "GET", &uri, None).await;

    // nothing is older than a day ago
    let purged = purge_analytics_before(&t.state.db, Utc::now() - Duration::days(1)).unwrap();
    assert_eq!(purged, 0);
    assert!(get_analytics(&t.state.db, &analytics_id).unwrap().is_some());

    let purged = purge_analytics_before(&t.state.db, Utc::now() + Duration::seconds(1)).unwrap();
    assert_eq!(purged, 1);
    assert!(get_analytics(&t.state.db, &analytics_id).unwrap().is_none());
    assert!(list_fingerprints(&t.state.db, &analytics_id).unwrap().is_empty());
    assert!(list_link_clicks(&t.state.db, &analytics_id).unwrap().is_empty());

    // the token no longer resolves, the pixel is still served
    let response = request(&t.app, "GET", &format!("/track/pixel/{token}"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
}
