//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tower::ServiceExt;

use newsletter::config::Config;
use newsletter::database::{init_db, AppState};
use newsletter::error::TransportError;
use newsletter::route::create_app;
use newsletter::transport::{EmailTransport, OutboundEmail};

pub const BASE_URL: &str = "http://news.test";

/// Transport that fails for a configurable set of addresses and remembers every
/// attempt in order
#[derive(Default)]
pub struct ScriptedTransport {
    failing: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    last_html: Mutex<Option<String>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    /// Transport whose every call hangs for `delay`
    pub fn hanging(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail(&self, emails: &[&str]) {
        let mut failing = self.failing.lock().unwrap();
        failing.clear();
        failing.extend(emails.iter().map(|e| e.to_string()));
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    /// HTML body of the most recent attempt
    pub fn last_html(&self) -> Option<String> {
        self.last_html.lock().unwrap().clone()
    }

    pub fn reset_attempts(&self) {
        self.attempts.lock().unwrap().clear();
    }
}

#[async_trait]
impl EmailTransport for ScriptedTransport {
    async fn send_email(&self, email: &OutboundEmail) -> Result<(), TransportError> {
        self.attempts.lock().unwrap().push(email.to.clone());
        *self.last_html.lock().unwrap() = Some(email.html.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&email.to) {
            return Err(TransportError::Rejected(format!("mailbox {} unavailable", email.to)));
        }
        Ok(())
    }
}

pub fn test_config() -> Config {
    Config {
        base_url: BASE_URL.to_string(),
        chunk_delay_ms: 0,
        email_timeout_ms: 1_000,
        ..Config::default()
    }
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub transport: Arc<ScriptedTransport>,
    _db_file: NamedTempFile,
}

pub fn setup_test_app() -> TestApp {
    setup_with(test_config(), ScriptedTransport::default())
}

/// Creates a test application with a temporary database
pub fn setup_with(config: Config, transport: ScriptedTransport) -> TestApp {
    let temp_db = NamedTempFile::new().expect("Failed to create temp file");
    let db = init_db(temp_db.path().to_str().unwrap()).expect("Failed to initialize test database");

    let transport = Arc::new(transport);
    let state = AppState {
        db: Arc::new(db),
        transport: transport.clone(),
        config: Arc::new(config),
    };

    TestApp {
        app: create_app(state.clone()),
        state,
        transport,
        _db_file: temp_db,
    }
}

/// Helper function to parse response body as JSON
pub async fn response_json(body: Body) -> Value {
    let bytes = body
        .collect()
        .await
        .expect("Failed to read response body")
        .to_bytes();

    serde_json::from_slice(&bytes).expect("Failed to parse JSON")
}

pub async fn request(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

/// Posts a raw, possibly invalid, JSON body
pub async fn raw_post(app: &Router, uri: &str, body: &str) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

/// Stores a recipient list and creates a draft campaign using it
pub async fn create_campaign(app: &Router, emails: &[String], settings: Value) -> String {
    let response = request(app, "PUT", "/lists/members", Some(json!({ "emails": emails }))).await;
    assert_eq!(response.status(), 200);

    let mut body = settings;
    body["recipientLists"] = json!(["members"]);
    let response = request(app, "POST", "/newsletter", Some(body)).await;
    assert_eq!(response.status(), 201);

    let created = response_json(response.into_body()).await;
    assert_eq!(created["status"], "draft");
    created["id"].as_str().unwrap().to_string()
}

pub fn dispatch_body(id: &str) -> Value {
    json!({
        "newsletterId": id,
        "html": "<html><body><p>Hello</p><a href=\"https://example.org/termine/42\">Termin</a></body></html>",
        "subject": "Monthly update"
    })
}

pub fn addresses(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("user{i}@example.org")).collect()
}
