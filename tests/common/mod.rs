//! Shared fixtures: an in-process fake of the OAuth2 token endpoint and the
//! QuickBooks query API, plus config and credential builders.

#![allow(dead_code)]

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use qbo_sync::config::Config;
use qbo_sync::credentials::StaticCredentialStore;
use qbo_sync::progress::{SyncProgressEvent, SyncProgressReporter};

pub const CLIENT_ID: &str = "client-abc";
pub const CLIENT_SECRET: &str = "secret-xyz";
pub const REFRESH_TOKEN: &str = "rt-initial";
pub const REALM_ID: &str = "4620816365";
pub const ACCESS_TOKEN: &str = "at-fake";

#[derive(Default)]
pub struct FakeState {
    /// JSON text of the records served per entity type (`FROM <type>`).
    pub records: HashMap<String, Vec<String>>,
    /// Every query body received, in order.
    pub queries: Vec<String>,
    /// Refresh tokens presented to the token endpoint, in order.
    pub refresh_tokens_seen: Vec<String>,
    /// Authorization headers presented to the token endpoint.
    pub token_auth_headers: Vec<String>,
    /// Answer this many query requests with 429 before serving data.
    pub rate_limit_remaining: u32,
    /// Non-200 status for the token endpoint.
    pub token_status: Option<u16>,
    /// Refresh token returned by the token endpoint instead of echoing the input.
    pub rotate_to: Option<String>,
    /// Fail every query with this status.
    pub query_status: Option<u16>,
}

pub type Shared = Arc<Mutex<FakeState>>;

pub struct FakeQbo {
    pub base_url: String,
    pub state: Shared,
}

impl FakeQbo {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(FakeState::default()));
        let app = Router::new()
            .route("/oauth2/v1/tokens/bearer", post(token_handler))
            .route("/v3/company/{realm}/query", post(query_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v1/tokens/bearer", self.base_url)
    }

    pub fn set_records(&self, type_name: &str, records: Vec<Value>) {
        self.set_record_texts(type_name, records.iter().map(Value::to_string).collect());
    }

    /// Serve these exact JSON texts, spliced into the response unchanged.
    pub fn set_record_texts(&self, type_name: &str, records: Vec<String>) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(type_name.to_string(), records);
    }

    pub fn rate_limit_next(&self, n: u32) {
        self.state.lock().unwrap().rate_limit_remaining = n;
    }

    pub fn fail_token(&self, status: u16) {
        self.state.lock().unwrap().token_status = Some(status);
    }

    pub fn fail_queries(&self, status: u16) {
        self.state.lock().unwrap().query_status = Some(status);
    }

    pub fn rotate_to(&self, token: &str) {
        self.state.lock().unwrap().rotate_to = Some(token.to_string());
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.state.lock().unwrap().refresh_tokens_seen.clone()
    }

    pub fn token_auth_headers(&self) -> Vec<String> {
        self.state.lock().unwrap().token_auth_headers.clone()
    }
}

async fn token_handler(State(state): State<Shared>, headers: HeaderMap, body: String) -> Response {
    let supplied = form_value(&body, "refresh_token").unwrap_or_default();
    let mut st = state.lock().unwrap();
    st.refresh_tokens_seen.push(supplied.clone());
    st.token_auth_headers.push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    );

    if let Some(status) = st.token_status {
        let code = StatusCode::from_u16(status).unwrap();
        return (code, r#"{"error":"invalid_grant"}"#).into_response();
    }
    if form_value(&body, "grant_type").as_deref() != Some("refresh_token") {
        return (StatusCode::BAD_REQUEST, r#"{"error":"unsupported_grant_type"}"#).into_response();
    }

    let refresh_token = st.rotate_to.clone().unwrap_or(supplied);
    Json(json!({
        "access_token": ACCESS_TOKEN,
        "token_type": "bearer",
        "expires_in": 3600,
        "refresh_token": refresh_token,
        "x_refresh_token_expires_in": 8_726_400
    }))
    .into_response()
}

async fn query_handler(
    State(state): State<Shared>,
    AxumPath(realm): AxumPath<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let mut st = state.lock().unwrap();
    st.queries.push(body.clone());

    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", ACCESS_TOKEN))
        .unwrap_or(false);
    if !authorized || realm != REALM_ID {
        return (StatusCode::UNAUTHORIZED, "AuthenticationFailed").into_response();
    }

    if st.rate_limit_remaining > 0 {
        st.rate_limit_remaining -= 1;
        return (StatusCode::TOO_MANY_REQUESTS, "ThrottleExceeded").into_response();
    }
    if let Some(status) = st.query_status {
        let code = StatusCode::from_u16(status).unwrap();
        return (code, "ValidationFault").into_response();
    }

    let type_name = word_after(&body, "FROM").unwrap_or_default();
    let start: usize = word_after(&body, "STARTPOSITION")
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    let max: usize = word_after(&body, "MAXRESULTS")
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    let all = st.records.get(&type_name).cloned().unwrap_or_default();
    let from = (start - 1).min(all.len());
    let to = (from + max).min(all.len());
    let page = &all[from..to];

    let query_response = if page.is_empty() {
        "{}".to_string()
    } else {
        format!(
            r#"{{"{}":[{}],"startPosition":{},"maxResults":{}}}"#,
            type_name,
            page.join(","),
            start,
            page.len()
        )
    };
    let body = format!(
        r#"{{"QueryResponse":{},"time":"2024-02-01T09:00:00.000-08:00"}}"#,
        query_response
    );
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn form_value(body: &str, key: &str) -> Option<String> {
    body.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

fn word_after(text: &str, keyword: &str) -> Option<String> {
    let mut words = text.split_whitespace();
    words.find(|w| *w == keyword)?;
    words.next().map(|w| w.to_string())
}

pub fn invoice(id: u32) -> Value {
    json!({
        "Id": id.to_string(),
        "DocNumber": format!("INV-{:04}", id),
        "TotalAmt": 100.0 + id as f64,
        "CustomerRef": {"value": "58", "name": "Acme"},
        "MetaData": {
            "CreateTime": "2024-01-10T08:00:00-05:00",
            "LastUpdatedTime": "2024-01-15T10:30:00-05:00"
        }
    })
}

pub fn invoices(n: u32) -> Vec<Value> {
    (1..=n).map(invoice).collect()
}

pub fn item(id: u32) -> Value {
    json!({
        "Id": id.to_string(),
        "Name": format!("Widget {}", id),
        "Type": "Inventory",
        "MetaData": {"LastUpdatedTime": "2024-01-20T12:00:00-05:00"}
    })
}

pub fn items(n: u32) -> Vec<Value> {
    (1..=n).map(item).collect()
}

/// TOML for a config pointing at `server`, with databases under `root`.
pub fn config_toml(root: &std::path::Path, server: &FakeQbo, extra: &str) -> String {
    format!(
        r#"[db]
path = "{root}/data/qbo.sqlite"
raw_path = "{root}/data/raw.sqlite"

[auth]
token_url = "{token_url}"
timeout_secs = 5

[api]
base_url = "{base}"
page_size = 100
rate_limit_backoff_secs = 0
max_rate_limit_retries = 3
utc_offset = "-05:00"
timeout_secs = 5
{extra}
"#,
        root = root.display(),
        token_url = server.token_url(),
        base = server.base_url,
        extra = extra,
    )
}

pub fn test_config(tmp: &TempDir, server: &FakeQbo, extra: &str) -> Config {
    let config: Config = toml::from_str(&config_toml(tmp.path(), server, extra)).unwrap();
    qbo_sync::config::validate(&config).unwrap();
    config
}

/// Write the config to `<tmp>/config/qbo-sync.toml` and return its path.
pub fn write_config(tmp: &TempDir, server: &FakeQbo, extra: &str) -> PathBuf {
    let dir = tmp.path().join("config");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("qbo-sync.toml");
    fs::write(&path, config_toml(tmp.path(), server, extra)).unwrap();
    path
}

pub fn credentials() -> StaticCredentialStore {
    StaticCredentialStore::new()
        .with("QBO_CLIENT_ID", CLIENT_ID)
        .with("QBO_CLIENT_SECRET", CLIENT_SECRET)
        .with("QBO_REFRESH_TOKEN", REFRESH_TOKEN)
        .with("QBO_REALM_ID", REALM_ID)
}

/// Records every progress event for later assertions.
#[derive(Default)]
pub struct CollectingProgress {
    pub events: Mutex<Vec<SyncProgressEvent>>,
}

impl SyncProgressReporter for CollectingProgress {
    fn report(&self, event: SyncProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl CollectingProgress {
    pub fn events(&self) -> Vec<SyncProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}
