//! In-process bulk API for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hm_core::{AppState, BulkCredentials, DesiredAppState, PackageState};

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub batch_size: String,
    pub bulk_token: String,
}

/// Serves `pages[n]` for token `{"page": n}`; the first request (token
/// `{}`) gets page 0. Requests past the end get an empty page.
#[derive(Clone)]
pub struct FakeBulkApi {
    authorization: String,
    pages: Arc<Vec<String>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl FakeBulkApi {
    pub fn new(credentials: &BulkCredentials, pages: Vec<String>) -> Self {
        let raw = format!("{}:{}", credentials.user, credentials.password);
        Self {
            authorization: format!("Basic {}", STANDARD.encode(raw)),
            pages: Arc::new(pages),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// Bind an ephemeral port and return the base URL.
    pub async fn serve(&self) -> String {
        let app = Router::new()
            .route("/bulk/apps", get(bulk_apps))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }
}

async fn bulk_apps(
    State(api): State<FakeBulkApi>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == api.authorization);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let token = query.get("bulk_token").cloned().unwrap_or_default();
    api.seen.lock().unwrap().push(SeenRequest {
        batch_size: query.get("batch_size").cloned().unwrap_or_default(),
        bulk_token: token.clone(),
    });

    let index = serde_json::from_str::<serde_json::Value>(&token)
        .ok()
        .and_then(|t| t.get("page").and_then(|p| p.as_u64()))
        .unwrap_or(0) as usize;
    let body = api
        .pages
        .get(index)
        .cloned()
        .unwrap_or_else(|| page(&[], None));
    (StatusCode::OK, body).into_response()
}

/// A page body listing `apps`, pointing at page `next` (or an empty
/// token on the last page).
pub fn page(apps: &[DesiredAppState], next: Option<u64>) -> String {
    let results: serde_json::Map<String, serde_json::Value> = apps
        .iter()
        .map(|a| (a.app_id.clone(), serde_json::to_value(a).unwrap()))
        .collect();
    let token = match next {
        Some(n) => serde_json::json!({ "page": n }),
        None => serde_json::json!({}),
    };
    serde_json::json!({ "results": results, "bulk_token": token }).to_string()
}

pub fn desired(app_id: &str, instances: u32) -> DesiredAppState {
    DesiredAppState {
        app_id: app_id.into(),
        app_version: "v1".into(),
        number_of_instances: instances,
        memory: 128,
        state: AppState::Started,
        package_state: PackageState::Staged,
        updated_at: 1_700_000_000,
    }
}
