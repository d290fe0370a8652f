//! Fixtures shared by the integration tests: document and archive builders,
//! upstream records, and an axum stand-in for the SAM.gov endpoints.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

pub const API_KEY: &str = "test-key";

pub const MODEL: &str = r#"{
    "version": "test-2024.1",
    "estimator": "LogisticRegression",
    "params": {"C": 1.0},
    "intercept": -1.0,
    "ngram_max": 2,
    "weights": {"508": 3.0, "section 508": 2.0, "compliant": 1.0}
}"#;

/// Minimal valid PDF with one line of text. Offsets are computed so
/// pdf-extract can follow the xref table.
pub fn minimal_pdf(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n");
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

pub fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, data) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

/// One opportunity record as the search API returns it.
pub fn record(id: &str, naics: Option<&str>, org_code: &str) -> Value {
    let mut v = json!({
        "noticeId": id,
        "title": format!("Solicitation {}", id),
        "solicitationNumber": format!("{}-R-0001", id),
        "postedDate": "2024-03-01",
        "type": "Combined Synopsis/Solicitation",
        "fullParentPathCode": org_code,
        "fullParentPathName": "GENERAL SERVICES ADMINISTRATION.FEDERAL ACQUISITION SERVICE",
        "uiLink": format!("https://sam.gov/opp/{}/view", id)
    });
    if let Some(n) = naics {
        v["naicsCode"] = json!(n);
    }
    v
}

// ---------- mock SAM.gov ----------

/// Scripted upstream state. Failure counters are consumed one per request.
#[derive(Default)]
pub struct MockSam {
    pub records: Vec<Value>,
    pub archives: HashMap<String, Vec<u8>>,
    /// `code -> (fhorgname, fhfullparentpathname)`
    pub orgs: HashMap<String, (String, String)>,
    pub search_failures: AtomicUsize,
    pub archive_failures: Mutex<HashMap<String, usize>>,
    pub search_calls: AtomicUsize,
    pub archive_calls: AtomicUsize,
    pub search_queries: Mutex<Vec<HashMap<String, String>>>,
}

impl MockSam {
    pub fn org(mut self, code: &str, name: &str, path: &str) -> Self {
        self.orgs
            .insert(code.to_string(), (name.to_string(), path.to_string()));
        self
    }

    pub fn archive(mut self, notice_id: &str, bytes: Vec<u8>) -> Self {
        self.archives.insert(notice_id.to_string(), bytes);
        self
    }

    pub fn failing_archive(self, notice_id: &str, times: usize) -> Self {
        self.archive_failures
            .lock()
            .unwrap()
            .insert(notice_id.to_string(), times);
        self
    }
}

fn authorised(q: &HashMap<String, String>) -> bool {
    q.get("api_key").map(String::as_str) == Some(API_KEY)
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn search(
    State(mock): State<Arc<MockSam>>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    mock.search_calls.fetch_add(1, Ordering::SeqCst);
    if !authorised(&q) {
        return (StatusCode::FORBIDDEN, "API_KEY_INVALID").into_response();
    }
    if take_failure(&mock.search_failures) {
        return (StatusCode::SERVICE_UNAVAILABLE, "try later").into_response();
    }
    mock.search_queries.lock().unwrap().push(q.clone());

    let offset: usize = q.get("offset").and_then(|s| s.parse().ok()).unwrap_or(0);
    let limit: usize = q.get("limit").and_then(|s| s.parse().ok()).unwrap_or(1000);
    let page: Vec<Value> = mock.records.iter().skip(offset).take(limit).cloned().collect();
    Json(json!({
        "totalRecords": mock.records.len(),
        "limit": limit,
        "offset": offset,
        "opportunitiesData": page
    }))
    .into_response()
}

async fn download(
    State(mock): State<Arc<MockSam>>,
    Path(notice_id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    mock.archive_calls.fetch_add(1, Ordering::SeqCst);
    if !authorised(&q) {
        return (StatusCode::FORBIDDEN, "API_KEY_INVALID").into_response();
    }
    {
        let mut failures = mock.archive_failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&notice_id) {
            if *left > 0 {
                *left -= 1;
                return (StatusCode::BAD_GATEWAY, "upstream hiccup").into_response();
            }
        }
    }
    match mock.archives.get(&notice_id) {
        Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "no resources").into_response(),
    }
}

async fn orgs(
    State(mock): State<Arc<MockSam>>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !authorised(&q) {
        return (StatusCode::FORBIDDEN, "API_KEY_INVALID").into_response();
    }
    let list: Vec<Value> = q
        .get("fhorgid")
        .and_then(|code| mock.orgs.get(code))
        .map(|(name, path)| {
            vec![json!({
                "fhorgname": name,
                "fhfullparentpathname": path
            })]
        })
        .unwrap_or_default();
    Json(json!({ "orglist": list })).into_response()
}

/// Serve `mock` on an ephemeral port. Returns the base URL.
pub async fn spawn_mock_sam(mock: Arc<MockSam>) -> String {
    let app = Router::new()
        .route("/opportunities", get(search))
        .route("/download/{notice_id}", get(download))
        .route("/orgs", get(orgs))
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// `[upstream]` table pointing at a mock server.
pub fn upstream_toml(base: &str) -> String {
    format!(
        "[upstream]\n\
         opportunities_url = \"{base}/opportunities\"\n\
         archive_url = \"{base}/download/{{notice_id}}\"\n\
         hierarchy_url = \"{base}/orgs\"\n\
         api_key_env = \"SRT_TEST_API_KEY\"\n\
         page_size = 2\n\
         timeout_secs = 10\n\
         max_retries = 2\n\
         backoff_base_ms = 10\n"
    )
}
