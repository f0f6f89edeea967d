//! HTTP adapter tests: routing, session-header enforcement, worker auth
//! and error mapping, driven through the assembled router.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;
use uuid::Uuid;

use server_core::domains::invoices::{EngineSettings, InvoiceFacade, ProcessingEngine};
use server_core::kernel::dispatcher::EmulationDispatcher;
use server_core::kernel::oidc::StaticVerifier;
use server_core::kernel::test_dependencies::TestDependencies;
use server_core::server::app::{build_app, AppState};
use server_core::server::middleware::WorkerAuth;

fn app(worker_auth: WorkerAuth) -> (Router, TestDependencies) {
    let t = TestDependencies::new();

    let settings = EngineSettings {
        worker_id: "http-worker".to_string(),
        heartbeat_interval: StdDuration::from_secs(30),
        ocr_poll_initial: StdDuration::from_millis(1),
        ocr_poll_max: StdDuration::from_millis(2),
        ocr_stage_timeout: StdDuration::from_secs(5),
        attempt_budget: StdDuration::from_secs(30),
    };
    let engine = Arc::new(ProcessingEngine::new(t.deps.clone(), settings));
    let facade = Arc::new(InvoiceFacade::new(
        t.deps.clone(),
        Arc::new(EmulationDispatcher::new(engine.clone())),
    ));

    let router = build_app(
        AppState {
            deps: t.deps.clone(),
            facade,
            engine,
        },
        worker_auth,
    );
    (router, t)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(session) = session {
        builder = builder.header("x-session-id", session);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn healthz_reports_ok_with_time() {
    let (router, _t) = app(WorkerAuth::emulation_bypass());
    let response = router.oneshot(get("/api/healthz", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["time"].is_string());
}

#[tokio::test]
async fn config_exposes_upload_limits() {
    let (router, _t) = app(WorkerAuth::emulation_bypass());
    let response = router.oneshot(get("/api/config", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["maxFiles"], 10);
    assert_eq!(json["maxSizeMb"], 20);
    assert_eq!(json["acceptedMime"][0], "application/pdf");
}

#[tokio::test]
async fn session_header_is_required_and_must_be_uuidv4() {
    let (router, _t) = app(WorkerAuth::emulation_bypass());

    let missing = router
        .clone()
        .oneshot(get(&format!("/api/jobs/{}", Uuid::new_v4()), None))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(missing).await["error"], "missingSession");

    let invalid = router
        .oneshot(get(
            &format!("/api/jobs/{}", Uuid::new_v4()),
            Some("not-a-uuid"),
        ))
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(invalid).await["error"], "badSession");
}

#[tokio::test]
async fn unknown_job_and_session_mismatch_are_not_found() {
    let (router, _t) = app(WorkerAuth::emulation_bypass());
    let session = Uuid::new_v4().to_string();

    let response = router
        .clone()
        .oneshot(get(&format!("/api/jobs/{}", Uuid::new_v4()), Some(&session)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Path session differing from the header session is indistinguishable
    // from an unknown session.
    let response = router
        .oneshot(get(
            &format!("/api/sessions/{}/jobs", Uuid::new_v4()),
            Some(&session),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_session_export_is_header_only_csv() {
    let (router, _t) = app(WorkerAuth::emulation_bypass());
    let session = Uuid::new_v4().to_string();

    let response = router
        .oneshot(get(
            &format!("/api/sessions/{session}/export.csv"),
            Some(&session),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let csv = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(csv.starts_with("invoiceNumber,"));
    assert_eq!(csv.lines().count(), 1);
}

fn process_request(token: Option<&str>) -> Request<Body> {
    let payload = serde_json::json!({
        "jobId": Uuid::new_v4(),
        "sessionId": Uuid::new_v4(),
    });
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/tasks/process")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

#[tokio::test]
async fn worker_route_with_bypass_accepts_unknown_jobs_as_no_ops() {
    let (router, _t) = app(WorkerAuth::emulation_bypass());
    let response = router.oneshot(process_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "notFound");
}

#[tokio::test]
async fn worker_route_verifies_bearer_tokens() {
    let (router, _t) = app(WorkerAuth::verified(Arc::new(StaticVerifier::new(
        "expected-token",
    ))));

    let unauthenticated = router
        .clone()
        .oneshot(process_request(None))
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let wrong = router
        .clone()
        .oneshot(process_request(Some("wrong")))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let ok = router
        .oneshot(process_request(Some("expected-token")))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
}
