mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;

use ci_server::config::CiConfig;
use ci_server::events::build::PipelineState;
use ci_server::fakes::{wait_for_report, FakeBackend, RecordingReporter};
use ci_server::routes::{router, AppState};
use ci_server::store::BuildStore;

use common::{test_config, yaml, Harness, SHA};

fn app(harness: Harness) -> (Router, Harness) {
    let app = router(AppState {
        orchestrator: Arc::clone(&harness.orchestrator),
    });
    (app, harness)
}

fn configured(config: CiConfig) -> Harness {
    Harness::with(
        config,
        FakeBackend::new().with_config(&yaml(&["make test"], "")),
        RecordingReporter::new(),
    )
}

fn push_payload(branch: &str) -> Value {
    push_payload_from("acme", branch)
}

fn push_payload_from(owner: &str, branch: &str) -> Value {
    json!({
        "ref": format!("refs/heads/{branch}"),
        "after": SHA,
        "repository": {
            "name": "widgets",
            "private": false,
            "default_branch": "master",
            "owner": { "name": owner, "login": owner }
        }
    })
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn webhook(event: &str, body: &[u8], signature: Option<&str>) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri("/webhook/github")
        .header("content-type", "application/json")
        .header("x-github-event", event);
    if let Some(signature) = signature {
        request = request.header("x-hub-signature-256", signature);
    }
    request.body(Body::from(body.to_vec())).unwrap()
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_answers_ok() {
    let (app, _) = app(configured(test_config()));
    let (status, body) = get(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn ping_is_acknowledged() {
    let (app, harness) = app(configured(test_config()));
    let response = app.oneshot(webhook("ping", b"{\"zen\":\"hi\"}", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(harness.backend.calls().is_empty());
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let config = CiConfig {
        github_webhook_secret: "s3cret".to_string(),
        ..test_config()
    };
    let (app, _) = app(configured(config));
    let body = serde_json::to_vec(&push_payload("master")).unwrap();

    let unsigned = app.clone().oneshot(webhook("push", &body, None)).await.unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let forged = app
        .clone()
        .oneshot(webhook("push", &body, Some(&sign("other", &body))))
        .await
        .unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

    let signed = app
        .oneshot(webhook("push", &body, Some(&sign("s3cret", &body))))
        .await
        .unwrap();
    assert_eq!(signed.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn push_to_default_branch_creates_a_build() {
    let (app, harness) = app(configured(test_config()));
    let body = serde_json::to_vec(&push_payload("master")).unwrap();

    let response = app.oneshot(webhook("push", &body, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let project = harness
        .store
        .find_project("acme", "widgets")
        .await
        .unwrap()
        .expect("project registered");
    assert!(project.approved);
    assert_eq!(project.last_build_number, 1);
}

#[tokio::test]
async fn push_to_other_branch_builds_nothing() {
    let (app, harness) = app(configured(test_config()));
    let body = serde_json::to_vec(&push_payload("feature/login")).unwrap();

    let response = app.oneshot(webhook("push", &body, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(harness.store.find_project("acme", "widgets").await.unwrap().is_none());
}

#[tokio::test]
async fn malformed_payload_is_a_bad_request() {
    let (app, _) = app(configured(test_config()));
    let response = app.oneshot(webhook("push", b"{not json", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn build_detail_serves_the_status_target() {
    let (app, harness) = app(configured(test_config()));
    let mut rx = harness.orchestrator.subscribe();

    let (status, _) = get(app.clone(), "/builds/acme/widgets/1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let body = serde_json::to_vec(&push_payload("master")).unwrap();
    let response = app.clone().oneshot(webhook("push", &body, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    wait_for_report(&mut rx, 1).await;

    let (status, detail) = get(app.clone(), "/builds/acme/widgets/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["state"], "done");
    assert_eq!(detail["color"], "green");
    assert_eq!(detail["running"], false);
    assert_eq!(detail["build"]["sha"], SHA);
    assert_eq!(detail["result"]["return_codes"], "0");
    assert_eq!(detail["title"], "acme / widgets / master - 1");

    let (status, _) = get(app, "/builds/acme/widgets/2").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancelling_an_unknown_build_is_not_found() {
    let (app, _) = app(configured(test_config()));
    let response = app
        .oneshot(post("/api/builds/42/cancel"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn approving_a_project_lets_its_next_push_build() {
    let (app, harness) = app(configured(test_config()));
    let mut rx = harness.orchestrator.subscribe();
    let body = serde_json::to_vec(&push_payload_from("stranger", "master")).unwrap();

    let response = app.clone().oneshot(webhook("push", &body, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let refused = wait_for_report(&mut rx, 1).await;
    assert_eq!(refused.state, PipelineState::Errored);
    assert!(harness.backend.calls().is_empty());

    let response = app
        .clone()
        .oneshot(post("/api/projects/stranger/widgets/approve"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let project: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(project["approved"], true);

    let response = app.oneshot(webhook("push", &body, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let report = wait_for_report(&mut rx, 2).await;
    assert_eq!(report.state, PipelineState::Done);
    assert_eq!(report.succeeded, Some(true));
    assert_eq!(harness.backend.created().len(), 1);
}

#[tokio::test]
async fn approving_an_unknown_project_is_not_found() {
    let (app, _) = app(configured(test_config()));
    let response = app
        .oneshot(post("/api/projects/nobody/nothing/approve"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
