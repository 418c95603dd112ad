//! REST gateway tests: routes are driven in-process with `oneshot`.


use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use test_harness::{cpus, test_authority, test_config, TestController};
use wlm_lite::auth::{USER_NAME_HEADER, USER_TOKEN_HEADER};
use wlm_lite::gateway::{router, GatewayState};
use wlm_lite::scheduler::JobState;

struct TestGateway {
    app: Router,
    ctl: TestController,
}

impl TestGateway {
    async fn new() -> Self {
        let ctl = TestController::start(test_config()).await;
        ctl.add_node("n1", cpus(4)).await;
        let app = router(GatewayState {
            controller: ctl.handle.clone(),
            authority: test_authority(),
        });
        Self { app, ctl }
    }

    fn token(user: &str) -> String {
        test_authority()
            .issue(user, Duration::from_secs(60), Utc::now())
            .unwrap()
    }

    async fn send(&self, user: Option<&str>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder
                .header(USER_NAME_HEADER, user)
                .header(USER_TOKEN_HEADER, Self::token(user));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}

#[tokio::test]
async fn test_healthz_needs_no_credentials() {
    let gw = TestGateway::new().await;
    let response = gw
        .app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_missing_credentials_rejected() {
    let gw = TestGateway::new().await;
    let (status, body) = gw.send(None, "GET", "/api/jobs", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_token_for_other_user_rejected() {
    let gw = TestGateway::new().await;
    let request = Request::builder()
        .uri("/api/jobs")
        .header(USER_NAME_HEADER, "mallory")
        .header(USER_TOKEN_HEADER, TestGateway::token("alice"))
        .body(Body::empty())
        .unwrap();
    let response = gw.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_submit_and_get_job() {
    let gw = TestGateway::new().await;

    let (status, job) = gw
        .send(
            Some("alice"),
            "POST",
            "/api/jobs",
            Some(json!({
                "name": "hello",
                "command": "echo hello",
                "resources": { "cpus": 2 },
                "priority": 5
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["owner"], "alice");
    assert_eq!(job["name"], "hello");
    assert_eq!(job["resources"]["cpus"], 2);
    assert_eq!(job["time_limit_secs"], 3600);

    let id = job["id"].as_str().unwrap().to_string();
    let (status, fetched) = gw.send(Some("bob"), "GET", &format!("/api/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id.as_str());
}

#[tokio::test]
async fn test_unsatisfiable_submission_is_unprocessable() {
    let gw = TestGateway::new().await;
    let (status, body) = gw
        .send(
            Some("alice"),
            "POST",
            "/api/jobs",
            Some(json!({ "command": "true", "resources": { "cpus": 8 } })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("Unsatisfiable"));
}

#[tokio::test]
async fn test_unknown_job_not_found() {
    let gw = TestGateway::new().await;
    let (status, _) = gw
        .send(
            Some("alice"),
            "GET",
            &format!("/api/jobs/{}", uuid::Uuid::new_v4()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = gw.send(Some("alice"), "GET", "/api/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_only_by_owner() {
    let gw = TestGateway::new().await;
    gw.ctl.handle.drain_node("n1").await.unwrap();

    let (_, job) = gw
        .send(
            Some("alice"),
            "POST",
            "/api/jobs",
            Some(json!({ "command": "sleep 10", "resources": { "cpus": 1 } })),
        )
        .await;
    let uri = format!("/api/jobs/{}", job["id"].as_str().unwrap());

    let (status, _) = gw.send(Some("mallory"), "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, cancelled) = gw.send(Some("alice"), "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["state"], "Cancelled");

    let (status, _) = gw.send(Some("alice"), "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_list_jobs_with_filters() {
    let gw = TestGateway::new().await;
    let running = gw.ctl.submit("alice", cpus(4), 0).await;
    gw.ctl
        .wait_for_state(running.id, JobState::Running, Duration::from_secs(3))
        .await;
    gw.ctl.submit("bob", cpus(4), 0).await;

    let (status, jobs) = gw.send(Some("alice"), "GET", "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().unwrap().len(), 2);

    let (_, jobs) = gw
        .send(Some("alice"), "GET", "/api/jobs?state=running", None)
        .await;
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["owner"], "alice");

    let (_, jobs) = gw.send(Some("alice"), "GET", "/api/jobs?owner=bob", None).await;
    assert_eq!(jobs.as_array().unwrap().len(), 1);

    let (status, _) = gw
        .send(Some("alice"), "GET", "/api/jobs?state=sleeping", None)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_list_nodes() {
    let gw = TestGateway::new().await;
    let (status, nodes) = gw.send(Some("alice"), "GET", "/api/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    let nodes = nodes.as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["id"], "n1");
    assert_eq!(nodes[0]["state"], "Up");
    assert_eq!(nodes[0]["capacity"]["cpus"], 4);
    assert_eq!(nodes[0]["free"]["cpus"], 4);
    assert_eq!(nodes[0]["active_jobs"], 0);
}

#[tokio::test]
async fn test_accounting_scoped_to_caller() {
    let gw = TestGateway::new().await;
    for owner in ["alice", "bob"] {
        let job = gw.ctl.submit(owner, cpus(4), 0).await;
        gw.ctl
            .wait_for_state(job.id, JobState::Running, Duration::from_secs(3))
            .await;
        assert!(gw.ctl.finish(&job, JobState::Completed, Some(0)).await);
    }

    let (status, records) = gw.send(Some("alice"), "GET", "/api/accounting", None).await;
    assert_eq!(status, StatusCode::OK);
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["job"]["owner"], "alice");

    let (status, _) = gw
        .send(Some("alice"), "GET", "/api/accounting?owner=bob", None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, records) = gw.send(Some("root"), "GET", "/api/accounting", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(records.as_array().unwrap().len(), 2);
}
