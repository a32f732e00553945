//! End-to-end tests of the orchestrator HTTP API.
//!
//! The router is driven in-process with `oneshot`; a recording dispatcher
//! stands in for the node agents and the scheduler and sweep are stepped by
//! hand instead of running on timers.

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, header},
};
use chrono::{TimeDelta, Utc};
use gantry_core::domain::job::Job;
use gantry_core::domain::node::Node;
use gantry_orchestrator::api::auth::StaticTokens;
use gantry_orchestrator::repository::MemoryJobStore;
use gantry_orchestrator::service::dispatch::{DispatchError, Dispatcher};
use gantry_orchestrator::{Config, Orchestrator};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;
use uuid::Uuid;

const TOKEN: &str = "test-token";

#[derive(Default)]
struct RecordingDispatcher {
    launched: Mutex<Vec<Uuid>>,
    terminated: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn launch(&self, _node: &Node, job: &Job) -> Result<(), DispatchError> {
        self.launched.lock().unwrap().push(job.id);
        Ok(())
    }

    async fn terminate(&self, _node: &Node, job_id: Uuid) -> Result<(), DispatchError> {
        self.terminated.lock().unwrap().push(job_id);
        Ok(())
    }
}

struct TestApp {
    orchestrator: Orchestrator,
    dispatcher: Arc<RecordingDispatcher>,
    router: Router,
    shutdown: watch::Sender<bool>,
}

impl TestApp {
    fn new() -> Self {
        let config = Config {
            api_tokens: vec![format!("{}=u1:Ada", TOKEN)],
            ..Config::default()
        };
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let orchestrator = Orchestrator::new(
            &config,
            Arc::new(MemoryJobStore::new(config.retry_limit)),
            dispatcher.clone(),
            Arc::new(StaticTokens::parse(&config.api_tokens).unwrap()),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let router = orchestrator.router(shutdown_rx);
        Self {
            orchestrator,
            dispatcher,
            router,
            shutdown,
        }
    }

    async fn raw(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body.to_vec())
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN));
        let body = match body {
            Some(body) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        let (status, _, bytes) = self.raw(req.body(body).unwrap()).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    async fn heartbeat(&self, node: &str, gpus: u32) -> Value {
        let (status, body) = self
            .call(
                Method::POST,
                &format!("/v1/nodes/{}/heartbeat", node),
                Some(json!({
                    "addr": "10.0.0.1:9000",
                    "agent_version": "1.0",
                    "gpu_count": gpus,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    async fn submit(&self, gpus: u32, priority: i32) -> Uuid {
        let (status, body) = self
            .call(
                Method::POST,
                "/v1/jobs",
                Some(json!({
                    "command": "python train.py",
                    "gpu_count": gpus,
                    "cwd": "/work",
                    "priority": priority,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["id"].as_str().unwrap().parse().unwrap()
    }

    async fn report(&self, job_id: Uuid, report: Value) {
        let (status, body) = self
            .call(
                Method::POST,
                &format!("/v1/jobs/{}/report", job_id),
                Some(report),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT, "{}", body);
    }

    async fn job(&self, job_id: Uuid) -> Value {
        let (status, body) = self
            .call(Method::GET, &format!("/v1/jobs/{}", job_id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    /// Starts a request and hands back the response with its body unread
    async fn open(&self, uri: &str) -> Body {
        let req = Request::get(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .body(Body::empty())
            .unwrap();
        let response = self.router.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.into_body()
    }

    fn gpu_free(&self, node: &str) -> u32 {
        self.orchestrator.registry().get(node).unwrap().gpu_free
    }

    async fn tick(&self) -> Vec<Uuid> {
        self.orchestrator.scheduler().tick().await.unwrap().scheduled
    }
}

#[tokio::test]
async fn health_needs_no_token() {
    let app = TestApp::new();
    let req = Request::get("/health").body(Body::empty()).unwrap();

    let (status, _, body) = app.raw(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn requests_without_valid_token_are_rejected() {
    let app = TestApp::new();

    let req = Request::get("/v1/jobs").body(Body::empty()).unwrap();
    let (status, headers, _) = app.raw(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers.get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");

    let req = Request::get("/v1/whoami")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = app.raw(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn whoami_returns_caller() {
    let app = TestApp::new();

    let (status, body) = app.call(Method::GET, "/v1/whoami", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "id": "u1", "name": "Ada" }));
}

#[tokio::test]
async fn submission_validation_and_owner() {
    let app = TestApp::new();

    let (status, _) = app
        .call(
            Method::POST,
            "/v1/jobs",
            Some(json!({ "command": "", "gpu_count": 1, "cwd": "/work" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call(
            Method::POST,
            "/v1/jobs",
            Some(json!({ "command": "ls", "gpu_count": 1, "cwd": "/work", "extra": true })),
        )
        .await;
    assert!(status.is_client_error());

    let id = app.submit(1, 5).await;
    let job = app.job(id).await;
    assert_eq!(job["state"], "QUEUED");
    assert_eq!(job["owner_id"], "u1");
    assert_eq!(job["retry_count"], 0);

    let (status, _) = app
        .call(Method::GET, &format!("/v1/jobs/{}", Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn job_round_trip_releases_gpus() {
    let app = TestApp::new();
    app.heartbeat("n1", 4).await;
    assert_eq!(app.gpu_free("n1"), 4);

    let id = app.submit(2, 5).await;
    assert_eq!(app.tick().await, vec![id]);

    let job = app.job(id).await;
    assert_eq!(job["state"], "STARTING");
    assert_eq!(job["node_id"], "n1");
    assert_eq!(app.gpu_free("n1"), 2);
    assert_eq!(*app.dispatcher.launched.lock().unwrap(), vec![id]);

    app.report(id, json!({ "event": "started", "node_id": "n1" }))
        .await;
    assert_eq!(app.job(id).await["state"], "RUNNING");

    app.report(id, json!({ "event": "exited", "node_id": "n1", "exit_code": 0 }))
        .await;
    let job = app.job(id).await;
    assert_eq!(job["state"], "SUCCEEDED");
    assert_eq!(job["exit_code"], 0);
    assert!(job.get("node_id").is_none());
    assert_eq!(app.gpu_free("n1"), 4);

    let (status, events) = app
        .call(Method::GET, &format!("/v1/jobs/{}/events", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let states: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["to"].as_str().unwrap())
        .collect();
    assert_eq!(states, vec!["QUEUED", "STARTING", "RUNNING", "SUCCEEDED"]);
}

#[tokio::test]
async fn stale_report_from_other_node_is_ignored() {
    let app = TestApp::new();
    app.heartbeat("n1", 4).await;
    let id = app.submit(1, 1).await;
    app.tick().await;

    app.report(id, json!({ "event": "started", "node_id": "n2" }))
        .await;
    assert_eq!(app.job(id).await["state"], "STARTING");
}

#[tokio::test]
async fn cancel_queued_and_terminal_jobs() {
    let app = TestApp::new();

    let id = app.submit(1, 1).await;
    let (status, job) = app
        .call(Method::POST, &format!("/v1/jobs/{}/cancel", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "CANCELED");
    assert!(app.dispatcher.terminated.lock().unwrap().is_empty());

    let (status, body) = app
        .call(Method::POST, &format!("/v1/jobs/{}/cancel", id), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn cancel_running_job_terminates_on_node() {
    let app = TestApp::new();
    app.heartbeat("n1", 4).await;
    let id = app.submit(3, 1).await;
    app.tick().await;
    app.report(id, json!({ "event": "started", "node_id": "n1" }))
        .await;
    assert_eq!(app.gpu_free("n1"), 1);

    let (status, job) = app
        .call(Method::POST, &format!("/v1/jobs/{}/cancel", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "CANCELED");
    assert_eq!(*app.dispatcher.terminated.lock().unwrap(), vec![id]);
    assert_eq!(app.gpu_free("n1"), 4);
}

#[tokio::test]
async fn large_job_does_not_block_smaller_ones() {
    let app = TestApp::new();
    app.heartbeat("n1", 4).await;

    let first = app.submit(2, 5).await;
    assert_eq!(app.tick().await, vec![first]);
    assert_eq!(app.gpu_free("n1"), 2);

    let big = app.submit(4, 9).await;
    let small = app.submit(1, 1).await;

    let report = app.orchestrator.scheduler().tick().await.unwrap();
    assert_eq!(report.scheduled, vec![small]);
    assert_eq!(report.deferred, 1);
    assert_eq!(app.job(big).await["state"], "QUEUED");
    assert_eq!(app.job(small).await["state"], "STARTING");
}

#[tokio::test]
async fn silent_node_loses_its_jobs() {
    let app = TestApp::new();
    app.heartbeat("n1", 4).await;
    let id = app.submit(2, 1).await;
    app.tick().await;
    app.report(id, json!({ "event": "started", "node_id": "n1" }))
        .await;
    assert_eq!(app.gpu_free("n1"), 2);

    let later = Utc::now() + TimeDelta::seconds(60);
    let report = app.orchestrator.monitor().sweep_at(later).await.unwrap();
    assert_eq!(report.lost, 1);

    assert_eq!(app.job(id).await["state"], "LOST");
    assert_eq!(app.gpu_free("n1"), 4);

    let (_, nodes) = app.call(Method::GET, "/v1/nodes", None).await;
    assert_eq!(nodes[0]["status"], "OFFLINE");
}

#[tokio::test]
async fn fourth_failure_is_final() {
    let app = TestApp::new();
    app.heartbeat("n1", 4).await;
    let id = app.submit(1, 1).await;

    for attempt in 0..4 {
        assert_eq!(app.tick().await, vec![id], "attempt {}", attempt);
        app.report(
            id,
            json!({ "event": "launch_failed", "node_id": "n1", "reason": "no such file" }),
        )
        .await;
    }

    let job = app.job(id).await;
    assert_eq!(job["state"], "FAILED");
    assert_eq!(job["retry_count"], 3);
    assert_eq!(app.gpu_free("n1"), 4);
    assert!(app.tick().await.is_empty());
}

#[tokio::test]
async fn listing_filters_and_counts() {
    let app = TestApp::new();
    let queued = app.submit(1, 1).await;
    let canceled = app.submit(1, 1).await;
    app.call(Method::POST, &format!("/v1/jobs/{}/cancel", canceled), None)
        .await;

    let req = Request::get("/v1/jobs?state=active&page=1&page_size=10")
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = app.raw(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-total-count").unwrap(), "1");
    let jobs: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(jobs[0]["id"], queued.to_string());

    let (_, stats) = app.call(Method::GET, "/v1/stats", None).await;
    assert_eq!(stats["queued_jobs"], 1);
    assert_eq!(stats["recent_jobs"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn logs_fetch_and_follow() {
    let app = TestApp::new();
    app.heartbeat("n1", 1).await;
    let id = app.submit(1, 1).await;
    app.tick().await;
    app.report(id, json!({ "event": "started", "node_id": "n1" }))
        .await;

    let (status, _) = app
        .call(Method::GET, &format!("/v1/jobs/{}/logs", id), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let follow = Request::get(format!("/v1/jobs/{}/logs?follow=true", id))
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(follow).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    for chunk in ["a", "b", "c"] {
        let req = Request::post(format!("/v1/jobs/{}/logs", id))
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(chunk))
            .unwrap();
        let (status, _, _) = app.raw(req).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    app.report(id, json!({ "event": "exited", "node_id": "n1", "exit_code": 0 }))
        .await;

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"abc");

    let req = Request::get(format!("/v1/jobs/{}/logs", id))
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = app.raw(req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    assert_eq!(body, b"abc");
}

#[tokio::test]
async fn node_removal_is_guarded() {
    let app = TestApp::new();
    app.heartbeat("n1", 2).await;
    let id = app.submit(1, 1).await;
    app.tick().await;

    let (status, _) = app.call(Method::DELETE, "/v1/nodes/n1", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    app.call(Method::POST, &format!("/v1/jobs/{}/cancel", id), None)
        .await;
    let (status, _) = app.call(Method::DELETE, "/v1/nodes/n1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.call(Method::DELETE, "/v1/nodes/n1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn terminal_job_follow_ends_immediately() {
    let app = TestApp::new();
    let id = app.submit(1, 1).await;
    app.call(Method::POST, &format!("/v1/jobs/{}/cancel", id), None)
        .await;

    let req = Request::get(format!("/v1/jobs/{}/logs?follow=true", id))
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = app.raw(req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn event_feed_streams_job_changes() {
    let app = TestApp::new();
    let mut feed = app.open("/v1/events").await;

    let id = app.submit(1, 1).await;
    app.call(Method::POST, &format!("/v1/jobs/{}/cancel", id), None)
        .await;

    let mut seen = String::new();
    let read = async {
        while !seen.contains("\"to\":\"CANCELED\"") {
            let frame = feed.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                seen.push_str(&String::from_utf8_lossy(&data));
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("feed never delivered the cancellation");

    assert!(seen.contains("event: job"));
    assert!(seen.contains(&id.to_string()));
    assert!(seen.contains("\"to\":\"QUEUED\""));
}

#[tokio::test]
async fn shutdown_ends_open_streams() {
    let app = TestApp::new();
    let id = app.submit(1, 1).await;

    let feed = app.open("/v1/events").await;
    let follow = app.open(&format!("/v1/jobs/{}/logs?follow=true", id)).await;

    app.shutdown.send(true).unwrap();

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        feed.collect().await.unwrap();
        follow.collect().await.unwrap().to_bytes()
    })
    .await
    .expect("streams outlived shutdown");
    assert!(drained.is_empty());
}
