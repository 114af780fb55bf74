use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use kiln_api::{AppState, routes};
use kiln_config::SystemConfig;
use kiln_core::auth::{Consumer, Identity, generate_token, hash_token};
use kiln_core::secret::VariableScope;
use kiln_core::{ConsumerId, GroupId, WorkerId};
use kiln_db::{NewVariable, Store};
use kiln_scheduler::{DispatchContext, Reaper};

struct TestApp {
    state: AppState,
    group: GroupId,
    group_token: String,
    service_token: String,
    admin_token: String,
}

impl TestApp {
    async fn new() -> Self {
        let ctx = DispatchContext::new(Store::memory(), SystemConfig::default());
        let group = GroupId::new();
        let group_token = generate_token();
        ctx.store
            .consumers
            .insert_group_token(&hash_token(&group_token), group)
            .await
            .unwrap();

        let state = AppState::new(ctx, None);
        let service_token = issue(
            &state,
            Identity::Service {
                name: "engine".to_string(),
            },
        )
        .await;
        let admin_token = issue(
            &state,
            Identity::User {
                username: "admin".to_string(),
                admin: true,
                groups: vec![],
            },
        )
        .await;

        Self {
            state,
            group,
            group_token,
            service_token,
            admin_token,
        }
    }

    fn router(&self) -> Router {
        routes::router(self.state.clone())
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Register a worker; it starts out Checking.
    async fn register_worker(&self, name: &str) -> (WorkerId, String) {
        let (status, body) = self
            .send(
                Method::POST,
                "/worker",
                None,
                Some(json!({
                    "name": name,
                    "token": self.group_token,
                    "version": "1.2.0",
                    "os": "linux",
                    "arch": "amd64",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        let id = body["worker"]["id"].as_str().unwrap().parse().unwrap();
        (id, body["token"].as_str().unwrap().to_string())
    }

    async fn register_hatchery(&self, name: &str) -> (String, String) {
        let (status, body) = self
            .send(
                Method::POST,
                "/hatchery",
                None,
                Some(json!({ "name": name, "token": self.group_token })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        (
            body["id"].as_str().unwrap().to_string(),
            body["uid"].as_str().unwrap().to_string(),
        )
    }

    async fn enqueue(&self) -> String {
        let (status, body) = self
            .send(
                Method::POST,
                "/queue",
                Some(&self.service_token),
                Some(json!({
                    "source": "workflow_node_run",
                    "name": "build",
                    "group_id": self.group,
                    "project_key": "PROJ",
                    "application": "api",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["status"], "Waiting");
        body["id"].as_str().unwrap().to_string()
    }
}

async fn issue(state: &AppState, identity: Identity) -> String {
    let token = generate_token();
    let consumer = Consumer {
        id: ConsumerId::new(),
        identity,
        issuer: "test".to_string(),
        expires_at: None,
        created_at: Utc::now(),
    };
    state
        .ctx
        .store
        .consumers
        .insert(&consumer, &hash_token(&token))
        .await
        .unwrap();
    token
}

#[tokio::test]
async fn test_worker_takes_job_and_reports_result() {
    let app = TestApp::new().await;
    let (worker_id, token) = app.register_worker("w1").await;

    // Freshly registered workers are already Checking.
    let (status, body) = app
        .send(Method::POST, "/worker/checking", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let job_id = app.enqueue().await;
    app.state
        .ctx
        .store
        .variables
        .insert(NewVariable {
            group_id: app.group,
            scope: VariableScope::Project,
            scope_name: "PROJ".to_string(),
            name: "registry_password".to_string(),
            value: "s3cret".to_string(),
            secret: true,
        })
        .await
        .unwrap();

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/queue/{}/take", job_id),
            Some(&token),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["job"]["status"], "Building");
    assert_eq!(body["job"]["assigned_worker_name"], "w1");
    assert_eq!(body["secrets"][0]["name"], "proj.registry_password");
    assert_eq!(body["secrets"][0]["value"], "s3cret");

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/queue/{}/result", job_id),
            Some(&token),
            Some(json!({ "status": "Success", "duration": 1500 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["status"], "Success");

    let (status, body) = app
        .send(Method::GET, "/worker", Some(&app.admin_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let worker = body
        .as_array()
        .unwrap()
        .iter()
        .find(|w| w["id"] == json!(worker_id))
        .unwrap();
    assert_eq!(worker["status"], "Waiting");
    assert!(worker["current_job_id"].is_null());

    // A second result for the same job is a conflict.
    let (status, _) = app
        .send(
            Method::POST,
            &format!("/queue/{}/result", job_id),
            Some(&token),
            Some(json!({ "status": "Fail" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_booking_is_exclusive_but_advisory() {
    let app = TestApp::new().await;
    let job_id = app.enqueue().await;
    let other_job = app.enqueue().await;
    let (_, h1) = app.register_hatchery("h1").await;
    let (_, h2) = app.register_hatchery("h2").await;

    let book = format!("/queue/{}/book", job_id);
    let (status, body) = app.send(Method::POST, &book, Some(&h1), None).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["booked_by"]["hatchery_name"], "h1");

    let (status, body) = app.send(Method::POST, &book, Some(&h2), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");

    // A worker spawned for another job may still take the booked one.
    let (_, w2) = app.register_worker("w2").await;
    let (status, body) = app
        .send(
            Method::POST,
            &format!("/queue/{}/take", job_id),
            Some(&w2),
            Some(json!({ "bookedJobID": other_job })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["job"]["assigned_worker_name"], "w2");
}

#[tokio::test]
async fn test_silent_worker_is_reaped_and_loses_its_token() {
    let app = TestApp::new().await;
    let (worker_id, token) = app.register_worker("w3").await;

    let (status, body) = app
        .send(Method::POST, "/worker/waiting", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["status"], "Waiting");

    app.state
        .ctx
        .store
        .workers
        .refresh(worker_id, Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();

    let reaper = Reaper::new(app.state.ctx.clone());
    assert_eq!(reaper.dead_sweep().await.processed, 1);
    assert_eq!(reaper.delete_sweep().await.processed, 1);

    let (status, body) = app
        .send(Method::POST, "/worker/refresh", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_requests_need_a_known_token() {
    let app = TestApp::new().await;

    let (status, _) = app.send(Method::GET, "/queue", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .send(Method::GET, "/queue", Some("not-a-token"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_only_services_enqueue() {
    let app = TestApp::new().await;
    let (_, token) = app.register_worker("w4").await;

    let (status, body) = app
        .send(
            Method::POST,
            "/queue",
            Some(&token),
            Some(json!({
                "source": "pipeline_build",
                "name": "build",
                "group_id": app.group,
                "project_key": "PROJ",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn test_malformed_path_and_body_are_bad_requests() {
    let app = TestApp::new().await;
    let (_, token) = app.register_worker("w5").await;

    let (status, body) = app
        .send(Method::POST, "/queue/not-an-id/take", Some(&token), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let job_id = app.enqueue().await;
    let (status, _) = app
        .send(
            Method::POST,
            &format!("/queue/{}/spawn/infos", job_id),
            Some(&token),
            Some(json!([{ "message": { "id": "no_such_message", "args": [] } }])),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_spawn_infos_are_recorded() {
    let app = TestApp::new().await;
    let job_id = app.enqueue().await;
    let (_, hatchery) = app.register_hatchery("h1").await;

    let (status, _) = app
        .send(
            Method::POST,
            &format!("/queue/{}/spawn/infos", job_id),
            Some(&hatchery),
            Some(json!([{
                "remoteTime": "2024-05-01T10:00:00Z",
                "message": { "id": "hatchery_starts", "args": ["h1", "debian"] },
            }])),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .send(
            Method::GET,
            &format!("/queue/{}/infos", job_id),
            Some(&app.admin_token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["spawn_infos"]
        .as_array()
        .unwrap()
        .iter()
        .map(|info| info["message"]["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["job_in_queue", "hatchery_starts"]);
}

#[tokio::test]
async fn test_hatchery_heartbeat() {
    let app = TestApp::new().await;
    let (id, uid) = app.register_hatchery("h1").await;
    let (other, _) = app.register_hatchery("h2").await;

    let (status, body) = app
        .send(Method::PUT, &format!("/hatchery/{}", id), Some(&uid), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["name"], "h1");

    let (status, _) = app
        .send(Method::PUT, &format!("/hatchery/{}", other), Some(&uid), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = TestApp::new().await;

    let (status, body) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = app.send(Method::GET, "/health/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}
