//! HTTP API integration tests.
//!
//! Serves the router on an ephemeral port and drives it with reqwest.

use std::sync::Arc;
use std::time::Duration;

use drover_coordinator::{
    api,
    join::JoinSettings,
    membership::MemberSpec,
    state::AppState,
    store::{MemoryStore, Resources},
    Cluster, ClusterSettings, Collaborators,
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

struct ApiHarness {
    base_url: String,
    client: reqwest::Client,
}

impl ApiHarness {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,drover_coordinator=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let settings = ClusterSettings {
            join: JoinSettings {
                cluster_fingerprint: "ab12cd34".to_string(),
                ..JoinSettings::default()
            },
            ..ClusterSettings::default()
        };
        let cluster = Cluster::new(
            Arc::new(MemoryStore::new()),
            Collaborators::in_memory(),
            settings,
        );
        cluster
            .membership()
            .bootstrap(MemberSpec {
                name: "m1".to_string(),
                address: "10.0.0.1:8443".to_string(),
                capacity: Resources::new(4000, 8 << 30),
                fingerprint: Some("f1".to_string()),
            })
            .await
            .unwrap();

        let app = api::create_router(AppState::new(cluster, "m1"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    /// Polls an operation until it leaves `pending`/`running`.
    async fn wait_operation(&self, id: &str) -> Value {
        for _ in 0..200 {
            let (status, body) = self.get(&format!("/v1/operations/{id}")).await;
            assert_eq!(status, StatusCode::OK);
            match body["status"].as_str() {
                Some("pending") | Some("running") => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                _ => return body,
            }
        }
        panic!("operation {id} did not finish");
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = ApiHarness::new().await;
    let (status, body) = h.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "coordinator");

    let (status, body) = h.get("/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["components"]["store"]["status"], "ok");
}

#[tokio::test]
async fn test_placement_returns_operation_id() {
    let h = ApiHarness::new().await;
    let (status, body) = h
        .post(
            "/v1/placements",
            json!({
                "kind": "instance",
                "name": "web",
                "requirements": { "cpu_millis": 500, "memory_bytes": 1073741824 },
                "start": true
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["member_name"], "m1");
    assert_eq!(body["power_state"], "running");

    let op_id = body["operation_id"].as_str().unwrap();
    let (_, op) = h.get(&format!("/v1/operations/{op_id}")).await;
    assert_eq!(op["status"], "succeeded");
    assert_eq!(op["kind"], "placement");

    let (status, list) = h.get("/v1/resources?member=m1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_errors_are_problem_json() {
    let h = ApiHarness::new().await;
    let resp = h
        .client
        .post(h.url("/v1/placements"))
        .header("x-request-id", "req_test")
        .json(&json!({ "kind": "instance", "name": "web", "target": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        resp.headers()["content-type"],
        "application/problem+json"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "member_not_found");
    assert_eq!(body["request_id"], "req_test");
    assert_eq!(body["retryable"], false);

    let (status, body) = h
        .client
        .put(h.url("/v1/members/m1/groups"))
        .json(&json!({ "groups": ["missing"] }))
        .send()
        .await
        .map(|r| (r.status(), r))
        .unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body: Value = body.json().await.unwrap();
    assert_eq!(body["code"], "unknown_group");
}

#[tokio::test]
async fn test_join_flow() {
    let h = ApiHarness::new().await;
    let (status, issued) = h
        .post("/v1/cluster/tokens", json!({ "server_name": "m2" }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{issued}");
    assert!(issued["operation_id"].is_string());
    let token = issued["encoded"].as_str().unwrap().to_string();

    let (_, tokens) = h.get("/v1/cluster/tokens").await;
    assert_eq!(tokens["items"][0]["server_name"], "m2");

    let join = json!({
        "token": token,
        "address": "10.0.0.2:8443",
        "fingerprint": "f2",
        "capacity": { "cpu_millis": 2000, "memory_bytes": 4294967296u64 }
    });
    let (status, grant) = h.post("/v1/cluster/join", join.clone()).await;
    assert_eq!(status, StatusCode::OK, "{grant}");
    assert_eq!(grant["name"], "m2");
    assert_eq!(grant["cluster_fingerprint"], "ab12cd34");
    assert!(grant["operation_id"].is_string());

    let (status, again) = h.post("/v1/cluster/join", join).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(again["code"], "invalid_token");

    let (status, member) = h.get("/v1/members/m2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(member["status"], "online");
}

#[tokio::test]
async fn test_evacuate_and_restore_are_asynchronous() {
    let h = ApiHarness::new().await;
    let (status, _) = h
        .post(
            "/v1/placements",
            json!({ "kind": "instance", "name": "web", "target": "m1", "start": true }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, accepted) = h
        .post("/v1/members/m1/evacuate", json!({ "mode": "stop" }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["kind"], "evacuate");
    let op = h
        .wait_operation(accepted["operation_id"].as_str().unwrap())
        .await;
    assert_eq!(op["status"], "succeeded", "{op}");
    assert_eq!(op["result"]["status"], "evacuated");
    assert_eq!(op["result"]["succeeded"], 1);

    let (_, member) = h.get("/v1/members/m1").await;
    assert_eq!(member["status"], "evacuated");

    let (status, accepted) = h.post("/v1/members/m1/restore", json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let op = h
        .wait_operation(accepted["operation_id"].as_str().unwrap())
        .await;
    assert_eq!(op["status"], "succeeded", "{op}");
    assert_eq!(op["result"]["resumed"], 1);

    let (_, member) = h.get("/v1/members/m1").await;
    assert_eq!(member["status"], "online");
}

#[tokio::test]
async fn test_evacuate_defaults_to_auto_mode() {
    let h = ApiHarness::new().await;
    let (status, placed) = h
        .post(
            "/v1/placements",
            json!({
                "kind": "instance",
                "name": "license",
                "target": "m1",
                "start": true,
                "evacuate_policy": "stop"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{placed}");

    let (status, accepted) = h.post("/v1/members/m1/evacuate", json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let op = h
        .wait_operation(accepted["operation_id"].as_str().unwrap())
        .await;
    assert_eq!(op["status"], "succeeded", "{op}");
    assert_eq!(op["result"]["mode"], "auto");
    assert_eq!(op["result"]["outcomes"][0]["action"], "stopped");
    assert!(op["result"]["outcomes"][0].get("detail").is_none());
}

#[tokio::test]
async fn test_evacuate_unknown_member() {
    let h = ApiHarness::new().await;
    let (status, body) = h
        .post("/v1/members/m9/evacuate", json!({ "mode": "stop" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "member_not_found");
}
