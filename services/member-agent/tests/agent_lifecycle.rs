//! Member agent against an in-process coordinator.

use std::collections::HashMap;
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
use drover_events::MemberStatus;
use drover_member_agent::{
    client::Capacity, config::Config, ensure_joined, heartbeat::run_heartbeat_loop, Admission,
    CoordinatorClient,
};
use tokio::net::TcpListener;
use tokio::sync::watch;

async fn start_coordinator() -> (Cluster, String) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
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

    let app = api::create_router(AppState::new(cluster.clone(), "m1"));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (cluster, format!("http://{addr}"))
}

fn agent_config(url: &str, token: Option<&str>) -> Config {
    let mut vars = HashMap::from([
        ("DROVER_AGENT_COORDINATOR_URL", url.to_string()),
        ("DROVER_AGENT_MEMBER_NAME", "m2".to_string()),
        ("DROVER_AGENT_ADDRESS", "10.0.0.2:8443".to_string()),
        ("DROVER_AGENT_FINGERPRINT", "f2".to_string()),
        ("DROVER_AGENT_CPU_MILLIS", "2000".to_string()),
    ]);
    if let Some(token) = token {
        vars.insert("DROVER_AGENT_JOIN_TOKEN", token.to_string());
    }
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

#[tokio::test]
async fn test_join_then_restart_reuses_membership() {
    let (cluster, url) = start_coordinator().await;
    let issued = cluster.join().issue_token("m1", "m2", None).await.unwrap();

    let config = agent_config(&url, Some(&issued.encoded));
    let client = CoordinatorClient::new(&config).unwrap();
    let admission = ensure_joined(&client, &config).await.unwrap();
    assert_eq!(
        admission,
        Admission::Joined {
            name: "m2".to_string(),
            cluster_fingerprint: "ab12cd34".to_string(),
        }
    );

    let m2 = cluster.membership().get_by_name("m2").await.unwrap();
    assert_eq!(m2.status, MemberStatus::Online);
    assert_eq!(m2.capacity.cpu_millis, 2000);

    // A restarted agent still has the consumed token configured.
    let admission = ensure_joined(&client, &config).await.unwrap();
    assert_eq!(
        admission,
        Admission::Existing {
            name: "m2".to_string()
        }
    );
}

#[tokio::test]
async fn test_unregistered_without_token_fails() {
    let (_cluster, url) = start_coordinator().await;
    let config = agent_config(&url, None);
    let client = CoordinatorClient::new(&config).unwrap();
    assert!(ensure_joined(&client, &config).await.is_err());
}

#[tokio::test]
async fn test_bad_token_is_rejected() {
    let (cluster, url) = start_coordinator().await;
    let config = agent_config(&url, Some("not-a-token"));
    let client = CoordinatorClient::new(&config).unwrap();
    assert!(ensure_joined(&client, &config).await.is_err());
    assert!(cluster.membership().get_by_name("m2").await.is_err());
}

#[tokio::test]
async fn test_heartbeats_until_shutdown() {
    let (cluster, url) = start_coordinator().await;
    let issued = cluster.join().issue_token("m1", "m2", None).await.unwrap();
    let config = agent_config(&url, Some(&issued.encoded));
    let client = CoordinatorClient::new(&config).unwrap();
    ensure_joined(&client, &config).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_heartbeat_loop(
        client,
        "m2".to_string(),
        Capacity {
            cpu_millis: 3000,
            memory_bytes: 4 << 30,
        },
        Duration::from_millis(20),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let m2 = cluster.membership().get_by_name("m2").await.unwrap();
    assert!(m2.last_heartbeat.is_some());
    assert_eq!(m2.capacity.cpu_millis, 3000);
    assert_eq!(m2.status, MemberStatus::Online);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let m2 = cluster.membership().get_by_name("m2").await.unwrap();
    assert_eq!(m2.status, MemberStatus::Offline);
}
