//! End-to-end coordination scenarios against the in-memory store.

use std::sync::Arc;

use drover_coordinator::{
    evacuation::EvacuationSettings,
    join::{JoinRequest, JoinSettings},
    membership::{HeartbeatReport, MemberSpec},
    migration::MemoryPeerDirectory,
    network::StaticNetwork,
    operations::CancelToken,
    placement::PlacementRequest,
    runtime::MockRuntime,
    storage::MemoryStorage,
    store::{LiveMigrationProfile, MemoryStore, Resources},
    Cluster, ClusterError, ClusterSettings, Collaborators,
};
use drover_events::{EvacuationMode, MemberStatus, PowerState, ResourceKind};
use drover_id::ResourceId;

const CLUSTER_FP: &str = "ab12cd34";

struct Harness {
    cluster: Cluster,
    runtime: Arc<MockRuntime>,
}

fn harness(evacuation: EvacuationSettings) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,drover_coordinator=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let runtime = Arc::new(MockRuntime::new());
    let collaborators = Collaborators {
        runtime: runtime.clone(),
        storage: Arc::new(MemoryStorage::new()),
        network: Arc::new(StaticNetwork::new()),
        peers: Arc::new(MemoryPeerDirectory::new()),
    };
    let settings = ClusterSettings {
        join: JoinSettings {
            cluster_fingerprint: CLUSTER_FP.to_string(),
            ..JoinSettings::default()
        },
        evacuation,
        ..ClusterSettings::default()
    };
    Harness {
        cluster: Cluster::new(Arc::new(MemoryStore::new()), collaborators, settings),
        runtime,
    }
}

fn spec(name: &str, octet: u8) -> MemberSpec {
    MemberSpec {
        name: name.to_string(),
        address: format!("10.0.0.{octet}:8443"),
        capacity: Resources::new(4000, 8 << 30),
        fingerprint: Some(format!("fp-{name}")),
    }
}

fn instance(name: &str, target: Option<&str>, start: bool) -> PlacementRequest {
    PlacementRequest {
        kind: ResourceKind::Instance,
        name: name.to_string(),
        project: "default".to_string(),
        target: target.map(str::to_string),
        requirements: Resources::new(1000, 1 << 30),
        pool: None,
        size_bytes: 0,
        live_migration: LiveMigrationProfile::default(),
        evacuate_policy: Default::default(),
        start,
    }
}

async fn bootstrapped(evacuation: EvacuationSettings) -> Harness {
    let h = harness(evacuation);
    h.cluster.membership().bootstrap(spec("m1", 1)).await.unwrap();
    h
}

#[tokio::test]
async fn test_racing_redeemers_admit_exactly_one() {
    let h = bootstrapped(EvacuationSettings::default()).await;
    let issued = h.cluster.join().issue_token("m1", "m9", None).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let join = h.cluster.join().clone();
        let token = issued.encoded.clone();
        tasks.push(tokio::spawn(async move {
            join.redeem_token(JoinRequest {
                token,
                address: format!("10.0.1.{}:8443", i + 1),
                fingerprint: format!("cand-{i}"),
                capacity: Resources::new(1000, 1 << 30),
            })
            .await
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(grant) => {
                admitted += 1;
                assert_eq!(grant.name, "m9");
            }
            Err(ClusterError::InvalidToken(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);

    let members = h.cluster.membership().list().await.unwrap();
    assert_eq!(members.iter().filter(|m| m.name == "m9").count(), 1);
}

#[tokio::test]
async fn test_token_redeems_once() {
    let h = bootstrapped(EvacuationSettings::default()).await;
    let issued = h.cluster.join().issue_token("m1", "m2", None).await.unwrap();
    let request = JoinRequest {
        token: issued.encoded.clone(),
        address: "10.0.0.2:8443".to_string(),
        fingerprint: "fp-m2".to_string(),
        capacity: Resources::new(1000, 1 << 30),
    };

    let grant = h.cluster.join().redeem_token(request.clone()).await.unwrap();
    assert_eq!(grant.cluster_fingerprint, CLUSTER_FP);
    assert_eq!(
        h.cluster.membership().get(&grant.member_id).await.unwrap().status,
        MemberStatus::Online
    );

    assert!(matches!(
        h.cluster.join().redeem_token(request).await,
        Err(ClusterError::InvalidToken(_))
    ));
}

#[tokio::test]
async fn test_offline_target_is_never_redirected() {
    let h = bootstrapped(EvacuationSettings::default()).await;
    h.cluster.membership().add_member(spec("m2", 2)).await.unwrap();
    h.cluster
        .membership()
        .heartbeat(
            "m2",
            HeartbeatReport {
                capacity: None,
                shutting_down: true,
            },
        )
        .await
        .unwrap();

    for attempt in 0..3 {
        let err = h
            .cluster
            .placement()
            .place(instance(&format!("web-{attempt}"), Some("m2"), false))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::TargetUnavailable(_)), "{err}");
    }
    assert!(h
        .cluster
        .placement()
        .list_resources(None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_evacuate_and_restore_without_resources() {
    let h = bootstrapped(EvacuationSettings::default()).await;
    let mut events = h.cluster.events().subscribe();

    let report = h
        .cluster
        .orchestrator()
        .evacuate("m1", EvacuationMode::Stop, None, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(report.status, MemberStatus::Evacuated);

    let restored = h
        .cluster
        .orchestrator()
        .restore("m1", None, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(restored.resumed + restored.returned + restored.failed, 0);

    assert_eq!(
        h.cluster.membership().get_by_name("m1").await.unwrap().status,
        MemberStatus::Online
    );
    assert_eq!(h.runtime.attempts(), 0);

    let mut types = Vec::new();
    while let Ok(event) = events.try_recv() {
        types.push(event.event_type);
    }
    assert!(types.iter().all(|t| !t.starts_with("resource.")));
}

#[tokio::test]
async fn test_set_groups_is_idempotent() {
    let h = bootstrapped(EvacuationSettings::default()).await;
    h.cluster
        .membership()
        .create_group("gpu", "GPU hosts")
        .await
        .unwrap();

    let groups = vec!["default".to_string(), "gpu".to_string()];
    let first = h
        .cluster
        .membership()
        .set_groups("m1", groups.clone())
        .await
        .unwrap();
    let revision = h.cluster.store().read().await.unwrap().revision;
    let mut events = h.cluster.events().subscribe();

    let second = h
        .cluster
        .membership()
        .set_groups("m1", groups)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(h.cluster.store().read().await.unwrap().revision, revision);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_group_scoped_placement() {
    let h = bootstrapped(EvacuationSettings::default()).await;
    let membership = h.cluster.membership();
    membership.add_member(spec("m2", 2)).await.unwrap();
    membership.create_group("gpu", "").await.unwrap();
    membership
        .set_groups("m2", vec!["gpu".to_string()])
        .await
        .unwrap();

    let placer = h.cluster.placement();
    let mut request = instance("train", Some("@gpu"), false);
    request.requirements = Resources::ZERO;
    assert_eq!(
        placer.place(request).await.unwrap().member_name.as_deref(),
        Some("m2")
    );

    let mut request = instance("web", Some("@default"), false);
    request.requirements = Resources::ZERO;
    assert_eq!(
        placer.place(request).await.unwrap().member_name.as_deref(),
        Some("m1")
    );

    let mut request = instance("any", None, false);
    request.requirements = Resources::ZERO;
    assert_eq!(
        placer.place(request).await.unwrap().member_name.as_deref(),
        Some("m1")
    );
}

async fn stop_with_one_failure(tolerate_failures: bool) -> (Harness, Vec<ResourceId>) {
    let h = bootstrapped(EvacuationSettings {
        tolerate_failures,
        ..EvacuationSettings::default()
    })
    .await;
    let placer = h.cluster.placement();
    let ok = placer
        .place(instance("ok", Some("m1"), true))
        .await
        .unwrap()
        .resource_id;
    let bad = placer
        .place(instance("bad", Some("m1"), true))
        .await
        .unwrap()
        .resource_id;
    h.runtime.fail_on(bad);
    (h, vec![ok, bad])
}

#[tokio::test]
async fn test_stop_with_one_failure_stays_evacuating() {
    let (h, ids) = stop_with_one_failure(false).await;
    let report = h
        .cluster
        .orchestrator()
        .evacuate("m1", EvacuationMode::Stop, None, &CancelToken::never())
        .await
        .unwrap();

    assert_eq!((report.succeeded, report.failed), (1, 1));
    assert_eq!(report.status, MemberStatus::Evacuating);
    let failed = report.outcomes.iter().find(|o| !o.is_ok()).unwrap();
    assert_eq!(failed.resource_id, ids[1]);
    assert_eq!(
        h.cluster.placement().get_resource(&ids[0]).await.unwrap().power_state,
        PowerState::Stopped
    );
    assert_eq!(
        h.cluster.placement().get_resource(&ids[1]).await.unwrap().power_state,
        PowerState::Running
    );

    // Evacuating members accept another attempt.
    let retry = h
        .cluster
        .orchestrator()
        .evacuate("m1", EvacuationMode::Stop, None, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!((retry.succeeded, retry.failed), (0, 1));
}

#[tokio::test]
async fn test_stop_with_one_failure_tolerated() {
    let (h, _) = stop_with_one_failure(true).await;
    let report = h
        .cluster
        .orchestrator()
        .evacuate("m1", EvacuationMode::Stop, None, &CancelToken::never())
        .await
        .unwrap();

    assert_eq!((report.succeeded, report.failed), (1, 1));
    assert_eq!(report.status, MemberStatus::Evacuated);
    assert_eq!(
        h.cluster.membership().get_by_name("m1").await.unwrap().status,
        MemberStatus::Evacuated
    );
}

#[tokio::test]
async fn test_concurrent_placements_respect_capacity() {
    let h = bootstrapped(EvacuationSettings::default()).await;
    h.cluster.membership().add_member(spec("m2", 2)).await.unwrap();

    // Two members of 4000 millicores fit eight 1000-millicore instances.
    let mut tasks = Vec::new();
    for i in 0..12 {
        let placer = h.cluster.placement().clone();
        tasks.push(tokio::spawn(async move {
            placer.place(instance(&format!("w{i}"), None, false)).await
        }));
    }

    let mut placed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => placed += 1,
            Err(ClusterError::NoEligibleMembers(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(placed, 8);

    for member in h.cluster.membership().list().await.unwrap() {
        assert!(member.load.fits_within(&member.capacity), "{} overcommitted", member.name);
        assert_eq!(member.resource_count, 4);
    }
    let resources = h.cluster.placement().list_resources(None).await.unwrap();
    let mut names: Vec<_> = resources.iter().map(|r| r.name.clone()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 8);
}

#[tokio::test]
async fn test_remove_requires_evacuation() {
    let h = bootstrapped(EvacuationSettings::default()).await;
    h.cluster.membership().add_member(spec("m2", 2)).await.unwrap();
    let placed = h
        .cluster
        .placement()
        .place(instance("web", Some("m2"), false))
        .await
        .unwrap();

    assert!(matches!(
        h.cluster.membership().remove_member("m2").await,
        Err(ClusterError::MemberNotEvacuated(_))
    ));

    h.cluster.placement().release(&placed.resource_id).await.unwrap();
    h.cluster.membership().remove_member("m2").await.unwrap();
    assert!(matches!(
        h.cluster.membership().get_by_name("m2").await,
        Err(ClusterError::MemberNotFound(_))
    ));
}
