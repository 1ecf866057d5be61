mod common;

use std::sync::Arc;

use common::*;
use kube_lifecycle::config::{PoolDefaults, Settings};
use kube_lifecycle::discovery::DiscoveryReconciler;
use kube_lifecycle::model::ApplicationRecord;
use kube_lifecycle::probes::{InstanceState, TaggedInstance};
use kube_lifecycle::store::{Store, get_typed};

// ══════════════════════════════════════════════════════════════════
// Discovery reconciler integration tests
//
// Ingress + ConfigMap + tag sweep → projected registry records, with
// authoritative config tables and the additivity guarantee.
// ══════════════════════════════════════════════════════════════════

struct DiscoveryEnv {
    env: TestEnv,
    topology: Arc<FakeTopology>,
    reconciler: DiscoveryReconciler,
}

fn discovery_env(settings: Settings) -> DiscoveryEnv {
    let env = test_env();
    let topology = Arc::new(FakeTopology::default());
    let reconciler = DiscoveryReconciler::new(
        env.store.clone(),
        topology.clone(),
        env.instances.clone(),
        settings,
    );
    DiscoveryEnv { env, topology, reconciler }
}

fn tagged_db(id: &str, ip: &str, apps: &[&str], component: &str, shared: bool) -> TaggedInstance {
    TaggedInstance {
        instance_id: id.to_string(),
        private_ip: Some(ip.to_string()),
        private_dns: None,
        app_names: apps.iter().map(|a| a.to_string()).collect(),
        component: Some(component.to_string()),
        shared,
        state: InstanceState::Running,
    }
}

async fn read_app(env: &TestEnv, name: &str) -> Option<ApplicationRecord> {
    let store: &dyn Store = env.store.as_ref();
    get_typed(store, &kube_lifecycle::model::app_key(name))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_scan_projects_ingress_and_configmap() {
    let d = discovery_env(Settings::default());
    d.topology
        .add_ingress("shop", &["shop.example.com", "www.shop.example.com"])
        .await;
    d.topology
        .add_config_map(
            "shop",
            "common-config",
            &[
                ("POSTGRES_HOST", "10.0.1.5"),
                ("POSTGRES_PORT", "5432"),
                ("POSTGRES_DB", "shop"),
            ],
        )
        .await;
    d.env
        .instances
        .tagged
        .lock()
        .await
        .push(tagged_db("i-pg", "10.0.1.5", &["shop.example.com"], "postgres", false));

    let summary = d.reconciler.run_scan().await.unwrap();
    assert_eq!(summary.apps_seen, 1);
    assert_eq!(summary.apps_written, 1);
    assert!(summary.failures.is_empty());

    let record = read_app(&d.env, "shop.example.com").await.unwrap();
    assert_eq!(record.namespace, "shop");
    assert_eq!(record.hostnames.len(), 2);
    let pg = record.databases.postgres.unwrap();
    assert_eq!(pg.host, "10.0.1.5");
    assert_eq!(pg.instance_id.as_deref(), Some("i-pg"));
    assert!(record.node_pool.is_none());
}

#[tokio::test]
async fn test_authoritative_tables_win() {
    let mut settings = Settings::default();
    settings
        .namespace_overrides
        .insert("shop.example.com".to_string(), "shop-prod".to_string());
    settings.node_pool_defaults.insert(
        "shop.example.com".to_string(),
        Some(PoolDefaults { name: "np-shop".to_string(), desired: 2, min: 1, max: 4 }),
    );

    let d = discovery_env(settings);
    d.topology
        .add_ingress("wrong-namespace", &["shop.example.com"])
        .await;

    d.reconciler.run_scan().await.unwrap();

    let record = read_app(&d.env, "shop.example.com").await.unwrap();
    assert_eq!(record.namespace, "shop-prod");
    let pool = record.node_pool.unwrap();
    assert_eq!(pool.name, "np-shop");
    assert_eq!(pool.default_desired, 2);
    assert_eq!(pool.default_max, 4);
}

#[tokio::test]
async fn test_shared_db_annotated_on_all_tenants() {
    let d = discovery_env(Settings::default());
    d.topology.add_ingress("a-ns", &["a.example.com"]).await;
    d.topology.add_ingress("b-ns", &["b.example.com"]).await;
    for ns in ["a-ns", "b-ns"] {
        d.topology
            .add_config_map(ns, "common-config", &[("POSTGRES_HOST", "10.0.1.5")])
            .await;
    }
    d.env.instances.tagged.lock().await.push(tagged_db(
        "i-shared",
        "10.0.1.5",
        &["a.example.com", "b.example.com"],
        "postgres",
        true,
    ));

    let summary = d.reconciler.run_scan().await.unwrap();
    assert_eq!(summary.shared_databases, 1);

    for app in ["a.example.com", "b.example.com"] {
        let record = read_app(&d.env, app).await.unwrap();
        let entry = &record.shared_resources.postgres[0];
        assert_eq!(entry.identifier, "i-shared");
        assert!(entry.linked_apps.contains(&"a.example.com".to_string()));
        assert!(entry.linked_apps.contains(&"b.example.com".to_string()));
    }
}

#[tokio::test]
async fn test_scan_is_additive() {
    let d = discovery_env(Settings::default());

    // An app registered by an earlier run, whose ingress has since vanished
    let old = app_record("retired.example.com", "retired");
    seed_app(&d.env, &old).await;

    d.topology.add_ingress("live", &["live.example.com"]).await;
    d.reconciler.run_scan().await.unwrap();

    // The stale record is still there, the new one was added
    assert!(read_app(&d.env, "retired.example.com").await.is_some());
    assert!(read_app(&d.env, "live.example.com").await.is_some());
}

#[tokio::test]
async fn test_rescan_overwrites_with_fresh_projection() {
    let d = discovery_env(Settings::default());
    d.topology.add_ingress("shop", &["shop.example.com"]).await;

    d.reconciler.run_scan().await.unwrap();
    let first = read_app(&d.env, "shop.example.com").await.unwrap();
    assert!(first.databases.postgres.is_none());

    // The configmap appears between runs
    d.topology
        .add_config_map("shop", "common-config", &[("POSTGRES_HOST", "10.0.1.5")])
        .await;
    d.reconciler.run_scan().await.unwrap();

    let second = read_app(&d.env, "shop.example.com").await.unwrap();
    assert_eq!(second.databases.postgres.unwrap().host, "10.0.1.5");
}

#[tokio::test]
async fn test_tagged_db_attaches_without_configmap() {
    let d = discovery_env(Settings::default());
    d.topology.add_ingress("graph", &["graph.example.com"]).await;
    d.env.instances.tagged.lock().await.push(tagged_db(
        "i-neo",
        "10.0.2.2",
        &["graph.example.com"],
        "neo4j",
        false,
    ));

    d.reconciler.run_scan().await.unwrap();

    let record = read_app(&d.env, "graph.example.com").await.unwrap();
    let neo = record.databases.neo4j.unwrap();
    assert_eq!(neo.instance_id.as_deref(), Some("i-neo"));
    assert_eq!(neo.host, "10.0.2.2");
    assert_eq!(neo.port, 7687);
}

#[tokio::test]
async fn test_empty_cluster_yields_empty_scan() {
    let d = discovery_env(Settings::default());
    let summary = d.reconciler.run_scan().await.unwrap();
    assert_eq!(summary.apps_seen, 0);
    assert_eq!(summary.apps_written, 0);
}
