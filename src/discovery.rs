//! Discovery reconciler: projects cluster ingress, app ConfigMaps, and
//! tagged VM instances into the application registry.
//!
//! The scan is strictly additive — it overwrites records it re-discovers and
//! never deletes what a previous run wrote. Per-app failures are logged and
//! skipped so one broken namespace cannot abort the sweep.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::OpsResult;
use crate::model::{
    ApplicationRecord, Databases, DbRef, NodePoolSpec, SharedResource, SharedResources, app_key,
};
use crate::probes::{ClusterTopologyProbe, IngressView, InstanceProbe, TaggedInstance};
use crate::store::{Store, put_typed};

const APP_CONFIG_MAP: &str = "common-config";

/* ============================= SUMMARY ============================= */

#[derive(Debug, Default)]
pub struct ScanSummary {
    pub apps_seen: usize,
    pub apps_written: usize,
    pub shared_databases: usize,
    pub failures: Vec<(String, String)>,
}

/* ============================= RECONCILER ============================= */

pub struct DiscoveryReconciler {
    store: Arc<dyn Store>,
    topology: Arc<dyn ClusterTopologyProbe>,
    instances: Arc<dyn InstanceProbe>,
    settings: Settings,
}

/// Intermediate projection of one app before shared-resource annotation.
#[derive(Debug, Clone)]
struct AppDraft {
    app_name: String,
    namespace: String,
    hostnames: Vec<String>,
    tls_secret: Option<String>,
    node_pool: Option<NodePoolSpec>,
    databases: Databases,
}

impl DiscoveryReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        topology: Arc<dyn ClusterTopologyProbe>,
        instances: Arc<dyn InstanceProbe>,
        settings: Settings,
    ) -> Self {
        Self { store, topology, instances, settings }
    }

    pub async fn run_scan(&self) -> OpsResult<ScanSummary> {
        let started = std::time::Instant::now();
        let ingresses = self.topology.list_ingresses().await?;

        // One tag sweep serves every app; a failed sweep degrades resolution
        // but does not abort discovery.
        let tagged = match self.instances.find_tagged(&self.settings.tags).await {
            Ok(tagged) => tagged,
            Err(e) => {
                warn!(error = %e, "tag_scan_failed");
                Vec::new()
            }
        };

        let mut drafts = group_ingresses(&ingresses);
        let mut summary = ScanSummary { apps_seen: drafts.len(), ..Default::default() };

        for draft in &mut drafts {
            // Authoritative tables win over anything discovered
            if let Some(ns) = self.settings.namespace_overrides.get(&draft.app_name) {
                draft.namespace = ns.clone();
            }
            draft.node_pool = match self.settings.node_pool_defaults.get(&draft.app_name) {
                Some(Some(pd)) => Some(NodePoolSpec {
                    name: pd.name.clone(),
                    default_desired: pd.desired,
                    default_min: pd.min,
                    default_max: pd.max,
                }),
                // Explicit null: the app runs on shared capacity, no pool
                Some(None) | None => None,
            };

            match self
                .topology
                .get_config_map(&draft.namespace, APP_CONFIG_MAP)
                .await
            {
                Ok(Some(data)) => draft.databases = parse_db_refs(&data),
                Ok(None) => {}
                Err(e) => {
                    warn!(app = %draft.app_name, error = %e, "config_map_read_failed");
                    summary.failures.push((draft.app_name.clone(), e.to_string()));
                }
            }

            resolve_instance_ids(draft, &tagged);
            attach_tagged_databases(draft, &tagged);
        }

        let shared = compute_shared(&drafts, &tagged);
        summary.shared_databases = shared.postgres.len() + shared.neo4j.len();

        let now = Utc::now().timestamp();
        for draft in drafts {
            let record = ApplicationRecord {
                shared_resources: shared_for(&shared, &draft),
                app_name: draft.app_name.clone(),
                namespace: draft.namespace,
                hostnames: draft.hostnames,
                node_pool: draft.node_pool,
                databases: draft.databases,
                tls_secret: draft.tls_secret,
                last_discovered_at: now,
            };

            if let Err(e) = record.validate() {
                warn!(app = %record.app_name, error = %e, "discovered_record_invalid");
                summary.failures.push((record.app_name.clone(), e));
                continue;
            }

            match put_typed(self.store.as_ref(), &app_key(&record.app_name), &record, None).await
            {
                Ok(()) => summary.apps_written += 1,
                Err(e) => {
                    warn!(app = %record.app_name, error = %e, "registry_write_failed");
                    summary.failures.push((record.app_name, e.to_string()));
                }
            }
        }

        info!(
            apps = summary.apps_seen,
            written = summary.apps_written,
            shared_dbs = summary.shared_databases,
            failures = summary.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "discovery_scan_done"
        );
        Ok(summary)
    }
}

/* ============================= PROJECTION ============================= */

/// Group ingresses into app drafts: the first host of the first ingress
/// naming it is the canonical app name; later ingresses merge their hosts
/// with stable order and no duplicates.
fn group_ingresses(ingresses: &[IngressView]) -> Vec<AppDraft> {
    let mut order: Vec<String> = Vec::new();
    let mut by_app: BTreeMap<String, AppDraft> = BTreeMap::new();

    for ing in ingresses {
        let Some(first_host) = ing.hosts.first() else { continue };

        let draft = by_app.entry(first_host.clone()).or_insert_with(|| {
            order.push(first_host.clone());
            AppDraft {
                app_name: first_host.clone(),
                namespace: ing.namespace.clone(),
                hostnames: Vec::new(),
                tls_secret: None,
                node_pool: None,
                databases: Databases::default(),
            }
        });

        for host in &ing.hosts {
            if !draft.hostnames.contains(host) {
                draft.hostnames.push(host.clone());
            }
        }
        if draft.tls_secret.is_none() {
            draft.tls_secret = ing.tls_secret.clone();
        }
    }

    order.into_iter().filter_map(|name| by_app.remove(&name)).collect()
}

/// Connection fields from the app's `common-config` ConfigMap. Legacy key
/// aliases from older chart generations are still recognized.
fn parse_db_refs(data: &BTreeMap<String, String>) -> Databases {
    let lookup = |keys: &[&str]| -> Option<String> {
        keys.iter().find_map(|k| data.get(*k).filter(|v| !v.is_empty()).cloned())
    };

    let postgres = lookup(&["POSTGRES_HOST", "DB_HOST", "DATABASE_HOST"]).map(|host| DbRef {
        host,
        port: lookup(&["POSTGRES_PORT", "DB_PORT"])
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432),
        database: lookup(&["POSTGRES_DB", "DB_NAME"]),
        user: lookup(&["POSTGRES_USER", "DB_USER"]),
        instance_id: None,
    });

    let neo4j = match lookup(&["NEO4J_URI"]) {
        Some(uri) => parse_neo4j_uri(&uri).map(|(host, port)| DbRef {
            host,
            port,
            database: None,
            user: lookup(&["NEO4J_USERNAME", "NEO4J_USER"]),
            instance_id: None,
        }),
        None => lookup(&["NEO4J_HOST"]).map(|host| DbRef {
            host,
            port: lookup(&["NEO4J_PORT"]).and_then(|p| p.parse().ok()).unwrap_or(7687),
            database: None,
            user: lookup(&["NEO4J_USERNAME", "NEO4J_USER"]),
            instance_id: None,
        }),
    };

    Databases { postgres, neo4j }
}

/// `bolt://db.internal:7687` → (`db.internal`, 7687). Scheme-less values are
/// accepted because older configmaps stored bare hosts.
fn parse_neo4j_uri(uri: &str) -> Option<(String, u16)> {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return None;
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((rest.to_string(), 7687)),
    }
}

/// Match configmap hosts against the tag sweep to fill in instance ids.
fn resolve_instance_ids(draft: &mut AppDraft, tagged: &[TaggedInstance]) {
    for db in [&mut draft.databases.postgres, &mut draft.databases.neo4j]
        .into_iter()
        .flatten()
    {
        if db.instance_id.is_some() {
            continue;
        }
        db.instance_id = tagged
            .iter()
            .find(|t| {
                t.private_ip.as_deref() == Some(db.host.as_str())
                    || t.private_dns.as_deref() == Some(db.host.as_str())
            })
            .map(|t| t.instance_id.clone());
    }
}

/// Tagged DB instances claim their apps even without a configmap entry.
fn attach_tagged_databases(draft: &mut AppDraft, tagged: &[TaggedInstance]) {
    for t in tagged {
        if !t.app_names.iter().any(|a| a == &draft.app_name) {
            continue;
        }
        let slot = match t.component.as_deref() {
            Some("postgres") => &mut draft.databases.postgres,
            Some("neo4j") => &mut draft.databases.neo4j,
            _ => continue,
        };
        match slot {
            Some(db) if db.instance_id.is_none() => db.instance_id = Some(t.instance_id.clone()),
            Some(_) => {}
            None => {
                *slot = Some(DbRef {
                    host: t.private_ip.clone().unwrap_or_default(),
                    port: if t.component.as_deref() == Some("postgres") { 5432 } else { 7687 },
                    database: None,
                    user: None,
                    instance_id: Some(t.instance_id.clone()),
                });
            }
        }
    }
}

/// A DB instance referenced by more than one app — or tagged shared — and
/// any node pool claimed by multiple apps, with the full tenant list.
fn compute_shared(drafts: &[AppDraft], tagged: &[TaggedInstance]) -> SharedResources {
    let mut postgres: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut neo4j: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut pools: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for draft in drafts {
        if let Some(id) = draft.databases.postgres.as_ref().and_then(|d| d.instance_id.as_ref()) {
            postgres.entry(id.clone()).or_default().push(draft.app_name.clone());
        }
        if let Some(id) = draft.databases.neo4j.as_ref().and_then(|d| d.instance_id.as_ref()) {
            neo4j.entry(id.clone()).or_default().push(draft.app_name.clone());
        }
        if let Some(pool) = &draft.node_pool {
            pools.entry(pool.name.clone()).or_default().push(draft.app_name.clone());
        }
    }

    // The Shared tag forces shared handling even when only one tenant is
    // currently discoverable; its app list completes the tenant set.
    for t in tagged {
        if !t.shared {
            continue;
        }
        let map = match t.component.as_deref() {
            Some("postgres") => &mut postgres,
            Some("neo4j") => &mut neo4j,
            _ => continue,
        };
        let entry = map.entry(t.instance_id.clone()).or_default();
        for app in &t.app_names {
            if !entry.contains(app) {
                entry.push(app.clone());
            }
        }
    }

    let tagged_shared: Vec<&str> = tagged
        .iter()
        .filter(|t| t.shared)
        .map(|t| t.instance_id.as_str())
        .collect();

    let collect = |map: BTreeMap<String, Vec<String>>| -> Vec<SharedResource> {
        map.into_iter()
            .filter(|(id, apps)| apps.len() > 1 || tagged_shared.contains(&id.as_str()))
            .map(|(identifier, linked_apps)| SharedResource { identifier, linked_apps })
            .collect()
    };

    SharedResources {
        postgres: collect(postgres),
        neo4j: collect(neo4j),
        node_pool: pools
            .into_iter()
            .filter(|(_, apps)| apps.len() > 1)
            .map(|(identifier, linked_apps)| SharedResource { identifier, linked_apps })
            .collect(),
    }
}

/// Restrict the global shared table to entries touching this app.
fn shared_for(shared: &SharedResources, draft: &AppDraft) -> SharedResources {
    let touches = |s: &SharedResource| s.linked_apps.iter().any(|a| a == &draft.app_name);
    SharedResources {
        postgres: shared.postgres.iter().filter(|s| touches(s)).cloned().collect(),
        neo4j: shared.neo4j.iter().filter(|s| touches(s)).cloned().collect(),
        node_pool: shared.node_pool.iter().filter(|s| touches(s)).cloned().collect(),
    }
}

/* ============================= TESTS ============================= */
