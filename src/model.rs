//! Registry data model: the durable records and their key families.
//!
//! The discovery reconciler owns the structural fields of
//! [`ApplicationRecord`]; the lease manager owns [`LeaseRecord`] items; the
//! orchestrator appends [`OperationLogEntry`] items. All records live in one
//! store, separated by key prefix.

use serde::{Deserialize, Serialize};

/* ============================= KEY FAMILIES ============================= */

pub const APP_PREFIX: &str = "APP#";
pub const LEASE_PREFIX: &str = "LOCK#DB#";
pub const SCHEDULE_PREFIX: &str = "SCHED#";
pub const OPLOG_PREFIX: &str = "OPLOG#";
pub const COST_PREFIX: &str = "COST#";

pub fn app_key(app_name: &str) -> String {
    format!("{APP_PREFIX}{app_name}")
}

pub fn lease_key(resource_id: &str) -> String {
    format!("{LEASE_PREFIX}{resource_id}")
}

pub fn schedule_key(app_name: &str) -> String {
    format!("{SCHEDULE_PREFIX}{app_name}")
}

pub fn oplog_key(app_name: &str, epoch_millis: i64) -> String {
    format!("{OPLOG_PREFIX}{app_name}#{epoch_millis}")
}

pub fn cost_latest_key(app_name: &str) -> String {
    format!("{COST_PREFIX}{app_name}#latest")
}

/* ============================= APPLICATION ============================= */

/// Node pool bound to an application, with the scaling defaults restored on
/// start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolSpec {
    pub name: String,
    pub default_desired: i32,
    pub default_min: i32,
    pub default_max: i32,
}

/// Connection reference to an external database VM.
///
/// `instance_id` is required for lifecycle actions; without it the database
/// is opaque and start/stop must refuse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbRef {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// A resource referenced by more than one application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedResource {
    pub identifier: String,
    pub linked_apps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedResources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postgres: Vec<SharedResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub neo4j: Vec<SharedResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_pool: Vec<SharedResource>,
}

impl SharedResources {
    pub fn is_empty(&self) -> bool {
        self.postgres.is_empty() && self.neo4j.is_empty() && self.node_pool.is_empty()
    }

    /// Sharing entry for a database instance, if any.
    pub fn db_entry(&self, kind: DbKind, identifier: &str) -> Option<&SharedResource> {
        let list = match kind {
            DbKind::Postgres => &self.postgres,
            DbKind::Neo4j => &self.neo4j,
        };
        list.iter().find(|s| s.identifier == identifier)
    }
}

/// Databases attached to an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Databases {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<DbRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neo4j: Option<DbRef>,
}

impl Databases {
    pub fn get(&self, kind: DbKind) -> Option<&DbRef> {
        match kind {
            DbKind::Postgres => self.postgres.as_ref(),
            DbKind::Neo4j => self.neo4j.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Postgres,
    Neo4j,
}

impl DbKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Neo4j => "neo4j",
        }
    }
}

impl std::fmt::Display for DbKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable projection of one application, keyed by its canonical hostname.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub app_name: String,
    pub namespace: String,
    pub hostnames: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pool: Option<NodePoolSpec>,
    #[serde(default)]
    pub databases: Databases,
    #[serde(default, skip_serializing_if = "SharedResources::is_empty")]
    pub shared_resources: SharedResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
    pub last_discovered_at: i64,
}

impl ApplicationRecord {
    /// Check the structural invariants: non-empty hostnames containing the
    /// app name itself.
    pub fn validate(&self) -> Result<(), String> {
        if self.hostnames.is_empty() {
            return Err(format!("app {}: hostnames must not be empty", self.app_name));
        }
        if !self.hostnames.iter().any(|h| h == &self.app_name) {
            return Err(format!(
                "app {}: app_name must appear in hostnames",
                self.app_name
            ));
        }
        Ok(())
    }

    pub fn primary_hostname(&self) -> &str {
        self.hostnames.first().map(String::as_str).unwrap_or(&self.app_name)
    }
}

/* ============================= LEASE ============================= */

/// A TTL-bounded exclusive claim on a shared resource, fenced by owner id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner_id: String,
    pub resource_identifier: String,
    pub lock_type: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl LeaseRecord {
    pub fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

/* ============================= SCHEDULE ============================= */

/// Per-app opt-in flag for the global schedule. Times come from config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub enabled: bool,
}

/* ============================= OPERATION LOG ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationSource {
    User,
    Scheduler,
}

/// Append-only trace of one lifecycle operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub app: String,
    pub action: String,
    pub source: OperationSource,
    pub started_at: i64,
    pub finished_at: i64,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Epoch seconds after which the store may expire this entry.
    pub expires_at: i64,
}

/* ============================= COST ============================= */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub node_pool: f64,
    pub db_compute: f64,
    pub db_storage: f64,
    pub network: f64,
}

/// Last known daily cost figures for an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub app: String,
    pub date: String,
    pub daily_cost: f64,
    pub yesterday_cost: f64,
    pub projected_monthly_cost: f64,
    pub breakdown: CostBreakdown,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn record(app: &str, hosts: &[&str]) -> ApplicationRecord {
        ApplicationRecord {
            app_name: app.to_string(),
            namespace: "default".to_string(),
            hostnames: hosts.iter().map(|h| h.to_string()).collect(),
            last_discovered_at: 1_700_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_key_families_are_disjoint_prefixes() {
        let keys = [
            app_key("shop.example.com"),
            lease_key("i-0abc"),
            schedule_key("shop.example.com"),
            oplog_key("shop.example.com", 1),
            cost_latest_key("shop.example.com"),
        ];
        for (i, a) in keys.iter().enumerate() {
            for (j, b) in keys.iter().enumerate() {
                if i != j {
                    assert!(!a.starts_with(b), "{a} must not extend {b}");
                }
            }
        }
    }

    #[test]
    fn test_lease_key_uses_db_lock_family() {
        assert_eq!(lease_key("i-0abc123"), "LOCK#DB#i-0abc123");
    }

    #[test]
    fn test_validate_rejects_empty_hostnames() {
        let rec = record("shop.example.com", &[]);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_validate_requires_app_name_in_hostnames() {
        let rec = record("shop.example.com", &["www.example.com"]);
        assert!(rec.validate().is_err());

        let rec = record("shop.example.com", &["shop.example.com", "www.example.com"]);
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn test_primary_hostname_is_first() {
        let rec = record("shop.example.com", &["shop.example.com", "alt.example.com"]);
        assert_eq!(rec.primary_hostname(), "shop.example.com");
    }

    #[test]
    fn test_lease_liveness_boundary() {
        let lease = LeaseRecord {
            owner_id: "o-1".to_string(),
            resource_identifier: "i-0abc".to_string(),
            lock_type: "db_stop".to_string(),
            created_at: 100,
            expires_at: 160,
        };
        assert!(lease.is_live(159));
        assert!(!lease.is_live(160));
        assert!(!lease.is_live(200));
    }

    #[test]
    fn test_db_ref_without_instance_id_roundtrips() {
        let db = DbRef {
            host: "10.0.1.5".to_string(),
            port: 5432,
            database: Some("shop".to_string()),
            user: Some("app".to_string()),
            instance_id: None,
        };
        let json = serde_json::to_value(&db).unwrap();
        assert!(json.get("instance_id").is_none());
        let back: DbRef = serde_json::from_value(json).unwrap();
        assert_eq!(back, db);
    }

    #[test]
    fn test_shared_resources_db_entry_lookup() {
        let shared = SharedResources {
            postgres: vec![SharedResource {
                identifier: "i-1".to_string(),
                linked_apps: vec!["a".to_string(), "b".to_string()],
            }],
            ..Default::default()
        };
        assert!(shared.db_entry(DbKind::Postgres, "i-1").is_some());
        assert!(shared.db_entry(DbKind::Neo4j, "i-1").is_none());
        assert!(shared.db_entry(DbKind::Postgres, "i-2").is_none());
    }

    #[test]
    fn test_application_record_roundtrip() {
        let mut rec = record("shop.example.com", &["shop.example.com"]);
        rec.node_pool = Some(NodePoolSpec {
            name: "np-shop".to_string(),
            default_desired: 2,
            default_min: 1,
            default_max: 4,
        });
        rec.databases.postgres = Some(DbRef {
            host: "10.0.1.5".to_string(),
            port: 5432,
            instance_id: Some("i-0abc".to_string()),
            ..Default::default()
        });

        let json = serde_json::to_string(&rec).unwrap();
        let back: ApplicationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
