//! Settings loaded from a YAML file.
//!
//! Every section has working defaults so a minimal file (or none at all, for
//! local development against the in-memory store) is enough to boot. The
//! namespace-override and node-pool tables are authoritative: whatever
//! discovery finds, these win.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

/* ============================= SECTIONS ============================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSettings {
    pub region: String,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self { region: "eu-west-1".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub name: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self { name: "main".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub table_name: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { table_name: "app-lifecycle-registry".to_string() }
    }
}

/// Tag keys used to attach VM instances and node pools to applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TagSettings {
    pub app_name_key: String,
    pub component_key: String,
    pub shared_key: String,
}

impl Default for TagSettings {
    fn default() -> Self {
        Self {
            app_name_key: "AppName".to_string(),
            component_key: "Component".to_string(),
            shared_key: "Shared".to_string(),
        }
    }
}

/// Background tick intervals, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleIntervals {
    pub discovery: u64,
    pub health: u64,
    pub scheduler: u64,
}

impl Default for ScheduleIntervals {
    fn default() -> Self {
        Self { discovery: 7200, health: 600, scheduler: 300 }
    }
}

impl ScheduleIntervals {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler)
    }
}

/// The single global on/off schedule. Apps opt in via their schedule record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSchedule {
    /// Fixed UTC offset, e.g. `+05:30` or `-08:00`.
    pub timezone: String,
    /// Wall-clock `HH:MM` at which enabled apps are started.
    pub start_time: String,
    /// Wall-clock `HH:MM` at which enabled apps are stopped.
    pub stop_time: String,
    pub weekdays_start: Vec<String>,
    pub weekdays_stop: Vec<String>,
    pub weekend_shutdown: bool,
}

impl Default for GlobalSchedule {
    fn default() -> Self {
        Self {
            timezone: "+05:30".to_string(),
            start_time: "09:00".to_string(),
            stop_time: "19:00".to_string(),
            weekdays_start: ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
            weekdays_stop: ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
            weekend_shutdown: true,
        }
    }
}

impl GlobalSchedule {
    /// Parse the configured offset (`+05:30`) into a chrono offset.
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.timezone)
            .with_context(|| format!("invalid timezone offset: {}", self.timezone))
    }
}

pub fn parse_utc_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => (1, s),
    };
    let (hh, mm) = rest.split_once(':')?;
    let hours: i32 = hh.parse().ok()?;
    let minutes: i32 = mm.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Parse `HH:MM` into hour and minute.
pub fn parse_wall_clock(s: &str) -> Option<(u32, u32)> {
    let (hh, mm) = s.split_once(':')?;
    let hour: u32 = hh.parse().ok()?;
    let minute: u32 = mm.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// Authoritative node-pool defaults for one hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDefaults {
    pub name: String,
    pub desired: i32,
    pub min: i32,
    pub max: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Seconds for the status aggregator's HTTP HEAD.
    pub http_timeout: u64,
    /// Seconds for the quick-status HEAD used by the stop protocol.
    pub quick_timeout: u64,
    /// Overall deadline for one composite status call, in seconds.
    pub aggregator_timeout: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self { http_timeout: 5, quick_timeout: 3, aggregator_timeout: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    pub ttl_seconds: i64,
    pub max_retries: u32,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self { ttl_seconds: 60, max_retries: 3 }
    }
}

/* ============================= ROOT ============================= */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub aws: AwsSettings,
    pub cluster: ClusterSettings,
    pub store: StoreSettings,
    pub tags: TagSettings,
    pub schedules: ScheduleIntervals,
    pub global_schedule: GlobalSchedule,
    /// hostname → namespace; wins over whatever the ingress says.
    pub namespace_overrides: HashMap<String, String>,
    /// hostname → pool defaults; an explicit `null` marks the app poolless.
    pub node_pool_defaults: HashMap<String, Option<PoolDefaults>>,
    pub probe: ProbeSettings,
    pub lease: LeaseSettings,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        settings.global_schedule.offset()?;
        Ok(settings)
    }
}

/* ============================= TESTS ============================= */
