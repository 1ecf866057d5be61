//! Global schedule evaluation.
//!
//! One schedule (times, weekdays, weekend behavior) applies to every app
//! that opted in. The decision is a pure function of the configured schedule
//! and the current instant; the evaluator then checks live status before
//! submitting anything, which keeps a boundary from firing twice.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use tracing::{info, warn};

use crate::config::{GlobalSchedule, parse_wall_clock};
use crate::error::OpsResult;
use crate::model::{
    APP_PREFIX, ApplicationRecord, OperationSource, ScheduleRecord, schedule_key,
};
use crate::orchestrator::Orchestrator;
use crate::status::{HttpStatus, StatusAggregator};
use crate::store::{Store, get_typed};

/// Width of the action window after a boundary; matches the tick interval so
/// each boundary is seen exactly once.
const WINDOW_MINUTES: u32 = 5;

/* ============================= DECISION ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntendedAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub action: IntendedAction,
    pub reason: &'static str,
}

/// What the schedule wants at `now`, if anything.
pub fn intended_action(schedule: &GlobalSchedule, now: DateTime<Utc>) -> Option<Intent> {
    let offset = schedule.offset().ok()?;
    let local = now.with_timezone(&offset);
    let weekday = local.weekday();

    if matches!(weekday, Weekday::Sat | Weekday::Sun) {
        return schedule.weekend_shutdown.then_some(Intent {
            action: IntendedAction::Stop,
            reason: "weekend shutdown window",
        });
    }

    let minute_of_day = local.hour() * 60 + local.minute();

    if weekday_listed(&schedule.weekdays_start, weekday)
        && in_window(&schedule.start_time, minute_of_day)
    {
        return Some(Intent {
            action: IntendedAction::Start,
            reason: "scheduled ON time reached",
        });
    }

    if weekday_listed(&schedule.weekdays_stop, weekday)
        && in_window(&schedule.stop_time, minute_of_day)
    {
        return Some(Intent {
            action: IntendedAction::Stop,
            reason: "scheduled OFF time reached",
        });
    }

    None
}

fn weekday_listed(days: &[String], weekday: Weekday) -> bool {
    days.iter()
        .any(|d| Weekday::from_str(d).is_ok_and(|parsed| parsed == weekday))
}

/// Within `[boundary, boundary + window)` on the same day.
fn in_window(boundary: &str, minute_of_day: u32) -> bool {
    let Some((hour, minute)) = parse_wall_clock(boundary) else {
        return false;
    };
    let start = hour * 60 + minute;
    minute_of_day >= start && minute_of_day < start + WINDOW_MINUTES
}

/* ============================= EVALUATOR ============================= */

#[derive(Debug, Default)]
pub struct TickReport {
    pub considered: usize,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub skipped: usize,
}

pub struct ScheduleEvaluator {
    store: Arc<dyn Store>,
    status: Arc<StatusAggregator>,
    orchestrator: Arc<Orchestrator>,
    schedule: GlobalSchedule,
}

impl ScheduleEvaluator {
    pub fn new(
        store: Arc<dyn Store>,
        status: Arc<StatusAggregator>,
        orchestrator: Arc<Orchestrator>,
        schedule: GlobalSchedule,
    ) -> Self {
        Self { store, status, orchestrator, schedule }
    }

    /// One tick: decide, then act on every enabled app whose live status
    /// does not already match the intent.
    pub async fn evaluate_tick(&self, now: DateTime<Utc>) -> OpsResult<TickReport> {
        let mut report = TickReport::default();

        let Some(intent) = intended_action(&self.schedule, now) else {
            return Ok(report);
        };

        let apps = self.store.scan_prefix(APP_PREFIX).await?;
        for (_, doc) in apps {
            let record: ApplicationRecord = match serde_json::from_value(doc) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "registry_record_malformed");
                    continue;
                }
            };

            let enabled = get_typed::<ScheduleRecord>(
                self.store.as_ref(),
                &schedule_key(&record.app_name),
            )
            .await?
            .map(|s| s.enabled)
            .unwrap_or(false);
            if !enabled {
                continue;
            }
            report.considered += 1;

            let quick = self
                .status
                .quick_status_for_host(&record.app_name, record.primary_hostname())
                .await;

            // UNKNOWN counts as UP here: an unreachable app still gets its
            // scheduled stop, and a flapping one gets its scheduled start.
            match intent.action {
                IntendedAction::Start if quick.status != HttpStatus::Up => {
                    info!(app = %record.app_name, reason = intent.reason, "scheduler_start");
                    match self
                        .orchestrator
                        .start_app(
                            &record.app_name,
                            false,
                            OperationSource::Scheduler,
                            Some(intent.reason.to_string()),
                        )
                        .await
                    {
                        Ok(_) => report.started.push(record.app_name.clone()),
                        Err(e) => warn!(app = %record.app_name, error = %e, "scheduler_start_failed"),
                    }
                }
                IntendedAction::Stop if quick.status != HttpStatus::Down => {
                    info!(app = %record.app_name, reason = intent.reason, "scheduler_stop");
                    match self
                        .orchestrator
                        .stop_app(
                            &record.app_name,
                            OperationSource::Scheduler,
                            Some(intent.reason.to_string()),
                        )
                        .await
                    {
                        Ok(_) => report.stopped.push(record.app_name.clone()),
                        Err(e) => warn!(app = %record.app_name, error = %e, "scheduler_stop_failed"),
                    }
                }
                _ => report.skipped += 1,
            }
        }

        Ok(report)
    }
}

/* ============================= TESTS ============================= */
