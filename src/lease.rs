//! Distributed lease manager over the registry store.
//!
//! A lease is one conditionally-written item under the `LOCK#DB#` key
//! family. Acquire succeeds only when no live lease exists (absent, or
//! `expires_at` already passed — expired leases are stolen atomically).
//! Release is fenced by owner id and never removes another owner's lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};

use crate::error::{OpsError, OpsResult};
use crate::model::{LeaseRecord, lease_key};
use crate::store::{Store, WriteCondition, put_typed};

const LOCK_TYPE_DB_STOP: &str = "db_stop";
const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_JITTER_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { lease_key: String, acquired_at: i64 },
    NotAcquired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotOwner,
    NotFound,
}

pub struct LeaseManager {
    store: Arc<dyn Store>,
    max_retries: u32,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Fresh owner id for one protocol run.
    pub fn generate_owner_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Try to acquire the lease for `resource_id`, retrying lost races with
    /// exponential backoff and jitter.
    pub async fn acquire(
        &self,
        resource_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> OpsResult<AcquireOutcome> {
        let key = lease_key(resource_id);

        for attempt in 0..self.max_retries {
            let now = Utc::now().timestamp();
            let lease = LeaseRecord {
                owner_id: owner_id.to_string(),
                resource_identifier: resource_id.to_string(),
                lock_type: LOCK_TYPE_DB_STOP.to_string(),
                created_at: now,
                expires_at: now + ttl.as_secs() as i64,
            };

            match put_typed(
                self.store.as_ref(),
                &key,
                &lease,
                Some(WriteCondition::AbsentOrNumberLess { attr: "expires_at", value: now }),
            )
            .await
            {
                Ok(()) => {
                    info!(resource = %resource_id, owner = %owner_id, "lease_acquired");
                    return Ok(AcquireOutcome::Acquired { lease_key: key, acquired_at: now });
                }
                Err(OpsError::ConditionFailed(_)) => {
                    debug!(
                        resource = %resource_id,
                        attempt,
                        "lease_held_by_another_owner"
                    );
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!(resource = %resource_id, "lease_not_acquired");
        Ok(AcquireOutcome::NotAcquired)
    }

    /// Release a held lease. A mismatching owner id leaves the lease intact.
    pub async fn release(&self, lease_key: &str, owner_id: &str) -> OpsResult<ReleaseOutcome> {
        if self.store.get(lease_key).await?.is_none() {
            return Ok(ReleaseOutcome::NotFound);
        }

        match self
            .store
            .delete(
                lease_key,
                Some(WriteCondition::AttrEquals {
                    attr: "owner_id",
                    value: owner_id.to_string(),
                }),
            )
            .await
        {
            Ok(()) => {
                info!(key = %lease_key, "lease_released");
                Ok(ReleaseOutcome::Released)
            }
            Err(OpsError::ConditionFailed(_)) => Ok(ReleaseOutcome::NotOwner),
            Err(e) => Err(e),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS * (1 << attempt.min(4));
    let jitter = rand::rng().random_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}

/* ============================= TESTS ============================= */
