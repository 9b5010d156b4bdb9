//! Retention: on-demand cleanup and an optional periodic purge task.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::Store;

pub const DEFAULT_MAX_AGE_MS: i64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Debug, Default, Deserialize)]
pub struct CleanupParams {
    #[serde(rename = "maxAge")]
    pub max_age: Option<String>,
}

impl CleanupParams {
    /// Missing, unparsable or non-positive ages use 30 days.
    pub fn max_age_ms(&self) -> i64 {
        self.max_age
            .as_deref()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_MAX_AGE_MS)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub deleted: u64,
    pub before: String,
    pub before_ms: i64,
}

pub fn rfc3339_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default()
}

/// Delete rows older than `now_ms - max_age_ms`.
pub async fn purge_older_than(
    store: &Store,
    max_age_ms: i64,
    now_ms: i64,
) -> Result<CleanupReport, StoreError> {
    let cutoff = now_ms.saturating_sub(max_age_ms).max(0);
    let deleted = store.purge_before(cutoff).await?;
    let report = CleanupReport {
        deleted,
        before: rfc3339_ms(cutoff),
        before_ms: cutoff,
    };
    info!("Cleaned {} rows older than {}", report.deleted, report.before);
    Ok(report)
}

// hourly: drop rows past the retention window
pub fn spawn_retention(store: Store, period: Duration, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let max_age_ms = max_age.as_millis().min(i64::MAX as u128) as i64;
        loop {
            ticker.tick().await;
            if store.is_closed() {
                break;
            }
            if let Err(e) = purge_older_than(&store, max_age_ms, crate::types::now_ms()).await {
                warn!("retention purge failed: {e}");
            }
        }
    })
}
