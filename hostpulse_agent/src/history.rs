//! History query service: validates a requested column and window, then hands the
//! query to the store. Points come back unchanged.

use serde::Deserialize;
use tracing::debug;

use crate::error::{QueryError, StoreError};
use crate::store::{clamp_limit, Store, TimeWindow};
use crate::types::{MetricColumn, Point};

pub const DEFAULT_COLUMN: MetricColumn = MetricColumn::CpuLoad;

/// Display-level metric keys that dashboards ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKey {
    CpuLoad,
    /// Per-core history is not stored; served from the overall load column.
    CpuCore(u32),
    CpuTemp,
    MemUsage,
    GpuTemp,
    GpuLoad,
    FanSpeed,
    NetRx,
    NetTx,
    DiskUsage,
    DiskReadMbps,
    DiskWriteMbps,
}

impl MetricKey {
    pub fn parse(key: &str) -> Option<Self> {
        let k = key.trim().to_ascii_lowercase();
        if let Some(idx) = k.strip_prefix("cpucore") {
            return Some(MetricKey::CpuCore(idx.parse().unwrap_or(0)));
        }
        Some(match k.as_str() {
            "cpuload" => MetricKey::CpuLoad,
            "cputemp" => MetricKey::CpuTemp,
            "memusage" => MetricKey::MemUsage,
            "gputemp" => MetricKey::GpuTemp,
            "gpuload" => MetricKey::GpuLoad,
            "fanspeed" => MetricKey::FanSpeed,
            "netrx" => MetricKey::NetRx,
            "nettx" => MetricKey::NetTx,
            "diskusage" => MetricKey::DiskUsage,
            "diskreadmbps" => MetricKey::DiskReadMbps,
            "diskwritembps" => MetricKey::DiskWriteMbps,
            _ => return None,
        })
    }

    pub fn column(self) -> MetricColumn {
        match self {
            MetricKey::CpuLoad | MetricKey::CpuCore(_) => MetricColumn::CpuLoad,
            MetricKey::CpuTemp => MetricColumn::CpuTemp,
            MetricKey::MemUsage => MetricColumn::MemUsage,
            MetricKey::GpuTemp => MetricColumn::GpuTemp,
            MetricKey::GpuLoad => MetricColumn::GpuLoad,
            MetricKey::FanSpeed => MetricColumn::FanSpeed,
            MetricKey::NetRx => MetricColumn::NetRx,
            MetricKey::NetTx => MetricColumn::NetTx,
            MetricKey::DiskUsage => MetricColumn::DiskUsage,
            MetricKey::DiskReadMbps => MetricColumn::DiskRead,
            MetricKey::DiskWriteMbps => MetricColumn::DiskWrite,
        }
    }
}

/// Unknown keys fall back to [`DEFAULT_COLUMN`]. This is lossy: the caller gets
/// cpu_load data for a key it did not ask for.
pub fn column_for_key(key: &str) -> MetricColumn {
    match MetricKey::parse(key) {
        Some(k) => k.column(),
        None => {
            debug!(key, "unknown metric key, using {}", DEFAULT_COLUMN);
            DEFAULT_COLUMN
        }
    }
}

/// Raw query string. Everything stays text so malformed numbers fall back to
/// defaults instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<String>,
    pub column: Option<String>,
    pub metric: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    pub window: TimeWindow,
    pub limit: u32,
    pub column: MetricColumn,
}

fn parse_i64(v: &Option<String>) -> Option<i64> {
    v.as_deref().and_then(|s| s.trim().parse::<i64>().ok())
}

impl HistoryQuery {
    pub fn from_params(p: &HistoryParams, now_ms: i64) -> Result<Self, QueryError> {
        // an explicit column is strict and wins over a display key
        let column = match (&p.column, &p.metric) {
            (Some(c), _) => c.parse::<MetricColumn>()?,
            (None, Some(key)) => column_for_key(key),
            (None, None) => DEFAULT_COLUMN,
        };

        // Only a caller-inverted range is an error. A window that inverts after
        // clamping (e.g. `since` slightly in the future) is just empty.
        let (since, until) = (parse_i64(&p.since), parse_i64(&p.until));
        if let (Some(since_ms), Some(until_ms)) = (since, until) {
            if since_ms > until_ms {
                return Err(QueryError::InvalidRange { since_ms, until_ms });
            }
        }
        let window = TimeWindow::clamped(since, until, now_ms);

        Ok(Self {
            window,
            limit: clamp_limit(parse_i64(&p.limit)),
            column,
        })
    }

    pub async fn run(&self, store: &Store) -> Result<Vec<Point>, StoreError> {
        store.query_range(self.window, self.limit, self.column).await
    }
}
