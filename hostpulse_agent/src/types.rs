//! Data types sent to clients and written to the store.
//! Keep this module minimal and stable: it defines the wire format and the row schema.

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, StoreError};

/// Version tag carried by every metrics frame.
pub const FRAME_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    pub brand: String,
    pub cores: u32,
    pub physical_cores: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoreLoad {
    pub core: u32,
    pub load_percent: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuReading {
    pub info: CpuInfo,
    pub load_percent: f64,
    pub temperature: f64,
    // ordered by core index
    pub per_core: Vec<CoreLoad>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReading {
    pub usage_percent: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpuReading {
    pub temperature: f64,
    pub model: String,
    pub vendor: String,
    pub vram_total_mb: f64,
    pub utilization: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FanReading {
    pub rpm: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Sensors {
    pub fans: Vec<FanReading>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkReading {
    // bytes/s on the primary interface
    pub rx_sec: f64,
    pub tx_sec: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FilesystemReading {
    #[serde(rename = "use")]
    pub use_percent: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskIo {
    // bytes/s
    pub read_bytes: f64,
    pub write_bytes: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StorageReading {
    pub filesystems: Vec<FilesystemReading>,
    pub io: DiskIo,
}

/// One normalized snapshot. Every numeric field is finite.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Reading {
    pub cpu: CpuReading,
    pub memory: MemoryReading,
    pub gpus: Vec<GpuReading>,
    pub sensors: Sensors,
    pub network: Vec<NetworkReading>,
    pub storage: StorageReading,
}

/// Messages pushed to a streaming client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Metrics {
        version: u32,
        seq: u64,
        timestamp: i64,
        data: Reading,
    },
    Error {
        message: String,
    },
}

/// The eleven scalar columns of the `metrics` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricColumn {
    CpuLoad,
    CpuTemp,
    MemUsage,
    GpuTemp,
    GpuLoad,
    FanSpeed,
    NetRx,
    NetTx,
    DiskUsage,
    DiskRead,
    DiskWrite,
}

impl MetricColumn {
    pub const ALL: [MetricColumn; 11] = [
        MetricColumn::CpuLoad,
        MetricColumn::CpuTemp,
        MetricColumn::MemUsage,
        MetricColumn::GpuTemp,
        MetricColumn::GpuLoad,
        MetricColumn::FanSpeed,
        MetricColumn::NetRx,
        MetricColumn::NetTx,
        MetricColumn::DiskUsage,
        MetricColumn::DiskRead,
        MetricColumn::DiskWrite,
    ];

    /// SQL column name. Only these strings are ever interpolated into queries.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricColumn::CpuLoad => "cpu_load",
            MetricColumn::CpuTemp => "cpu_temp",
            MetricColumn::MemUsage => "mem_usage",
            MetricColumn::GpuTemp => "gpu_temp",
            MetricColumn::GpuLoad => "gpu_load",
            MetricColumn::FanSpeed => "fan_speed",
            MetricColumn::NetRx => "net_rx",
            MetricColumn::NetTx => "net_tx",
            MetricColumn::DiskUsage => "disk_usage",
            MetricColumn::DiskRead => "disk_read",
            MetricColumn::DiskWrite => "disk_write",
        }
    }
}

impl std::str::FromStr for MetricColumn {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        MetricColumn::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| QueryError::InvalidColumn {
                column: s.to_string(),
            })
    }
}

impl std::fmt::Display for MetricColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat scalar values derived from a Reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricValues {
    pub cpu_load: f64,
    pub cpu_temp: f64,
    pub mem_usage: f64,
    pub gpu_temp: f64,
    pub gpu_load: f64,
    pub fan_speed: f64,
    pub net_rx: f64,
    pub net_tx: f64,
    pub disk_usage: f64,
    pub disk_read: f64,
    pub disk_write: f64,
}

impl MetricValues {
    pub fn from_reading(r: &Reading) -> Self {
        let gpu = r.gpus.first();
        let net = r.network.first();
        Self {
            cpu_load: r.cpu.load_percent,
            cpu_temp: r.cpu.temperature,
            mem_usage: r.memory.usage_percent,
            gpu_temp: gpu.map(|g| g.temperature).unwrap_or(0.0),
            gpu_load: gpu.map(|g| g.utilization).unwrap_or(0.0),
            fan_speed: r.sensors.fans.first().map(|f| f.rpm).unwrap_or(0.0),
            net_rx: net.map(|n| n.rx_sec).unwrap_or(0.0),
            net_tx: net.map(|n| n.tx_sec).unwrap_or(0.0),
            disk_usage: r
                .storage
                .filesystems
                .first()
                .map(|f| f.use_percent)
                .unwrap_or(0.0),
            disk_read: r.storage.io.read_bytes,
            disk_write: r.storage.io.write_bytes,
        }
    }

    pub fn get(&self, column: MetricColumn) -> f64 {
        match column {
            MetricColumn::CpuLoad => self.cpu_load,
            MetricColumn::CpuTemp => self.cpu_temp,
            MetricColumn::MemUsage => self.mem_usage,
            MetricColumn::GpuTemp => self.gpu_temp,
            MetricColumn::GpuLoad => self.gpu_load,
            MetricColumn::FanSpeed => self.fan_speed,
            MetricColumn::NetRx => self.net_rx,
            MetricColumn::NetTx => self.net_tx,
            MetricColumn::DiskUsage => self.disk_usage,
            MetricColumn::DiskRead => self.disk_read,
            MetricColumn::DiskWrite => self.disk_write,
        }
    }
}

/// A row ready to append. The store assigns the id and may move the timestamp
/// forward to keep history non-decreasing.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRow {
    pub timestamp_ms: i64,
    pub values: MetricValues,
    pub full_data: String,
}

impl PersistedRow {
    pub fn from_reading(reading: &Reading, timestamp_ms: i64) -> Result<Self, StoreError> {
        Ok(Self {
            timestamp_ms,
            values: MetricValues::from_reading(reading),
            full_data: serde_json::to_string(reading)?,
        })
    }
}

/// One history point.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: i64,
    pub value: f64,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
