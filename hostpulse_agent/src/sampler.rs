//! Sampler: wraps the host metrics capability and normalizes whatever it returns
//! into a fixed `Reading`. All "missing field" policy lives in [`normalize`].

use std::sync::Arc;

use crate::error::AcquisitionError;
use crate::gpu::RawGpu;
use crate::types::{
    CoreLoad, CpuInfo, CpuReading, DiskIo, FanReading, FilesystemReading, GpuReading,
    MemoryReading, NetworkReading, Reading, Sensors, StorageReading,
};

/// A host metrics capability. Implementations may block; the sampler calls them
/// from the blocking pool.
pub trait MetricsSource: Send + Sync + 'static {
    fn acquire(&self) -> Result<RawReading, AcquisitionError>;
}

/// Readings as the capability reports them: any field may be absent or non-finite.
#[derive(Debug, Clone, Default)]
pub struct RawReading {
    pub cpu_brand: Option<String>,
    pub logical_cores: Option<f64>,
    pub physical_cores: Option<f64>,
    pub cpu_total_load: Option<f64>,
    pub per_core_load: Vec<Option<f64>>,
    pub cpu_temp: Option<f64>,
    pub mem_used: Option<f64>,
    pub mem_total: Option<f64>,
    pub gpus: Option<Vec<RawGpu>>,
    pub fans: Option<Vec<Option<f64>>>,
    pub net_rx_per_sec: Option<f64>,
    pub net_tx_per_sec: Option<f64>,
    pub fs_use_percent: Option<f64>,
    pub disk_read_per_sec: Option<f64>,
    pub disk_write_per_sec: Option<f64>,
}

#[derive(Clone)]
pub struct Sampler {
    source: Arc<dyn MetricsSource>,
}

impl Sampler {
    pub fn new<S: MetricsSource>(source: S) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// One independent acquisition. Fails only when the capability itself fails.
    pub async fn sample(&self) -> Result<Reading, AcquisitionError> {
        let source = Arc::clone(&self.source);
        // A panicking source surfaces as a JoinError only where panics unwind;
        // the release profile aborts instead.
        let raw = tokio::task::spawn_blocking(move || source.acquire())
            .await
            .map_err(|e| AcquisitionError(format!("sampler task failed: {e}")))??;
        Ok(normalize(raw))
    }
}

#[inline]
pub fn finite_or_zero(v: Option<f64>) -> f64 {
    match v {
        Some(x) if x.is_finite() => x,
        _ => 0.0,
    }
}

#[inline]
fn round2(v: Option<f64>) -> f64 {
    let x = finite_or_zero(v);
    finite_or_zero(Some((x * 100.0).round() / 100.0))
}

fn count_or(v: Option<f64>, fallback: u32) -> u32 {
    let x = finite_or_zero(v);
    if x >= 1.0 {
        x.min(u32::MAX as f64) as u32
    } else {
        fallback
    }
}

fn non_empty(s: Option<String>, default: &str) -> String {
    s.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn normalize(raw: RawReading) -> Reading {
    let per_core: Vec<CoreLoad> = raw
        .per_core_load
        .iter()
        .enumerate()
        .map(|(i, v)| CoreLoad {
            core: i as u32,
            load_percent: round2(*v),
        })
        .collect();
    let observed = per_core.len() as u32;

    let mem_used = finite_or_zero(raw.mem_used);
    let mem_total = finite_or_zero(raw.mem_total).max(1.0);

    let gpus = raw
        .gpus
        .unwrap_or_default()
        .into_iter()
        .map(|g| GpuReading {
            temperature: finite_or_zero(g.temperature_c),
            model: non_empty(g.model, "GPU"),
            vendor: non_empty(g.vendor, "Unknown"),
            vram_total_mb: round2(Some(finite_or_zero(g.vram_total_bytes) / (1024.0 * 1024.0))),
            utilization: round2(g.utilization_pct),
        })
        .collect();

    let fans = match raw.fans {
        Some(list) if !list.is_empty() => list
            .into_iter()
            .map(|rpm| FanReading {
                rpm: finite_or_zero(rpm),
            })
            .collect(),
        _ => vec![FanReading { rpm: 0.0 }],
    };

    Reading {
        cpu: CpuReading {
            info: CpuInfo {
                brand: non_empty(raw.cpu_brand, "CPU"),
                cores: count_or(raw.logical_cores, observed),
                physical_cores: count_or(raw.physical_cores, observed),
            },
            load_percent: round2(raw.cpu_total_load),
            temperature: finite_or_zero(raw.cpu_temp),
            per_core,
        },
        memory: MemoryReading {
            usage_percent: round2(Some(mem_used / mem_total * 100.0)),
        },
        gpus,
        sensors: Sensors { fans },
        network: vec![NetworkReading {
            rx_sec: finite_or_zero(raw.net_rx_per_sec),
            tx_sec: finite_or_zero(raw.net_tx_per_sec),
        }],
        storage: StorageReading {
            filesystems: vec![FilesystemReading {
                use_percent: round2(raw.fs_use_percent),
            }],
            io: DiskIo {
                read_bytes: finite_or_zero(raw.disk_read_per_sec),
                write_bytes: finite_or_zero(raw.disk_write_per_sec),
            },
        },
    }
}
