//! Host metrics capability backed by sysinfo (+ gfxinfo for GPUs).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use sysinfo::{
    Components, CpuRefreshKind, Disks, MemoryRefreshKind, Networks, RefreshKind, System,
};
use tracing::{debug, warn};

use crate::error::AcquisitionError;
use crate::gpu::{collect_all_gpus, RawGpu};
use crate::sampler::{MetricsSource, RawReading};

// Persistent sysinfo handles: cpu usage and byte counters are deltas against the
// previous refresh, so they have to outlive a single tick.
struct Handles {
    sys: System,
    networks: Networks,
    disks: Disks,
    components: Components,
    last_refresh: Option<Instant>,
}

pub struct SysinfoSource {
    handles: Mutex<Handles>,
    gpu_enabled: bool,
    temp_enabled: bool,
    gpu_checked: AtomicBool,
    gpu_present: AtomicBool,
}

impl SysinfoSource {
    pub fn new(gpu_enabled: bool, temp_enabled: bool) -> Self {
        let refresh_kind = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything());
        let sys = System::new_with_specifics(refresh_kind);

        Self {
            handles: Mutex::new(Handles {
                sys,
                networks: Networks::new_with_refreshed_list(),
                disks: Disks::new_with_refreshed_list(),
                components: Components::new_with_refreshed_list(),
                last_refresh: None,
            }),
            gpu_enabled,
            temp_enabled,
            gpu_checked: AtomicBool::new(false),
            gpu_present: AtomicBool::new(false),
        }
    }

    // If the first probe found nothing, don't keep probing every tick.
    fn probe_gpus(&self) -> Option<Vec<RawGpu>> {
        if !self.gpu_enabled {
            return None;
        }
        if self.gpu_checked.load(Ordering::Acquire) && !self.gpu_present.load(Ordering::Relaxed) {
            return None;
        }
        let found = match collect_all_gpus() {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                if !self.gpu_checked.load(Ordering::Acquire) {
                    warn!("gpu collection failed: {e}");
                }
                None
            }
        };
        if !self.gpu_checked.swap(true, Ordering::AcqRel) {
            self.gpu_present.store(found.is_some(), Ordering::Release);
            debug!(present = found.is_some(), "gpu probe complete");
        }
        found
    }
}

fn per_sec(bytes: u64, elapsed_secs: Option<f64>) -> Option<f64> {
    match elapsed_secs {
        Some(s) if s > 0.0 => Some(bytes as f64 / s),
        _ => None,
    }
}

impl MetricsSource for SysinfoSource {
    fn acquire(&self) -> Result<RawReading, AcquisitionError> {
        let mut guard = self
            .handles
            .lock()
            .map_err(|_| AcquisitionError("sysinfo handles poisoned".into()))?;
        let h = &mut *guard;

        let now = Instant::now();
        let elapsed = h.last_refresh.map(|t| now.duration_since(t).as_secs_f64());
        h.last_refresh = Some(now);

        // no-op under the release profile's `panic = "abort"`
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            h.sys.refresh_cpu_usage();
            h.sys.refresh_memory();
        }))
        .map_err(|e| AcquisitionError(format!("sysinfo refresh panicked: {e:?}")))?;

        let cpus = h.sys.cpus();
        let cpu_brand = cpus.first().map(|c| c.brand().to_string());
        let per_core_load: Vec<Option<f64>> =
            cpus.iter().map(|c| Some(c.cpu_usage() as f64)).collect();
        let logical_cores = Some(cpus.len() as f64);

        let mem_total = h.sys.total_memory();
        let mem_used = mem_total.saturating_sub(h.sys.available_memory());

        let cpu_temp = if self.temp_enabled {
            h.components.refresh(false);
            h.components
                .iter()
                .filter(|c| {
                    let l = c.label().to_ascii_lowercase();
                    l.contains("cpu") || l.contains("package") || l.contains("tctl") || l.contains("tdie")
                })
                .filter_map(|c| c.temperature())
                .map(|t| t as f64)
                .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        } else {
            None
        };

        // Primary interface: busiest non-loopback one.
        h.networks.refresh(true);
        let (net_rx_per_sec, net_tx_per_sec) = h
            .networks
            .iter()
            .filter(|(name, _)| !name.starts_with("lo"))
            .max_by_key(|(_, d)| d.total_received().saturating_add(d.total_transmitted()))
            .map(|(_, d)| (per_sec(d.received(), elapsed), per_sec(d.transmitted(), elapsed)))
            .unwrap_or((None, None));

        h.disks.refresh(false);
        let fs_use_percent = h
            .disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| h.disks.iter().next())
            .map(|d| {
                let total = d.total_space();
                let used = total.saturating_sub(d.available_space());
                used as f64 / total.max(1) as f64 * 100.0
            });
        let (read, written) = h.disks.iter().fold((0u64, 0u64), |(r, w), d| {
            let u = d.usage();
            (r.saturating_add(u.read_bytes), w.saturating_add(u.written_bytes))
        });

        let raw = RawReading {
            cpu_brand,
            logical_cores,
            physical_cores: System::physical_core_count().map(|n| n as f64),
            cpu_total_load: Some(h.sys.global_cpu_usage() as f64),
            per_core_load,
            cpu_temp,
            mem_used: Some(mem_used as f64),
            mem_total: Some(mem_total as f64),
            gpus: None,
            // sysinfo exposes no fan tachometers
            fans: None,
            net_rx_per_sec,
            net_tx_per_sec,
            fs_use_percent,
            disk_read_per_sec: per_sec(read, elapsed),
            disk_write_per_sec: per_sec(written, elapsed),
        };
        drop(guard);

        Ok(RawReading {
            gpus: self.probe_gpus(),
            ..raw
        })
    }
}
