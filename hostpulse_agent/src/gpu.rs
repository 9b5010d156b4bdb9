// gpu.rs
use gfxinfo::active_gpu;

/// GPU fields as reported by the probe; the sampler normalizes them.
#[derive(Debug, Clone, Default)]
pub struct RawGpu {
    pub temperature_c: Option<f64>,
    pub model: Option<String>,
    pub vendor: Option<String>,
    pub vram_total_bytes: Option<f64>,
    pub utilization_pct: Option<f64>,
}

pub fn collect_all_gpus() -> Result<Vec<RawGpu>, Box<dyn std::error::Error>> {
    let gpu = active_gpu()?;
    let info = gpu.info();

    let metrics = RawGpu {
        // gfxinfo reports millidegrees
        temperature_c: Some(info.temperature() as f64 / 1000.0),
        model: Some(gpu.model().to_string()),
        vendor: Some(gpu.vendor().to_string()),
        vram_total_bytes: Some(info.total_vram() as f64),
        utilization_pct: Some(info.load_pct() as f64),
    };

    Ok(vec![metrics])
}
