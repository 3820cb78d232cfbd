//! Resource allocation for the pipeline run.
//!
//! Converts host capacity (CPU cores, RAM, GPU presence) and optional
//! overrides into a bounded [`ResourceBudget`] that every later stage reads.
//! All inputs are defensively clamped; budget computation never fails.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Hard cap on parallel jobs, protecting shared hosts.
pub const MAX_JOBS: usize = 12;

/// Resident memory budgeted per parallel training/decompression worker.
pub const GB_PER_TRAIN_JOB: u64 = 8;

/// Compute device used for training and inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Gpu,
    Cpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Gpu => "gpu",
            Device::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpu" | "cuda" => Ok(Device::Gpu),
            "cpu" => Ok(Device::Cpu),
            other => Err(format!("unknown device '{other}', expected gpu or cpu")),
        }
    }
}

/// Worker counts and device choice for one pipeline run.
///
/// Computed once at startup and read by every later stage; immutable for the
/// duration of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    /// Parallel workers for per-volume batch operations.
    pub jobs: usize,
    /// Parallel workers for memory-heavy training/decompression work.
    pub jobs_for_training: usize,
    /// Compute device for the trainer.
    pub device: Device,
}

/// Host capacity as seen by the allocator.
#[derive(Debug, Clone, Copy)]
pub struct HostCapacity {
    pub cores: usize,
    pub mem_gb: u64,
    pub gpu_available: bool,
}

/// Source of host capacity, injectable for tests.
pub trait HostProbe: Send + Sync {
    fn capacity(&self) -> HostCapacity;
}

/// Probes the actual host: scheduler-provided core count when present,
/// otherwise the system core query; memory from `/proc/meminfo`.
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn capacity(&self) -> HostCapacity {
        let cores = scheduler_cores().unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        HostCapacity {
            cores,
            mem_gb: total_memory_gb(),
            gpu_available: gpu_available(),
        }
    }
}

fn scheduler_cores() -> Option<usize> {
    std::env::var("SLURM_JOB_CPUS_PER_NODE")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
}

fn total_memory_gb() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / (1024 * 1024))
        .unwrap_or(0)
}

fn gpu_available() -> bool {
    if std::env::var("CUDA_VISIBLE_DEVICES")
        .map(|v| v.trim().is_empty() || v.trim() == "-1")
        .unwrap_or(false)
    {
        return false;
    }
    std::path::Path::new("/proc/driver/nvidia/version").exists()
        || std::process::Command::new("nvidia-smi")
            .arg("-L")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
}

/// Computes the run budget from host capacity and optional overrides.
///
/// Invariant: `1 <= jobs_for_training <= jobs <= MAX_JOBS`.
pub fn compute_budget(
    probe: &dyn HostProbe,
    requested_jobs: Option<usize>,
    requested_train_jobs: Option<usize>,
    override_device: Option<Device>,
) -> ResourceBudget {
    let capacity = probe.capacity();

    let jobs = requested_jobs
        .unwrap_or(capacity.cores)
        .clamp(1, MAX_JOBS);

    let by_memory = (capacity.mem_gb / GB_PER_TRAIN_JOB) as usize;
    let mut jobs_for_training = jobs.min(by_memory).clamp(1, MAX_JOBS);
    if let Some(requested) = requested_train_jobs {
        jobs_for_training = requested.clamp(1, MAX_JOBS);
    }
    // The training pool is never wider than the general pool.
    jobs_for_training = jobs_for_training.min(jobs);

    let device = override_device.unwrap_or(if capacity.gpu_available {
        Device::Gpu
    } else {
        Device::Cpu
    });

    let budget = ResourceBudget {
        jobs,
        jobs_for_training,
        device,
    };
    info!(
        cores = capacity.cores,
        mem_gb = capacity.mem_gb,
        jobs = budget.jobs,
        jobs_for_training = budget.jobs_for_training,
        device = %budget.device,
        "Computed resource budget"
    );
    budget
}
