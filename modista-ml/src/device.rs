//! Compute device selection and GPU memory reporting.

use crate::error::MlError;
use candle_core::Device;
use std::process::Command;

/// CUDA device 0 when available (and not disabled), the CPU otherwise.
pub fn select_device(force_cpu: bool) -> Result<Device, MlError> {
    let device = if force_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    if device.is_cuda() {
        tracing::info!("using CUDA device 0");
    } else {
        tracing::info!("using CPU");
    }
    Ok(device)
}

/// Seed the device RNG used for parameter initialisation.
///
/// Some backends do not support seeding; that is logged and ignored.
pub fn seed_device(device: &Device, seed: u64) {
    if let Err(e) = device.set_seed(seed) {
        tracing::debug!(error = %e, "device does not support seeding");
    }
}

/// `nvidia-smi` memory usage, for CUDA devices only.
pub fn gpu_memory_report(device: &Device) -> Option<String> {
    if !device.is_cuda() {
        return None;
    }
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.used,memory.free,memory.total",
            "--format=csv",
        ])
        .output();
    match output {
        Ok(out) if out.status.success() => {
            Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
        }
        Ok(out) => {
            tracing::debug!(status = %out.status, "nvidia-smi failed");
            None
        }
        Err(e) => {
            tracing::debug!(error = %e, "nvidia-smi unavailable");
            None
        }
    }
}
