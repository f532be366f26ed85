//! # Compute Device Selection
//!
//! Resolves the `models.device` setting to a candle device for Whisper
//! inference. GPU requests fall back to the CPU when the backend is missing.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Result of auto-detection, computed once per process
static AUTO_DEVICE: OnceLock<Device> = OnceLock::new();

/// Device preference from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    /// Apple GPU ("mps" is accepted as an alias)
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            other => Err(format!(
                "Unknown device '{}', expected one of auto, cpu, cuda, metal",
                other
            )),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    /// Device for the given preference, never failing.
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => AUTO_DEVICE.get_or_init(Self::detect).clone(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::cuda().unwrap_or_else(|| {
                warn!("CUDA requested but unavailable, falling back to CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::metal().unwrap_or_else(|| {
                warn!("Metal requested but unavailable, falling back to CPU");
                Device::Cpu
            }),
        }
    }

    fn detect() -> Device {
        if let Some(device) = Self::cuda() {
            info!("Auto-selected CUDA GPU for transcription");
            return device;
        }
        if let Some(device) = Self::metal() {
            info!("Auto-selected Metal GPU for transcription");
            return device;
        }
        info!("No GPU backend available, transcribing on CPU");
        Device::Cpu
    }

    fn cuda() -> Option<Device> {
        Device::new_cuda(0)
            .map_err(|e| debug!("CUDA not available: {}", e))
            .ok()
    }

    fn metal() -> Option<Device> {
        Device::new_metal(0)
            .map_err(|e| debug!("Metal not available: {}", e))
            .ok()
    }

    /// Label reported by `/api/health`.
    pub fn get_device_info(device: &Device) -> String {
        match device {
            Device::Cpu => "CPU".to_string(),
            Device::Cuda(_) => "CUDA GPU".to_string(),
            Device::Metal(_) => "Metal GPU".to_string(),
        }
    }
}
