//! Compute device selection.
//!
//! The merge itself is device agnostic; the caller picks where tensors are
//! materialized and hands the resulting [`Device`] to the loaders.

use std::fmt;
use std::str::FromStr;

use candle_core::Device;
use serde::Serialize;

use crate::error::{MergeError, Result};

/// Requested compute device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// CUDA device 0 when available, CPU otherwise.
    #[default]
    Auto,
    /// Always the CPU.
    Cpu,
    /// A specific CUDA ordinal.
    Cuda(usize),
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceChoice::Auto => f.write_str("auto"),
            DeviceChoice::Cpu => f.write_str("cpu"),
            DeviceChoice::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for DeviceChoice {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(DeviceChoice::Auto),
            "cpu" => Ok(DeviceChoice::Cpu),
            "cuda" => Ok(DeviceChoice::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(DeviceChoice::Cuda)
                .ok_or_else(|| {
                    MergeError::malformed(
                        "device",
                        format!("`{other}` is not one of auto, cpu, cuda, cuda:N"),
                    )
                }),
        }
    }
}

/// Resolve a [`DeviceChoice`] into a concrete candle device.
///
/// `Auto` never fails: it falls back to the CPU when CUDA is unavailable or
/// the crate was built without the `cuda` feature.
///
/// # Errors
///
/// Returns an error if an explicit CUDA device was requested and cannot be
/// initialized.
pub fn select_device(choice: DeviceChoice) -> Result<Device> {
    match choice {
        DeviceChoice::Cpu => Ok(Device::Cpu),
        DeviceChoice::Cuda(ordinal) => {
            let device = Device::new_cuda(ordinal)?;
            tracing::info!("Merge device: CUDA (device {})", ordinal);
            Ok(device)
        }
        DeviceChoice::Auto if cfg!(feature = "cuda") => match Device::cuda_if_available(0) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Merge device: CUDA (device 0)");
                Ok(device)
            }
            Ok(_) => {
                tracing::info!("CUDA not available; merging on CPU");
                Ok(Device::Cpu)
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); merging on CPU");
                Ok(Device::Cpu)
            }
        },
        DeviceChoice::Auto => {
            tracing::debug!("Merge device: CPU");
            Ok(Device::Cpu)
        }
    }
}
