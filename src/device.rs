//! Device allocation
//!
//! Picks the accelerators a run is spread over. The first device returned is
//! the primary: the model is instantiated there before being shared.

use std::fmt;
use std::process::Command;
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ExtractError;

/// A compute device a worker can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    /// Apple GPU; reports no free memory
    Metal(usize),
}

impl DeviceSpec {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, DeviceSpec::Cpu)
    }

    /// Open the candle device
    pub fn to_device(&self) -> Result<Device> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(*ordinal)
                .with_context(|| format!("Failed to open cuda:{ordinal}")),
            DeviceSpec::Metal(ordinal) => Device::new_metal(*ordinal)
                .with_context(|| format!("Failed to open metal:{ordinal}")),
        }
    }

    /// Reduced precision on accelerators, full precision on CPU
    ///
    /// Metal gets F16: several of its kernels have no BF16 variant.
    pub fn dtype(&self) -> DType {
        match self {
            DeviceSpec::Cpu => DType::F32,
            DeviceSpec::Cuda(_) => DType::BF16,
            DeviceSpec::Metal(_) => DType::F16,
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            DeviceSpec::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" => Ok(DeviceSpec::Cuda(0)),
            "metal" => Ok(DeviceSpec::Metal(0)),
            _ => {
                let (kind, ordinal) = s
                    .split_once(':')
                    .with_context(|| format!("Unknown device '{s}'"))?;
                let ordinal: usize = ordinal
                    .parse()
                    .with_context(|| format!("Invalid device ordinal in '{s}'"))?;
                match kind {
                    "cuda" => Ok(DeviceSpec::Cuda(ordinal)),
                    "metal" => Ok(DeviceSpec::Metal(ordinal)),
                    _ => anyhow::bail!("Unknown device '{s}'"),
                }
            }
        }
    }
}

/// Free memory reported for one accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuInfo {
    pub ordinal: usize,
    /// Bytes
    pub free_memory: u64,
}

/// Parse `nvidia-smi --query-gpu=index,memory.free --format=csv,noheader,nounits`
///
/// Memory is reported in MiB. Malformed lines are skipped.
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let ordinal = fields.next()?.parse().ok()?;
            let free_mib: u64 = fields.next()?.parse().ok()?;
            Some(GpuInfo {
                ordinal,
                free_memory: free_mib * 1024 * 1024,
            })
        })
        .collect()
}

/// Query the local accelerators; empty when none can be found
pub fn query_gpus() -> Vec<GpuInfo> {
    if !candle_core::utils::cuda_is_available() {
        debug!("Built without CUDA support, no accelerators to query");
        return vec![];
    }
    match Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output()
    {
        Ok(out) if out.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            warn!("nvidia-smi exited with {}", out.status);
            vec![]
        }
        Err(e) => {
            warn!("Could not run nvidia-smi: {e}");
            vec![]
        }
    }
}

/// Choose devices from an inventory
///
/// Accelerators below `min_memory` are dropped, the rest ordered by free
/// memory (most first, ties by ordinal) and truncated to `num_gpus`. With no
/// CUDA device left, an available Metal GPU is used unless a memory floor
/// was requested (Metal cannot report one) or `num_gpus` is zero.
pub fn select_devices(
    gpus: &[GpuInfo],
    num_gpus: Option<usize>,
    min_memory: Option<u64>,
    allow_cpu_fallback: bool,
    metal_available: bool,
) -> Result<Vec<DeviceSpec>> {
    let floor = min_memory.unwrap_or(0);
    let mut usable: Vec<GpuInfo> = gpus
        .iter()
        .copied()
        .filter(|g| g.free_memory >= floor)
        .collect();
    usable.sort_by(|a, b| {
        b.free_memory
            .cmp(&a.free_memory)
            .then(a.ordinal.cmp(&b.ordinal))
    });
    if let Some(n) = num_gpus {
        usable.truncate(n);
    }

    if usable.is_empty() {
        if metal_available && min_memory.is_none() && num_gpus != Some(0) {
            return Ok(vec![DeviceSpec::Metal(0)]);
        }
        if allow_cpu_fallback {
            return Ok(vec![DeviceSpec::Cpu]);
        }
        return Err(ExtractError::NoUsableDevice { min_memory: floor }.into());
    }
    Ok(usable.into_iter().map(|g| DeviceSpec::Cuda(g.ordinal)).collect())
}

/// Select devices from the live inventory
pub fn select_usable_devices(
    num_gpus: Option<usize>,
    min_memory: Option<u64>,
    allow_cpu_fallback: bool,
) -> Result<Vec<DeviceSpec>> {
    let gpus = query_gpus();
    let devices = select_devices(
        &gpus,
        num_gpus,
        min_memory,
        allow_cpu_fallback,
        candle_core::utils::metal_is_available(),
    )?;
    info!(
        "Using {} device(s): {}",
        devices.len(),
        devices
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn inventory() -> Vec<GpuInfo> {
        vec![
            GpuInfo { ordinal: 0, free_memory: 4 * GIB },
            GpuInfo { ordinal: 1, free_memory: 20 * GIB },
            GpuInfo { ordinal: 2, free_memory: 20 * GIB },
            GpuInfo { ordinal: 3, free_memory: 10 * GIB },
        ]
    }

    #[test]
    fn test_select_orders_by_free_memory() {
        let devices = select_devices(&inventory(), None, None, true, false).unwrap();
        assert_eq!(
            devices,
            vec![
                DeviceSpec::Cuda(1),
                DeviceSpec::Cuda(2),
                DeviceSpec::Cuda(3),
                DeviceSpec::Cuda(0)
            ]
        );
    }

    #[test]
    fn test_select_memory_floor_and_count() {
        let devices = select_devices(&inventory(), Some(2), Some(8 * GIB), true, false).unwrap();
        assert_eq!(devices, vec![DeviceSpec::Cuda(1), DeviceSpec::Cuda(2)]);
    }

    #[test]
    fn test_cpu_fallback() {
        let devices = select_devices(&inventory(), None, Some(64 * GIB), true, false).unwrap();
        assert_eq!(devices, vec![DeviceSpec::Cpu]);
        assert_eq!(select_devices(&[], None, None, true, false).unwrap(), vec![DeviceSpec::Cpu]);

        let err = select_devices(&inventory(), None, Some(64 * GIB), false, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::NoUsableDevice { .. })
        ));
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let gpus = parse_nvidia_smi("0, 1024\n1, 2048\ngarbage\n");
        assert_eq!(
            gpus,
            vec![
                GpuInfo { ordinal: 0, free_memory: GIB },
                GpuInfo { ordinal: 1, free_memory: 2 * GIB },
            ]
        );
    }

    #[test]
    fn test_device_spec_roundtrip() {
        assert_eq!("cuda:3".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(3));
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert!("tpu".parse::<DeviceSpec>().is_err());
        assert_eq!(DeviceSpec::Cuda(1).to_string(), "cuda:1");
        assert_eq!(DeviceSpec::Cpu.dtype(), DType::F32);
        assert_eq!(DeviceSpec::Cuda(0).dtype(), DType::BF16);
        assert_eq!("metal:1".parse::<DeviceSpec>().unwrap(), DeviceSpec::Metal(1));
        assert_eq!("metal".parse::<DeviceSpec>().unwrap(), DeviceSpec::Metal(0));
        assert_eq!(DeviceSpec::Metal(0).to_string(), "metal:0");
        assert_eq!(DeviceSpec::Metal(0).dtype(), DType::F16);
        assert!("metal:x".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_metal_selected_without_cuda() {
        let pick = |gpus: &[GpuInfo], num_gpus, min_memory, metal| {
            select_devices(gpus, num_gpus, min_memory, true, metal).unwrap()
        };
        assert_eq!(pick(&[], None, None, true), vec![DeviceSpec::Metal(0)]);
        assert_eq!(pick(&[], None, None, false), vec![DeviceSpec::Cpu]);
        // CUDA wins when both exist
        assert_eq!(pick(&inventory(), Some(1), None, true), vec![DeviceSpec::Cuda(1)]);
        // No memory report on Metal, so a floor rules it out
        assert_eq!(pick(&[], None, Some(GIB), true), vec![DeviceSpec::Cpu]);
        assert_eq!(pick(&[], Some(0), None, true), vec![DeviceSpec::Cpu]);
    }
}
