// SPDX-License-Identifier: AGPL-3.0-only

//! Adapter discovery and selection.
//!
//! The adapter is chosen by an explicit selector (`SOFTMAX_GPU_ADAPTER`) or
//! auto-detected: discrete first, then integrated, then anything else.
//! Software rasterizers are only picked when nothing else exists.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SoftmaxError};

/// Summary of a discovered adapter.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Enumeration index (stable within a single run).
    pub index: usize,
    pub name: String,
    pub driver: String,
    pub backend: wgpu::Backend,
    pub device_type: wgpu::DeviceType,
}

impl AdapterInfo {
    fn from_adapter(index: usize, adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        Self {
            index,
            name: info.name,
            driver: info.driver,
            backend: info.backend,
            device_type: info.device_type,
        }
    }
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.device_type {
            wgpu::DeviceType::DiscreteGpu => "discrete",
            wgpu::DeviceType::IntegratedGpu => "integrated",
            wgpu::DeviceType::VirtualGpu => "virtual",
            wgpu::DeviceType::Cpu => "cpu",
            wgpu::DeviceType::Other => "other",
        };
        write!(
            f,
            "[{}] {} ({}, {:?}, {kind})",
            self.index, self.name, self.driver, self.backend
        )
    }
}

/// Which adapter to use.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AdapterSelector {
    #[default]
    Auto,
    /// Enumeration index; falls back to a name match if out of range.
    Index(usize),
    /// Case-insensitive substring of the adapter name.
    Name(String),
}

impl FromStr for AdapterSelector {
    type Err = SoftmaxError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if s.is_empty() || s == "auto" {
            Ok(Self::Auto)
        } else if let Ok(idx) = s.parse::<usize>() {
            Ok(Self::Index(idx))
        } else {
            Ok(Self::Name(s))
        }
    }
}

impl fmt::Display for AdapterSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Index(i) => write!(f, "{i}"),
            Self::Name(n) => f.write_str(n),
        }
    }
}

/// Parse a backend name (`vulkan`, `metal`, `dx12`, `gl`, `all`).
///
/// # Errors
///
/// Returns [`SoftmaxError::Config`] for an unknown name.
pub fn parse_backends(name: &str) -> Result<wgpu::Backends> {
    match name.trim().to_ascii_lowercase().as_str() {
        "" | "all" => Ok(wgpu::Backends::all()),
        "vulkan" => Ok(wgpu::Backends::VULKAN),
        "metal" => Ok(wgpu::Backends::METAL),
        "dx12" => Ok(wgpu::Backends::DX12),
        "gl" => Ok(wgpu::Backends::GL),
        other => Err(SoftmaxError::Config(format!(
            "unknown wgpu backend `{other}` (vulkan, metal, dx12, gl)"
        ))),
    }
}

/// Create a wgpu instance restricted to `backends`.
#[must_use]
pub fn create_instance(backends: wgpu::Backends) -> wgpu::Instance {
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends,
        ..Default::default()
    })
}

/// Enumerate adapters on `backends`.
#[must_use]
pub fn enumerate_adapters(backends: wgpu::Backends) -> Vec<AdapterInfo> {
    create_instance(backends)
        .enumerate_adapters(backends)
        .iter()
        .enumerate()
        .map(|(i, a)| AdapterInfo::from_adapter(i, a))
        .collect()
}

/// Select an adapter on `instance`.
///
/// # Errors
///
/// Returns [`SoftmaxError::PlatformDiscovery`] when no adapter exists or none
/// matches the selector.
pub fn select_adapter(
    instance: &wgpu::Instance,
    backends: wgpu::Backends,
    selector: &AdapterSelector,
) -> Result<(wgpu::Adapter, AdapterInfo)> {
    let adapters = instance.enumerate_adapters(backends);
    if adapters.is_empty() {
        return Err(SoftmaxError::PlatformDiscovery(format!(
            "no adapters on backends {backends:?}"
        )));
    }
    let chosen = match selector {
        AdapterSelector::Auto => auto_select(adapters),
        AdapterSelector::Index(idx) => select_by_index_or_name(adapters, *idx),
        AdapterSelector::Name(name) => select_by_name(adapters, name),
    }?;
    let info = AdapterInfo::from_adapter(chosen.0, &chosen.1);
    tracing::info!(adapter = %info, "adapter selected");
    Ok((chosen.1, info))
}

fn rank(device_type: wgpu::DeviceType) -> u8 {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => 0,
        wgpu::DeviceType::IntegratedGpu => 1,
        wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => 2,
        wgpu::DeviceType::Cpu => 3,
    }
}

fn auto_select(adapters: Vec<wgpu::Adapter>) -> Result<(usize, wgpu::Adapter)> {
    adapters
        .into_iter()
        .enumerate()
        .min_by_key(|(i, a)| (rank(a.get_info().device_type), *i))
        .ok_or_else(|| SoftmaxError::PlatformDiscovery("no adapters".into()))
}

fn select_by_index_or_name(
    adapters: Vec<wgpu::Adapter>,
    idx: usize,
) -> Result<(usize, wgpu::Adapter)> {
    if idx < adapters.len() {
        adapters
            .into_iter()
            .enumerate()
            .nth(idx)
            .ok_or_else(|| SoftmaxError::PlatformDiscovery(format!("no adapter {idx}")))
    } else {
        select_by_name(adapters, &idx.to_string()).map_err(|_| {
            SoftmaxError::PlatformDiscovery(format!(
                "no adapter matching '{idx}' (tried as index and name)"
            ))
        })
    }
}

fn select_by_name(adapters: Vec<wgpu::Adapter>, selector: &str) -> Result<(usize, wgpu::Adapter)> {
    adapters
        .into_iter()
        .enumerate()
        .find(|(_, a)| a.get_info().name.to_ascii_lowercase().contains(selector))
        .ok_or_else(|| SoftmaxError::PlatformDiscovery(format!("no adapter matching '{selector}'")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn selector_parsing() {
        assert_eq!("".parse::<AdapterSelector>().unwrap(), AdapterSelector::Auto);
        assert_eq!(" AUTO ".parse::<AdapterSelector>().unwrap(), AdapterSelector::Auto);
        assert_eq!("1".parse::<AdapterSelector>().unwrap(), AdapterSelector::Index(1));
        assert_eq!(
            "RTX 4070".parse::<AdapterSelector>().unwrap(),
            AdapterSelector::Name("rtx 4070".into())
        );
    }

    #[test]
    fn backend_names() {
        assert_eq!(parse_backends("Vulkan").unwrap(), wgpu::Backends::VULKAN);
        assert_eq!(parse_backends("").unwrap(), wgpu::Backends::all());
        assert!(matches!(parse_backends("cuda"), Err(SoftmaxError::Config(_))));
    }

    #[test]
    fn discrete_ranks_first() {
        assert!(rank(wgpu::DeviceType::DiscreteGpu) < rank(wgpu::DeviceType::IntegratedGpu));
        assert!(rank(wgpu::DeviceType::IntegratedGpu) < rank(wgpu::DeviceType::Cpu));
    }
}
