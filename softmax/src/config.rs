// SPDX-License-Identifier: AGPL-3.0-only

//! Run configuration.
//!
//! Sources, lowest to highest priority: built-in defaults, a JSON file,
//! `SOFTMAX_*` environment variables, then command-line flags (applied by the
//! binaries on top of [`SoftmaxConfig::load`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SoftmaxError};
use crate::gpu::{parse_backends, AdapterSelector, ContextOptions};
use crate::input::DEMO_LEN;
use crate::kernels::KernelSource;
use crate::partition::{RemainderPolicy, MIN_GROUP_SIZE};
use crate::pipeline::RunOptions;

/// Preferred work-group size before clamping to the device.
pub const DEFAULT_WORKGROUP_SIZE: u32 = 256;

pub const ENV_KERNEL_PATH: &str = "SOFTMAX_KERNEL_PATH";
pub const ENV_INPUT_LEN: &str = "SOFTMAX_INPUT_LEN";
pub const ENV_WORKGROUP_SIZE: &str = "SOFTMAX_WORKGROUP_SIZE";
pub const ENV_REMAINDER: &str = "SOFTMAX_REMAINDER";
pub const ENV_DEADLINE_MS: &str = "SOFTMAX_DEADLINE_MS";
pub const ENV_GPU_ADAPTER: &str = "SOFTMAX_GPU_ADAPTER";
pub const ENV_WGPU_BACKEND: &str = "SOFTMAX_WGPU_BACKEND";

/// Everything a run needs besides the input values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SoftmaxConfig {
    /// WGSL template; the embedded kernels when `None`.
    pub kernel_path: Option<PathBuf>,
    /// Length of the generated demo input.
    pub input_len: usize,
    /// Preferred work-group size.
    pub workgroup_size: u32,
    pub remainder: RemainderPolicy,
    /// Whole-run budget in milliseconds.
    pub deadline_ms: Option<u64>,
    /// `auto`, an adapter index, or a name substring.
    pub adapter: String,
    /// `vulkan`, `metal`, `dx12`, `gl`; all backends when `None`.
    pub wgpu_backend: Option<String>,
}

impl Default for SoftmaxConfig {
    fn default() -> Self {
        Self {
            kernel_path: None,
            input_len: DEMO_LEN,
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
            remainder: RemainderPolicy::Pad,
            deadline_ms: None,
            adapter: "auto".into(),
            wgpu_backend: None,
        }
    }
}

impl SoftmaxConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SoftmaxError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| SoftmaxError::Config(format!("{}: {e}", path.display())))
    }

    /// Overlay values from `lookup` (an environment accessor).
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::Config`] naming the variable that failed to parse.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_KERNEL_PATH) {
            self.kernel_path = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(v) = lookup(ENV_INPUT_LEN) {
            self.input_len = parse_env(ENV_INPUT_LEN, &v)?;
        }
        if let Some(v) = lookup(ENV_WORKGROUP_SIZE) {
            self.workgroup_size = parse_env(ENV_WORKGROUP_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_REMAINDER) {
            self.remainder = v
                .parse()
                .map_err(|e| SoftmaxError::Config(format!("{ENV_REMAINDER}: {e}")))?;
        }
        if let Some(v) = lookup(ENV_DEADLINE_MS) {
            self.deadline_ms = Some(parse_env(ENV_DEADLINE_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_GPU_ADAPTER) {
            self.adapter = v;
        }
        if let Some(v) = lookup(ENV_WGPU_BACKEND) {
            self.wgpu_backend = Some(v);
        }
        Ok(())
    }

    /// Overlay the process environment.
    ///
    /// # Errors
    ///
    /// See [`Self::apply_env_from`].
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Check ranges and names.
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::Config`] for a zero length, a work-group size
    /// below [`MIN_GROUP_SIZE`],
    /// a zero deadline, or an unknown backend name.
    pub fn validate(&self) -> Result<()> {
        if self.input_len == 0 {
            return Err(SoftmaxError::Config("input_len must be at least 1".into()));
        }
        if self.workgroup_size < MIN_GROUP_SIZE {
            return Err(SoftmaxError::Config(format!(
                "workgroup_size must be at least {MIN_GROUP_SIZE}, got {}",
                self.workgroup_size
            )));
        }
        if self.deadline_ms == Some(0) {
            return Err(SoftmaxError::Config("deadline_ms must be positive".into()));
        }
        if let Some(backend) = &self.wgpu_backend {
            parse_backends(backend)?;
        }
        Ok(())
    }

    /// Defaults, then `path` if given, then the environment; validated.
    ///
    /// # Errors
    ///
    /// Any read, parse or validation error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn kernel_source(&self) -> KernelSource {
        KernelSource::from_path(self.kernel_path.as_deref())
    }

    #[must_use]
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            remainder: self.remainder,
            deadline: self.deadline_ms.map(Duration::from_millis),
            cancel: None,
        }
    }

    /// Options for [`crate::gpu::GpuContext::new`].
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::Config`] for an unknown backend name.
    pub fn context_options(&self) -> Result<ContextOptions> {
        let backends = match &self.wgpu_backend {
            Some(name) => parse_backends(name)?,
            None => wgpu::Backends::all(),
        };
        Ok(ContextOptions {
            adapter: self.adapter.parse::<AdapterSelector>()?,
            backends,
            preferred_group_size: self.workgroup_size,
            kernel: self.kernel_source(),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SoftmaxError::Config(format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_demo() {
        let c = SoftmaxConfig::default();
        assert_eq!(c.input_len, 512);
        assert_eq!(c.workgroup_size, 256);
        assert_eq!(c.remainder, RemainderPolicy::Pad);
        assert_eq!(c.kernel_source(), KernelSource::Embedded);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults_and_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"input_len": 100, "remainder": "reject", "workgroup_size": 64}}"#)
            .unwrap();
        let mut c = SoftmaxConfig::from_file(file.path()).unwrap();
        assert_eq!(c.input_len, 100);
        assert_eq!(c.remainder, RemainderPolicy::Reject);
        assert_eq!(c.deadline_ms, None);

        c.apply_env_from(env(&[
            (ENV_INPUT_LEN, "2048"),
            (ENV_REMAINDER, "pad"),
            (ENV_DEADLINE_MS, "250"),
        ]))
        .unwrap();
        assert_eq!(c.input_len, 2048);
        assert_eq!(c.workgroup_size, 64);
        assert_eq!(c.remainder, RemainderPolicy::Pad);
        assert_eq!(c.run_options().deadline, Some(Duration::from_millis(250)));
    }

    #[test]
    fn unknown_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"input_length": 5}}"#).unwrap();
        assert!(matches!(
            SoftmaxConfig::from_file(file.path()),
            Err(SoftmaxError::Config(_))
        ));
    }

    #[test]
    fn one_lane_groups_from_env_fail_to_load() {
        let mut c = SoftmaxConfig::default();
        c.apply_env_from(env(&[(ENV_WORKGROUP_SIZE, "1")])).unwrap();
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("workgroup_size"));
    }

    #[test]
    fn bad_env_value_names_variable() {
        let mut c = SoftmaxConfig::default();
        let err = c
            .apply_env_from(env(&[(ENV_WORKGROUP_SIZE, "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_WORKGROUP_SIZE));
    }

    #[test]
    fn validate_rejects_degenerate_sizes_and_unknown_backend() {
        let zero_len = SoftmaxConfig {
            input_len: 0,
            ..SoftmaxConfig::default()
        };
        assert!(zero_len.validate().is_err());
        let zero_wg = SoftmaxConfig {
            workgroup_size: 0,
            ..SoftmaxConfig::default()
        };
        assert!(zero_wg.validate().is_err());
        let one_lane = SoftmaxConfig {
            workgroup_size: 1,
            ..SoftmaxConfig::default()
        };
        assert!(matches!(one_lane.validate(), Err(SoftmaxError::Config(_))));
        let bad_backend = SoftmaxConfig {
            wgpu_backend: Some("cuda".into()),
            ..SoftmaxConfig::default()
        };
        assert!(bad_backend.validate().is_err());
    }

    #[test]
    fn context_options_carry_adapter_and_kernel_path() {
        let mut c = SoftmaxConfig::default();
        c.apply_env_from(env(&[
            (ENV_GPU_ADAPTER, "1"),
            (ENV_WGPU_BACKEND, "vulkan"),
            (ENV_KERNEL_PATH, "/tmp/k.wgsl"),
        ]))
        .unwrap();
        let opts = c.context_options().unwrap();
        assert_eq!(opts.adapter, AdapterSelector::Index(1));
        assert_eq!(opts.backends, wgpu::Backends::VULKAN);
        assert_eq!(opts.kernel, KernelSource::File("/tmp/k.wgsl".into()));
    }
}
