// SPDX-License-Identifier: AGPL-3.0-only

//! Scoped f32 buffers, upload, and staging read-back.
//!
//! Every buffer a launch creates is a [`GpuBuffer`]: it carries a ledger
//! lease and destroys the wgpu buffer on drop, so a launch that returns
//! early (validation error, failed map) still frees device memory.

use wgpu::util::DeviceExt;

use super::GpuContext;
use crate::error::{Result, SoftmaxError};
use crate::memory::{f32_bytes, BufferRole, Lease};

/// Device buffer owned by one launch.
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    lease: Lease,
}

impl GpuBuffer {
    #[must_use]
    pub const fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    #[must_use]
    pub const fn role(&self) -> BufferRole {
        self.lease.role()
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.lease.bytes()
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("role", &self.role())
            .field("size", &self.size())
            .finish()
    }
}

impl GpuContext {
    fn wrap(&self, buffer: wgpu::Buffer, role: BufferRole) -> GpuBuffer {
        let lease = self.ledger.acquire(role, buffer.size());
        GpuBuffer { buffer, lease }
    }

    /// Read-only storage buffer holding `data`.
    #[must_use]
    pub fn create_input_buffer(&self, data: &[f32], label: &str) -> GpuBuffer {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE,
            });
        self.wrap(buffer, BufferRole::ReadOnly)
    }

    /// Writable storage buffer for `count` f32 results.
    #[must_use]
    pub fn create_output_buffer(&self, count: usize, label: &str) -> GpuBuffer {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: f32_bytes(count),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        self.wrap(buffer, BufferRole::WriteOnly)
    }

    /// Uniform buffer from raw bytes.
    #[must_use]
    pub fn create_uniform_buffer(&self, data: &[u8], label: &str) -> GpuBuffer {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage: wgpu::BufferUsages::UNIFORM,
            });
        self.wrap(buffer, BufferRole::Uniform)
    }

    /// Staging buffer for reading `count` f32 values back to the host.
    #[must_use]
    pub fn create_staging_buffer(&self, count: usize, label: &str) -> GpuBuffer {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: f32_bytes(count),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.wrap(buffer, BufferRole::Staging)
    }

    /// Map a staging buffer after submit and read `count` values.
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::Transfer`] if the map callback fails, the
    /// channel is dropped, or the buffer holds fewer than `count` values.
    pub fn read_staging_f32(&self, staging: &GpuBuffer, count: usize) -> Result<Vec<f32>> {
        let slice = staging.raw().slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| SoftmaxError::Transfer("map callback: channel recv failed".into()))?
            .map_err(|e| SoftmaxError::Transfer(format!("buffer mapping: {e}")))?;

        let data = slice.get_mapped_range();
        let mut values = mapped_bytes_to_f32(&data);
        drop(data);
        staging.raw().unmap();

        if values.len() < count {
            return Err(SoftmaxError::Transfer(format!(
                "staging holds {} values, expected {count}",
                values.len()
            )));
        }
        values.truncate(count);
        Ok(values)
    }
}

/// Convert mapped buffer bytes to f32 values.
///
/// Mapped ranges are normally aligned, so `bytemuck::try_cast_slice`
/// succeeds; otherwise the bytes are decoded little-endian.
#[must_use]
pub fn mapped_bytes_to_f32(data: &[u8]) -> Vec<f32> {
    bytemuck::try_cast_slice(data).map_or_else(
        |_| {
            data.chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect()
        },
        <[f32]>::to_vec,
    )
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn mapped_bytes_decode_aligned_and_unaligned() {
        let values = [1.5_f32, -3.4, 0.0];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(mapped_bytes_to_f32(&bytes), values);

        let mut shifted = vec![0_u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(mapped_bytes_to_f32(&shifted[1..]), values);
    }
}
