//! wgpu backend implementation.
//!
//! Runs the WGSL kernel through a compute pipeline on the first adapter wgpu
//! enumerates. Positional arguments map onto bindings: buffers take bindings
//! `0..n` in order, the `u32` scalars are packed in order into one uniform at
//! binding `n`.

use bytemuck::{Pod, Zeroable};
use tracing::{debug, trace};
use wgpu::util::DeviceExt;

use super::{
    Backend, BufferAccess, ComputeDevice, DeviceBuffer, DeviceInfo, KernelArg, check_extent,
    element_count,
};
use crate::dispatch::LaunchGeometry;
use crate::program::KernelDialect;
use crate::{ComputeError, ComputeResult};

/// Scalar uniform block, one 16-byte row.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ScalarRow {
    values: [u32; 4],
}

/// Pack scalars into 16-byte uniform rows.
fn pack_scalars(scalars: &[u32]) -> Vec<ScalarRow> {
    scalars
        .chunks(4)
        .map(|chunk| {
            let mut values = [0u32; 4];
            values[..chunk.len()].copy_from_slice(chunk);
            ScalarRow { values }
        })
        .collect()
}

/// Storage buffer on the wgpu device.
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size_bytes: u64,
    access: BufferAccess,
}

impl DeviceBuffer for WgpuBuffer {
    fn byte_len(&self) -> usize {
        self.size_bytes as usize
    }

    fn access(&self) -> BufferAccess {
        self.access
    }
}

/// Compiled compute pipeline.
pub struct WgpuKernel {
    pipeline: wgpu::ComputePipeline,
    entry: String,
}

/// wgpu compute device.
pub struct WgpuDevice {
    // Queue is declared first so it is dropped before the device.
    queue: wgpu::Queue,
    device: wgpu::Device,
    info: DeviceInfo,
}

impl WgpuDevice {
    /// Check if any wgpu adapter is present.
    pub fn is_available() -> bool {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        !instance.enumerate_adapters(wgpu::Backends::all()).is_empty()
    }

    /// Open the first adapter and create its device and queue.
    pub fn new() -> ComputeResult<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> ComputeResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .next()
            .ok_or_else(|| ComputeError::NoDevice("wgpu reports no adapters".into()))?;

        let adapter_info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gconv_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| ComputeError::DeviceCreation(e.to_string()))?;

        let info = DeviceInfo {
            backend: Backend::Wgpu,
            name: adapter_info.name.clone(),
            platform: format!("{:?} {}", adapter_info.backend, adapter_info.driver).trim().to_string(),
        };
        debug!(device = %info, "wgpu device selected");

        Ok(Self { queue, device, info })
    }

    /// Wait for all submitted work.
    fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

impl ComputeDevice for WgpuDevice {
    type Buffer = WgpuBuffer;
    type Kernel = WgpuKernel;

    fn discover() -> ComputeResult<Self> {
        Self::new()
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn dialect(&self) -> KernelDialect {
        KernelDialect::Wgsl
    }

    fn compile(&self, source: &str, entry: &str, defines: &[(&str, u32)]) -> ComputeResult<Self::Kernel> {
        let text = format!("{}{source}", KernelDialect::Wgsl.preamble(defines));
        trace!(entry, bytes = text.len(), "WgpuDevice::compile");

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(entry),
            source: wgpu::ShaderSource::Wgsl(text.into()),
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry),
            layout: None, // Auto layout
            module: &module,
            entry_point: Some(entry),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::ShaderCompilation { entry: entry.to_string(), log: err.to_string() });
        }

        Ok(WgpuKernel { pipeline, entry: entry.to_string() })
    }

    fn allocate(&self, byte_len: usize, access: BufferAccess) -> ComputeResult<Self::Buffer> {
        element_count(byte_len)?;
        let size_bytes = byte_len as u64;
        let max = self.device.limits().max_storage_buffer_binding_size as u64;
        if size_bytes > max {
            return Err(ComputeError::BufferCreation(format!(
                "{size_bytes} bytes exceeds device binding limit of {max}"
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match access {
                BufferAccess::ReadOnly => "input_buffer",
                BufferAccess::WriteOnly => "output_buffer",
            }),
            size: size_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::BufferCreation(err.to_string()));
        }

        Ok(WgpuBuffer { buffer, size_bytes, access })
    }

    fn upload(&self, buffer: &mut Self::Buffer, data: &[f32]) -> ComputeResult<()> {
        check_extent(buffer.byte_len(), data)?;
        self.queue.write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(data));
        self.queue.submit(std::iter::empty::<wgpu::CommandBuffer>());
        self.wait_idle();
        Ok(())
    }

    fn launch(
        &self,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Buffer>],
        geometry: &LaunchGeometry,
    ) -> ComputeResult<()> {
        let mut entries = Vec::new();
        let mut scalars = Vec::new();
        for arg in args {
            match arg {
                KernelArg::Buffer(buf) => entries.push(wgpu::BindGroupEntry {
                    binding: entries.len() as u32,
                    resource: buf.buffer.as_entire_binding(),
                }),
                KernelArg::U32(v) => scalars.push(*v),
            }
        }

        let scalar_buf = (!scalars.is_empty()).then(|| {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("scalar_uniform"),
                contents: bytemuck::cast_slice(&pack_scalars(&scalars)),
                usage: wgpu::BufferUsages::UNIFORM,
            })
        });
        if let Some(buf) = &scalar_buf {
            entries.push(wgpu::BindGroupEntry {
                binding: entries.len() as u32,
                resource: buf.as_entire_binding(),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let layout = kernel.pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("conv_bind_group"),
            layout: &layout,
            entries: &entries,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("compute_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("compute_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let [gx, gy] = geometry.workgroups();
            pass.dispatch_workgroups(gx, gy, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::Launch(format!("{}: {err}", kernel.entry)));
        }
        self.wait_idle();
        Ok(())
    }

    fn download(&self, buffer: &Self::Buffer, out: &mut [f32]) -> ComputeResult<()> {
        check_extent(buffer.byte_len(), out)?;
        let size = buffer.size_bytes;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging_buffer"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.wait_idle();

        rx.recv()
            .map_err(|_| ComputeError::Transfer("map channel closed".into()))?
            .map_err(|e| ComputeError::Transfer(format!("map failed: {e}")))?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(bytemuck::cast_slice(&mapped));
        }
        staging.unmap();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_scalars_pads_rows() {
        let rows = pack_scalars(&[7, 5, 3, 3]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, [7, 5, 3, 3]);

        let rows = pack_scalars(&[1, 2, 3, 4, 5]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].values, [5, 0, 0, 0]);
        assert_eq!(std::mem::size_of_val(rows.as_slice()), 32);
    }

    #[test]
    fn test_device_if_available() {
        if !WgpuDevice::is_available() {
            eprintln!("No wgpu adapter, skipping");
            return;
        }
        let dev = WgpuDevice::new().unwrap();
        assert_eq!(dev.dialect(), KernelDialect::Wgsl);
        let mut buf = dev.allocate(16, BufferAccess::ReadOnly).unwrap();
        dev.upload(&mut buf, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut out = [0.0; 4];
        dev.download(&buf, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }
}
