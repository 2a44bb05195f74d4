//! OpenCL backend implementation.
//!
//! Selects the first device of the first platform, builds the OpenCL C
//! program with `-D` defines, and drives one blocking in-order queue.

use std::ptr;

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_ALL, Device};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_WRITE_ONLY};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::CL_BLOCKING;
use tracing::{debug, trace};

use super::{
    Backend, BufferAccess, ComputeDevice, DeviceBuffer, DeviceInfo, KernelArg, check_extent,
    element_count,
};
use crate::dispatch::LaunchGeometry;
use crate::program::KernelDialect;
use crate::{ComputeError, ComputeResult};

/// Device memory object holding `f32` samples.
pub struct OpenClBuffer {
    buffer: Buffer<f32>,
    count: usize,
    access: BufferAccess,
}

impl DeviceBuffer for OpenClBuffer {
    fn byte_len(&self) -> usize {
        self.count * size_of::<f32>()
    }

    fn access(&self) -> BufferAccess {
        self.access
    }
}

/// Kernel object and the program that owns it.
pub struct OpenClKernel {
    kernel: Kernel,
    _program: Program,
}

/// OpenCL compute device.
pub struct OpenClDevice {
    // Drop order: queue, then context.
    queue: CommandQueue,
    context: Context,
    _device: Device,
    info: DeviceInfo,
}

impl OpenClDevice {
    /// Check if any platform exposes at least one device.
    pub fn is_available() -> bool {
        get_platforms()
            .map(|platforms| {
                platforms
                    .first()
                    .and_then(|p| p.get_devices(CL_DEVICE_TYPE_ALL).ok())
                    .is_some_and(|ids| !ids.is_empty())
            })
            .unwrap_or(false)
    }

    /// Open the first device of the first platform.
    pub fn new() -> ComputeResult<Self> {
        let platforms = get_platforms().map_err(|e| ComputeError::NoDevice(format!("no OpenCL platforms: {e}")))?;
        let platform = platforms
            .first()
            .ok_or_else(|| ComputeError::NoDevice("no OpenCL platforms".into()))?;
        let device_id = platform
            .get_devices(CL_DEVICE_TYPE_ALL)
            .map_err(|e| ComputeError::NoDevice(format!("cannot list devices: {e}")))?
            .first()
            .copied()
            .ok_or_else(|| ComputeError::NoDevice("platform has no devices".into()))?;

        let device = Device::new(device_id);
        let info = DeviceInfo {
            backend: Backend::OpenCl,
            name: device.name().unwrap_or_default().trim().to_string(),
            platform: platform.name().unwrap_or_default().trim().to_string(),
        };

        let context = Context::from_device(&device).map_err(|e| ComputeError::DeviceCreation(format!("context: {e}")))?;

        // OpenCL 1.2 API; create_default_with_properties needs 2.0.
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, 0)
            .map_err(|e| ComputeError::DeviceCreation(format!("command queue: {e}")))?;

        debug!(device = %info, "OpenCL device selected");
        Ok(Self { queue, context, _device: device, info })
    }
}

impl ComputeDevice for OpenClDevice {
    type Buffer = OpenClBuffer;
    type Kernel = OpenClKernel;

    fn discover() -> ComputeResult<Self> {
        Self::new()
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn dialect(&self) -> KernelDialect {
        KernelDialect::OpenCl
    }

    fn compile(&self, source: &str, entry: &str, defines: &[(&str, u32)]) -> ComputeResult<Self::Kernel> {
        let options = KernelDialect::build_options(defines);
        trace!(entry, options = %options, "OpenClDevice::compile");

        // The error string is the device build log.
        let program = Program::create_and_build_from_source(&self.context, source, &options)
            .map_err(|log| ComputeError::ShaderCompilation { entry: entry.to_string(), log })?;
        let kernel = Kernel::create(&program, entry).map_err(|e| ComputeError::ShaderCompilation {
            entry: entry.to_string(),
            log: format!("kernel lookup failed: {e}"),
        })?;

        Ok(OpenClKernel { kernel, _program: program })
    }

    fn allocate(&self, byte_len: usize, access: BufferAccess) -> ComputeResult<Self::Buffer> {
        let count = element_count(byte_len)?;
        let flags = match access {
            BufferAccess::ReadOnly => CL_MEM_READ_ONLY,
            BufferAccess::WriteOnly => CL_MEM_WRITE_ONLY,
        };
        let buffer = unsafe {
            Buffer::<f32>::create(&self.context, flags, count, ptr::null_mut())
                .map_err(|e| ComputeError::BufferCreation(format!("{byte_len} bytes: {e}")))?
        };
        Ok(OpenClBuffer { buffer, count, access })
    }

    fn upload(&self, buffer: &mut Self::Buffer, data: &[f32]) -> ComputeResult<()> {
        check_extent(buffer.byte_len(), data)?;
        let event = unsafe {
            self.queue
                .enqueue_write_buffer(&mut buffer.buffer, CL_BLOCKING, 0, data, &[])
                .map_err(|e| ComputeError::Transfer(format!("write: {e}")))?
        };
        event.wait().map_err(|e| ComputeError::Transfer(format!("write: {e}")))?;
        Ok(())
    }

    fn launch(
        &self,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Buffer>],
        geometry: &LaunchGeometry,
    ) -> ComputeResult<()> {
        let global = geometry.global().map(|g| g as usize);
        let local = geometry.local().map(|l| l as usize);

        let event = unsafe {
            let mut exec = ExecuteKernel::new(&kernel.kernel);
            for arg in args {
                match arg {
                    KernelArg::Buffer(buf) => exec.set_arg(&buf.buffer),
                    KernelArg::U32(value) => exec.set_arg(value),
                };
            }
            exec.set_global_work_sizes(&global)
                .set_local_work_sizes(&local)
                .enqueue_nd_range(&self.queue)
                .map_err(|e| ComputeError::Launch(format!("enqueue: {e}")))?
        };
        event.wait().map_err(|e| ComputeError::Launch(format!("execution: {e}")))?;
        Ok(())
    }

    fn download(&self, buffer: &Self::Buffer, out: &mut [f32]) -> ComputeResult<()> {
        check_extent(buffer.byte_len(), out)?;
        let event = unsafe {
            self.queue
                .enqueue_read_buffer(&buffer.buffer, CL_BLOCKING, 0, out, &[])
                .map_err(|e| ComputeError::Transfer(format!("read: {e}")))?
        };
        event.wait().map_err(|e| ComputeError::Transfer(format!("read: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_if_available() {
        if !OpenClDevice::is_available() {
            eprintln!("No OpenCL device, skipping");
            return;
        }
        let dev = OpenClDevice::new().unwrap();
        assert_eq!(dev.dialect(), KernelDialect::OpenCl);

        let err = dev.compile("__kernel void broken( {", "convolution2D", &[]);
        assert!(matches!(err, Err(ComputeError::ShaderCompilation { .. })));
    }
}
