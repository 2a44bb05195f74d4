//! CUDA backend implementation.
//!
//! Requires the `cuda` feature and NVIDIA GPU with CUDA support. The CUDA C
//! kernel is compiled at runtime via NVRTC with the defines prepended.

use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg};
use tracing::{debug, trace};

use super::{
    Backend, BufferAccess, ComputeDevice, DeviceBuffer, DeviceInfo, KernelArg, check_extent,
    element_count,
};
use crate::dispatch::LaunchGeometry;
use crate::program::KernelDialect;
use crate::{ComputeError, ComputeResult};

/// Device allocation of `f32` samples.
pub struct CudaBuffer {
    slice: CudaSlice<f32>,
    access: BufferAccess,
}

impl DeviceBuffer for CudaBuffer {
    fn byte_len(&self) -> usize {
        self.slice.len() * size_of::<f32>()
    }

    fn access(&self) -> BufferAccess {
        self.access
    }
}

/// Loaded kernel function.
pub struct CudaKernel {
    function: CudaFunction,
    /// Compiled module - kept alive for kernel lifetime.
    _module: Arc<CudaModule>,
}

/// CUDA compute device (ordinal 0).
pub struct CudaDevice {
    stream: Arc<CudaStream>,
    /// CUDA context - owns the stream and loaded modules.
    ctx: Arc<CudaContext>,
    info: DeviceInfo,
}

impl CudaDevice {
    /// Check if CUDA is available.
    pub fn is_available() -> bool {
        CudaContext::new(0).is_ok()
    }

    pub fn new() -> ComputeResult<Self> {
        let ctx = CudaContext::new(0)
            .map_err(|e| ComputeError::NoDevice(format!("CUDA init failed: {e:?}")))?;
        let stream = ctx.default_stream();

        let info = DeviceInfo {
            backend: Backend::Cuda,
            name: ctx.name().unwrap_or_else(|_| "CUDA device 0".to_string()),
            platform: "NVIDIA CUDA".to_string(),
        };
        debug!(device = %info, "CUDA device selected");

        Ok(Self { stream, ctx, info })
    }

    fn sync(&self) -> ComputeResult<()> {
        self.stream
            .synchronize()
            .map_err(|e| ComputeError::Launch(format!("stream synchronize failed: {e:?}")))
    }
}

impl ComputeDevice for CudaDevice {
    type Buffer = CudaBuffer;
    type Kernel = CudaKernel;

    fn discover() -> ComputeResult<Self> {
        Self::new()
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn dialect(&self) -> KernelDialect {
        KernelDialect::Cuda
    }

    fn compile(&self, source: &str, entry: &str, defines: &[(&str, u32)]) -> ComputeResult<Self::Kernel> {
        let text = format!("{}{source}", KernelDialect::Cuda.preamble(defines));
        trace!(entry, bytes = text.len(), "CudaDevice::compile");

        let ptx = cudarc::nvrtc::compile_ptx(text).map_err(|e| ComputeError::ShaderCompilation {
            entry: entry.to_string(),
            log: format!("{e:?}"),
        })?;
        let module = self.ctx.load_module(ptx).map_err(|e| ComputeError::ShaderCompilation {
            entry: entry.to_string(),
            log: format!("module load failed: {e:?}"),
        })?;
        let function = module.load_function(entry).map_err(|e| ComputeError::ShaderCompilation {
            entry: entry.to_string(),
            log: format!("function lookup failed: {e:?}"),
        })?;

        Ok(CudaKernel { function, _module: module })
    }

    fn allocate(&self, byte_len: usize, access: BufferAccess) -> ComputeResult<Self::Buffer> {
        let count = element_count(byte_len)?;
        let slice: CudaSlice<f32> = self
            .stream
            .alloc_zeros(count)
            .map_err(|e| ComputeError::BufferCreation(format!("Allocate failed: {e:?}")))?;
        Ok(CudaBuffer { slice, access })
    }

    fn upload(&self, buffer: &mut Self::Buffer, data: &[f32]) -> ComputeResult<()> {
        check_extent(buffer.byte_len(), data)?;
        self.stream
            .memcpy_htod(data, &mut buffer.slice)
            .map_err(|e| ComputeError::Transfer(format!("Upload failed: {e:?}")))?;
        self.sync()
    }

    fn launch(
        &self,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Buffer>],
        geometry: &LaunchGeometry,
    ) -> ComputeResult<()> {
        let [grid_x, grid_y] = geometry.workgroups();
        let [block_x, block_y] = geometry.local();
        let cfg = LaunchConfig {
            block_dim: (block_x, block_y, 1),
            grid_dim: (grid_x, grid_y, 1),
            shared_mem_bytes: 0,
        };

        let mut builder = self.stream.launch_builder(&kernel.function);
        for arg in args {
            match arg {
                KernelArg::Buffer(buf) => builder.arg(&buf.slice),
                KernelArg::U32(value) => builder.arg(value),
            };
        }

        #[allow(unsafe_code)]
        unsafe { builder.launch(cfg) }
            .map_err(|e| ComputeError::Launch(format!("convolution launch failed: {e:?}")))?;
        self.sync()
    }

    fn download(&self, buffer: &Self::Buffer, out: &mut [f32]) -> ComputeResult<()> {
        check_extent(buffer.byte_len(), out)?;
        self.stream
            .memcpy_dtoh(&buffer.slice, out)
            .map_err(|e| ComputeError::Transfer(format!("Download failed: {e:?}")))?;
        self.sync()
    }
}
