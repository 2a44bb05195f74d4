//! Compute device backends.
//!
//! Provides the host emulation device plus wgpu, OpenCL and CUDA devices,
//! all behind one capability trait.
//!
//! # Architecture
//!
//! ```text
//! ComputeDevice {discover, compile, allocate, upload, launch, download, release}
//!     +-- HostDevice   (rayon, executes the OpenCL ABI natively)
//!     +-- WgpuDevice   (Vulkan/Metal/DX12)
//!     +-- OpenClDevice (first device of first platform)
//!     +-- CudaDevice   (NVIDIA, NVRTC)
//! ```

mod detect;
mod host_backend;

#[cfg(feature = "wgpu")]
mod wgpu_backend;

#[cfg(feature = "opencl")]
mod opencl_backend;

#[cfg(all(feature = "cuda", not(target_os = "macos")))]
mod cuda_backend;

pub use detect::{AUTO_ORDER, BackendInfo, describe_backends, detect_backends, resolve_auto};
pub use host_backend::{HostBuffer, HostDevice, HostKernel};

#[cfg(feature = "wgpu")]
pub use wgpu_backend::{WgpuBuffer, WgpuDevice, WgpuKernel};

#[cfg(feature = "opencl")]
pub use opencl_backend::{OpenClBuffer, OpenClDevice, OpenClKernel};

#[cfg(all(feature = "cuda", not(target_os = "macos")))]
pub use cuda_backend::{CudaBuffer, CudaDevice, CudaKernel};

use std::fmt;
use std::str::FromStr;

use crate::dispatch::LaunchGeometry;
use crate::program::KernelDialect;
use crate::{ComputeError, ComputeResult};

/// Available compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// First compiled-in backend of [`AUTO_ORDER`].
    #[default]
    Auto,
    /// Host emulation device using rayon.
    Host,
    /// wgpu backend (Vulkan/Metal/DX12).
    Wgpu,
    /// OpenCL backend.
    OpenCl,
    /// NVIDIA CUDA backend.
    Cuda,
}

impl Backend {
    /// Whether support for this backend was built into the crate.
    pub fn is_compiled(&self) -> bool {
        match self {
            Self::Auto | Self::Host => true,
            Self::Wgpu => cfg!(feature = "wgpu"),
            Self::OpenCl => cfg!(feature = "opencl"),
            Self::Cuda => cfg!(all(feature = "cuda", not(target_os = "macos"))),
        }
    }

    /// Check if this backend is available on current system.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto => true,
            Self::Host => true,
            #[cfg(feature = "wgpu")]
            Self::Wgpu => WgpuDevice::is_available(),
            #[cfg(not(feature = "wgpu"))]
            Self::Wgpu => false,
            #[cfg(feature = "opencl")]
            Self::OpenCl => OpenClDevice::is_available(),
            #[cfg(not(feature = "opencl"))]
            Self::OpenCl => false,
            #[cfg(all(feature = "cuda", not(target_os = "macos")))]
            Self::Cuda => CudaDevice::is_available(),
            #[cfg(not(all(feature = "cuda", not(target_os = "macos"))))]
            Self::Cuda => false,
        }
    }

    /// Get human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Host => "host",
            Self::Wgpu => "wgpu",
            Self::OpenCl => "opencl",
            Self::Cuda => "cuda",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "host" | "cpu" => Ok(Self::Host),
            "wgpu" => Ok(Self::Wgpu),
            "opencl" | "cl" => Ok(Self::OpenCl),
            "cuda" => Ok(Self::Cuda),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Description of the selected device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Backend the device belongs to.
    pub backend: Backend,
    /// Device name as reported by the driver.
    pub name: String,
    /// Platform, vendor or driver description.
    pub platform: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({})", self.name, self.backend, self.platform)
    }
}

/// Intended kernel access to a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    ReadOnly,
    WriteOnly,
}

/// Device-resident allocation.
pub trait DeviceBuffer {
    /// Allocated size in bytes.
    fn byte_len(&self) -> usize;

    /// Access the buffer was created with.
    fn access(&self) -> BufferAccess;
}

/// One positional kernel argument.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    /// Device buffer.
    Buffer(&'a B),
    /// 4-byte unsigned scalar.
    U32(u32),
}

impl<B> Clone for KernelArg<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for KernelArg<'_, B> {}

/// Capability interface of a compute device.
///
/// Each backend implements this once; the convolution pipeline only talks
/// to devices through it.
pub trait ComputeDevice {
    /// Backend-specific buffer handle. Dropping it frees the allocation.
    type Buffer: DeviceBuffer;
    /// Compiled kernel entry point together with the program that owns it.
    type Kernel;

    /// Select the device and create its context and in-order queue.
    fn discover() -> ComputeResult<Self>
    where
        Self: Sized;

    /// Selected device.
    fn info(&self) -> &DeviceInfo;

    /// Kernel language this device compiles.
    fn dialect(&self) -> KernelDialect;

    /// Build `source` with `defines` and look up `entry`.
    fn compile(&self, source: &str, entry: &str, defines: &[(&str, u32)]) -> ComputeResult<Self::Kernel>;

    /// Allocate `byte_len` bytes of device memory.
    fn allocate(&self, byte_len: usize, access: BufferAccess) -> ComputeResult<Self::Buffer>;

    /// Blocking host to device copy of the whole buffer.
    fn upload(&self, buffer: &mut Self::Buffer, data: &[f32]) -> ComputeResult<()>;

    /// Enqueue a 2D launch and block until the device reports completion.
    fn launch(
        &self,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Buffer>],
        geometry: &LaunchGeometry,
    ) -> ComputeResult<()>;

    /// Blocking device to host copy of the whole buffer.
    fn download(&self, buffer: &Self::Buffer, out: &mut [f32]) -> ComputeResult<()>;

    /// Release a buffer.
    fn release(&self, buffer: Self::Buffer) {
        drop(buffer);
    }
}

/// Check that a host slice covers exactly the buffer's byte extent.
pub(crate) fn check_extent(buffer_bytes: usize, host: &[f32]) -> ComputeResult<()> {
    let actual = std::mem::size_of_val(host);
    if actual != buffer_bytes {
        return Err(ComputeError::BufferSizeMismatch { expected: buffer_bytes, actual });
    }
    Ok(())
}

/// Number of `f32` elements in `byte_len` bytes, rejecting partial elements.
pub(crate) fn element_count(byte_len: usize) -> ComputeResult<usize> {
    if byte_len == 0 || byte_len % size_of::<f32>() != 0 {
        return Err(ComputeError::BufferCreation(format!(
            "invalid buffer size {byte_len} bytes"
        )));
    }
    Ok(byte_len / size_of::<f32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("OpenCL".parse::<Backend>().unwrap(), Backend::OpenCl);
        assert_eq!("cpu".parse::<Backend>().unwrap(), Backend::Host);
        assert!("metal".parse::<Backend>().is_err());
    }

    #[test]
    fn test_host_always_available() {
        assert!(Backend::Host.is_available());
        assert!(Backend::Auto.is_available());
    }

    #[test]
    fn test_check_extent() {
        assert!(check_extent(12, &[0.0; 3]).is_ok());
        assert!(matches!(
            check_extent(16, &[0.0; 3]),
            Err(ComputeError::BufferSizeMismatch { expected: 16, actual: 12 })
        ));
    }

    #[test]
    fn test_element_count() {
        assert_eq!(element_count(36).unwrap(), 9);
        assert!(element_count(0).is_err());
        assert!(element_count(7).is_err());
    }
}
