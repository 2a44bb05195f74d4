//! Device-offloaded 2D convolution with numeric verification.
//!
//! Runs a multi-channel image through a small square weighting mask on a
//! compute device, then checks the device output against a reference.
//!
//! # Architecture
//!
//! ```text
//! DeviceSession (Host / wgpu / OpenCL / CUDA)
//!     └── ComputeDevice trait  {discover, compile, allocate, upload, launch, download, release}
//!             ├── ProgramCompiler     kernel source + defines -> kernel
//!             ├── BufferOrchestrator  scoped device buffers, blocking transfers
//!             └── DispatchPlanner     16x16 launch geometry, positional kernel ABI
//! ResultVerifier                      tolerance compare against the reference
//! ```
//!
//! # Example
//!
//! ```ignore
//! use gconv_compute::{Backend, ConvConfig, DeviceSession, KernelSource, Matrix};
//!
//! let session = DeviceSession::open(Backend::Auto)?;
//! let source = KernelSource::builtin(session.dialect());
//! let config = ConvConfig::default();
//! let mut result = Matrix::output_for(&image, &mask, config.sizing)?;
//! session.convolve(&source, &image, &mask, &mut result, &config)?;
//! let report = gconv_compute::verify(&result, &answer, config.tolerance, config.max_reported);
//! ```

pub mod backend;
pub mod buffers;
pub mod dispatch;
pub mod matrix;
pub mod pipeline;
pub mod program;
pub mod session;
pub mod verify;

pub use backend::{
    AUTO_ORDER, Backend, BackendInfo, BufferAccess, ComputeDevice, DeviceBuffer, DeviceInfo,
    HostDevice, KernelArg, describe_backends, detect_backends, resolve_auto,
};
pub use dispatch::{DispatchPlanner, LaunchGeometry, TILE_EDGE};
pub use matrix::{IMAGE_CHANNELS, Matrix, SizingMode};
pub use pipeline::{ConvConfig, convolve};
pub use program::{ENTRY_POINT, KernelDialect, KernelSource, ProgramCompiler, SAME_MODE_DEFINE};
pub use session::DeviceSession;
pub use verify::{Mismatch, Tolerance, Verdict, Verification, verify};

#[cfg(feature = "wgpu")]
pub use backend::WgpuDevice;
#[cfg(feature = "opencl")]
pub use backend::OpenClDevice;
#[cfg(all(feature = "cuda", not(target_os = "macos")))]
pub use backend::CudaDevice;

use std::path::PathBuf;
use thiserror::Error;

/// Device orchestration errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("No compute device found: {0}")]
    NoDevice(String),

    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Failed to create device context or queue: {0}")]
    DeviceCreation(String),

    #[error("Failed to create buffer: {0}")]
    BufferCreation(String),

    #[error("Failed to compile kernel `{entry}`:\n{log}")]
    ShaderCompilation { entry: String, log: String },

    #[error("Kernel dialect mismatch: device compiles {expected}, source is {actual}")]
    DialectMismatch { expected: program::KernelDialect, actual: program::KernelDialect },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Kernel launch failed: {0}")]
    Launch(String),

    #[error("Buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: (u32, u32, u32), actual: (u32, u32, u32) },

    #[error("Failed to read kernel source {}: {source}", path.display())]
    KernelSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse failure class of a [`ComputeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No platform or device could be found.
    Discovery,
    /// Context, queue or buffer creation failed.
    Resource,
    /// Kernel source could not be loaded or compiled.
    Compilation,
    /// Host/device transfer or kernel execution failed.
    Execution,
    /// Caller supplied inconsistent shapes or sizes.
    Input,
}

impl ComputeError {
    /// Failure class, used by the binary to word its diagnostics.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoDevice(_) | Self::BackendNotAvailable(_) => ErrorCategory::Discovery,
            Self::DeviceCreation(_) | Self::BufferCreation(_) => ErrorCategory::Resource,
            Self::ShaderCompilation { .. } | Self::DialectMismatch { .. } | Self::KernelSource { .. } => {
                ErrorCategory::Compilation
            }
            Self::Transfer(_) | Self::Launch(_) => ErrorCategory::Execution,
            Self::BufferSizeMismatch { .. } | Self::InvalidDimensions(_) | Self::ShapeMismatch { .. } => {
                ErrorCategory::Input
            }
        }
    }
}

pub type ComputeResult<T> = Result<T, ComputeError>;
