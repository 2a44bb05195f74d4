//! Device session: one opened device of whichever backend was selected.

use std::path::Path;

use tracing::{debug, info};

#[cfg(all(feature = "cuda", not(target_os = "macos")))]
use crate::backend::CudaDevice;
#[cfg(feature = "opencl")]
use crate::backend::OpenClDevice;
#[cfg(feature = "wgpu")]
use crate::backend::WgpuDevice;
use crate::backend::{Backend, ComputeDevice, DeviceInfo, HostDevice, resolve_auto};
use crate::dispatch::LaunchGeometry;
use crate::matrix::Matrix;
use crate::pipeline::{self, ConvConfig};
use crate::program::{KernelDialect, KernelSource};
use crate::{ComputeError, ComputeResult};

/// Opened compute device. Dropping it tears down the queue, then the context.
pub enum DeviceSession {
    Host(HostDevice),
    #[cfg(feature = "wgpu")]
    Wgpu(WgpuDevice),
    #[cfg(feature = "opencl")]
    OpenCl(OpenClDevice),
    #[cfg(all(feature = "cuda", not(target_os = "macos")))]
    Cuda(CudaDevice),
}

/// Run `$body` with `$dev` bound to the inner device.
macro_rules! with_device {
    ($session:expr, $dev:ident => $body:expr) => {
        match $session {
            DeviceSession::Host($dev) => $body,
            #[cfg(feature = "wgpu")]
            DeviceSession::Wgpu($dev) => $body,
            #[cfg(feature = "opencl")]
            DeviceSession::OpenCl($dev) => $body,
            #[cfg(all(feature = "cuda", not(target_os = "macos")))]
            DeviceSession::Cuda($dev) => $body,
        }
    };
}

impl DeviceSession {
    /// Open a device for `backend`.
    ///
    /// `Backend::Auto` stands for [`resolve_auto`]. Exactly one backend is
    /// tried; its discovery error is returned as is.
    pub fn open(backend: Backend) -> ComputeResult<Self> {
        let backend = match backend {
            Backend::Auto => {
                let resolved = resolve_auto();
                debug!(backend = %resolved, "auto resolved");
                resolved
            }
            other => other,
        };

        let session = match backend {
            Backend::Host => Self::Host(HostDevice::discover()?),
            #[cfg(feature = "wgpu")]
            Backend::Wgpu => Self::Wgpu(WgpuDevice::discover()?),
            #[cfg(feature = "opencl")]
            Backend::OpenCl => Self::OpenCl(OpenClDevice::discover()?),
            #[cfg(all(feature = "cuda", not(target_os = "macos")))]
            Backend::Cuda => Self::Cuda(CudaDevice::discover()?),
            #[allow(unreachable_patterns)]
            other => {
                return Err(ComputeError::BackendNotAvailable(format!(
                    "{other} (not compiled in)"
                )));
            }
        };

        info!(device = %session.info(), "device session opened");
        Ok(session)
    }

    /// Selected device.
    pub fn info(&self) -> &DeviceInfo {
        with_device!(self, dev => dev.info())
    }

    pub fn backend(&self) -> Backend {
        self.info().backend
    }

    /// Kernel language the device compiles.
    pub fn dialect(&self) -> KernelDialect {
        with_device!(self, dev => dev.dialect())
    }

    /// Kernel source for this device: `dir/convolution2D.<ext>` if `dir`
    /// is given, the built-in copy otherwise.
    pub fn kernel_source(&self, dir: Option<&Path>) -> ComputeResult<KernelSource> {
        match dir {
            Some(dir) => KernelSource::load(dir, self.dialect()),
            None => Ok(KernelSource::builtin(self.dialect())),
        }
    }

    /// See [`pipeline::convolve`].
    pub fn convolve(
        &self,
        source: &KernelSource,
        image: &Matrix,
        mask: &Matrix,
        result: &mut Matrix,
        config: &ConvConfig,
    ) -> ComputeResult<LaunchGeometry> {
        with_device!(self, dev => pipeline::convolve(dev, source, image, mask, result, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::SizingMode;

    #[test]
    fn test_open_host() {
        let session = DeviceSession::open(Backend::Host).unwrap();
        assert_eq!(session.backend(), Backend::Host);
        assert_eq!(session.dialect(), KernelDialect::OpenCl);
    }

    #[test]
    fn test_auto_opens_only_resolved_backend() {
        let target = resolve_auto();
        match DeviceSession::open(Backend::Auto) {
            Ok(session) => assert_eq!(session.backend(), target),
            Err(err) => {
                // Same failure as naming the backend explicitly, no host retry
                let explicit = DeviceSession::open(target).err().map(|e| e.category());
                assert_eq!(Some(err.category()), explicit);
            }
        }
    }

    #[cfg(not(feature = "opencl"))]
    #[test]
    fn test_backend_not_compiled_in() {
        match DeviceSession::open(Backend::OpenCl) {
            Err(ComputeError::BackendNotAvailable(msg)) => assert!(msg.contains("opencl")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a backend that is not compiled in"),
        }
    }

    #[cfg(not(all(feature = "cuda", not(target_os = "macos"))))]
    #[test]
    fn test_cuda_not_compiled_in() {
        assert!(matches!(
            DeviceSession::open(Backend::Cuda),
            Err(ComputeError::BackendNotAvailable(_))
        ));
    }

    #[test]
    fn test_convolve_via_session() {
        let session = DeviceSession::open(Backend::Host).unwrap();
        let source = session.kernel_source(None).unwrap();
        let image = Matrix::image(vec![1.0; 4 * 4 * 3], 4, 4).unwrap();
        let mask = Matrix::mask(vec![1.0; 4], 2, 2).unwrap();
        let mut result = Matrix::output_for(&image, &mask, SizingMode::Valid).unwrap();

        session
            .convolve(&source, &image, &mask, &mut result, &ConvConfig::default())
            .unwrap();
        assert_eq!(result.shape(), (3, 3, 3));
        assert!(result.data().iter().all(|&v| v == 4.0));
    }
}
