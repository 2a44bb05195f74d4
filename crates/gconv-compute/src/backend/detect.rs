//! Backend listing and `auto` resolution.
//!
//! `auto` is settled when the crate is built: it names the first
//! compiled-in entry of [`AUTO_ORDER`]. Resolution never probes hardware,
//! so a missing device surfaces as that backend's discovery error.

use super::Backend;

/// Order in which `auto` considers compiled-in backends.
///
/// The host device is last: it is chosen only when the build carries no
/// device backend at all.
pub const AUTO_ORDER: [Backend; 4] = [Backend::OpenCl, Backend::Cuda, Backend::Wgpu, Backend::Host];

/// One compiled-in backend as reported by `--list-backends`.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub backend: Backend,
    /// A device of this backend answered the probe.
    pub available: bool,
    /// `auto` resolves here.
    pub auto: bool,
    pub description: &'static str,
}

/// Backend that [`Backend::Auto`] stands for in this build.
pub fn resolve_auto() -> Backend {
    AUTO_ORDER
        .into_iter()
        .find(Backend::is_compiled)
        .unwrap_or(Backend::Host)
}

fn description(backend: Backend) -> &'static str {
    match backend {
        Backend::OpenCl => "first device of first OpenCL platform",
        Backend::Cuda => "CUDA device 0, NVRTC",
        Backend::Wgpu => "first wgpu adapter (Vulkan/Metal/DX12)",
        Backend::Host => "host emulation of the built-in OpenCL kernel",
        Backend::Auto => "",
    }
}

/// Probe every compiled-in backend, in [`AUTO_ORDER`].
pub fn detect_backends() -> Vec<BackendInfo> {
    let auto = resolve_auto();
    AUTO_ORDER
        .into_iter()
        .filter(Backend::is_compiled)
        .map(|backend| BackendInfo {
            backend,
            available: backend.is_available(),
            auto: backend == auto,
            description: description(backend),
        })
        .collect()
}

/// One line per compiled-in backend: `[+] name: description (auto)`.
pub fn describe_backends() -> String {
    detect_backends()
        .iter()
        .map(|info| {
            format!(
                "[{}] {}: {}{}\n",
                if info.available { '+' } else { '-' },
                info.backend,
                info.description,
                if info.auto { " (auto)" } else { "" }
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_always_listed() {
        let host = detect_backends().into_iter().find(|b| b.backend == Backend::Host).unwrap();
        assert!(host.available);
    }

    #[test]
    fn test_exactly_one_auto_entry() {
        let backends = detect_backends();
        let autos: Vec<_> = backends.iter().filter(|b| b.auto).collect();
        assert_eq!(autos.len(), 1);
        assert_eq!(autos[0].backend, resolve_auto());
    }

    #[test]
    fn test_auto_ignores_availability() {
        // Same answer every time, whatever the probes report
        let first = resolve_auto();
        assert!(first.is_compiled());
        assert_ne!(first, Backend::Auto);
        assert_eq!(resolve_auto(), first);
    }

    #[cfg(not(any(feature = "wgpu", feature = "opencl", feature = "cuda")))]
    #[test]
    fn test_auto_is_host_without_device_backends() {
        assert_eq!(resolve_auto(), Backend::Host);
    }

    #[cfg(feature = "opencl")]
    #[test]
    fn test_auto_prefers_opencl_when_built() {
        assert_eq!(resolve_auto(), Backend::OpenCl);
    }

    #[test]
    fn test_describe_marks_host() {
        assert!(describe_backends().contains("[+] host"));
    }
}
