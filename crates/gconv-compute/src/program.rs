//! Kernel sources and program compilation.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, trace};

use crate::backend::ComputeDevice;
use crate::matrix::SizingMode;
use crate::{ComputeError, ComputeResult};

/// Name of the kernel entry point every dialect exports.
pub const ENTRY_POINT: &str = "convolution2D";

/// Define carrying the sizing mode into the program (0 = valid, 1 = same).
pub const SAME_MODE_DEFINE: &str = "CONV_SAME_MODE";

/// Default directory holding the kernel sources, relative to the working directory.
pub const DEFAULT_KERNEL_DIR: &str = "kernels";

const OPENCL_SOURCE: &str = include_str!("../../../kernels/convolution2D.cl");
const WGSL_SOURCE: &str = include_str!("../../../kernels/convolution2D.wgsl");
const CUDA_SOURCE: &str = include_str!("../../../kernels/convolution2D.cu");

/// Kernel language understood by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelDialect {
    /// OpenCL C (also executed by the host device).
    OpenCl,
    /// WebGPU shading language.
    Wgsl,
    /// CUDA C compiled through NVRTC.
    Cuda,
}

impl KernelDialect {
    /// File extension of the source file.
    pub fn extension(self) -> &'static str {
        match self {
            Self::OpenCl => "cl",
            Self::Wgsl => "wgsl",
            Self::Cuda => "cu",
        }
    }

    /// Kernel shipped in `kernels/`, embedded at build time.
    pub fn builtin_text(self) -> &'static str {
        match self {
            Self::OpenCl => OPENCL_SOURCE,
            Self::Wgsl => WGSL_SOURCE,
            Self::Cuda => CUDA_SOURCE,
        }
    }

    /// Source file name, e.g. `convolution2D.cl`.
    pub fn file_name(self) -> String {
        format!("{ENTRY_POINT}.{}", self.extension())
    }

    /// Render compile-time defines as a source preamble.
    ///
    /// OpenCL receives its defines as build options instead, so its
    /// preamble is empty.
    pub fn preamble(self, defines: &[(&str, u32)]) -> String {
        let mut out = String::new();
        for (name, value) in defines {
            match self {
                Self::OpenCl => {}
                Self::Wgsl => out.push_str(&format!("const {name}: u32 = {value}u;\n")),
                Self::Cuda => out.push_str(&format!("#define {name} {value}\n")),
            }
        }
        out
    }

    /// Render defines as OpenCL build options (`-D NAME=VALUE ...`).
    pub fn build_options(defines: &[(&str, u32)]) -> String {
        defines
            .iter()
            .map(|(name, value)| format!("-D {name}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for KernelDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenCl => "OpenCL C",
            Self::Wgsl => "WGSL",
            Self::Cuda => "CUDA C",
        })
    }
}

/// Kernel source text tagged with its dialect.
#[derive(Debug, Clone)]
pub struct KernelSource {
    dialect: KernelDialect,
    text: String,
    origin: Option<PathBuf>,
}

impl KernelSource {
    /// Wrap source text.
    pub fn new(dialect: KernelDialect, text: impl Into<String>) -> Self {
        Self { dialect, text: text.into(), origin: None }
    }

    /// Copy of the kernel shipped in `kernels/`, embedded at build time.
    pub fn builtin(dialect: KernelDialect) -> Self {
        Self::new(dialect, dialect.builtin_text())
    }

    /// Read `dir/convolution2D.<ext>` for `dialect`.
    pub fn load(dir: &Path, dialect: KernelDialect) -> ComputeResult<Self> {
        let path = dir.join(dialect.file_name());
        trace!(path = %path.display(), "KernelSource::load");
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ComputeError::KernelSource { path: path.clone(), source })?;
        debug!(path = %path.display(), bytes = text.len(), "loaded kernel source");
        Ok(Self { dialect, text, origin: Some(path) })
    }

    pub fn dialect(&self) -> KernelDialect {
        self.dialect
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// File the source came from, if it was loaded from disk.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }
}

/// Builds the convolution kernel for one device.
pub struct ProgramCompiler<'d, D: ComputeDevice> {
    device: &'d D,
}

impl<'d, D: ComputeDevice> ProgramCompiler<'d, D> {
    pub fn new(device: &'d D) -> Self {
        Self { device }
    }

    /// Compile `source` specialised for `mode` and return its entry point.
    ///
    /// A failed build logs the driver's diagnostic output at error level and
    /// returns it verbatim in [`ComputeError::ShaderCompilation`].
    pub fn compile(&self, source: &KernelSource, mode: SizingMode) -> ComputeResult<D::Kernel> {
        let expected = self.device.dialect();
        if source.dialect() != expected {
            return Err(ComputeError::DialectMismatch { expected, actual: source.dialect() });
        }

        let defines = [(SAME_MODE_DEFINE, mode.define_value())];
        debug!(
            device = %self.device.info().name,
            dialect = %expected,
            mode = %mode,
            "building program"
        );

        match self.device.compile(source.text(), ENTRY_POINT, &defines) {
            Ok(kernel) => {
                info!(entry = ENTRY_POINT, "kernel built");
                Ok(kernel)
            }
            Err(err) => {
                if let ComputeError::ShaderCompilation { log, .. } = &err {
                    error!("Build log:\n{log}");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(KernelDialect::OpenCl.file_name(), "convolution2D.cl");
        assert_eq!(KernelDialect::Wgsl.file_name(), "convolution2D.wgsl");
        assert_eq!(KernelDialect::Cuda.file_name(), "convolution2D.cu");
    }

    #[test]
    fn test_preambles() {
        let defines = [(SAME_MODE_DEFINE, 1)];
        assert_eq!(KernelDialect::Wgsl.preamble(&defines), "const CONV_SAME_MODE: u32 = 1u;\n");
        assert_eq!(KernelDialect::Cuda.preamble(&defines), "#define CONV_SAME_MODE 1\n");
        assert!(KernelDialect::OpenCl.preamble(&defines).is_empty());
        assert_eq!(KernelDialect::build_options(&defines), "-D CONV_SAME_MODE=1");
    }

    #[test]
    fn test_builtin_sources_export_entry_point() {
        for dialect in [KernelDialect::OpenCl, KernelDialect::Wgsl, KernelDialect::Cuda] {
            let src = KernelSource::builtin(dialect);
            assert!(src.text().contains(ENTRY_POINT), "{dialect} source lacks entry point");
            assert!(src.origin().is_none());
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = KernelSource::load(Path::new("/nonexistent/kernels"), KernelDialect::OpenCl).unwrap_err();
        match err {
            ComputeError::KernelSource { path, .. } => assert!(path.ends_with("convolution2D.cl")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
