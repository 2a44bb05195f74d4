//! gconv - run a 2D convolution kernel on a compute device and verify it.

mod io;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use gconv_compute::program::DEFAULT_KERNEL_DIR;
use gconv_compute::{
    Backend, ComputeError, ConvConfig, DeviceSession, ErrorCategory, IMAGE_CHANNELS, Matrix,
    SizingMode, Tolerance, describe_backends, verify,
};
use tracing::{debug, info, trace};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gconv")]
#[command(author, version, about = "Device-offloaded 2D convolution with result verification")]
#[command(long_about = "
Convolves a 3-channel image with a square single-channel mask on a compute
device, writes the result, then compares it against a reference image.

Matrix files are plain text: a `rows cols channels` header followed by the
samples in row-major, channel-interleaved order. Lines starting with `#`
are ignored.

Examples:
  gconv image.txt mask.txt answer.txt out.txt
  gconv image.txt mask.txt answer.txt out.txt --mode same --backend host
  gconv --list-backends
")]
struct Cli {
    /// Input image (3 channels)
    #[arg(required_unless_present = "list_backends")]
    image: Option<PathBuf>,

    /// Convolution mask (1 channel, square)
    #[arg(required_unless_present = "list_backends")]
    mask: Option<PathBuf>,

    /// Reference result to verify against
    #[arg(required_unless_present = "list_backends")]
    answer: Option<PathBuf>,

    /// Where to write the computed result
    #[arg(required_unless_present = "list_backends")]
    output: Option<PathBuf>,

    /// Compute backend: auto, host, wgpu, opencl, cuda
    #[arg(short, long, env = "GCONV_BACKEND", default_value = "auto")]
    backend: Backend,

    /// Output sizing: valid (shrinks by mask-1) or same (zero-padded)
    #[arg(short, long, default_value = "valid")]
    mode: SizingMode,

    /// Directory holding convolution2D.<cl|wgsl|cu> [default: ./kernels, else built-in]
    #[arg(short, long)]
    kernel_dir: Option<PathBuf>,

    /// Absolute tolerance per sample
    #[arg(short, long, default_value_t = 1e-4)]
    tolerance: f32,

    /// Relative tolerance per sample
    #[arg(long, default_value_t = 1e-4)]
    rel_tolerance: f32,

    /// Mismatches to list in the report
    #[arg(long, default_value_t = 10)]
    max_report: usize,

    /// Exit with status 2 when verification fails
    #[arg(long)]
    strict: bool,

    /// Verbosity (sizes and geometry by default, -v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// List compiled-in backends and exit
    #[arg(long)]
    list_backends: bool,
}

/// Paths of one run, present unless `--list-backends` was given.
struct RunPaths<'a> {
    image: &'a Path,
    mask: &'a Path,
    answer: &'a Path,
    output: &'a Path,
}

impl Cli {
    fn paths(&self) -> Option<RunPaths<'_>> {
        Some(RunPaths {
            image: self.image.as_deref()?,
            mask: self.mask.as_deref()?,
            answer: self.answer.as_deref()?,
            output: self.output.as_deref()?,
        })
    }

    fn config(&self) -> ConvConfig {
        ConvConfig {
            sizing: self.mode,
            tolerance: Tolerance::new(self.tolerance, self.rel_tolerance),
            max_reported: self.max_report,
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Attach a stage description matching the error's category.
fn describe(err: ComputeError) -> anyhow::Error {
    let what = match err.category() {
        ErrorCategory::Discovery => "No usable compute device",
        ErrorCategory::Resource => "Failed to create device resources",
        ErrorCategory::Compilation => "Kernel build failed",
        ErrorCategory::Execution => "Device execution failed",
        ErrorCategory::Input => "Invalid input",
    };
    anyhow::Error::new(err).context(what)
}

/// `--kernel-dir` if given, else `./kernels` when it holds a source for
/// this device, else none (use the built-in kernel).
fn resolve_kernel_dir(explicit: Option<&Path>, session: &DeviceSession) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir.to_path_buf());
    }
    let default = PathBuf::from(DEFAULT_KERNEL_DIR);
    if default.join(session.dialect().file_name()).is_file() {
        Some(default)
    } else {
        debug!("no ./{DEFAULT_KERNEL_DIR} directory, using built-in kernel");
        None
    }
}

fn run(cli: &Cli, paths: RunPaths<'_>) -> Result<ExitCode> {
    let config = cli.config();
    trace!(?config, "gconv::run");

    let image = io::read_matrix(paths.image, IMAGE_CHANNELS)?;
    let mask = io::read_matrix(paths.mask, 1)?;
    let answer = io::read_matrix(paths.answer, IMAGE_CHANNELS)?;

    let session = DeviceSession::open(cli.backend).map_err(describe)?;
    let kernel_dir = resolve_kernel_dir(cli.kernel_dir.as_deref(), &session);
    let source = session.kernel_source(kernel_dir.as_deref()).map_err(describe)?;

    let mut result = Matrix::output_for(&image, &mask, config.sizing).map_err(describe)?;
    info!(
        image = %format_args!("{}x{}", image.rows, image.cols),
        mask = %format_args!("{}x{}", mask.rows, mask.cols),
        mode = %config.sizing,
        device = %session.info(),
        "convolving"
    );

    let geometry = session
        .convolve(&source, &image, &mask, &mut result, &config)
        .map_err(describe)?;
    info!(%geometry, "kernel finished");

    io::write_matrix(paths.output, &result)?;

    let report = verify(&result, &answer, config.tolerance, config.max_reported);
    println!("{report}");

    if !report.passed() && cli.strict {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.list_backends {
        print!("{}", describe_backends());
        return Ok(ExitCode::SUCCESS);
    }

    let paths = cli
        .paths()
        .context("image, mask, answer and output paths are required")?;
    run(&cli, paths)
}
