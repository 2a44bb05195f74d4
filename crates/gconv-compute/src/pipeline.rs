//! End-to-end convolution on one device.

use tracing::{debug, info};

use crate::backend::ComputeDevice;
use crate::buffers::BufferOrchestrator;
use crate::dispatch::{DispatchPlanner, LaunchGeometry};
use crate::matrix::{Matrix, SizingMode};
use crate::program::{KernelSource, ProgramCompiler};
use crate::verify::Tolerance;
use crate::{ComputeError, ComputeResult};

/// Convolution and verification settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvConfig {
    /// Output sizing rule.
    pub sizing: SizingMode,
    /// Verification tolerance.
    pub tolerance: Tolerance,
    /// Mismatches listed in a verification report.
    pub max_reported: usize,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            sizing: SizingMode::default(),
            tolerance: Tolerance::default(),
            max_reported: 10,
        }
    }
}

/// Check the mask and the result shape before anything touches the device.
fn validate(image: &Matrix, mask: &Matrix, result: &Matrix, sizing: SizingMode) -> ComputeResult<()> {
    if mask.channels != 1 {
        return Err(ComputeError::InvalidDimensions(format!(
            "mask must have 1 channel, got {}",
            mask.channels
        )));
    }
    if mask.rows != mask.cols {
        return Err(ComputeError::InvalidDimensions(format!(
            "mask must be square, got {}x{}",
            mask.rows, mask.cols
        )));
    }

    let (rows, cols) = sizing.output_dims(image, mask)?;
    let expected = (rows, cols, image.channels);
    if result.shape() != expected {
        return Err(ComputeError::ShapeMismatch { expected, actual: result.shape() });
    }
    Ok(())
}

/// Convolve `image` with `mask` on `device`, writing into `result`.
///
/// `result` must already have the shape `config.sizing` gives for the
/// inputs (see [`Matrix::output_for`]). Device buffers are released on
/// every path out of this function.
pub fn convolve<D: ComputeDevice>(
    device: &D,
    source: &KernelSource,
    image: &Matrix,
    mask: &Matrix,
    result: &mut Matrix,
    config: &ConvConfig,
) -> ComputeResult<LaunchGeometry> {
    validate(image, mask, result, config.sizing)?;

    info!(
        device = %device.info(),
        image = ?image.shape(),
        mask = ?mask.shape(),
        output = ?result.shape(),
        mode = %config.sizing,
        "convolve"
    );

    let kernel = ProgramCompiler::new(device).compile(source, config.sizing)?;

    let orchestrator = BufferOrchestrator::new(device);
    let staged = orchestrator.stage(image, mask, result)?;
    let geometry = DispatchPlanner::new(device).dispatch(&kernel, &staged, image, mask, result)?;
    orchestrator.collect(&staged, result)?;

    debug!(%geometry, "convolution complete");
    Ok(geometry)
}
