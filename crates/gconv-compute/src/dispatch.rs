//! Launch geometry and kernel dispatch.
//!
//! Work-items map to output pixels: axis 0 (`x`) runs over output columns,
//! axis 1 (`y`) over output rows. Both axes use [`TILE_EDGE`]-sized
//! work-groups and the global extent is rounded up to a whole number of
//! groups; surplus work-items fall outside the output and do nothing.

use std::fmt;

use tracing::{debug, info};

use crate::backend::{ComputeDevice, KernelArg};
use crate::buffers::StagedBuffers;
use crate::matrix::Matrix;
use crate::ComputeResult;

/// Work-group edge length on both axes.
pub const TILE_EDGE: u32 = 16;

/// 2D NDRange covering one output matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    out_rows: u32,
    out_cols: u32,
}

impl LaunchGeometry {
    /// Geometry for an output of `rows x cols` pixels.
    pub fn for_output(rows: u32, cols: u32) -> Self {
        Self { out_rows: rows, out_cols: cols }
    }

    /// Output extent as (rows, cols).
    pub fn output(&self) -> (u32, u32) {
        (self.out_rows, self.out_cols)
    }

    /// Global work size `[x, y]`, each a multiple of [`TILE_EDGE`].
    pub fn global(&self) -> [u32; 2] {
        let [gx, gy] = self.workgroups();
        [gx * TILE_EDGE, gy * TILE_EDGE]
    }

    /// Local work size `[x, y]`.
    pub fn local(&self) -> [u32; 2] {
        [TILE_EDGE, TILE_EDGE]
    }

    /// Number of work-groups `[x, y]`.
    pub fn workgroups(&self) -> [u32; 2] {
        [round_up_groups(self.out_cols), round_up_groups(self.out_rows)]
    }

    /// Work-items that map to no output pixel.
    pub fn idle_items(&self) -> u64 {
        let [gx, gy] = self.global();
        gx as u64 * gy as u64 - self.out_cols as u64 * self.out_rows as u64
    }
}

impl fmt::Display for LaunchGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [gx, gy] = self.global();
        let [lx, ly] = self.local();
        write!(
            f,
            "global {gx}x{gy}, local {lx}x{ly}, output {}x{}",
            self.out_cols, self.out_rows
        )
    }
}

#[inline]
fn round_up_groups(n: u32) -> u32 {
    n.div_ceil(TILE_EDGE)
}

/// Binds the positional kernel arguments and launches over the output.
pub struct DispatchPlanner<'d, D: ComputeDevice> {
    device: &'d D,
}

impl<'d, D: ComputeDevice> DispatchPlanner<'d, D> {
    pub fn new(device: &'d D) -> Self {
        Self { device }
    }

    /// Launch `kernel` over `output` and block until it completes.
    ///
    /// Argument order: image, output, mask, width (image columns),
    /// height (image rows), mask width, channels.
    pub fn dispatch(
        &self,
        kernel: &D::Kernel,
        buffers: &StagedBuffers<'_, D>,
        image: &Matrix,
        mask: &Matrix,
        output: &Matrix,
    ) -> ComputeResult<LaunchGeometry> {
        let geometry = LaunchGeometry::for_output(output.rows, output.cols);

        let args = [
            KernelArg::Buffer(&*buffers.image),
            KernelArg::Buffer(&*buffers.output),
            KernelArg::Buffer(&*buffers.mask),
            KernelArg::U32(image.cols),
            KernelArg::U32(image.rows),
            KernelArg::U32(mask.cols),
            KernelArg::U32(image.channels),
        ];

        info!(%geometry, "launching kernel");
        debug!(
            width = image.cols,
            height = image.rows,
            mask_width = mask.cols,
            channels = image.channels,
            idle = geometry.idle_items(),
            "kernel arguments"
        );

        self.device.launch(kernel, &args, &geometry)?;
        Ok(geometry)
    }
}
