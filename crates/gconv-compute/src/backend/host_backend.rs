//! Host emulation device using rayon for parallelization.
//!
//! The host cannot compile OpenCL C. It accepts exactly the built-in
//! `convolution2D.cl` program (line endings and trailing whitespace aside)
//! and executes that kernel's seven-argument ABI natively over the same
//! NDRange a real device would see. Any other source is a build failure
//! whose log points at the first line that differs.

use std::cell::RefCell;

use rayon::prelude::*;
use tracing::{debug, trace};

use super::{
    Backend, BufferAccess, ComputeDevice, DeviceBuffer, DeviceInfo, KernelArg, check_extent,
    element_count,
};
use crate::dispatch::LaunchGeometry;
use crate::program::{ENTRY_POINT, KernelDialect, SAME_MODE_DEFINE};
use crate::{ComputeError, ComputeResult};

/// Host buffer - data stored in RAM.
pub struct HostBuffer {
    data: RefCell<Vec<f32>>,
    access: BufferAccess,
}

impl DeviceBuffer for HostBuffer {
    fn byte_len(&self) -> usize {
        self.data.borrow().len() * size_of::<f32>()
    }

    fn access(&self) -> BufferAccess {
        self.access
    }
}

/// Entry point resolved from the program source.
#[derive(Debug, Clone)]
pub struct HostKernel {
    entry: String,
    same_mode: bool,
}

impl HostKernel {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Whether the program was built with `CONV_SAME_MODE=1`.
    pub fn same_mode(&self) -> bool {
        self.same_mode
    }
}

/// Host emulation device.
pub struct HostDevice {
    info: DeviceInfo,
}

impl HostDevice {
    pub fn new() -> Self {
        let cores = sys_info::cpu_num().unwrap_or(1);
        // Fall back to 4GB if detection fails
        let avail_mb = sys_info::mem_info()
            .map(|m| m.avail / 1024)
            .unwrap_or(4 * 1024);

        Self {
            info: DeviceInfo {
                backend: Backend::Host,
                name: "host".to_string(),
                platform: format!("{cores} logical cores, {avail_mb} MB available"),
            },
        }
    }

    /// The host device is always present.
    pub fn is_available() -> bool {
        true
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn discover() -> ComputeResult<Self> {
        let device = Self::new();
        debug!(device = %device.info, "host device selected");
        Ok(device)
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn dialect(&self) -> KernelDialect {
        KernelDialect::OpenCl
    }

    fn compile(&self, source: &str, entry: &str, defines: &[(&str, u32)]) -> ComputeResult<Self::Kernel> {
        trace!(entry, bytes = source.len(), "HostDevice::compile");
        if entry != ENTRY_POINT {
            return Err(ComputeError::ShaderCompilation {
                entry: entry.to_string(),
                log: format!("error: host program has no kernel `{entry}`, only `{ENTRY_POINT}`"),
            });
        }
        if let Some(log) = builtin_divergence(source) {
            return Err(ComputeError::ShaderCompilation { entry: entry.to_string(), log });
        }

        let same_mode = defines
            .iter()
            .find(|(name, _)| *name == SAME_MODE_DEFINE)
            .is_some_and(|(_, value)| *value != 0);

        Ok(HostKernel { entry: entry.to_string(), same_mode })
    }

    fn allocate(&self, byte_len: usize, access: BufferAccess) -> ComputeResult<Self::Buffer> {
        let count = element_count(byte_len)?;
        Ok(HostBuffer { data: RefCell::new(vec![0.0; count]), access })
    }

    fn upload(&self, buffer: &mut Self::Buffer, data: &[f32]) -> ComputeResult<()> {
        let dst = buffer.data.get_mut();
        check_extent(dst.len() * size_of::<f32>(), data)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn launch(
        &self,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Buffer>],
        geometry: &LaunchGeometry,
    ) -> ComputeResult<()> {
        let [
            KernelArg::Buffer(image),
            KernelArg::Buffer(output),
            KernelArg::Buffer(mask),
            KernelArg::U32(width),
            KernelArg::U32(height),
            KernelArg::U32(mask_width),
            KernelArg::U32(channels),
        ] = args
        else {
            return Err(ComputeError::Launch(format!(
                "{}: arguments do not match (buffer, buffer, buffer, u32, u32, u32, u32)",
                kernel.entry
            )));
        };

        let params = ConvParams {
            width: *width as usize,
            height: *height as usize,
            mask_width: *mask_width as usize,
            channels: *channels as usize,
            same_mode: kernel.same_mode,
        };

        let src = image
            .data
            .try_borrow()
            .map_err(|_| ComputeError::Launch("image buffer is aliased".into()))?;
        let weights = mask
            .data
            .try_borrow()
            .map_err(|_| ComputeError::Launch("mask buffer is aliased".into()))?;
        let mut dst = output
            .data
            .try_borrow_mut()
            .map_err(|_| ComputeError::Launch("output buffer is aliased".into()))?;

        let [global_x, global_y] = geometry.global();
        run_convolution(&params, &src, &weights, &mut dst, global_x as usize, global_y as usize)
    }

    fn download(&self, buffer: &Self::Buffer, out: &mut [f32]) -> ComputeResult<()> {
        let src = buffer
            .data
            .try_borrow()
            .map_err(|_| ComputeError::Transfer("buffer is in use".into()))?;
        check_extent(src.len() * size_of::<f32>(), out)?;
        out.copy_from_slice(&src);
        Ok(())
    }
}

/// Scalar arguments of one launch.
struct ConvParams {
    width: usize,
    height: usize,
    mask_width: usize,
    channels: usize,
    same_mode: bool,
}

impl ConvParams {
    /// (out_w, out_h, radius) as the kernel derives them.
    fn output_extent(&self) -> (usize, usize, usize) {
        if self.same_mode {
            (self.width, self.height, self.mask_width / 2)
        } else {
            (
                (self.width + 1).saturating_sub(self.mask_width),
                (self.height + 1).saturating_sub(self.mask_width),
                0,
            )
        }
    }
}

/// Execute every work-item of the global grid; items outside the output idle.
fn run_convolution(
    p: &ConvParams,
    src: &[f32],
    weights: &[f32],
    dst: &mut [f32],
    global_x: usize,
    global_y: usize,
) -> ComputeResult<()> {
    let (out_w, out_h, r) = p.output_extent();
    let c = p.channels;
    let k = p.mask_width;

    if out_w == 0 || out_h == 0 || c == 0 {
        return Ok(());
    }

    // A real device would read or write out of bounds here.
    if src.len() < p.width * p.height * c || weights.len() < k * k || dst.len() < out_w * out_h * c {
        return Err(ComputeError::Launch(format!(
            "out-of-bounds access: image {} of {}, mask {} of {}, output {} of {} elements",
            src.len(),
            p.width * p.height * c,
            weights.len(),
            k * k,
            dst.len(),
            out_w * out_h * c
        )));
    }

    let cols = global_x.min(out_w);
    let rows = global_y.min(out_h);
    let row_len = out_w * c;
    let (w, h) = (p.width as isize, p.height as isize);

    dst[..rows * row_len]
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..cols {
                for ch in 0..c {
                    let mut acc = 0.0f32;
                    for dy in 0..k {
                        let sy = (y + dy) as isize - r as isize;
                        if sy < 0 || sy >= h {
                            continue;
                        }
                        for dx in 0..k {
                            let sx = (x + dx) as isize - r as isize;
                            if sx < 0 || sx >= w {
                                continue;
                            }
                            let s = (sy as usize * p.width + sx as usize) * c + ch;
                            acc += src[s] * weights[dy * k + dx];
                        }
                    }
                    row[x * c + ch] = acc;
                }
            }
        });

    Ok(())
}

/// Build log for a source that is not the built-in OpenCL program, `None` if it is.
fn builtin_divergence(source: &str) -> Option<String> {
    let mut ours = source.lines().map(str::trim_end);
    let mut builtin = KernelDialect::OpenCl.builtin_text().lines().map(str::trim_end);
    let mut line = 0usize;
    loop {
        line += 1;
        let (found, expected) = match (ours.next(), builtin.next()) {
            (None, None) => return None,
            (a, b) if a == b => continue,
            (a, b) => (a.unwrap_or("<end of source>"), b.unwrap_or("<end of source>")),
        };
        return Some(format!(
            "error: the host device runs only the built-in {ENTRY_POINT}.cl program\n\
             line {line}: {found}\n\
             expected: {expected}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> &'static str {
        KernelDialect::OpenCl.builtin_text()
    }

    #[test]
    fn test_builtin_program_accepted() {
        assert!(builtin_divergence(builtin()).is_none());
        assert!(builtin_divergence(&builtin().replace('\n', "\r\n")).is_none());
    }

    #[test]
    fn test_compile_reads_same_mode_define() {
        let dev = HostDevice::new();
        let valid = dev.compile(builtin(), ENTRY_POINT, &[(SAME_MODE_DEFINE, 0)]).unwrap();
        let same = dev.compile(builtin(), ENTRY_POINT, &[(SAME_MODE_DEFINE, 1)]).unwrap();
        assert!(!valid.same_mode());
        assert!(same.same_mode());
    }

    #[test]
    fn test_compile_broken_source_has_log() {
        let dev = HostDevice::new();
        let broken = "__kernel void convolution2D( this is not C {{{ output[0] = 42.0f; ";
        match dev.compile(broken, ENTRY_POINT, &[]) {
            Err(ComputeError::ShaderCompilation { entry, log }) => {
                assert_eq!(entry, ENTRY_POINT);
                assert!(log.contains("line 1"), "{log}");
                assert!(log.contains("this is not C"), "{log}");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("broken source compiled"),
        }
    }

    #[test]
    fn test_compile_edited_body_rejected() {
        let dev = HostDevice::new();
        let mut lines: Vec<&str> = builtin().lines().collect();
        let last = lines.len() - 1;
        lines.insert(last, "    output[0] = 42.0f;");
        let edited = lines.join("\n");

        let err = dev.compile(&edited, ENTRY_POINT, &[]).unwrap_err();
        assert!(err.to_string().contains(&format!("line {}", last + 1)), "{err}");
    }

    #[test]
    fn test_compile_truncated_source_rejected() {
        let dev = HostDevice::new();
        let half = &builtin()[..builtin().len() / 2];
        let cut = &half[..half.rfind('\n').unwrap_or(0)];
        let err = dev.compile(cut, ENTRY_POINT, &[]).unwrap_err();
        assert!(err.to_string().contains("<end of source>"), "{err}");
    }

    #[test]
    fn test_compile_unknown_entry_has_log() {
        let dev = HostDevice::new();
        match dev.compile(builtin(), "other", &[]) {
            Err(ComputeError::ShaderCompilation { entry, log }) => {
                assert_eq!(entry, "other");
                assert!(log.contains(ENTRY_POINT));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("unknown entry compiled"),
        }
    }

    #[test]
    fn test_upload_size_checked() {
        let dev = HostDevice::new();
        let mut buf = dev.allocate(16, BufferAccess::ReadOnly).unwrap();
        assert!(dev.upload(&mut buf, &[1.0; 3]).is_err());
        dev.upload(&mut buf, &[1.0; 4]).unwrap();
        let mut out = [0.0; 4];
        dev.download(&buf, &mut out).unwrap();
        assert_eq!(out, [1.0; 4]);
    }

    #[test]
    fn test_launch_rejects_wrong_signature() {
        let dev = HostDevice::new();
        let kernel = dev.compile(builtin(), ENTRY_POINT, &[]).unwrap();
        let buf = dev.allocate(4, BufferAccess::ReadOnly).unwrap();
        let args = [KernelArg::Buffer(&buf), KernelArg::U32(1)];
        let geom = LaunchGeometry::for_output(1, 1);
        assert!(matches!(dev.launch(&kernel, &args, &geom), Err(ComputeError::Launch(_))));
    }

    #[test]
    fn test_same_mode_zero_pads_corner() {
        // 2x2 single-channel image of ones, 3x3 mask of ones: corners see 4 samples.
        let params = ConvParams { width: 2, height: 2, mask_width: 3, channels: 1, same_mode: true };
        let mut dst = vec![0.0; 4];
        run_convolution(&params, &[1.0; 4], &[1.0; 9], &mut dst, 16, 16).unwrap();
        assert_eq!(dst, vec![4.0; 4]);
    }

    #[test]
    fn test_short_grid_leaves_pixels_untouched() {
        let params = ConvParams { width: 4, height: 1, mask_width: 1, channels: 1, same_mode: false };
        let mut dst = vec![-1.0; 4];
        run_convolution(&params, &[2.0; 4], &[1.0], &mut dst, 2, 1).unwrap();
        assert_eq!(dst, vec![2.0, 2.0, -1.0, -1.0]);
    }
}
