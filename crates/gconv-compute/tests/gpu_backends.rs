//! Device backends against the host device. Each test returns early when
//! its backend has no device on this machine.

#![cfg(any(feature = "wgpu", feature = "opencl", feature = "cuda"))]

#[allow(unused_imports)]
use gconv_compute::{
    ComputeDevice, ConvConfig, HostDevice, KernelSource, Matrix, SizingMode, Tolerance, convolve,
    verify,
};

#[allow(dead_code)]
fn ramp_image(rows: u32, cols: u32) -> Matrix {
    let n = (rows * cols * 3) as usize;
    Matrix::image((0..n).map(|i| ((i * 37) % 101) as f32 / 101.0).collect(), rows, cols).unwrap()
}

/// Run the same convolution on `device` and on the host, then compare.
#[allow(dead_code)]
fn compare_with_host<D: ComputeDevice>(device: &D, sizing: SizingMode) {
    let image = ramp_image(40, 23);
    let mask = Matrix::mask((0..25).map(|i| (i as f32 - 12.0) / 25.0).collect(), 5, 5).unwrap();
    let config = ConvConfig { sizing, ..ConvConfig::default() };

    let mut on_device = Matrix::output_for(&image, &mask, sizing).unwrap();
    let source = KernelSource::builtin(device.dialect());
    convolve(device, &source, &image, &mask, &mut on_device, &config).unwrap();

    let host = HostDevice::new();
    let mut on_host = Matrix::output_for(&image, &mask, sizing).unwrap();
    let host_source = KernelSource::builtin(host.dialect());
    convolve(&host, &host_source, &image, &mask, &mut on_host, &config).unwrap();

    let report = verify(&on_device, &on_host, Tolerance::default(), 10);
    assert!(report.passed(), "{report}");
}

#[cfg(feature = "wgpu")]
#[test]
fn wgpu_matches_host() {
    use gconv_compute::WgpuDevice;

    if !WgpuDevice::is_available() {
        eprintln!("No wgpu adapter, skipping");
        return;
    }
    let device = WgpuDevice::new().unwrap();
    compare_with_host(&device, SizingMode::Valid);
    compare_with_host(&device, SizingMode::Same);
}

#[cfg(feature = "wgpu")]
#[test]
fn wgpu_compile_error_has_log() {
    use gconv_compute::{ComputeError, KernelDialect, ProgramCompiler, WgpuDevice};

    if !WgpuDevice::is_available() {
        eprintln!("No wgpu adapter, skipping");
        return;
    }
    let device = WgpuDevice::new().unwrap();
    let broken = KernelSource::new(KernelDialect::Wgsl, "@compute @workgroup_size(16, 16) fn convolution2D( {");
    match ProgramCompiler::new(&device).compile(&broken, SizingMode::Valid) {
        Err(ComputeError::ShaderCompilation { log, .. }) => assert!(!log.is_empty()),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("broken shader compiled"),
    }
}

#[cfg(feature = "opencl")]
#[test]
fn opencl_matches_host() {
    use gconv_compute::OpenClDevice;

    if !OpenClDevice::is_available() {
        eprintln!("No OpenCL device, skipping");
        return;
    }
    let device = OpenClDevice::new().unwrap();
    compare_with_host(&device, SizingMode::Valid);
    compare_with_host(&device, SizingMode::Same);
}

#[cfg(all(feature = "cuda", not(target_os = "macos")))]
#[test]
fn cuda_matches_host() {
    use gconv_compute::CudaDevice;

    if !CudaDevice::is_available() {
        eprintln!("No CUDA device, skipping");
        return;
    }
    let device = CudaDevice::new().unwrap();
    compare_with_host(&device, SizingMode::Valid);
    compare_with_host(&device, SizingMode::Same);
}
