//! Device buffer staging.
//!
//! Every allocation is wrapped in a [`ScopedBuffer`] that hands it back to
//! its device when dropped, so early returns release everything allocated
//! so far.

use std::ops::{Deref, DerefMut};

use tracing::{info, trace};

use crate::backend::{BufferAccess, ComputeDevice};
use crate::matrix::Matrix;
use crate::ComputeResult;

/// Device buffer released through [`ComputeDevice::release`] on drop.
pub struct ScopedBuffer<'d, D: ComputeDevice> {
    device: &'d D,
    // Emptied only by `drop`.
    buffer: Option<D::Buffer>,
}

impl<'d, D: ComputeDevice> ScopedBuffer<'d, D> {
    /// Allocate `byte_len` bytes on `device`.
    pub fn allocate(device: &'d D, byte_len: usize, access: BufferAccess) -> ComputeResult<Self> {
        let buffer = device.allocate(byte_len, access)?;
        Ok(Self { device, buffer: Some(buffer) })
    }
}

impl<D: ComputeDevice> Deref for ScopedBuffer<'_, D> {
    type Target = D::Buffer;

    fn deref(&self) -> &D::Buffer {
        self.buffer.as_ref().expect("scoped buffer used after release")
    }
}

impl<D: ComputeDevice> DerefMut for ScopedBuffer<'_, D> {
    fn deref_mut(&mut self) -> &mut D::Buffer {
        self.buffer.as_mut().expect("scoped buffer used after release")
    }
}

impl<D: ComputeDevice> Drop for ScopedBuffer<'_, D> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.device.release(buffer);
        }
    }
}

/// The three buffers of one convolution.
pub struct StagedBuffers<'d, D: ComputeDevice> {
    pub image: ScopedBuffer<'d, D>,
    pub output: ScopedBuffer<'d, D>,
    pub mask: ScopedBuffer<'d, D>,
}

/// Allocates device buffers and moves samples across.
pub struct BufferOrchestrator<'d, D: ComputeDevice> {
    device: &'d D,
}

impl<'d, D: ComputeDevice> BufferOrchestrator<'d, D> {
    pub fn new(device: &'d D) -> Self {
        Self { device }
    }

    /// Allocate image, output and mask buffers and upload the inputs.
    ///
    /// Buffer sizes come from each matrix's [`Matrix::byte_len`], the same
    /// figure the transfers are checked against.
    pub fn stage(&self, image: &Matrix, mask: &Matrix, output: &Matrix) -> ComputeResult<StagedBuffers<'d, D>> {
        info!(
            image_bytes = image.byte_len(),
            output_bytes = output.byte_len(),
            mask_bytes = mask.byte_len(),
            "allocating device buffers"
        );

        let mut image_buf = ScopedBuffer::allocate(self.device, image.byte_len(), BufferAccess::ReadOnly)?;
        let output_buf = ScopedBuffer::allocate(self.device, output.byte_len(), BufferAccess::WriteOnly)?;
        let mut mask_buf = ScopedBuffer::allocate(self.device, mask.byte_len(), BufferAccess::ReadOnly)?;

        trace!("uploading image");
        self.device.upload(&mut image_buf, image.data())?;
        trace!("uploading mask");
        self.device.upload(&mut mask_buf, mask.data())?;

        Ok(StagedBuffers { image: image_buf, output: output_buf, mask: mask_buf })
    }

    /// Read the output buffer back into `output`.
    pub fn collect(&self, buffers: &StagedBuffers<'d, D>, output: &mut Matrix) -> ComputeResult<()> {
        trace!(bytes = output.byte_len(), "downloading output");
        self.device.download(&buffers.output, output.data_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceBuffer, HostDevice};

    #[test]
    fn test_stage_sizes_from_shapes() {
        let dev = HostDevice::new();
        let image = Matrix::image(vec![1.0; 4 * 5 * 3], 4, 5).unwrap();
        let mask = Matrix::mask(vec![0.5; 9], 3, 3).unwrap();
        let output = Matrix::zeros(2, 3, 3);

        let staged = BufferOrchestrator::new(&dev).stage(&image, &mask, &output).unwrap();
        assert_eq!(staged.image.byte_len(), 240);
        assert_eq!(staged.mask.byte_len(), 36);
        assert_eq!(staged.output.byte_len(), 72);
        assert_eq!(staged.output.access(), BufferAccess::WriteOnly);
    }

    #[test]
    fn test_collect_round_trip() {
        let dev = HostDevice::new();
        let mut buf = ScopedBuffer::allocate(&dev, 12, BufferAccess::WriteOnly).unwrap();
        dev.upload(&mut buf, &[1.0, 2.0, 3.0]).unwrap();

        let image = Matrix::image(vec![0.0; 3], 1, 1).unwrap();
        let mask = Matrix::mask(vec![1.0], 1, 1).unwrap();
        let staged = StagedBuffers {
            image: ScopedBuffer::allocate(&dev, 12, BufferAccess::ReadOnly).unwrap(),
            output: buf,
            mask: ScopedBuffer::allocate(&dev, 4, BufferAccess::ReadOnly).unwrap(),
        };

        let mut out = Matrix::output_for(&image, &mask, crate::SizingMode::Valid).unwrap();
        BufferOrchestrator::new(&dev).collect(&staged, &mut out).unwrap();
        assert_eq!(out.data(), &[1.0, 2.0, 3.0]);
    }
}
