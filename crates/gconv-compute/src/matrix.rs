//! Host-side sample matrices and output sizing.

use std::fmt;
use std::str::FromStr;

use crate::{ComputeError, ComputeResult};

/// Channels per pixel of an image matrix.
pub const IMAGE_CHANNELS: u32 = 3;

/// Row-major matrix of `f32` samples with interleaved channels.
///
/// Images carry [`IMAGE_CHANNELS`] channels, masks carry one.
#[derive(Clone, PartialEq)]
pub struct Matrix {
    /// Raw samples, `rows * cols * channels` long.
    pub(crate) data: Vec<f32>,
    /// Number of rows (image height).
    pub rows: u32,
    /// Number of columns (image width).
    pub cols: u32,
    /// Samples per element.
    pub channels: u32,
}

impl Matrix {
    /// Create from f32 data.
    pub fn from_f32(data: Vec<f32>, rows: u32, cols: u32, channels: u32) -> ComputeResult<Self> {
        let expected = element_count(rows, cols, channels);
        if data.len() != expected {
            return Err(ComputeError::BufferSizeMismatch {
                expected: expected * size_of::<f32>(),
                actual: data.len() * size_of::<f32>(),
            });
        }
        Ok(Self { data, rows, cols, channels })
    }

    /// Create a matrix filled with zeros.
    pub fn zeros(rows: u32, cols: u32, channels: u32) -> Self {
        Self {
            data: vec![0.0; element_count(rows, cols, channels)],
            rows,
            cols,
            channels,
        }
    }

    /// Three-channel image from interleaved RGB samples.
    pub fn image(data: Vec<f32>, rows: u32, cols: u32) -> ComputeResult<Self> {
        Self::from_f32(data, rows, cols, IMAGE_CHANNELS)
    }

    /// Single-channel weighting mask.
    pub fn mask(data: Vec<f32>, rows: u32, cols: u32) -> ComputeResult<Self> {
        Self::from_f32(data, rows, cols, 1)
    }

    /// Zeroed result matrix shaped for convolving `image` with `mask` under `mode`.
    pub fn output_for(image: &Matrix, mask: &Matrix, mode: SizingMode) -> ComputeResult<Self> {
        let (rows, cols) = mode.output_dims(image, mask)?;
        Ok(Self::zeros(rows, cols, image.channels))
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// (rows, cols, channels).
    pub fn shape(&self) -> (u32, u32, u32) {
        (self.rows, self.cols, self.channels)
    }

    /// Byte extent of the samples: `rows * cols * channels * sizeof(f32)`.
    ///
    /// Derived from the shape fields, never from `data.len()`, so that
    /// allocation and transfer sizes come from the same source.
    pub fn byte_len(&self) -> usize {
        element_count(self.rows, self.cols, self.channels) * size_of::<f32>()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0 || self.channels == 0
    }

    /// Sample at (row, col, channel).
    pub fn get(&self, row: u32, col: u32, channel: u32) -> f32 {
        self.data[self.index(row, col, channel)]
    }

    pub fn set(&mut self, row: u32, col: u32, channel: u32, value: f32) {
        let idx = self.index(row, col, channel);
        self.data[idx] = value;
    }

    #[inline]
    fn index(&self, row: u32, col: u32, channel: u32) -> usize {
        ((row as usize * self.cols as usize) + col as usize) * self.channels as usize + channel as usize
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("channels", &self.channels)
            .field("byte_len", &self.byte_len())
            .finish()
    }
}

#[inline]
fn element_count(rows: u32, cols: u32, channels: u32) -> usize {
    rows as usize * cols as usize * channels as usize
}

// =============================================================================
// Sizing
// =============================================================================

/// How the output extent relates to the input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizingMode {
    /// Output shrinks by `mask - 1` per axis; the window never leaves the image.
    #[default]
    Valid,
    /// Output matches the input; the window is centred and zero-padded.
    Same,
}

impl SizingMode {
    /// Output (rows, cols) for `image` convolved with `mask`.
    pub fn output_dims(self, image: &Matrix, mask: &Matrix) -> ComputeResult<(u32, u32)> {
        if image.is_empty() || mask.is_empty() {
            return Err(ComputeError::InvalidDimensions(format!(
                "image {}x{} and mask {}x{} must be non-empty",
                image.rows, image.cols, mask.rows, mask.cols
            )));
        }
        match self {
            Self::Valid => {
                if mask.rows > image.rows || mask.cols > image.cols {
                    return Err(ComputeError::InvalidDimensions(format!(
                        "mask {}x{} exceeds image {}x{} in valid mode",
                        mask.rows, mask.cols, image.rows, image.cols
                    )));
                }
                Ok((image.rows - mask.rows + 1, image.cols - mask.cols + 1))
            }
            Self::Same => Ok((image.rows, image.cols)),
        }
    }

    /// Value of the `CONV_SAME_MODE` kernel define.
    pub fn define_value(self) -> u32 {
        match self {
            Self::Valid => 0,
            Self::Same => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Same => "same",
        }
    }
}

impl fmt::Display for SizingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SizingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "valid" => Ok(Self::Valid),
            "same" => Ok(Self::Same),
            other => Err(format!("unknown sizing mode '{other}' (expected valid or same)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32_rejects_short_data() {
        let err = Matrix::from_f32(vec![0.0; 5], 2, 1, 3).unwrap_err();
        assert!(matches!(err, ComputeError::BufferSizeMismatch { expected: 24, actual: 20 }));
    }

    #[test]
    fn test_byte_len_from_shape() {
        let img = Matrix::zeros(4, 7, IMAGE_CHANNELS);
        assert_eq!(img.byte_len(), 4 * 7 * 3 * 4);
        let mask = Matrix::zeros(5, 5, 1);
        assert_eq!(mask.byte_len(), 100);
    }

    #[test]
    fn test_get_set_interleaved() {
        let mut img = Matrix::zeros(2, 3, 3);
        img.set(1, 2, 1, 9.0);
        assert_eq!(img.get(1, 2, 1), 9.0);
        assert_eq!(img.data()[(1 * 3 + 2) * 3 + 1], 9.0);
    }

    #[test]
    fn test_valid_output_dims() {
        let img = Matrix::zeros(10, 12, 3);
        let mask = Matrix::zeros(5, 5, 1);
        assert_eq!(SizingMode::Valid.output_dims(&img, &mask).unwrap(), (6, 8));
        assert_eq!(SizingMode::Same.output_dims(&img, &mask).unwrap(), (10, 12));
    }

    #[test]
    fn test_valid_mask_larger_than_image() {
        let img = Matrix::zeros(3, 3, 3);
        let mask = Matrix::zeros(5, 5, 1);
        assert!(matches!(
            SizingMode::Valid.output_dims(&img, &mask),
            Err(ComputeError::InvalidDimensions(_))
        ));
        assert_eq!(SizingMode::Same.output_dims(&img, &mask).unwrap(), (3, 3));
    }

    #[test]
    fn test_output_for_keeps_channels() {
        let img = Matrix::zeros(6, 6, 3);
        let mask = Matrix::zeros(3, 3, 1);
        let out = Matrix::output_for(&img, &mask, SizingMode::Valid).unwrap();
        assert_eq!(out.shape(), (4, 4, 3));
    }

    #[test]
    fn test_sizing_mode_parse() {
        assert_eq!("Same".parse::<SizingMode>().unwrap(), SizingMode::Same);
        assert!("full".parse::<SizingMode>().is_err());
    }
}
