//! Result verification against a reference matrix.

use std::fmt;

use tracing::debug;

use crate::matrix::Matrix;

/// Acceptance bound for one sample: `|actual - expected| <= abs + rel * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    /// Absolute slack.
    pub abs: f32,
    /// Slack relative to the expected magnitude.
    pub rel: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self { abs: 1e-4, rel: 1e-4 }
    }
}

impl Tolerance {
    pub fn new(abs: f32, rel: f32) -> Self {
        Self { abs, rel }
    }

    /// Whether `actual` is close enough to `expected`. NaN never is.
    pub fn accepts(&self, expected: f32, actual: f32) -> bool {
        if expected == actual {
            return true;
        }
        let diff = (actual - expected).abs();
        // NaN compares false
        diff <= self.abs + self.rel * expected.abs()
    }
}

/// One sample outside tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
    pub row: u32,
    pub col: u32,
    pub channel: u32,
    pub expected: f32,
    pub actual: f32,
}

impl Mismatch {
    pub fn abs_error(&self) -> f32 {
        (self.actual - self.expected).abs()
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}): expected {}, got {} (diff {:.3e})",
            self.row,
            self.col,
            self.channel,
            self.expected,
            self.actual,
            self.abs_error()
        )
    }
}

/// Outcome of a comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Every sample within tolerance.
    Pass,
    /// Shapes agree but at least one sample is outside tolerance.
    ValueMismatch,
    /// Result and reference have different shapes; no values compared.
    ShapeMismatch { expected: (u32, u32, u32), actual: (u32, u32, u32) },
}

/// Comparison report.
#[derive(Debug, Clone)]
pub struct Verification {
    pub verdict: Verdict,
    /// First mismatches in row-major order, capped at the report limit.
    pub mismatches: Vec<Mismatch>,
    /// All mismatching samples, including unreported ones.
    pub total_mismatches: usize,
    /// Pixels with at least one mismatching channel.
    pub mismatched_pixels: usize,
    /// Samples compared.
    pub compared: usize,
    /// Largest finite absolute error seen. Pairs involving an infinity or
    /// NaN still count as mismatches but do not contribute here.
    pub max_abs_error: f32,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.verdict {
            Verdict::Pass => write!(
                f,
                "PASS: {} values within tolerance (max abs error {:.3e})",
                self.compared, self.max_abs_error
            ),
            Verdict::ShapeMismatch { expected, actual } => write!(
                f,
                "FAIL: shape mismatch: expected {}x{}x{}, got {}x{}x{}",
                expected.0, expected.1, expected.2, actual.0, actual.1, actual.2
            ),
            Verdict::ValueMismatch => {
                write!(
                    f,
                    "FAIL: {} of {} values outside tolerance in {} pixel(s) (max abs error {:.3e})",
                    self.total_mismatches, self.compared, self.mismatched_pixels, self.max_abs_error
                )?;
                for m in &self.mismatches {
                    write!(f, "\n  at {m}")?;
                }
                let hidden = self.total_mismatches - self.mismatches.len();
                if hidden > 0 {
                    write!(f, "\n  ... and {hidden} more")?;
                }
                Ok(())
            }
        }
    }
}

/// Compare `result` with `reference` sample by sample.
///
/// Reports at most `max_reported` mismatches but counts all of them.
pub fn verify(result: &Matrix, reference: &Matrix, tolerance: Tolerance, max_reported: usize) -> Verification {
    if result.shape() != reference.shape() {
        return Verification {
            verdict: Verdict::ShapeMismatch { expected: reference.shape(), actual: result.shape() },
            mismatches: Vec::new(),
            total_mismatches: 0,
            mismatched_pixels: 0,
            compared: 0,
            max_abs_error: 0.0,
        };
    }

    let channels = result.channels.max(1) as usize;
    let cols = result.cols as usize;
    let mut mismatches = Vec::new();
    let mut total = 0usize;
    let mut pixels = 0usize;
    let mut last_pixel = None;
    let mut max_abs_error = 0.0f32;

    for (i, (&actual, &expected)) in result.data().iter().zip(reference.data()).enumerate() {
        let diff = (actual - expected).abs();
        if diff.is_finite() && diff > max_abs_error {
            max_abs_error = diff;
        }
        if tolerance.accepts(expected, actual) {
            continue;
        }

        total += 1;
        let pixel = i / channels;
        if last_pixel != Some(pixel) {
            pixels += 1;
            last_pixel = Some(pixel);
        }
        if mismatches.len() < max_reported {
            mismatches.push(Mismatch {
                row: (pixel / cols) as u32,
                col: (pixel % cols) as u32,
                channel: (i % channels) as u32,
                expected,
                actual,
            });
        }
    }

    let compared = result.data().len();
    debug!(compared, mismatches = total, pixels, max_abs_error, "verification finished");

    Verification {
        verdict: if total == 0 { Verdict::Pass } else { Verdict::ValueMismatch },
        mismatches,
        total_mismatches: total,
        mismatched_pixels: pixels,
        compared,
        max_abs_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: u32, cols: u32) -> Matrix {
        let n = (rows * cols * 3) as usize;
        Matrix::image((0..n).map(|i| i as f32 * 0.25).collect(), rows, cols).unwrap()
    }

    #[test]
    fn test_identical_passes() {
        let a = ramp(4, 5);
        let report = verify(&a, &a.clone(), Tolerance::default(), 10);
        assert!(report.passed());
        assert_eq!(report.compared, 60);
        assert!(report.to_string().starts_with("PASS"));
    }

    #[test]
    fn test_single_perturbation_located() {
        let reference = ramp(4, 5);
        let mut result = reference.clone();
        result.set(2, 3, 1, reference.get(2, 3, 1) + 0.5);

        let report = verify(&result, &reference, Tolerance::default(), 10);
        assert_eq!(report.verdict, Verdict::ValueMismatch);
        assert_eq!(report.total_mismatches, 1);
        let m = report.mismatches[0];
        assert_eq!((m.row, m.col, m.channel), (2, 3, 1));
        assert!((report.max_abs_error - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_pixel_counted_once_across_channels() {
        let reference = ramp(4, 5);
        let mut result = reference.clone();
        for c in 0..3 {
            result.set(1, 4, c, reference.get(1, 4, c) - 2.0);
        }

        let report = verify(&result, &reference, Tolerance::default(), 10);
        assert_eq!(report.total_mismatches, 3);
        assert_eq!(report.mismatched_pixels, 1);
        assert!(report.mismatches.iter().all(|m| (m.row, m.col) == (1, 4)));
        assert!(report.to_string().contains("in 1 pixel(s)"));
    }

    #[test]
    fn test_infinite_error_not_in_max() {
        let reference = ramp(2, 2);
        let mut result = reference.clone();
        result.set(0, 0, 0, f32::INFINITY);
        result.set(1, 1, 2, reference.get(1, 1, 2) + 0.25);

        let report = verify(&result, &reference, Tolerance::default(), 10);
        assert_eq!(report.total_mismatches, 2);
        assert_eq!(report.mismatched_pixels, 2);
        assert!(report.max_abs_error.is_finite());
        assert!((report.max_abs_error - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch_distinct() {
        let report = verify(&ramp(4, 5), &ramp(5, 4), Tolerance::default(), 10);
        assert_eq!(
            report.verdict,
            Verdict::ShapeMismatch { expected: (5, 4, 3), actual: (4, 5, 3) }
        );
        assert!(report.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_nan_fails() {
        let tol = Tolerance::default();
        assert!(!tol.accepts(1.0, f32::NAN));
        assert!(!tol.accepts(f32::NAN, f32::NAN));
        assert!(tol.accepts(f32::INFINITY, f32::INFINITY));
    }

    #[test]
    fn test_relative_slack() {
        let tol = Tolerance::new(0.0, 1e-3);
        assert!(tol.accepts(1000.0, 1000.5));
        assert!(!tol.accepts(1.0, 1.5));
    }

    #[test]
    fn test_report_cap() {
        let reference = ramp(3, 3);
        let result = Matrix::zeros(3, 3, 3);
        let report = verify(&result, &reference, Tolerance::default(), 2);
        assert_eq!(report.mismatches.len(), 2);
        assert_eq!(report.total_mismatches, 26); // sample 0 is 0.0 in both
        assert!(report.to_string().contains("... and 24 more"));
    }
}
