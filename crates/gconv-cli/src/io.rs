//! Plain-text matrix files.
//!
//! ```text
//! # optional comment lines
//! rows cols channels
//! v v v v ...
//! ```
//!
//! The header is followed by `rows * cols * channels` whitespace-separated
//! samples in row-major, channel-interleaved order.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result, bail};
use gconv_compute::Matrix;
use tracing::{debug, trace};

/// Parse matrix text. `origin` names the source in error messages.
pub fn parse_matrix(text: &str, origin: &str) -> Result<Matrix> {
    let mut tokens = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(str::split_whitespace);

    let mut header = [0u32; 3];
    for (slot, name) in header.iter_mut().zip(["rows", "cols", "channels"]) {
        let Some(tok) = tokens.next() else {
            bail!("{origin}: missing {name} in header");
        };
        *slot = tok
            .parse()
            .with_context(|| format!("{origin}: invalid {name} '{tok}'"))?;
    }
    let [rows, cols, channels] = header;

    let expected = rows as usize * cols as usize * channels as usize;
    let mut data = Vec::with_capacity(expected);
    for tok in tokens.by_ref().take(expected) {
        let value: f32 = tok
            .parse()
            .with_context(|| format!("{origin}: invalid sample '{tok}' at index {}", data.len()))?;
        data.push(value);
    }

    if data.len() < expected {
        bail!("{origin}: expected {expected} samples for {rows}x{cols}x{channels}, found {}", data.len());
    }
    if let Some(extra) = tokens.next() {
        bail!("{origin}: unexpected trailing token '{extra}' after {expected} samples");
    }

    Ok(Matrix::from_f32(data, rows, cols, channels)?)
}

/// Load a matrix and check its channel count.
pub fn read_matrix(path: &Path, channels: u32) -> Result<Matrix> {
    trace!(path = %path.display(), "read_matrix");
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to load: {}", path.display()))?;
    let matrix = parse_matrix(&text, &path.display().to_string())?;
    if matrix.channels != channels {
        bail!(
            "{}: expected {channels} channel(s), found {}",
            path.display(),
            matrix.channels
        );
    }
    debug!(path = %path.display(), shape = ?matrix.shape(), "matrix loaded");
    Ok(matrix)
}

/// Render a matrix, one image row per line.
pub fn format_matrix(matrix: &Matrix) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {} {}", matrix.rows, matrix.cols, matrix.channels);
    let row_len = (matrix.cols * matrix.channels) as usize;
    if row_len == 0 {
        return out;
    }
    for row in matrix.data().chunks(row_len) {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        out.push_str(&line.join(" "));
        out.push('\n');
    }
    out
}

/// Save a matrix to `path`.
pub fn write_matrix(path: &Path, matrix: &Matrix) -> Result<()> {
    std::fs::write(path, format_matrix(matrix))
        .with_context(|| format!("Failed to save: {}", path.display()))?;
    debug!(path = %path.display(), bytes = matrix.byte_len(), "matrix saved");
    Ok(())
}
