//! Histogram/contrast quality heuristic on converted series outputs.

use crate::error::ConvertError;
use crate::npz::load_npz;
use camino::Utf8Path;
use ndarray::{ArrayD, ArrayViewD, Axis};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use serde::Serialize;

/// Tunables for the low-quality heuristic. The defaults keep ordinary CT/MR
/// slices out of the low bucket while flagging blank or near-constant frames.
#[derive(Debug, Clone)]
pub struct QcThresholds {
    /// A frame whose value range is narrower than this is degenerate.
    pub min_dynamic_range: f64,
    /// A single histogram bin holding more than this share of voxels
    /// dominates the frame.
    pub dominant_bin_ratio: f64,
    /// Contrast floor: standard deviation over mean absolute value.
    pub min_contrast: f64,
    pub histogram_bins: usize,
    /// Above this many frames, score the middle ± `sample_radius` only.
    pub sample_threshold: usize,
    pub sample_radius: usize,
}

impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            min_dynamic_range: 10.0,
            dominant_bin_ratio: 0.9,
            min_contrast: 0.02,
            histogram_bins: 64,
            sample_threshold: 200,
            sample_radius: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QcMode {
    Full,
    Sampled,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct QcSummary {
    pub low_quality: usize,
    pub low_quality_ratio: f64,
    pub qc_mode: QcMode,
    pub qc_sample_indices: Vec<usize>,
}

impl QcSummary {
    fn empty() -> Self {
        Self {
            low_quality: 0,
            low_quality_ratio: 0.0,
            qc_mode: QcMode::None,
            qc_sample_indices: Vec::new(),
        }
    }

    /// Collapsed 0/1 score for workbook rows.
    pub fn score(&self) -> i32 {
        (self.low_quality_ratio >= 0.5) as i32
    }
}

/// Score a converted series. A single multi-slice output contributes its
/// slices as frames; multiple 2-D outputs contribute one frame each.
pub(crate) fn assess_converted_series(
    series_dir: &Utf8Path,
    output_files: &[String],
    thresholds: &QcThresholds,
) -> QcSummary {
    let frames = match frame_count(series_dir, output_files) {
        Ok(0) | Err(_) => return QcSummary::empty(),
        Ok(n) => n,
    };

    let (indices, qc_mode) = if frames > thresholds.sample_threshold {
        let mid = frames / 2;
        let lo = mid.saturating_sub(thresholds.sample_radius);
        let hi = (mid + thresholds.sample_radius).min(frames - 1);
        ((lo..=hi).collect::<Vec<_>>(), QcMode::Sampled)
    } else {
        ((0..frames).collect(), QcMode::Full)
    };

    let mut low_quality = 0;
    let mut scored = 0;
    for &index in &indices {
        match load_frame(series_dir, output_files, index) {
            Ok(frame) => {
                scored += 1;
                if is_low_quality(frame.view(), thresholds) {
                    low_quality += 1;
                }
            }
            Err(e) => tracing::warn!(index, "could not load frame for QC: {e}"),
        }
    }
    if scored == 0 {
        return QcSummary::empty();
    }
    QcSummary {
        low_quality,
        low_quality_ratio: low_quality as f64 / scored as f64,
        qc_mode,
        qc_sample_indices: indices,
    }
}

fn frame_count(series_dir: &Utf8Path, output_files: &[String]) -> Result<usize, ConvertError> {
    match output_files {
        [] => Ok(0),
        [single] => Ok(load_output(&series_dir.join(single))?.0),
        many => Ok(many.len()),
    }
}

fn load_frame(
    series_dir: &Utf8Path,
    output_files: &[String],
    index: usize,
) -> Result<ArrayD<f32>, ConvertError> {
    let (path, frame_index) = if output_files.len() == 1 {
        (series_dir.join(&output_files[0]), index)
    } else {
        (series_dir.join(&output_files[index]), 0)
    };
    let (_frames, volume, slice_axis) = load_output(&path)?;
    let frame_index = frame_index.min(volume.len_of(Axis(slice_axis)).saturating_sub(1));
    Ok(volume.index_axis(Axis(slice_axis), frame_index).to_owned())
}

/// Load one output file: (frame count, volume, slice axis). NPZ tensors are
/// `(Z, Y, X)`, NIfTI volumes `(X, Y, Z)`.
fn load_output(path: &Utf8Path) -> Result<(usize, ArrayD<f32>, usize), ConvertError> {
    let name = path.file_name().unwrap_or_default();
    if name.ends_with(".npz") {
        let volume = load_npz(path)?;
        let frames = if volume.ndim() >= 3 {
            volume.len_of(Axis(0))
        } else {
            1
        };
        let slice_axis = 0;
        Ok((frames, volume, slice_axis))
    } else {
        let object = ReaderOptions::new().read_file(path.as_std_path())?;
        let volume = object.into_volume().into_ndarray::<f32>()?;
        let slice_axis = if volume.ndim() >= 3 { 2 } else { 0 };
        let frames = if volume.ndim() >= 3 {
            volume.len_of(Axis(2))
        } else {
            1
        };
        Ok((frames, volume, slice_axis))
    }
}

/// One frame is low quality when its dynamic range is degenerate, a single
/// histogram bin dominates, or contrast is below the floor.
pub(crate) fn is_low_quality(frame: ArrayViewD<'_, f32>, thresholds: &QcThresholds) -> bool {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut sum_abs = 0.0;
    let mut count = 0usize;
    for &x in frame.iter() {
        let x = x as f64;
        if !x.is_finite() {
            continue;
        }
        min = min.min(x);
        max = max.max(x);
        sum += x;
        sum_abs += x.abs();
        count += 1;
    }
    if count == 0 {
        return true;
    }
    let range = max - min;
    if range < thresholds.min_dynamic_range {
        return true;
    }

    let mut bins = vec![0usize; thresholds.histogram_bins.max(2)];
    let nbins = bins.len();
    for &x in frame.iter() {
        let x = x as f64;
        if !x.is_finite() {
            continue;
        }
        let bin = (((x - min) / range) * (nbins as f64 - 1.0)) as usize;
        bins[bin.min(nbins - 1)] += 1;
    }
    let dominant = bins.iter().copied().max().unwrap_or(0);
    if dominant as f64 / count as f64 > thresholds.dominant_bin_ratio {
        return true;
    }

    let mean = sum / count as f64;
    let variance = frame
        .iter()
        .filter(|x| x.is_finite())
        .map(|&x| {
            let d = x as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / count as f64;
    let mean_abs = sum_abs / count as f64;
    let contrast = variance.sqrt() / mean_abs.max(f64::EPSILON);
    contrast < thresholds.min_contrast
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn thresholds() -> QcThresholds {
        QcThresholds::default()
    }

    #[test]
    fn constant_frame_is_low_quality() {
        let frame = Array2::<f32>::from_elem((32, 32), 100.0).into_dyn();
        assert!(is_low_quality(frame.view(), &thresholds()));
    }

    #[test]
    fn gradient_frame_is_acceptable() {
        let frame = Array2::<f32>::from_shape_fn((64, 64), |(r, c)| (r * 17 + c * 5) as f32)
            .into_dyn();
        assert!(!is_low_quality(frame.view(), &thresholds()));
    }

    #[test]
    fn dominant_bin_flags_mostly_empty_frame() {
        let mut frame = Array2::<f32>::zeros((64, 64));
        frame[[0, 0]] = 4000.0;
        assert!(is_low_quality(frame.into_dyn().view(), &thresholds()));
    }
}
