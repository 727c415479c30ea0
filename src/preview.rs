//! Windowed PNG preview per series. Previews are advisory: failures are
//! logged by the caller and never fail the series.

use crate::attrs::TagValue;
use crate::error::ConvertError;
use crate::npz::load_npz;
use crate::sanitize::sanitize_series_name;
use camino::{Utf8Path, Utf8PathBuf};
use image::GrayImage;
use image::imageops::{self, FilterType};
use ndarray::{Array2, Axis};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::collections::BTreeMap;

const CANVAS_SIZE: u32 = 896;

/// Render the middle slice (volumes) or the first output (2-D modalities)
/// onto a fixed-size square canvas.
pub(crate) fn generate_series_preview(
    series_dir: &Utf8Path,
    series_name: &str,
    output_files: &[String],
    sample_tags: Option<&BTreeMap<String, TagValue>>,
) -> Result<Utf8PathBuf, ConvertError> {
    let Some(first) = output_files.first() else {
        return Err(ConvertError::NoPixelData);
    };
    let frame = middle_frame(&series_dir.join(first))?;

    let (center, width) = window_params(sample_tags).unwrap_or_else(|| percentile_window(&frame));
    let windowed = apply_windowing(&frame, center, width);

    let aspect = pixel_aspect_ratio(sample_tags);
    let canvas = fit_to_canvas(windowed, aspect);

    let preview_path =
        series_dir.join(format!("{}_preview.png", sanitize_series_name(series_name)));
    canvas
        .save(preview_path.as_std_path())
        .map_err(|e| ConvertError::Tool(format!("could not encode preview: {e}")))?;
    Ok(preview_path)
}

fn middle_frame(path: &Utf8Path) -> Result<Array2<f32>, ConvertError> {
    let name = path.file_name().unwrap_or_default();
    if name.ends_with(".npz") {
        let volume = load_npz(path)?;
        if volume.ndim() >= 3 {
            let mid = volume.len_of(Axis(0)) / 2;
            volume
                .index_axis(Axis(0), mid)
                .to_owned()
                .into_dimensionality()
                .map_err(ConvertError::from)
        } else {
            volume.into_dimensionality().map_err(ConvertError::from)
        }
    } else {
        let object = ReaderOptions::new().read_file(path.as_std_path())?;
        let volume = object.into_volume().into_ndarray::<f32>()?;
        if volume.ndim() >= 3 {
            let mid = volume.len_of(Axis(2)) / 2;
            volume
                .index_axis(Axis(2), mid)
                .to_owned()
                .into_dimensionality()
                .map_err(ConvertError::from)
        } else {
            volume.into_dimensionality().map_err(ConvertError::from)
        }
    }
}

/// Window center/width from the sample tags, taking the first element of
/// arrayed values.
fn window_params(sample_tags: Option<&BTreeMap<String, TagValue>>) -> Option<(f64, f64)> {
    let tags = sample_tags?;
    let center = first_number(tags.get("WindowCenter")?)?;
    let width = first_number(tags.get("WindowWidth")?)?;
    (width > 0.0).then_some((center, width))
}

fn first_number(value: &TagValue) -> Option<f64> {
    match value {
        TagValue::Number(x) => Some(*x),
        TagValue::NumberList(xs) => xs.first().copied(),
        TagValue::Text(s) => s.trim().parse().ok(),
    }
}

/// 1st–99th percentile window of the frame itself.
fn percentile_window(frame: &Array2<f32>) -> (f64, f64) {
    let mut values: Vec<f32> = frame.iter().copied().filter(|x| x.is_finite()).collect();
    if values.is_empty() {
        return (0.0, 1.0);
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let lo = values[(values.len() - 1) / 100] as f64;
    let hi = values[(values.len() - 1) * 99 / 100] as f64;
    let width = (hi - lo).max(1.0);
    (lo + width / 2.0, width)
}

fn apply_windowing(frame: &Array2<f32>, center: f64, width: f64) -> GrayImage {
    let lo = center - width / 2.0;
    let (rows, cols) = frame.dim();
    let mut pixels = Vec::with_capacity(rows * cols);
    for &x in frame.iter() {
        let scaled = (((x as f64 - lo) / width) * 255.0).clamp(0.0, 255.0);
        pixels.push(scaled as u8);
    }
    GrayImage::from_raw(cols as u32, rows as u32, pixels)
        .expect("pixel buffer matches image dimensions")
}

/// Row/column spacing ratio; rows are stretched when spacing is anisotropic.
fn pixel_aspect_ratio(sample_tags: Option<&BTreeMap<String, TagValue>>) -> f64 {
    let spacing = sample_tags
        .and_then(|tags| tags.get("PixelSpacing").or_else(|| tags.get("ImagerPixelSpacing")));
    if let Some(TagValue::NumberList(values)) = spacing {
        if values.len() >= 2 && values[0] > 0.0 && values[1] > 0.0 {
            return values[0] / values[1];
        }
    }
    1.0
}

/// Scale into a square canvas preserving the physical aspect ratio, padding
/// with black.
fn fit_to_canvas(image: GrayImage, aspect: f64) -> GrayImage {
    let (w, h) = image.dimensions();
    let physical_h = (h as f64 * aspect).max(1.0);
    let scale = (CANVAS_SIZE as f64 / w as f64).min(CANVAS_SIZE as f64 / physical_h);
    let target_w = ((w as f64 * scale).round() as u32).clamp(1, CANVAS_SIZE);
    let target_h = ((physical_h * scale).round() as u32).clamp(1, CANVAS_SIZE);
    let resized = imageops::resize(&image, target_w, target_h, FilterType::Triangle);

    let mut canvas = GrayImage::new(CANVAS_SIZE, CANVAS_SIZE);
    let x = (CANVAS_SIZE - target_w) / 2;
    let y = (CANVAS_SIZE - target_h) / 2;
    imageops::replace(&mut canvas, &resized, x as i64, y as i64);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn windowing_maps_range_to_u8() {
        let frame = Array2::from_shape_vec((1, 3), vec![0.0, 50.0, 100.0]).unwrap();
        let img = apply_windowing(&frame, 50.0, 100.0);
        assert_eq!(img.get_pixel(0, 0).0[0], 0);
        assert_eq!(img.get_pixel(1, 0).0[0], 127);
        assert_eq!(img.get_pixel(2, 0).0[0], 255);
    }

    #[test]
    fn canvas_is_square_and_padded() {
        let frame = Array2::<f32>::zeros((100, 200));
        let img = apply_windowing(&frame, 0.0, 1.0);
        let canvas = fit_to_canvas(img, 1.0);
        assert_eq!(canvas.dimensions(), (CANVAS_SIZE, CANVAS_SIZE));
    }
}
