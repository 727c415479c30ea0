//! Pure-library DICOM → NIfTI conversion, used when dcm2niix is missing or
//! keeps failing.

use crate::attrs::{f64_list, f64_value, string_value};
use crate::error::ConvertError;
use crate::orientation::{
    affine_from_patient_geometry, affine_from_ras_axes, cross, header_with_affine, norm3,
    patient_orientation_vector, reorient_to_canonical,
};
use camino::Utf8Path;
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, open_file};
use dicom_pixeldata::PixelDecoder;
use dicom_pixeldata::ndarray::Axis as PixelAxis;
use ndarray::{Array2, ArrayD, Axis};
use nifti::writer::WriterOptions;

struct SliceData {
    pixels: Array2<f32>,
    z: f64,
    position: Option<[f64; 3]>,
}

/// Convert a whole series directory worth of instances into one 3-D NIfTI.
/// Returns the output file name within `series_dir`.
pub(crate) fn convert_series_to_nifti(
    series_dir: &Utf8Path,
    dicom_files: &[camino::Utf8PathBuf],
    output_name: &str,
) -> Result<String, ConvertError> {
    let mut first_obj = None;
    let mut slices: Vec<SliceData> = Vec::new();
    for file in dicom_files {
        let obj = match open_file(file.as_std_path()) {
            Ok(obj) => obj,
            Err(e) => {
                tracing::warn!(file = file.as_str(), "skipping unreadable instance: {e}");
                continue;
            }
        };
        match read_slice(&obj) {
            Ok(pixels) => {
                let position = f64_list(&obj, tags::IMAGE_POSITION_PATIENT)
                    .filter(|p| p.len() >= 3)
                    .map(|p| [p[0], p[1], p[2]]);
                let z = position
                    .map(|p| p[2])
                    .or_else(|| f64_value(&obj, tags::SLICE_LOCATION))
                    .unwrap_or(0.0);
                slices.push(SliceData {
                    pixels,
                    z,
                    position,
                });
                if first_obj.is_none() {
                    first_obj = Some(obj);
                }
            }
            Err(e) => {
                tracing::warn!(file = file.as_str(), "skipping instance without pixels: {e}");
            }
        }
    }
    let Some(representative) = first_obj else {
        return Err(ConvertError::NoPixelData);
    };
    slices.sort_by(|a, b| a.z.partial_cmp(&b.z).unwrap_or(std::cmp::Ordering::Equal));

    // stacking needs uniform slice shapes; drop the odd ones out
    let shape = slices[0].pixels.dim();
    let before = slices.len();
    slices.retain(|s| s.pixels.dim() == shape);
    if slices.len() < before {
        tracing::warn!(
            dropped = before - slices.len(),
            "dropped slices with mismatched dimensions"
        );
    }

    let slice_spacing = slice_spacing(&slices, &representative);
    let views: Vec<_> = slices.iter().map(|s| s.pixels.view()).collect();
    let volume = ndarray::stack(Axis(2), &views)?;

    let affine = series_affine(&representative, slice_spacing);
    let output_file = format!("{output_name}.nii.gz");
    write_nifti(&series_dir.join(&output_file), volume.into_dyn(), affine)?;
    tracing::info!(
        output = output_file,
        slices = slices.len(),
        "library conversion succeeded"
    );
    Ok(output_file)
}

/// Convert a single instance (DR/DX/MG projection) into a `[H, W, 1]` NIfTI.
pub(crate) fn convert_instance_to_nifti(
    dcm_file: &Utf8Path,
    series_dir: &Utf8Path,
    output_name: &str,
) -> Result<String, ConvertError> {
    let obj = open_file(dcm_file.as_std_path())?;
    let pixels = read_slice(&obj)?;
    let slice_thickness = f64_value(&obj, tags::SLICE_THICKNESS).unwrap_or(1.0);
    let affine = if f64_list(&obj, tags::IMAGE_ORIENTATION_PATIENT).is_some()
        && f64_list(&obj, tags::IMAGE_POSITION_PATIENT).is_some()
    {
        series_affine(&obj, slice_thickness)
    } else {
        projection_affine(&obj, slice_thickness)
    };
    let volume = pixels.insert_axis(Axis(2));
    let output_file = format!("{output_name}.nii.gz");
    write_nifti(&series_dir.join(&output_file), volume.into_dyn(), affine)?;
    Ok(output_file)
}

/// Decode one instance's first frame, rescaled and photometric-corrected.
fn read_slice(obj: &DefaultDicomObject) -> Result<Array2<f32>, ConvertError> {
    let decoded = obj.decode_pixel_data()?;
    let array = decoded.to_ndarray::<f32>()?;
    let mut plane = array
        .index_axis(PixelAxis(0), 0)
        .index_axis(PixelAxis(2), 0)
        .to_owned();

    let slope = f64_value(obj, tags::RESCALE_SLOPE).unwrap_or(1.0) as f32;
    let intercept = f64_value(obj, tags::RESCALE_INTERCEPT).unwrap_or(0.0) as f32;
    if slope != 1.0 || intercept != 0.0 {
        plane.mapv_inplace(|x| x * slope + intercept);
    }

    let photometric = string_value(obj, tags::PHOTOMETRIC_INTERPRETATION).unwrap_or_default();
    if photometric.eq_ignore_ascii_case("MONOCHROME1") {
        let max = plane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max.is_finite() {
            plane.mapv_inplace(|x| max - x);
        }
    }
    let (rows, cols) = plane.dim();
    let plane = Array2::from_shape_vec((rows, cols), plane.into_raw_vec())?;
    Ok(plane)
}

/// Inter-slice distance: position delta, slice-location delta, then
/// SliceThickness.
fn slice_spacing(slices: &[SliceData], representative: &DefaultDicomObject) -> f64 {
    let positions: Vec<[f64; 3]> = slices.iter().filter_map(|s| s.position).collect();
    if positions.len() >= 2 {
        let d = [
            positions[1][0] - positions[0][0],
            positions[1][1] - positions[0][1],
            positions[1][2] - positions[0][2],
        ];
        return norm3(d);
    }
    if slices.len() >= 2 {
        return (slices[1].z - slices[0].z).abs();
    }
    f64_value(representative, tags::SLICE_THICKNESS).unwrap_or(1.0)
}

/// RAS affine for a stacked series; identity with unit axes when the
/// orientation tags are unusable.
fn series_affine(obj: &DefaultDicomObject, slice_spacing: f64) -> Array2<f64> {
    let iop = f64_list(obj, tags::IMAGE_ORIENTATION_PATIENT).filter(|v| v.len() >= 6);
    let ipp = f64_list(obj, tags::IMAGE_POSITION_PATIENT).filter(|v| v.len() >= 3);
    let (Some(iop), Some(ipp)) = (iop, ipp) else {
        tracing::warn!("missing ImageOrientationPatient/ImagePositionPatient, using identity affine");
        return Array2::<f64>::eye(4);
    };
    let row = [iop[0], iop[1], iop[2]];
    let col = [iop[3], iop[4], iop[5]];
    let normal = cross(row, col);
    let spacing = pixel_spacing(obj);
    affine_from_patient_geometry(
        row,
        col,
        normal,
        [ipp[0], ipp[1], ipp[2]],
        spacing[0],
        spacing[1],
        slice_spacing,
    )
}

/// RAS affine for a 2-D projection, synthesized from `PatientOrientation`
/// codes when `ImageOrientationPatient` is absent.
fn projection_affine(obj: &DefaultDicomObject, slice_spacing: f64) -> Array2<f64> {
    let mut row_axis = None;
    let mut col_axis = None;
    if let Some(iop) = f64_list(obj, tags::IMAGE_ORIENTATION_PATIENT).filter(|v| v.len() >= 6) {
        row_axis = Some([iop[0], iop[1], iop[2]]);
        col_axis = Some([iop[3], iop[4], iop[5]]);
    } else if let Some(orientation) = string_value(obj, tags::PATIENT_ORIENTATION) {
        let mut codes = orientation.split('\\');
        row_axis = codes.next().and_then(patient_orientation_vector);
        col_axis = codes.next().and_then(patient_orientation_vector);
    }
    let row_axis = row_axis.unwrap_or([1.0, 0.0, 0.0]);
    let col_axis = col_axis.unwrap_or([0.0, 1.0, 0.0]);
    let mut slice_axis = cross(row_axis, col_axis);
    if norm3(slice_axis) < 1e-6 {
        slice_axis = [0.0, 0.0, 1.0];
    }
    let origin = f64_list(obj, tags::IMAGE_POSITION_PATIENT)
        .filter(|v| v.len() >= 3)
        .map(|v| [v[0], v[1], v[2]])
        .unwrap_or([0.0; 3]);
    let spacing = pixel_spacing(obj);
    affine_from_ras_axes(
        row_axis,
        col_axis,
        slice_axis,
        origin,
        spacing[0],
        spacing[1],
        slice_spacing,
    )
}

fn pixel_spacing(obj: &DefaultDicomObject) -> [f64; 2] {
    f64_list(obj, tags::PIXEL_SPACING)
        .or_else(|| f64_list(obj, tags::IMAGER_PIXEL_SPACING))
        .filter(|v| v.len() >= 2)
        .map(|v| [v[0], v[1]])
        .unwrap_or([1.0, 1.0])
}

/// Reorient to nearest-canonical and write a compressed NIfTI with an sform
/// affine.
pub(crate) fn write_nifti(
    path: &Utf8Path,
    volume: ArrayD<f32>,
    affine: Array2<f64>,
) -> Result<(), ConvertError> {
    let (data, affine) = reorient_to_canonical(volume, affine);
    let header = header_with_affine(&affine);
    WriterOptions::new(path.as_std_path())
        .reference_header(&header)
        .write_nifti(&data.as_standard_layout())?;
    Ok(())
}
