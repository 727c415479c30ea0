//! Series conversion: dcm2niix first, pure-library fallback, optional NPZ
//! normalization.
//!
//! Invariant: the raw `.dcm` instances are deleted iff at least one output
//! file exists when conversion returns; a series that fails both paths keeps
//! its originals untouched.

use crate::dcm2niix;
use crate::error::ConvertError;
use crate::metadata_cache::{ConversionRecord, SeriesCache};
use crate::npz::normalize_and_save_npz;
use crate::sanitize::sanitize_series_name;
use crate::settings::OutputFormat;
use crate::volume::{convert_instance_to_nifti, convert_series_to_nifti};
use camino::{Utf8Path, Utf8PathBuf};
use dicom::dictionary_std::tags;
use dicom::object::OpenFileOptions;
use std::io::Read;
use std::time::Duration;

const INDIVIDUAL_TIMEOUT: Duration = Duration::from_secs(60);
const SERIES_TIMEOUT: Duration = Duration::from_secs(300);

/// DR/DX/MG projections convert one output per instance; everything else
/// stacks into a single volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionMode {
    Series,
    Individual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionMethod {
    Dcm2niix,
    Library,
}

#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub method: ConversionMethod,
    pub mode: ConversionMode,
    /// Output file names within the series directory, in source order for
    /// individual mode.
    pub output_files: Vec<String>,
    pub modality: String,
}

/// One produced output and the index of the instance it came from (individual
/// mode only).
struct Converted {
    output_file: String,
    source_index: Option<usize>,
}

/// Convert every instance in `series_dir`, preferring the external tool and
/// falling back to the pure-library path.
pub(crate) async fn convert_series(
    series_dir: &Utf8Path,
    series_name: &str,
    output_format: OutputFormat,
) -> Result<ConversionOutcome, ConvertError> {
    let dicom_files = collect_dicom_files(series_dir)?;
    if dicom_files.is_empty() {
        return Err(ConvertError::NoDicomFiles(series_dir.to_owned()));
    }

    let representative = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(dicom_files[0].as_std_path())?;
    let modality =
        crate::attrs::string_value(&representative, tags::MODALITY).unwrap_or_default();
    let mode = if matches!(modality.as_str(), "DR" | "DX" | "MG") {
        ConversionMode::Individual
    } else {
        ConversionMode::Series
    };
    let output_name = sanitize_series_name(series_name);
    tracing::info!(
        series = series_name,
        modality,
        ?mode,
        "converting series"
    );

    let (converted, method) = if dcm2niix::is_available().await {
        match convert_with_tool(series_dir, &dicom_files, &output_name, mode).await {
            Ok(converted) if !converted.is_empty() => (converted, ConversionMethod::Dcm2niix),
            Ok(_) => {
                tracing::warn!(series = series_name, "dcm2niix produced no output, falling back");
                (
                    convert_with_library(series_dir, &dicom_files, &output_name, mode).await?,
                    ConversionMethod::Library,
                )
            }
            Err(e) => {
                tracing::warn!(series = series_name, "dcm2niix failed ({e}), falling back");
                (
                    convert_with_library(series_dir, &dicom_files, &output_name, mode).await?,
                    ConversionMethod::Library,
                )
            }
        }
    } else {
        (
            convert_with_library(series_dir, &dicom_files, &output_name, mode).await?,
            ConversionMethod::Library,
        )
    };
    if converted.is_empty() {
        return Err(ConvertError::NoPixelData);
    }

    let records = build_conversion_records(&dicom_files, &converted);
    SeriesCache::append_conversions(series_dir, &records);

    // at least one output exists on disk now
    for file in &dicom_files {
        if let Err(e) = fs_err::remove_file(file) {
            tracing::warn!(file = file.as_str(), "could not remove original: {e}");
        }
    }

    let mut output_files: Vec<String> = converted.into_iter().map(|c| c.output_file).collect();
    if output_format == OutputFormat::Npz {
        output_files = normalize_outputs_to_npz(series_dir, output_files).await?;
    }

    Ok(ConversionOutcome {
        method,
        mode,
        output_files,
        modality,
    })
}

async fn convert_with_tool(
    series_dir: &Utf8Path,
    dicom_files: &[Utf8PathBuf],
    output_name: &str,
    mode: ConversionMode,
) -> Result<Vec<Converted>, ConvertError> {
    match mode {
        ConversionMode::Series => {
            dcm2niix::run(series_dir, series_dir, output_name, SERIES_TIMEOUT).await?;
            let produced = list_nifti_outputs(series_dir)?;
            if produced.is_empty() {
                return Err(ConvertError::Tool(
                    "exited cleanly but produced no output".to_string(),
                ));
            }
            Ok(produced
                .into_iter()
                .map(|output_file| Converted {
                    output_file,
                    source_index: Some(0),
                })
                .collect())
        }
        ConversionMode::Individual => {
            let mut converted = Vec::new();
            let total = dicom_files.len();
            for (idx, file) in dicom_files.iter().enumerate() {
                // give dcm2niix a directory with exactly one instance
                let temp_dir = series_dir.join(format!("temp_{idx}"));
                let file_output_name = format!("{output_name}_{:04}", idx + 1);
                let result: Result<String, ConvertError> = async {
                    fs_err::create_dir_all(&temp_dir)?;
                    let temp_dcm =
                        temp_dir.join(file.file_name().unwrap_or("instance.dcm"));
                    fs_err::copy(file, &temp_dcm)?;
                    dcm2niix::run(&temp_dir, series_dir, &file_output_name, INDIVIDUAL_TIMEOUT)
                        .await?;
                    let nifti_file = format!("{file_output_name}.nii.gz");
                    if series_dir.join(&nifti_file).is_file() {
                        Ok(nifti_file)
                    } else {
                        Err(ConvertError::Tool(
                            "exited cleanly but produced no output".to_string(),
                        ))
                    }
                }
                .await;
                let _ = fs_err::remove_dir_all(&temp_dir);
                match result {
                    Ok(output_file) => converted.push(Converted {
                        output_file,
                        source_index: Some(idx),
                    }),
                    Err(e) => {
                        tracing::warn!(file = file.as_str(), "instance conversion failed: {e}")
                    }
                }
                if (idx + 1) % 10 == 0 {
                    tracing::info!(converted = idx + 1, total, "converting instances");
                }
            }
            Ok(converted)
        }
    }
}

async fn convert_with_library(
    series_dir: &Utf8Path,
    dicom_files: &[Utf8PathBuf],
    output_name: &str,
    mode: ConversionMode,
) -> Result<Vec<Converted>, ConvertError> {
    let series_dir = series_dir.to_owned();
    let dicom_files = dicom_files.to_vec();
    let output_name = output_name.to_string();
    tokio::task::spawn_blocking(move || match mode {
        ConversionMode::Series => {
            let output_file = convert_series_to_nifti(&series_dir, &dicom_files, &output_name)?;
            Ok(vec![Converted {
                output_file,
                source_index: Some(0),
            }])
        }
        ConversionMode::Individual => {
            let mut converted = Vec::new();
            for (idx, file) in dicom_files.iter().enumerate() {
                let file_output_name = format!("{output_name}_{:04}", idx + 1);
                match convert_instance_to_nifti(file, &series_dir, &file_output_name) {
                    Ok(output_file) => converted.push(Converted {
                        output_file,
                        source_index: Some(idx),
                    }),
                    Err(e) => {
                        tracing::warn!(file = file.as_str(), "instance conversion failed: {e}")
                    }
                }
            }
            if converted.is_empty() {
                Err(ConvertError::NoPixelData)
            } else {
                Ok(converted)
            }
        }
    })
    .await?
}

/// Rewrite each NIfTI output as a normalized NPZ tensor and drop the
/// intermediate, carrying the conversion-map provenance over.
async fn normalize_outputs_to_npz(
    series_dir: &Utf8Path,
    nifti_files: Vec<String>,
) -> Result<Vec<String>, ConvertError> {
    let dir = series_dir.to_owned();
    let npz_files = tokio::task::spawn_blocking(move || -> Result<Vec<String>, ConvertError> {
        let mut produced = Vec::new();
        for nii in &nifti_files {
            let stem = nii.trim_end_matches(".nii.gz").trim_end_matches(".nii");
            let npz_file = format!("{stem}.npz");
            let nii_path = dir.join(nii);
            normalize_and_save_npz(&nii_path, &dir.join(&npz_file))?;
            fs_err::remove_file(&nii_path)?;
            produced.push(npz_file);
        }
        Ok(produced)
    })
    .await??;
    SeriesCache::clone_conversions_for_npz(series_dir, &npz_files);
    Ok(npz_files)
}

fn build_conversion_records(
    dicom_files: &[Utf8PathBuf],
    converted: &[Converted],
) -> Vec<ConversionRecord> {
    converted
        .iter()
        .filter_map(|c| {
            let source_index = c.source_index?;
            let source = dicom_files.get(source_index)?;
            let obj = OpenFileOptions::new()
                .read_until(tags::PIXEL_DATA)
                .open_file(source.as_std_path())
                .ok()?;
            Some(ConversionRecord::from_instance(
                &obj,
                c.output_file.clone(),
                Some(source_index as u32 + 1),
                source.file_name().map(|s| s.to_string()),
            ))
        })
        .collect()
}

/// `.dcm` files of a series directory, sorted by name. Files without the
/// extension are admitted when they carry the `DICM` magic.
pub(crate) fn collect_dicom_files(series_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, ConvertError> {
    let mut files = Vec::new();
    for entry in fs_err::read_dir(series_dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let path = series_dir.join(&name);
        if !path.is_file() {
            continue;
        }
        if name.ends_with(".dcm") || is_dicom_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Probe for the `DICM` magic at offset 128.
pub(crate) fn is_dicom_file(path: &Utf8Path) -> bool {
    if matches!(
        path.extension(),
        Some("json") | Some("csv") | Some("txt") | Some("png") | Some("npz") | Some("gz") | Some("nii")
    ) {
        return false;
    }
    let Ok(mut file) = fs_err::File::open(path) else {
        return false;
    };
    let mut preamble = [0u8; 132];
    if file.read_exact(&mut preamble).is_err() {
        return false;
    }
    &preamble[128..132] == b"DICM"
}

/// Converted output files (`.nii.gz`/`.nii`), sorted by name.
pub(crate) fn list_nifti_outputs(series_dir: &Utf8Path) -> Result<Vec<String>, ConvertError> {
    let mut outputs = Vec::new();
    for entry in fs_err::read_dir(series_dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.ends_with(".nii.gz") || name.ends_with(".nii") {
            outputs.push(name);
        }
    }
    outputs.sort();
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_cache::SeriesCache;
    use crate::settings::OutputFormat;
    use camino::Utf8PathBuf;
    use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
    use dicom::dicom_value;
    use dicom::dictionary_std::{tags, uids};
    use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
    use nifti::{NiftiObject, ReaderOptions};

    fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }

    // multi-valued text elements carry their multiplicity as backslashes in
    // the encoded form; the round trip through disk splits them again
    fn put_strs(obj: &mut InMemDicomObject, tag: Tag, values: &[&str]) {
        obj.put(DataElement::new(
            tag,
            VR::DS,
            PrimitiveValue::from(values.join("\\")),
        ));
    }

    fn base_instance(modality: &str, sop_instance_uid: &str, with_pixels: bool) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
        put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
        put_str(&mut obj, tags::MODALITY, VR::CS, modality);
        put_str(
            &mut obj,
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            "MONOCHROME2",
        );
        obj.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [4])));
        obj.put(DataElement::new(
            tags::COLUMNS,
            VR::US,
            dicom_value!(U16, [4]),
        ));
        obj.put(DataElement::new(
            tags::BITS_ALLOCATED,
            VR::US,
            dicom_value!(U16, [16]),
        ));
        obj.put(DataElement::new(
            tags::BITS_STORED,
            VR::US,
            dicom_value!(U16, [16]),
        ));
        obj.put(DataElement::new(
            tags::HIGH_BIT,
            VR::US,
            dicom_value!(U16, [15]),
        ));
        obj.put(DataElement::new(
            tags::PIXEL_REPRESENTATION,
            VR::US,
            dicom_value!(U16, [0]),
        ));
        obj.put(DataElement::new(
            tags::SAMPLES_PER_PIXEL,
            VR::US,
            dicom_value!(U16, [1]),
        ));
        put_strs(&mut obj, tags::PIXEL_SPACING, &["0.5", "0.5"]);
        put_str(&mut obj, tags::SLICE_THICKNESS, VR::DS, "2.5");
        put_str(&mut obj, tags::RESCALE_SLOPE, VR::DS, "1");
        put_str(&mut obj, tags::RESCALE_INTERCEPT, VR::DS, "0");
        if with_pixels {
            let pixels: Vec<u16> = (0..16u16).map(|i| i * 100).collect();
            obj.put(DataElement::new(
                tags::PIXEL_DATA,
                VR::OW,
                PrimitiveValue::U16(pixels.into()),
            ));
        }
        obj
    }

    fn write_instance(obj: InMemDicomObject, sop_instance_uid: &str, path: &Utf8Path) {
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(sop_instance_uid)
            .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .build()
            .unwrap();
        obj.with_exact_meta(meta).write_to_file(path).unwrap();
    }

    fn write_ct_slice(dir: &Utf8Path, name: &str, sop_instance_uid: &str, z: f64) {
        let mut obj = base_instance("CT", sop_instance_uid, true);
        put_strs(
            &mut obj,
            tags::IMAGE_ORIENTATION_PATIENT,
            &["1", "0", "0", "0", "1", "0"],
        );
        put_strs(
            &mut obj,
            tags::IMAGE_POSITION_PATIENT,
            &["0", "0", &z.to_string()],
        );
        write_instance(obj, sop_instance_uid, &dir.join(name));
    }

    fn temp_series_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn ct_series_stacks_into_one_volume_and_removes_originals() {
        let (_guard, dir) = temp_series_dir();
        // shuffled on disk; geometry decides the stacking order
        write_ct_slice(&dir, "b.dcm", "1.2.3.2", 5.0);
        write_ct_slice(&dir, "a.dcm", "1.2.3.1", 0.0);
        write_ct_slice(&dir, "c.dcm", "1.2.3.3", 2.5);

        let outcome = convert_series(&dir, "003_CT Axial", OutputFormat::Nifti)
            .await
            .unwrap();
        assert_eq!(outcome.mode, ConversionMode::Series);
        assert_eq!(outcome.output_files, vec!["003_CT_Axial.nii.gz".to_string()]);

        let output = dir.join("003_CT_Axial.nii.gz");
        assert!(output.is_file());
        assert!(collect_dicom_files(&dir).unwrap().is_empty(), "originals kept");

        let object = ReaderOptions::new().read_file(output.as_std_path()).unwrap();
        let header = object.header();
        assert_eq!(&header.dim[1..4], &[4, 4, 3]);
        // slice spacing comes from the inter-slice distance
        assert!((header.pixdim[3] - 2.5).abs() < 1e-4);

        let cache = SeriesCache::load(&dir).unwrap();
        assert!(cache.conversion_map.contains_key("003_CT_Axial.nii.gz"));
    }

    #[tokio::test]
    async fn dr_projections_convert_individually_in_source_order() {
        let (_guard, dir) = temp_series_dir();
        for (name, uid) in [("p1.dcm", "1.2.9.1"), ("p2.dcm", "1.2.9.2")] {
            let mut obj = base_instance("DR", uid, true);
            // no IOP/IPP: geometry falls back to PatientOrientation
            obj.put(DataElement::new(
                tags::PATIENT_ORIENTATION,
                VR::CS,
                PrimitiveValue::from("L\\F"),
            ));
            write_instance(obj, uid, &dir.join(name));
        }

        let outcome = convert_series(&dir, "001_Hand", OutputFormat::Nifti)
            .await
            .unwrap();
        assert_eq!(outcome.mode, ConversionMode::Individual);
        assert_eq!(
            outcome.output_files,
            vec![
                "001_Hand_0001.nii.gz".to_string(),
                "001_Hand_0002.nii.gz".to_string()
            ]
        );
        assert!(collect_dicom_files(&dir).unwrap().is_empty());

        let cache = SeriesCache::load(&dir).unwrap();
        let entry = cache.conversion_map.get("001_Hand_0002.nii.gz").unwrap();
        assert_eq!(entry.FileIndex, Some(2));
        assert_eq!(entry.SourceFile.as_deref(), Some("p2.dcm"));
    }

    #[tokio::test]
    async fn npz_output_replaces_nifti_and_keeps_provenance() {
        let (_guard, dir) = temp_series_dir();
        write_ct_slice(&dir, "a.dcm", "1.2.3.1", 0.0);
        write_ct_slice(&dir, "b.dcm", "1.2.3.2", 2.5);

        let outcome = convert_series(&dir, "Axial", OutputFormat::Npz).await.unwrap();
        assert_eq!(outcome.output_files, vec!["Axial.npz".to_string()]);
        assert!(dir.join("Axial.npz").is_file());
        assert!(!dir.join("Axial.nii.gz").exists());

        let tensor = crate::npz::load_npz(&dir.join("Axial.npz")).unwrap();
        assert_eq!(tensor.shape(), &[2, 4, 4]);

        let cache = SeriesCache::load(&dir).unwrap();
        assert!(cache.conversion_map.contains_key("Axial.npz"));
    }

    #[tokio::test]
    async fn series_without_pixels_keeps_originals() {
        let (_guard, dir) = temp_series_dir();
        let obj = base_instance("CT", "1.2.3.9", false);
        write_instance(obj, "1.2.3.9", &dir.join("broken.dcm"));

        let result = convert_series(&dir, "Broken", OutputFormat::Nifti).await;
        assert!(result.is_err());
        assert_eq!(collect_dicom_files(&dir).unwrap().len(), 1);
    }
}
