//! Per-series metadata cache (`dicom_metadata_cache.json`).
//!
//! Written by the converter that owns a series before the raw instances are
//! deleted, then read back by the workbook extractor. Losing the cache only
//! costs metadata fidelity, so cache I/O failures are logged, never fatal.

use crate::attrs::{TagValue, int_value, keyword_value, string_value};
use camino::{Utf8Path, Utf8PathBuf};
use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub(crate) const CACHE_FILE_NAME: &str = "dicom_metadata_cache.json";

/// One flat metadata row: tag keyword → flattened string value.
pub type Record = BTreeMap<String, String>;

/// Tags the converter and preview generator need after the instances are
/// gone.
const SAMPLE_TAG_NAMES: &[&str] = &[
    "Modality",
    "WindowCenter",
    "WindowWidth",
    "Rows",
    "Columns",
    "PixelSpacing",
    "ImagerPixelSpacing",
    "PatientOrientation",
    "SpacingBetweenSlices",
    "SliceThickness",
    "PhotometricInterpretation",
    "RescaleSlope",
    "RescaleIntercept",
    "ImageOrientationPatient",
    "ImagePositionPatient",
];

/// Provenance of one converted output file.
#[allow(non_snake_case)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConversionRecord {
    pub output_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub FileIndex: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub SourceFile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub Rows: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub Columns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub SOPInstanceUID: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub InstanceNumber: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub PhotometricInterpretation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ImageLaterality: Option<String>,
}

impl ConversionRecord {
    pub(crate) fn from_instance(
        obj: &DefaultDicomObject,
        output_file: String,
        file_index: Option<u32>,
        source_file: Option<String>,
    ) -> Self {
        Self {
            output_file,
            FileIndex: file_index,
            SourceFile: source_file,
            Rows: int_value(obj, tags::ROWS).map(|v| v.to_string()),
            Columns: int_value(obj, tags::COLUMNS).map(|v| v.to_string()),
            SOPInstanceUID: string_value(obj, tags::SOP_INSTANCE_UID),
            InstanceNumber: string_value(obj, tags::INSTANCE_NUMBER),
            PhotometricInterpretation: string_value(obj, tags::PHOTOMETRIC_INTERPRETATION),
            ImageLaterality: string_value(obj, tags::IMAGE_LATERALITY),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SeriesCache {
    #[serde(default)]
    pub modality: String,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub sample_tags: Option<BTreeMap<String, TagValue>>,
    #[serde(default)]
    pub conversion_map: BTreeMap<String, ConversionRecord>,
}

impl SeriesCache {
    pub(crate) fn path_for(series_dir: &Utf8Path) -> Utf8PathBuf {
        series_dir.join(CACHE_FILE_NAME)
    }

    pub(crate) fn load(series_dir: &Utf8Path) -> Option<Self> {
        let path = Self::path_for(series_dir);
        let bytes = fs_err::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(path = path.as_str(), "unreadable series cache: {e}");
                None
            }
        }
    }

    pub(crate) fn save(&self, series_dir: &Utf8Path) {
        let path = Self::path_for(series_dir);
        let result = serde_json::to_vec_pretty(self)
            .map_err(std::io::Error::other)
            .and_then(|bytes| fs_err::write(&path, bytes));
        if let Err(e) = result {
            tracing::warn!(path = path.as_str(), "could not write series cache: {e}");
        }
    }

    /// Merge conversion records into the cache on disk.
    pub(crate) fn append_conversions(series_dir: &Utf8Path, entries: &[ConversionRecord]) {
        if entries.is_empty() {
            return;
        }
        let mut cache = Self::load(series_dir).unwrap_or_default();
        for entry in entries {
            cache
                .conversion_map
                .insert(entry.output_file.clone(), entry.clone());
        }
        cache.save(series_dir);
    }

    /// Clone the NIfTI conversion entries for their NPZ successors.
    pub(crate) fn clone_conversions_for_npz(series_dir: &Utf8Path, npz_files: &[String]) {
        let Some(mut cache) = Self::load(series_dir) else {
            return;
        };
        let mut updated = false;
        for npz_file in npz_files {
            let stem = npz_file.trim_end_matches(".npz");
            let source = [format!("{stem}.nii.gz"), format!("{stem}.nii")]
                .into_iter()
                .find_map(|candidate| cache.conversion_map.get(&candidate).cloned());
            if let Some(mut entry) = source {
                if !cache.conversion_map.contains_key(npz_file) {
                    entry.output_file = npz_file.clone();
                    cache.conversion_map.insert(npz_file.clone(), entry);
                    updated = true;
                }
            }
        }
        if updated {
            cache.save(series_dir);
        }
    }
}

/// Read the sample-tag subset from one instance.
pub(crate) fn build_sample_tags(dcm: &DefaultDicomObject) -> BTreeMap<String, TagValue> {
    SAMPLE_TAG_NAMES
        .iter()
        .filter_map(|name| keyword_value(dcm, name).map(|value| (name.to_string(), value)))
        .collect()
}
