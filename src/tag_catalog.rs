//! Per-modality DICOM tag keyword catalog.
//!
//! A directory of `{MODALITY}.json` files, each an ordered array of DICOM
//! keyword strings, overlays the compiled-in defaults. Lookup folds the
//! radiography modalities together and reuses the MR set for anything
//! unknown.

use camino::Utf8Path;
use std::collections::HashMap;

const DEFAULT_KEYWORDS: &[&str] = &[
    "Modality",
    "StudyDate",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientID",
    "AccessionNumber",
    "SeriesNumber",
    "SeriesDescription",
    "BodyPartExamined",
    "Manufacturer",
    "ManufacturerModelName",
];

/// The MR set carries everything the sequence classifier reads.
const MR_KEYWORDS: &[&str] = &[
    "Modality",
    "StudyDate",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientID",
    "AccessionNumber",
    "SeriesNumber",
    "SeriesDescription",
    "InstanceNumber",
    "BodyPartExamined",
    "Manufacturer",
    "ManufacturerModelName",
    "MagneticFieldStrength",
    "ProtocolName",
    "ImageType",
    "SeriesTime",
    "AcquisitionTime",
    "ScanningSequence",
    "SequenceVariant",
    "ScanOptions",
    "MRAcquisitionType",
    "RepetitionTime",
    "EchoTime",
    "InversionTime",
    "FlipAngle",
    "EchoTrainLength",
    "EchoNumbers",
    "DiffusionBValue",
    "SliceThickness",
    "SpacingBetweenSlices",
    "PixelSpacing",
    "ImageOrientationPatient",
    "ImagePositionPatient",
    "ContrastBolusAgent",
];

const DX_KEYWORDS: &[&str] = &[
    "Modality",
    "StudyDate",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientID",
    "AccessionNumber",
    "SeriesNumber",
    "SeriesDescription",
    "InstanceNumber",
    "BodyPartExamined",
    "ViewPosition",
    "ImageLaterality",
    "PatientOrientation",
    "Manufacturer",
    "ManufacturerModelName",
    "KVP",
    "ExposureTime",
    "WindowCenter",
    "WindowWidth",
];

const CT_KEYWORDS: &[&str] = &[
    "Modality",
    "StudyDate",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientID",
    "AccessionNumber",
    "SeriesNumber",
    "SeriesDescription",
    "InstanceNumber",
    "BodyPartExamined",
    "Manufacturer",
    "ManufacturerModelName",
    "KVP",
    "SliceThickness",
    "SpacingBetweenSlices",
    "PixelSpacing",
    "ConvolutionKernel",
    "ContrastBolusAgent",
    "WindowCenter",
    "WindowWidth",
];

pub struct TagCatalog {
    keywords: HashMap<String, Vec<String>>,
}

impl TagCatalog {
    /// Compiled-in defaults overlaid with any `{MODALITY}.json` files found
    /// in `tags_dir`. Unreadable files are logged and skipped.
    pub fn load(tags_dir: Option<&Utf8Path>) -> Self {
        let mut keywords: HashMap<String, Vec<String>> = HashMap::new();
        for (modality, set) in [
            ("DEFAULT", DEFAULT_KEYWORDS),
            ("MR", MR_KEYWORDS),
            ("DX", DX_KEYWORDS),
            ("CT", CT_KEYWORDS),
        ] {
            keywords.insert(
                modality.to_string(),
                set.iter().map(|s| s.to_string()).collect(),
            );
        }

        if let Some(dir) = tags_dir {
            match fs_err::read_dir(dir) {
                Ok(entries) => {
                    for entry in entries.filter_map(|e| e.ok()) {
                        let Ok(name) = entry.file_name().into_string() else {
                            continue;
                        };
                        let Some(modality) = name.strip_suffix(".json") else {
                            continue;
                        };
                        let path = dir.join(&name);
                        match fs_err::read(&path)
                            .map_err(anyhow::Error::from)
                            .and_then(|bytes| {
                                serde_json::from_slice::<Vec<String>>(&bytes)
                                    .map_err(anyhow::Error::from)
                            }) {
                            Ok(list) => {
                                tracing::info!(
                                    modality,
                                    keywords = list.len(),
                                    "loaded tag keyword list"
                                );
                                keywords.insert(modality.to_uppercase(), list);
                            }
                            Err(e) => {
                                tracing::warn!(path = path.as_str(), "skipping tag list: {e}")
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(
                    dir = dir.as_str(),
                    "tag catalog directory unreadable, using built-in sets: {e}"
                ),
            }
        }
        Self { keywords }
    }

    /// Keyword list for a modality. CR/DX/DR share the DX set; anything
    /// containing "MR" uses the MR set; unknown modalities fall back to MR,
    /// then to the minimal default.
    pub fn keywords_for(&self, modality: &str) -> &[String] {
        let modality = modality.to_uppercase();
        let key = if matches!(modality.as_str(), "DR" | "DX" | "CR") {
            "DX"
        } else if modality.contains("MR") {
            "MR"
        } else if self.keywords.contains_key(modality.as_str()) {
            modality.as_str()
        } else if self.keywords.contains_key("MR") {
            "MR"
        } else {
            "DEFAULT"
        };
        self.keywords
            .get(key)
            .or_else(|| self.keywords.get("DEFAULT"))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radiography_modalities_share_one_set() {
        let catalog = TagCatalog::load(None);
        assert_eq!(catalog.keywords_for("CR"), catalog.keywords_for("DR"));
        assert_eq!(catalog.keywords_for("dx"), catalog.keywords_for("DX"));
    }

    #[test]
    fn unknown_modality_falls_back_to_mr() {
        let catalog = TagCatalog::load(None);
        assert_eq!(catalog.keywords_for("XA"), catalog.keywords_for("MR"));
    }

    #[test]
    fn enhanced_mr_uses_mr_set() {
        let catalog = TagCatalog::load(None);
        assert!(
            catalog
                .keywords_for("ENHANCED MR")
                .iter()
                .any(|k| k == "ScanningSequence")
        );
    }
}
