//! MR series governance: derives canonical sequence labels, dynamic contrast
//! groups, and enhancement status from the aggregated metadata rows.

use crate::metadata_cache::Record;
use crate::mr_config::MrCleanConfig;
use crate::mr_dynamics::{infer_dynamic_groups, propagate_enhancement};
use crate::mr_features::MrRow;
use crate::mr_rules::classify_row;

/// Column order of the derived block appended to each cleaned row.
pub const DERIVED_COLUMNS: &[&str] = &[
    "standardOrientation",
    "standardDimension",
    "isFatSuppressed",
    "isContrastEnhanced",
    "hasMotionCorrection",
    "refinedImageType",
    "standardFieldStrength",
    "standardManufacturer",
    "cleanedModelName",
    "sequenceClass",
    "dynamicGroup",
    "dynamicPhase",
];

/// Run the full five-stage classifier over MR rows and return each original
/// record with the derived columns appended.
pub fn clean_mr_records(records: &[Record], config: &MrCleanConfig) -> Vec<Record> {
    let mut rows: Vec<MrRow> = records
        .iter()
        .enumerate()
        .map(|(index, record)| MrRow::from_record(index, record, config))
        .collect();

    for row in &mut rows {
        classify_row(row, config);
    }
    infer_dynamic_groups(&mut rows, config);
    propagate_enhancement(&mut rows, config);

    tracing::info!(rows = rows.len(), "MR classification finished");
    rows.iter()
        .map(|row| {
            let mut record = records[row.record_index].clone();
            record.insert(
                "standardOrientation".to_string(),
                row.standard_orientation.clone(),
            );
            record.insert(
                "standardDimension".to_string(),
                row.standard_dimension.clone(),
            );
            record.insert(
                "isFatSuppressed".to_string(),
                bool_str(row.is_fat_suppressed),
            );
            record.insert(
                "isContrastEnhanced".to_string(),
                bool_str(row.is_contrast_enhanced),
            );
            record.insert(
                "hasMotionCorrection".to_string(),
                bool_str(row.has_motion_correction),
            );
            record.insert(
                "refinedImageType".to_string(),
                row.refined_image_type.clone(),
            );
            record.insert(
                "standardFieldStrength".to_string(),
                row.standard_field_strength.clone(),
            );
            record.insert(
                "standardManufacturer".to_string(),
                row.standard_manufacturer.clone(),
            );
            record.insert("cleanedModelName".to_string(), row.cleaned_model.clone());
            record.insert("sequenceClass".to_string(), row.sequence_class.clone());
            record.insert(
                "dynamicGroup".to_string(),
                row.dynamic_group
                    .map(|g| g.to_string())
                    .unwrap_or_default(),
            );
            record.insert("dynamicPhase".to_string(), row.dynamic_phase.clone());
            record
        })
        .collect()
}

fn bool_str(value: bool) -> String {
    if value { "True" } else { "False" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(entries: &[(&str, &str)]) -> Record {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn dynamic_run_gets_pre_and_post_phases() {
        let geometry: &[(&str, &str)] = &[
            ("StudyInstanceUID", "1.2.3"),
            ("ImagePositionPatient", "[0, 0, 0]"),
            ("ImageOrientationPatient", "[1, 0, 0, 0, 1, 0]"),
            ("ScanningSequence", "GR"),
            ("SequenceVariant", "SP"),
            ("RepetitionTime", "6.5"),
            ("EchoTime", "2.3"),
            ("FlipAngle", "10"),
            ("SliceThickness", "3"),
            ("ContrastBolusAgent", "GADOVIST"),
        ];
        let records: Vec<Record> = ["090000", "090200", "090400"]
            .iter()
            .map(|time| {
                let mut r = record(geometry);
                r.insert("SeriesTime".to_string(), time.to_string());
                r
            })
            .collect();

        let cleaned = clean_mr_records(&records, &MrCleanConfig::default());
        let phases: Vec<&str> = cleaned.iter().map(|r| r["dynamicPhase"].as_str()).collect();
        assert_eq!(phases, vec!["PRE", "POST_1", "POST_2"]);
        let groups: Vec<&str> = cleaned.iter().map(|r| r["dynamicGroup"].as_str()).collect();
        assert_eq!(groups, vec!["1", "1", "1"]);
        let enhanced: Vec<&str> = cleaned
            .iter()
            .map(|r| r["isContrastEnhanced"].as_str())
            .collect();
        assert_eq!(enhanced, vec!["False", "True", "True"]);
    }

    #[test]
    fn late_t1_inherits_enhancement_but_t2_does_not() {
        let geometry: &[(&str, &str)] = &[
            ("StudyInstanceUID", "1.2.3"),
            ("ImagePositionPatient", "[0, 0, 0]"),
            ("ImageOrientationPatient", "[1, 0, 0, 0, 1, 0]"),
            ("ScanningSequence", "GR"),
            ("SequenceVariant", "SP"),
            ("RepetitionTime", "6.5"),
            ("EchoTime", "2.3"),
            ("FlipAngle", "10"),
            ("SliceThickness", "3"),
            ("ContrastBolusAgent", "GADOVIST"),
        ];
        let mut records: Vec<Record> = ["090000", "090200"]
            .iter()
            .map(|time| {
                let mut r = record(geometry);
                r.insert("SeriesTime".to_string(), time.to_string());
                r
            })
            .collect();
        // ungrouped late series at 09:30, distinct geometry
        records.push(record(&[
            ("StudyInstanceUID", "1.2.3"),
            ("SeriesTime", "093000"),
            ("ProtocolName", "t1_tse_sag"),
            ("ImagePositionPatient", "[5, 5, 5]"),
        ]));
        records.push(record(&[
            ("StudyInstanceUID", "1.2.3"),
            ("SeriesTime", "093000"),
            ("ProtocolName", "t2_tse_sag"),
            ("ImagePositionPatient", "[9, 9, 9]"),
        ]));

        let cleaned = clean_mr_records(&records, &MrCleanConfig::default());
        assert_eq!(cleaned[2]["sequenceClass"], "T1_TSE");
        assert_eq!(cleaned[2]["dynamicPhase"], "POST_PROPAGATED");
        assert_eq!(cleaned[2]["isContrastEnhanced"], "True");
        assert_eq!(cleaned[3]["dynamicPhase"], "");
        assert_eq!(cleaned[3]["isContrastEnhanced"], "False");
    }
}
