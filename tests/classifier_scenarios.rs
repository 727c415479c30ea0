//! End-to-end scenarios for the MR sequence classifier on synthetic studies.

use pretty_assertions::assert_eq;
use voxidicom::{MrCleanConfig, Record, clean_mr_records};

fn record(entries: &[(&str, &str)]) -> Record {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn column<'a>(records: &'a [Record], key: &str) -> Vec<&'a str> {
    records.iter().map(|r| r[key].as_str()).collect()
}

/// MR brain study with a localizer, a T2 TSE, and a three-phase dynamic T1
/// run at identical geometry.
#[test]
fn brain_study_with_dynamics() {
    let study = "1.2.840.1.1";
    let t1_geometry: &[(&str, &str)] = &[
        ("StudyInstanceUID", study),
        ("Modality", "MR"),
        ("ProtocolName", "t1_vibe_tra"),
        ("ScanningSequence", "GR"),
        ("SequenceVariant", "SP"),
        ("RepetitionTime", "6.5"),
        ("EchoTime", "2.3"),
        ("FlipAngle", "10"),
        ("SliceThickness", "3"),
        ("ImageOrientationPatient", "[1, 0, 0, 0, 1, 0]"),
        ("ImagePositionPatient", "[-120, -110, 40]"),
        ("ContrastBolusAgent", "GADOVIST 1.0"),
    ];

    let mut records = vec![
        record(&[
            ("StudyInstanceUID", study),
            ("Modality", "MR"),
            ("ProtocolName", "localizer"),
            ("SeriesTime", "100000"),
            ("ImageOrientationPatient", "[1, 0, 0, 0, 1, 0]"),
            ("DiffusionBValue", "0"),
        ]),
        record(&[
            ("StudyInstanceUID", study),
            ("Modality", "MR"),
            ("ProtocolName", "t2_tse_tra"),
            ("ScanningSequence", "SE"),
            ("EchoTrainLength", "16"),
            ("RepetitionTime", "5000"),
            ("EchoTime", "110"),
            ("SeriesTime", "100200"),
            ("ImageOrientationPatient", "[1, 0, 0, 0, 1, 0]"),
            ("ImagePositionPatient", "[-120, -110, 38]"),
        ]),
    ];
    for time in ["100500", "100700", "100900"] {
        let mut r = record(t1_geometry);
        r.insert("SeriesTime".to_string(), time.to_string());
        records.push(r);
    }

    let cleaned = clean_mr_records(&records, &MrCleanConfig::default());

    assert_eq!(
        column(&cleaned, "sequenceClass"),
        vec![
            "LOCALIZER",
            "T2_TSE",
            "T1_GRE_SPOILED",
            "T1_GRE_SPOILED",
            "T1_GRE_SPOILED"
        ]
    );
    assert_eq!(
        column(&cleaned, "dynamicGroup"),
        vec!["", "", "1", "1", "1"]
    );
    assert_eq!(
        column(&cleaned, "dynamicPhase"),
        vec!["", "", "PRE", "POST_1", "POST_2"]
    );
    assert_eq!(
        column(&cleaned, "isContrastEnhanced"),
        vec!["False", "False", "False", "True", "True"]
    );
    assert_eq!(column(&cleaned, "standardOrientation")[0], "AX");
}

/// Dixon acquisition: four reconstructions of one spoiled-GRE scan labelled
/// by ImageType.
#[test]
fn dixon_reconstructions() {
    let base: &[(&str, &str)] = &[
        ("StudyInstanceUID", "1.2.840.2.2"),
        ("Modality", "MR"),
        ("ProtocolName", "t1_dixon_tra"),
        ("ScanningSequence", "GR"),
        ("SequenceVariant", "SP"),
        ("RepetitionTime", "6.5"),
        ("EchoTime", "2.3"),
        ("FlipAngle", "10"),
    ];
    let image_types = [
        "ORIGINAL\\PRIMARY\\WATER",
        "ORIGINAL\\PRIMARY\\FAT",
        "ORIGINAL\\PRIMARY\\IN_PHASE",
        "ORIGINAL\\PRIMARY\\OUT_PHASE",
    ];
    let records: Vec<Record> = image_types
        .iter()
        .map(|image_type| {
            let mut r = record(base);
            r.insert("ImageType".to_string(), image_type.to_string());
            r
        })
        .collect();

    let cleaned = clean_mr_records(&records, &MrCleanConfig::default());
    assert_eq!(
        column(&cleaned, "sequenceClass"),
        vec![
            "T1_GRE_SPOILED_WATER",
            "T1_GRE_SPOILED_FAT",
            "T1_GRE_SPOILED_INPHASE",
            "T1_GRE_SPOILED_OUTPHASE"
        ]
    );
    // only the water reconstruction reads as fat suppressed
    assert_eq!(
        column(&cleaned, "isFatSuppressed"),
        vec!["True", "False", "False", "False"]
    );
}

/// A row with no recognizable tags keeps the UNKNOWN fallback, unsuffixed.
#[test]
fn unrecognizable_row_is_unknown() {
    let records = vec![record(&[
        ("StudyInstanceUID", "1.2.840.3.3"),
        ("Modality", "MR"),
    ])];
    let cleaned = clean_mr_records(&records, &MrCleanConfig::default());
    assert_eq!(cleaned[0]["sequenceClass"], "UNKNOWN");
    assert_eq!(cleaned[0]["dynamicPhase"], "");
}
