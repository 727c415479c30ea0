//! Atomic feature extraction for MR metadata rows.
//!
//! Every parse in here is hazard-free by construction: a malformed value
//! degrades to `None`/`UNKNOWN` and classification drops through to the
//! fallback path.

use crate::metadata_cache::Record;
use crate::mr_config::MrCleanConfig;
use crate::mr_rules::Family;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

pub(crate) const UNKNOWN: &str = "UNKNOWN";

/// One MR row with its parsed inputs and derived feature columns.
#[derive(Debug, Clone)]
pub(crate) struct MrRow {
    pub record_index: usize,

    // null-safe lowercased inputs
    pub protocol_lower: String,
    pub image_type_lower: String,
    pub series_description_lower: String,
    pub scanning_sequence_lower: String,
    pub sequence_variant_lower: String,
    pub scan_options_lower: String,

    pub study_uid: String,
    pub series_time: Option<f64>,
    pub tr: Option<f64>,
    pub te: Option<f64>,
    pub ti: Option<f64>,
    pub flip_angle: Option<f64>,
    pub b_value: Option<f64>,
    pub echo_train_length: Option<f64>,
    pub echo_number: Option<i64>,
    pub iop: Option<Vec<f64>>,
    pub ipp: Option<Vec<f64>>,
    pub slice_thickness: Option<f64>,
    pub contrast_agent: String,

    // derived columns
    pub standard_orientation: String,
    pub standard_dimension: String,
    pub is_fat_suppressed: bool,
    pub is_contrast_enhanced: bool,
    pub has_motion_correction: bool,
    pub refined_image_type: String,
    pub standard_field_strength: String,
    pub standard_manufacturer: String,
    pub cleaned_model: String,

    // filled by the classification stages
    pub sequence_family: Option<Family>,
    pub sequence_class: String,
    pub dynamic_group: Option<u32>,
    pub dynamic_phase: String,
}

impl MrRow {
    pub(crate) fn from_record(record_index: usize, record: &Record, config: &MrCleanConfig) -> Self {
        let lower = |key: &str| {
            record
                .get(key)
                .map(|v| v.to_lowercase())
                .unwrap_or_default()
        };
        let protocol_lower = lower("ProtocolName");
        let image_type_lower = lower("ImageType");
        let scanning_sequence_lower = lower("ScanningSequence");
        let scan_options_lower = lower("ScanOptions");

        let ti = parse_float(record.get("InversionTime"));
        let iop = parse_float_list(record.get("ImageOrientationPatient"));
        let field_strength = parse_float(record.get("MagneticFieldStrength"));

        let standard_orientation = standard_orientation(&iop, &protocol_lower, config);
        let is_fat_suppressed = is_fat_suppressed(
            &scanning_sequence_lower,
            ti,
            &image_type_lower,
            &scan_options_lower,
            &protocol_lower,
            config,
        );
        let contrast_re = cached_regex(&config.atomic_features.contrast_protocol_regex);
        let motion_re = cached_regex(&config.atomic_features.motion_correction_protocol_regex);

        Self {
            record_index,
            image_type_lower: image_type_lower.clone(),
            series_description_lower: lower("SeriesDescription"),
            sequence_variant_lower: lower("SequenceVariant"),
            scan_options_lower,
            study_uid: record.get("StudyInstanceUID").cloned().unwrap_or_default(),
            series_time: parse_time(record.get("SeriesTime")),
            tr: parse_float(record.get("RepetitionTime")),
            te: parse_float(record.get("EchoTime")),
            ti,
            flip_angle: parse_float(record.get("FlipAngle")),
            b_value: parse_float(record.get("DiffusionBValue")),
            echo_train_length: parse_float(record.get("EchoTrainLength")),
            echo_number: parse_float(record.get("EchoNumbers")).map(|x| x as i64),
            iop,
            ipp: parse_float_list(record.get("ImagePositionPatient")),
            slice_thickness: parse_float(record.get("SliceThickness")),
            contrast_agent: record
                .get("ContrastBolusAgent")
                .cloned()
                .unwrap_or_default()
                .trim()
                .to_string(),
            standard_orientation,
            standard_dimension: standard_dimension(record.get("MRAcquisitionType")),
            is_fat_suppressed,
            is_contrast_enhanced: contrast_re
                .as_ref()
                .is_some_and(|re| re.is_match(&protocol_lower)),
            has_motion_correction: motion_re
                .as_ref()
                .is_some_and(|re| re.is_match(&protocol_lower)),
            refined_image_type: refined_image_type(&image_type_lower, &protocol_lower),
            standard_field_strength: standard_field_strength(field_strength),
            standard_manufacturer: standard_manufacturer(record.get("Manufacturer")),
            cleaned_model: cleaned_model(record.get("ManufacturerModelName")),
            protocol_lower,
            scanning_sequence_lower,
            sequence_family: None,
            sequence_class: UNKNOWN.to_string(),
            dynamic_group: None,
            dynamic_phase: String::new(),
        }
    }
}

/// `AX`/`SAG`/`COR`/`OBL` from the slice normal; protocol-name keywords when
/// the orientation does not parse; `UNKNOWN` otherwise.
fn standard_orientation(
    iop: &Option<Vec<f64>>,
    protocol_lower: &str,
    config: &MrCleanConfig,
) -> String {
    if let Some(iop) = iop.as_deref().filter(|v| v.len() >= 6) {
        // unit-normalize row and col so the normal of an orthonormal pair has
        // norm 1; non-orthogonal or tilted geometries then fail the dominance
        // test below and read as oblique
        let row = normalize3([iop[0], iop[1], iop[2]]);
        let col = normalize3([iop[3], iop[4], iop[5]]);
        if let (Some(row), Some(col)) = (row, col) {
            let normal = crate::orientation::cross(row, col);
            let (axis, max_abs) = normal
                .iter()
                .map(|x| x.abs())
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .expect("normal has three components");
            if max_abs * max_abs < config.orientation.oblique_dominance_ratio {
                return "OBL".to_string();
            }
            return match axis {
                0 => "SAG",
                1 => "COR",
                _ => "AX",
            }
            .to_string();
        }
    }
    for (label, keywords) in &config.orientation.fallback_keywords {
        if keywords.iter().any(|k| protocol_lower.contains(k)) {
            return label.clone();
        }
    }
    UNKNOWN.to_string()
}

fn normalize3(v: [f64; 3]) -> Option<[f64; 3]> {
    let norm = crate::orientation::norm3(v);
    (norm > 1e-9).then(|| [v[0] / norm, v[1] / norm, v[2] / norm])
}

fn standard_dimension(acquisition_type: Option<&String>) -> String {
    match acquisition_type.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(value) => value.to_uppercase(),
        None => UNKNOWN.to_string(),
    }
}

/// Priority OR over the four fat-suppression signals.
fn is_fat_suppressed(
    scanning_sequence_lower: &str,
    ti: Option<f64>,
    image_type_lower: &str,
    scan_options_lower: &str,
    protocol_lower: &str,
    config: &MrCleanConfig,
) -> bool {
    let fat = &config.fat_suppression;
    // (i) STIR: inversion recovery with a short TI
    if scanning_sequence_lower.contains(&fat.ir_token) {
        if let Some(ti) = ti {
            if ti >= fat.stir_ti_min && ti <= fat.stir_ti_max {
                return true;
            }
        }
    }
    // (ii) Dixon water reconstruction
    let image_tokens = tokenize(image_type_lower);
    if fat
        .dixon_water_tokens
        .iter()
        .any(|t| image_tokens.iter().any(|token| token == t))
    {
        return true;
    }
    // (iii) explicit FS scan option
    if tokenize(scan_options_lower)
        .iter()
        .any(|token| token == &fat.scan_options_fs_token)
    {
        return true;
    }
    // (iv) protocol naming
    fat.protocol_keywords
        .iter()
        .any(|k| protocol_lower.contains(k))
}

fn refined_image_type(image_type_lower: &str, protocol_lower: &str) -> String {
    if image_type_lower.contains("derived") || image_type_lower.contains("secondary") {
        return "DERIVED".to_string();
    }
    if image_type_lower.contains("localizer")
        || protocol_lower.contains("localizer")
        || protocol_lower.contains("survey")
        || protocol_lower.contains("scout")
    {
        return "LOCALIZER".to_string();
    }
    if image_type_lower.contains("original") && image_type_lower.contains("primary") {
        return "ORIGINAL".to_string();
    }
    "OTHER".to_string()
}

/// Bucket by bin edges (−∞, 1.0, 2.0, 4.0, ∞).
fn standard_field_strength(tesla: Option<f64>) -> String {
    match tesla {
        None => UNKNOWN.to_string(),
        Some(t) if t <= 1.0 => "Low-Field".to_string(),
        Some(t) if t <= 2.0 => "1.5T".to_string(),
        Some(t) if t <= 4.0 => "3.0T".to_string(),
        Some(_) => "High-Field".to_string(),
    }
}

fn standard_manufacturer(manufacturer: Option<&String>) -> String {
    let lower = manufacturer.map(|s| s.to_lowercase()).unwrap_or_default();
    const RULES: &[(&[&str], &str)] = &[
        (&["siemens"], "Siemens"),
        (&["philips"], "Philips"),
        (&["ge medical", "ge healthcare"], "GE"),
        (&["uih", "united imaging"], "UIH"),
        (&["anke"], "Anke"),
        (&["canon"], "Canon"),
        (&["fujifilm"], "Fujifilm"),
        (&["hitachi"], "Hitachi"),
        (&["mindray"], "Mindray"),
        (&["shimadzu"], "Shimadzu"),
    ];
    for (needles, label) in RULES {
        if needles.iter().any(|needle| lower.contains(needle)) {
            return label.to_string();
        }
    }
    "Other".to_string()
}

fn cleaned_model(model: Option<&String>) -> String {
    model
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

/// Split a flattened multi-value string (backslash, comma, or bracketed
/// forms) into bare lowercase tokens.
pub(crate) fn tokenize(value: &str) -> Vec<String> {
    value
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '*'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

pub(crate) fn parse_float(value: Option<&String>) -> Option<f64> {
    value?.trim().parse::<f64>().ok()
}

/// Parse `[1, 0, 0]`, `1\0\0`, or `1, 0, 0` forms into floats.
pub(crate) fn parse_float_list(value: Option<&String>) -> Option<Vec<f64>> {
    let trimmed = value?.trim().trim_matches(['[', ']', '(', ')']);
    if trimmed.is_empty() {
        return None;
    }
    let parts: Vec<f64> = trimmed
        .split(['\\', ','])
        .map(|p| p.trim().trim_matches(['\'', '"']).parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    (!parts.is_empty()).then_some(parts)
}

/// `HHMMSS(.frac)` series times parse to a sortable number; colons tolerated.
pub(crate) fn parse_time(value: Option<&String>) -> Option<f64> {
    let cleaned: String = value?.chars().filter(|c| *c != ':').collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Case-insensitive regex compiled once per distinct pattern; the classifier
/// runs row by row and must not recompile per row.
fn cached_regex(pattern: &str) -> Option<Regex> {
    static CACHE: LazyLock<Mutex<HashMap<String, Option<Regex>>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));
    let mut cache = CACHE.lock().unwrap();
    cache
        .entry(pattern.to_string())
        .or_insert_with(|| match Regex::new(&format!("(?i){pattern}")) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern, "invalid classifier regex: {e}");
                None
            }
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn row_with(entries: &[(&str, &str)]) -> MrRow {
        let record: Record = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MrRow::from_record(0, &record, &MrCleanConfig::default())
    }

    #[rstest]
    #[case("[1, 0, 0, 0, 1, 0]", "AX")]
    #[case("[0, 1, 0, 0, 0, -1]", "SAG")]
    #[case("[1, 0, 0, 0, 0, -1]", "COR")]
    #[case("[1, 0, 0, 0.5, 0.5, 0]", "OBL")]
    fn classifies_orientation(#[case] iop: &str, #[case] expected: &str) {
        let row = row_with(&[("ImageOrientationPatient", iop)]);
        assert_eq!(row.standard_orientation, expected);
    }

    #[test]
    fn orientation_falls_back_to_protocol_keywords() {
        let row = row_with(&[("ProtocolName", "t2_tse_sag")]);
        assert_eq!(row.standard_orientation, "SAG");
        let row = row_with(&[("ProtocolName", "mystery")]);
        assert_eq!(row.standard_orientation, UNKNOWN);
    }

    #[test]
    fn backslash_lists_parse_like_bracketed_ones() {
        assert_eq!(
            parse_float_list(Some(&"1\\0\\0".to_string())),
            Some(vec![1.0, 0.0, 0.0])
        );
        assert_eq!(
            parse_float_list(Some(&"[0.5, 0.5]".to_string())),
            Some(vec![0.5, 0.5])
        );
        assert_eq!(parse_float_list(Some(&"n/a".to_string())), None);
    }

    #[test]
    fn stir_inversion_time_is_fat_suppressed() {
        let row = row_with(&[("ScanningSequence", "IR\\SE"), ("InversionTime", "160")]);
        assert!(row.is_fat_suppressed);
        let row = row_with(&[("ScanningSequence", "IR\\SE"), ("InversionTime", "2500")]);
        assert!(!row.is_fat_suppressed);
    }

    #[test]
    fn dixon_water_image_type_is_fat_suppressed() {
        let row = row_with(&[("ImageType", "ORIGINAL\\PRIMARY\\W\\NORM")]);
        assert!(row.is_fat_suppressed);
    }

    #[test]
    fn field_strength_buckets() {
        assert_eq!(standard_field_strength(Some(0.35)), "Low-Field");
        assert_eq!(standard_field_strength(Some(1.5)), "1.5T");
        assert_eq!(standard_field_strength(Some(3.0)), "3.0T");
        assert_eq!(standard_field_strength(Some(7.0)), "High-Field");
        assert_eq!(standard_field_strength(None), UNKNOWN);
    }

    #[test]
    fn manufacturer_mapping_is_first_match() {
        let value = "GE MEDICAL SYSTEMS".to_string();
        assert_eq!(standard_manufacturer(Some(&value)), "GE");
        let value = "Unknown Vendor Co".to_string();
        assert_eq!(standard_manufacturer(Some(&value)), "Other");
    }

    #[test]
    fn contrast_and_motion_flags_from_protocol() {
        let row = row_with(&[("ProtocolName", "t1_tse_tra_+c")]);
        assert!(row.is_contrast_enhanced);
        let row = row_with(&[("ProtocolName", "t2_propeller_tra")]);
        assert!(row.has_motion_correction);
    }
}
