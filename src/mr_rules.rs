//! The MR classification rule hierarchy.
//!
//! Rules are an ordered list of pure functions over one row; the first label
//! wins. Rule A handles name/type special cases, rule B the pulse physics,
//! rule C the name-based fallback. Suffix post-processing runs after a
//! non-UNKNOWN label.

use crate::mr_config::{MrCleanConfig, Thresholds};
use crate::mr_features::{MrRow, UNKNOWN, tokenize};

/// Pulse-sequence family derived from ScanningSequence/SequenceVariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    GreSteadyState,
    GreSpoiled,
    Gre,
    SeSingleShot,
    Tse,
    Se,
}

impl Family {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Family::GreSteadyState => "GRE_STEADY_STATE",
            Family::GreSpoiled => "GRE_SPOILED",
            Family::Gre => "GRE",
            Family::SeSingleShot => "SE_SingleShot",
            Family::Tse => "TSE",
            Family::Se => "SE",
        }
    }
}

type Rule = fn(&MrRow, &MrCleanConfig, &Thresholds) -> Option<String>;

const RULES: &[Rule] = &[rule_name_special, rule_physics, rule_name_fallback];

/// Derive the family, then run the rule hierarchy and suffix pass, writing
/// `sequence_family` and `sequence_class` back onto the row.
pub(crate) fn classify_row(row: &mut MrRow, config: &MrCleanConfig) {
    row.sequence_family = derive_family(row, config);
    let thresholds = config.thresholds.for_bucket(&row.standard_field_strength);
    let label = RULES
        .iter()
        .find_map(|rule| rule(row, config, &thresholds))
        .unwrap_or_else(|| UNKNOWN.to_string());
    row.sequence_class = append_suffixes(label, row, config);
}

/// Rule A: protocol-name and series-description special cases, in configured
/// order.
fn rule_name_special(row: &MrRow, config: &MrCleanConfig, _: &Thresholds) -> Option<String> {
    for label in &config.classification.rule_a_order {
        let Some(spec) = config.classification.rule_a.get(label) else {
            continue;
        };
        let protocol_hit = spec
            .protocol_keywords
            .iter()
            .any(|k| row.protocol_lower.contains(k));
        let description_hit = spec
            .series_description_keywords
            .iter()
            .any(|k| row.series_description_lower.contains(k));
        let refined_hit = spec
            .refined_image_type
            .as_deref()
            .is_some_and(|t| row.refined_image_type == t);
        if protocol_hit || description_hit || refined_hit {
            return Some(label.clone());
        }
    }
    None
}

/// Rule B: diffusion, fMRI, inversion recovery, then family + TR/TE timing.
fn rule_physics(row: &MrRow, config: &MrCleanConfig, thresholds: &Thresholds) -> Option<String> {
    let classification = &config.classification;
    if row
        .b_value
        .is_some_and(|b| b > classification.dwi_b_value_min)
    {
        return Some(if row.protocol_lower.contains("dti") {
            "DTI".to_string()
        } else {
            "DWI".to_string()
        });
    }
    if row
        .scanning_sequence_lower
        .contains(&classification.fmri.scan_seq_token)
        && classification
            .fmri
            .protocol_keywords
            .iter()
            .any(|k| row.protocol_lower.contains(k))
    {
        return Some(classification.fmri.class.clone());
    }
    if let Some(ti) = row.ti {
        if ti >= thresholds.flair_ti_min {
            return Some("T2_FLAIR".to_string());
        }
        if ti >= config.fat_suppression.stir_ti_min && ti <= thresholds.stir_ti_max {
            return Some("T2_STIR".to_string());
        }
    }

    let family = row.sequence_family?;
    if family == Family::SeSingleShot {
        return Some("T2_SE_SingleShot".to_string());
    }
    if row.te.is_some_and(|te| te > thresholds.t2_te_min) {
        return Some(format!("T2_{}", family.label()));
    }
    if row.tr.is_some_and(|tr| tr < thresholds.t1_tr_max)
        && row.te.is_some_and(|te| te < thresholds.t1_te_max)
    {
        return Some(format!("T1_{}", family.label()));
    }
    if row.tr.is_some_and(|tr| tr > thresholds.t2_tr_min)
        && row.te.is_some_and(|te| te < thresholds.pd_te_max)
        && row.protocol_lower.contains("pd")
    {
        return Some(format!("PD_{}", family.label()));
    }
    None
}

/// Rule C: name-based fallback; the branches are independent, first match
/// wins.
fn rule_name_fallback(row: &MrRow, config: &MrCleanConfig, _: &Thresholds) -> Option<String> {
    let fallback = &config.classification.fallback;
    let p = &row.protocol_lower;
    let family_label = row.sequence_family.map(Family::label);

    if fallback.tse_dark_fluid_to_flair && p.contains("tse_dark_fluid") {
        return Some("T2_FLAIR".to_string());
    }
    if p.contains("t2") {
        return Some(match family_label {
            Some(family) => format!("T2_{family}"),
            None if fallback.tse_tokens.iter().any(|t| p.contains(t)) => "T2_TSE".to_string(),
            None if p.contains(&fallback.se_token) => "T2_SE".to_string(),
            None => "T2_NAME_BASED".to_string(),
        });
    }
    if p.contains("t1") {
        let mpr_iso = fallback.mpr_iso_tokens.iter().all(|t| p.contains(t));
        let dimension_ok = !fallback.requires_dimension_for_flash3d || row.standard_dimension == "3D";
        if mpr_iso && dimension_ok {
            return Some("T1_GRE_FLASH3D".to_string());
        }
        return Some(match family_label {
            Some(family) => format!("T1_{family}"),
            None if fallback.tse_tokens.iter().any(|t| p.contains(t)) => "T1_TSE".to_string(),
            None if p.contains(&fallback.se_token) => "T1_SE".to_string(),
            None => "T1_NAME_BASED".to_string(),
        });
    }
    if p.contains("pd") {
        return Some(match family_label {
            Some(family) => format!("PD_{family}"),
            None => "PD_NAME_BASED".to_string(),
        });
    }
    if p.contains("flair") {
        return Some("T2_FLAIR".to_string());
    }
    if p.contains("stir") {
        return Some("T2_STIR".to_string());
    }
    if p.contains("dwi") || p.contains("diff") {
        return Some("DWI".to_string());
    }
    None
}

fn derive_family(row: &MrRow, config: &MrCleanConfig) -> Option<Family> {
    let family = &config.classification.sequence_family;
    let sequence_tokens = tokenize(&row.scanning_sequence_lower);
    if sequence_tokens.iter().any(|t| t == &family.gre_token) {
        let variant_tokens = tokenize(&row.sequence_variant_lower);
        if variant_tokens
            .iter()
            .any(|t| t == &family.steady_state_seq_variant_token)
        {
            return Some(Family::GreSteadyState);
        }
        if variant_tokens
            .iter()
            .any(|t| t == &family.spoiled_seq_variant_token)
        {
            return Some(Family::GreSpoiled);
        }
        return Some(Family::Gre);
    }
    if sequence_tokens.iter().any(|t| t == &family.se_token) {
        let single_shot = family
            .single_shot_protocol_keywords
            .iter()
            .any(|k| row.protocol_lower.contains(k))
            || row
                .echo_train_length
                .is_some_and(|etl| etl > family.single_shot_etl_min);
        if single_shot {
            return Some(Family::SeSingleShot);
        }
        if row.echo_train_length.is_some_and(|etl| etl > 1.0) {
            return Some(Family::Tse);
        }
        return Some(Family::Se);
    }
    None
}

/// Append at most one Dixon/echo subtype suffix, then the motion-correction
/// suffix.
fn append_suffixes(label: String, row: &MrRow, config: &MrCleanConfig) -> String {
    if label == UNKNOWN {
        return label;
    }
    let mut label = label;
    let suffix_config = &config.subtype_suffix;
    let image_tokens = tokenize(&row.image_type_lower);
    let has_token =
        |tokens: &[String]| tokens.iter().any(|t| image_tokens.iter().any(|i| i == t));

    if has_token(&suffix_config.water_tokens) {
        label.push_str("_WATER");
    } else if has_token(&suffix_config.fat_tokens) {
        label.push_str("_FAT");
    } else if has_token(&suffix_config.inphase_tokens) {
        label.push_str("_INPHASE");
    } else if has_token(&suffix_config.outphase_tokens) {
        label.push_str("_OUTPHASE");
    } else if row
        .protocol_lower
        .contains(&suffix_config.t2_star_echo_marker)
    {
        if let Some(echo) = echo_number(row, &suffix_config.t2_star_echo_split_token) {
            label.push_str(&format!("_ECHO{echo}"));
        }
    }

    let motion = &config.classification.motion_correction;
    if row.has_motion_correction
        || motion
            .protocol_keywords
            .iter()
            .any(|k| row.protocol_lower.contains(k))
    {
        label.push_str(&motion.suffix);
    }
    label
}

/// Echo index for multi-echo T2* labels: EchoNumbers when present, else the
/// number after the split token in the protocol name.
fn echo_number(row: &MrRow, split_token: &str) -> Option<i64> {
    if let Some(echo) = row.echo_number {
        return Some(echo);
    }
    let (_, tail) = row.protocol_lower.rsplit_once(split_token)?;
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_cache::Record;

    fn classified(entries: &[(&str, &str)]) -> MrRow {
        let record: Record = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = MrCleanConfig::default();
        let mut row = MrRow::from_record(0, &record, &config);
        classify_row(&mut row, &config);
        row
    }

    #[test]
    fn localizer_name_beats_diffusion_physics() {
        let row = classified(&[
            ("ProtocolName", "localizer head"),
            ("DiffusionBValue", "800"),
        ]);
        assert_eq!(row.sequence_class, "LOCALIZER");
    }

    #[test]
    fn high_b_value_is_dwi_or_dti() {
        let row = classified(&[("ProtocolName", "ep2d_diff_tra"), ("DiffusionBValue", "800")]);
        assert_eq!(row.sequence_class, "DWI");
        let row = classified(&[("ProtocolName", "dti_64dir"), ("DiffusionBValue", "1000")]);
        assert_eq!(row.sequence_class, "DTI");
    }

    #[test]
    fn long_inversion_time_is_flair() {
        let row = classified(&[("ScanningSequence", "IR\\SE"), ("InversionTime", "2500")]);
        assert_eq!(row.sequence_class, "T2_FLAIR");
    }

    #[test]
    fn short_inversion_time_is_stir() {
        let row = classified(&[("ScanningSequence", "IR\\SE"), ("InversionTime", "160")]);
        assert_eq!(row.sequence_class, "T2_STIR");
    }

    #[test]
    fn timing_classifies_t2_tse() {
        let row = classified(&[
            ("ProtocolName", "brain routine"),
            ("ScanningSequence", "SE"),
            ("EchoTrainLength", "16"),
            ("RepetitionTime", "5000"),
            ("EchoTime", "110"),
        ]);
        assert_eq!(row.sequence_class, "T2_TSE");
    }

    #[test]
    fn timing_classifies_t1_gre_spoiled() {
        let row = classified(&[
            ("ScanningSequence", "GR"),
            ("SequenceVariant", "SP\\OSP"),
            ("RepetitionTime", "6.5"),
            ("EchoTime", "2.3"),
            ("FlipAngle", "10"),
        ]);
        assert_eq!(row.sequence_class, "T1_GRE_SPOILED");
    }

    #[test]
    fn single_shot_se_wins_over_timing() {
        let row = classified(&[
            ("ProtocolName", "haste_cor"),
            ("ScanningSequence", "SE"),
            ("RepetitionTime", "1000"),
            ("EchoTime", "90"),
        ]);
        assert_eq!(row.sequence_class, "T2_SE_SingleShot");
    }

    #[test]
    fn fmri_needs_epi_and_naming() {
        let row = classified(&[("ProtocolName", "bold rest"), ("ScanningSequence", "EP\\GR")]);
        assert_eq!(row.sequence_class, "fMRI_BOLD");
    }

    #[test]
    fn name_fallback_covers_t1_and_flair() {
        let row = classified(&[("ProtocolName", "t1_mpr_iso"), ("MRAcquisitionType", "3D")]);
        assert_eq!(row.sequence_class, "T1_GRE_FLASH3D");
        let row = classified(&[("ProtocolName", "tse_dark_fluid_tra")]);
        assert_eq!(row.sequence_class, "T2_FLAIR");
        let row = classified(&[("ProtocolName", "t1_tse_sag")]);
        assert_eq!(row.sequence_class, "T1_TSE");
    }

    #[test]
    fn unrecognizable_rows_stay_unknown_without_suffix() {
        let row = classified(&[("SeriesDescription", "mystery")]);
        assert_eq!(row.sequence_class, UNKNOWN);
    }

    #[test]
    fn dixon_reconstructions_get_one_subtype_suffix() {
        let base = [
            ("ScanningSequence", "GR"),
            ("SequenceVariant", "SP"),
            ("RepetitionTime", "6.5"),
            ("EchoTime", "2.3"),
        ];
        for (image_type, expected) in [
            ("ORIGINAL\\PRIMARY\\W", "T1_GRE_SPOILED_WATER"),
            ("ORIGINAL\\PRIMARY\\F", "T1_GRE_SPOILED_FAT"),
            ("ORIGINAL\\PRIMARY\\IN_PHASE", "T1_GRE_SPOILED_INPHASE"),
            ("ORIGINAL\\PRIMARY\\OPP", "T1_GRE_SPOILED_OUTPHASE"),
        ] {
            let mut entries = base.to_vec();
            entries.push(("ImageType", image_type));
            let row = classified(&entries);
            assert_eq!(row.sequence_class, expected, "for {image_type}");
        }
    }

    #[test]
    fn motion_corrected_series_get_mc_suffix() {
        let row = classified(&[
            ("ProtocolName", "t2_blade_tra"),
            ("ScanningSequence", "SE"),
            ("EchoTrainLength", "24"),
            ("RepetitionTime", "4000"),
            ("EchoTime", "100"),
        ]);
        assert_eq!(row.sequence_class, "T2_TSE_MC");
    }
}
