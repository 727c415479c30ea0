//! Rule configuration for the MR sequence classifier.
//!
//! Every keyword set, regex, and threshold is table-driven from one JSON
//! document; the compiled-in defaults cover deployments without a config
//! file. Thresholds are bucketed by field strength with a `default` bucket
//! for unknown magnets.

use camino::Utf8Path;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MrCleanConfig {
    pub orientation: OrientationConfig,
    pub fat_suppression: FatSuppressionConfig,
    pub atomic_features: AtomicFeaturesConfig,
    pub subtype_suffix: SubtypeSuffixConfig,
    pub classification: ClassificationConfig,
    pub thresholds: ThresholdsConfig,
    pub dynamic: DynamicConfig,
    pub propagate: PropagateConfig,
}

impl MrCleanConfig {
    /// Load from `path`, falling back to the defaults when the file is
    /// missing or unreadable.
    pub fn load(path: Option<&Utf8Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match fs_err::read(path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(anyhow::Error::from))
        {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = path.as_str(),
                    "could not load MR classifier config, using defaults: {e}"
                );
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrientationConfig {
    pub oblique_dominance_ratio: f64,
    /// Orientation label → protocol-name keywords, used when
    /// ImageOrientationPatient does not parse.
    pub fallback_keywords: BTreeMap<String, Vec<String>>,
}

impl Default for OrientationConfig {
    fn default() -> Self {
        let mut fallback_keywords = BTreeMap::new();
        fallback_keywords.insert("AX".to_string(), string_list(&["ax", "axi", "tra"]));
        fallback_keywords.insert("SAG".to_string(), string_list(&["sag"]));
        fallback_keywords.insert("COR".to_string(), string_list(&["cor"]));
        Self {
            oblique_dominance_ratio: 0.9,
            fallback_keywords,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FatSuppressionConfig {
    pub ir_token: String,
    pub stir_ti_min: f64,
    pub stir_ti_max: f64,
    pub dixon_water_tokens: Vec<String>,
    pub scan_options_fs_token: String,
    pub protocol_keywords: Vec<String>,
}

impl Default for FatSuppressionConfig {
    fn default() -> Self {
        Self {
            ir_token: "ir".to_string(),
            stir_ti_min: 100.0,
            stir_ti_max: 250.0,
            dixon_water_tokens: string_list(&["w", "water"]),
            scan_options_fs_token: "fs".to_string(),
            protocol_keywords: string_list(&["fs", "fatsat", "fat_sat", "spair", "spir", "stir"]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AtomicFeaturesConfig {
    pub contrast_protocol_regex: String,
    pub motion_correction_protocol_regex: String,
}

impl Default for AtomicFeaturesConfig {
    fn default() -> Self {
        Self {
            contrast_protocol_regex: r"\+c|post|gd|enh|contrast|增强|dyn".to_string(),
            motion_correction_protocol_regex: r"propeller|blade|radial|star".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubtypeSuffixConfig {
    pub water_tokens: Vec<String>,
    pub fat_tokens: Vec<String>,
    pub inphase_tokens: Vec<String>,
    pub outphase_tokens: Vec<String>,
    /// Protocol marker identifying multi-echo T2* acquisitions.
    pub t2_star_echo_marker: String,
    /// Token splitting the echo number off the protocol name.
    pub t2_star_echo_split_token: String,
}

impl Default for SubtypeSuffixConfig {
    fn default() -> Self {
        Self {
            water_tokens: string_list(&["w", "water"]),
            fat_tokens: string_list(&["f", "fat"]),
            inphase_tokens: string_list(&["ip", "in_phase", "inphase", "in-phase"]),
            outphase_tokens: string_list(&["op", "opp", "out_phase", "outphase", "out-phase"]),
            t2_star_echo_marker: "t2*".to_string(),
            t2_star_echo_split_token: "_e".to_string(),
        }
    }
}

/// One name/type special case of rule A. A rule fires when any protocol or
/// series-description keyword matches; when `refinedImageType` is set it
/// fires on that refined type as well.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RuleASpec {
    pub protocol_keywords: Vec<String>,
    pub series_description_keywords: Vec<String>,
    #[serde(rename = "refinedImageType")]
    pub refined_image_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    /// Evaluation order of rule A labels.
    #[serde(rename = "ruleA_order")]
    pub rule_a_order: Vec<String>,
    #[serde(rename = "ruleA")]
    pub rule_a: BTreeMap<String, RuleASpec>,
    pub dwi_b_value_min: f64,
    pub fmri: FmriConfig,
    pub sequence_family: SequenceFamilyConfig,
    pub motion_correction: MotionCorrectionConfig,
    pub fallback: FallbackConfig,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        let mut rule_a = BTreeMap::new();
        rule_a.insert(
            "LOCALIZER".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["localizer", "survey", "scout"]),
                refined_image_type: Some("LOCALIZER".to_string()),
                ..Default::default()
            },
        );
        rule_a.insert(
            "T1_MAP".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["t1 map", "t1map", "t1_map"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "T2_MAP".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["t2 map", "t2map", "t2_map"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "ADC".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["adc", "apparent diffusion"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "FA_MAP".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["fa map", "famap", "fa_map"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "SUBTRACTION".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["sub", "subtract"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "MRA".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["mra", "angio", "tof"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "SWI".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["swi", "swan"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "PWI".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["pwi", "perfusion", "asl"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "MRS".to_string(),
            RuleASpec {
                protocol_keywords: string_list(&["mrs", "spectro", "csi"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "BREATH MOVEMENT".to_string(),
            RuleASpec {
                series_description_keywords: string_list(&["resp"]),
                ..Default::default()
            },
        );
        rule_a.insert(
            "MIP".to_string(),
            RuleASpec {
                series_description_keywords: string_list(&["mip"]),
                ..Default::default()
            },
        );
        Self {
            rule_a_order: string_list(&[
                "LOCALIZER",
                "T1_MAP",
                "T2_MAP",
                "ADC",
                "FA_MAP",
                "SUBTRACTION",
                "MRA",
                "SWI",
                "PWI",
                "MRS",
                "BREATH MOVEMENT",
                "MIP",
            ]),
            rule_a,
            dwi_b_value_min: 50.0,
            fmri: FmriConfig::default(),
            sequence_family: SequenceFamilyConfig::default(),
            motion_correction: MotionCorrectionConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FmriConfig {
    pub scan_seq_token: String,
    pub protocol_keywords: Vec<String>,
    pub class: String,
}

impl Default for FmriConfig {
    fn default() -> Self {
        Self {
            scan_seq_token: "ep".to_string(),
            protocol_keywords: string_list(&["fmri", "bold"]),
            class: "fMRI_BOLD".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequenceFamilyConfig {
    pub gre_token: String,
    pub se_token: String,
    pub steady_state_seq_variant_token: String,
    pub spoiled_seq_variant_token: String,
    pub single_shot_protocol_keywords: Vec<String>,
    pub single_shot_etl_min: f64,
}

impl Default for SequenceFamilyConfig {
    fn default() -> Self {
        Self {
            gre_token: "gr".to_string(),
            se_token: "se".to_string(),
            steady_state_seq_variant_token: "ss".to_string(),
            spoiled_seq_variant_token: "sp".to_string(),
            single_shot_protocol_keywords: string_list(&["haste", "ssfse", "ssh"]),
            single_shot_etl_min: 128.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionCorrectionConfig {
    pub protocol_keywords: Vec<String>,
    pub suffix: String,
}

impl Default for MotionCorrectionConfig {
    fn default() -> Self {
        Self {
            protocol_keywords: string_list(&["propeller", "blade", "radial", "star"]),
            suffix: "_MC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub tse_tokens: Vec<String>,
    pub se_token: String,
    pub tse_dark_fluid_to_flair: bool,
    pub mpr_iso_tokens: Vec<String>,
    pub requires_dimension_for_flash3d: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            tse_tokens: string_list(&["tse", "fse"]),
            se_token: "se".to_string(),
            tse_dark_fluid_to_flair: true,
            mpr_iso_tokens: string_list(&["mpr", "iso"]),
            requires_dimension_for_flash3d: true,
        }
    }
}

/// TR/TE/TI decision thresholds in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub flair_ti_min: f64,
    pub stir_ti_max: f64,
    pub t2_te_min: f64,
    pub t2_tr_min: f64,
    pub t1_tr_max: f64,
    pub t1_te_max: f64,
    pub pd_te_max: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            flair_ti_min: 1500.0,
            stir_ti_max: 250.0,
            t2_te_min: 80.0,
            t2_tr_min: 2000.0,
            t1_tr_max: 800.0,
            t1_te_max: 30.0,
            pd_te_max: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub field_strength: BTreeMap<String, Thresholds>,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        let mut field_strength = BTreeMap::new();
        field_strength.insert("default".to_string(), Thresholds::default());
        // low-field magnets run shorter inversion times
        field_strength.insert(
            "Low-Field".to_string(),
            Thresholds {
                flair_ti_min: 1200.0,
                ..Thresholds::default()
            },
        );
        field_strength.insert("1.5T".to_string(), Thresholds::default());
        field_strength.insert(
            "3.0T".to_string(),
            Thresholds {
                flair_ti_min: 1800.0,
                ..Thresholds::default()
            },
        );
        field_strength.insert(
            "High-Field".to_string(),
            Thresholds {
                flair_ti_min: 1800.0,
                ..Thresholds::default()
            },
        );
        Self { field_strength }
    }
}

impl ThresholdsConfig {
    /// Thresholds for one field-strength bucket, falling back to `default`.
    pub fn for_bucket(&self, bucket: &str) -> Thresholds {
        self.field_strength
            .get(bucket)
            .or_else(|| self.field_strength.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamicConfig {
    pub exclude_sequence_classes: Vec<String>,
    pub fingerprint_cols: Vec<String>,
    pub spatial_cols: Vec<String>,
    pub numeric_cols: Vec<String>,
    pub list_round_decimals: u32,
    pub numeric_round_decimals: u32,
    pub contrast_protocol_regex: String,
    pub contrast_agent_exclude_regex: String,
    pub exclude_sequence_regex: String,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            exclude_sequence_classes: string_list(&[
                "DWI", "DTI", "ADC", "FA", "MRS", "PWI", "ASL", "LOCALIZER",
            ]),
            fingerprint_cols: string_list(&[
                "ImagePositionPatient",
                "ImageOrientationPatient",
                "sequenceClass",
                "SliceThickness",
                "RepetitionTime",
                "EchoTime",
                "FlipAngle",
            ]),
            spatial_cols: string_list(&["ImagePositionPatient", "ImageOrientationPatient"]),
            numeric_cols: string_list(&[
                "SliceThickness",
                "RepetitionTime",
                "EchoTime",
                "FlipAngle",
            ]),
            list_round_decimals: 2,
            numeric_round_decimals: 2,
            contrast_protocol_regex: r"\+c|post|gd|enh|contrast|增强|dyn".to_string(),
            contrast_agent_exclude_regex: "no".to_string(),
            exclude_sequence_regex: "DWI|T2|LOCALIZER".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PropagateConfig {
    pub t1_contains: String,
    pub propagated_phase: String,
}

impl Default for PropagateConfig {
    fn default() -> Self {
        Self {
            t1_contains: "T1".to_string(),
            propagated_phase: "POST_PROPAGATED".to_string(),
        }
    }
}

fn string_list(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_rule_a_label() {
        let config = MrCleanConfig::default();
        for label in &config.classification.rule_a_order {
            assert!(
                config.classification.rule_a.contains_key(label),
                "no spec for {label}"
            );
        }
    }

    #[test]
    fn partial_config_overrides_one_section_only() {
        let json = r#"{"classification": {"dwi_b_value_min": 100.0}}"#;
        let config: MrCleanConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.classification.dwi_b_value_min, 100.0);
        assert_eq!(config.fat_suppression.stir_ti_max, 250.0);
        assert!(!config.classification.rule_a_order.is_empty());
    }

    #[test]
    fn unknown_bucket_falls_back_to_default_thresholds() {
        let thresholds = ThresholdsConfig::default();
        assert_eq!(thresholds.for_bucket("UNKNOWN").flair_ti_min, 1500.0);
    }
}
