//! Dynamic-group inference and contrast-enhancement propagation.

use crate::mr_config::{DynamicConfig, MrCleanConfig};
use crate::mr_features::MrRow;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

/// Group repeated acquisitions at identical geometry within each study and
/// assign `PRE`/`POST_n` phases by series time, then recompute the
/// authoritative contrast flag.
pub(crate) fn infer_dynamic_groups(rows: &mut [MrRow], config: &MrCleanConfig) {
    let dynamic = &config.dynamic;
    let contrast_re = compile(&dynamic.contrast_protocol_regex);
    let agent_exclude_re = compile(&dynamic.contrast_agent_exclude_regex);
    let sequence_exclude_re = compile(&dynamic.exclude_sequence_regex);

    let mut studies: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, row) in rows.iter().enumerate() {
        if row.study_uid.is_empty() {
            continue;
        }
        let excluded = dynamic
            .exclude_sequence_classes
            .iter()
            .any(|class| row.sequence_class.starts_with(class.as_str()));
        if !excluded {
            studies.entry(row.study_uid.clone()).or_default().push(i);
        }
    }

    let mut next_group = 1u32;
    for (study_uid, indices) in studies {
        let mut fingerprints: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for &i in &indices {
            fingerprints
                .entry(fingerprint(&rows[i], dynamic))
                .or_default()
                .push(i);
        }
        for members in fingerprints.into_values() {
            // a repeated fingerprint within one study is a dynamic run
            if members.len() < 2 {
                continue;
            }
            let group = next_group;
            next_group += 1;
            for &i in &members {
                rows[i].dynamic_group = Some(group);
            }
            if members.iter().any(|&i| rows[i].series_time.is_none()) {
                tracing::warn!(
                    StudyInstanceUID = study_uid,
                    group,
                    "dynamic group lacks SeriesTime, phases not assigned"
                );
                continue;
            }
            let mut ordered = members;
            ordered.sort_by(|&a, &b| {
                rows[a]
                    .series_time
                    .partial_cmp(&rows[b].series_time)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for (phase_index, &i) in ordered.iter().enumerate() {
                rows[i].dynamic_phase = if phase_index == 0 {
                    "PRE".to_string()
                } else {
                    format!("POST_{phase_index}")
                };
            }
        }
    }

    // authoritative contrast definition, group-aware
    for row in rows.iter_mut() {
        let post_phase = row.dynamic_phase.starts_with("POST");
        let protocol_hit = contrast_re
            .as_ref()
            .is_some_and(|re| re.is_match(&row.protocol_lower));
        let agent_ok = !row.contrast_agent.is_empty()
            && !agent_exclude_re
                .as_ref()
                .is_some_and(|re| re.is_match(&row.contrast_agent));
        let class_ok = !sequence_exclude_re
            .as_ref()
            .is_some_and(|re| re.is_match(&row.sequence_class));
        row.is_contrast_enhanced = (post_phase || protocol_hit) && agent_ok && class_ok;
    }
}

/// Late ungrouped T1 series acquired after the last known enhanced series
/// inherit enhancement.
pub(crate) fn propagate_enhancement(rows: &mut [MrRow], config: &MrCleanConfig) {
    let mut latest_by_study: HashMap<String, f64> = HashMap::new();
    for row in rows.iter() {
        if row.is_contrast_enhanced {
            if let Some(t) = row.series_time {
                latest_by_study
                    .entry(row.study_uid.clone())
                    .and_modify(|latest| *latest = latest.max(t))
                    .or_insert(t);
            }
        }
    }
    for row in rows.iter_mut() {
        let Some(&latest) = latest_by_study.get(&row.study_uid) else {
            continue;
        };
        if row.dynamic_phase.is_empty()
            && row.sequence_class.contains(&config.propagate.t1_contains)
            && row.series_time.is_some_and(|t| t > latest)
        {
            row.dynamic_phase = config.propagate.propagated_phase.clone();
            row.is_contrast_enhanced = true;
        }
    }
}

/// Spatial fingerprint: normalized string forms of the configured columns,
/// `NA` for anything missing. Rounded string forms sidestep float
/// equivalence bugs across platforms.
fn fingerprint(row: &MrRow, dynamic: &DynamicConfig) -> String {
    let list_decimals = dynamic.list_round_decimals as usize;
    let numeric_decimals = dynamic.numeric_round_decimals as usize;
    let parts: Vec<String> = dynamic
        .fingerprint_cols
        .iter()
        .map(|col| match col.as_str() {
            "ImagePositionPatient" => rounded_list(row.ipp.as_deref(), list_decimals),
            "ImageOrientationPatient" => rounded_list(row.iop.as_deref(), list_decimals),
            "sequenceClass" => row.sequence_class.clone(),
            "SliceThickness" => rounded(row.slice_thickness, numeric_decimals),
            "RepetitionTime" => rounded(row.tr, numeric_decimals),
            "EchoTime" => rounded(row.te, numeric_decimals),
            "FlipAngle" => rounded(row.flip_angle, numeric_decimals),
            other => {
                tracing::debug!(column = other, "unsupported fingerprint column");
                "NA".to_string()
            }
        })
        .collect();
    parts.join("|")
}

fn rounded(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) => format!("{v:.decimals$}"),
        None => "NA".to_string(),
    }
}

fn rounded_list(values: Option<&[f64]>, decimals: usize) -> String {
    match values {
        Some(values) if !values.is_empty() => values
            .iter()
            .map(|v| format!("{v:.decimals$}"))
            .collect::<Vec<_>>()
            .join(","),
        _ => "NA".to_string(),
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(&format!("(?i){pattern}")) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern, "invalid dynamics regex: {e}");
            None
        }
    }
}
