//! Helpers for reading DICOM element values as plain Rust types.
//!
//! Tag values cross two boundaries in this crate: the per-series JSON cache
//! (where a small sum type keeps numbers as numbers) and the workbook rows
//! (flat strings). Parse failures never propagate; a missing or malformed
//! value reads as `None` / the empty string.

use dicom::core::Tag;
use dicom::core::VR;
use dicom::object::DefaultDicomObject;
use dicom::object::mem::InMemElement;
use serde::{Deserialize, Serialize};

/// A tag value at the read boundary: number, list of numbers, or text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Number(f64),
    NumberList(Vec<f64>),
    Text(String),
}

impl TagValue {
    /// Flatten to the string form used in workbook rows.
    pub fn flatten(&self) -> String {
        match self {
            TagValue::Number(x) => fmt_f64(*x),
            TagValue::NumberList(xs) => fmt_f64_list(xs),
            TagValue::Text(s) => s.clone(),
        }
    }
}

/// Trimmed, non-empty string value of a tag.
pub(crate) fn string_value(dcm: &DefaultDicomObject, tag: Tag) -> Option<String> {
    dcm.element(tag)
        .ok()
        .and_then(|ele| ele.to_str().ok())
        .map(|s| s.trim_matches(['\0', ' ']).to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn f64_value(dcm: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    dcm.element(tag).ok().and_then(|ele| ele.to_float64().ok())
}

pub(crate) fn f64_list(dcm: &DefaultDicomObject, tag: Tag) -> Option<Vec<f64>> {
    dcm.element(tag)
        .ok()
        .and_then(|ele| ele.to_multi_float64().ok())
        .filter(|values| !values.is_empty())
}

pub(crate) fn int_value(dcm: &DefaultDicomObject, tag: Tag) -> Option<i64> {
    dcm.element(tag).ok().and_then(|ele| ele.to_int::<i64>().ok())
}

/// Look a tag up by dictionary keyword and read it as a [TagValue].
pub(crate) fn keyword_value(dcm: &DefaultDicomObject, keyword: &str) -> Option<TagValue> {
    let ele = dcm.element_by_name(keyword).ok()?;
    element_value(ele)
}

/// Look a tag up by dictionary keyword and flatten it to a row string.
pub(crate) fn keyword_string(dcm: &DefaultDicomObject, keyword: &str) -> String {
    keyword_value(dcm, keyword)
        .map(|value| value.flatten())
        .unwrap_or_default()
}

fn element_value(ele: &InMemElement) -> Option<TagValue> {
    if is_numeric_vr(ele.vr()) {
        if let Ok(values) = ele.to_multi_float64() {
            return match values.len() {
                0 => None,
                1 => Some(TagValue::Number(values[0])),
                _ => Some(TagValue::NumberList(values)),
            };
        }
    }
    let text = ele
        .to_str()
        .ok()
        .map(|s| s.trim_matches(['\0', ' ']).to_string())
        .filter(|s| !s.is_empty())?;
    Some(TagValue::Text(text))
}

/// VRs whose values are numbers. Text-like VRs stay text so identifiers such
/// as a zero-padded PatientID survive flattening.
fn is_numeric_vr(vr: VR) -> bool {
    matches!(
        vr,
        VR::DS | VR::FL | VR::FD | VR::IS | VR::SL | VR::SS | VR::UL | VR::US
    )
}

pub(crate) fn fmt_f64(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{x}")
    }
}

pub(crate) fn fmt_f64_list(xs: &[f64]) -> String {
    let parts: Vec<String> = xs.iter().copied().map(fmt_f64).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_numbers_without_trailing_zeros() {
        assert_eq!(TagValue::Number(5000.0).flatten(), "5000");
        assert_eq!(TagValue::Number(2.3).flatten(), "2.3");
    }

    #[test]
    fn flattens_lists_in_bracketed_form() {
        let value = TagValue::NumberList(vec![1.0, 0.0, 0.5]);
        assert_eq!(value.flatten(), "[1, 0, 0.5]");
    }

    #[test]
    fn tag_value_round_trips_through_json() {
        let value = TagValue::NumberList(vec![0.9, 0.1]);
        let json = serde_json::to_string(&value).unwrap();
        let back: TagValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
