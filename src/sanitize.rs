use regex::Regex;
use std::sync::LazyLock;

/// Clean a series description for use as a directory and output file name.
///
/// Replaces characters Windows and dcm2niix cannot handle, collapses
/// whitespace and dot runs, strips leading/trailing separators and caps the
/// length at 50 characters. Empty results become `"Unknown"`.
///
/// The function is idempotent: `sanitize_series_name(sanitize_series_name(s))
/// == sanitize_series_name(s)`.
pub fn sanitize_series_name<S: AsRef<str>>(name: S) -> String {
    let name = name.as_ref().replace('\0', "");
    let name = ILLEGAL_CHARS_RE.replace_all(&name, "_");
    // "303. X Elbow" style descriptions trip dcm2niix output naming
    let name = DOT_SPACE_RE.replace_all(&name, "_");
    let name = WHITESPACE_RE.replace_all(&name, "_");
    let name = DOT_RUN_RE.replace_all(&name, ".");
    let name: String = name
        .trim_matches(['.', ' ', '_'])
        .chars()
        .take(50)
        .collect();
    let name = name.trim_matches(['.', ' ', '_']);
    if name.is_empty() {
        "Unknown".to_string()
    } else {
        name.to_string()
    }
}

static ILLEGAL_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap());
static DOT_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.\s+").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DOT_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.{2,}").unwrap());

#[cfg(test)]
mod tests {
    use super::sanitize_series_name;
    use rstest::rstest;

    #[rstest]
    #[case("T2 TSE ax", "T2_TSE_ax")]
    #[case("303. X Elbow", "303_X_Elbow")]
    #[case("a<b>c:d\"e/f\\g|h?i*j", "a_b_c_d_e_f_g_h_i_j")]
    #[case("..leading.and.trailing..", "leading.and.trailing")]
    #[case("", "Unknown")]
    #[case("???", "Unknown")]
    fn sanitizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_series_name(input), expected);
    }

    #[rstest]
    #[case("T2 TSE ax")]
    #[case("303. X Elbow")]
    #[case("   spaced   out   ")]
    #[case("exactly.fifty.characters.long.name.that.keeps.on.going.far.past.the.limit")]
    #[case("trailing after truncation _________________________________________x")]
    fn is_idempotent(#[case] input: &str) {
        let once = sanitize_series_name(input);
        assert_eq!(sanitize_series_name(&once), once);
    }

    #[test]
    fn output_is_bounded_and_clean() {
        let out = sanitize_series_name("x".repeat(200));
        assert!(out.len() <= 50);
        for c in "<>:\"/\\|?*".chars() {
            assert!(!out.contains(c));
        }
        assert!(!out.starts_with(['.', ' ']));
        assert!(!out.ends_with(['.', ' ']));
    }
}
