use aliri_braid::braid;

/// Our AE title: the calling AE for C-FIND/C-MOVE and the destination AE
/// (and C-STORE SCP identity) for retrieved instances.
#[braid(serde)]
pub struct OurAETitle;

/// The AE title of the PACS server we query.
#[braid(serde)]
pub struct CalledAETitle;

/// A hospital-assigned identifier for a radiology order; maps to one study.
#[braid(serde)]
pub struct AccessionNumber;

/// One series discovered by SERIES-level C-FIND, together with the patient
/// and study attributes collected at STUDY level.
#[allow(non_snake_case)]
#[derive(Debug, Clone)]
pub struct SeriesEntry {
    pub StudyInstanceUID: String,
    pub SeriesInstanceUID: String,
    pub SeriesNumber: Option<i64>,
    pub SeriesDescription: String,
    pub Modality: String,
    pub PatientID: String,
    pub PatientName: String,
    pub StudyDate: String,
    pub AccessionNumber: AccessionNumber,
}

impl SeriesEntry {
    /// Directory name for this series: zero-padded series number and the
    /// sanitized description.
    pub fn folder_name(&self) -> String {
        format!(
            "{:0>3}_{}",
            self.SeriesNumber.unwrap_or(0),
            crate::sanitize::sanitize_series_name(&self.SeriesDescription)
        )
    }
}
