//! PACS retrieval engine: C-FIND discovery plus C-MOVE retrieval through an
//! embedded C-STORE SCP.

use crate::disk::wait_for_disk_low;
use crate::error::RetrieveError;
use crate::findscu::FindScu;
use crate::movescu::MoveAssociation;
use crate::settings::EnvOptions;
use crate::storescp::{DownloadState, run_store_scp};
use crate::types::{AccessionNumber, CalledAETitle, OurAETitle, SeriesEntry};
use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use dicom::ul::ClientAssociationOptions;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;

/// Result of pulling one study from the PACS.
pub struct DownloadOutcome {
    pub study_dir: Utf8PathBuf,
    pub files_received: u64,
    pub series: Vec<SeriesEntry>,
}

/// Client for one configured PACS endpoint.
pub struct PacsClient {
    address: String,
    aet: OurAETitle,
    aec: CalledAETitle,
    calling_port: u16,
    network_timeout: Duration,
    acse_timeout: Duration,
    dimse_timeout: Duration,
    high_watermark_gb: f64,
    low_watermark_gb: f64,
}

impl PacsClient {
    pub fn from_options(options: &EnvOptions) -> Self {
        Self {
            address: options.pacs_address(),
            aet: options.calling_aet.clone(),
            aec: options.called_aet.clone(),
            calling_port: options.calling_port,
            network_timeout: options.network_timeout,
            acse_timeout: options.acse_timeout,
            dimse_timeout: options.dimse_timeout,
            high_watermark_gb: options.download_high_watermark_gb,
            low_watermark_gb: options.download_low_watermark_gb,
        }
    }

    /// Open and release an association to report whether the PACS is
    /// reachable.
    pub fn check_status(&self) -> bool {
        let result = ClientAssociationOptions::new()
            .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
            .calling_ae_title(self.aet.as_str())
            .called_ae_title(self.aec.as_str())
            .connection_timeout(self.acse_timeout)
            .establish_with(&self.address);
        match result {
            Ok(association) => {
                let _ = association.release();
                tracing::info!(pacs_address = &self.address, "PACS connection status: OK");
                true
            }
            Err(e) => {
                tracing::warn!(pacs_address = &self.address, "unable to connect to PACS: {e}");
                false
            }
        }
    }

    /// Discover every series of the study matching `accession`.
    pub fn query_series(
        &self,
        accession: &AccessionNumber,
    ) -> Result<Vec<SeriesEntry>, RetrieveError> {
        let find = self.find_scu();
        tracing::info!(AccessionNumber = accession.as_str(), "querying study");
        let study_matches = find
            .query(study_identifier(accession))
            .map_err(|e| self.classify(e))?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut studies = Vec::new();
        for identifier in &study_matches {
            let Some(study_uid) = tts(identifier, tags::STUDY_INSTANCE_UID) else {
                continue;
            };
            if seen.insert(study_uid.clone()) {
                studies.push((
                    study_uid,
                    tts(identifier, tags::PATIENT_ID).unwrap_or_default(),
                    tts(identifier, tags::PATIENT_NAME).unwrap_or_default(),
                    tts(identifier, tags::STUDY_DATE).unwrap_or_default(),
                ));
            }
        }
        if studies.is_empty() {
            return Err(RetrieveError::NotFound(accession.clone()));
        }

        let mut series = Vec::new();
        for (study_uid, patient_id, patient_name, study_date) in studies {
            let series_matches = find
                .query(series_identifier(&study_uid))
                .map_err(|e| self.classify(e))?;
            for identifier in &series_matches {
                let Some(series_uid) = tts(identifier, tags::SERIES_INSTANCE_UID) else {
                    continue;
                };
                series.push(SeriesEntry {
                    StudyInstanceUID: study_uid.clone(),
                    SeriesInstanceUID: series_uid,
                    SeriesNumber: identifier
                        .get(tags::SERIES_NUMBER)
                        .and_then(|ele| ele.to_int::<i64>().ok()),
                    SeriesDescription: tts(identifier, tags::SERIES_DESCRIPTION)
                        .unwrap_or_else(|| "Unknown".to_string()),
                    Modality: tts(identifier, tags::MODALITY).unwrap_or_default(),
                    PatientID: patient_id.clone(),
                    PatientName: patient_name.clone(),
                    StudyDate: study_date.clone(),
                    AccessionNumber: accession.clone(),
                });
            }
        }
        tracing::info!(series_count = series.len(), "study discovery finished");
        Ok(series)
    }

    /// Pull the whole study into `{output_dir}/{accession}_{timestamp}`.
    ///
    /// `on_series_done` runs synchronously after each series' C-MOVE settles,
    /// with the series directory, its discovery entry, and `(index, total)`.
    /// Success requires at least one received instance; an untouched study
    /// root is removed again.
    pub fn download_study(
        &self,
        accession: &AccessionNumber,
        output_dir: &Utf8Path,
        cancel: &AtomicBool,
        mut on_series_done: impl FnMut(&Utf8Path, &SeriesEntry, usize, usize),
    ) -> Result<DownloadOutcome, RetrieveError> {
        let series = self.query_series(accession)?;

        let timestamp = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year][month][day]_[hour][minute][second]"
            ))
            .expect("timestamp format is well-formed");
        let study_dir = output_dir.join(format!("{accession}_{timestamp}"));
        fs_err::create_dir_all(&study_dir)?;

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.calling_port))?;
        let state = Arc::new(DownloadState::new(study_dir.clone()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let scp_handle = {
            let aet = self.aet.clone();
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            let read_timeout = self.network_timeout;
            thread::spawn(move || run_store_scp(listener, aet, read_timeout, state, shutdown))
        };

        let moved = self.move_all_series(&series, &study_dir, &state, cancel, &mut on_series_done);

        shutdown.store(true, Ordering::Relaxed);
        match scp_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("C-STORE SCP exited with error: {e}"),
            Err(_) => tracing::warn!("C-STORE SCP thread panicked"),
        }
        moved?;

        let files_received = state.received();
        if files_received == 0 {
            let _ = fs_err::remove_dir_all(&study_dir);
            return Err(RetrieveError::EmptyStudy(accession.clone()));
        }
        tracing::info!(
            files_received,
            study_dir = study_dir.as_str(),
            "download complete"
        );
        Ok(DownloadOutcome {
            study_dir,
            files_received,
            series,
        })
    }

    fn move_all_series(
        &self,
        series: &[SeriesEntry],
        study_dir: &Utf8Path,
        state: &DownloadState,
        cancel: &AtomicBool,
        on_series_done: &mut impl FnMut(&Utf8Path, &SeriesEntry, usize, usize),
    ) -> Result<(), RetrieveError> {
        let mut association = MoveAssociation::establish(
            &self.address,
            &self.aec,
            &self.aet,
            self.acse_timeout,
            self.dimse_timeout,
        )
        .map_err(|e| self.classify(e))?;

        let total = series.len();
        for (i, entry) in series.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("download cancelled between series");
                break;
            }
            // let converters drain raw instances before pulling more
            wait_for_disk_low(
                study_dir,
                self.high_watermark_gb,
                self.low_watermark_gb,
                cancel,
            );

            let series_dir = study_dir.join(entry.folder_name());
            state.set_series_dir(series_dir.clone());
            tracing::info!(
                series = i + 1,
                total,
                SeriesNumber = entry.SeriesNumber,
                SeriesDescription = entry.SeriesDescription.as_str(),
                "requesting series"
            );

            match association.move_series(&entry.StudyInstanceUID, &entry.SeriesInstanceUID) {
                Ok(0x0000) => {
                    tracing::info!(series = i + 1, "C-MOVE completed");
                }
                Ok(status) => {
                    tracing::warn!(
                        series = i + 1,
                        status = format!("0x{status:04X}"),
                        "C-MOVE finished with non-success status"
                    );
                }
                Err(e) => return Err(self.classify(e)),
            }

            // the store handler may still be flushing the last instances
            thread::sleep(Duration::from_millis(500));
            on_series_done(&series_dir, entry, i + 1, total);
        }
        association.release();
        Ok(())
    }

    fn find_scu(&self) -> FindScu<'_> {
        FindScu {
            pacs_address: &self.address,
            aec: &self.aec,
            aet: &self.aet,
            acse_timeout: self.acse_timeout,
            dimse_timeout: self.dimse_timeout,
        }
    }

    /// Association-level failures mean the PACS is unreachable or refused us;
    /// everything else is a DIMSE-level problem.
    fn classify(&self, e: anyhow::Error) -> RetrieveError {
        if e.downcast_ref::<dicom::ul::association::client::Error>()
            .is_some()
        {
            RetrieveError::Connection(self.address.clone())
        } else {
            RetrieveError::Dimse(e)
        }
    }
}

fn study_identifier(accession: &AccessionNumber) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from("STUDY"),
    ));
    obj.put(DataElement::new(
        tags::ACCESSION_NUMBER,
        VR::SH,
        PrimitiveValue::from(accession.as_str()),
    ));
    for (tag, vr) in [
        (tags::STUDY_INSTANCE_UID, VR::UI),
        (tags::PATIENT_ID, VR::LO),
        (tags::PATIENT_NAME, VR::PN),
        (tags::STUDY_DATE, VR::DA),
    ] {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
    }
    obj
}

fn series_identifier(study_instance_uid: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from("SERIES"),
    ));
    obj.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(study_instance_uid),
    ));
    for (tag, vr) in [
        (tags::SERIES_INSTANCE_UID, VR::UI),
        (tags::SERIES_NUMBER, VR::IS),
        (tags::SERIES_DESCRIPTION, VR::LO),
        (tags::MODALITY, VR::CS),
    ] {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
    }
    obj
}

/// Trimmed string value of a tag, if present and non-empty.
fn tts(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.get(tag)
        .and_then(|ele| ele.to_str().ok())
        .map(|s| s.trim_matches(['\0', ' ']).to_string())
        .filter(|s| !s.is_empty())
}
