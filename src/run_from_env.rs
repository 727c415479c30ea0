//! Convenience entry points wiring environment configuration into the
//! pipeline.

use crate::config::get_config;
use crate::pipeline::{ProcessOptions, StudyOutcome, StudyProcessor};
use crate::retrieve::PacsClient;
use crate::settings::EnvOptions;
use crate::types::AccessionNumber;
use camino::Utf8Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Process one study using configuration from environment variables.
pub async fn process_study_from_env(
    accession: &AccessionNumber,
    out_dir: &Utf8Path,
    process_options: ProcessOptions,
    cancel: Arc<AtomicBool>,
) -> anyhow::Result<StudyOutcome> {
    let options: EnvOptions = get_config().extract()?;
    let processor = StudyProcessor::new(options);
    Ok(processor
        .process_study(accession, out_dir, process_options, cancel)
        .await)
}

/// A [PacsClient] for the endpoint configured in the environment.
pub fn pacs_client_from_env() -> anyhow::Result<PacsClient> {
    let options: EnvOptions = get_config().extract()?;
    Ok(PacsClient::from_options(&options))
}
