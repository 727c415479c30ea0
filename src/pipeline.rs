//! Processing pipeline orchestrator.
//!
//! One study job runs a downloader task feeding a bounded channel, a pool of
//! converter tasks draining it, and a metadata task once the converters are
//! done. The channel capacity bounds downloaded-but-unconverted series on
//! disk; the retrieval engine's disk watermarks give second-order
//! backpressure on top.

use crate::convert::{ConversionMethod, collect_dicom_files, convert_series};
use crate::error::ConvertError;
use crate::metadata::{collect_series_records, converted_outputs, extract_study_workbook};
use crate::metadata_cache::{SeriesCache, build_sample_tags};
use crate::mr_config::MrCleanConfig;
use crate::preview::generate_series_preview;
use crate::qc::{QcSummary, QcThresholds, assess_converted_series};
use crate::retrieve::PacsClient;
use crate::settings::{EnvOptions, OutputFormat};
use crate::tag_catalog::TagCatalog;
use crate::types::AccessionNumber;
use camino::{Utf8Path, Utf8PathBuf};
use dicom::dictionary_std::tags;
use dicom::object::OpenFileOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};

/// `(message, stage)` progress hook for the job-control layer.
pub type StageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// `(current_series, total_series, series_name, pct)` download progress hook.
pub type DownloadProgressCallback = Arc<dyn Fn(usize, usize, &str, u8) + Send + Sync>;

#[derive(Default, Clone)]
pub struct ProcessOptions {
    pub output_format: Option<OutputFormat>,
    pub skip_archive: bool,
    pub skip_previews: bool,
    pub on_stage: Option<StageCallback>,
    pub on_download_progress: Option<DownloadProgressCallback>,
}

/// Summary of one converted series.
#[derive(Debug, Clone)]
pub struct SeriesInfo {
    pub series_folder: String,
    pub modality: String,
    pub file_count: usize,
    pub output_files: Vec<String>,
    pub method: ConversionMethod,
    pub qc: QcSummary,
}

/// Result of one study job. `success` is false only for fatal failures;
/// post-conversion stages degrade into `error` while leaving the converted
/// data usable.
pub struct StudyOutcome {
    pub success: bool,
    pub organized_dir: Option<Utf8PathBuf>,
    pub excel_file: Option<Utf8PathBuf>,
    pub archive_file: Option<Utf8PathBuf>,
    pub series_info: HashMap<String, SeriesInfo>,
    pub files_received: u64,
    pub error: Option<String>,
}

impl StudyOutcome {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            organized_dir: None,
            excel_file: None,
            archive_file: None,
            series_info: HashMap::new(),
            files_received: 0,
            error: Some(error),
        }
    }
}

/// Items flowing from the downloader to the converters; `None` is the
/// shutdown sentinel, one per converter.
type QueueItem = Option<(Utf8PathBuf, String)>;

pub struct StudyProcessor {
    options: EnvOptions,
    catalog: Arc<TagCatalog>,
    mr_config: Arc<MrCleanConfig>,
    qc_thresholds: QcThresholds,
}

impl StudyProcessor {
    pub fn new(options: EnvOptions) -> Self {
        let catalog = Arc::new(TagCatalog::load(options.tags_dir.as_deref()));
        let mr_config = Arc::new(MrCleanConfig::load(options.mr_clean_config.as_deref()));
        Self {
            options,
            catalog,
            mr_config,
            qc_thresholds: QcThresholds::default(),
        }
    }

    /// Drive one study end to end: download, convert, organize, extract
    /// metadata, archive.
    pub async fn process_study(
        &self,
        accession: &AccessionNumber,
        out_dir: &Utf8Path,
        process_options: ProcessOptions,
        cancel: Arc<AtomicBool>,
    ) -> StudyOutcome {
        let output_format = process_options
            .output_format
            .unwrap_or(self.options.output_format);
        let organized_dir = out_dir.join(format!("{accession}_organized"));
        if let Err(e) = fs_err::create_dir_all(&organized_dir) {
            return StudyOutcome::failed(format!("could not create output directory: {e}"));
        }
        notify(&process_options.on_stage, "starting study download", "download");

        let (tx, rx) = mpsc::channel::<QueueItem>(self.options.max_pending_series.get());
        let rx = Arc::new(Mutex::new(rx));

        let downloader = {
            let client = PacsClient::from_options(&self.options);
            let accession = accession.clone();
            let out_dir = out_dir.to_owned();
            let tx = tx.clone();
            let cancel = Arc::clone(&cancel);
            let on_progress = process_options.on_download_progress.clone();
            tokio::task::spawn_blocking(move || {
                client.download_study(&accession, &out_dir, &cancel, |series_dir, entry, current, total| {
                    if let Some(callback) = &on_progress {
                        let pct = 40 + ((current.saturating_sub(1)) * 40 / total.max(1)) as u8;
                        callback(current, total, &entry.SeriesDescription, pct);
                    }
                    let folder = series_dir
                        .file_name()
                        .unwrap_or("Unknown")
                        .to_string();
                    if tx.blocking_send(Some((series_dir.to_owned(), folder))).is_err() {
                        tracing::warn!("converter queue closed before download finished");
                    }
                })
            })
        };

        let series_info: Arc<Mutex<HashMap<String, SeriesInfo>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut converters = Vec::new();
        for worker in 0..self.options.num_converters.get() {
            let rx = Arc::clone(&rx);
            let cancel = Arc::clone(&cancel);
            let series_info = Arc::clone(&series_info);
            let organized_dir = organized_dir.clone();
            let catalog = Arc::clone(&self.catalog);
            let qc_thresholds = self.qc_thresholds.clone();
            let skip_previews = process_options.skip_previews;
            converters.push(tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some(Some((series_dir, folder))) = item else {
                        tracing::debug!(worker, "converter exiting");
                        break;
                    };
                    if cancel.load(Ordering::Relaxed) {
                        continue;
                    }
                    match process_single_series(
                        &series_dir,
                        &folder,
                        &organized_dir,
                        output_format,
                        skip_previews,
                        Arc::clone(&catalog),
                        qc_thresholds.clone(),
                    )
                    .await
                    {
                        Ok(info) => {
                            series_info.lock().await.insert(folder, info);
                        }
                        Err(ConvertError::NoDicomFiles(dir)) => {
                            tracing::warn!(series = folder, "no instances received, skipping");
                            let _ = fs_err::remove_dir(&dir);
                        }
                        Err(e) => {
                            tracing::error!(series = folder, "series conversion failed: {e}");
                        }
                    }
                }
            }));
        }

        let download_result = downloader.await;
        // converters drain the queue, then exit on their sentinel
        for _ in 0..self.options.num_converters.get() {
            let _ = tx.send(None).await;
        }
        drop(tx);
        for converter in converters {
            let _ = converter.await;
        }

        let download = match download_result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return StudyOutcome::failed(e.to_string()),
            Err(join_error) => {
                return StudyOutcome::failed(format!("downloader panicked: {join_error}"));
            }
        };
        // everything was moved under organized_dir; drop the empty shell
        let _ = fs_err::remove_dir(&download.study_dir);

        if cancel.load(Ordering::Relaxed) {
            let mut outcome = StudyOutcome::failed("study processing was cancelled".to_string());
            outcome.organized_dir = Some(organized_dir);
            outcome.files_received = download.files_received;
            return outcome;
        }

        notify(&process_options.on_stage, "extracting metadata", "metadata");
        let excel_path = out_dir.join(format!("dicom_metadata_{accession}.xlsx"));
        let workbook = {
            let organized_dir = organized_dir.clone();
            let excel_path = excel_path.clone();
            let catalog = Arc::clone(&self.catalog);
            let mr_config = Arc::clone(&self.mr_config);
            let qc_thresholds = self.qc_thresholds.clone();
            let cancel = Arc::clone(&cancel);
            tokio::task::spawn_blocking(move || {
                extract_study_workbook(
                    &organized_dir,
                    &excel_path,
                    &catalog,
                    &mr_config,
                    &qc_thresholds,
                    &cancel,
                )
            })
            .await
        };
        let (excel_file, metadata_error) = match workbook {
            Ok(Ok(outcome)) => (Some(outcome.excel_file), None),
            Ok(Err(e @ crate::error::MetadataError::Cancelled)) => {
                let mut outcome = StudyOutcome::failed(e.to_string());
                outcome.organized_dir = Some(organized_dir);
                outcome.files_received = download.files_received;
                return outcome;
            }
            Ok(Err(e)) => {
                tracing::error!("metadata extraction failed: {e}");
                (None, Some(e.to_string()))
            }
            Err(join_error) => (None, Some(format!("metadata task panicked: {join_error}"))),
        };

        let archive_file = if process_options.skip_archive {
            None
        } else {
            notify(&process_options.on_stage, "building result archive", "archive");
            let organized_dir = organized_dir.clone();
            let extras: Vec<Utf8PathBuf> = excel_file.iter().cloned().collect();
            match tokio::task::spawn_blocking(move || {
                crate::archive::build_result_archive(&organized_dir, &extras)
            })
            .await
            {
                Ok(Ok(path)) => Some(path),
                Ok(Err(e)) => {
                    tracing::error!("archive build failed: {e}");
                    None
                }
                Err(join_error) => {
                    tracing::error!("archive task panicked: {join_error}");
                    None
                }
            }
        };

        let series_info = Arc::try_unwrap(series_info)
            .map(Mutex::into_inner)
            .unwrap_or_default();
        notify(&process_options.on_stage, "study processing finished", "done");
        StudyOutcome {
            success: true,
            organized_dir: Some(organized_dir),
            excel_file,
            archive_file,
            series_info,
            files_received: download.files_received,
            error: metadata_error,
        }
    }
}

/// One converter's work for one series: cache metadata, convert, preview,
/// QC, and move the directory under `organized_dir`.
async fn process_single_series(
    series_dir: &Utf8Path,
    folder: &str,
    organized_dir: &Utf8Path,
    output_format: OutputFormat,
    skip_previews: bool,
    catalog: Arc<TagCatalog>,
    qc_thresholds: QcThresholds,
) -> Result<SeriesInfo, ConvertError> {
    let dicom_files = collect_dicom_files(series_dir)?;
    if dicom_files.is_empty() {
        return Err(ConvertError::NoDicomFiles(series_dir.to_owned()));
    }
    let file_count = dicom_files.len();

    // cache the tag rows before conversion deletes the instances
    {
        let series_dir = series_dir.to_owned();
        let folder = folder.to_string();
        let dicom_files = dicom_files.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ConvertError> {
            let representative = OpenFileOptions::new()
                .read_until(tags::PIXEL_DATA)
                .open_file(dicom_files[0].as_std_path())?;
            let modality =
                crate::attrs::string_value(&representative, tags::MODALITY).unwrap_or_default();
            let records = collect_series_records(&folder, &dicom_files, &modality, &catalog);
            let cache = SeriesCache {
                modality,
                records,
                sample_tags: Some(build_sample_tags(&representative)),
                conversion_map: Default::default(),
            };
            cache.save(&series_dir);
            Ok(())
        })
        .await??;
    }

    let outcome = convert_series(series_dir, folder, output_format).await?;

    if !skip_previews {
        let sample_tags = SeriesCache::load(series_dir).and_then(|cache| cache.sample_tags);
        match generate_series_preview(
            series_dir,
            folder,
            &outcome.output_files,
            sample_tags.as_ref(),
        ) {
            Ok(path) => tracing::debug!(preview = path.as_str(), "preview written"),
            Err(e) => tracing::warn!(series = folder, "preview generation failed: {e}"),
        }
    }

    let qc = assess_converted_series(series_dir, &converted_outputs(series_dir), &qc_thresholds);
    tracing::info!(
        series = folder,
        qc_mode = ?qc.qc_mode,
        low_quality_ratio = qc.low_quality_ratio,
        "series QC finished"
    );

    let target = organized_dir.join(folder);
    fs_err::rename(series_dir, &target)?;

    Ok(SeriesInfo {
        series_folder: folder.to_string(),
        modality: outcome.modality.clone(),
        file_count,
        output_files: outcome.output_files,
        method: outcome.method,
        qc,
    })
}

fn notify(callback: &Option<StageCallback>, message: &str, stage: &str) {
    tracing::info!(stage, "{message}");
    if let Some(callback) = callback {
        callback(message, stage);
    }
}
