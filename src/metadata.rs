//! Metadata aggregation: per-series record collection and the multi-sheet
//! study workbook.

use crate::attrs::keyword_string;
use crate::convert::collect_dicom_files;
use crate::error::MetadataError;
use crate::metadata_cache::{Record, SeriesCache};
use crate::mr_clean::{DERIVED_COLUMNS, clean_mr_records};
use crate::mr_config::MrCleanConfig;
use crate::qc::{QcThresholds, assess_converted_series};
use crate::tag_catalog::TagCatalog;
use camino::{Utf8Path, Utf8PathBuf};
use dicom::dictionary_std::tags;
use dicom::object::OpenFileOptions;
use rust_xlsxwriter::Workbook;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identifying columns shown first in the main sheet.
const PRIORITY_COLUMNS: &[&str] = &[
    "SeriesFolder",
    "FileName",
    "SampleFileName",
    "FileIndex",
    "TotalFilesInSeries",
    "FilesReadForMetadata",
];

const IMPORTANT_COLUMNS: &[&str] = &[
    "PatientID",
    "AccessionNumber",
    "StudyDate",
    "Modality",
    "SeriesNumber",
    "SeriesDescription",
    "InstanceNumber",
];

const SUMMARY_COLUMNS: &[&str] = &[
    "SeriesFolder",
    "FileCount",
    "Modality",
    "SeriesDescription",
    "PatientID",
    "AccessionNumber",
    "StudyDate",
];

pub struct WorkbookOutcome {
    pub excel_file: Utf8PathBuf,
    pub record_count: usize,
    pub mr_record_count: usize,
}

/// Collect metadata rows for one series before its instances are converted
/// away. DR/DX/MG read every file; other modalities one representative.
pub(crate) fn collect_series_records(
    series_folder: &str,
    dicom_files: &[Utf8PathBuf],
    modality: &str,
    catalog: &TagCatalog,
) -> Vec<Record> {
    if dicom_files.is_empty() {
        return Vec::new();
    }
    let keywords = catalog.keywords_for(modality);
    let read_all = matches!(modality, "DR" | "MG" | "DX");
    let mut records = Vec::new();

    let files: Vec<(usize, &Utf8PathBuf)> = if read_all {
        dicom_files.iter().enumerate().collect()
    } else {
        vec![(0, &dicom_files[0])]
    };
    for (index, file) in files {
        let obj = match OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(file.as_std_path())
        {
            Ok(obj) => obj,
            Err(e) => {
                tracing::warn!(file = file.as_str(), "skipping unreadable instance: {e}");
                continue;
            }
        };
        let mut record = Record::new();
        record.insert("SeriesFolder".to_string(), series_folder.to_string());
        record.insert(
            "TotalFilesInSeries".to_string(),
            dicom_files.len().to_string(),
        );
        if read_all {
            record.insert(
                "FileName".to_string(),
                file.file_name().unwrap_or_default().to_string(),
            );
            record.insert("FileIndex".to_string(), (index + 1).to_string());
        } else {
            record.insert(
                "SampleFileName".to_string(),
                file.file_name().unwrap_or_default().to_string(),
            );
            record.insert("FilesReadForMetadata".to_string(), "1".to_string());
        }
        for keyword in keywords {
            record.insert(keyword.clone(), keyword_string(&obj, keyword));
        }
        // preview orientation correction needs the raster dimensions on
        // every row
        record.insert("Rows".to_string(), keyword_string(&obj, "Rows"));
        record.insert("Columns".to_string(), keyword_string(&obj, "Columns"));
        if record.get("Modality").is_none_or(|m| m.is_empty()) {
            record.insert("Modality".to_string(), modality.to_string());
        }
        records.push(record);
    }
    records
}

/// Walk `organized_dir` and write the study workbook: `DICOM_Metadata`,
/// `Series_Summary`, and `MR_Cleaned` when MR rows are present.
pub(crate) fn extract_study_workbook(
    organized_dir: &Utf8Path,
    excel_path: &Utf8Path,
    catalog: &TagCatalog,
    mr_config: &MrCleanConfig,
    qc_thresholds: &QcThresholds,
    cancel: &AtomicBool,
) -> Result<WorkbookOutcome, MetadataError> {
    let mut all_records: Vec<Record> = Vec::new();

    let mut folders: Vec<String> = fs_err::read_dir(organized_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    folders.sort();

    for folder in &folders {
        if cancel.load(Ordering::Relaxed) {
            return Err(MetadataError::Cancelled);
        }
        let series_dir = organized_dir.join(folder);
        let mut records = series_records(&series_dir, folder, catalog);
        if records.is_empty() {
            continue;
        }
        let outputs = converted_outputs(&series_dir);
        let qc = assess_converted_series(&series_dir, &outputs, qc_thresholds);
        for record in &mut records {
            record.insert("QCScore".to_string(), qc.score().to_string());
            record.insert(
                "QCMode".to_string(),
                serde_json::to_value(qc.qc_mode)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
            );
        }
        all_records.extend(records);
    }

    if all_records.is_empty() {
        return Err(MetadataError::NoRecords(organized_dir.to_owned()));
    }

    let columns = ordered_columns(&all_records, &[]);
    let mut workbook = Workbook::new();
    write_sheet(&mut workbook, "DICOM_Metadata", &columns, &all_records)?;

    let summary = summarize_by_folder(&all_records);
    let summary_columns: Vec<String> = SUMMARY_COLUMNS.iter().map(|c| c.to_string()).collect();
    write_sheet(&mut workbook, "Series_Summary", &summary_columns, &summary)?;

    let mr_records: Vec<Record> = all_records
        .iter()
        .filter(|r| {
            r.get("Modality")
                .is_some_and(|m| m.trim().to_uppercase() == "MR")
        })
        .cloned()
        .collect();
    let mr_record_count = mr_records.len();
    if !mr_records.is_empty() {
        tracing::info!(rows = mr_records.len(), "running MR sequence classifier");
        let cleaned = clean_mr_records(&mr_records, mr_config);
        let cleaned_columns = ordered_columns(&cleaned, DERIVED_COLUMNS);
        write_sheet(&mut workbook, "MR_Cleaned", &cleaned_columns, &cleaned)?;
    }

    if cancel.load(Ordering::Relaxed) {
        // nothing has been written yet; make sure no stale file survives
        let _ = fs_err::remove_file(excel_path);
        return Err(MetadataError::Cancelled);
    }
    workbook.save(excel_path.as_std_path())?;
    tracing::info!(
        excel_file = excel_path.as_str(),
        records = all_records.len(),
        "workbook written"
    );
    Ok(WorkbookOutcome {
        excel_file: excel_path.to_owned(),
        record_count: all_records.len(),
        mr_record_count,
    })
}

/// Rows for one series folder: the cache when present, a fresh read of any
/// remaining instances otherwise, or a minimal converted-only row.
fn series_records(series_dir: &Utf8Path, folder: &str, catalog: &TagCatalog) -> Vec<Record> {
    if let Some(cache) = SeriesCache::load(series_dir) {
        if !cache.records.is_empty() {
            return cache.records;
        }
    }
    let dicom_files = collect_dicom_files(series_dir).unwrap_or_default();
    if !dicom_files.is_empty() {
        let modality = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(dicom_files[0].as_std_path())
            .ok()
            .and_then(|obj| crate::attrs::string_value(&obj, tags::MODALITY))
            .unwrap_or_default();
        return collect_series_records(folder, &dicom_files, &modality, catalog);
    }
    let outputs = converted_outputs(series_dir);
    if let Some(first) = outputs.first() {
        let mut record = Record::new();
        record.insert("SeriesFolder".to_string(), folder.to_string());
        record.insert("ConvertedToNIfTI".to_string(), "Yes".to_string());
        record.insert("NIfTIFile".to_string(), first.clone());
        record.insert("TotalFilesInSeries".to_string(), outputs.len().to_string());
        return vec![record];
    }
    Vec::new()
}

/// Converted outputs of a series, NPZ preferred over NIfTI.
pub(crate) fn converted_outputs(series_dir: &Utf8Path) -> Vec<String> {
    let Ok(entries) = fs_err::read_dir(series_dir) else {
        return Vec::new();
    };
    let names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    let mut npz: Vec<String> = names
        .iter()
        .filter(|n| n.ends_with(".npz"))
        .cloned()
        .collect();
    if !npz.is_empty() {
        npz.sort();
        return npz;
    }
    let mut nifti: Vec<String> = names
        .into_iter()
        .filter(|n| n.ends_with(".nii.gz") || n.ends_with(".nii"))
        .collect();
    nifti.sort();
    nifti
}

/// Priority columns first, then the important DICOM fields, then everything
/// else alphabetically. `tail` columns are forced to the end in their given
/// order.
fn ordered_columns(records: &[Record], tail: &[&str]) -> Vec<String> {
    let present: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.keys().map(String::as_str))
        .collect();
    let mut columns: Vec<String> = Vec::new();
    for col in PRIORITY_COLUMNS.iter().chain(IMPORTANT_COLUMNS) {
        if present.contains(col) {
            columns.push(col.to_string());
        }
    }
    for col in present.iter().copied() {
        if !columns.iter().any(|c| c.as_str() == col) && !tail.contains(&col) {
            columns.push(col.to_string());
        }
    }
    for col in tail {
        if present.contains(col) {
            columns.push(col.to_string());
        }
    }
    columns
}

fn summarize_by_folder(records: &[Record]) -> Vec<Record> {
    let mut folders: Vec<String> = Vec::new();
    for record in records {
        let folder = record.get("SeriesFolder").cloned().unwrap_or_default();
        if !folders.contains(&folder) {
            folders.push(folder);
        }
    }
    folders
        .into_iter()
        .map(|folder| {
            let rows: Vec<&Record> = records
                .iter()
                .filter(|r| r.get("SeriesFolder").is_some_and(|f| *f == folder))
                .collect();
            let first_non_empty = |key: &str| {
                rows.iter()
                    .filter_map(|r| r.get(key))
                    .find(|v| !v.is_empty())
                    .cloned()
                    .unwrap_or_default()
            };
            let mut summary = Record::new();
            summary.insert("SeriesFolder".to_string(), folder);
            summary.insert("FileCount".to_string(), rows.len().to_string());
            for key in ["Modality", "SeriesDescription", "PatientID", "AccessionNumber", "StudyDate"]
            {
                summary.insert(key.to_string(), first_non_empty(key));
            }
            summary
        })
        .collect()
}

fn write_sheet(
    workbook: &mut Workbook,
    name: &str,
    columns: &[String],
    records: &[Record],
) -> Result<(), MetadataError> {
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(name)?;
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for (col, column) in columns.iter().enumerate() {
        worksheet.write_string(0, col as u16, column)?;
    }
    for (row, record) in records.iter().enumerate() {
        for (col, column) in columns.iter().enumerate() {
            if let Some(value) = record.get(column) {
                if !value.is_empty() {
                    worksheet.write_string(row as u32 + 1, col as u16, value)?;
                    widths[col] = widths[col].max(value.len());
                }
            }
        }
    }
    for (col, width) in widths.iter().enumerate() {
        worksheet.set_column_width(col as u16, (*width as f64 + 2.0).min(50.0))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(entries: &[(&str, &str)]) -> Record {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn identifying_columns_come_first() {
        let records = vec![record(&[
            ("WindowWidth", "80"),
            ("SeriesFolder", "001_t1"),
            ("Modality", "MR"),
            ("AAA", "zzz"),
        ])];
        let columns = ordered_columns(&records, &[]);
        assert_eq!(columns[0], "SeriesFolder");
        assert!(
            columns.iter().position(|c| c == "Modality").unwrap()
                < columns.iter().position(|c| c == "AAA").unwrap()
        );
    }

    #[test]
    fn tail_columns_stay_last_in_given_order() {
        let records = vec![record(&[
            ("SeriesFolder", "001"),
            ("sequenceClass", "T1_TSE"),
            ("dynamicPhase", "PRE"),
        ])];
        let columns = ordered_columns(&records, &["sequenceClass", "dynamicPhase"]);
        assert_eq!(
            &columns[columns.len() - 2..],
            &["sequenceClass".to_string(), "dynamicPhase".to_string()]
        );
    }

    #[test]
    fn summary_takes_first_non_empty_value() {
        let records = vec![
            record(&[("SeriesFolder", "001"), ("Modality", ""), ("PatientID", "P1")]),
            record(&[("SeriesFolder", "001"), ("Modality", "MR")]),
            record(&[("SeriesFolder", "002"), ("Modality", "CT")]),
        ];
        let summary = summarize_by_folder(&records);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0]["Modality"], "MR");
        assert_eq!(summary[0]["FileCount"], "2");
        assert_eq!(summary[1]["Modality"], "CT");
    }
}
