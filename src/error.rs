use crate::types::AccessionNumber;
use camino::Utf8PathBuf;
use dicom::core::Tag;
use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::dictionary_std::StandardDataDictionary;

/// Errors from study discovery and retrieval (C-FIND/C-MOVE plus the
/// embedded C-STORE SCP).
#[derive(thiserror::Error, Debug)]
pub enum RetrieveError {
    #[error("could not establish association with PACS at {0}")]
    Connection(String),

    #[error("no study found for accession number \"{0}\"")]
    NotFound(AccessionNumber),

    #[error("no DICOM instances were received for accession number \"{0}\"")]
    EmptyStudy(AccessionNumber),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Dimse(#[from] anyhow::Error),
}

/// Errors from converting one series to NIfTI/NPZ.
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("no DICOM files found in series directory {0}")]
    NoDicomFiles(Utf8PathBuf),

    #[error("no instance in the series has pixel data")]
    NoPixelData,

    #[error("could not read slice geometry to sort the series")]
    UnsortableSlices,

    #[error("dcm2niix failed: {0}")]
    Tool(String),

    #[error(transparent)]
    Read(#[from] dicom::object::ReadError),

    #[error(transparent)]
    Pixels(#[from] dicom_pixeldata::Error),

    #[error(transparent)]
    PixelShape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    #[error(transparent)]
    NpzWrite(#[from] ndarray_npy::WriteNpzError),

    #[error(transparent)]
    NpzRead(#[from] ndarray_npy::ReadNpzError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Errors from metadata aggregation and workbook writing.
#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    #[error("no metadata records were collected under {0}")]
    NoRecords(Utf8PathBuf),

    #[error("metadata extraction was cancelled")]
    Cancelled,

    #[error(transparent)]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Standard name of a tag, for error messages.
pub(crate) fn name_of(tag: &Tag) -> String {
    StandardDataDictionary
        .by_tag(*tag)
        .map(|entry| entry.alias().to_string())
        .unwrap_or_else(|| tag.to_string())
}
