mod archive;
mod association_error;
mod attrs;
mod config;
mod convert;
mod dcm2niix;
mod dimse;
mod disk;
mod error;
mod findscu;
mod metadata;
mod metadata_cache;
mod movescu;
mod mr_clean;
mod mr_config;
mod mr_dynamics;
mod mr_features;
mod mr_rules;
mod npz;
mod orientation;
mod pipeline;
mod preview;
mod qc;
mod retrieve;
mod run_from_env;
mod sanitize;
mod settings;
mod storescp;
mod tag_catalog;
mod types;
mod volume;

pub use config::get_config;
pub use convert::{ConversionMethod, ConversionMode, ConversionOutcome};
pub use error::{ConvertError, MetadataError, RetrieveError};
pub use metadata::WorkbookOutcome;
pub use metadata_cache::Record;
pub use mr_clean::{DERIVED_COLUMNS, clean_mr_records};
pub use mr_config::MrCleanConfig;
pub use pipeline::{
    DownloadProgressCallback, ProcessOptions, SeriesInfo, StageCallback, StudyOutcome,
    StudyProcessor,
};
pub use qc::{QcMode, QcSummary, QcThresholds};
pub use retrieve::{DownloadOutcome, PacsClient};
pub use run_from_env::{pacs_client_from_env, process_study_from_env};
pub use sanitize::sanitize_series_name;
pub use settings::{EnvOptions, OutputFormat};
pub use tag_catalog::TagCatalog;
pub use types::{AccessionNumber, CalledAETitle, OurAETitle, SeriesEntry};
