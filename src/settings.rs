//! Service settings, configurable through environment variables.
use crate::types::{CalledAETitle, OurAETitle};
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Everything the pipeline reads from the environment.
///
/// Variable names are the upper-case forms of the field names
/// (`PACS_IP`, `CALLING_AET`, `MAX_PENDING_SERIES`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct EnvOptions {
    pub pacs_ip: String,
    #[serde(default = "default_pacs_port")]
    pub pacs_port: u16,
    pub calling_aet: OurAETitle,
    pub called_aet: CalledAETitle,
    /// Local port the embedded C-STORE SCP binds to.
    #[serde(default = "default_calling_port")]
    pub calling_port: u16,
    #[serde(default = "default_high_watermark")]
    pub download_high_watermark_gb: f64,
    #[serde(default = "default_low_watermark")]
    pub download_low_watermark_gb: f64,
    /// Capacity of the downloaded-series queue between downloader and
    /// converters.
    #[serde(default = "default_max_pending_series")]
    pub max_pending_series: NonZeroUsize,
    #[serde(default = "default_num_converters")]
    pub num_converters: NonZeroUsize,
    #[serde(with = "humantime_serde", default = "default_network_timeout")]
    pub network_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_acse_timeout")]
    pub acse_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_dimse_timeout")]
    pub dimse_timeout: Duration,
    /// Directory of `{MODALITY}.json` tag keyword lists.
    #[serde(default)]
    pub tags_dir: Option<Utf8PathBuf>,
    /// Path to the MR classifier rule configuration.
    #[serde(default)]
    pub mr_clean_config: Option<Utf8PathBuf>,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Read by the results-directory eviction job, not by the pipeline.
    #[serde(default)]
    pub cleanup_threshold_gb: Option<f64>,
    #[serde(default)]
    pub cleanup_target_gb: Option<f64>,
}

impl EnvOptions {
    /// `host:port` address of the PACS.
    pub fn pacs_address(&self) -> String {
        format!("{}:{}", self.pacs_ip, self.pacs_port)
    }
}

/// Canonical format converted series are kept in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Compressed NIfTI (`.nii.gz`), RAS affine.
    #[default]
    Nifti,
    /// Normalized compressed tensor (`.npz`), `(Z, Y, X)` axis order.
    Npz,
}

fn default_pacs_port() -> u16 {
    2104
}

fn default_calling_port() -> u16 {
    1103
}

fn default_high_watermark() -> f64 {
    45.0
}

fn default_low_watermark() -> f64 {
    40.0
}

fn default_max_pending_series() -> NonZeroUsize {
    NonZeroUsize::new(4).unwrap()
}

fn default_num_converters() -> NonZeroUsize {
    NonZeroUsize::new(2).unwrap()
}

fn default_network_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_acse_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_dimse_timeout() -> Duration {
    Duration::from_secs(300)
}
