use camino::Utf8PathBuf;
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;
use voxidicom::{
    AccessionNumber, OutputFormat, ProcessOptions, pacs_client_from_env, process_study_from_env,
};

/// Pull a study from the PACS, convert every series to canonical volumes,
/// and extract the metadata workbook.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Accession number of the study to process
    accession: String,

    /// Base output directory
    #[arg(short, long, default_value = "./dicom_processed")]
    output_dir: Utf8PathBuf,

    /// Canonical output format (overrides OUTPUT_FORMAT)
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Skip the result zip archive
    #[arg(long)]
    no_archive: bool,

    /// Skip PNG preview generation
    #[arg(long)]
    no_previews: bool,

    /// Only check PACS connectivity and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    if cli.check {
        let client = pacs_client_from_env()?;
        let ok = tokio::task::spawn_blocking(move || client.check_status()).await?;
        std::process::exit(if ok { 0 } else { 1 });
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling after the current series");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let accession = AccessionNumber::from(cli.accession);
    let process_options = ProcessOptions {
        output_format: cli.format,
        skip_archive: cli.no_archive,
        skip_previews: cli.no_previews,
        ..Default::default()
    };
    let outcome =
        process_study_from_env(&accession, &cli.output_dir, process_options, cancel).await?;

    if let Some(dir) = &outcome.organized_dir {
        tracing::info!(organized_dir = dir.as_str(), "organized study directory");
    }
    if let Some(excel) = &outcome.excel_file {
        tracing::info!(excel_file = excel.as_str(), "metadata workbook");
    }
    if let Some(archive) = &outcome.archive_file {
        tracing::info!(archive_file = archive.as_str(), "result archive");
    }
    if !outcome.success {
        anyhow::bail!(
            outcome
                .error
                .unwrap_or_else(|| "study processing failed".to_string())
        );
    }
    Ok(())
}
