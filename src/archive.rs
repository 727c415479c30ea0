//! Result archive builder: one zip bundling the organized study directory
//! and the workbook.

use camino::{Utf8Path, Utf8PathBuf};
use std::io::{Read, Write};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Zip `organized_dir` (plus `extra_files`) next to it as
/// `{stem}_results.zip`. Entry names use forward slashes relative to the
/// organized directory's parent.
pub(crate) fn build_result_archive(
    organized_dir: &Utf8Path,
    extra_files: &[Utf8PathBuf],
) -> anyhow::Result<Utf8PathBuf> {
    let parent = organized_dir.parent().unwrap_or(Utf8Path::new("."));
    let stem = organized_dir.file_name().unwrap_or("study");
    let zip_path = parent.join(format!("{stem}_results.zip"));

    let file = fs_err::File::create(&zip_path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    let mut buffer = Vec::with_capacity(1 << 20);
    for entry in WalkDir::new(organized_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = Utf8Path::from_path(entry.path()) else {
            continue;
        };
        let relative = path
            .strip_prefix(parent)
            .unwrap_or(path)
            .as_str()
            .replace('\\', "/");
        zip.start_file(relative, options)?;
        copy_into(&mut zip, path, &mut buffer)?;
    }
    for extra in extra_files {
        if !extra.is_file() {
            continue;
        }
        let name = extra.file_name().unwrap_or("attachment");
        zip.start_file(name, options)?;
        copy_into(&mut zip, extra, &mut buffer)?;
    }
    zip.finish()?;
    tracing::info!(archive = zip_path.as_str(), "result archive written");
    Ok(zip_path)
}

fn copy_into<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    path: &Utf8Path,
    buffer: &mut Vec<u8>,
) -> anyhow::Result<()> {
    buffer.clear();
    fs_err::File::open(path)?.read_to_end(buffer)?;
    zip.write_all(buffer)?;
    Ok(())
}
