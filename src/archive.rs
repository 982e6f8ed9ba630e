use std::fs::File;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use jiff::Timestamp;
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::layout::CaseLayout;

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub path: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

/// `<case>_eventlog_bundle_<YYYYmmdd_HHMMSS>.zip`, in UTC.
pub fn archive_name(case: &str, at: Timestamp) -> String {
    format!("{case}_eventlog_bundle_{}.zip", at.strftime("%Y%m%d_%H%M%S"))
}

pub fn create_archive(layout: &CaseLayout) -> Result<ArchiveReport> {
    create_archive_at(layout, Timestamp::now())
}

/// Zip every file under the output directory, logs included, with entry
/// names relative to the target. The bundle is written next to the output
/// directory, never inside it.
pub fn create_archive_at(layout: &CaseLayout, at: Timestamp) -> Result<ArchiveReport> {
    let output_dir = layout.output_dir();
    if !output_dir.is_dir() {
        bail!("Nothing to archive: {} does not exist", output_dir.display());
    }

    let path = layout.target().join(archive_name(layout.case(), at));
    let file = File::create(&path)
        .with_context(|| format!("Failed to create archive {}", path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut files = 0;
    let mut bytes = 0;
    for entry in WalkDir::new(output_dir).sort_by_file_name() {
        let entry = entry.context("Failed to walk output directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(layout.target())
            .with_context(|| format!("{} is outside the target", entry.path().display()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        debug!(entry = %name, "adding to archive");
        zip.start_file(name.as_str(), options)
            .with_context(|| format!("Failed to add {name} to archive"))?;
        let mut source = File::open(entry.path())
            .with_context(|| format!("Failed to open {}", entry.path().display()))?;
        bytes += io::copy(&mut source, &mut zip)
            .with_context(|| format!("Failed to compress {}", entry.path().display()))?;
        files += 1;
    }

    zip.finish().context("Failed to finalize archive")?;
    info!(path = %path.display(), files, "archive written");
    Ok(ArchiveReport { path, files, bytes })
}
