use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use tracing::debug;

/// A local path and the name it gets inside the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    pub name: PathBuf,
}

pub fn temp_archive() -> Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix("rusty-remote-")
        .suffix(".tar.gz")
        .tempfile()
        .context("Failed to create temporary archive")
}

/// Packs every entry into a fresh temp file, removed when the handle drops.
pub fn pack(entries: &[ArchiveEntry]) -> Result<NamedTempFile> {
    let mut out = temp_archive()?;
    {
        let mut tar = tar::Builder::new(GzEncoder::new(out.as_file_mut(), Compression::default()));
        tar.follow_symlinks(false);
        for entry in entries {
            let meta = std::fs::symlink_metadata(&entry.source)
                .with_context(|| format!("Cannot read {}", entry.source.display()))?;
            let appended = if meta.is_dir() {
                tar.append_dir_all(&entry.name, &entry.source)
            } else {
                tar.append_path_with_name(&entry.source, &entry.name)
            };
            appended.with_context(|| format!("Failed to archive {}", entry.source.display()))?;
        }
        tar.into_inner()
            .and_then(|gz| gz.finish())
            .context("Failed to finish archive")?;
    }
    debug!(entries = entries.len(), path = %out.path().display(), "Archive packed");
    Ok(out)
}

pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let file = File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.unpack(dest)
        .with_context(|| format!("Failed to extract into {}", dest.display()))?;
    debug!(dest = %dest.display(), "Archive extracted");
    Ok(())
}
