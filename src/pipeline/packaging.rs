//! Zip packaging of a finished dataset.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::stages::images::IMAGES_DIR;

/// Errors that can occur while packaging a dataset.
#[derive(Debug, Error)]
pub enum PackagingError {
    /// The dataset directory does not exist.
    #[error("Dataset directory '{0}' does not exist")]
    MissingSource(PathBuf),

    /// The archive name is unusable as a file name.
    #[error("Invalid archive name '{0}'")]
    InvalidName(String),

    /// Writing the archive failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Moving the finished archive into place failed.
    #[error("Failed to publish archive '{path}': {reason}")]
    Persist { path: PathBuf, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Writes dataset archives into the results directory.
#[derive(Debug, Clone)]
pub struct Packager {
    results_dir: PathBuf,
}

impl Packager {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Archive file name for a job.
    pub fn archive_name(job_id: &str) -> String {
        format!("{}.zip", job_id)
    }

    /// Deletes the archive of `job_id` if one exists. Returns whether a file
    /// was removed.
    pub fn discard(&self, job_id: &str) -> Result<bool, PackagingError> {
        if job_id.is_empty() || job_id.contains(['/', '\\']) {
            return Err(PackagingError::InvalidName(job_id.to_string()));
        }
        match std::fs::remove_file(self.results_dir.join(Self::archive_name(job_id))) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Packs `source` into `<results_dir>/<job_id>.zip`.
    ///
    /// A dataset without an `images/` subdirectory has its files placed under
    /// `images/` in the archive. The archive is written to a temporary file in
    /// the results directory and renamed over any existing archive.
    pub fn package(&self, source: &Path, job_id: &str) -> Result<PathBuf, PackagingError> {
        if !source.is_dir() {
            return Err(PackagingError::MissingSource(source.to_path_buf()));
        }
        if job_id.is_empty() || job_id.contains(['/', '\\']) {
            return Err(PackagingError::InvalidName(job_id.to_string()));
        }

        std::fs::create_dir_all(&self.results_dir)?;
        let target = self.results_dir.join(Self::archive_name(job_id));

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.", job_id))
            .suffix(".zip.partial")
            .tempfile_in(&self.results_dir)?;

        let mut staging = write_archive(source, staging)?;
        staging.flush()?;
        staging.as_file().sync_all()?;

        staging.persist(&target).map_err(|e| PackagingError::Persist {
            path: target.clone(),
            reason: e.to_string(),
        })?;

        Ok(target)
    }
}

fn write_archive(source: &Path, file: NamedTempFile) -> Result<NamedTempFile, PackagingError> {
    let nest_under_images = !source.join(IMAGES_DIR).is_dir();
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| io::Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let mut name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if nest_under_images {
            name = format!("{}/{}", IMAGES_DIR, name);
        }
        entries.push((name, entry.path().to_path_buf()));
    }
    entries.sort();

    let mut zip = ZipWriter::new(file);
    for (name, path) in entries {
        zip.start_file(name, options)?;
        let mut input = File::open(&path)?;
        io::copy(&mut input, &mut zip)?;
    }

    Ok(zip.finish()?)
}
