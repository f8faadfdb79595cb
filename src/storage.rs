use std::io;
use std::path::{Path, PathBuf};
use time::{macros::format_description, OffsetDateTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::types::{Discovery, UserId};

/// The uploaded range list and the result log derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    pub input: PathBuf,
    pub result: PathBuf,
}

impl RunFiles {
    /// `<user>_<timestamp>_ranges.txt` pairs with `<user>_<timestamp>_results.txt`.
    pub fn for_input(input: PathBuf) -> Self {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().replace("ranges.txt", "results.txt"))
            .unwrap_or_else(|| "results.txt".to_string());
        let result = input.with_file_name(name);
        Self { input, result }
    }

    /// Same input, with a result log private to run `run`.
    pub fn for_run(&self, run: u64) -> Self {
        let stem = self
            .result
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "results".to_string());
        Self {
            input: self.input.clone(),
            result: self.result.with_file_name(format!("{stem}_{run}.txt")),
        }
    }
}

/// Directory holding uploaded range lists and result logs.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Persist an uploaded range list under a fresh, timestamped name.
    pub async fn save_upload(&self, user: UserId, contents: &[u8]) -> io::Result<RunFiles> {
        fs::create_dir_all(&self.dir).await?;
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!("[year][month][day]_[hour][minute][second]"))
            .unwrap_or_else(|_| "00000000_000000".to_string());
        let files = RunFiles::for_input(self.dir.join(format!("{user}_{stamp}_ranges.txt")));
        fs::write(&files.input, contents).await?;
        debug!(user, path = %files.input.display(), "range list stored");
        Ok(files)
    }

    /// Delete both files. Missing files are fine, so repeated calls are harmless.
    pub async fn cleanup(&self, files: &RunFiles) {
        for path in [&files.input, &files.result] {
            remove_if_present(path).await;
        }
    }

    /// Blocking variant for drop paths.
    pub fn cleanup_blocking(&self, files: &RunFiles) {
        for path in [&files.input, &files.result] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    error!(path = %path.display(), "failed to clean up file: {e}");
                }
            }
        }
    }
}

async fn remove_if_present(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %path.display(), "failed to clean up file: {e}"),
    }
}

/// Append-only `ip:port` log for one run. The file is created on the first append.
#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
    file: Option<File>,
}

impl ResultLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, discovery: &Discovery) -> io::Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(format!("{discovery}\n").as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}
