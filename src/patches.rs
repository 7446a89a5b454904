//! A unified diff of the metadata files changed by every transaction,
//! kept next to the repository for debugging.
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use flate2::{write::GzEncoder, Compression};
use tracing::info;
use uuid::Uuid;

use crate::error::{FolioError, Result};

pub const PATCHES_FOLDER: &str = ".git/patchs";

/// One file of a patch: its key with the bytes before and after.
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub key: String,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Patches {
    path: PathBuf,
    rotate_interval: Duration,
}

impl Patches {
    /// Patches of the repository whose working tree is `worktree`.
    pub fn open(worktree: &Path, rotate_days: i64) -> Result<Self> {
        let path = worktree.join(PATCHES_FOLDER);
        fs::create_dir_all(&path)?;
        Ok(Self { path, rotate_interval: Duration::days(rotate_days) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `YYYYMMDD/HHhMMmSS.ffffff-user<author>-<uuid>.patch` with the
    /// diffs in key order. Nothing is written without diffs.
    pub fn create_patch(&self, mut diffs: Vec<FileDiff>, author: &str) -> Result<Option<PathBuf>> {
        if diffs.is_empty() {
            return Ok(None);
        }
        diffs.sort_by(|a, b| a.key.cmp(&b.key));
        let mut data = Vec::new();
        for diff in &diffs {
            let key = Path::new(&diff.key);
            let mut patch = git2::Patch::from_buffers(&diff.before, Some(key), &diff.after, Some(key), None)?;
            data.extend_from_slice(&patch.to_buf()?);
        }

        let now = Local::now();
        let folder = self.path.join(now.format("%Y%m%d").to_string());
        fs::create_dir_all(&folder)?;
        let name = format!("{}-user{author}-{}.patch", now.format("%Hh%Mm%S.%6f"), Uuid::new_v4());
        let path = folder.join(name);
        let mut file = File::create(&path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(Some(path))
    }

    /// The date of the latest `YYYY-MM-DD_HHMM.tgz` archive.
    pub fn last_rotate_date(&self) -> Result<Option<NaiveDateTime>> {
        let mut last = None;
        for entry in fs::read_dir(&self.path)? {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".tgz")) else {
                continue;
            };
            if let Ok(date) = NaiveDateTime::parse_from_str(stem, "%Y-%m-%d_%H%M") {
                last = last.max(Some(date));
            }
        }
        Ok(last)
    }

    /// Packs the day folders older than the rotation interval into one
    /// archive and removes them.
    pub fn rotate(&self) -> Result<Option<PathBuf>> {
        let today = Local::now().naive_local();
        let mut folders = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(date) = NaiveDate::parse_from_str(&name, "%Y%m%d") else {
                continue;
            };
            let Some(start) = date.and_hms_opt(0, 0, 0) else {
                continue;
            };
            if today - start > self.rotate_interval {
                folders.push((name, entry.path()));
            }
        }
        if folders.is_empty() {
            return Ok(None);
        }
        folders.sort();
        info!(target: "folio::database", folders = folders.len(), "rotating the patches");

        let destination = self.path.join(format!("{}.tgz", Local::now().format("%Y-%m-%d_%H%M")));
        let file = BufWriter::new(File::create(&destination)?);
        let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, path) in &folders {
            tar.append_dir_all(name, path)?;
        }
        let encoder = tar.into_inner()?;
        let mut file = encoder.finish()?;
        file.flush()?;
        file.into_inner()
            .map_err(|e| FolioError::Io(e.into_error()))?
            .sync_all()?;

        for (_, path) in &folders {
            fs::remove_dir_all(path)?;
        }
        Ok(Some(destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_holds_sorted_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let patches = Patches::open(dir.path(), 14).unwrap();
        let path = patches
            .create_patch(
                vec![
                    FileDiff { key: "b.metadata".into(), before: b"format:x\n".to_vec(), after: Vec::new() },
                    FileDiff { key: "a.metadata".into(), before: Vec::new(), after: b"format:y\n".to_vec() },
                ],
                "42",
            )
            .unwrap()
            .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let a = text.find("a.metadata").unwrap();
        let b = text.find("b.metadata").unwrap();
        assert!(a < b);
        assert!(text.contains("+format:y"));
        assert!(text.contains("-format:x"));
        assert!(path.file_name().unwrap().to_string_lossy().contains("-user42-"));
        assert!(patches.create_patch(Vec::new(), "42").unwrap().is_none());
    }

    #[test]
    fn rotation_packs_old_days() {
        let dir = tempfile::tempdir().unwrap();
        let patches = Patches::open(dir.path(), 14).unwrap();
        let old = patches.path().join("20000101");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("x.patch"), b"diff").unwrap();
        let recent = patches.path().join(Local::now().format("%Y%m%d").to_string());
        fs::create_dir_all(&recent).unwrap();

        let archive = patches.rotate().unwrap().unwrap();
        assert!(archive.exists());
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(patches.last_rotate_date().unwrap().is_some());
        assert!(patches.rotate().unwrap().is_none());
    }
}
