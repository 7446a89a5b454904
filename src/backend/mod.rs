//! Where the handler bytes live.
//!
//! A [`Backend`] answers existence and content questions about committed
//! keys and executes the file half of a [`TransactionCommand`]. Two
//! flavours exist: [`lfs::LfsBackend`], a plain folder, and
//! [`git::GitBackend`], which versions the metadata files with Git.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{FolioError, Result};
use crate::handler::{Handler, HandlerRef};
use crate::transaction::{TransactionCommand, TransactionReport};
use crate::worktree::Worktree;

pub mod git;
pub mod lfs;

/// The handlers of the keys a transaction writes.
pub type HandlerMap = BTreeMap<String, HandlerRef>;

pub trait Backend: Send {
    fn name(&self) -> &'static str;

    fn handler_exists(&self, key: &str) -> bool;
    fn handler_is_file(&self, key: &str) -> bool;
    fn handler_is_folder(&self, key: &str) -> bool;
    /// Names inside a folder, sorted.
    fn get_handler_names(&self, key: &str) -> Result<Vec<String>>;
    fn get_handler_data(&self, key: &str) -> Result<Vec<u8>>;
    fn get_handler_mtime(&self, key: &str) -> Result<Option<DateTime<Utc>>>;
    /// Every file key below `base`, sorted.
    fn traverse(&self, base: &str) -> Result<Vec<String>>;

    /// Writes one handler outside of any transaction.
    fn save_handler(&mut self, key: &str, handler: &mut dyn Handler) -> Result<()>;

    /// Serializes every handler to write, then writes, removes and (when
    /// the backend keeps a history) commits. Nothing is written when a
    /// handler fails to serialize.
    fn do_transaction(&mut self, command: &TransactionCommand, handlers: &HandlerMap) -> Result<TransactionReport>;

    /// Puts the files back as they were before the failed transaction.
    fn abort_transaction(&mut self) -> Result<()>;

    /// The repository, for backends keeping a history.
    fn worktree(&self) -> Option<&Worktree> {
        None
    }
}

/// The bytes of every handler a transaction writes, before any of them
/// reaches the disk.
pub(crate) fn serialize_handlers(command: &TransactionCommand, handlers: &HandlerMap) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut data = BTreeMap::new();
    for key in command.keys_to_write() {
        let handler = handlers
            .get(key)
            .ok_or_else(|| FolioError::Invariant(format!("no handler for the pending key '{key}'")))?;
        data.insert(key.clone(), handler.to_str()?);
    }
    Ok(data)
}

/// The handler now matches the file written at `mtime`.
pub(crate) fn mark_saved(handler: &mut dyn Handler, mtime: DateTime<Utc>) {
    let state = handler.state_mut();
    state.timestamp = Some(mtime);
    state.dirty = None;
}

pub(crate) fn mark_all_saved(
    written: &BTreeMap<String, DateTime<Utc>>,
    handlers: &HandlerMap,
) -> Result<()> {
    for (key, mtime) in written {
        if let Some(handler) = handlers.get(key) {
            mark_saved(&mut **handler.lock()?, *mtime);
        }
    }
    Ok(())
}

/// A folder of the local filesystem, addressed by keys.
#[derive(Debug, Clone)]
pub struct LocalFolder {
    root: PathBuf,
    /// Root entries that are not data.
    hidden: &'static [&'static str],
}

impl LocalFolder {
    pub fn new(root: impl Into<PathBuf>, hidden: &'static [&'static str]) -> Self {
        Self { root: root.into(), hidden }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, key: &str) -> PathBuf {
        if key.is_empty() { self.root.clone() } else { self.root.join(key) }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.resolve(key).exists()
    }
    pub fn is_file(&self, key: &str) -> bool {
        self.resolve(key).is_file()
    }
    pub fn is_folder(&self, key: &str) -> bool {
        self.resolve(key).is_dir()
    }

    pub fn get_names(&self, key: &str) -> Result<Vec<String>> {
        let path = self.resolve(key);
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if key.is_empty() && self.hidden.contains(&name.as_str()) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        match fs::read(self.resolve(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FolioError::NotFound(format!("the resource \"{key}\" does not exist")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn mtime(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match fs::metadata(self.resolve(key)) {
            Ok(metadata) => Ok(Some(DateTime::<Utc>::from(metadata.modified()?))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the parent folders, then truncates and writes the file.
    /// Returns its new mtime.
    pub fn write(&self, key: &str, data: &[u8]) -> Result<DateTime<Utc>> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(DateTime::<Utc>::from(file.metadata()?.modified()?))
    }

    /// Removes a file or a whole folder; a missing key is not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key);
        let result = if path.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
        match result {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub fn copy_to(&self, key: &str, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(self.resolve(key), destination)?;
        Ok(())
    }

    pub fn traverse(&self, base: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if self.is_file(base) {
            keys.push(base.to_string());
            return Ok(keys);
        }
        let mut stack = vec![base.to_string()];
        while let Some(folder) = stack.pop() {
            for name in self.get_names(&folder)? {
                let key = crate::key::resolve2(&folder, &name);
                if self.is_folder(&key) {
                    stack.push(key);
                } else {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
