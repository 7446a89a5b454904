//! Handlers as plain files under `<root>/database`, without history.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{mark_all_saved, mark_saved, serialize_handlers, Backend, HandlerMap, LocalFolder};
use crate::error::{FolioError, Result};
use crate::handler::Handler;
use crate::transaction::{TransactionCommand, TransactionReport};

#[derive(Debug)]
pub struct LfsBackend {
    fs: LocalFolder,
}

impl LfsBackend {
    pub fn init(root: &Path) -> Result<()> {
        fs::create_dir_all(root.join("database"))?;
        Ok(())
    }

    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join("database");
        if !path.is_dir() {
            return Err(FolioError::NotFound(format!(
                "\"{}\" should be a folder, but it is not",
                path.display()
            )));
        }
        Ok(Self { fs: LocalFolder::new(path, &[]) })
    }
}

impl Backend for LfsBackend {
    fn name(&self) -> &'static str {
        "lfs"
    }

    fn handler_exists(&self, key: &str) -> bool {
        self.fs.exists(key)
    }
    fn handler_is_file(&self, key: &str) -> bool {
        self.fs.is_file(key)
    }
    fn handler_is_folder(&self, key: &str) -> bool {
        self.fs.is_folder(key)
    }
    fn get_handler_names(&self, key: &str) -> Result<Vec<String>> {
        self.fs.get_names(key)
    }
    fn get_handler_data(&self, key: &str) -> Result<Vec<u8>> {
        self.fs.read(key)
    }
    fn get_handler_mtime(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.fs.mtime(key)
    }
    fn traverse(&self, base: &str) -> Result<Vec<String>> {
        self.fs.traverse(base)
    }

    fn save_handler(&mut self, key: &str, handler: &mut dyn Handler) -> Result<()> {
        let data = handler.to_str()?;
        let mtime = self.fs.write(key, &data)?;
        mark_saved(handler, mtime);
        Ok(())
    }

    fn do_transaction(&mut self, command: &TransactionCommand, handlers: &HandlerMap) -> Result<TransactionReport> {
        let data = serialize_handlers(command, handlers)?;

        for key in &command.removed {
            self.fs.remove(key)?;
        }
        let mut written = BTreeMap::new();
        for (key, bytes) in &data {
            written.insert(key.clone(), self.fs.write(key, bytes)?);
        }
        mark_all_saved(&written, handlers)?;

        Ok(TransactionReport {
            commit: None,
            written: written.len(),
            removed: command.removed.len(),
            ..TransactionReport::default()
        })
    }

    fn abort_transaction(&mut self) -> Result<()> {
        warn!(target: "folio::database", "the lfs backend cannot abort a transaction");
        Ok(())
    }
}
