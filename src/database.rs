//! The database: a cache of handlers over a [`Backend`], a catalog of the
//! resources, and the pending transaction.
//!
//! Changes accumulate in memory (the `added`, `changed` and `removed` key
//! sets for the files, `resources_old2new` and `resources_new2old` for the
//! catalog) until [`Database::save_changes`] writes them all at once or
//! [`Database::abort_changes`] forgets them.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, error, info, warn};

use crate::backend::git::{self, GitBackend};
use crate::backend::lfs::LfsBackend;
use crate::backend::{Backend, HandlerMap};
use crate::cache::LruCache;
use crate::catalog::Catalog;
use crate::config::{BackendKind, DatabaseConfig};
use crate::datatype::Value;
use crate::error::{FolioError, Result};
use crate::handler::{File, Handler, HandlerFactory, HandlerRef, TextFile};
use crate::key::{self, normalize};
use crate::metadata::Metadata;
use crate::patches::Patches;
use crate::query::Query;
use crate::resource::{Resource, ResourceClass, ResourceClassDef, ResourceRegistry};
use crate::results::{Document, SearchResults};
use crate::transaction::{CommitInfo, TransactionCommand, TransactionReport};
use crate::worktree::{CommitMetadata, CommitSummary, LogOptions, Worktree};

pub const CATALOG_FILE: &str = "catalog/catalog.sqlite";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// Creates the folders, the repository and the catalog of a new database
/// at `root`, and opens it for writing.
pub fn make_database(root: impl AsRef<Path>, config: DatabaseConfig) -> Result<Database> {
    let root = root.as_ref();
    config.validate()?;
    fs::create_dir_all(root)?;
    match config.backend {
        BackendKind::Git => GitBackend::init(root, &config.git_options())?,
        BackendKind::Lfs => LfsBackend::init(root)?,
    }
    let catalog_path = root.join(CATALOG_FILE);
    if let Some(parent) = catalog_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Catalog::open(&catalog_path, false)?.close()?;
    info!(target: "folio::database", root = %root.display(), backend = ?config.backend, "database created");
    Database::open(root, Mode::ReadWrite, config)
}

/// fnmatch-style patterns (`*`, `?`, `[...]`, `[!...]`), where `*` also
/// matches `/`.
fn exclusion_set(patterns: &[&str]) -> Result<GlobSet> {
    let bad = |pattern: &str, e: globset::Error| FolioError::InvalidValue(format!("bad pattern '{pattern}': {e}"));
    let mut builder = GlobSetBuilder::new();
    for &pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| bad(pattern, e))?);
    }
    builder.build().map_err(|e| bad(patterns.join(" ").as_str(), e))
}

pub struct Database {
    root: PathBuf,
    mode: Mode,
    config: DatabaseConfig,
    backend: Box<dyn Backend>,
    cache: LruCache<String, HandlerRef>,
    pins: HashMap<String, usize>,
    git_cache: LruCache<String, Vec<u8>>,
    catalog: Arc<Mutex<Catalog>>,
    registry: ResourceRegistry,
    handler_classes: HashMap<String, HandlerFactory>,
    added: BTreeSet<String>,
    changed: BTreeSet<String>,
    removed: BTreeSet<String>,
    resources_old2new: BTreeMap<String, Option<String>>,
    resources_new2old: BTreeMap<String, Option<String>>,
    has_changed: bool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .field("backend", &self.backend.name())
            .field("cached", &self.cache.len())
            .field("added", &self.added)
            .field("changed", &self.changed)
            .field("removed", &self.removed)
            .finish()
    }
}

impl Database {
    pub fn open(root: impl AsRef<Path>, mode: Mode, config: DatabaseConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        config.validate()?;
        if !root.is_dir() {
            return Err(FolioError::NotFound(format!(
                "\"{}\" should be a folder, but it is not",
                root.display()
            )));
        }
        let read_only = mode == Mode::ReadOnly;
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::Git => Box::new(GitBackend::open(&root, &config.git_options(), read_only)?),
            BackendKind::Lfs => Box::new(LfsBackend::open(&root)?),
        };
        let catalog = Catalog::open(&root.join(CATALOG_FILE), read_only)?;
        let cache = LruCache::new(config.size_min, config.size_max)?.manual();
        let git_cache = LruCache::new(config.git_cache_min, config.git_cache_max)?;
        let registry = ResourceRegistry::new(&config.default_language);
        debug!(target: "folio::database", root = %root.display(), ?mode, "database opened");
        Ok(Self {
            root,
            mode,
            config,
            backend,
            cache,
            pins: HashMap::new(),
            git_cache,
            catalog: Arc::new(Mutex::new(catalog)),
            registry,
            handler_classes: HashMap::new(),
            added: BTreeSet::new(),
            changed: BTreeSet::new(),
            removed: BTreeSet::new(),
            resources_old2new: BTreeMap::new(),
            resources_new2old: BTreeMap::new(),
            has_changed: false,
        })
    }

    /// Opens with the settings of `<root>/folio.toml` and the environment.
    pub fn load(root: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        let root = root.as_ref();
        let config = DatabaseConfig::load(Some(&root.join("folio.toml")))?;
        Self::open(root, mode, config)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
    pub fn mode(&self) -> Mode {
        self.mode
    }
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
    pub fn is_read_only(&self) -> bool {
        self.mode == Mode::ReadOnly
    }
    pub fn catalog(&self) -> Arc<Mutex<Catalog>> {
        self.catalog.clone()
    }
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }
    pub fn has_changed(&self) -> bool {
        self.has_changed
    }
    pub fn added(&self) -> &BTreeSet<String> {
        &self.added
    }
    pub fn changed(&self) -> &BTreeSet<String> {
        &self.changed
    }
    pub fn removed(&self) -> &BTreeSet<String> {
        &self.removed
    }
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn check_writable(&self, what: &str) -> Result<()> {
        if self.is_read_only() {
            return Err(FolioError::Readonly(format!("cannot {what}")));
        }
        Ok(())
    }

    /////////////////////////////////////////////////////////////////////
    // Reading
    /////////////////////////////////////////////////////////////////////

    fn is_removed(&self, key: &str) -> bool {
        self.removed.iter().any(|removed| key::is_within(key, removed))
    }

    fn has_added_below(&self, key: &str) -> bool {
        self.added.iter().any(|added| added != key && key::is_within(added, key))
    }

    fn key_exists(&self, key: &str) -> bool {
        if key.is_empty() || self.cache.contains_key(&key.to_string()) || self.has_added_below(key) {
            return true;
        }
        !self.is_removed(key) && self.backend.handler_exists(key)
    }

    fn key_is_folder(&self, key: &str) -> bool {
        if key.is_empty() || self.has_added_below(key) {
            return true;
        }
        !self.cache.contains_key(&key.to_string()) && !self.is_removed(key) && self.backend.handler_is_folder(key)
    }

    pub fn has_handler(&self, key: &str) -> Result<bool> {
        Ok(self.key_exists(&normalize(key)?))
    }

    pub fn is_folder(&self, key: &str) -> Result<bool> {
        Ok(self.key_is_folder(&normalize(key)?))
    }

    /// Names in a folder, committed or pending, never `.git`.
    pub fn get_handler_names(&self, key: &str) -> Result<Vec<String>> {
        let key = normalize(key)?;
        let mut names = BTreeSet::new();
        if !self.is_removed(&key) {
            for name in self.backend.get_handler_names(&key)? {
                if !self.is_removed(&key::resolve2(&key, &name)) {
                    names.insert(name);
                }
            }
        }
        for added in self.added.iter().filter(|added| **added != key && key::is_within(added, &key)) {
            let rest = if key.is_empty() { added.as_str() } else { &added[key.len() + 1..] };
            if let Some(name) = rest.split('/').next() {
                names.insert(name.to_string());
            }
        }
        if key.is_empty() {
            names.remove(".git");
        }
        Ok(names.into_iter().collect())
    }

    /// Every file key below `base`, committed or pending.
    fn folder_keys(&self, base: &str) -> Result<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        if !self.is_removed(base) {
            for key in self.backend.traverse(base)? {
                if !self.is_removed(&key) {
                    keys.insert(key);
                }
            }
        }
        keys.extend(self.added.iter().filter(|k| key::is_within(k, base)).cloned());
        keys.extend(self.changed.iter().filter(|k| key::is_within(k, base)).cloned());
        Ok(keys)
    }

    /// Handler classes by extension, besides `metadata` and `txt`.
    pub fn register_handler_class(&mut self, extension: &str, factory: HandlerFactory) {
        self.handler_classes.insert(extension.to_string(), factory);
    }

    fn new_handler(&self, key: &str) -> Box<dyn Handler> {
        match key::extension(key) {
            Some("metadata") => Box::new(Metadata::empty(Some(self.registry.clone()))),
            Some(extension) => match self.handler_classes.get(extension) {
                Some(factory) => factory(),
                None if extension == "txt" => Box::new(TextFile::default()),
                None => Box::new(File::default()),
            },
            None => Box::new(File::default()),
        }
    }

    /// Reads the committed bytes into the handler.
    fn load_handler(&self, key: &str, handler: &HandlerRef) -> Result<()> {
        let data = self.backend.get_handler_data(key)?;
        let mtime = self.backend.get_handler_mtime(key)?;
        let mut handler = handler.lock()?;
        handler.reset();
        handler.load_state_from_string(&data)?;
        let state = handler.state_mut();
        state.key = Some(key.to_string());
        state.timestamp = mtime;
        state.dirty = None;
        Ok(())
    }

    /// Loads an unloaded handler, reloads a clean one whose file changed.
    fn sync_handler(&mut self, key: &str, handler: &HandlerRef) -> Result<()> {
        let state = handler.state()?;
        let reload = if state.is_unloaded() {
            true
        } else if state.dirty.is_none() {
            match (state.timestamp, self.backend.get_handler_mtime(key)?) {
                (Some(timestamp), Some(mtime)) => mtime > timestamp,
                _ => false,
            }
        } else {
            false
        };
        if reload {
            if let Err(e) = self.load_handler(key, handler) {
                self.cache.pop(&key.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    fn get_handler_internal(&mut self, key: &str, soft: bool) -> Result<Option<HandlerRef>> {
        if let Some(handler) = self.cache.get(&key.to_string()).cloned() {
            self.sync_handler(key, &handler)?;
            return Ok(Some(handler));
        }
        if self.key_is_folder(key) {
            return Err(FolioError::InvalidValue(format!("\"{key}\" is a folder, not a file")));
        }
        if self.is_removed(key) || !self.backend.handler_is_file(key) {
            if soft {
                return Ok(None);
            }
            return Err(FolioError::NotFound(format!("the resource \"{key}\" does not exist")));
        }
        let handler = HandlerRef::new(self.new_handler(key));
        self.load_handler(key, &handler)?;
        self.cache.insert(key.to_string(), handler.clone());
        self.make_room();
        Ok(Some(handler))
    }

    pub fn get_handler(&mut self, key: &str) -> Result<HandlerRef> {
        let key = normalize(key)?;
        self.get_handler_internal(&key, false)?
            .ok_or_else(|| FolioError::NotFound(format!("the resource \"{key}\" does not exist")))
    }

    /// Like [`Database::get_handler`], `None` for a missing key.
    pub fn get_handler_soft(&mut self, key: &str) -> Result<Option<HandlerRef>> {
        let key = normalize(key)?;
        self.get_handler_internal(&key, true)
    }

    /// The handler, checked to be an `H`.
    pub fn get_handler_as<H: Handler>(&mut self, key: &str) -> Result<HandlerRef> {
        let handler = self.get_handler(key)?;
        let class_id = handler.class_id()?;
        if handler.with::<H, _>(|_| ()).is_err() {
            return Err(FolioError::InvalidValue(format!(
                "expected '{}' class, '{class_id}' found",
                std::any::type_name::<H>()
            )));
        }
        Ok(handler)
    }

    /// The file handlers of a folder; sub-folders are skipped.
    pub fn get_handlers(&mut self, key: &str) -> Result<Vec<HandlerRef>> {
        let base = normalize(key)?;
        let mut handlers = Vec::new();
        for name in self.get_handler_names(&base)? {
            let key = key::resolve2(&base, &name);
            if !self.key_is_folder(&key) {
                handlers.push(self.get_handler(&key)?);
            }
        }
        Ok(handlers)
    }

    /// Keeps the handler in the cache until [`Database::unpin`].
    pub fn pin(&mut self, key: &str) -> Result<HandlerRef> {
        let handler = self.get_handler(key)?;
        *self.pins.entry(normalize(key)?).or_default() += 1;
        Ok(handler)
    }

    pub fn unpin(&mut self, key: &str) -> Result<()> {
        let key = normalize(key)?;
        if let Some(count) = self.pins.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&key);
            }
        }
        Ok(())
    }

    /// Names the key of a handler not in the database yet; the first
    /// [`Database::touch_handler`] adds it.
    pub fn push_phantom(&self, key: &str, handler: &HandlerRef) -> Result<()> {
        let key = normalize(key)?;
        handler.lock()?.state_mut().key = Some(key);
        Ok(())
    }

    pub fn is_phantom(&self, handler: &HandlerRef) -> Result<bool> {
        let state = handler.state()?;
        if state.timestamp.is_some() || state.dirty.is_none() {
            return Ok(false);
        }
        Ok(match &state.key {
            Some(key) => !self.cache.peek(key).is_some_and(|cached| cached.ptr_eq(handler)),
            None => true,
        })
    }

    /// Drops clean, unpinned handlers once the cache outgrows its bounds.
    /// A content file stays while its `.metadata` sibling is cached.
    pub fn make_room(&mut self) {
        let cached: HashSet<String> = self.cache.keys().cloned().collect();
        let pins = &self.pins;
        let evicted = self.cache.make_room(|key, handler| {
            if pins.contains_key(key) {
                return true;
            }
            if key::sibling_metadata(key).is_some_and(|sibling| cached.contains(&sibling)) {
                return true;
            }
            match handler.state() {
                Ok(state) => state.dirty.is_some(),
                Err(_) => true,
            }
        });
        if !evicted.is_empty() {
            debug!(target: "folio::database", evicted = evicted.len(), "cache trimmed");
        }
    }

    /////////////////////////////////////////////////////////////////////
    // Writing
    /////////////////////////////////////////////////////////////////////

    /// Adds a new file. The handler must not be attached to a key yet.
    pub fn set_handler(&mut self, key: &str, mut handler: Box<dyn Handler>) -> Result<HandlerRef> {
        self.check_writable("set handler")?;
        if handler.key().is_some() {
            return Err(FolioError::InvalidValue(
                "only new files can be added, try to clone first".to_string(),
            ));
        }
        let key = normalize(key)?;
        if self.key_exists(&key) {
            return Err(FolioError::Busy(key));
        }
        let state = handler.state_mut();
        state.key = Some(key.clone());
        state.timestamp = None;
        state.dirty.get_or_insert_with(Utc::now);

        let handler = HandlerRef::new(handler);
        self.cache.insert(key.clone(), handler.clone());
        if self.removed.remove(&key) {
            self.changed.insert(key);
        } else {
            self.added.insert(key);
        }
        self.has_changed = true;
        self.make_room();
        Ok(handler)
    }

    fn discard_handler(&mut self, key: &str) {
        self.cache.pop(&key.to_string());
        self.pins.remove(key);
    }

    fn del_file(&mut self, key: &str) {
        self.discard_handler(key);
        let was_added = self.added.remove(key);
        self.changed.remove(key);
        if !was_added && self.backend.handler_exists(key) {
            self.removed.insert(key.to_string());
        }
    }

    /// Removes a file, or a folder with everything below it.
    pub fn del_handler(&mut self, key: &str) -> Result<()> {
        self.check_writable("del handler")?;
        let key = normalize(key)?;
        if key.is_empty() {
            return Err(FolioError::InvalidKey("cannot remove the root".to_string()));
        }
        if !self.key_exists(&key) {
            return Err(FolioError::NotFound(format!("the resource \"{key}\" does not exist")));
        }
        if self.key_is_folder(&key) {
            for file in self.folder_keys(&key)? {
                self.del_file(&file);
            }
            let below: Vec<String> = self.cache.keys().filter(|k| key::is_within(k, &key)).cloned().collect();
            for cached in below {
                self.discard_handler(&cached);
            }
            if self.backend.handler_exists(&key) {
                self.removed.retain(|removed| !key::is_within(removed, &key));
                self.removed.insert(key);
            }
        } else {
            self.del_file(&key);
        }
        self.has_changed = true;
        Ok(())
    }

    /// Records a change to a handler. A phantom becomes an added file.
    pub fn touch_handler(&mut self, key: &str, handler: Option<&HandlerRef>) -> Result<()> {
        self.check_writable("touch handler")?;
        let key = normalize(key)?;
        let handler = match handler {
            Some(handler) => handler.clone(),
            None => self.get_handler(&key)?,
        };

        if self.is_phantom(&handler)? {
            handler.lock()?.state_mut().key = Some(key.clone());
            self.cache.insert(key.clone(), handler);
            if self.removed.remove(&key) {
                self.changed.insert(key);
            } else {
                self.added.insert(key);
            }
            self.has_changed = true;
            return Ok(());
        }

        if handler.state()?.is_unloaded() {
            self.load_handler(&key, &handler)?;
        }
        handler.lock()?.state_mut().dirty.get_or_insert_with(Utc::now);
        if !self.added.contains(&key) {
            self.changed.insert(key.clone());
        }
        self.removed.remove(&key);
        self.has_changed = true;
        Ok(())
    }

    /// Runs `f` on the handler of `key` and records the change.
    pub fn update_handler<H: Handler, R>(&mut self, key: &str, f: impl FnOnce(&mut H) -> Result<R>) -> Result<R> {
        self.check_writable("change handler")?;
        let handler = self.get_handler(key)?;
        let result = handler.with_mut::<H, _>(f)??;
        self.touch_handler(key, Some(&handler))?;
        Ok(result)
    }

    /// Copies a file, or a folder recursively. Files or folders matching
    /// one of the `exclude_patterns` globs are skipped.
    pub fn copy_handler(&mut self, source: &str, target: &str, exclude_patterns: &[&str]) -> Result<()> {
        self.check_writable("copy handler")?;
        let source = normalize(source)?;
        let target = normalize(target)?;
        if source == target {
            return Ok(());
        }
        let patterns = exclusion_set(exclude_patterns)?;
        let excluded = |key: &str| patterns.is_match(key);
        if excluded(&source) {
            return Ok(());
        }
        if self.key_exists(&target) {
            return Err(FolioError::Busy(target));
        }

        let files: Vec<String> = if self.key_is_folder(&source) {
            self.folder_keys(&source)?
                .into_iter()
                .filter(|file| {
                    // the file and every folder between it and the source
                    let mut current = file.as_str();
                    while current.len() > source.len() {
                        if excluded(current) {
                            return false;
                        }
                        current = key::parent(current);
                    }
                    true
                })
                .collect()
        } else {
            vec![source.clone()]
        };
        for file in files {
            let copy = self.get_handler(&file)?.lock()?.clone_handler();
            let new_key = key::rebase(&file, &source, &target);
            self.set_handler(&new_key, copy)?;
        }
        self.removed.remove(&target);
        self.has_changed = true;
        Ok(())
    }

    fn move_file(&mut self, source: &str, target: &str) -> Result<()> {
        let handler = self.get_handler(source)?;
        self.cache.pop(&source.to_string());
        if let Some(pins) = self.pins.remove(source) {
            self.pins.insert(target.to_string(), pins);
        }
        {
            let mut guard = handler.lock()?;
            let state = guard.state_mut();
            state.key = Some(target.to_string());
            state.dirty.get_or_insert_with(Utc::now);
        }
        self.cache.insert(target.to_string(), handler);

        let was_added = self.added.remove(source);
        self.changed.remove(source);
        if !was_added && self.backend.handler_exists(source) {
            self.removed.insert(source.to_string());
        }
        if self.removed.remove(target) {
            self.changed.insert(target.to_string());
        } else {
            self.added.insert(target.to_string());
        }
        Ok(())
    }

    /// Moves a file, or a folder with everything below it.
    pub fn move_handler(&mut self, source: &str, target: &str) -> Result<()> {
        self.check_writable("move handler")?;
        let source = normalize(source)?;
        let target = normalize(target)?;
        if source == target {
            return Ok(());
        }
        if self.key_exists(&target) {
            return Err(FolioError::Busy(target));
        }
        if !self.key_exists(&source) {
            return Err(FolioError::NotFound(format!("the resource \"{source}\" does not exist")));
        }
        if self.key_is_folder(&source) {
            for file in self.folder_keys(&source)? {
                let new_key = key::rebase(&file, &source, &target);
                self.move_file(&file, &new_key)?;
            }
            if self.backend.handler_exists(&source) {
                self.removed.retain(|removed| !key::is_within(removed, &source));
                self.removed.insert(source);
            }
        } else {
            self.move_file(&source, &target)?;
        }
        self.has_changed = true;
        self.make_room();
        Ok(())
    }

    /////////////////////////////////////////////////////////////////////
    // Resources
    /////////////////////////////////////////////////////////////////////

    /// Declares the class and the catalog fields of its metadata.
    pub fn register_resource_class(&mut self, class: Arc<dyn ResourceClass>) -> Result<()> {
        {
            let mut catalog = self.catalog.lock()?;
            for field in class.fields() {
                if let Some(field) = field.catalog_field() {
                    catalog.register_field(field)?;
                }
            }
        }
        self.registry.register(class)
    }

    pub fn unregister_resource_class(&mut self, class_id: &str) -> Result<Option<Arc<dyn ResourceClass>>> {
        self.registry.unregister(class_id)
    }

    pub fn get_resource_class(&self, class_id: &str) -> Option<Arc<dyn ResourceClass>> {
        self.registry.get_class(class_id)
    }

    pub fn get_resource_classes(&self) -> Vec<Arc<dyn ResourceClass>> {
        self.registry.class_ids().iter().filter_map(|id| self.registry.get_class(id)).collect()
    }

    /// A detached metadata handler for a new resource of the given class.
    pub fn new_metadata(&self, format: &str) -> Metadata {
        Metadata::new(format, Some(self.registry.clone()))
    }

    pub fn get_metadata(&mut self, abspath: &str, soft: bool) -> Result<Option<HandlerRef>> {
        let key = key::metadata_key(abspath)?;
        let handler = if soft { self.get_handler_soft(&key)? } else { Some(self.get_handler(&key)?) };
        if let Some(handler) = &handler {
            handler.with::<Metadata, _>(|_| ())?;
        }
        Ok(handler)
    }

    fn class_for(&self, format: &str) -> Arc<dyn ResourceClass> {
        self.registry.get_class(format).unwrap_or_else(|| {
            warn!(target: "folio::database", format, "no resource class registered, fields are read as strings");
            Arc::new(ResourceClassDef::new(format).soft())
        })
    }

    pub fn get_resource(&mut self, abspath: &str, soft: bool) -> Result<Option<Resource>> {
        let abspath = format!("/{}", normalize(abspath)?);
        let Some(metadata) = self.get_metadata(&abspath, soft)? else {
            return Ok(None);
        };
        let format = metadata.with::<Metadata, _>(|m| m.format().to_string())?;
        let class = self.class_for(&format);
        Ok(Some(Resource::new(abspath, class, metadata)))
    }

    pub fn get_resource_from_document(&mut self, document: &Document) -> Result<Resource> {
        let abspath = document.abspath()?;
        self.get_resource(&abspath, true)?.ok_or_else(|| FolioError::DataCorruption {
            message: format!("the catalog lists \"{abspath}\" but it does not exist"),
        })
    }

    /// The abspath of a resource and of every resource below it.
    fn resource_tree(&self, abspath: &str) -> Result<Vec<String>> {
        let folder = normalize(abspath)?;
        let root = format!("/{folder}");
        let mut paths = vec![root.clone()];
        for file in self.folder_keys(&folder)? {
            if let Some(path) = key::abspath_of(&file) {
                if path != root {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    /// Resources at and below `base`.
    pub fn traverse_resources(&mut self, base: &str) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        for path in self.resource_tree(base)? {
            if let Some(resource) = self.get_resource(&path, true)? {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    /// Creates the metadata file of a new resource and schedules its
    /// indexing.
    pub fn make_resource(&mut self, abspath: &str, metadata: Metadata) -> Result<Resource> {
        self.check_writable("make resource")?;
        let abspath = format!("/{}", normalize(abspath)?);
        let class = self.class_for(metadata.format());
        let handler = self.set_handler(&key::metadata_key(&abspath)?, Box::new(metadata))?;
        let resource = Resource::new(abspath, class, handler);
        self.add_resource(&resource)?;
        Ok(resource)
    }

    /// Changes the metadata of a resource and schedules its reindexing.
    pub fn update_metadata<R>(&mut self, abspath: &str, f: impl FnOnce(&mut Metadata) -> Result<R>) -> Result<R> {
        self.check_writable("change resource")?;
        let key = key::metadata_key(abspath)?;
        let result = self.update_handler::<Metadata, R>(&key, f)?;
        if let Some(resource) = self.get_resource(abspath, false)? {
            self.change_resource(&resource)?;
        }
        Ok(result)
    }

    pub fn add_resource(&mut self, resource: &Resource) -> Result<()> {
        self.check_writable("add resource")?;
        for path in self.resource_tree(resource.abspath())? {
            self.resources_new2old.insert(path, None);
        }
        self.has_changed = true;
        Ok(())
    }

    /// To be called before the files of the resource are removed.
    pub fn remove_resource(&mut self, resource: &Resource) -> Result<()> {
        self.check_writable("remove resource")?;
        for path in self.resource_tree(resource.abspath())? {
            self.resources_new2old.remove(&path);
            self.resources_old2new.insert(path, None);
        }
        self.has_changed = true;
        Ok(())
    }

    pub fn change_resource(&mut self, resource: &Resource) -> Result<()> {
        self.check_writable("change resource")?;
        let path = resource.abspath().to_string();
        if self.resources_new2old.contains_key(&path) {
            return Ok(());
        }
        if self.resources_old2new.get(&path) == Some(&None) {
            return Err(FolioError::InvalidValue("cannot change a resource that has been removed".to_string()));
        }
        self.resources_old2new.insert(path.clone(), Some(path.clone()));
        self.resources_new2old.insert(path.clone(), Some(path));
        self.has_changed = true;
        Ok(())
    }

    /// To be called before the files of the resource are moved.
    pub fn move_resource(&mut self, source: &Resource, new_abspath: &str) -> Result<()> {
        self.check_writable("move resource")?;
        let old_key = normalize(source.abspath())?;
        let new_key = normalize(new_abspath)?;
        for path in self.resource_tree(source.abspath())? {
            if self.resources_old2new.get(&path) == Some(&None) {
                return Err(FolioError::InvalidValue("cannot move a resource that has been removed".to_string()));
            }
            let target = format!("/{}", key::rebase(&normalize(&path)?, &old_key, &new_key));
            let origin = self.resources_new2old.remove(&path).unwrap_or_else(|| Some(path.clone()));
            if let Some(origin) = &origin {
                self.resources_old2new.insert(origin.clone(), Some(target.clone()));
            }
            self.resources_new2old.insert(target, origin);
        }
        self.has_changed = true;
        Ok(())
    }

    pub fn is_changed(&self, resource: &Resource) -> bool {
        let path = resource.abspath();
        self.resources_old2new.contains_key(path) || self.resources_new2old.contains_key(path)
    }

    /// Indexes again the resource at `base` (and those below it).
    pub fn reindex_catalog(&mut self, base: &str, recursive: bool) -> Result<usize> {
        self.check_writable("reindex catalog")?;
        let paths = if recursive { self.resource_tree(base)? } else { vec![format!("/{}", normalize(base)?)] };
        let mut documents = Vec::new();
        for path in paths {
            if let Some(resource) = self.get_resource(&path, true)? {
                documents.push(resource.get_catalog_values()?);
            }
        }
        let mut catalog = self.catalog.lock()?;
        let indexed = documents.iter().try_for_each(|values| catalog.index_document(values));
        if let Err(e) = indexed.and_then(|_| catalog.save_changes()) {
            catalog.abort_changes()?;
            return Err(e);
        }
        info!(target: "folio::database", base, documents = documents.len(), "catalog reindexed");
        Ok(documents.len())
    }

    /////////////////////////////////////////////////////////////////////
    // Transactions
    /////////////////////////////////////////////////////////////////////

    fn before_commit(&mut self, info: CommitInfo) -> Result<TransactionCommand> {
        let mut command = TransactionCommand {
            info,
            added: self.added.clone(),
            changed: self.changed.clone(),
            removed: self.removed.clone(),
            ..TransactionCommand::default()
        };
        for (old, new) in &self.resources_old2new {
            if new.as_deref() != Some(old.as_str()) {
                command.docs_to_unindex.insert(old.clone());
            }
        }
        let to_index: Vec<String> = self.resources_new2old.keys().cloned().collect();
        for path in to_index {
            match self.get_resource(&path, true)? {
                Some(resource) => command.docs_to_index.push(resource.get_catalog_values()?),
                None => warn!(target: "folio::database", abspath = %path, "resource to index is gone"),
            }
        }
        Ok(command)
    }

    fn execute(&mut self, command: &TransactionCommand) -> Result<TransactionReport> {
        let mut handlers = HandlerMap::new();
        for key in command.keys_to_write() {
            let handler = self
                .cache
                .peek(key)
                .cloned()
                .ok_or_else(|| FolioError::Invariant(format!("the pending key '{key}' is not cached")))?;
            handlers.insert(key.clone(), handler);
        }
        let mut report = self.backend.do_transaction(command, &handlers)?;

        let mut catalog = self.catalog.lock()?;
        for path in &command.docs_to_unindex {
            catalog.unindex_document(path)?;
        }
        for values in &command.docs_to_index {
            catalog.index_document(values)?;
        }
        catalog.save_changes()?;
        report.unindexed = command.docs_to_unindex.len();
        report.indexed = command.docs_to_index.len();
        Ok(report)
    }

    fn clear_pending(&mut self) {
        self.added.clear();
        self.changed.clear();
        self.removed.clear();
        self.resources_old2new.clear();
        self.resources_new2old.clear();
    }

    fn abort_pending(&mut self) -> Result<()> {
        let added: Vec<String> = self.added.iter().cloned().collect();
        for key in added {
            self.discard_handler(&key);
        }
        for key in &self.changed {
            if let Some(handler) = self.cache.peek(key) {
                handler.lock()?.abort_changes();
            }
        }
        let backend = self.backend.abort_transaction();
        let catalog = self.catalog.lock()?.abort_changes();
        self.clear_pending();
        backend.and(catalog)
    }

    fn cleanup(&mut self) {
        self.make_room();
        self.has_changed = false;
    }

    fn fail(&mut self, e: FolioError) -> FolioError {
        error!(target: "folio::database", error = %e, "Transaction failed");
        if let Err(abort) = self.abort_pending() {
            error!(target: "folio::database", error = %abort, "Aborting failed");
        }
        e
    }

    /// Commits the pending changes with the given message.
    pub fn save_changes(&mut self, message: Option<&str>) -> Result<Option<TransactionReport>> {
        let info = CommitInfo { message: message.map(str::to_string), ..CommitInfo::default() };
        self.save_changes_with(info)
    }

    /// Writes the pending files, records the commit, then updates the
    /// catalog. Any failure aborts the whole transaction.
    pub fn save_changes_with(&mut self, info: CommitInfo) -> Result<Option<TransactionReport>> {
        if self.is_read_only() || !self.has_changed {
            return Ok(None);
        }
        let command = match self.before_commit(info) {
            Ok(command) => command,
            Err(e) => {
                let e = self.fail(e);
                self.cleanup();
                return Err(e);
            }
        };
        let result = match self.execute(&command) {
            Ok(report) => {
                self.clear_pending();
                info!(
                    target: "folio::database",
                    commit = report.commit.as_deref().unwrap_or("-"),
                    written = report.written,
                    removed = report.removed,
                    indexed = report.indexed,
                    "transaction committed"
                );
                Ok(Some(report))
            }
            Err(e) => Err(self.fail(e)),
        };
        self.cleanup();
        result
    }

    /// Forgets the pending changes: added files are dropped, changed ones
    /// reload on next access, the catalog edits are rolled back.
    pub fn abort_changes(&mut self) -> Result<()> {
        if self.is_read_only() || !self.has_changed {
            return Ok(());
        }
        let result = self.abort_pending();
        self.cleanup();
        result
    }

    /////////////////////////////////////////////////////////////////////
    // Search
    /////////////////////////////////////////////////////////////////////

    pub fn search(&self, query: Query) -> SearchResults {
        SearchResults::new(self.catalog.clone(), query)
    }

    /// Documents whose fields hold all the given values.
    pub fn search_fields<S, V>(&self, fields: impl IntoIterator<Item = (S, V)>) -> SearchResults
    where
        S: Into<String>,
        V: Into<Value>,
    {
        let query = Query::and(fields.into_iter().map(|(name, value)| Query::phrase(name, value)));
        self.search(query)
    }

    pub fn get_unique_values(&self, name: &str) -> Result<BTreeSet<String>> {
        self.catalog.lock()?.get_unique_values(name)
    }

    /////////////////////////////////////////////////////////////////////
    // History
    /////////////////////////////////////////////////////////////////////

    pub fn worktree(&self) -> Result<&Worktree> {
        self.backend
            .worktree()
            .ok_or_else(|| FolioError::Vcs(format!("the {} backend keeps no history", self.backend.name())))
    }

    pub fn create_tag(&mut self, name: &str, message: Option<&str>) -> Result<()> {
        self.check_writable("create tag")?;
        self.worktree()?.git_tag(name, message.unwrap_or(name))
    }

    /// Resets the working tree to the tag, then deletes the tag.
    pub fn reset_to_tag(&mut self, name: &str) -> Result<()> {
        self.check_writable("reset to tag")?;
        let reset = self.worktree().and_then(|worktree| {
            worktree.git_reset(name)?;
            worktree.git_remove_tag(name)
        });
        if let Err(e) = reset {
            let e = self.fail(e);
            self.cleanup();
            return Err(e);
        }
        self.cache.clear();
        self.pins.clear();
        Ok(())
    }

    pub fn git_log(&self, options: &LogOptions) -> Result<Vec<CommitSummary>> {
        self.worktree()?.git_log(options)
    }

    pub fn get_commit_metadata(&self, reference: &str) -> Result<CommitMetadata> {
        self.worktree()?.get_commit_metadata(reference)
    }

    pub fn get_files_changed(&self, since: &str, until: &str) -> Result<BTreeSet<String>> {
        self.worktree()?.get_files_changed(since, until)
    }

    pub fn git_diff(&self, since: &str, until: Option<&str>, paths: &[String]) -> Result<String> {
        self.worktree()?.git_diff(since, until, paths)
    }

    pub fn get_blob(&mut self, oid: &str) -> Result<Vec<u8>> {
        if let Some(blob) = self.git_cache.get(&oid.to_string()) {
            return Ok(blob.clone());
        }
        let blob = self.worktree()?.lookup_blob(oid)?;
        self.git_cache.insert(oid.to_string(), blob.clone());
        Ok(blob)
    }

    /// The content of `path` as committed in `revision`.
    pub fn get_blob_by_revision_and_path(&mut self, revision: &str, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path)?;
        let oid = self
            .worktree()?
            .lookup_from_commit_by_path(revision, &path)?
            .ok_or_else(|| FolioError::NotFound(format!("\"{path}\" is not in {revision}")))?;
        self.get_blob(&oid)
    }

    /// Whether the working tree matches the last commit. Always true
    /// without a history.
    pub fn check_database(&self) -> Result<bool> {
        match self.config.backend {
            BackendKind::Git => git::check_database(&self.root),
            BackendKind::Lfs => Ok(true),
        }
    }

    /// Packs the old patches, see [`crate::patches::Patches::rotate`].
    pub fn rotate_patches(&self) -> Result<Option<PathBuf>> {
        let patches = Patches::open(self.worktree()?.path(), self.config.patches_rotate_days)?;
        patches.rotate()
    }

    /// Drops pending changes and closes the catalog.
    pub fn close(mut self) -> Result<()> {
        if self.has_changed {
            warn!(target: "folio::database", "closing with pending changes, they are lost");
            self.abort_changes()?;
        }
        match Arc::try_unwrap(self.catalog) {
            Ok(catalog) => catalog.into_inner()?.close(),
            // search results still hold it
            Err(shared) => {
                let mut catalog = shared.lock()?;
                catalog.save_changes()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs() {
        let set = exclusion_set(&["*.txt"]).unwrap();
        assert!(set.is_match("a/b.txt"));
        assert!(!set.is_match("a/b.txt.bak"));
        let set = exclusion_set(&["img?/[!x]*", "a.b"]).unwrap();
        assert!(set.is_match("img1/a.png"));
        assert!(!set.is_match("img1/x.png"));
        assert!(set.is_match("a.b"));
        assert!(!set.is_match("axb"));
        assert!(exclusion_set(&[]).unwrap().is_empty());
        assert!(matches!(exclusion_set(&["[a"]), Err(FolioError::InvalidValue(_))));
    }
}
