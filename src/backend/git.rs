//! Metadata files versioned with Git, other files kept aside.
//!
//! Keys ending in `metadata` live in the `database/` working tree and every
//! transaction is one commit. Everything else lives in `database_static/`;
//! before such a file is overwritten or removed, its previous content is
//! copied to `.history/<key>.<YYYYMMDDHHMMSS>.<uuid>`.
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Local, Utc};
use git2::{FileMode, ObjectType, Oid, Repository, Tree, TreeBuilder};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{mark_all_saved, mark_saved, serialize_handlers, Backend, HandlerMap, LocalFolder};
use crate::error::{FolioError, Result};
use crate::handler::Handler;
use crate::patches::{FileDiff, Patches};
use crate::transaction::{Author, TransactionCommand, TransactionReport};
use crate::worktree::Worktree;

pub const HISTORY_FOLDER: &str = ".history";

pub fn is_metadata(key: &str) -> bool {
    key.ends_with("metadata")
}

#[derive(Debug, Clone)]
pub struct GitOptions {
    /// Write a patch for every transaction.
    pub patches: bool,
    pub patches_rotate_days: i64,
    /// Committer when the Git configuration has none.
    pub committer: Author,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self { patches: true, patches_rotate_days: 14, committer: Author::new("folio", "folio@localhost") }
    }
}

/// What to undo in `database_static/` if the transaction fails.
#[derive(Debug)]
enum Journal {
    Created(String),
    Archived { key: String, history: PathBuf },
}

pub struct GitBackend {
    fs: LocalFolder,
    static_fs: LocalFolder,
    worktree: Worktree,
    patches: Option<Patches>,
    journal: Vec<Journal>,
}

impl std::fmt::Debug for GitBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitBackend")
            .field("worktree", &self.worktree)
            .field("patches", &self.patches.is_some())
            .finish()
    }
}

impl GitBackend {
    pub fn init(root: &Path, options: &GitOptions) -> Result<()> {
        Worktree::open(&root.join("database"), true, options.committer.clone())?;
        fs::create_dir_all(root.join("database_static").join(HISTORY_FOLDER))?;
        Ok(())
    }

    pub fn open(root: &Path, options: &GitOptions, read_only: bool) -> Result<Self> {
        let path = root.join("database");
        if !path.is_dir() {
            return Err(FolioError::NotFound(format!(
                "\"{}\" should be a folder, but it is not",
                path.display()
            )));
        }
        let worktree = Worktree::open(&path, false, options.committer.clone())?;
        let static_path = root.join("database_static");
        if !read_only {
            fs::create_dir_all(static_path.join(HISTORY_FOLDER))?;
        }
        let patches = if options.patches && !read_only {
            Some(Patches::open(&path, options.patches_rotate_days)?)
        } else {
            None
        };
        Ok(Self {
            fs: LocalFolder::new(path, &[".git"]),
            static_fs: LocalFolder::new(static_path, &[HISTORY_FOLDER]),
            worktree,
            patches,
            journal: Vec::new(),
        })
    }

    pub fn patches(&self) -> Option<&Patches> {
        self.patches.as_ref()
    }

    fn folder_for(&self, key: &str) -> &LocalFolder {
        if is_metadata(key) { &self.fs } else { &self.static_fs }
    }

    fn history_path(&self, key: &str) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        self.static_fs
            .root()
            .join(HISTORY_FOLDER)
            .join(format!("{key}.{stamp}.{}", Uuid::new_v4()))
    }

    /// Copies the current content of a static file to the history.
    fn archive(&mut self, key: &str) -> Result<()> {
        let history = self.history_path(key);
        self.static_fs.copy_to(key, &history)?;
        self.journal.push(Journal::Archived { key: key.to_string(), history });
        Ok(())
    }

    fn write_patch(&self, command: &TransactionCommand, data: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let Some(patches) = &self.patches else {
            return Ok(());
        };
        let mut diffs = Vec::new();
        for (key, after) in data.iter().filter(|(key, _)| key.ends_with(".metadata")) {
            let before = if command.changed.contains(key) && self.fs.is_file(key) {
                self.fs.read(key)?
            } else {
                Vec::new()
            };
            diffs.push(FileDiff { key: key.clone(), before, after: after.clone() });
        }
        for key in command.removed.iter().filter(|key| key.ends_with(".metadata")) {
            if self.fs.is_file(key) {
                diffs.push(FileDiff { key: key.clone(), before: self.fs.read(key)?, after: Vec::new() });
            }
        }
        let author = match &command.info.author {
            Some(author) => author.name.clone(),
            None => self.worktree.username()?,
        };
        let author: String = author.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect();
        patches.create_patch(diffs, &author)?;
        Ok(())
    }

    fn write_files(
        &mut self,
        command: &TransactionCommand,
        data: &BTreeMap<String, Vec<u8>>,
    ) -> Result<BTreeMap<String, DateTime<Utc>>> {
        // history of the static files about to change
        for key in command.changed.iter().chain(command.removed.iter()) {
            if is_metadata(key) {
                continue;
            }
            for file in self.static_fs.traverse(key)? {
                self.archive(&file)?;
            }
        }

        for key in &command.removed {
            self.fs.remove(key)?;
            self.static_fs.remove(key)?;
        }

        let mut written = BTreeMap::new();
        for (key, bytes) in data {
            if !is_metadata(key) && !self.static_fs.exists(key) {
                self.journal.push(Journal::Created(key.clone()));
            }
            let mtime = self.folder_for(key).write(key, bytes)?;
            written.insert(key.clone(), mtime);
        }
        Ok(written)
    }

    /// Stages the metadata changes and returns the tree to commit.
    fn stage(&self, command: &TransactionCommand, data: &BTreeMap<String, Vec<u8>>) -> Result<Oid> {
        let repo = self.worktree.repo();
        let mut index = repo.index()?;
        for key in command.removed.iter() {
            index.remove_path(Path::new(key))?;
            index.remove_dir(Path::new(key), 0)?;
        }
        let mut entries = Vec::new();
        for key in data.keys().filter(|key| is_metadata(key)) {
            index.add_path(Path::new(key))?;
            let entry = index.get_path(Path::new(key), 0).ok_or_else(|| {
                FolioError::Vcs(format!("'{key}' is missing from the index after being added"))
            })?;
            entries.push((key.clone(), Some((entry.id, entry.mode as i32))));
        }
        index.write()?;

        let Some(head) = self.worktree.head_commit()? else {
            return Ok(index.write_tree()?);
        };
        for key in &command.removed {
            entries.push((key.clone(), None));
        }
        build_tree(repo, &head.tree()?, entries)
    }

    fn revert_journal(&mut self) -> Result<()> {
        while let Some(entry) = self.journal.pop() {
            match entry {
                Journal::Created(key) => self.static_fs.remove(&key)?,
                Journal::Archived { key, history } => {
                    let target = self.static_fs.resolve(&key);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(&history, &target)?;
                }
            }
        }
        Ok(())
    }
}

impl Backend for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    fn handler_exists(&self, key: &str) -> bool {
        self.fs.exists(key) || self.static_fs.exists(key)
    }
    fn handler_is_file(&self, key: &str) -> bool {
        self.folder_for(key).is_file(key)
    }
    fn handler_is_folder(&self, key: &str) -> bool {
        self.fs.is_folder(key) || self.static_fs.is_folder(key)
    }
    fn get_handler_names(&self, key: &str) -> Result<Vec<String>> {
        let mut names = self.fs.get_names(key)?;
        names.extend(self.static_fs.get_names(key)?);
        names.sort();
        names.dedup();
        Ok(names)
    }
    fn get_handler_data(&self, key: &str) -> Result<Vec<u8>> {
        self.folder_for(key).read(key)
    }
    fn get_handler_mtime(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.folder_for(key).mtime(key)
    }
    fn traverse(&self, base: &str) -> Result<Vec<String>> {
        let mut keys = self.fs.traverse(base)?;
        keys.extend(self.static_fs.traverse(base)?);
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn save_handler(&mut self, key: &str, handler: &mut dyn Handler) -> Result<()> {
        let data = handler.to_str()?;
        let mtime = self.folder_for(key).write(key, &data)?;
        mark_saved(handler, mtime);
        Ok(())
    }

    fn do_transaction(&mut self, command: &TransactionCommand, handlers: &HandlerMap) -> Result<TransactionReport> {
        let data = serialize_handlers(command, handlers)?;
        self.journal.clear();

        self.write_patch(command, &data)?;
        let written = self.write_files(command, &data)?;
        let tree = self.stage(command, &data)?;
        let oid = self.worktree.git_commit(
            command.info.message_or_default(),
            command.info.author.as_ref(),
            command.info.date,
            Some(tree),
        )?;
        self.journal.clear();
        mark_all_saved(&written, handlers)?;

        Ok(TransactionReport {
            commit: Some(oid.to_string()),
            written: written.len(),
            removed: command.removed.len(),
            ..TransactionReport::default()
        })
    }

    fn abort_transaction(&mut self) -> Result<()> {
        let reverted = self.revert_journal();
        self.worktree.checkout_head()?;
        reverted
    }

    fn worktree(&self) -> Option<&Worktree> {
        Some(&self.worktree)
    }
}

enum HeapValue<'r> {
    Entry(Oid, i32),
    Removed,
    Builder(TreeBuilder<'r>),
}

/// Tree paths, deepest first. The root is `""`.
struct Heap<'r> {
    values: HashMap<String, HeapValue<'r>>,
    order: BinaryHeap<(usize, String)>,
}

impl<'r> Heap<'r> {
    fn new() -> Self {
        Self { values: HashMap::new(), order: BinaryHeap::new() }
    }

    fn depth(path: &str) -> usize {
        if path.is_empty() { 0 } else { path.matches('/').count() + 1 }
    }

    fn set(&mut self, path: String, value: HeapValue<'r>) {
        if !self.values.contains_key(&path) {
            self.order.push((Self::depth(&path), path.clone()));
        }
        self.values.insert(path, value);
    }

    fn pop(&mut self) -> Option<(String, HeapValue<'r>)> {
        while let Some((_, path)) = self.order.pop() {
            if let Some(value) = self.values.remove(&path) {
                return Some((path, value));
            }
        }
        None
    }
}

/// Folds the changed entries into the tree of `root`, writing the changed
/// subtrees bottom-up. Emptied folders disappear.
fn build_tree(repo: &Repository, root: &Tree<'_>, entries: Vec<(String, Option<(Oid, i32)>)>) -> Result<Oid> {
    let mut heap = Heap::new();
    heap.set(String::new(), HeapValue::Builder(repo.treebuilder(Some(root))?));
    for (path, entry) in entries {
        let value = match entry {
            Some((oid, mode)) => HeapValue::Entry(oid, mode),
            None => HeapValue::Removed,
        };
        heap.set(path, value);
    }

    while let Some((path, value)) = heap.pop() {
        let value = match value {
            HeapValue::Builder(builder) if path.is_empty() => return Ok(builder.write()?),
            HeapValue::Builder(builder) if builder.len() == 0 => None,
            HeapValue::Builder(builder) => Some((builder.write()?, i32::from(FileMode::Tree))),
            HeapValue::Entry(oid, mode) => Some((oid, mode)),
            HeapValue::Removed => None,
        };
        let (parent, name) = match path.rfind('/') {
            Some(idx) => (&path[..idx], &path[idx + 1..]),
            None => ("", path.as_str()),
        };

        if !matches!(heap.values.get(parent), Some(HeapValue::Builder(_))) {
            let builder = match heap.values.get(parent) {
                // the folder was removed, whatever it gets now is new
                Some(HeapValue::Removed) => repo.treebuilder(None)?,
                _ => match root.get_path(Path::new(parent)) {
                    Ok(entry) if entry.kind() == Some(ObjectType::Tree) => {
                        repo.treebuilder(Some(&repo.find_tree(entry.id())?))?
                    }
                    _ => repo.treebuilder(None)?,
                },
            };
            heap.set(parent.to_string(), HeapValue::Builder(builder));
        }
        let Some(HeapValue::Builder(builder)) = heap.values.get_mut(parent) else {
            return Err(FolioError::Invariant(format!("no tree builder for '{parent}'")));
        };
        match value {
            None => {
                if builder.get(name)?.is_some() {
                    builder.remove(name)?;
                }
            }
            Some((oid, mode)) => {
                builder.insert(name, oid, mode)?;
            }
        }
    }
    Err(FolioError::Invariant("the root tree was never written".to_string()))
}

fn git_output(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output()?;
    if !output.status.success() {
        return Err(FolioError::Vcs(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim_end()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether the working tree of the database at `root` matches its last
/// commit, i.e. no transaction was interrupted half-way.
pub fn check_database(root: &Path) -> Result<bool> {
    let cwd = root.join("database");
    let modified = git_output(&cwd, &["ls-files", "-m", "-d", "-o"])?;
    let staged = git_output(&cwd, &["diff-index", "--cached", "--name-only", "HEAD"])?;
    if modified.trim().is_empty() && staged.trim().is_empty() {
        debug!(target: "folio::database", root = %root.display(), "the database is consistent");
        return Ok(true);
    }
    error!(
        target: "folio::database",
        root = %root.display(),
        "the database is not in a consistent state; fix it with `git clean -fxd` and \
         `git checkout -f` in {}, then reindex the catalog",
        cwd.display()
    );
    warn!(target: "folio::database", modified = %modified.trim(), staged = %staged.trim(), "pending changes");
    Ok(false)
}
