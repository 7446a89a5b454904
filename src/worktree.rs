//! The Git repository behind the metadata folder.
//!
//! Everything goes through libgit2 except the consistency check, which
//! asks `git` itself (see [`crate::backend::git::check_database`]).
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use git2::{
    DiffFormat, DiffOptions, ErrorCode, IndexAddOption, ObjectType, Oid, Repository, ResetType,
    Signature, Sort, Time, Tree,
};
use regex::Regex;
use tracing::debug;

use crate::error::{FolioError, Result};
use crate::transaction::Author;

/// One line of [`Worktree::git_log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub sha: String,
    pub author_name: String,
    pub author_date: DateTime<Utc>,
    pub message_short: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMetadata {
    pub tree: String,
    pub parent: Option<String>,
    pub author_name: String,
    pub author_email: String,
    pub author_date: DateTime<Utc>,
    pub committer_name: String,
    pub committer_email: String,
    pub committer_date: DateTime<Utc>,
    pub message: String,
    pub message_short: String,
}

/// Filters of [`Worktree::git_log`], all optional.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Only commits changing one of these paths.
    pub paths: Vec<String>,
    /// At most this many commits.
    pub max_count: Option<usize>,
    /// Matched against the author name and email.
    pub author: Option<Regex>,
    /// Matched against the message.
    pub grep: Option<Regex>,
    /// Oldest first.
    pub reverse: bool,
    /// Where to start, `HEAD` by default.
    pub reference: Option<String>,
}

/// The subject line of a commit message.
pub fn message_short(message: &str) -> String {
    let subject = message.split("\n\n").next().unwrap_or_default();
    subject.replace('\n', " ").trim_end().to_string()
}

fn to_utc(time: Time) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(time.seconds(), 0).ok_or_else(|| FolioError::DataCorruption {
        message: format!("commit time {} out of range", time.seconds()),
    })
}

pub struct Worktree {
    path: PathBuf,
    repo: Repository,
    committer: Author,
}

impl std::fmt::Debug for Worktree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worktree").field("path", &self.path).finish()
    }
}

impl Worktree {
    /// Opens the repository at `path`, or creates it when `init` is set.
    /// `committer` is used when the Git configuration names nobody.
    pub fn open(path: &Path, init: bool, committer: Author) -> Result<Self> {
        let repo = if init { Repository::init(path)? } else { Repository::open(path)? };
        if repo.is_bare() {
            return Err(FolioError::Vcs(format!(
                "expected a standard repository at {}, not a bare one",
                path.display()
            )));
        }
        Ok(Self { path: path.to_path_buf(), repo, committer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    fn config_value(&self, key: &str) -> Result<Option<String>> {
        let config = self.repo.config()?;
        match config.get_string(key) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn username(&self) -> Result<String> {
        Ok(self.config_value("user.name")?.unwrap_or_else(|| self.committer.name.clone()))
    }
    pub fn useremail(&self) -> Result<String> {
        Ok(self.config_value("user.email")?.unwrap_or_else(|| self.committer.email.clone()))
    }

    /// The commit HEAD points to, `None` on an empty repository.
    pub fn head_commit(&self) -> Result<Option<git2::Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stages every file below the working tree.
    pub fn git_add_all(&self) -> Result<()> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    }

    /// Records a commit of `tree` (the index tree by default) on HEAD.
    pub fn git_commit(
        &self,
        message: &str,
        author: Option<&Author>,
        date: Option<DateTime<FixedOffset>>,
        tree: Option<Oid>,
    ) -> Result<Oid> {
        let tree = match tree {
            Some(tree) => tree,
            None => self.repo.index()?.write_tree()?,
        };
        let tree = self.repo.find_tree(tree)?;
        let parent = self.head_commit()?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

        let name = self.username()?;
        let email = self.useremail()?;
        let committer = Signature::now(&name, &email)?;
        let (author_name, author_email) = match author {
            Some(author) => (author.name.as_str(), author.email.as_str()),
            None => (name.as_str(), email.as_str()),
        };
        let author = match date {
            Some(date) => {
                let offset = date.offset().local_minus_utc() / 60;
                Signature::new(author_name, author_email, &Time::new(date.timestamp(), offset))?
            }
            None => Signature::new(author_name, author_email, &committer.when())?,
        };

        let oid = self.repo.commit(Some("HEAD"), &author, &committer, message, &tree, &parents)?;
        debug!(target: "folio::database", commit = %oid, "committed");
        Ok(oid)
    }

    /// An annotated tag on HEAD.
    pub fn git_tag(&self, name: &str, message: &str) -> Result<()> {
        if name.is_empty() || message.is_empty() {
            return Err(FolioError::InvalidValue("expected tag name and message".to_string()));
        }
        let head = self.repo.head()?.peel(ObjectType::Commit)?;
        let tagger = Signature::now(&self.username()?, &self.useremail()?)?;
        self.repo.tag(name, &head, &tagger, message, false)?;
        Ok(())
    }

    pub fn git_remove_tag(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(FolioError::InvalidValue("expected tag name".to_string()));
        }
        self.repo.tag_delete(name)?;
        Ok(())
    }

    /// `git reset --hard <reference>`
    pub fn git_reset(&self, reference: &str) -> Result<()> {
        if reference.is_empty() {
            return Err(FolioError::InvalidValue("expected reference to reset".to_string()));
        }
        let target = self.repo.revparse_single(reference)?;
        let commit = target.peel(ObjectType::Commit)?;
        self.repo.reset(&commit, ResetType::Hard, None)?;
        Ok(())
    }

    /// Puts the working tree and the index back to HEAD, dropping
    /// untracked files.
    pub fn checkout_head(&self) -> Result<()> {
        if self.head_commit()?.is_none() {
            // nothing committed yet, so nothing may stay
            let mut index = self.repo.index()?;
            index.clear()?;
            index.write()?;
            let mut checkout = git2::build::CheckoutBuilder::new();
            checkout.force().remove_untracked(true);
            self.repo.checkout_index(Some(&mut index), Some(&mut checkout))?;
            return Ok(());
        }
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        self.repo.checkout_head(Some(&mut checkout))?;
        // checkout leaves staged additions in the index
        let head = self.repo.head()?.peel(ObjectType::Commit)?;
        self.repo.reset(&head, ResetType::Hard, Some(&mut checkout))?;
        Ok(())
    }

    fn resolve(&self, reference: &str) -> Result<Oid> {
        Ok(self.repo.revparse_single(reference)?.peel(ObjectType::Commit)?.id())
    }

    fn entry_id(tree: &Tree<'_>, path: &str) -> Option<Oid> {
        tree.get_path(Path::new(path)).ok().map(|entry| entry.id())
    }

    pub fn git_log(&self, options: &LogOptions) -> Result<Vec<CommitSummary>> {
        let reference = options.reference.as_deref().unwrap_or("HEAD");
        if self.head_commit()?.is_none() {
            return Ok(Vec::new());
        }
        let mut walk = self.repo.revwalk()?;
        walk.set_sorting(Sort::TIME)?;
        walk.push(self.resolve(reference)?)?;

        let mut commits = Vec::new();
        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            let author = commit.author();
            if let Some(pattern) = &options.author {
                let matched = author.name().is_some_and(|n| pattern.is_match(n))
                    || author.email().is_some_and(|e| pattern.is_match(e));
                if !matched {
                    continue;
                }
            }
            let message = commit.message().unwrap_or_default();
            if let Some(pattern) = &options.grep {
                if !pattern.is_match(message) {
                    continue;
                }
            }
            if !options.paths.is_empty() {
                let tree = commit.tree()?;
                let parent_tree = match commit.parents().next() {
                    Some(parent) => Some(parent.tree()?),
                    None => None,
                };
                let touched = options.paths.iter().any(|path| {
                    let now = Self::entry_id(&tree, path);
                    match &parent_tree {
                        None => now.is_some(),
                        Some(parent_tree) => now != Self::entry_id(parent_tree, path),
                    }
                });
                if !touched {
                    continue;
                }
            }
            commits.push(CommitSummary {
                sha: commit.id().to_string(),
                author_name: author.name().unwrap_or_default().to_string(),
                author_date: to_utc(commit.time())?,
                message_short: message_short(message),
            });
            if options.max_count.is_some_and(|n| commits.len() >= n) {
                break;
            }
        }
        if options.reverse {
            commits.reverse();
        }
        Ok(commits)
    }

    pub fn get_commit_metadata(&self, reference: &str) -> Result<CommitMetadata> {
        let commit = self.repo.find_commit(self.resolve(reference)?)?;
        let author = commit.author();
        let committer = commit.committer();
        let message = commit.message().unwrap_or_default().to_string();
        Ok(CommitMetadata {
            tree: commit.tree_id().to_string(),
            parent: commit.parent_ids().next().map(|id| id.to_string()),
            author_name: author.name().unwrap_or_default().to_string(),
            author_email: author.email().unwrap_or_default().to_string(),
            author_date: to_utc(author.when())?,
            committer_name: committer.name().unwrap_or_default().to_string(),
            committer_email: committer.email().unwrap_or_default().to_string(),
            committer_date: to_utc(committer.when())?,
            message_short: message_short(&message),
            message,
        })
    }

    /// Paths touched by the commits in `since..until`.
    pub fn get_files_changed(&self, since: &str, until: &str) -> Result<BTreeSet<String>> {
        let mut walk = self.repo.revwalk()?;
        walk.push(self.resolve(until)?)?;
        walk.hide(self.resolve(since)?)?;

        let mut files = BTreeSet::new();
        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            let tree = commit.tree()?;
            let parent_tree = match commit.parents().next() {
                Some(parent) => Some(parent.tree()?),
                None => None,
            };
            let diff = self.repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
            for delta in diff.deltas() {
                let file = delta.new_file().path().or_else(|| delta.old_file().path());
                if let Some(path) = file.and_then(Path::to_str) {
                    files.insert(path.to_string());
                }
            }
        }
        Ok(files)
    }

    /// Unified diff between two commits (or of one commit against its
    /// parent), optionally limited to some paths.
    pub fn git_diff(&self, since: &str, until: Option<&str>, paths: &[String]) -> Result<String> {
        let since_commit = self.repo.find_commit(self.resolve(since)?)?;
        let (old_tree, new_tree) = match until {
            Some(until) => {
                let until_commit = self.repo.find_commit(self.resolve(until)?)?;
                (Some(since_commit.tree()?), until_commit.tree()?)
            }
            None => {
                let parent = match since_commit.parents().next() {
                    Some(parent) => Some(parent.tree()?),
                    None => None,
                };
                (parent, since_commit.tree()?)
            }
        };
        let mut options = DiffOptions::new();
        for path in paths {
            options.pathspec(path.as_str());
        }
        let diff = self.repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut options))?;
        let mut text = Vec::new();
        diff.print(DiffFormat::Patch, |_, _, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                text.push(line.origin() as u8);
            }
            text.extend_from_slice(line.content());
            true
        })?;
        Ok(String::from_utf8_lossy(&text).into_owned())
    }

    pub fn lookup_blob(&self, oid: &str) -> Result<Vec<u8>> {
        let oid = Oid::from_str(oid)?;
        Ok(self.repo.find_blob(oid)?.content().to_vec())
    }

    /// The blob id of `path` as of `revision`.
    pub fn lookup_from_commit_by_path(&self, revision: &str, path: &str) -> Result<Option<String>> {
        let commit = self.repo.find_commit(self.resolve(revision)?)?;
        let tree = commit.tree()?;
        match tree.get_path(Path::new(path)) {
            Ok(entry) if entry.kind() == Some(ObjectType::Blob) => Ok(Some(entry.id().to_string())),
            Ok(_) => Ok(None),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_line() {
        assert_eq!(message_short("Fix the\nparser\n\nLong body"), "Fix the parser");
        assert_eq!(message_short("one line\n"), "one line");
    }
}
