mod common;

use std::any::Any;
use std::time::{Duration, SystemTime};

use common::{git_database, lfs_database, new_database};
use folio::config::DatabaseConfig;
use folio::database::{Database, Mode};
use folio::error::{FolioError, Result};
use folio::handler::{Handler, HandlerState, TextFile};

#[derive(Default)]
struct Broken {
    state: HandlerState,
}

impl Handler for Broken {
    fn class_id(&self) -> &str {
        "application/x-broken"
    }
    fn state(&self) -> &HandlerState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut HandlerState {
        &mut self.state
    }
    fn reset(&mut self) {}
    fn load_state_from_string(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
    fn to_str(&self) -> Result<Vec<u8>> {
        Err(FolioError::Serialization("cannot serialize a broken handler".to_string()))
    }
    fn duplicate(&self) -> Box<dyn Handler> {
        Box::new(Broken { state: self.state.clone() })
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn text(db: &mut Database, key: &str) -> String {
    db.get_handler(key)
        .expect("get handler")
        .with::<TextFile, _>(|t| t.text().to_string())
        .expect("text file")
}

/// Commits `30.txt` and stages a copy of it as `31.txt`.
fn copy_preamble(db: &mut Database) {
    db.set_handler("30.txt", Box::new(TextFile::new("The Lion and the Mouse")))
        .expect("set 30.txt");
    db.save_changes(Some("add 30")).expect("commit 30.txt");
    let copy = db.get_handler("30.txt").expect("get 30.txt").lock().expect("lock").clone_handler();
    db.set_handler("31.txt", copy).expect("set 31.txt");
}

#[test]
fn copy_and_commit_lfs() {
    let (_dir, mut db) = lfs_database();
    copy_preamble(&mut db);
    db.save_changes(None).expect("commit 31.txt");
    assert!(db.root().join("database/31.txt").is_file(), "31.txt should be on disk");
    assert_eq!(text(&mut db, "31.txt"), "The Lion and the Mouse");
}

#[test]
fn copy_and_commit_git() {
    let (_dir, mut db) = git_database();
    copy_preamble(&mut db);
    let report = db.save_changes(None).expect("commit 31.txt").expect("a report");
    assert!(report.commit.is_some(), "the git backend records a commit");
    assert_eq!(report.written, 1, "only 31.txt is written");
    assert!(db.root().join("database_static/31.txt").is_file(), "static files live outside the repository");
    assert_eq!(text(&mut db, "31.txt"), "The Lion and the Mouse");
}

#[test]
fn abort_forgets_added_files() {
    for (_dir, mut db) in [lfs_database(), git_database()] {
        copy_preamble(&mut db);
        db.abort_changes().expect("abort");
        assert!(!db.has_handler("31.txt").expect("has"), "31.txt was never committed");
        assert!(db.has_handler("30.txt").expect("has"), "30.txt was committed");
        assert!(db.added().is_empty());
        assert!(!db.has_changed());
    }
}

#[test]
fn abort_reloads_changed_files() {
    let (_dir, mut db) = git_database();
    copy_preamble(&mut db);
    db.save_changes(None).expect("commit");
    db.update_handler::<TextFile, _>("30.txt", |t| t.set_text("changed")).expect("change");
    assert_eq!(text(&mut db, "30.txt"), "changed");
    db.abort_changes().expect("abort");
    assert_eq!(text(&mut db, "30.txt"), "The Lion and the Mouse", "the committed text is back");
}

#[test]
fn broken_serialization_writes_nothing() {
    for (_dir, mut db) in [lfs_database(), git_database()] {
        copy_preamble(&mut db);
        db.set_handler("broken.txt", Box::new(Broken::default())).expect("set broken");
        let result = db.save_changes(None);
        assert!(matches!(result, Err(FolioError::Serialization(_))), "got {result:?}");
        assert!(!db.has_handler("31.txt").expect("has"));
        assert!(!db.has_handler("broken.txt").expect("has"));
        assert!(!db.root().join("database/31.txt").exists());
        assert!(!db.root().join("database_static/31.txt").exists());
        assert!(!db.has_changed(), "cleanup always runs");
    }
}

#[test]
fn git_folder_is_guarded() {
    let (_dir, mut db) = git_database();
    assert!(matches!(db.del_handler(".git"), Err(FolioError::InvalidKey(_))));
    assert!(matches!(db.get_handler(".git/config"), Err(FolioError::InvalidKey(_))));
    assert!(!db.get_handler_names("").expect("names").contains(&".git".to_string()));
}

#[test]
fn pending_sets_are_empty_after_commit() {
    let (_dir, mut db) = git_database();
    db.set_handler("a/one.txt", Box::new(TextFile::new("one"))).expect("set");
    db.set_handler("a/two.txt", Box::new(TextFile::new("two"))).expect("set");
    db.save_changes(None).expect("commit");
    db.update_handler::<TextFile, _>("a/one.txt", |t| t.set_text("uno")).expect("change");
    db.del_handler("a/two.txt").expect("del");
    assert!(db.changed().contains("a/one.txt"));
    assert!(db.removed().contains("a/two.txt"));
    db.save_changes(None).expect("commit");
    assert!(db.added().is_empty() && db.changed().is_empty() && db.removed().is_empty());
    assert_eq!(text(&mut db, "a/one.txt"), "uno");
    assert!(!db.root().join("database_static/a/two.txt").exists());
}

#[test]
fn busy_keys_are_refused() {
    let (_dir, mut db) = lfs_database();
    db.set_handler("x.txt", Box::new(TextFile::new("x"))).expect("set");
    let again = db.set_handler("x.txt", Box::new(TextFile::new("y")));
    assert!(matches!(again, Err(FolioError::Busy(_))));
    let attached = db.get_handler("x.txt").expect("get").lock().expect("lock").duplicate();
    assert!(matches!(db.set_handler("z.txt", attached), Err(FolioError::InvalidValue(_))));
}

#[test]
fn removed_files_disappear_before_commit() {
    let (_dir, mut db) = lfs_database();
    db.set_handler("f/a.txt", Box::new(TextFile::new("a"))).expect("set");
    db.set_handler("f/g/b.txt", Box::new(TextFile::new("b"))).expect("set");
    db.save_changes(None).expect("commit");

    db.del_handler("f").expect("del folder");
    assert!(!db.has_handler("f/g/b.txt").expect("has"));
    assert!(matches!(db.get_handler("f/a.txt"), Err(FolioError::NotFound(_))));
    assert!(db.get_handler_soft("f/a.txt").expect("soft").is_none());
    assert!(db.root().join("database/f/a.txt").exists(), "nothing is removed before the commit");
    db.save_changes(None).expect("commit");
    assert!(!db.root().join("database/f").exists());
}

#[test]
fn folders_copy_and_move() {
    let (_dir, mut db) = git_database();
    db.set_handler("src/a.txt", Box::new(TextFile::new("a"))).expect("set");
    db.set_handler("src/skip.bak", Box::new(TextFile::new("bak"))).expect("set");
    db.set_handler("src/sub/b.txt", Box::new(TextFile::new("b"))).expect("set");
    db.save_changes(None).expect("commit");

    db.copy_handler("src", "copy", &["*.bak"]).expect("copy");
    assert_eq!(db.get_handler_names("copy").expect("names"), vec!["a.txt", "sub"]);
    db.copy_handler("src", "src", &[]).expect("self copy is a no-op");

    db.move_handler("src", "moved").expect("move");
    assert!(!db.has_handler("src").expect("has"));
    assert_eq!(text(&mut db, "moved/sub/b.txt"), "b");
    assert!(matches!(db.move_handler("copy", "moved"), Err(FolioError::Busy(_))));
    db.save_changes(Some("copy and move")).expect("commit");

    assert!(db.root().join("database_static/copy/sub/b.txt").is_file());
    assert!(!db.root().join("database_static/copy/skip.bak").exists());
    assert!(db.root().join("database_static/moved/skip.bak").is_file());
    assert!(!db.root().join("database_static/src").exists());
}

#[test]
fn handlers_are_chosen_by_extension() {
    let (_dir, mut db) = lfs_database();
    db.set_handler("n.txt", Box::new(TextFile::new("n"))).expect("set");
    db.set_handler("n.bin", Box::new(folio::handler::File::new(vec![0u8, 1, 2]))).expect("set");
    db.save_changes(None).expect("commit");

    let mut reopened = Database::open(db.root(), Mode::ReadOnly, DatabaseConfig::lfs()).expect("reopen");
    assert!(reopened.get_handler_as::<TextFile>("n.txt").is_ok());
    assert!(reopened.get_handler_as::<folio::handler::File>("n.bin").is_ok());
    assert!(matches!(reopened.get_handler_as::<TextFile>("n.bin"), Err(FolioError::InvalidValue(_))));
    assert!(matches!(reopened.get_handler("."), Err(FolioError::InvalidValue(_))), "the root is a folder");
}

#[test]
fn read_only_refuses_writes() {
    let (_dir, mut db) = git_database();
    db.set_handler("a.txt", Box::new(TextFile::new("a"))).expect("set");
    db.save_changes(None).expect("commit");

    let mut ro = Database::open(db.root(), Mode::ReadOnly, db.config().clone()).expect("read only");
    assert_eq!(text(&mut ro, "a.txt"), "a");
    assert!(matches!(ro.set_handler("b.txt", Box::new(TextFile::new("b"))), Err(FolioError::Readonly(_))));
    assert!(matches!(ro.del_handler("a.txt"), Err(FolioError::Readonly(_))));
    assert!(matches!(ro.create_tag("t", None), Err(FolioError::Readonly(_))));
    assert!(ro.save_changes(None).expect("no-op").is_none());
}

#[test]
fn phantoms_become_files_when_touched() {
    let (_dir, mut db) = lfs_database();
    let handler = folio::handler::HandlerRef::new(Box::new(TextFile::new("ghost")));
    assert!(db.is_phantom(&handler).expect("phantom"));
    db.push_phantom("ghost.txt", &handler).expect("push");
    assert!(!db.has_handler("ghost.txt").expect("has"));
    db.touch_handler("ghost.txt", Some(&handler)).expect("touch");
    assert!(!db.is_phantom(&handler).expect("phantom"));
    assert!(db.added().contains("ghost.txt"));
    db.save_changes(None).expect("commit");
    assert!(db.root().join("database/ghost.txt").is_file());
}

#[test]
fn newer_files_are_reloaded() {
    let (_dir, mut db) = lfs_database();
    db.set_handler("sync.txt", Box::new(TextFile::new("old"))).expect("set");
    db.save_changes(None).expect("commit");
    assert_eq!(text(&mut db, "sync.txt"), "old");

    let path = db.root().join("database/sync.txt");
    std::fs::write(&path, "new").expect("write behind the database");
    std::fs::File::options()
        .write(true)
        .open(&path)
        .and_then(|f| f.set_modified(SystemTime::now() + Duration::from_secs(60)))
        .expect("bump mtime");
    assert_eq!(text(&mut db, "sync.txt"), "new");
}

#[test]
fn cache_keeps_pinned_and_dirty_handlers() {
    let config = DatabaseConfig { size_min: 2, size_max: 4, ..DatabaseConfig::lfs() };
    let (_dir, mut db) = new_database(config);
    for i in 0..8 {
        db.set_handler(&format!("f{i}.txt"), Box::new(TextFile::new(format!("{i}")))).expect("set");
    }
    db.save_changes(None).expect("commit");

    let pinned = db.pin("f0.txt").expect("pin");
    let loose = db.get_handler("f1.txt").expect("get");
    db.update_handler::<TextFile, _>("f2.txt", |t| t.set_text("dirty")).expect("change");
    for i in 3..8 {
        db.get_handler(&format!("f{i}.txt")).expect("get");
    }
    assert!(db.cache_len() <= 4, "the cache was trimmed, {} entries", db.cache_len());
    assert!(db.get_handler("f0.txt").expect("get").ptr_eq(&pinned), "pinned handlers stay");
    assert!(!db.get_handler("f1.txt").expect("get").ptr_eq(&loose), "clean handlers are evicted");
    assert_eq!(text(&mut db, "f2.txt"), "dirty", "dirty handlers stay");

    db.unpin("f0.txt").expect("unpin");
    db.save_changes(None).expect("commit");
}
