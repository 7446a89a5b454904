#![allow(dead_code)]

use std::sync::{Arc, Once};

use folio::config::DatabaseConfig;
use folio::database::{make_database, Database};
use folio::datatype::FieldType;
use folio::metadata::MetadataProperty;
use folio::resource::{ResourceClassDef, ResourceField};
use tempfile::TempDir;

pub const NOTE: &str = "text/x-note";

static LOGGING: Once = Once::new();

/// `RUST_LOG=folio=debug cargo test` shows the database logs.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn note_class() -> ResourceClassDef {
    ResourceClassDef::new(NOTE)
        .field(ResourceField::new("title", FieldType::Unicode).multilingual().indexed().stored())
        .field(ResourceField::new("data", FieldType::Unicode).indexed())
        .field(ResourceField::new("author", FieldType::String).indexed().stored())
        .field(ResourceField::new("year", FieldType::Integer).indexed().stored())
        .field(ResourceField::new("tags", FieldType::String).multiple().indexed())
}

/// A new database in a fresh temporary folder, with the note class.
pub fn new_database(config: DatabaseConfig) -> (TempDir, Database) {
    init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut db = make_database(dir.path().join("db"), config).expect("make database");
    db.register_resource_class(Arc::new(note_class())).expect("register class");
    (dir, db)
}

pub fn git_database() -> (TempDir, Database) {
    new_database(DatabaseConfig { patches: false, ..DatabaseConfig::default() })
}

pub fn lfs_database() -> (TempDir, Database) {
    new_database(DatabaseConfig::lfs())
}

pub fn add_note(db: &mut Database, abspath: &str, title: &str, data: &str) {
    let mut metadata = db.new_metadata(NOTE);
    metadata.set_property("title", MetadataProperty::new(title), None).expect("title");
    metadata.set_property("data", MetadataProperty::new(data), None).expect("data");
    db.make_resource(abspath, metadata).expect("make resource");
}

/// (abspath, title, author, year, data)
pub const FABLES: [(&str, &str, &str, i64, &str); 5] = [
    ("/fables/01", "The Wolf and the Lamb", "aesop", 1484,
     "a wolf came upon a lamb straying from the flock"),
    ("/fables/02", "The Fox and the Grapes", "aesop", 1484,
     "a hungry fox saw some fine bunches of grapes hanging from a vine"),
    ("/fables/03", "The Lion and the Mouse", "aesop", 1484,
     "a lion was awakened from sleep by a mouse running over his face"),
    ("/fables/04", "The Wolf and the Crane", "la fontaine", 1668,
     "a wolf had a bone stuck in his throat and hired a crane"),
    ("/fables/05", "The Crow and the Fox", "la fontaine", 1668,
     "a crow sat in a tree holding a piece of cheese in her beak, a fox passing by"),
];

pub fn add_fables(db: &mut Database) {
    for (abspath, title, author, year, data) in FABLES {
        let mut metadata = db.new_metadata(NOTE);
        metadata.set_property("title", MetadataProperty::new(title), None).expect("title");
        metadata.set_property("author", MetadataProperty::new(author), None).expect("author");
        metadata.set_property("year", MetadataProperty::new(year), None).expect("year");
        metadata.set_property("data", MetadataProperty::new(data), None).expect("data");
        db.make_resource(abspath, metadata).expect("make resource");
    }
    db.save_changes(Some("fables")).expect("commit fables");
}
