//! Folio – a versioned, transactional store of resources with a search catalog.
//!
//! Folio centers on the *resource* concept: a file identified by its
//! absolute path (`/a/b`) whose properties live in a sibling *metadata*
//! file (`a/b.metadata`), where:
//! * A [`handler::Handler`] is the in-memory form of one file, loaded lazily
//!   and written back on commit.
//! * A [`metadata::Metadata`] handler carries the class (`format`) and the
//!   typed, possibly multilingual, properties of a resource.
//! * A [`resource::ResourceClass`] declares the fields of a class and which
//!   of them the catalog indexes or stores.
//! * The [`catalog::Catalog`] answers [`query::Query`] trees with ranked
//!   [`results::SearchResults`].
//!
//! ## Modules
//! * [`database`] – The [`database::Database`]: handler cache, pending
//!   transaction, resource bookkeeping and the history API.
//! * [`backend`] – Where the bytes live: a plain folder ([`backend::lfs`]) or
//!   a Git repository plus a static folder ([`backend::git`]).
//! * [`cache`] – The LRU cache with soft bounds used for handlers and blobs.
//! * [`catalog`], [`schema`], [`tokenize`] – SQLite-backed posting lists and
//!   stored values, the field registry, and the text analysis.
//! * [`query`], [`text_query`], [`results`] – The query algebra, free text
//!   queries and paging/sorting of results.
//! * [`metadata`], [`metadata_parser`] – The content-line format of metadata
//!   files.
//! * [`worktree`], [`patches`] – Git plumbing (commits, tags, log, diff) and
//!   the per-transaction patch journal.
//! * [`config`] – [`config::DatabaseConfig`], read from `folio.toml` and
//!   `FOLIO_*` environment variables.
//!
//! ## Transactions
//! Every change is kept in memory until [`database::Database::save_changes`]:
//! the handlers are serialized first (a failure there writes nothing), then
//! the files are written, the Git backend records a commit, and finally the
//! catalog is updated. Any failure rolls the whole transaction back. Reads see
//! pending changes, so a file removed in the current transaction is already
//! gone for the caller.
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use folio::config::DatabaseConfig;
//! use folio::database::make_database;
//! use folio::datatype::FieldType;
//! use folio::metadata::MetadataProperty;
//! use folio::query::Query;
//! use folio::resource::{ResourceClassDef, ResourceField};
//!
//! let mut db = make_database("/tmp/folio", DatabaseConfig::default()).unwrap();
//! db.register_resource_class(Arc::new(
//!     ResourceClassDef::new("text/x-note")
//!         .field(ResourceField::new("title", FieldType::Unicode).indexed().stored()),
//! ))
//! .unwrap();
//! let mut metadata = db.new_metadata("text/x-note");
//! metadata.set_property("title", MetadataProperty::new("Hello world"), None).unwrap();
//! db.make_resource("/notes/hello", metadata).unwrap();
//! db.save_changes(Some("first note")).unwrap();
//! assert_eq!(db.search(Query::phrase("title", "hello")).len().unwrap(), 1);
//! ```
//!
//! ## Logging
//! The crate logs through `tracing` under the `folio::database` target and
//! never installs a subscriber.

pub mod backend;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod database;
pub mod datatype;
pub mod error;
pub mod handler;
pub mod key;
pub mod metadata;
pub mod metadata_parser;
pub mod patches;
pub mod query;
pub mod resource;
pub mod results;
pub mod schema;
pub mod text_query;
pub mod tokenize;
pub mod transaction;
pub mod worktree;
