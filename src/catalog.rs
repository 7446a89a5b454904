//! The search catalog: an inverted index plus stored values, kept in SQLite.
//!
//! Every document has an identity term (`Q` followed by its reduced
//! abspath), postings `(prefix + token, position)` for its indexed fields,
//! and one blob per stored field slot. The slot and prefix allocation
//! ([`Schema`]) is persisted as JSON in the `Metadata` table.
//!
//! Writes happen inside an open SQLite transaction: [`Catalog::save_changes`]
//! commits it, [`Catalog::abort_changes`] rolls it back.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

// used for persistence
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
// used for sets of documents
use roaring::RoaringTreemap;
use tracing::{debug, info, warn};

use crate::cache::OtherHasher;
use crate::datatype::{CatalogValue, CatalogValues, FieldType, Value};
use crate::error::{FolioError, Result};
use crate::query::{Query, QueryFolder};
use crate::schema::{Field, Schema};
use crate::text_query::{parse_text_query, Clause, Modifier, Term};
use crate::tokenize::{postings, reduce_size};

const METADATA_KEY: &str = "metadata";
/// Language used to tokenize phrases and non-multilingual values.
pub const INDEX_LANGUAGE: &str = "en";

/// Documents matched by a query, with their relevance.
#[derive(Debug, Clone, Default)]
pub struct Matches {
    pub docs: RoaringTreemap,
    pub scores: HashMap<u64, f64, OtherHasher>,
}

impl Matches {
    pub fn empty() -> Self {
        Self::default()
    }
    pub fn from_docs(docs: RoaringTreemap) -> Self {
        Self { docs, scores: HashMap::default() }
    }
    pub fn len(&self) -> u64 {
        self.docs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
    pub fn score(&self, docid: u64) -> f64 {
        self.scores.get(&docid).copied().unwrap_or(0.0)
    }

    pub fn intersect(mut self, other: Matches) -> Self {
        self.docs &= &other.docs;
        let docs = &self.docs;
        self.scores.retain(|docid, _| docs.contains(*docid));
        for (docid, score) in other.scores {
            if self.docs.contains(docid) {
                *self.scores.entry(docid).or_insert(0.0) += score;
            }
        }
        self
    }
    pub fn union(mut self, other: Matches) -> Self {
        self.docs |= &other.docs;
        for (docid, score) in other.scores {
            *self.scores.entry(docid).or_insert(0.0) += score;
        }
        self
    }
    pub fn difference(mut self, other: &Matches) -> Self {
        self.docs -= &other.docs;
        let docs = &self.docs;
        self.scores.retain(|docid, _| docs.contains(*docid));
        self
    }
    /// Adds the scores of `other` to the documents already matched.
    pub fn boost(mut self, other: &Matches) -> Self {
        for (docid, score) in &other.scores {
            if self.docs.contains(*docid) {
                *self.scores.entry(*docid).or_insert(0.0) += score;
            }
        }
        self
    }

    /// Document ids by decreasing relevance, ties by increasing id.
    pub fn ranked(&self) -> Vec<u64> {
        let mut docs: Vec<u64> = self.docs.iter().collect();
        docs.sort_by(|a, b| {
            self.score(*b)
                .partial_cmp(&self.score(*a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(b))
        });
        docs
    }
}

/// The smallest byte string greater than every string starting with
/// `data`, or `None` when there is none (`data` is empty or all `0xff`).
pub fn succ(data: &[u8]) -> Option<Vec<u8>> {
    let mut end = data.to_vec();
    while end.last() == Some(&0xff) {
        end.pop();
    }
    let last = end.last_mut()?;
    *last += 1;
    Some(end)
}

fn identity_term(abspath: &str) -> Vec<u8> {
    let mut term = b"Q".to_vec();
    term.extend(reduce_size(abspath.as_bytes()));
    term
}

fn coerce_all(field: &Field, values: &[&Value]) -> Result<Vec<Value>> {
    values.iter().map(|value| field.datatype.coerce(value)).collect()
}

fn warn_not_indexed(name: &str) {
    warn!(target: "folio::database", field = name, "the field is not indexed nor stored");
}

pub struct Catalog {
    connection: Connection,
    read_only: bool,
    schema: Arc<Schema>,
    nb_changes: usize,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("read_only", &self.read_only)
            .field("nb_changes", &self.nb_changes)
            .finish()
    }
}

impl Catalog {
    /// Opens (or creates, in read-write mode) the catalog stored in `path`.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let connection = if read_only {
            Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
        } else {
            Connection::open(path)?
        };
        Self::with_connection(connection, read_only)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, false)
    }

    fn with_connection(connection: Connection, read_only: bool) -> Result<Self> {
        if !read_only {
            connection.execute_batch(
                "
            create table if not exists Metadata (
                Name text not null,
                Value text not null,
                constraint referenceable_Metadata_Name primary key (
                    Name
                )
            );
            create table if not exists Document (
                Document_Identity integer not null,
                Identity_Term blob not null,
                constraint referenceable_Document_Identity primary key (
                    Document_Identity
                ),
                constraint unique_Identity_Term unique (
                    Identity_Term
                )
            );
            create table if not exists Posting (
                Term blob not null,
                Document_Identity integer not null,
                Position integer not null,
                constraint Posting_in_Document foreign key (
                    Document_Identity
                ) references Document(Document_Identity)
            );
            create index if not exists Posting_by_Term on Posting (
                Term,
                Document_Identity
            );
            create index if not exists Posting_by_Document on Posting (
                Document_Identity
            );
            create table if not exists StoredValue (
                Document_Identity integer not null,
                Slot integer not null,
                Data blob not null,
                constraint StoredValue_of_Document foreign key (
                    Document_Identity
                ) references Document(Document_Identity),
                constraint unique_StoredValue primary key (
                    Document_Identity,
                    Slot
                )
            );
            create index if not exists StoredValue_by_Slot on StoredValue (
                Slot,
                Data
            );
            begin;
            ",
            )?;
        }
        let mut catalog = Self { connection, read_only, schema: Arc::new(Schema::new()), nb_changes: 0 };
        catalog.load_all_internal()?;
        Ok(catalog)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
    /// A snapshot of the schema, for documents living outside the lock.
    pub fn schema_snapshot(&self) -> Arc<Schema> {
        self.schema.clone()
    }
    pub fn nb_changes(&self) -> usize {
        self.nb_changes
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(FolioError::Readonly("the catalog is opened read-only".to_string()));
        }
        Ok(())
    }

    /// Reads the field allocation back. Unreadable metadata is rebuilt
    /// from the declared fields.
    fn load_all_internal(&mut self) -> Result<()> {
        let data: Option<String> = self
            .connection
            .query_row("select Value from Metadata where Name = ?", params![METADATA_KEY], |r| r.get(0))
            .optional()
            .or_else(|e| match e {
                // a read-only catalog that was never written
                rusqlite::Error::SqliteFailure(_, _) if self.read_only => Ok(None),
                e => Err(e),
            })?;
        let schema = Arc::make_mut(&mut self.schema);
        match data {
            None => schema.clear_allocation(),
            Some(data) => {
                if let Err(e) = schema.load_json(&data) {
                    warn!(target: "folio::database", error = %e, "unreadable catalog metadata, rebuilding it");
                    schema.clear_allocation();
                    schema.allocate_declared();
                    if !self.read_only {
                        self.save_metadata()?;
                    }
                }
            }
        }
        Ok(())
    }

    fn save_metadata(&mut self) -> Result<()> {
        self.check_writable()?;
        let data = self.schema.to_json()?;
        self.connection.execute(
            "insert or replace into Metadata (Name, Value) values (?, ?)",
            params![METADATA_KEY, data],
        )?;
        Ok(())
    }

    /// Declares a field, allocating and persisting its slot and prefix.
    pub fn register_field(&mut self, field: Field) -> Result<()> {
        let changed = Arc::make_mut(&mut self.schema).register_field(field)?;
        if changed && !self.read_only {
            self.save_metadata()?;
        }
        Ok(())
    }

    fn find_document(&self, abspath: &str) -> Result<Option<u64>> {
        Ok(self
            .connection
            .query_row(
                "select Document_Identity from Document where Identity_Term = ?",
                params![identity_term(abspath)],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .map(|docid| docid as u64))
    }

    fn delete_document(&self, docid: u64) -> Result<()> {
        let docid = docid as i64;
        self.connection.execute("delete from Posting where Document_Identity = ?", params![docid])?;
        self.connection.execute("delete from StoredValue where Document_Identity = ?", params![docid])?;
        self.connection.execute("delete from Document where Document_Identity = ?", params![docid])?;
        Ok(())
    }

    fn add_postings(&self, docid: i64, prefix: &str, field: &Field, values: &[&Value], language: &str) -> Result<()> {
        let values = coerce_all(field, values)?;
        let values: Vec<&Value> = values.iter().collect();
        let mut insert = self
            .connection
            .prepare_cached("insert into Posting (Term, Document_Identity, Position) values (?, ?, ?)")?;
        for (token, position) in postings(field.datatype, &values, language) {
            let mut term = prefix.as_bytes().to_vec();
            term.extend(token);
            insert.execute(params![term, docid, position])?;
        }
        Ok(())
    }

    fn add_value(&self, docid: i64, slot: u32, field: &Field, values: &[&Value]) -> Result<()> {
        let values = coerce_all(field, values)?;
        let data = if field.multiple {
            let encoded: Vec<Vec<u8>> = values.iter().map(|v| v.to_catalog_bytes()).collect();
            serde_json::to_vec(&encoded)?
        } else {
            match values.first() {
                Some(value) => value.to_catalog_bytes(),
                None => return Ok(()),
            }
        };
        self.connection.execute(
            "insert or replace into StoredValue (Document_Identity, Slot, Data) values (?, ?, ?)",
            params![docid, slot, data],
        )?;
        Ok(())
    }

    /// Indexes the values of one resource, replacing the document with the
    /// same abspath if there is one.
    pub fn index_document(&mut self, values: &CatalogValues) -> Result<()> {
        self.check_writable()?;
        let abspath = match values.get("abspath") {
            Some(CatalogValue::Scalar(Value::Str(abspath))) => abspath.clone(),
            _ => return Err(FolioError::InvalidValue("the abspath value is missing".to_string())),
        };
        if let Some(docid) = self.find_document(&abspath)? {
            self.delete_document(docid)?;
        }
        self.connection.execute(
            "insert into Document (Identity_Term) values (?)",
            params![identity_term(&abspath)],
        )?;
        let docid = self.connection.last_insert_rowid();

        let mut metadata_changed = false;
        for (name, value) in values {
            let Some(field) = self.schema.get_field(name).cloned() else {
                warn_not_indexed(name);
                continue;
            };
            metadata_changed |= Arc::make_mut(&mut self.schema).ensure_allocated(name);
            let info = self.schema.get_info(name).cloned().unwrap_or_default();
            match value {
                CatalogValue::Multilingual(by_lang) => {
                    for (language, lang_value) in by_lang {
                        let (lang_name, changed) =
                            Arc::make_mut(&mut self.schema).ensure_language(name, language)?;
                        metadata_changed |= changed;
                        let Some(lang_value) = lang_value else { continue };
                        let lang_info = self.schema.get_info(&lang_name).cloned().unwrap_or_default();
                        if let Some(slot) = lang_info.value {
                            self.add_value(docid, slot, &field, &[lang_value])?;
                        }
                        if let Some(lang_prefix) = &lang_info.prefix {
                            if let Some(prefix) = &info.prefix {
                                self.add_postings(docid, prefix, &field, &[lang_value], language)?;
                            }
                            self.add_postings(docid, lang_prefix, &field, &[lang_value], language)?;
                        }
                    }
                }
                CatalogValue::Scalar(value) => {
                    if let Some(slot) = info.value {
                        self.add_value(docid, slot, &field, &[value])?;
                    }
                    if let Some(prefix) = &info.prefix {
                        self.add_postings(docid, prefix, &field, &[value], INDEX_LANGUAGE)?;
                    }
                }
                CatalogValue::List(list) => {
                    if !field.multiple {
                        return Err(FolioError::InvalidValue(format!(
                            "the '{name}' field is not multiple, cannot index a list"
                        )));
                    }
                    let list: Vec<&Value> = list.iter().collect();
                    if let Some(slot) = info.value {
                        self.add_value(docid, slot, &field, &list)?;
                    }
                    if let Some(prefix) = &info.prefix {
                        self.add_postings(docid, prefix, &field, &list, INDEX_LANGUAGE)?;
                    }
                }
            }
        }
        if metadata_changed {
            self.save_metadata()?;
        }
        self.nb_changes += 1;
        debug!(target: "folio::database", abspath = %abspath, "indexed");
        Ok(())
    }

    /// Removes the document of the given abspath; a missing document is
    /// not an error.
    pub fn unindex_document(&mut self, abspath: &str) -> Result<()> {
        self.check_writable()?;
        if let Some(docid) = self.find_document(abspath)? {
            self.delete_document(docid)?;
        }
        self.nb_changes += 1;
        debug!(target: "folio::database", abspath = %abspath, "unindexed");
        Ok(())
    }

    /// Commits the pending edits.
    pub fn save_changes(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.connection.execute_batch("commit; begin;")?;
        if self.nb_changes > 0 {
            info!(target: "folio::database", changes = self.nb_changes, "catalog saved");
        }
        self.nb_changes = 0;
        Ok(())
    }

    /// Drops the pending edits and reloads the field allocation.
    pub fn abort_changes(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.connection.execute_batch("rollback; begin;")?;
        self.nb_changes = 0;
        self.load_all_internal()
    }

    /// Commits what is pending and closes the connection.
    pub fn close(self) -> Result<()> {
        if !self.read_only {
            self.connection.execute_batch("commit;")?;
        }
        self.connection.close().map_err(|(_, e)| e.into())
    }

    pub fn doc_count(&self) -> Result<u64> {
        let count: i64 = self.connection.query_row("select count(*) from Document", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Every term indexed for a field, without its prefix.
    pub fn get_unique_values(&self, name: &str) -> Result<BTreeSet<String>> {
        let Some(info) = self.schema.get_info(name) else {
            warn_not_indexed(name);
            return Ok(BTreeSet::new());
        };
        let Some(prefix) = &info.prefix else {
            return Err(FolioError::InvalidQuery(format!("the field '{name}' must be indexed")));
        };
        let start = prefix.as_bytes().to_vec();
        let end = succ(&start).unwrap_or_default();
        let mut statement = self
            .connection
            .prepare("select distinct Term from Posting where Term >= ? and Term < ?")?;
        let terms = statement
            .query_map(params![start, end], |r| r.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(terms
            .into_iter()
            .map(|term| String::from_utf8_lossy(&term[prefix.len()..]).into_owned())
            .collect())
    }

    /// The stored values of a document, by slot.
    pub fn get_stored_values(&self, docid: u64) -> Result<BTreeMap<u32, Vec<u8>>> {
        let mut statement = self
            .connection
            .prepare_cached("select Slot, Data from StoredValue where Document_Identity = ?")?;
        let rows = statement
            .query_map(params![docid as i64], |r| Ok((r.get::<_, u32>(0)?, r.get::<_, Vec<u8>>(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(rows)
    }

    pub fn search(&self, query: &Query) -> Result<Matches> {
        let mut evaluator = Evaluator { catalog: self, doc_count: self.doc_count()? };
        query.fold(&mut evaluator)
    }

    fn all_documents(&self) -> Result<RoaringTreemap> {
        let mut statement = self.connection.prepare_cached("select Document_Identity from Document")?;
        let docs = statement
            .query_map([], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs.into_iter().map(|d| d as u64).collect())
    }

    /// docid -> positions, for every term in `[start, end)`.
    fn positions_between(&self, start: &[u8], end: Option<&[u8]>) -> Result<HashMap<u64, Vec<u32>, OtherHasher>> {
        let rows = match end {
            Some(end) => {
                let mut statement = self.connection.prepare_cached(
                    "select Document_Identity, Position from Posting where Term >= ? and Term < ?",
                )?;
                statement
                    .query_map(params![start, end], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, u32>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut statement = self
                    .connection
                    .prepare_cached("select Document_Identity, Position from Posting where Term = ?")?;
                statement
                    .query_map(params![start], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, u32>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        let mut positions: HashMap<u64, Vec<u32>, OtherHasher> = HashMap::default();
        for (docid, position) in rows {
            positions.entry(docid as u64).or_default().push(position);
        }
        Ok(positions)
    }

    fn stored_between(
        &self,
        slot: u32,
        left: Option<&[u8]>,
        right: Option<&[u8]>,
        right_open: bool,
    ) -> Result<RoaringTreemap> {
        let mut sql = String::from("select Document_Identity from StoredValue where Slot = ?");
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&slot];
        if let Some(left) = &left {
            sql.push_str(" and Data >= ?");
            values.push(left);
        }
        if let Some(right) = &right {
            sql.push_str(if right_open { " and Data < ?" } else { " and Data <= ?" });
            values.push(right);
        }
        let mut statement = self.connection.prepare(&sql)?;
        let docs = statement
            .query_map(values.as_slice(), |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs.into_iter().map(|d| d as u64).collect())
    }
}

struct Evaluator<'a> {
    catalog: &'a Catalog,
    doc_count: u64,
}

impl Evaluator<'_> {
    fn weight(&self, tf: usize, df: usize) -> f64 {
        if df == 0 {
            return 0.0;
        }
        tf as f64 * (1.0 + self.doc_count as f64 / df as f64).ln()
    }

    fn term_matches(&self, term: &[u8]) -> Result<Matches> {
        let positions = self.catalog.positions_between(term, None)?;
        Ok(self.to_matches(&positions))
    }

    fn prefix_matches(&self, prefix: &[u8]) -> Result<Matches> {
        let end = succ(prefix);
        let positions = self.catalog.positions_between(prefix, Some(end.as_deref().unwrap_or(&[0xff])))?;
        Ok(self.to_matches(&positions))
    }

    fn to_matches(&self, positions: &HashMap<u64, Vec<u32>, OtherHasher>) -> Matches {
        let df = positions.len();
        let mut matches = Matches::empty();
        for (docid, found) in positions {
            matches.docs.insert(*docid);
            matches.scores.insert(*docid, self.weight(found.len(), df));
        }
        matches
    }

    /// Documents where the terms appear at the given relative positions.
    fn phrase_matches(&self, terms: &[(Vec<u8>, u32)]) -> Result<Matches> {
        let Some((first, first_position)) = terms.first() else {
            return Ok(Matches::empty());
        };
        if terms.len() == 1 {
            return self.term_matches(first);
        }
        let mut candidates = self.catalog.positions_between(first, None)?;
        let mut score = Matches::empty();
        for (term, position) in terms {
            let offset = position - first_position;
            let positions = self.catalog.positions_between(term, None)?;
            score = score.union(self.to_matches(&positions));
            candidates.retain(|docid, starts| {
                let Some(found) = positions.get(docid) else { return false };
                starts.retain(|start| found.contains(&(start + offset)));
                !starts.is_empty()
            });
        }
        let docs: RoaringTreemap = candidates.keys().copied().collect();
        Ok(Matches::from_docs(docs).boost(&score))
    }

    /// The prefix of an indexed field, `None` when the field is unknown.
    fn indexed_prefix(&self, name: &str) -> Result<Option<String>> {
        let Some(info) = self.catalog.schema.get_info(name) else {
            warn_not_indexed(name);
            return Ok(None);
        };
        match &info.prefix {
            Some(prefix) => Ok(Some(prefix.clone())),
            None => Err(FolioError::InvalidQuery(format!("the field '{name}' must be indexed"))),
        }
    }

    /// The slot of a stored field, `None` when the field is unknown.
    fn stored_slot(&self, name: &str) -> Result<Option<(u32, Field)>> {
        let Some(info) = self.catalog.schema.get_info(name) else {
            warn_not_indexed(name);
            return Ok(None);
        };
        let Some(slot) = info.value else {
            return Err(FolioError::InvalidQuery(format!("the field '{name}' must be stored")));
        };
        let field = self.field(name);
        Ok(Some((slot, field)))
    }

    /// The language of a `<name>_<lang>` entry, the index language otherwise.
    fn language<'n>(&self, name: &'n str) -> &'n str {
        self.catalog
            .schema
            .get_info(name)
            .and_then(|info| info.from.as_deref())
            .and_then(|from| name.strip_prefix(from))
            .and_then(|suffix| suffix.strip_prefix('_'))
            .unwrap_or(INDEX_LANGUAGE)
    }

    fn field(&self, name: &str) -> Field {
        self.catalog
            .schema
            .get_field(name)
            .cloned()
            .unwrap_or_else(|| Field::new(name, FieldType::String))
    }

    fn clause_matches(&self, prefix: &str, clause: &Clause) -> Result<Matches> {
        match &clause.term {
            Term::Words(words) => {
                let terms: Vec<(Vec<u8>, u32)> = words
                    .iter()
                    .enumerate()
                    .map(|(i, word)| {
                        let mut term = prefix.as_bytes().to_vec();
                        term.extend(word.as_bytes());
                        (term, i as u32 + 1)
                    })
                    .collect();
                self.phrase_matches(&terms)
            }
            Term::Prefix(start) => {
                let mut term = prefix.as_bytes().to_vec();
                term.extend(start.as_bytes());
                self.prefix_matches(&term)
            }
        }
    }
}

impl QueryFolder for Evaluator<'_> {
    type Output = Matches;

    fn all(&mut self) -> Result<Matches> {
        Ok(Matches::from_docs(self.catalog.all_documents()?))
    }

    fn phrase(&mut self, name: &str, value: &Value) -> Result<Matches> {
        let Some(prefix) = self.indexed_prefix(name)? else {
            return Ok(Matches::empty());
        };
        let field = self.field(name);
        let value = field.datatype.coerce(value)?;
        let mut terms: Vec<(Vec<u8>, u32)> = postings(field.datatype, &[&value], self.language(name))
            .into_iter()
            .map(|(token, position)| {
                let mut term = prefix.as_bytes().to_vec();
                term.extend(token);
                (term, position)
            })
            .collect();
        terms.sort_by_key(|(_, position)| *position);
        self.phrase_matches(&terms)
    }

    fn range(&mut self, name: &str, left: Option<&Value>, right: Option<&Value>) -> Result<Matches> {
        let Some((slot, field)) = self.stored_slot(name)? else {
            return Ok(Matches::empty());
        };
        if field.multiple {
            return Err(FolioError::InvalidQuery(format!(
                "range queries are not supported on the multiple field '{name}'"
            )));
        }
        let left = left.map(|v| field.datatype.coerce(v)).transpose()?.map(|v| v.to_catalog_bytes());
        let right = right.map(|v| field.datatype.coerce(v)).transpose()?.map(|v| v.to_catalog_bytes());
        if left.is_none() && right.is_none() {
            return self.all();
        }
        let docs = self.catalog.stored_between(slot, left.as_deref(), right.as_deref(), false)?;
        Ok(Matches::from_docs(docs))
    }

    fn start(&mut self, name: &str, value: &Value) -> Result<Matches> {
        let Some((slot, field)) = self.stored_slot(name)? else {
            return Ok(Matches::empty());
        };
        let start = field.datatype.coerce(value)?.to_catalog_bytes();
        if start.is_empty() {
            return self.all();
        }
        let end = succ(&start);
        let docs = self.catalog.stored_between(slot, Some(&start), end.as_deref(), true)?;
        Ok(Matches::from_docs(docs))
    }

    fn text(&mut self, name: &str, value: &str) -> Result<Matches> {
        let Some(prefix) = self.indexed_prefix(name)? else {
            return Ok(Matches::empty());
        };
        let clauses = parse_text_query(value, self.language(name))?;
        let mut required: Option<Matches> = None;
        let mut optional: Option<Matches> = None;
        let mut excluded = Matches::empty();
        for clause in &clauses {
            let matches = self.clause_matches(&prefix, clause)?;
            match clause.modifier {
                Some(Modifier::Required) => {
                    required = Some(match required {
                        Some(r) => r.intersect(matches),
                        None => matches,
                    })
                }
                Some(Modifier::Excluded) => excluded = excluded.union(matches),
                None => {
                    optional = Some(match optional {
                        Some(o) => o.union(matches),
                        None => matches,
                    })
                }
            }
        }
        let result = match (required, optional) {
            (Some(required), Some(optional)) => required.boost(&optional),
            (Some(required), None) => required,
            (None, Some(optional)) => optional,
            (None, None) => Matches::empty(),
        };
        Ok(result.difference(&excluded))
    }

    fn not(&mut self, inner: Matches) -> Result<Matches> {
        Ok(self.all()?.difference(&inner))
    }

    fn and(&mut self, atoms: Vec<Matches>) -> Result<Matches> {
        let mut atoms = atoms.into_iter();
        let Some(first) = atoms.next() else {
            return Ok(Matches::empty());
        };
        Ok(atoms.fold(first, Matches::intersect))
    }

    fn or(&mut self, atoms: Vec<Matches>) -> Result<Matches> {
        Ok(atoms.into_iter().fold(Matches::empty(), Matches::union))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succ_of_byte_strings() {
        assert_eq!(succ(b"toto"), Some(b"totp".to_vec()));
        assert_eq!(succ(&[b'a', 0xff, 0xff]), Some(b"b".to_vec()));
        assert_eq!(succ(&[0xff]), None);
        assert_eq!(succ(b""), None);
    }

    #[test]
    fn ranking_breaks_ties_by_docid() {
        let mut matches = Matches::empty();
        for (docid, score) in [(3, 1.0), (1, 2.0), (2, 1.0)] {
            matches.docs.insert(docid);
            matches.scores.insert(docid, score);
        }
        assert_eq!(matches.ranked(), vec![1, 2, 3]);
    }
}
