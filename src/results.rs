//! Search results.
//!
//! A [`SearchResults`] keeps the query, not the documents: the catalog is
//! searched the first time the results are looked at, and narrowing the
//! results ([`SearchResults::search`]) builds a new query.
use std::cell::OnceCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::catalog::{Catalog, Matches};
use crate::database::Database;
use crate::datatype::{CatalogValue, Value};
use crate::error::{FolioError, Result};
use crate::query::Query;
use crate::resource::Resource;
use crate::schema::{Field, Schema};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SortBy {
    /// Relevance.
    #[default]
    None,
    Field(String),
    Fields(Vec<String>),
}

impl SortBy {
    fn names(&self) -> Vec<&str> {
        match self {
            SortBy::None => Vec::new(),
            SortBy::Field(name) => vec![name.as_str()],
            SortBy::Fields(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for SortBy {
    fn from(name: &str) -> Self {
        SortBy::Field(name.to_string())
    }
}

/// The stored values of one catalog document.
#[derive(Debug, Clone)]
pub struct Document {
    docid: u64,
    values: BTreeMap<u32, Vec<u8>>,
    schema: Arc<Schema>,
}

impl Document {
    pub fn docid(&self) -> u64 {
        self.docid
    }

    fn decode(&self, field: &Field, slot_name: &str) -> Result<Option<CatalogValue>> {
        let Some(slot) = self.schema.get_slot(slot_name) else {
            return Ok(None);
        };
        let Some(data) = self.values.get(&slot) else {
            return Ok(None);
        };
        if field.multiple {
            let list: Vec<Vec<u8>> = serde_json::from_slice(data)?;
            let list = list
                .iter()
                .map(|item| Value::from_catalog_bytes(field.datatype, item))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Some(CatalogValue::List(list)));
        }
        Ok(Some(CatalogValue::Scalar(Value::from_catalog_bytes(field.datatype, data)?)))
    }

    /// Languages stored for a multilingual field, in order.
    fn languages(&self, name: &str) -> Vec<String> {
        let start = format!("{name}_");
        self.schema
            .infos()
            .iter()
            .filter(|(_, info)| info.from.as_deref() == Some(name))
            .filter_map(|(lang_name, _)| lang_name.strip_prefix(&start).map(str::to_string))
            .collect()
    }

    /// The stored value of a field. Multilingual fields return the value in
    /// the given language or, with no language, the first language (in
    /// order) having a non-empty value.
    pub fn get_value(&self, name: &str, language: Option<&str>) -> Result<Option<CatalogValue>> {
        let Some(field) = self.schema.get_field(name).cloned() else {
            warn!(target: "folio::database", field = name, "the field is not stored");
            return Ok(None);
        };
        if !field.multilingual || field.name != name {
            return self.decode(&field, name);
        }
        if let Some(language) = language {
            return self.decode(&field, &format!("{name}_{language}"));
        }
        for language in self.languages(name) {
            let value = self.decode(&field, &format!("{name}_{language}"))?;
            if let Some(CatalogValue::Scalar(value)) = &value {
                if value.is_empty() {
                    continue;
                }
            }
            if value.is_some() {
                return Ok(value);
            }
        }
        Ok(None)
    }

    /// Shortcut for a scalar text value.
    pub fn get_str(&self, name: &str) -> Result<Option<String>> {
        Ok(match self.get_value(name, None)? {
            Some(CatalogValue::Scalar(Value::Str(s))) => Some(s),
            _ => None,
        })
    }

    pub fn abspath(&self) -> Result<String> {
        self.get_str("abspath")?
            .ok_or_else(|| FolioError::DataCorruption { message: format!("document {} has no abspath", self.docid) })
    }

    /// Raw bytes of a slot, as used for sorting.
    fn sort_key(&self, name: &str) -> Option<&[u8]> {
        let slot = self.schema.get_slot(name)?;
        self.values.get(&slot).map(Vec::as_slice)
    }
}

pub struct SearchResults {
    catalog: Arc<Mutex<Catalog>>,
    query: Query,
    matches: OnceCell<Matches>,
}

impl std::fmt::Debug for SearchResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchResults").field("query", &self.query).finish()
    }
}

impl SearchResults {
    pub fn new(catalog: Arc<Mutex<Catalog>>, query: Query) -> Self {
        Self { catalog, query, matches: OnceCell::new() }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    fn matches(&self) -> Result<&Matches> {
        if let Some(matches) = self.matches.get() {
            return Ok(matches);
        }
        let matches = self.catalog.lock()?.search(&self.query)?;
        Ok(self.matches.get_or_init(|| matches))
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.matches()?.len())
    }
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Narrows the results down to the documents also matching `query`.
    pub fn search(&self, query: Query) -> SearchResults {
        SearchResults::new(self.catalog.clone(), Query::and([self.query.clone(), query]))
    }

    /// Documents sorted by the given stored fields (relevance otherwise),
    /// skipping `start` and returning at most `size` of them (all with 0).
    pub fn get_documents(&self, sort_by: &SortBy, reverse: bool, start: usize, size: usize) -> Result<Vec<Document>> {
        let matches = self.matches()?;
        let catalog = self.catalog.lock()?;
        let schema = catalog.schema_snapshot();

        let mut keys: Vec<&str> = Vec::new();
        for name in sort_by.names() {
            if schema.get_slot(name).is_some() {
                keys.push(name);
            } else {
                warn!(target: "folio::database", field = name, "cannot sort by a field that is not stored");
            }
        }

        let load = |docid: u64| -> Result<Document> {
            Ok(Document { docid, values: catalog.get_stored_values(docid)?, schema: schema.clone() })
        };

        let mut documents;
        if keys.is_empty() {
            let mut ranked = matches.ranked();
            if reverse {
                ranked.reverse();
            }
            let end = if size == 0 { ranked.len() } else { (start + size).min(ranked.len()) };
            let page = ranked.get(start..end).unwrap_or(&[]);
            documents = page.iter().map(|docid| load(*docid)).collect::<Result<Vec<_>>>()?;
        } else {
            documents = matches.ranked().into_iter().map(load).collect::<Result<Vec<_>>>()?;
            documents.sort_by(|a, b| {
                let ordering = keys
                    .iter()
                    .map(|key| a.sort_key(key).cmp(&b.sort_key(key)))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal);
                if reverse { ordering.reverse() } else { ordering }
            });
            let end = if size == 0 { documents.len() } else { (start + size).min(documents.len()) };
            documents = documents.drain(start.min(end)..end).collect();
        }
        Ok(documents)
    }

    /// The resources of [`SearchResults::get_documents`].
    pub fn get_resources(
        &self,
        database: &mut Database,
        sort_by: &SortBy,
        reverse: bool,
        start: usize,
        size: usize,
    ) -> Result<Vec<Resource>> {
        self.get_documents(sort_by, reverse, start, size)?
            .iter()
            .map(|document| database.get_resource_from_document(document))
            .collect()
    }
}

