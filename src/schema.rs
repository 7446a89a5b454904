//! Catalog fields and their allocation.
//!
//! Every stored field owns a value slot and every indexed field owns a term
//! prefix. Slots and prefixes are handed out in order the first time a
//! field is seen and never change afterwards; the allocation is persisted
//! by the catalog (see [`Schema::to_json`]).
use std::collections::{BTreeMap, HashMap};

// name <-> prefix
use bimap::BiMap;
use serde::{Deserialize, Serialize};

use crate::cache::OtherHasher;
use crate::datatype::FieldType;
use crate::error::{FolioError, Result};

const MAGIC_LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPRSTUVWY";

/// `Q` marks document identities and `X` long prefixes, so neither is in
/// the alphabet.
pub fn get_prefix(number: usize) -> String {
    let size = MAGIC_LETTERS.len();
    let mut prefix = "X".repeat(number / size);
    prefix.push(MAGIC_LETTERS[number % size] as char);
    prefix
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub datatype: FieldType,
    pub indexed: bool,
    pub stored: bool,
    pub multiple: bool,
    pub multilingual: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, datatype: FieldType) -> Self {
        Self {
            name: name.into(),
            datatype,
            indexed: false,
            stored: false,
            multiple: false,
            multilingual: false,
        }
    }
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
    pub fn stored(mut self) -> Self {
        self.stored = true;
        self
    }
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }
    pub fn multilingual(mut self) -> Self {
        self.multilingual = true;
        self
    }
}

/// What the catalog remembers about a field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prefix: Option<String>,
    /// Set on `<name>_<lang>` entries, naming the multilingual field.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Schema {
    fields: HashMap<String, Field, OtherHasher>,
    infos: BTreeMap<String, FieldInfo>,
    prefixes: BiMap<String, String>,
    value_nb: u32,
    prefix_nb: usize,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    pub fn new() -> Self {
        let mut schema = Self {
            fields: HashMap::default(),
            infos: BTreeMap::new(),
            prefixes: BiMap::new(),
            value_nb: 0,
            prefix_nb: 0,
        };
        for field in default_fields() {
            schema.fields.insert(field.name.clone(), field);
        }
        schema
    }

    /// Restores the allocation persisted by [`Schema::to_json`]. Declared
    /// fields are kept.
    pub fn load_json(&mut self, data: &str) -> Result<()> {
        let infos: BTreeMap<String, FieldInfo> = serde_json::from_str(data)?;
        self.infos = BTreeMap::new();
        self.prefixes = BiMap::new();
        self.value_nb = 0;
        self.prefix_nb = 0;
        for (name, info) in infos {
            if let Some(value) = info.value {
                self.value_nb = self.value_nb.max(value + 1);
            }
            if let Some(prefix) = &info.prefix {
                self.prefixes.insert(name.clone(), prefix.clone());
                self.prefix_nb += 1;
            }
            self.infos.insert(name, info);
        }
        Ok(())
    }
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.infos)?)
    }

    /// Forgets every allocation, keeping the declared fields.
    pub fn clear_allocation(&mut self) {
        self.infos.clear();
        self.prefixes = BiMap::new();
        self.value_nb = 0;
        self.prefix_nb = 0;
    }

    /// Declares a field and allocates its slot and prefix. Returns whether
    /// the allocation changed (and must be persisted).
    pub fn register_field(&mut self, field: Field) -> Result<bool> {
        if field.name == "abspath"
            && !(field.datatype == FieldType::String && field.stored && field.indexed && !field.multiple)
        {
            return Err(FolioError::SchemaConflict(
                "the abspath field must be declared as a stored and indexed string".to_string(),
            ));
        }
        if field.multiple && field.multilingual {
            return Err(FolioError::SchemaConflict(format!(
                "the '{}' field cannot be both multiple and multilingual",
                field.name
            )));
        }
        if let Some(existing) = self.fields.get(&field.name) {
            if existing != &field {
                return Err(FolioError::SchemaConflict(format!(
                    "the '{}' field is already registered with different settings",
                    field.name
                )));
            }
        }
        let changed = self.allocate(&field.name, field.stored, field.indexed, None);
        self.fields.insert(field.name.clone(), field);
        Ok(changed)
    }

    /// Allocates the missing slot and prefix of an entry.
    fn allocate(&mut self, name: &str, stored: bool, indexed: bool, from: Option<&str>) -> bool {
        let mut changed = !self.infos.contains_key(name);
        let mut value_nb = self.value_nb;
        let mut new_prefix = None;
        let info = self.infos.entry(name.to_string()).or_default();
        if stored && info.value.is_none() {
            info.value = Some(value_nb);
            value_nb += 1;
            changed = true;
        }
        if indexed && info.prefix.is_none() {
            let prefix = get_prefix(self.prefix_nb);
            info.prefix = Some(prefix.clone());
            new_prefix = Some(prefix);
            changed = true;
        }
        if let Some(from) = from {
            info.from = Some(from.to_string());
        }
        self.value_nb = value_nb;
        if let Some(prefix) = new_prefix {
            self.prefixes.insert(name.to_string(), prefix);
            self.prefix_nb += 1;
        }
        changed
    }

    /// Allocates a declared field that has no slot or prefix yet (after an
    /// aborted registration, or a re-init). Returns whether anything changed.
    pub fn ensure_allocated(&mut self, name: &str) -> bool {
        match self.fields.get(name) {
            Some(field) => {
                let (stored, indexed) = (field.stored, field.indexed);
                self.allocate(name, stored, indexed, None)
            }
            None => false,
        }
    }

    /// Re-allocates every declared field, in name order.
    pub fn allocate_declared(&mut self) -> bool {
        let mut names: Vec<String> = self.fields.keys().cloned().collect();
        names.sort();
        let mut changed = false;
        for name in names {
            changed |= self.ensure_allocated(&name);
        }
        changed
    }

    /// Makes sure the `<name>_<lang>` entry of a multilingual field exists.
    /// Returns its name and whether the allocation changed.
    pub fn ensure_language(&mut self, name: &str, language: &str) -> Result<(String, bool)> {
        let field = self
            .fields
            .get(name)
            .ok_or_else(|| FolioError::NotFound(format!("the '{name}' field is not registered")))?;
        let (stored, indexed) = (field.stored, field.indexed);
        let lang_name = format!("{name}_{language}");
        let changed = self.allocate(&lang_name, stored, indexed, Some(name));
        Ok((lang_name, changed))
    }

    /// The declared field, following `from` for language entries.
    pub fn get_field(&self, name: &str) -> Option<&Field> {
        if let Some(field) = self.fields.get(name) {
            return Some(field);
        }
        let from = self.infos.get(name)?.from.as_deref()?;
        self.fields.get(from)
    }
    pub fn get_info(&self, name: &str) -> Option<&FieldInfo> {
        self.infos.get(name)
    }
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }
    pub fn infos(&self) -> &BTreeMap<String, FieldInfo> {
        &self.infos
    }
    pub fn get_prefix(&self, name: &str) -> Option<&str> {
        self.prefixes.get_by_left(name).map(String::as_str)
    }
    /// Which field owns a prefix.
    pub fn get_name_by_prefix(&self, prefix: &str) -> Option<&str> {
        self.prefixes.get_by_right(prefix).map(String::as_str)
    }
    pub fn get_slot(&self, name: &str) -> Option<u32> {
        self.infos.get(name)?.value
    }
}

fn default_fields() -> [Field; 2] {
    [
        Field::new("abspath", FieldType::String).stored().indexed(),
        Field::new("format", FieldType::String).stored().indexed(),
    ]
}
