//! Resources and the class registry.
//!
//! A resource is an abspath (`/a/b`) plus the metadata handler stored at
//! `a/b.metadata`. Its class, found by the metadata `format`, declares the
//! fields the metadata may carry and which of them reach the catalog.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::datatype::{CatalogValue, CatalogValues, FieldType, Value};
use crate::error::Result;
use crate::handler::HandlerRef;
use crate::metadata::{Metadata, Property, DEFAULT_LANGUAGE};
use crate::schema::Field;

/// A field a resource class declares for its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceField {
    pub name: String,
    pub datatype: FieldType,
    pub multiple: bool,
    pub multilingual: bool,
    pub indexed: bool,
    pub stored: bool,
    /// Parameters allowed on the metadata record (besides `lang`).
    pub parameters: Vec<String>,
}

impl ResourceField {
    pub fn new(name: impl Into<String>, datatype: FieldType) -> Self {
        Self {
            name: name.into(),
            datatype,
            multiple: false,
            multilingual: false,
            indexed: false,
            stored: false,
            parameters: Vec::new(),
        }
    }
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }
    pub fn multilingual(mut self) -> Self {
        self.multilingual = true;
        self
    }
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
    pub fn stored(mut self) -> Self {
        self.stored = true;
        self
    }
    pub fn parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(name.into());
        self
    }

    /// The catalog counterpart, if the field reaches the catalog at all.
    pub fn catalog_field(&self) -> Option<Field> {
        if !self.indexed && !self.stored {
            return None;
        }
        Some(Field {
            name: self.name.clone(),
            datatype: self.datatype,
            indexed: self.indexed,
            stored: self.stored,
            multiple: self.multiple,
            multilingual: self.multilingual,
        })
    }
}

pub trait ResourceClass: Send + Sync {
    fn class_id(&self) -> &str;
    fn class_version(&self) -> Option<&str> {
        None
    }
    fn fields(&self) -> &[ResourceField];
    fn get_field(&self, name: &str) -> Option<&ResourceField> {
        self.fields().iter().find(|f| f.name == name)
    }
    /// Whether unknown metadata fields are tolerated.
    fn fields_soft(&self) -> bool {
        false
    }
    /// Adds class-specific values to what the catalog receives.
    fn catalog_values(&self, _resource: &Resource, _values: &mut CatalogValues) -> Result<()> {
        Ok(())
    }
}

/// A resource class made of a field list only.
#[derive(Debug, Clone)]
pub struct ResourceClassDef {
    class_id: String,
    class_version: Option<String>,
    fields: Vec<ResourceField>,
    fields_soft: bool,
}

impl ResourceClassDef {
    pub fn new(class_id: impl Into<String>) -> Self {
        Self { class_id: class_id.into(), class_version: None, fields: Vec::new(), fields_soft: false }
    }
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.class_version = Some(version.into());
        self
    }
    pub fn field(mut self, field: ResourceField) -> Self {
        self.fields.push(field);
        self
    }
    pub fn soft(mut self) -> Self {
        self.fields_soft = true;
        self
    }
}

impl ResourceClass for ResourceClassDef {
    fn class_id(&self) -> &str {
        &self.class_id
    }
    fn class_version(&self) -> Option<&str> {
        self.class_version.as_deref()
    }
    fn fields(&self) -> &[ResourceField] {
        &self.fields
    }
    fn fields_soft(&self) -> bool {
        self.fields_soft
    }
}

/// Class id -> resource class. Cloning shares the same registry.
#[derive(Clone)]
pub struct ResourceRegistry {
    classes: Arc<RwLock<HashMap<String, Arc<dyn ResourceClass>>>>,
    default_language: Arc<str>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LANGUAGE)
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("classes", &self.class_ids())
            .field("default_language", &self.default_language)
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new(default_language: &str) -> Self {
        Self { classes: Arc::new(RwLock::new(HashMap::new())), default_language: Arc::from(default_language) }
    }
    pub fn default_language(&self) -> &str {
        &self.default_language
    }
    pub fn register(&self, class: Arc<dyn ResourceClass>) -> Result<()> {
        self.classes.write()?.insert(class.class_id().to_string(), class);
        Ok(())
    }
    pub fn unregister(&self, class_id: &str) -> Result<Option<Arc<dyn ResourceClass>>> {
        Ok(self.classes.write()?.remove(class_id))
    }
    /// Exact class id first, then its major type (`text` for `text/plain`),
    /// then `application/octet-stream`.
    pub fn get_class(&self, class_id: &str) -> Option<Arc<dyn ResourceClass>> {
        let classes = self.classes.read().ok()?;
        if let Some(class) = classes.get(class_id) {
            return Some(class.clone());
        }
        if let Some((major, _)) = class_id.split_once('/') {
            if let Some(class) = classes.get(major) {
                return Some(class.clone());
            }
        }
        classes.get("application/octet-stream").cloned()
    }
    pub fn class_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = match self.classes.read() {
            Ok(classes) => classes.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }
}

/// A metadata handler seen through its class.
#[derive(Clone)]
pub struct Resource {
    abspath: String,
    class: Arc<dyn ResourceClass>,
    metadata: HandlerRef,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("abspath", &self.abspath)
            .field("class_id", &self.class.class_id())
            .finish()
    }
}

impl Resource {
    pub fn new(abspath: impl Into<String>, class: Arc<dyn ResourceClass>, metadata: HandlerRef) -> Self {
        Self { abspath: abspath.into(), class, metadata }
    }
    pub fn abspath(&self) -> &str {
        &self.abspath
    }
    pub fn class(&self) -> &Arc<dyn ResourceClass> {
        &self.class
    }
    pub fn class_id(&self) -> &str {
        self.class.class_id()
    }
    pub fn metadata(&self) -> &HandlerRef {
        &self.metadata
    }

    pub fn get_value(&self, name: &str, language: Option<&str>) -> Result<Option<Value>> {
        self.metadata.with::<Metadata, _>(|m| m.get_value(name, language).cloned())
    }

    /// Field name -> value, for the catalog: `abspath`, `format`, plus
    /// every indexed or stored field the metadata carries.
    pub fn get_catalog_values(&self) -> Result<CatalogValues> {
        let mut values = CatalogValues::new();
        values.insert("abspath".to_string(), CatalogValue::Scalar(Value::from(self.abspath.as_str())));
        let (format, properties) = self
            .metadata
            .with::<Metadata, _>(|m| (m.format().to_string(), m.properties().clone()))?;
        values.insert("format".to_string(), CatalogValue::Scalar(Value::from(format)));

        for field in self.class.fields().iter().filter(|f| f.indexed || f.stored) {
            let Some(property) = properties.get(&field.name) else {
                continue;
            };
            let value = match property {
                Property::Single(p) => CatalogValue::Scalar(p.value.clone()),
                Property::Multiple(ps) => {
                    CatalogValue::List(ps.iter().map(|p| p.value.clone()).collect())
                }
                Property::Multilingual(by_lang) => CatalogValue::Multilingual(
                    by_lang.iter().map(|(lang, p)| (lang.clone(), Some(p.value.clone()))).collect(),
                ),
            };
            values.insert(field.name.clone(), value);
        }
        self.class.catalog_values(self, &mut values)?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FolioError;

    #[test]
    fn class_lookup_falls_back() {
        let registry = ResourceRegistry::default();
        registry.register(Arc::new(ResourceClassDef::new("text"))).unwrap();
        registry.register(Arc::new(ResourceClassDef::new("application/octet-stream"))).unwrap();
        assert_eq!(registry.get_class("text/plain").map(|c| c.class_id().to_string()).as_deref(), Some("text"));
        assert_eq!(
            registry.get_class("image/png").map(|c| c.class_id().to_string()).as_deref(),
            Some("application/octet-stream")
        );
        assert!(registry.unregister("application/octet-stream").unwrap().is_some());
        assert!(registry.get_class("image/png").is_none());
    }

    #[test]
    fn poisoned_registry_is_reported() {
        let registry = ResourceRegistry::default();
        let classes = registry.classes.clone();
        let _ = std::thread::spawn(move || {
            let _guard = classes.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        let result = registry.register(Arc::new(ResourceClassDef::new("text")));
        assert!(matches!(result, Err(FolioError::Lock(_))), "got {result:?}");
        assert!(registry.unregister("text").is_err());
    }
}
