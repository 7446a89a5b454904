//! The metadata handler, the file half of a resource.
//!
//! The first record names the resource class (`format`), the following ones
//! carry the properties. How a property is parsed (datatype, single,
//! multiple or multilingual, allowed parameters) is decided by the class
//! fields found through the [`ResourceRegistry`].
use std::any::Any;
use std::collections::BTreeMap;

use tracing::warn;

use crate::datatype::{FieldType, Value};
use crate::error::{FolioError, Result};
use crate::handler::{Handler, HandlerState};
use crate::metadata_parser::{read_content_lines, write_content_line, Parameters};
use crate::resource::{ResourceField, ResourceRegistry};

pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataProperty {
    pub value: Value,
    /// Parameters other than `lang`.
    pub parameters: Parameters,
}

impl MetadataProperty {
    pub fn new(value: impl Into<Value>) -> Self {
        Self { value: value.into(), parameters: Parameters::new() }
    }
    pub fn with_parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters.entry(name.to_string()).or_default().push(value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Single(MetadataProperty),
    Multiple(Vec<MetadataProperty>),
    /// language -> property
    Multilingual(BTreeMap<String, MetadataProperty>),
}

#[derive(Clone)]
pub struct Metadata {
    state: HandlerState,
    format: String,
    version: Option<String>,
    properties: BTreeMap<String, Property>,
    registry: Option<ResourceRegistry>,
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metadata")
            .field("state", &self.state)
            .field("format", &self.format)
            .field("version", &self.version)
            .field("properties", &self.properties)
            .finish()
    }
}

impl Metadata {
    pub const CLASS_ID: &'static str = "text/x-metadata";

    /// A new, detached metadata for a resource of the given class.
    pub fn new(format: impl Into<String>, registry: Option<ResourceRegistry>) -> Self {
        let format = format.into();
        let version = registry
            .as_ref()
            .and_then(|r| r.get_class(&format))
            .and_then(|class| class.class_version().map(str::to_string));
        Self {
            state: HandlerState::phantom(),
            format,
            version,
            properties: BTreeMap::new(),
            registry,
        }
    }

    /// An empty handler, to be attached to a key and loaded.
    pub fn empty(registry: Option<ResourceRegistry>) -> Self {
        Self {
            state: HandlerState::default(),
            format: String::new(),
            version: None,
            properties: BTreeMap::new(),
            registry,
        }
    }

    pub fn format(&self) -> &str {
        &self.format
    }
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
    pub fn properties(&self) -> &BTreeMap<String, Property> {
        &self.properties
    }

    fn default_language(&self) -> String {
        self.registry
            .as_ref()
            .map(|r| r.default_language().to_string())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
    }

    /// The class field describing a property. Unknown properties are
    /// plain strings when the class is soft, errors otherwise.
    fn get_field(&self, name: &str) -> Result<ResourceField> {
        let Some(registry) = &self.registry else {
            return Ok(ResourceField::new(name, FieldType::String));
        };
        let Some(class) = registry.get_class(&self.format) else {
            return Ok(ResourceField::new(name, FieldType::String));
        };
        match class.get_field(name) {
            Some(field) => Ok(field.clone()),
            None if class.fields_soft() => {
                warn!(target: "folio::database", field = name, format = %self.format, "unexpected field, read as a string");
                Ok(ResourceField::new(name, FieldType::String))
            }
            None => Err(FolioError::parse(format!(
                "unexpected field '{name}' for the '{}' format",
                self.format
            ))),
        }
    }

    pub fn get_property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Looks up a scalar or multilingual value. With no language, the
    /// default language is tried first, then the first language with a
    /// non-empty value.
    pub fn get_value(&self, name: &str, language: Option<&str>) -> Option<&Value> {
        match self.properties.get(name)? {
            Property::Single(p) => Some(&p.value),
            Property::Multiple(ps) => ps.first().map(|p| &p.value),
            Property::Multilingual(by_lang) => match language {
                Some(language) => by_lang.get(language).map(|p| &p.value),
                None => by_lang
                    .get(&self.default_language())
                    .filter(|p| !p.value.is_empty())
                    .or_else(|| by_lang.values().find(|p| !p.value.is_empty()))
                    .map(|p| &p.value),
            },
        }
    }

    pub fn get_values(&self, name: &str) -> Vec<&Value> {
        match self.properties.get(name) {
            Some(Property::Single(p)) => vec![&p.value],
            Some(Property::Multiple(ps)) => ps.iter().map(|p| &p.value).collect(),
            Some(Property::Multilingual(by_lang)) => by_lang.values().map(|p| &p.value).collect(),
            None => Vec::new(),
        }
    }

    pub fn has_property(&self, name: &str, language: Option<&str>) -> bool {
        match (self.properties.get(name), language) {
            (Some(Property::Multilingual(by_lang)), Some(language)) => by_lang.contains_key(language),
            (Some(_), _) => true,
            (None, _) => false,
        }
    }

    /// Sets a property. Multilingual fields take the given language (or
    /// the default one); multiple fields are replaced by a one-element list.
    pub fn set_property(
        &mut self,
        name: &str,
        property: MetadataProperty,
        language: Option<&str>,
    ) -> Result<()> {
        let field = self.get_field(name).map_err(invalid_value)?;
        let property = MetadataProperty { value: field.datatype.coerce(&property.value)?, ..property };
        self.set_changed()?;
        if field.multilingual {
            let language = language.map(str::to_string).unwrap_or_else(|| self.default_language());
            match self.properties.get_mut(name) {
                Some(Property::Multilingual(by_lang)) => {
                    by_lang.insert(language, property);
                }
                _ => {
                    let by_lang = BTreeMap::from([(language, property)]);
                    self.properties.insert(name.to_string(), Property::Multilingual(by_lang));
                }
            }
        } else if field.multiple {
            self.properties.insert(name.to_string(), Property::Multiple(vec![property]));
        } else {
            self.properties.insert(name.to_string(), Property::Single(property));
        }
        Ok(())
    }

    /// Replaces every value of a multiple field.
    pub fn set_values(&mut self, name: &str, values: Vec<MetadataProperty>) -> Result<()> {
        let field = self.get_field(name).map_err(invalid_value)?;
        if !field.multiple {
            return Err(FolioError::InvalidValue(format!("the '{name}' field is not multiple")));
        }
        let values = values
            .into_iter()
            .map(|p| Ok(MetadataProperty { value: field.datatype.coerce(&p.value)?, ..p }))
            .collect::<Result<Vec<_>>>()?;
        self.set_changed()?;
        self.properties.insert(name.to_string(), Property::Multiple(values));
        Ok(())
    }

    pub fn del_property(&mut self, name: &str, language: Option<&str>) -> Result<()> {
        let remove_all = match (self.properties.get_mut(name), language) {
            (None, _) => return Ok(()),
            (Some(Property::Multilingual(by_lang)), Some(language)) => {
                by_lang.remove(language);
                by_lang.is_empty()
            }
            (Some(_), _) => true,
        };
        self.set_changed()?;
        if remove_all {
            self.properties.remove(name);
        }
        Ok(())
    }

    pub fn change_class_id(&mut self, format: impl Into<String>) -> Result<()> {
        self.set_changed()?;
        self.format = format.into();
        Ok(())
    }
}

fn invalid_value(e: FolioError) -> FolioError {
    match e {
        FolioError::Parse { message, .. } => FolioError::InvalidValue(message),
        other => other,
    }
}

impl Handler for Metadata {
    fn class_id(&self) -> &str {
        Self::CLASS_ID
    }
    fn state(&self) -> &HandlerState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut HandlerState {
        &mut self.state
    }
    fn reset(&mut self) {
        self.format.clear();
        self.version = None;
        self.properties.clear();
    }

    fn load_state_from_string(&mut self, data: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(data)
            .map_err(|e| FolioError::parse(format!("metadata is not valid UTF-8: {e}")))?;
        let mut lines = read_content_lines(text)?.into_iter();
        let Some(first) = lines.next() else {
            return Err(FolioError::parse("empty metadata, the 'format' record is missing"));
        };
        if first.name != "format" {
            return Err(FolioError::parse(format!(
                "the first record must be 'format', found '{}'",
                first.name
            )));
        }
        self.reset();
        self.format = first.value;
        self.version = first.parameters.get("version").and_then(|v| v.first().cloned());

        let default_language = self.default_language();
        for line in lines {
            let field = self.get_field(&line.name)?;
            if field.multiple && field.multilingual {
                return Err(FolioError::parse(format!(
                    "the '{}' field cannot be both multiple and multilingual",
                    field.name
                )));
            }
            let mut parameters = line.parameters;
            for parameter in parameters.keys() {
                let allowed = field.parameters.iter().any(|p| p == parameter)
                    || (field.multilingual && parameter == "lang");
                if !allowed {
                    return Err(FolioError::parse(format!(
                        "unexpected parameter '{parameter}' for the '{}' field",
                        field.name
                    )));
                }
            }
            let language = parameters.remove("lang").and_then(|v| v.into_iter().next());
            let value = field.datatype.decode(&line.value)?;
            let property = MetadataProperty { value, parameters };

            if field.multilingual {
                let language = language.unwrap_or_else(|| default_language.clone());
                match self
                    .properties
                    .entry(line.name)
                    .or_insert_with(|| Property::Multilingual(BTreeMap::new()))
                {
                    Property::Multilingual(by_lang) => {
                        by_lang.insert(language, property);
                    }
                    _ => return Err(FolioError::parse("inconsistent multilingual property")),
                }
            } else if field.multiple {
                match self
                    .properties
                    .entry(line.name)
                    .or_insert_with(|| Property::Multiple(Vec::new()))
                {
                    Property::Multiple(values) => values.push(property),
                    _ => return Err(FolioError::parse("inconsistent multiple property")),
                }
            } else {
                self.properties.insert(line.name, Property::Single(property));
            }
        }
        Ok(())
    }

    fn to_str(&self) -> Result<Vec<u8>> {
        let mut text = String::new();
        let mut parameters = Parameters::new();
        if let Some(version) = &self.version {
            parameters.insert("version".to_string(), vec![version.clone()]);
        }
        text.push_str(&write_content_line("format", &parameters, &self.format)?);

        for (name, property) in &self.properties {
            match property {
                Property::Single(p) => {
                    if !p.value.is_empty() {
                        text.push_str(&write_content_line(name, &p.parameters, &p.value.encode())?);
                    }
                }
                Property::Multiple(ps) => {
                    for p in ps.iter().filter(|p| !p.value.is_empty()) {
                        text.push_str(&write_content_line(name, &p.parameters, &p.value.encode())?);
                    }
                }
                Property::Multilingual(by_lang) => {
                    for (language, p) in by_lang.iter().filter(|(_, p)| !p.value.is_empty()) {
                        let mut parameters = p.parameters.clone();
                        parameters.insert("lang".to_string(), vec![language.clone()]);
                        text.push_str(&write_content_line(name, &parameters, &p.value.encode())?);
                    }
                }
            }
        }
        Ok(text.into_bytes())
    }

    fn duplicate(&self) -> Box<dyn Handler> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_registry_everything_is_a_string() {
        let mut metadata = Metadata::empty(None);
        metadata.state_mut().key = Some("a.metadata".to_string());
        metadata
            .load_state_from_string(b"format;version=2:text/plain\ntitle:Hello\n")
            .unwrap();
        assert_eq!(metadata.format(), "text/plain");
        assert_eq!(metadata.version(), Some("2"));
        assert_eq!(metadata.get_value("title", None), Some(&Value::from("Hello")));
        assert_eq!(
            metadata.to_str().unwrap(),
            b"format;version=2:text/plain\ntitle:Hello\n".to_vec()
        );
    }

    #[test]
    fn format_comes_first() {
        let mut metadata = Metadata::empty(None);
        assert!(metadata.load_state_from_string(b"title:Hello\nformat:x\n").is_err());
        assert!(metadata.load_state_from_string(b"").is_err());
    }
}
