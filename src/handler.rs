//! Handlers are the in-memory form of the files kept by the database.
//!
//! A handler knows how to parse its bytes ([`Handler::load_state_from_string`])
//! and how to write them back ([`Handler::to_str`]); it never touches the
//! filesystem itself. The database attaches a key to it, loads it lazily and
//! tracks its `timestamp` (the mtime of the file it was read from) and its
//! `dirty` mark (when it was last changed in memory).
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

// used for timestamps and dirty marks
use chrono::{DateTime, Utc};

use crate::error::{FolioError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerState {
    pub key: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub dirty: Option<DateTime<Utc>>,
}

impl HandlerState {
    pub fn attached(key: impl Into<String>) -> Self {
        Self { key: Some(key.into()), timestamp: None, dirty: None }
    }
    pub fn phantom() -> Self {
        Self { key: None, timestamp: None, dirty: Some(Utc::now()) }
    }
    /// Attached to a key but never loaded (or unloaded by an abort).
    pub fn is_unloaded(&self) -> bool {
        self.timestamp.is_none() && self.dirty.is_none()
    }
}

pub trait Handler: Send + 'static {
    /// The MIME type of the data this handler understands.
    fn class_id(&self) -> &str;
    fn state(&self) -> &HandlerState;
    fn state_mut(&mut self) -> &mut HandlerState;
    /// Drops the parsed state, leaving an empty handler.
    fn reset(&mut self);
    fn load_state_from_string(&mut self, data: &[u8]) -> Result<()>;
    fn to_str(&self) -> Result<Vec<u8>>;
    /// A copy of the parsed state together with the bookkeeping.
    fn duplicate(&self) -> Box<dyn Handler>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn key(&self) -> Option<&str> {
        self.state().key.as_deref()
    }
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.state().timestamp
    }
    fn dirty(&self) -> Option<DateTime<Utc>> {
        self.state().dirty
    }

    /// Detached copy ready to be stored elsewhere: no key, no timestamp,
    /// dirty as of now.
    fn clone_handler(&self) -> Box<dyn Handler> {
        let mut copy = self.duplicate();
        *copy.state_mut() = HandlerState::phantom();
        copy
    }

    fn set_changed(&mut self) -> Result<()> {
        let state = self.state_mut();
        if state.key.is_none() && state.dirty.is_none() {
            return Err(FolioError::Invariant(
                "cannot change an orphaned file handler".to_string(),
            ));
        }
        state.dirty = Some(Utc::now());
        Ok(())
    }

    /// Forgets the in-memory changes; the next access reloads from storage.
    fn abort_changes(&mut self) {
        self.reset();
        let state = self.state_mut();
        state.timestamp = None;
        state.dirty = None;
    }
}

impl fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("class_id", &self.class_id())
            .field("state", self.state())
            .finish()
    }
}

/// Shared reference to a handler, as handed out by the database.
#[derive(Clone)]
pub struct HandlerRef(Arc<Mutex<Box<dyn Handler>>>);

impl HandlerRef {
    pub fn new(handler: Box<dyn Handler>) -> Self {
        Self(Arc::new(Mutex::new(handler)))
    }
    pub fn lock(&self) -> Result<MutexGuard<'_, Box<dyn Handler>>> {
        Ok(self.0.lock()?)
    }
    pub fn ptr_eq(&self, other: &HandlerRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
    pub fn state(&self) -> Result<HandlerState> {
        Ok(self.lock()?.state().clone())
    }
    pub fn class_id(&self) -> Result<String> {
        Ok(self.lock()?.class_id().to_string())
    }
    pub fn to_str(&self) -> Result<Vec<u8>> {
        self.lock()?.to_str()
    }

    /// Runs `f` against the concrete handler type.
    pub fn with<H: Handler, R>(&self, f: impl FnOnce(&H) -> R) -> Result<R> {
        let guard = self.lock()?;
        let class_id = guard.class_id().to_string();
        match guard.as_any().downcast_ref::<H>() {
            Some(handler) => Ok(f(handler)),
            None => Err(FolioError::InvalidValue(format!(
                "handler of class '{class_id}' is not a {}",
                std::any::type_name::<H>()
            ))),
        }
    }
    pub fn with_mut<H: Handler, R>(&self, f: impl FnOnce(&mut H) -> R) -> Result<R> {
        let mut guard = self.lock()?;
        let class_id = guard.class_id().to_string();
        match guard.as_any_mut().downcast_mut::<H>() {
            Some(handler) => Ok(f(handler)),
            None => Err(FolioError::InvalidValue(format!(
                "handler of class '{class_id}' is not a {}",
                std::any::type_name::<H>()
            ))),
        }
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_lock() {
            Ok(guard) => write!(f, "HandlerRef({:?})", &**guard),
            Err(_) => f.write_str("HandlerRef(<locked>)"),
        }
    }
}

/// Opaque bytes.
#[derive(Debug, Clone, Default)]
pub struct File {
    state: HandlerState,
    data: Vec<u8>,
}

impl File {
    pub const CLASS_ID: &'static str = "application/octet-stream";

    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { state: HandlerState::phantom(), data: data.into() }
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.set_changed()?;
        self.data = data.into();
        Ok(())
    }
}

impl Handler for File {
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
        self.data.clear();
    }
    fn load_state_from_string(&mut self, data: &[u8]) -> Result<()> {
        self.data = data.to_vec();
        Ok(())
    }
    fn to_str(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
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

/// UTF-8 text.
#[derive(Debug, Clone, Default)]
pub struct TextFile {
    state: HandlerState,
    text: String,
}

impl TextFile {
    pub const CLASS_ID: &'static str = "text/plain";

    pub fn new(text: impl Into<String>) -> Self {
        Self { state: HandlerState::phantom(), text: text.into() }
    }
    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn set_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.set_changed()?;
        self.text = text.into();
        Ok(())
    }
}

impl Handler for TextFile {
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
        self.text.clear();
    }
    fn load_state_from_string(&mut self, data: &[u8]) -> Result<()> {
        self.text = String::from_utf8(data.to_vec())
            .map_err(|e| FolioError::parse(format!("text file is not valid UTF-8: {e}")))?;
        Ok(())
    }
    fn to_str(&self) -> Result<Vec<u8>> {
        Ok(self.text.as_bytes().to_vec())
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

/// Builds an empty handler, to be attached to a key and loaded.
pub type HandlerFactory = fn() -> Box<dyn Handler>;

pub fn new_file() -> Box<dyn Handler> {
    Box::new(File::default())
}
pub fn new_text_file() -> Box<dyn Handler> {
    Box::new(TextFile::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphans_cannot_change() {
        let mut file = File::default();
        assert!(matches!(file.set_changed(), Err(FolioError::Invariant(_))));
        let mut phantom = TextFile::new("hello");
        phantom.set_text("world").unwrap();
        assert!(phantom.dirty().is_some());
    }

    #[test]
    fn clones_are_phantoms() {
        let mut text = TextFile::default();
        text.state_mut().key = Some("a.txt".to_string());
        text.state_mut().timestamp = Some(Utc::now());
        text.load_state_from_string(b"content").unwrap();
        let copy = text.clone_handler();
        assert_eq!(copy.key(), None);
        assert_eq!(copy.timestamp(), None);
        assert!(copy.dirty().is_some());
        assert_eq!(copy.to_str().unwrap(), b"content");
    }

    #[test]
    fn abort_unloads() {
        let mut text = TextFile::default();
        text.state_mut().key = Some("a.txt".to_string());
        text.load_state_from_string(b"content").unwrap();
        text.set_text("changed").unwrap();
        text.abort_changes();
        assert!(text.state().is_unloaded());
        assert_eq!(text.text(), "");
    }

    #[test]
    fn downcast_through_ref() {
        let handler = HandlerRef::new(Box::new(TextFile::new("x")));
        let text = handler.with::<TextFile, _>(|t| t.text().to_string()).unwrap();
        assert_eq!(text, "x");
        assert!(handler.with::<File, _>(|_| ()).is_err());
    }
}
