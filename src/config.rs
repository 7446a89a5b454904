//! Database settings, read from an optional `folio.toml` and overridden
//! by `FOLIO_*` environment variables (`FOLIO_PATCHES=false`, ...).
use std::path::Path;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::backend::git::GitOptions;
use crate::error::{FolioError, Result};
use crate::transaction::Author;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Git,
    Lfs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: BackendKind,
    /// Soft bounds of the handler cache.
    pub size_min: usize,
    pub size_max: usize,
    /// Soft bounds of the blob cache.
    pub git_cache_min: usize,
    pub git_cache_max: usize,
    pub patches: bool,
    pub patches_rotate_days: i64,
    pub default_language: String,
    pub git_user_name: String,
    pub git_user_email: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Git,
            size_min: 4800,
            size_max: 5200,
            git_cache_min: 900,
            git_cache_max: 1100,
            patches: true,
            patches_rotate_days: 14,
            default_language: "en".to_string(),
            git_user_name: "folio".to_string(),
            git_user_email: "folio@localhost".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Defaults, then `file` (if given and present), then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("backend", "git")?
            .set_default("size_min", defaults.size_min as i64)?
            .set_default("size_max", defaults.size_max as i64)?
            .set_default("git_cache_min", defaults.git_cache_min as i64)?
            .set_default("git_cache_max", defaults.git_cache_max as i64)?
            .set_default("patches", defaults.patches)?
            .set_default("patches_rotate_days", defaults.patches_rotate_days)?
            .set_default("default_language", defaults.default_language)?
            .set_default("git_user_name", defaults.git_user_name)?
            .set_default("git_user_email", defaults.git_user_email)?;
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("FOLIO").try_parsing(true))
            .build()?;
        let config: DatabaseConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn lfs() -> Self {
        Self { backend: BackendKind::Lfs, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size_max < self.size_min {
            return Err(FolioError::Config(format!(
                "size_max ({}) is lower than size_min ({})",
                self.size_max, self.size_min
            )));
        }
        if self.git_cache_max < self.git_cache_min {
            return Err(FolioError::Config(format!(
                "git_cache_max ({}) is lower than git_cache_min ({})",
                self.git_cache_max, self.git_cache_min
            )));
        }
        if self.default_language.is_empty() {
            return Err(FolioError::Config("default_language is empty".to_string()));
        }
        Ok(())
    }

    pub fn git_options(&self) -> GitOptions {
        GitOptions {
            patches: self.patches,
            patches_rotate_days: self.patches_rotate_days,
            committer: Author::new(self.git_user_name.clone(), self.git_user_email.clone()),
        }
    }
}
