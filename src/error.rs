use thiserror::Error;

#[derive(Error, Debug)]
pub enum FolioError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Read-only database: {0}")]
    Readonly(String),
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),
    #[error("The \"{0}\" URI is busy")]
    Busy(String),
    #[error("Version control error: {0}")]
    Vcs(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
    #[error("Parse error: {message}")]
    Parse { message: String, line: Option<usize>, col: Option<usize> },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, FolioError>;

impl FolioError {
    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into(), line: None, col: None }
    }
}

// Helper conversions
impl From<rusqlite::Error> for FolioError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}

impl From<git2::Error> for FolioError {
    fn from(e: git2::Error) -> Self { Self::Vcs(e.message().to_string()) }
}

impl From<serde_json::Error> for FolioError {
    fn from(e: serde_json::Error) -> Self { Self::Serialization(e.to_string()) }
}

impl From<config::ConfigError> for FolioError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}

impl<R: pest::RuleType> From<pest::error::Error<R>> for FolioError {
    fn from(e: pest::error::Error<R>) -> Self {
        let (line, col) = match e.line_col {
            pest::error::LineColLocation::Pos((l, c)) => (l, c),
            pest::error::LineColLocation::Span((l, c), _) => (l, c),
        };
        Self::Parse { message: e.variant.message().to_string(), line: Some(line), col: Some(col) }
    }
}

impl<T> From<std::sync::PoisonError<T>> for FolioError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
