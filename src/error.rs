use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Validation,
    Structural,
    BudgetExceeded,
    Storage,
    Cancelled,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("parse html: {0}")]
    Parse(String),

    #[error("link extraction failed after {attempts} attempts: {message}")]
    Extraction { attempts: u32, message: String },

    #[error("no archive link for {url}: {status}")]
    LinkNotFound { url: String, status: String },

    #[error("invalid archive link: {0}")]
    InvalidLink(String),

    #[error("download {url}: {message}")]
    Download {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("archive: {0}")]
    Archive(String),

    #[error("{file}: participants not found ({reason})")]
    ParticipantsNotFound { file: String, reason: String },

    #[error("{file}: header row not found")]
    HeaderNotFound { file: String },

    #[error("{file}: no data rows found after header")]
    NoDataRows { file: String },

    #[error("payload too large: estimate {estimate} exceeds budget {budget}")]
    PayloadTooLarge { estimate: usize, budget: usize },

    #[error("validation: {0}")]
    Validation(String),

    #[error("language model: {0}")]
    Llm(String),

    #[error("database: {0}")]
    Database(String),

    #[error("audit log: {0}")]
    AuditLog(String),

    #[error("source: {0}")]
    Source(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("a refresh is already running")]
    RefreshInProgress,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Fetch { .. } | Error::Download { .. } | Error::Llm(_) => ErrorKind::Transport,
            Error::Parse(_)
            | Error::Extraction { .. }
            | Error::LinkNotFound { .. }
            | Error::InvalidLink(_)
            | Error::Validation(_)
            | Error::Source(_) => ErrorKind::Validation,
            Error::Archive(_)
            | Error::ParticipantsNotFound { .. }
            | Error::HeaderNotFound { .. }
            | Error::NoDataRows { .. } => ErrorKind::Structural,
            Error::PayloadTooLarge { .. } => ErrorKind::BudgetExceeded,
            Error::Database(_) | Error::AuditLog(_) => ErrorKind::Storage,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::RefreshInProgress => ErrorKind::Busy,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(err.to_string())
    }
}
