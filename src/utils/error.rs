use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Background task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value for {field} ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("OrgMeter returned {status} for {url}: {body}")]
    ApiStatusError {
        status: u16,
        url: String,
        body: String,
    },

    #[error("OrgMeter rejected credentials for funder {funder} ({status})")]
    AuthenticationError { funder: String, status: u16 },

    #[error("Unexpected response format from {url}: {message}")]
    ResponseFormatError { url: String, message: String },

    #[error("Record not found: {entity} {orgmeter_id} for funder {funder}")]
    NotFoundError {
        funder: String,
        entity: String,
        orgmeter_id: String,
    },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Upstream,
    Storage,
    Data,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Medium,
    High,
    Critical,
}

impl ImportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ImportError::ConfigError { .. }
            | ImportError::MissingConfigError { .. }
            | ImportError::InvalidConfigValueError { .. }
            | ImportError::TomlError(_) => ErrorCategory::Configuration,
            ImportError::HttpError(_) => ErrorCategory::Network,
            ImportError::ApiStatusError { .. }
            | ImportError::AuthenticationError { .. }
            | ImportError::ResponseFormatError { .. } => ErrorCategory::Upstream,
            ImportError::DatabaseError(_) | ImportError::NotFoundError { .. } => {
                ErrorCategory::Storage
            }
            ImportError::CsvError(_)
            | ImportError::SerializationError(_)
            | ImportError::ProcessingError { .. } => ErrorCategory::Data,
            ImportError::ZipError(_) | ImportError::IoError(_) | ImportError::TaskError(_) => {
                ErrorCategory::System
            }
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ImportError::HttpError(_) => ErrorSeverity::Medium,
            ImportError::ApiStatusError { status, .. } if *status == 429 || *status >= 500 => {
                ErrorSeverity::Medium
            }
            ImportError::DatabaseError(_)
            | ImportError::IoError(_)
            | ImportError::TaskError(_)
            | ImportError::ZipError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::High,
        }
    }

    /// Transient failures the client retries with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ImportError::HttpError(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            ImportError::ApiStatusError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            ImportError::ConfigError { .. }
            | ImportError::MissingConfigError { .. }
            | ImportError::InvalidConfigValueError { .. }
            | ImportError::TomlError(_) => {
                "Check the TOML configuration file and the environment variables it references"
                    .to_string()
            }
            ImportError::AuthenticationError { funder, .. } => format!(
                "Verify the OrgMeter API key configured for funder '{}'",
                funder
            ),
            ImportError::HttpError(_) => {
                "Check network connectivity to OrgMeter and re-run; the import resumes from the last checkpoint"
                    .to_string()
            }
            ImportError::ApiStatusError { status, .. } if *status == 429 => {
                "OrgMeter is rate limiting; raise page_delay_ms or retry_delay_ms".to_string()
            }
            ImportError::ApiStatusError { .. } => {
                "Re-run the import later; completed pages are checkpointed".to_string()
            }
            ImportError::ResponseFormatError { .. } => {
                "Check base_url and the entity path; the endpoint did not return a record list"
                    .to_string()
            }
            ImportError::DatabaseError(_) => {
                "Check that the database file is writable and not locked by another process"
                    .to_string()
            }
            ImportError::NotFoundError { .. } => {
                "Run `status` or `pending` to list the records stored for this funder".to_string()
            }
            ImportError::IoError(_) | ImportError::ZipError(_) => {
                "Check disk space and permissions of the output directory".to_string()
            }
            _ => "Re-run with --verbose for details".to_string(),
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Network => format!("Could not reach OrgMeter: {}", self),
            ErrorCategory::Upstream => format!("OrgMeter request failed: {}", self),
            ErrorCategory::Storage => format!("Local store error: {}", self),
            ErrorCategory::Data => format!("Could not process records: {}", self),
            ErrorCategory::System => format!("System error: {}", self),
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.severity() {
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;
