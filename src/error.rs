use thiserror::Error;

/// Errors raised while loading, aggregating or serving dashboard data
///
/// Every variant is recoverable at the page level: the web layer turns
/// them into a warning banner (or an HTTP status on the JSON and export
/// endpoints) and the user re-uploads or re-selects.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not read spreadsheet: {0}")]
    Spreadsheet(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("{0} contains no data rows")]
    EmptyDataset(String),

    #[error("no sales data loaded; upload a spreadsheet first")]
    NoDataset,

    #[error("unknown grouping key '{0}'")]
    UnknownKey(String),

    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("credential store error: {0}")]
    Credentials(String),

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("chart rendering failed: {0}")]
    Chart(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<calamine::Error> for DashboardError {
    fn from(e: calamine::Error) -> Self {
        DashboardError::Spreadsheet(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DashboardError>;
