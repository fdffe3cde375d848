use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Invalid request: {message}"))]
    InvalidRequest { message: String },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Conflict: {message}"))]
    Conflict { message: String },

    #[snafu(display("Backpressure: {message}"))]
    Backpressure { message: String },

    #[snafu(display("Transient failure, retry: {message}"))]
    Transient { message: String },

    #[snafu(display("I/O failure: {message}"))]
    IoFailure {
        message: String,
        #[snafu(source(false))]
        source: Option<std::io::Error>,
    },

    #[snafu(display("Broker is shutting down"))]
    Unavailable,

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::IoFailure {
            message: source.to_string(),
            source: Some(source),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::InvalidRequest {
            message: source.to_string(),
        }
    }
}

impl Error {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::Backpressure {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::IoFailure {
            message: message.into(),
            source: None,
        }
    }

    pub fn lease_not_found(lease_id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: format!("lease {}", lease_id.into()),
        }
    }

    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::NotFound {
            resource: format!("queue {}", queue.into()),
        }
    }

    /// Stable wire code for mailbox responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Backpressure { .. } => "backpressure",
            Self::Transient { .. } => "transient",
            Self::IoFailure { .. } | Self::Sqlx { .. } | Self::Migration { .. } => "io_failure",
            Self::Unavailable => "unavailable",
        }
    }
}
