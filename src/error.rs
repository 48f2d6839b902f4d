//! Error types and handling for Fieldgate
//!
//! One error enum covers the whole agent. The variants follow the failure
//! taxonomy of the gateway: transport problems are contained by the device
//! node, delivery problems by the sink, and configuration problems are fatal
//! at load time.

use thiserror::Error;

/// Result type alias for Fieldgate operations
pub type Result<T> = std::result::Result<T, FieldgateError>;

/// Main error type for Fieldgate
#[derive(Debug, Error)]
pub enum FieldgateError {
    /// Configuration-related errors (fatal at load time)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Fieldbus transport errors (link down, exception response)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Raw value could not be turned into an engineering value
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// A remote sink refused or could not take a row
    #[error("Delivery error: {message}")]
    Delivery { message: String },

    /// Relational store errors
    #[error("Database error: {message}")]
    Database { message: String },

    /// File server errors
    #[error("File server error: {message}")]
    FileServer { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl FieldgateError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        FieldgateError::Config {
            message: message.into(),
        }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        FieldgateError::Transport {
            message: message.into(),
        }
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        FieldgateError::Decode {
            message: message.into(),
        }
    }

    /// Create a new delivery error
    pub fn delivery<S: Into<String>>(message: S) -> Self {
        FieldgateError::Delivery {
            message: message.into(),
        }
    }

    /// Create a new database error
    pub fn database<S: Into<String>>(message: S) -> Self {
        FieldgateError::Database {
            message: message.into(),
        }
    }

    /// Create a new file server error
    pub fn file_server<S: Into<String>>(message: S) -> Self {
        FieldgateError::FileServer {
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        FieldgateError::Serialization {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        FieldgateError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        FieldgateError::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        FieldgateError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        FieldgateError::Generic {
            message: message.into(),
        }
    }

    /// Whether the error means the link itself is gone and a reconnect is due
    pub fn is_connection_error(&self) -> bool {
        match self {
            FieldgateError::Transport { message } => {
                let msg = message.to_ascii_lowercase();
                msg.contains("connection")
                    || msg.contains("broken pipe")
                    || msg.contains("not connected")
                    || msg.contains("disconnected")
            }
            FieldgateError::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for FieldgateError {
    fn from(err: std::io::Error) -> Self {
        FieldgateError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for FieldgateError {
    fn from(err: serde_yaml::Error) -> Self {
        FieldgateError::serialization(err.to_string())
    }
}

impl From<serde_json::Error> for FieldgateError {
    fn from(err: serde_json::Error) -> Self {
        FieldgateError::serialization(err.to_string())
    }
}

impl From<csv::Error> for FieldgateError {
    fn from(err: csv::Error) -> Self {
        FieldgateError::io(format!("durable log: {}", err))
    }
}

impl From<sqlx::Error> for FieldgateError {
    fn from(err: sqlx::Error) -> Self {
        FieldgateError::database(err.to_string())
    }
}

impl From<tokio_modbus::Error> for FieldgateError {
    fn from(err: tokio_modbus::Error) -> Self {
        FieldgateError::transport(format!("connection error: {}", err))
    }
}

impl From<chrono::ParseError> for FieldgateError {
    fn from(err: chrono::ParseError) -> Self {
        FieldgateError::Validation {
            field: "datetime".to_string(),
            message: err.to_string(),
        }
    }
}
