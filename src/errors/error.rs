use serde::Serialize;
use thiserror::Error;
use crate::domains::core::file_storage_service::FileStorageError;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(String),
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("DbError", 2)?;
        let kind = match self {
            DbError::Sqlx(_) => "Sqlx",
            DbError::Migration(_) => "Migration",
            DbError::Other(_) => "Other",
        };
        state.serialize_field("type", kind)?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Manual Clone implementation for DbError
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::Migration(s) => DbError::Migration(s.clone()),
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

/// Domain-level errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Asset not found: {0}")]
    AssetNotFound(i64),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("File error: {0}")]
    File(String),

    #[error("Image processing error: {0}")]
    Image(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<FileStorageError> for DomainError {
    fn from(error: FileStorageError) -> Self {
        DomainError::File(format!("File storage error: {}", error))
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(error: serde_json::Error) -> Self {
        DomainError::Serialization(error.to_string())
    }
}

/// Service-level errors (remote services and configuration)
#[derive(Debug, Error, Clone, Serialize)]
pub enum ServiceError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Insufficient credits: {0}")]
    InsufficientCredits(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl ServiceError {
    /// True for errors that retrying cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ServiceError::Configuration(_) | ServiceError::Authentication(_))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ServiceError::Timeout(error.to_string())
        } else {
            ServiceError::Network(error.to_string())
        }
    }
}

/// Validation errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum ValidationError {
    #[error("Field '{field}' contains an invalid value: {reason}")]
    InvalidValue {
        field: String,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Custom(String),
}

impl ValidationError {
    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn custom(message: &str) -> Self {
        Self::Custom(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_serializes_type_and_message() {
        let err = DbError::Migration("bad schema".to_string());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "Migration");
        assert_eq!(json["message"], "Migration error: bad schema");
    }

    #[test]
    fn test_configuration_errors_are_not_retryable() {
        assert!(ServiceError::Configuration("missing key".into()).is_configuration());
        assert!(ServiceError::Authentication("bad key".into()).is_configuration());
        assert!(!ServiceError::RateLimitExceeded.is_configuration());
        assert!(!ServiceError::Network("reset".into()).is_configuration());
    }

    #[test]
    fn test_unknown_queue_name_is_invalid_value() {
        let err = "thumbnails".parse::<crate::domains::queue::types::QueueName>().unwrap_err();
        assert!(matches!(err, DomainError::Validation(ValidationError::InvalidValue { .. })));
        assert_eq!(
            err.to_string(),
            "Validation error: Field 'queue_name' contains an invalid value: unknown queue 'thumbnails'"
        );
    }

    #[test]
    fn test_storage_error_converts_to_file_error() {
        let err: DomainError = FileStorageError::NotFound("a.jpg".into()).into();
        assert!(matches!(err, DomainError::File(_)));
    }
}
