//! Configuration Error Types
//!
//! Errors raised while layering configuration sources and validating the result.

use thiserror::Error;

/// Configuration-related errors with detailed context
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// A configuration source could not be read or merged
    #[error("Failed to load configuration for environment '{environment}': {error}")]
    LoadError { environment: String, error: String },

    /// The merged configuration did not deserialize into `EngineConfig`
    #[error("Failed to deserialize configuration: {error}")]
    DeserializationError { error: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },
}

impl ConfigurationError {
    /// Create an invalid value error
    pub fn invalid_value<F: Into<String>, V: ToString, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }

    /// Create a missing required field error
    pub fn missing_required_field<F: Into<String>, C: Into<String>>(field: F, context: C) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn load_error<E: Into<String>, R: std::fmt::Display>(environment: E, error: R) -> Self {
        Self::LoadError {
            environment: environment.into(),
            error: error.to_string(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
