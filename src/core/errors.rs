use thiserror::Error;

/// Unified error type for workload context construction and its registries
#[derive(Debug, Error)]
pub enum LoadcastError {
    /// User-fixable problems in the workload configuration
    #[error("Invalid configuration: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Caller bugs: using a registry after sealing, bad actor ids, etc.
    #[error("Logic error: {message}")]
    Logic { message: String },

    /// IO errors while reading workload files
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}: {source}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A construction task panicked or was cancelled
    #[error("Construction task failed: {message}")]
    Join { message: String },

    /// A producer failed while building its actors
    #[error("Actor error: {actor} - {message}")]
    Actor { actor: String, message: String },
}

impl LoadcastError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error tied to a config path
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a logic error
    pub fn logic<S: Into<String>>(message: S) -> Self {
        Self::Logic {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an actor error
    pub fn actor<S: Into<String>, M: Into<String>>(actor: S, message: M) -> Self {
        Self::Actor {
            actor: actor.into(),
            message: message.into(),
        }
    }

    /// Configuration and logic errors abort the run; nothing here retries.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Configuration { .. } | Self::Logic { .. } => false,
            Self::Serialization { .. } | Self::Join { .. } | Self::Actor { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Logic { .. } => "logic",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Join { .. } => "join",
            Self::Actor { .. } => "actor",
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_logic(&self) -> bool {
        matches!(self, Self::Logic { .. })
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, LoadcastError>;

impl From<std::io::Error> for LoadcastError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_yaml::Error> for LoadcastError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<serde_json::Error> for LoadcastError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<anyhow::Error> for LoadcastError {
    fn from(err: anyhow::Error) -> Self {
        Self::actor("unknown", err.to_string())
    }
}

impl From<tokio::task::JoinError> for LoadcastError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join {
            message: err.to_string(),
        }
    }
}

/// Macro for creating errors
#[macro_export]
macro_rules! loadcast_error {
    (configuration, $message:expr) => {
        $crate::LoadcastError::configuration($message)
    };
    (configuration, $message:expr, $field:expr) => {
        $crate::LoadcastError::configuration_field($message, $field)
    };
    (logic, $message:expr) => {
        $crate::LoadcastError::logic($message)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LoadcastError::configuration("Invalid Schema Version: 2017-01-01");
        assert!(err.is_configuration());
        assert_eq!(err.category(), "configuration");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: Invalid Schema Version: 2017-01-01"
        );
    }

    #[test]
    fn test_error_recoverability() {
        assert!(!LoadcastError::configuration("test").is_recoverable());
        assert!(!LoadcastError::logic("test").is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(LoadcastError::from(io).is_recoverable());
    }

    #[test]
    fn test_macro() {
        let err = loadcast_error!(logic, "Cannot create RNGs after setup");
        assert!(err.is_logic());

        let err = loadcast_error!(configuration, "Duplicate phase 3", "Actors.0.Phases");
        if let LoadcastError::Configuration { field, .. } = err {
            assert_eq!(field.as_deref(), Some("Actors.0.Phases"));
        } else {
            panic!("Expected configuration error");
        }
    }
}
