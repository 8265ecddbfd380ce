//! Error types for the appliance operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// The spec blob in the ConfigMap could not be decoded
    Decode(String),
    /// Serialization error
    Serialization(String),
    /// Configuration error
    Configuration(String),
    /// Invalid resource state
    InvalidState(String),
    /// Resource not found
    NotFound(String),
    /// A version string is not valid semver
    VersionParse(String),
    /// No available version satisfies the upgrade policy
    NoQualifyingVersion(String),
    /// HTTP client error
    Http(String),
    /// The reconciliation worker shut down before answering
    Cancelled,
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Decode(msg) => write!(f, "Spec decode error: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            OperatorError::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            OperatorError::VersionParse(msg) => write!(f, "Invalid version: {}", msg),
            OperatorError::NoQualifyingVersion(msg) => {
                write!(f, "No qualifying version: {}", msg)
            }
            OperatorError::Http(msg) => write!(f, "HTTP error: {}", msg),
            OperatorError::Cancelled => write!(f, "Reconciliation worker stopped"),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::Decode(err.to_string())
    }
}

impl From<semver::Error> for OperatorError {
    fn from(err: semver::Error) -> Self {
        OperatorError::VersionParse(err.to_string())
    }
}

impl From<reqwest::Error> for OperatorError {
    fn from(err: reqwest::Error) -> Self {
        OperatorError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::KubeApi("test error".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));

        let err = OperatorError::Decode("bad yaml".to_string());
        assert_eq!(err.to_string(), "Spec decode error: bad yaml");
    }

    #[test]
    fn test_yaml_error_is_decode_error() {
        let err: OperatorError = serde_yaml::from_str::<u32>("[not, a, number]")
            .unwrap_err()
            .into();
        assert!(matches!(err, OperatorError::Decode(_)));
    }

    #[test]
    fn test_semver_error_is_parse_error() {
        let err: OperatorError = semver::Version::parse("v5.x").unwrap_err().into();
        assert!(matches!(err, OperatorError::VersionParse(_)));
    }
}
