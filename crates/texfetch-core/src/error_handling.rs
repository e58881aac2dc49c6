//! Structured error types for the fetch pipeline.
//! Errors steer the per-asset state machine internally; only the shims and the
//! public maintenance API surface them to callers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Main error type for texfetch operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FetchError {
    /// I/O related errors
    Io {
        operation: String,
        path: Option<String>,
        source: String,
    },
    /// Network/HTTP errors
    Network {
        operation: String,
        url: Option<String>,
        status: Option<u16>,
        source: String,
    },
    /// Blob cache errors
    Cache {
        operation: String,
        asset: Option<String>,
        source: String,
    },
    /// Codec/decode errors
    Decode {
        operation: String,
        asset: Option<String>,
        source: String,
    },
    /// UDP protocol violations (bad packet index, wrong size, duplicate)
    Protocol {
        operation: String,
        host: Option<String>,
        reason: String,
    },
    /// Configuration errors
    Config {
        operation: String,
        field: Option<String>,
        source: String,
    },
    /// Generic application errors
    Application {
        operation: String,
        details: Option<String>,
        source: String,
    },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Io { operation, path, source } => {
                write!(f, "I/O error in {}: {}", operation, source)?;
                if let Some(path) = path {
                    write!(f, " (path: {})", path)?;
                }
                Ok(())
            }
            FetchError::Network { operation, url, status, source } => {
                write!(f, "Network error in {}: {}", operation, source)?;
                if let Some(url) = url {
                    write!(f, " (url: {})", url)?;
                }
                if let Some(status) = status {
                    write!(f, " (status: {})", status)?;
                }
                Ok(())
            }
            FetchError::Cache { operation, asset, source } => {
                write!(f, "Cache error in {}: {}", operation, source)?;
                if let Some(asset) = asset {
                    write!(f, " (asset: {})", asset)?;
                }
                Ok(())
            }
            FetchError::Decode { operation, asset, source } => {
                write!(f, "Decode error in {}: {}", operation, source)?;
                if let Some(asset) = asset {
                    write!(f, " (asset: {})", asset)?;
                }
                Ok(())
            }
            FetchError::Protocol { operation, host, reason } => {
                write!(f, "Protocol violation in {}: {}", operation, reason)?;
                if let Some(host) = host {
                    write!(f, " (host: {})", host)?;
                }
                Ok(())
            }
            FetchError::Config { operation, field, source } => {
                write!(f, "Config error in {}: {}", operation, source)?;
                if let Some(field) = field {
                    write!(f, " (field: {})", field)?;
                }
                Ok(())
            }
            FetchError::Application { operation, details, source } => {
                write!(f, "Error in {}: {}", operation, source)?;
                if let Some(details) = details {
                    write!(f, " ({})", details)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for FetchError {}

/// Constructor helpers so call sites stay short.
pub mod errors {
    use super::FetchError;

    pub fn io_error(operation: &str, path: Option<&str>, source: impl ToString) -> FetchError {
        FetchError::Io {
            operation: operation.to_string(),
            path: path.map(|s| s.to_string()),
            source: source.to_string(),
        }
    }

    pub fn network_error(
        operation: &str,
        url: Option<&str>,
        status: Option<u16>,
        source: impl ToString,
    ) -> FetchError {
        FetchError::Network {
            operation: operation.to_string(),
            url: url.map(|s| s.to_string()),
            status,
            source: source.to_string(),
        }
    }

    pub fn cache_error(operation: &str, asset: Option<&str>, source: impl ToString) -> FetchError {
        FetchError::Cache {
            operation: operation.to_string(),
            asset: asset.map(|s| s.to_string()),
            source: source.to_string(),
        }
    }

    pub fn decode_error(operation: &str, asset: Option<&str>, source: impl ToString) -> FetchError {
        FetchError::Decode {
            operation: operation.to_string(),
            asset: asset.map(|s| s.to_string()),
            source: source.to_string(),
        }
    }

    pub fn protocol_error(operation: &str, host: Option<&str>, reason: impl ToString) -> FetchError {
        FetchError::Protocol {
            operation: operation.to_string(),
            host: host.map(|s| s.to_string()),
            reason: reason.to_string(),
        }
    }

    pub fn config_error(operation: &str, field: Option<&str>, source: impl ToString) -> FetchError {
        FetchError::Config {
            operation: operation.to_string(),
            field: field.map(|s| s.to_string()),
            source: source.to_string(),
        }
    }
}
