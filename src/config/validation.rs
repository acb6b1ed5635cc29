use std::net::IpAddr;

use url::Url;

use crate::config::models::{ProxyConfig, SslConfig, StoreConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Invalid store configuration: {message}")]
    InvalidStore { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Proxy configuration validator
pub struct ProxyConfigValidator;

impl ProxyConfigValidator {
    /// Validate the entire proxy configuration
    pub fn validate(config: &ProxyConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.addresses.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "addresses".to_string(),
            });
        }
        for address in &config.addresses {
            if address.parse::<IpAddr>().is_err() {
                errors.push(ValidationError::InvalidListenAddress {
                    address: address.clone(),
                    reason: "Must be an IP address (e.g., '127.0.0.1' or '0.0.0.0')".to_string(),
                });
            }
        }

        if config.ports.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "ports".to_string(),
            });
        }
        for port in &config.ports {
            if *port == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "ports".to_string(),
                    message: "Port 0 is not a valid listen port".to_string(),
                });
            }
        }

        if let Some(ssl) = &config.ssl {
            errors.extend(Self::validate_ssl(ssl, &config.ports));
        }

        errors.extend(Self::validate_store(&config.store));

        if config.shutdown.grace_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "shutdown.grace_secs".to_string(),
                message: "Shutdown grace period must be at least one second".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_ssl(ssl: &SslConfig, listen_ports: &[u16]) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for port in &ssl.ports {
            if !listen_ports.contains(port) {
                errors.push(ValidationError::InvalidTls {
                    message: format!("TLS port {port} is not in the listen ports list"),
                });
            }
        }
        if !ssl.ports.is_empty() {
            if ssl.cert.is_empty() {
                errors.push(ValidationError::InvalidTls {
                    message: "TLS ports configured but no certificate path given".to_string(),
                });
            }
            if ssl.key.is_empty() {
                errors.push(ValidationError::InvalidTls {
                    message: "TLS ports configured but no private key path given".to_string(),
                });
            }
        }

        errors
    }

    fn validate_store(store: &StoreConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        match Url::parse(&store.endpoint) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(ValidationError::InvalidStore {
                message: format!(
                    "Store endpoint scheme '{}' is not supported; use http or https",
                    url.scheme()
                ),
            }),
            Err(e) => errors.push(ValidationError::InvalidStore {
                message: format!("Store endpoint '{}' is not a valid URL: {e}", store.endpoint),
            }),
        }

        if !store.directory.starts_with('/') {
            errors.push(ValidationError::InvalidStore {
                message: format!(
                    "Store directory '{}' must be an absolute key path",
                    store.directory
                ),
            });
        }

        if store.watch_idle_secs == 0 {
            errors.push(ValidationError::InvalidStore {
                message: "store.watch_idle_secs must be at least one second".to_string(),
            });
        }

        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let error_messages: Vec<String> = errors.iter().map(|e| format!("  • {e}")).collect();
        format!(
            "Found {} validation error(s):\n{}",
            errors.len(),
            error_messages.join("\n")
        )
    }
}
