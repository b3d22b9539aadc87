//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading and validating gateway configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Shorthand for a field validation failure.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let config_err = Error::Config("no credentials configured".into());
        assert_eq!(
            config_err.to_string(),
            "Configuration error: no credentials configured"
        );

        let invalid = Error::invalid("pool.max_concurrency", "must be greater than 0");
        assert_eq!(
            invalid.to_string(),
            "Invalid `pool.max_concurrency`: must be greater than 0"
        );

        let read_err = Error::Read {
            path: PathBuf::from("/etc/chat-gateway.toml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(
            read_err
                .to_string()
                .starts_with("Failed to read /etc/chat-gateway.toml"),
            "got: {read_err}"
        );
    }

    #[test]
    fn toml_error_converts_via_from() {
        let parse_err = toml::from_str::<toml::Value>("tokens = [").unwrap_err();
        let err: Error = parse_err.into();
        assert!(
            err.to_string().starts_with("TOML parse error:"),
            "got: {err}"
        );
    }

    #[test]
    fn error_debug_includes_variant() {
        let err = Error::invalid("upstream.gateway_url", "missing scheme");
        let debug = format!("{:?}", err);
        assert!(
            debug.contains("Invalid"),
            "Debug should include variant name, got: {debug}"
        );
    }
}
