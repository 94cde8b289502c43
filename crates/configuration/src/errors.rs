//! Sidecar configuration error definitions.

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} must be set")]
    MissingVariable(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("unable to read the service-account namespace: {0}")]
    Namespace(#[source] std::io::Error),
}
