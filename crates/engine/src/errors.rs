//! Sidecar engine error definitions.

use kube::core::ErrorResponse;

use crate::{snapshot::ResourceKind, supervisor::Scope};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("api error: {0}")]
    Api(#[from] kube::Error),
    #[error("api server signalled an internal error: {0}")]
    ApiFatal(ErrorResponse),
}

impl SyncError {
    /// A 500 from the api-server kills the loop so the supervisor fails
    /// fast; everything else is throttled and reconnected.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::ApiFatal(_) => true,
            SyncError::Api(kube::Error::Api(response)) => response.code == 500,
            SyncError::Api(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("process for {scope}/{kind} died")]
    LoopDied { scope: Scope, kind: ResourceKind },
    #[error("sync loop panicked: {0}")]
    Panicked(#[from] tokio::task::JoinError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to infer the kubernetes client configuration: {0}")]
    Infer(#[from] kube::config::InferConfigError),
    #[error("failed to build the kubernetes client: {0}")]
    Build(#[from] kube::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> ErrorResponse {
        ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "InternalError".into(),
            code,
        }
    }

    #[test]
    fn only_internal_server_errors_are_fatal() {
        assert!(SyncError::ApiFatal(api_error(500)).is_fatal());
        assert!(SyncError::Api(kube::Error::Api(api_error(500))).is_fatal());
        assert!(!SyncError::Api(kube::Error::Api(api_error(410))).is_fatal());
        assert!(!SyncError::Api(kube::Error::Api(api_error(403))).is_fatal());
    }
}
