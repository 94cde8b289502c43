//! Synchronization engine of the sidecar: watches labelled ConfigMaps and
//! Secrets and keeps a filesystem tree convergent with them.

mod client;
mod errors;
pub mod healthz;
mod list;
mod reconciler;
mod resolver;
mod snapshot;
pub mod supervisor;
mod watch;

use configuration::{BasicAuthEncoding, Settings};
use support::net::{
    BasicAuth, CredentialEncoding, HeaderToken, NotificationTarget, Notifier, NotifierOptions,
    RequestError, RetryPolicy,
};

pub use client::build_client;
pub use errors::{ClientError, SupervisorError, SyncError};
pub use healthz::HealthState;
pub use reconciler::Reconciler;
pub use snapshot::{DataValue, EventKind, Projectable, ResourceKey, ResourceKind, Snapshot};
pub use supervisor::Scope;

/// Maps the request settings onto the shared http notifier used for both
/// the post-change callback and `.url` content fetches.
pub fn build_notifier(settings: &Settings) -> Result<Notifier, RequestError> {
    let request = &settings.request;

    let basic_auth = match (&request.username, &request.password) {
        (Some(username), Some(password)) => Some(BasicAuth {
            username: username.clone(),
            password: password.clone(),
            encoding: match request.basic_auth_encoding {
                BasicAuthEncoding::Latin1 => CredentialEncoding::Latin1,
                BasicAuthEncoding::Utf8 => CredentialEncoding::Utf8,
            },
        }),
        _ => None,
    };

    let token = request.jwt_token.as_ref().map(|token| HeaderToken {
        header: request.jwt_header.clone(),
        token: token.clone(),
    });

    let target = request.url.as_ref().map(|url| NotificationTarget {
        url: url.clone(),
        method: request.method.clone(),
        payload: request.payload.clone(),
    });

    Notifier::new(NotifierOptions {
        retry: RetryPolicy {
            total: request.retry_total,
            connect: request.retry_connect,
            read: request.retry_read,
            backoff_factor: request.retry_backoff_factor,
        },
        timeout: request.timeout,
        accept_invalid_certs: request.skip_tls_verify,
        retry_on_server_errors: !request.enable_5xx,
        basic_auth,
        token,
        target,
    })
}
