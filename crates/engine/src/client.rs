//! Kubernetes client bootstrap.

use std::time::Duration;

use configuration::Settings;
use kube::{Client, Config};
use tracing::{info, warn};

use crate::errors::ClientError;

/// Builds the cluster client: kubeconfig when one is available, in-cluster
/// configuration otherwise. The watch client timeout becomes the read
/// timeout of the underlying connection, the ultimate giveup when the
/// api-server stops talking mid-stream.
pub async fn build_client(settings: &Settings) -> Result<Client, ClientError> {
    let mut config = Config::infer().await?;

    if settings.skip_api_tls_verify {
        warn!("TLS certificate verification for the cluster api is disabled");
        config.accept_invalid_certs = true;
    }
    config.read_timeout = Some(Duration::from_secs(settings.watch_client_timeout));

    info!("config for cluster api at {} loaded", config.cluster_url);

    Ok(Client::try_from(config)?)
}
