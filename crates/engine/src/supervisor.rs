//! Fans out one isolated sync loop per `(namespace, kind)` and fails the
//! whole process as soon as any of them dies.
//!
//! The sidecar always runs under a platform that restarts it, so there is
//! no in-process recovery: one strike and the process exits non-zero,
//! making faults visible to the outer supervision.

use std::{fmt, sync::Arc};

use configuration::{NamespaceSelector, ResourceSelector, Settings, SyncMethod};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use support::net::Notifier;
use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinSet,
};
use tracing::{error, info};

use crate::{
    errors::{SupervisorError, SyncError},
    healthz::HealthState,
    list, watch,
    snapshot::{Projectable, ResourceKind},
};

/// The namespaces one sync loop covers: a single namespace, or the whole
/// cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Namespace(String),
}

impl Scope {
    pub(crate) fn api<K: Projectable>(&self, client: &Client) -> Api<K> {
        match self {
            Scope::All => Api::all(client.clone()),
            Scope::Namespace(namespace) => Api::namespaced(client.clone(), namespace),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "ALL"),
            Scope::Namespace(namespace) => write!(f, "{namespace}"),
        }
    }
}

/// Everything one sync loop needs. Each loop receives its own clone; the
/// reconciler caches built from it are never shared.
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub client: Client,
    pub scope: Scope,
    pub settings: Arc<Settings>,
    pub notifier: Arc<Notifier>,
    pub health: Arc<HealthState>,
}

type ChildExit = (Scope, ResourceKind, Result<(), SyncError>);

/// Spawns the sync loops and supervises them until a termination signal
/// (clean exit) or the first child death (error).
pub async fn run(
    settings: Arc<Settings>,
    client: Client,
    notifier: Arc<Notifier>,
    health: Arc<HealthState>,
) -> Result<(), SupervisorError> {
    let mut children: JoinSet<ChildExit> = JoinSet::new();

    for scope in scopes(&settings.namespaces) {
        for &kind in kinds(settings.resources) {
            let ctx = LoopContext {
                client: client.clone(),
                scope: scope.clone(),
                settings: settings.clone(),
                notifier: notifier.clone(),
                health: health.clone(),
            };
            children.spawn(run_loop(kind, ctx));
        }
    }

    health.mark_ready();
    supervise(children).await
}

async fn run_loop(kind: ResourceKind, ctx: LoopContext) -> ChildExit {
    let scope = ctx.scope.clone();
    let result = match (ctx.settings.method, kind) {
        (SyncMethod::Watch, ResourceKind::ConfigMap) => watch::watch_resource::<ConfigMap>(ctx).await,
        (SyncMethod::Watch, ResourceKind::Secret) => watch::watch_resource::<Secret>(ctx).await,
        (SyncMethod::List, ResourceKind::ConfigMap) => list::list_resource::<ConfigMap>(ctx).await,
        (SyncMethod::List, ResourceKind::Secret) => list::list_resource::<Secret>(ctx).await,
    };
    (scope, kind, result)
}

async fn supervise(mut children: JoinSet<ChildExit>) -> Result<(), SupervisorError> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM, exiting gracefully");
            children.shutdown().await;
            Ok(())
        },
        _ = sigint.recv() => {
            info!("received SIGINT, exiting gracefully");
            children.shutdown().await;
            Ok(())
        },
        Some(first) = children.join_next() => {
            // The loops only return on fatal errors, so any join means a
            // child died. Stop the siblings and fail the process.
            let result = match first {
                Ok((scope, kind, result)) => {
                    if let Err(err) = result {
                        error!("sync loop for {scope}/{kind} failed: {err}");
                    }
                    error!("process for {scope}/{kind} died, stopping and exiting");
                    Err(SupervisorError::LoopDied { scope, kind })
                },
                Err(join_error) => Err(SupervisorError::Panicked(join_error)),
            };
            children.shutdown().await;
            result
        },
    }
}

fn kinds(selector: ResourceSelector) -> &'static [ResourceKind] {
    match selector {
        ResourceSelector::ConfigMap => &[ResourceKind::ConfigMap],
        ResourceSelector::Secret => &[ResourceKind::Secret],
        ResourceSelector::Both => &[ResourceKind::Secret, ResourceKind::ConfigMap],
    }
}

fn scopes(selector: &NamespaceSelector) -> Vec<Scope> {
    match selector {
        NamespaceSelector::All => vec![Scope::All],
        NamespaceSelector::Named(namespaces) => {
            namespaces.iter().cloned().map(Scope::Namespace).collect()
        },
    }
}
