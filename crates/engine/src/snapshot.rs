//! Owned view of a watched resource, decoupled from the api machinery.
//!
//! The reconciler never touches `k8s-openapi` types directly: every
//! ConfigMap or Secret is converted into a [`Snapshot`] first, which also
//! pins down whether each data entry is text or raw bytes.

use std::{collections::BTreeMap, fmt};

use k8s_openapi::{
    api::core::v1::{ConfigMap, Secret},
    NamespaceResourceScope,
};
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ConfigMap,
    Secret,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::ConfigMap => write!(f, "configmap"),
            ResourceKind::Secret => write!(f, "secret"),
        }
    }
}

/// Cache key of a resource within one sync loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One data entry. Text stays text so files end up UTF-8 encoded; binary
/// payloads are carried byte-exact from the api-server to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataValue {
    Text(String),
    Binary(Vec<u8>),
}

impl DataValue {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            DataValue::Text(text) => text.into_bytes(),
            DataValue::Binary(bytes) => bytes,
        }
    }

    pub fn as_utf8(&self) -> Option<&str> {
        match self {
            DataValue::Text(text) => Some(text),
            DataValue::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub resource_version: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, DataValue>,
}

impl Snapshot {
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Added => write!(f, "ADDED"),
            EventKind::Modified => write!(f, "MODIFIED"),
            EventKind::Deleted => write!(f, "DELETED"),
        }
    }
}

/// A namespaced resource kind the sidecar can project.
pub trait Projectable:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
    fn kind() -> ResourceKind;
    fn into_snapshot(self) -> Snapshot;
}

impl Projectable for ConfigMap {
    fn kind() -> ResourceKind {
        ResourceKind::ConfigMap
    }

    fn into_snapshot(self) -> Snapshot {
        let mut data = BTreeMap::new();
        for (key, value) in self.data.unwrap_or_default() {
            data.insert(key, DataValue::Text(value));
        }
        for (key, value) in self.binary_data.unwrap_or_default() {
            data.insert(key, DataValue::Binary(value.0));
        }
        from_metadata(ResourceKind::ConfigMap, self.metadata, data)
    }
}

impl Projectable for Secret {
    fn kind() -> ResourceKind {
        ResourceKind::Secret
    }

    fn into_snapshot(self) -> Snapshot {
        let data = self
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, DataValue::Binary(value.0)))
            .collect();
        from_metadata(ResourceKind::Secret, self.metadata, data)
    }
}

fn from_metadata(
    kind: ResourceKind,
    metadata: kube::core::ObjectMeta,
    data: BTreeMap<String, DataValue>,
) -> Snapshot {
    Snapshot {
        kind,
        namespace: metadata.namespace.unwrap_or_default(),
        name: metadata.name.unwrap_or_default(),
        resource_version: metadata.resource_version,
        annotations: metadata.annotations.unwrap_or_default(),
        data,
    }
}
