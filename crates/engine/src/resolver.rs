//! Turns a resource data entry into the file it projects to.

use support::net::{Notifier, RequestError};

use crate::snapshot::{DataValue, ResourceKind};

const URL_SUFFIX: &str = ".url";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("value of {0} is not a utf-8 url")]
    UrlNotUtf8(String),
    #[error("failed to fetch content for {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: RequestError,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// The filename a data key projects to, with any `.url` marker stripped.
pub fn target_filename(data_key: &str) -> &str {
    data_key.strip_suffix(URL_SUFFIX).unwrap_or(data_key)
}

/// Resolves a data entry to its projected file. A key ending in `.url`
/// holds the address of the real content, which is fetched through the
/// shared request primitive; the fetched body is written as-is and is not
/// itself rescanned for indirection.
pub async fn resolve(
    data_key: &str,
    value: &DataValue,
    fetcher: &Notifier,
) -> Result<ResolvedFile, ResolveError> {
    let filename = target_filename(data_key);
    if filename.len() == data_key.len() {
        return Ok(ResolvedFile {
            filename: filename.to_string(),
            bytes: value.clone().into_bytes(),
        });
    }

    let url = value
        .as_utf8()
        .ok_or_else(|| ResolveError::UrlNotUtf8(data_key.to_string()))?;
    let bytes = fetcher.fetch(url).await.map_err(|source| ResolveError::Fetch {
        key: data_key.to_string(),
        source,
    })?;

    Ok(ResolvedFile {
        filename: filename.to_string(),
        bytes,
    })
}

/// Disambiguating rename used when distinct resources may carry the same
/// data key, e.g. `namespace_a.configmap_cm1.app.conf`.
pub fn unique_filename(
    filename: &str,
    namespace: &str,
    kind: ResourceKind,
    resource_name: &str,
) -> String {
    format!("namespace_{namespace}.{kind}_{resource_name}.{filename}")
}
