//! Configuration for the sidecar, resolved from environment variables.
//!
//! Every knob mirrors an environment variable of the deployment contract;
//! [`Settings::from_env`] reads them all once at startup so the rest of the
//! system works with typed values.

mod errors;

use std::{path::PathBuf, str::FromStr, time::Duration};

use serde_json::Value;
use tracing::warn;
use url::Url;

pub use errors::ConfigError;

pub const DEFAULT_FOLDER_ANNOTATION: &str = "k8s-sidecar-target-directory";

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Which resource kinds are projected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSelector {
    ConfigMap,
    Secret,
    Both,
}

/// Which namespaces are synchronized; one isolated loop runs per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceSelector {
    All,
    Named(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    Watch,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicAuthEncoding {
    Latin1,
    Utf8,
}

/// Settings for the outbound notification endpoint and for `.url` fetches.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub url: Option<Url>,
    pub method: Option<String>,
    pub payload: Option<Value>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub basic_auth_encoding: BasicAuthEncoding,
    pub jwt_token: Option<String>,
    pub jwt_header: String,
    pub retry_total: u32,
    pub retry_connect: u32,
    pub retry_read: u32,
    pub retry_backoff_factor: f64,
    pub timeout: Duration,
    pub skip_tls_verify: bool,
    pub enable_5xx: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub label: String,
    pub label_value: Option<String>,
    pub folder: PathBuf,
    pub folder_annotation: String,
    pub resources: ResourceSelector,
    pub namespaces: NamespaceSelector,
    pub method: SyncMethod,
    pub sleep_time: Duration,
    pub error_throttle: Duration,
    /// Polite request to the api-server to close the watch after this many
    /// seconds.
    pub watch_server_timeout: u32,
    /// Client socket timeout, the ultimate giveup; keep it slightly larger
    /// than the server timeout.
    pub watch_client_timeout: u64,
    pub script: Option<PathBuf>,
    pub unique_filenames: bool,
    pub ignore_already_processed: bool,
    pub default_file_mode: Option<u32>,
    pub skip_api_tls_verify: bool,
    pub health_port: u16,
    pub request: RequestSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let label = lookup("LABEL").ok_or(ConfigError::MissingVariable("LABEL"))?;
        let folder = lookup("FOLDER").ok_or(ConfigError::MissingVariable("FOLDER"))?;

        let resources = match lookup("RESOURCE").as_deref() {
            None | Some("configmap") => ResourceSelector::ConfigMap,
            Some("secret") => ResourceSelector::Secret,
            Some("both") => ResourceSelector::Both,
            Some(other) => {
                return Err(invalid("RESOURCE", other, "expected configmap, secret or both"))
            },
        };

        let namespaces = match lookup("NAMESPACE") {
            Some(raw) if raw == "ALL" => NamespaceSelector::All,
            Some(raw) => NamespaceSelector::Named(
                raw.split(',')
                    .map(|ns| ns.trim().to_string())
                    .filter(|ns| !ns.is_empty())
                    .collect(),
            ),
            // Fall back to the namespace this pod runs in.
            None => {
                let own = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
                    .map_err(ConfigError::Namespace)?;
                NamespaceSelector::Named(vec![own.trim().to_string()])
            },
        };

        let method = match lookup("METHOD").as_deref() {
            Some("LIST") => SyncMethod::List,
            _ => SyncMethod::Watch,
        };

        let default_file_mode = lookup("DEFAULT_FILE_MODE")
            .map(|raw| {
                u32::from_str_radix(&raw, 8)
                    .map_err(|err| invalid("DEFAULT_FILE_MODE", &raw, &err.to_string()))
            })
            .transpose()?;

        Ok(Self {
            label,
            label_value: lookup("LABEL_VALUE"),
            folder: PathBuf::from(folder),
            folder_annotation: lookup("FOLDER_ANNOTATION")
                .unwrap_or_else(|| DEFAULT_FOLDER_ANNOTATION.to_string()),
            resources,
            namespaces,
            method,
            sleep_time: Duration::from_secs(parsed(&lookup, "SLEEP_TIME")?.unwrap_or(60)),
            error_throttle: Duration::from_secs(
                parsed(&lookup, "ERROR_THROTTLE_SLEEP")?.unwrap_or(5),
            ),
            watch_server_timeout: parsed(&lookup, "WATCH_SERVER_TIMEOUT")?.unwrap_or(60),
            watch_client_timeout: parsed(&lookup, "WATCH_CLIENT_TIMEOUT")?.unwrap_or(66),
            script: lookup("SCRIPT").map(PathBuf::from),
            unique_filenames: flag(&lookup, "UNIQUE_FILENAMES"),
            ignore_already_processed: flag(&lookup, "IGNORE_ALREADY_PROCESSED"),
            default_file_mode,
            skip_api_tls_verify: flag(&lookup, "SKIP_TLS_VERIFY"),
            health_port: parsed(&lookup, "HEALTH_PORT")?.unwrap_or(8080),
            request: RequestSettings::from_lookup(&lookup)?,
        })
    }

    /// The selector matching projected resources: `key=value` when a label
    /// value is configured, bare key presence otherwise.
    pub fn label_selector(&self) -> String {
        match &self.label_value {
            Some(value) => format!("{}={}", self.label, value),
            None => self.label.clone(),
        }
    }
}

impl RequestSettings {
    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("REQ_URL")
            .map(|raw| Url::parse(&raw).map_err(|err| invalid("REQ_URL", &raw, &err.to_string())))
            .transpose()?;

        let payload = lookup("REQ_PAYLOAD").map(|raw| {
            serde_json::from_str(&raw).unwrap_or_else(|_| {
                warn!("payload will be posted as quoted json");
                Value::String(raw)
            })
        });

        let basic_auth_encoding = match lookup("REQ_BASIC_AUTH_ENCODING").as_deref() {
            None | Some("latin1") => BasicAuthEncoding::Latin1,
            Some("utf8") | Some("utf-8") => BasicAuthEncoding::Utf8,
            Some(other) => {
                return Err(invalid("REQ_BASIC_AUTH_ENCODING", other, "expected latin1 or utf8"))
            },
        };

        Ok(Self {
            url,
            method: lookup("REQ_METHOD"),
            payload,
            username: lookup("REQ_USERNAME"),
            password: lookup("REQ_PASSWORD"),
            basic_auth_encoding,
            jwt_token: lookup("REQ_JWT_TOKEN"),
            jwt_header: lookup("REQ_JWT_HEADER").unwrap_or_else(|| "Authorization".to_string()),
            retry_total: parsed(lookup, "REQ_RETRY_TOTAL")?.unwrap_or(5),
            retry_connect: parsed(lookup, "REQ_RETRY_CONNECT")?.unwrap_or(10),
            retry_read: parsed(lookup, "REQ_RETRY_READ")?.unwrap_or(5),
            retry_backoff_factor: parsed(lookup, "REQ_RETRY_BACKOFF_FACTOR")?.unwrap_or(1.1),
            timeout: Duration::from_secs_f64(parsed(lookup, "REQ_TIMEOUT")?.unwrap_or(10.0)),
            skip_tls_verify: flag(lookup, "REQ_SKIP_TLS_VERIFY"),
            enable_5xx: flag(lookup, "ENABLE_5XX"),
        })
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parsed<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| raw.parse().map_err(|err: T::Err| invalid(name, &raw, &err.to_string())))
        .transpose()
}

fn flag<F>(lookup: &F, name: &'static str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).is_some_and(|raw| raw.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![("LABEL", "app.kubernetes.io/managed"), ("FOLDER", "/t"), ("NAMESPACE", "a")]
    }

    #[test]
    fn minimal_settings_use_the_documented_defaults() {
        let settings = Settings::from_lookup(vars(&minimal())).unwrap();

        assert_eq!(settings.resources, ResourceSelector::ConfigMap);
        assert_eq!(settings.method, SyncMethod::Watch);
        assert_eq!(settings.folder_annotation, DEFAULT_FOLDER_ANNOTATION);
        assert_eq!(settings.sleep_time, Duration::from_secs(60));
        assert_eq!(settings.error_throttle, Duration::from_secs(5));
        assert_eq!(settings.watch_server_timeout, 60);
        assert_eq!(settings.watch_client_timeout, 66);
        assert_eq!(settings.request.retry_total, 5);
        assert_eq!(settings.request.retry_connect, 10);
        assert_eq!(settings.request.retry_read, 5);
        assert_eq!(settings.request.retry_backoff_factor, 1.1);
        assert_eq!(settings.request.timeout, Duration::from_secs(10));
        assert_eq!(settings.request.basic_auth_encoding, BasicAuthEncoding::Latin1);
        assert!(!settings.unique_filenames);
        assert!(!settings.ignore_already_processed);
        assert_eq!(settings.health_port, 8080);
    }

    #[test]
    fn label_and_folder_are_required() {
        let err = Settings::from_lookup(vars(&[("FOLDER", "/t")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable("LABEL")));

        let err = Settings::from_lookup(vars(&[("LABEL", "l")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable("FOLDER")));
    }

    #[test]
    fn label_selector_includes_the_value_when_present() {
        let mut pairs = minimal();
        assert_eq!(
            Settings::from_lookup(vars(&pairs)).unwrap().label_selector(),
            "app.kubernetes.io/managed"
        );

        pairs.push(("LABEL_VALUE", "true"));
        assert_eq!(
            Settings::from_lookup(vars(&pairs)).unwrap().label_selector(),
            "app.kubernetes.io/managed=true"
        );
    }

    #[test]
    fn namespaces_parse_as_a_comma_separated_list_or_all() {
        let mut pairs = minimal();
        pairs.retain(|(k, _)| *k != "NAMESPACE");

        let mut with_list = pairs.clone();
        with_list.push(("NAMESPACE", "a, b,c"));
        assert_eq!(
            Settings::from_lookup(vars(&with_list)).unwrap().namespaces,
            NamespaceSelector::Named(vec!["a".into(), "b".into(), "c".into()])
        );

        let mut with_all = pairs.clone();
        with_all.push(("NAMESPACE", "ALL"));
        assert_eq!(
            Settings::from_lookup(vars(&with_all)).unwrap().namespaces,
            NamespaceSelector::All
        );
    }

    #[test]
    fn resource_selector_accepts_both() {
        let mut pairs = minimal();
        pairs.push(("RESOURCE", "both"));
        assert_eq!(
            Settings::from_lookup(vars(&pairs)).unwrap().resources,
            ResourceSelector::Both
        );

        let mut pairs = minimal();
        pairs.push(("RESOURCE", "deployment"));
        assert!(Settings::from_lookup(vars(&pairs)).is_err());
    }

    #[test]
    fn default_file_mode_is_octal() {
        let mut pairs = minimal();
        pairs.push(("DEFAULT_FILE_MODE", "0640"));
        assert_eq!(
            Settings::from_lookup(vars(&pairs)).unwrap().default_file_mode,
            Some(0o640)
        );

        let mut pairs = minimal();
        pairs.push(("DEFAULT_FILE_MODE", "9xy"));
        assert!(Settings::from_lookup(vars(&pairs)).is_err());
    }

    #[test]
    fn request_payload_falls_back_to_a_quoted_string() {
        let mut pairs = minimal();
        pairs.push(("REQ_PAYLOAD", r#"{"reload": true}"#));
        let settings = Settings::from_lookup(vars(&pairs)).unwrap();
        assert_eq!(settings.request.payload, Some(serde_json::json!({"reload": true})));

        let mut pairs = minimal();
        pairs.push(("REQ_PAYLOAD", "not json"));
        let settings = Settings::from_lookup(vars(&pairs)).unwrap();
        assert_eq!(settings.request.payload, Some(Value::String("not json".into())));
    }

    #[test]
    fn invalid_request_url_is_rejected() {
        let mut pairs = minimal();
        pairs.push(("REQ_URL", "not a url"));
        assert!(matches!(
            Settings::from_lookup(vars(&pairs)).unwrap_err(),
            ConfigError::InvalidValue { name: "REQ_URL", .. }
        ));
    }
}
