//! Outbound HTTP with retry, backoff and pluggable authentication.
//!
//! One [`Notifier`] wraps a shared [`reqwest::Client`] and is used both for
//! the post-change callback and as the request primitive for `.url`
//! content indirection.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{
    header::{HeaderName, HeaderValue, AUTHORIZATION},
    Client, Method, StatusCode,
};
use serde_json::Value;
use tracing::{debug, error, warn};
use url::Url;

/// Statuses that trigger a retry unless 5xx responses are allowed through.
const FORCED_RETRY_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Upper bound on a single backoff sleep.
const BACKOFF_MAX: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid url {0:?}: {1}")]
    InvalidUrl(String, #[source] url::ParseError),
    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),
    #[error("header {0} has a non-ascii value")]
    InvalidHeaderValue(String),
    #[error("basic-auth credentials contain characters outside the {0:?} encoding")]
    CredentialEncoding(CredentialEncoding),
    #[error("failed to build http client: {0}")]
    BuildClient(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} exhausted retries, last status {status}")]
    RetriesExhausted { url: Url, status: StatusCode },
}

/// Retry budgets mirroring the `REQ_RETRY_*` environment variables: every
/// retry consumes `total`, connection failures additionally consume
/// `connect` and read/timeout failures `read`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub total: u32,
    pub connect: u32,
    pub read: u32,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            total: 5,
            connect: 10,
            read: 5,
            backoff_factor: 1.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialEncoding {
    Latin1,
    Utf8,
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
    pub encoding: CredentialEncoding,
}

/// A token presented in a configurable request header. The default
/// `Authorization` header gets the conventional `Bearer ` prefix, any other
/// header carries the raw token.
#[derive(Debug, Clone)]
pub struct HeaderToken {
    pub header: String,
    pub token: String,
}

/// The configured post-change callback endpoint.
#[derive(Debug, Clone)]
pub struct NotificationTarget {
    pub url: Url,
    pub method: Option<String>,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NotifierOptions {
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub accept_invalid_certs: bool,
    /// When false, 5xx responses are treated as final instead of retried.
    pub retry_on_server_errors: bool,
    pub basic_auth: Option<BasicAuth>,
    pub token: Option<HeaderToken>,
    pub target: Option<NotificationTarget>,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(10),
            accept_invalid_certs: false,
            retry_on_server_errors: true,
            basic_auth: None,
            token: None,
            target: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

enum Failure {
    Status(StatusCode),
    Connect(reqwest::Error),
    Read(reqwest::Error),
}

pub struct Notifier {
    client: Client,
    retry: RetryPolicy,
    retry_on_server_errors: bool,
    headers: Vec<(HeaderName, HeaderValue)>,
    target: Option<NotificationTarget>,
}

impl Notifier {
    pub fn new(options: NotifierOptions) -> Result<Self, RequestError> {
        let mut builder = Client::builder().timeout(options.timeout);
        if options.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().map_err(RequestError::BuildClient)?;

        let mut headers = Vec::new();
        if let Some(basic) = &options.basic_auth {
            headers.push((AUTHORIZATION, basic_auth_header(basic)?));
            debug!("basic-auth configured, username: {}", basic.username);
        }
        if let Some(token) = &options.token {
            headers.push(token_header(token)?);
            debug!("token based authorization configured, header: {}", token.header);
        }

        Ok(Self {
            client,
            retry: options.retry,
            retry_on_server_errors: options.retry_on_server_errors,
            headers,
            target: options.target,
        })
    }

    /// Sends the configured callback. Failures are logged, never propagated:
    /// a broken notification endpoint must not fail the reconciliation.
    pub async fn notify(&self) {
        let Some(target) = &self.target else {
            debug!("no notification url provided, doing nothing");
            return;
        };

        let method = match target.method.as_deref() {
            None | Some("") | Some("GET") => Method::GET,
            Some("POST") => Method::POST,
            Some(other) => {
                warn!("invalid request method {other:?}, please use GET or POST, doing nothing");
                return;
            },
        };
        let payload = (method == Method::POST).then_some(target.payload.as_ref()).flatten();

        match self.request(method.clone(), &target.url, payload).await {
            Ok(response) => {
                debug!(
                    "{method} request sent to {}, response: {} {}",
                    target.url,
                    response.status,
                    String::from_utf8_lossy(&response.body),
                );
            },
            Err(err) => error!("notification request failed: {err}"),
        }
    }

    /// GETs `url` and returns the response body. Used for `.url` data keys.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, RequestError> {
        let url = Url::parse(url).map_err(|err| RequestError::InvalidUrl(url.to_string(), err))?;
        let response = self.request(Method::GET, &url, None).await?;
        debug!("GET request sent to {url}, response: {}", response.status);
        Ok(response.body)
    }

    async fn request(
        &self,
        method: Method,
        url: &Url,
        payload: Option<&Value>,
    ) -> Result<HttpResponse, RequestError> {
        let mut total_left = self.retry.total;
        let mut connect_left = self.retry.connect;
        let mut read_left = self.retry.read;
        let mut failures: u32 = 0;

        loop {
            let failure = match self.send_once(method.clone(), url, payload).await {
                Ok(response) if !self.must_retry(response.status) => return Ok(response),
                Ok(response) => Failure::Status(response.status),
                Err(err) if err.is_connect() => Failure::Connect(err),
                Err(err) => Failure::Read(err),
            };

            let exhausted = total_left == 0
                || match &failure {
                    Failure::Status(_) => false,
                    Failure::Connect(_) => connect_left == 0,
                    Failure::Read(_) => read_left == 0,
                };
            if exhausted {
                return Err(match failure {
                    Failure::Status(status) => RequestError::RetriesExhausted {
                        url: url.clone(),
                        status,
                    },
                    Failure::Connect(source) | Failure::Read(source) => RequestError::Transport {
                        url: url.clone(),
                        source,
                    },
                });
            }
            total_left -= 1;
            match &failure {
                Failure::Status(status) => warn!("request to {url} returned {status}, retrying"),
                Failure::Connect(err) => {
                    connect_left -= 1;
                    warn!("connection to {url} failed ({err}), retrying");
                },
                Failure::Read(err) => {
                    read_left -= 1;
                    warn!("request to {url} failed ({err}), retrying");
                },
            }

            failures += 1;
            tokio::time::sleep(self.backoff(failures)).await;
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &Url,
        payload: Option<&Value>,
    ) -> Result<HttpResponse, reqwest::Error> {
        let mut builder = self.client.request(method, url.clone());
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }

    fn must_retry(&self, status: StatusCode) -> bool {
        self.retry_on_server_errors && FORCED_RETRY_STATUSES.contains(&status.as_u16())
    }

    fn backoff(&self, failures: u32) -> Duration {
        let secs = self.retry.backoff_factor * f64::powi(2.0, failures.saturating_sub(1) as i32);
        Duration::from_secs_f64(secs.max(0.0)).min(BACKOFF_MAX)
    }
}

fn basic_auth_header(auth: &BasicAuth) -> Result<HeaderValue, RequestError> {
    let credentials = format!("{}:{}", auth.username, auth.password);
    let raw = match auth.encoding {
        CredentialEncoding::Latin1 => encode_latin1(&credentials)
            .ok_or(RequestError::CredentialEncoding(CredentialEncoding::Latin1))?,
        CredentialEncoding::Utf8 => credentials.into_bytes(),
    };
    let value = format!("Basic {}", BASE64.encode(raw));
    HeaderValue::from_str(&value)
        .map_err(|_| RequestError::InvalidHeaderValue(AUTHORIZATION.to_string()))
}

fn token_header(token: &HeaderToken) -> Result<(HeaderName, HeaderValue), RequestError> {
    let name = HeaderName::from_bytes(token.header.as_bytes())
        .map_err(|_| RequestError::InvalidHeaderName(token.header.clone()))?;
    let value = if name == AUTHORIZATION {
        format!("Bearer {}", token.token)
    } else {
        token.token.clone()
    };
    let value = HeaderValue::from_str(&value)
        .map_err(|_| RequestError::InvalidHeaderValue(token.header.clone()))?;
    Ok((name, value))
}

fn encode_latin1(value: &str) -> Option<Vec<u8>> {
    value
        .chars()
        .map(|c| {
            let cp = c as u32;
            (cp <= 0xFF).then_some(cp as u8)
        })
        .collect()
}
