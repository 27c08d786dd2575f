//! HTTP [`Backend`] for a remote state storage service.
//!
//! Entries are addressed as `{base}/v1/state/{tenant}/{namespace}/{name}/{key}`
//! where every segment is encoded as unpadded URL-safe base64. One segment
//! per component keeps distinct stores at distinct paths:
//!
//! - `GET` returns the value body, `404` when absent
//! - `PUT` stores the request body
//! - `DELETE` removes the entry (`404` also counts as success)
//! - `POST .../{key}/incr` with `{"amount", "op_id"}` returns `{"value"}`
//!
//! Every request carries the call deadline as its timeout plus `x-op-id`
//! and, when present, `x-idempotency-token` headers.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use fnstate_core::{OpId, StateError, StoreKey};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::{Backend, BackendError, CallOptions, Capabilities, DEFAULT_MAX_VALUE_SIZE};

pub(crate) const OP_ID_HEADER: &str = "x-op-id";
pub(crate) const IDEMPOTENCY_HEADER: &str = "x-idempotency-token";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IncrRequest {
    pub amount: i64,
    pub op_id: OpId,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IncrResponse {
    pub value: i64,
}

/// Error body returned by the state service on rejected requests.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub len: Option<usize>,
}

/// State backend speaking the REST protocol of a remote state service.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    max_value_size: usize,
}

impl HttpBackend {
    /// Creates a backend for the service at `base_url` with a fresh
    /// connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute http(s) URL or the
    /// HTTP client cannot be built.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build()?;
        Self::with_client(base_url, client)
    }

    /// Creates a backend sharing an existing `reqwest` client.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute http(s) URL.
    pub fn with_client(base_url: &str, client: reqwest::Client) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            anyhow::bail!("state storage url must be an http(s) base url: {base_url}");
        }
        Ok(Self {
            client,
            base_url,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        })
    }

    /// Overrides the largest value accepted before a request is sent.
    #[must_use]
    pub fn with_max_value_size(mut self, max_value_size: usize) -> Self {
        self.max_value_size = max_value_size;
        self
    }

    /// URL of one entry, optionally followed by an action segment.
    pub(crate) fn entry_url(&self, store: &StoreKey, key: &[u8], action: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        let scope = [store.tenant(), store.namespace(), store.name()]
            .map(|component| URL_SAFE_NO_PAD.encode(component));
        let encoded_key = URL_SAFE_NO_PAD.encode(key);
        // Checked in the constructor: the base url can be a base.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v1", "state"])
                .extend(&scope)
                .push(&encoded_key);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        url
    }

    async fn send(
        &self,
        request: RequestBuilder,
        opts: &CallOptions,
    ) -> Result<Response, BackendError> {
        let mut request = request
            .timeout(opts.deadline)
            .header(OP_ID_HEADER, opts.op_id.to_string());
        if let Some(token) = &opts.idempotency_token {
            request = request.header(IDEMPOTENCY_HEADER, token.to_string());
        }
        request
            .send()
            .await
            .map_err(|err| transport_error(&err, opts))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn deadline_ms(opts: &CallOptions) -> u64 {
    opts.deadline.as_millis() as u64
}

fn transport_error(err: &reqwest::Error, opts: &CallOptions) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout {
            timeout_ms: deadline_ms(opts),
        }
    } else {
        BackendError::Unavailable(err.to_string())
    }
}

/// Maps a non-success response to a backend error.
pub(crate) fn status_error(status: StatusCode, body: &[u8], opts: &CallOptions) -> BackendError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let message = if parsed.error.is_empty() {
        String::from_utf8_lossy(body).into_owned()
    } else {
        parsed.error
    };
    match status {
        StatusCode::CONFLICT => StateError::CounterTypeConflict {
            len: parsed.len.unwrap_or_default(),
        }
        .into(),
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::BAD_REQUEST => {
            StateError::invalid(format!("rejected by state service: {message}")).into()
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout {
            timeout_ms: deadline_ms(opts),
        },
        _ => BackendError::Unavailable(format!("{status}: {message}")),
    }
}

async fn read_error(response: Response, opts: &CallOptions) -> BackendError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    status_error(status, &body, opts)
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            counters: true,
            max_value_size: self.max_value_size,
        }
    }

    async fn put(
        &self,
        store: &StoreKey,
        key: &[u8],
        value: Bytes,
        opts: &CallOptions,
    ) -> Result<(), BackendError> {
        let url = self.entry_url(store, key, None);
        let response = self.send(self.client.put(url).body(value), opts).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(read_error(response, opts).await)
        }
    }

    async fn get(
        &self,
        store: &StoreKey,
        key: &[u8],
        opts: &CallOptions,
    ) -> Result<Option<Bytes>, BackendError> {
        let url = self.entry_url(store, key, None);
        let response = self.send(self.client.get(url), opts).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .bytes()
                .await
                .map(Some)
                .map_err(|err| transport_error(&err, opts)),
            _ => Err(read_error(response, opts).await),
        }
    }

    async fn delete(
        &self,
        store: &StoreKey,
        key: &[u8],
        opts: &CallOptions,
    ) -> Result<(), BackendError> {
        let url = self.entry_url(store, key, None);
        let response = self.send(self.client.delete(url), opts).await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(read_error(response, opts).await)
        }
    }

    async fn merge_incr(
        &self,
        store: &StoreKey,
        key: &[u8],
        amount: i64,
        opts: &CallOptions,
    ) -> Result<i64, BackendError> {
        let url = self.entry_url(store, key, Some("incr"));
        let body = IncrRequest {
            amount,
            op_id: opts.op_id,
        };
        let response = self.send(self.client.post(url).json(&body), opts).await?;
        if !response.status().is_success() {
            return Err(read_error(response, opts).await);
        }
        let reply: IncrResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Unavailable(format!("malformed incr reply: {err}")))?;
        Ok(reply.value)
    }
}
