use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, error};

use crate::config::AgentConfig;
use crate::errors::{AgentError, GatewayError};

/// Raw bytes of the push stream.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, GatewayError>> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One request/response call. For `GET`, the top-level fields of `body` are
/// sent as query parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub body: Value,
}

impl GatewayRequest {
    pub fn get(path: impl Into<String>, params: Value) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: params,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body,
        }
    }
}

/// Transport used by the client for every call to the helper service.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    /// Issues a call and returns the decoded JSON body of a `200` reply.
    async fn send(&self, request: GatewayRequest) -> Result<Value, GatewayError>;

    /// Opens the long-lived event stream at `path`.
    async fn open_stream(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<ByteStream, GatewayError>;
}

/// [`Gateway`] over HTTP, backed by reqwest.
pub struct HttpGateway {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/event-stream, application/json"),
        );
        let client = build_client(headers.clone(), config.connect_timeout, Some(config.request_timeout))?;
        // The stream stays open for the whole task, so only connecting is bounded.
        let stream_client = build_client(headers, config.connect_timeout, None)?;
        Ok(Self {
            client,
            stream_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn build_client(
    headers: HeaderMap,
    connect_timeout: Duration,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, AgentError> {
    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(connect_timeout);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))
}

#[async_trait::async_trait]
impl Gateway for HttpGateway {
    async fn send(&self, request: GatewayRequest) -> Result<Value, GatewayError> {
        let path = request.path.as_str();
        debug!(path, method = ?request.method, "sending request");
        let http_req = match request.method {
            Method::Post => self.client.post(self.url(path)).json(&request.body),
            Method::Get => self.client.get(self.url(path)).query(&query_pairs(&request.body)),
        };
        let response = http_req
            .send()
            .await
            .map_err(|e| classify_transport(path, &e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(path, &e))?;
        let data: Value = serde_json::from_str(&text).map_err(|_| {
            error!(path, status = status.as_u16(), "non-JSON response");
            GatewayError::InvalidResponse { path: path.to_string() }
        })?;
        if status != reqwest::StatusCode::OK {
            let err = server_error(Some(status.as_u16()), &data);
            error!(path, status = status.as_u16(), code = err.code(), "request rejected");
            return Err(err);
        }
        Ok(data)
    }

    async fn open_stream(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<ByteStream, GatewayError> {
        let response = self
            .stream_client
            .get(self.url(path))
            .query(params)
            .send()
            .await
            .map_err(|e| classify_transport(path, &e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let data = serde_json::from_str(&body).unwrap_or(Value::Null);
            return Err(server_error(Some(status.as_u16()), &data));
        }
        let owned_path = path.to_string();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| classify_transport(&owned_path, &e)));
        Ok(Box::pin(stream))
    }
}

fn classify_transport(path: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::ConnectionTimeout { path: path.to_string() }
    } else {
        GatewayError::ConnectionFailed {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

/// Builds a `Server` error from the `error`/`message` fields of a reply body.
pub(crate) fn server_error(status: Option<u16>, data: &Value) -> GatewayError {
    let code = data
        .get("error")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("http_error");
    let message = data
        .get("message")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| match status {
            Some(status) => format!("HTTP {status}"),
            None => "request failed".to_string(),
        });
    GatewayError::server(status, code, message)
}

fn query_pairs(params: &Value) -> Vec<(String, String)> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}
