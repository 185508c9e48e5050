//! Wire types exchanged with the host-supplied transport, plus a blocking reqwest
//! adapter for hosts that do not bring their own HTTP stack.

use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, DATE};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Transport function injected by the host. Takes a serialized [`RequestParams`] and
/// returns a serialized [`HttpResult`]. An empty string means the transport failed
/// so badly it could not even describe the failure.
pub type MakeHttpRequestFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Transport-agnostic description of a request to the PsiCash server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    pub method: String,
    /// Path including the API version prefix, e.g. `/v1/transaction`.
    pub path: String,
    /// Query parameters as a JSON object. Values may be strings or numbers.
    pub query: Value,
    /// Header values are strings, except `X-PsiCash-Metadata` which is a JSON object.
    pub headers: Map<String, Value>,
}

/// Status used in an envelope when the exchange never completed.
pub const TRANSPORT_ERROR_STATUS: i32 = -1;

/// Envelope the transport returns for every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResult {
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Value of the response `Date` header (RFC 7231).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Set when the transport itself failed (DNS, TLS, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HttpResult {
    fn transport_error(message: impl Into<String>) -> Self {
        Self {
            status: TRANSPORT_ERROR_STATUS,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    fn to_json(&self) -> String {
        // Serializing plain strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Blocking transport backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Performs the request described by `request_params` and returns the serialized envelope.
    pub fn execute(&self, request_params: &str) -> String {
        match self.try_execute(request_params) {
            Ok(result) => result.to_json(),
            Err(message) => {
                tracing::debug!(error = %message, "reqwest transport failed");
                HttpResult::transport_error(message).to_json()
            }
        }
    }

    pub fn into_request_fn(self) -> MakeHttpRequestFn {
        Box::new(move |request_params: &str| self.execute(request_params))
    }

    fn try_execute(&self, request_params: &str) -> Result<HttpResult, String> {
        let params: RequestParams = serde_json::from_str(request_params)
            .map_err(|err| format!("invalid request params: {err}"))?;

        let url = build_url(&params)?;
        let method = Method::from_bytes(params.method.as_bytes())
            .map_err(|err| format!("invalid method {}: {err}", params.method))?;
        let headers = build_headers(&params.headers)?;

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .send()
            .map_err(|err| format!("request failed: {err}"))?;

        let status = i32::from(response.status().as_u16());
        let date = response
            .headers()
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .map_err(|err| format!("failed to read response body: {err}"))?;

        Ok(HttpResult {
            status,
            body: Some(body),
            date,
            error: None,
        })
    }
}

/// Renders a JSON scalar the way it should appear in a URL or header.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_url(params: &RequestParams) -> Result<Url, String> {
    let base = format!(
        "{}://{}:{}{}",
        params.scheme, params.hostname, params.port, params.path
    );

    let query: BTreeMap<&str, String> = match &params.query {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.as_str(), value_to_string(v)))
            .collect(),
        Value::Null => BTreeMap::new(),
        other => return Err(format!("query must be an object, got {other}")),
    };

    if query.is_empty() {
        Url::parse(&base).map_err(|err| format!("invalid url {base}: {err}"))
    } else {
        Url::parse_with_params(&base, &query).map_err(|err| format!("invalid url {base}: {err}"))
    }
}

fn build_headers(headers: &Map<String, Value>) -> Result<HeaderMap, String> {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| format!("invalid header name {name}: {err}"))?;
        let value = HeaderValue::from_str(&value_to_string(value))
            .map_err(|err| format!("invalid header value for {name}: {err}"))?;
        out.insert(name, value);
    }
    Ok(out)
}
