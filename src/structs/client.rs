use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use url::{form_urlencoded, Url};

use super::user::UserData;
use super::{Purchase, PurchasePrice, TokenType};
use crate::datastore::LoadOutcome;
use crate::errors::{ErrorKind, PsiCashError, Result, WrapError};
use crate::transport::{HttpResult, MakeHttpRequestFn, RequestParams, TRANSPORT_ERROR_STATUS};

pub const DEFAULT_API_SERVER_SCHEME: &str = "https";
pub const DEFAULT_API_SERVER_HOSTNAME: &str = "dev-api.psi.cash";
pub const DEFAULT_API_SERVER_PORT: u16 = 443;
pub const DEFAULT_API_VERSION: &str = "v1";
pub const DEFAULT_USER_AGENT: &str = "Psiphon-PsiCash-iOS";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

const AUTH_HEADER: &str = "X-PsiCash-Auth";
const METADATA_HEADER: &str = "X-PsiCash-Metadata";
const USER_AGENT_HEADER: &str = "User-Agent";
const LANDING_PAGE_PARAM_KEY: &str = "psicash";
const PAYLOAD_VERSION: u32 = 1;

/// Where the PsiCash API server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiServer {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
}

impl Default for ApiServer {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_API_SERVER_SCHEME.to_string(),
            hostname: DEFAULT_API_SERVER_HOSTNAME.to_string(),
            port: DEFAULT_API_SERVER_PORT,
        }
    }
}

/// PsiCash client options. Pass this into `Client::new()`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Directory holding the local datastore. Created if missing.
    pub file_store_root: PathBuf,
    pub server: ApiServer,
    /// Version segment prefixed to every request path.
    pub api_version: String,
    pub user_agent: String,
    /// Total attempts per request, including the first. Values below 1 act as 1.
    pub max_attempts: u32,
    /// Attempt `n` (counting from zero) waits `n * retry_backoff` before it is sent.
    pub retry_backoff: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            file_store_root: PathBuf::new(),
            server: ApiServer::default(),
            api_version: DEFAULT_API_VERSION.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// PsiCash client. Owns the local user data and talks to the server through the
/// host-supplied transport.
///
/// A client is not internally synchronized; callers must serialize access to it.
pub struct Client {
    pub(crate) options: ClientOptions,
    pub(crate) user_data: UserData,
    make_http_request: MakeHttpRequestFn,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.options)
            .field("user_data", &self.user_data)
            .field("make_http_request", &"<fn>")
            .finish()
    }
}

impl Client {
    /// Creates a client backed by the datastore under `options.file_store_root`.
    ///
    /// If the datastore cannot be loaded it is cleared and loaded once more; only a
    /// second failure is reported.
    pub fn new(options: ClientOptions, make_http_request: MakeHttpRequestFn) -> Result<Self> {
        if options.file_store_root.as_os_str().is_empty() {
            return Err(PsiCashError::new(
                ErrorKind::InvalidArgument,
                "file_store_root is empty",
            ));
        }

        let mut user_data = UserData::new();
        let outcome = match user_data.load(&options.file_store_root) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "user data load failed; resetting");
                if let Err(err) = user_data.clear() {
                    tracing::warn!(error = %err, "user data clear failed");
                }
                user_data
                    .load(&options.file_store_root)
                    .wrap_err("user data load failed after reset")?
            }
        };

        if outcome == LoadOutcome::Reinitialized {
            tracing::debug!(root = %options.file_store_root.display(), "starting with empty user data");
        }

        Ok(Self {
            options,
            user_data,
            make_http_request,
        })
    }

    pub fn set_http_request_fn(&mut self, make_http_request: MakeHttpRequestFn) {
        self.make_http_request = make_http_request;
    }

    /// Clears all stored user state, as if freshly installed.
    pub fn reset_user(&mut self) -> Result<()> {
        self.user_data.clear().wrap_err("reset user failed")
    }

    pub fn set_request_metadata_item(&mut self, key: &str, value: &str) -> Result<()> {
        self.user_data
            .set_request_metadata_item(key, value)
            .wrap_err("set request metadata item failed")
    }

    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    pub fn user_data_mut(&mut self) -> &mut UserData {
        &mut self.user_data
    }

    pub fn is_account(&self) -> bool {
        self.user_data.is_account()
    }

    pub fn valid_token_types(&self) -> Vec<TokenType> {
        self.user_data.auth_tokens().into_keys().collect()
    }

    pub fn balance(&self) -> i64 {
        self.user_data.balance()
    }

    pub fn purchase_prices(&self) -> Vec<PurchasePrice> {
        self.user_data.purchase_prices()
    }

    pub fn purchases(&self) -> Vec<Purchase> {
        self.user_data.purchases()
    }

    /// Adds the earner token and request metadata to a landing page URL.
    ///
    /// The data goes into the fragment so it is not sent to the server. If the URL
    /// already has a fragment it goes into the query instead.
    pub fn modify_landing_page(&self, url: &str) -> Result<String> {
        let mut url = Url::parse(url).map_err(|err| {
            PsiCashError::new(ErrorKind::InvalidArgument, format!("url parse failed: {err}"))
        })?;

        let earner = self.user_data.auth_tokens().remove(&TokenType::Earner);
        let payload = self.payload_json(earner)?;

        if url.fragment().map_or(true, str::is_empty) {
            let encoded: String = form_urlencoded::byte_serialize(payload.as_bytes()).collect();
            url.set_fragment(Some(&format!("{LANDING_PAGE_PARAM_KEY}={encoded}")));
        } else {
            url.query_pairs_mut()
                .append_pair(LANDING_PAGE_PARAM_KEY, &payload);
        }

        Ok(url.to_string())
    }

    /// Base64-encoded JSON for rewarded-activity webhooks. Requires an earner token.
    pub fn rewarded_activity_data(&self) -> Result<String> {
        let Some(earner) = self.user_data.auth_tokens().remove(&TokenType::Earner) else {
            return Err(PsiCashError::new(
                ErrorKind::InvalidArgument,
                "earner token missing; can't create webhook data",
            ));
        };

        let payload = self.payload_json(Some(earner))?;
        Ok(BASE64_STANDARD.encode(payload))
    }

    /// Snapshot of client state that is safe to include in bug reports.
    pub fn diagnostic_info(&self) -> Value {
        let purchases: Vec<Value> = self
            .purchases()
            .into_iter()
            .map(|p| json!({"class": p.transaction_class, "distinguisher": p.distinguisher}))
            .collect();

        json!({
            "validTokenTypes": self.valid_token_types(),
            "isAccount": self.is_account(),
            "balance": self.balance(),
            "serverTimeDiff": self.user_data.server_time_diff().num_milliseconds(),
            "purchasePrices": self.purchase_prices(),
            "purchases": purchases,
        })
    }

    fn payload_json(&self, earner: Option<String>) -> Result<String> {
        let payload = json!({
            "v": PAYLOAD_VERSION,
            "tokens": earner,
            "metadata": self.user_data.request_metadata(),
        });
        serde_json::to_string(&payload).map_err(|err| {
            PsiCashError::new(ErrorKind::Parse, format!("json dump failed: {err}"))
        })
    }

    /// Sends a request through the transport, retrying on server errors.
    ///
    /// A response with status >= 500 is retried until attempts run out, then returned
    /// as-is. Anything below 500 is returned immediately. Transport failures are errors
    /// and are never retried.
    pub(crate) fn make_http_request_with_retry(
        &mut self,
        method: &str,
        path: &str,
        include_auth_tokens: bool,
        query: &Value,
    ) -> Result<HttpResult> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut last_result = HttpResult::default();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                // Not the first attempt; wait before retrying
                let delay = self.options.retry_backoff * attempt;
                tracing::debug!(path, attempt, ?delay, "retrying request");
                thread::sleep(delay);
            }

            let request_params = self
                .build_request_params(method, path, include_auth_tokens, query, attempt + 1)
                .wrap_err("build request params failed")?;

            let raw_result = (self.make_http_request)(&request_params);
            if raw_result.is_empty() {
                return Err(PsiCashError::new(
                    ErrorKind::Transport,
                    "HTTP request function returned no value",
                ));
            }

            let result: HttpResult = serde_json::from_str(&raw_result).map_err(|err| {
                PsiCashError::new(
                    ErrorKind::Parse,
                    format!("json parse failed: {err}; raw: {raw_result}"),
                )
            })?;

            let transport_error = result.error.as_deref().filter(|e| !e.is_empty());
            if result.status == TRANSPORT_ERROR_STATUS && transport_error.is_none() {
                return Err(PsiCashError::new(
                    ErrorKind::Transport,
                    "HTTP result status is -1 but no error message provided",
                ));
            }

            // A fresh server timestamp; update the clock skew before anything else.
            if let Some(date) = result.date.as_deref() {
                self.update_server_time_diff(date);
            }

            if let Some(error) = transport_error {
                return Err(PsiCashError::new(
                    ErrorKind::Transport,
                    format!("request resulted in error: {error}"),
                ));
            }

            tracing::debug!(method, path, status = result.status, attempt = attempt + 1, "request completed");

            if result.status >= 500 {
                last_result = result;
                continue;
            }

            return Ok(result);
        }

        // Out of attempts; hand back the last 5xx for the caller to interpret.
        Ok(last_result)
    }

    fn update_server_time_diff(&mut self, date: &str) {
        match DateTime::parse_from_rfc2822(date) {
            Ok(server_now) => {
                if let Err(err) = self
                    .user_data
                    .set_server_time_diff(server_now.with_timezone(&Utc))
                {
                    tracing::warn!(error = %err, "failed to store server time diff");
                }
            }
            Err(err) => {
                tracing::debug!(date, error = %err, "ignoring unparsable server date");
            }
        }
    }

    fn build_request_params(
        &self,
        method: &str,
        path: &str,
        include_auth_tokens: bool,
        query: &Value,
        attempt: u32,
    ) -> Result<String> {
        let mut headers = Map::new();
        headers.insert(
            USER_AGENT_HEADER.to_string(),
            Value::from(self.options.user_agent.as_str()),
        );

        if include_auth_tokens {
            let tokens: Vec<String> = self.user_data.auth_tokens().into_values().collect();
            headers.insert(AUTH_HEADER.to_string(), Value::from(tokens.join(",")));
        }

        let mut metadata: Map<String, Value> = self
            .user_data
            .request_metadata()
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();
        metadata.insert("attempt".to_string(), Value::from(attempt));
        headers.insert(METADATA_HEADER.to_string(), Value::Object(metadata));

        let params = RequestParams {
            scheme: self.options.server.scheme.clone(),
            hostname: self.options.server.hostname.clone(),
            port: self.options.server.port,
            method: method.to_string(),
            path: format!("/{}{}", self.options.api_version, path),
            query: query.clone(),
            headers,
        };

        serde_json::to_string(&params).map_err(|err| {
            PsiCashError::new(ErrorKind::Parse, format!("json dump failed: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{AuthTokens, TokenSetMode};
    use std::sync::{Arc, Mutex};

    fn test_client(root: &std::path::Path, responses: Vec<String>) -> (Client, Arc<Mutex<Vec<String>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let responses = Mutex::new(responses.into_iter());
        let transport: MakeHttpRequestFn = Box::new(move |params: &str| {
            seen.lock().unwrap().push(params.to_string());
            responses.lock().unwrap().next().unwrap_or_default()
        });

        let options = ClientOptions {
            file_store_root: root.to_path_buf(),
            retry_backoff: Duration::ZERO,
            ..Default::default()
        };
        (Client::new(options, transport).unwrap(), requests)
    }

    fn request(raw: &str) -> RequestParams {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn request_params_carry_tokens_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, requests) = test_client(dir.path(), vec![r#"{"status":200}"#.into()]);
        let tokens: AuthTokens = [
            (TokenType::Earner, "e1".to_string()),
            (TokenType::Spender, "s1".to_string()),
        ]
        .into_iter()
        .collect();
        client
            .user_data_mut()
            .set_auth_tokens(tokens, TokenSetMode::Merge, false)
            .unwrap();
        client.set_request_metadata_item("sponsor_id", "ABC").unwrap();

        client
            .make_http_request_with_retry("GET", "/balance", true, &Value::Null)
            .unwrap();

        let sent = request(&requests.lock().unwrap()[0]);
        assert_eq!(sent.scheme, "https");
        assert_eq!(sent.hostname, DEFAULT_API_SERVER_HOSTNAME);
        assert_eq!(sent.port, 443);
        assert_eq!(sent.method, "GET");
        assert_eq!(sent.path, "/v1/balance");
        assert_eq!(sent.headers[USER_AGENT_HEADER], DEFAULT_USER_AGENT);
        assert_eq!(sent.headers[AUTH_HEADER], "e1,s1");
        assert_eq!(
            sent.headers[METADATA_HEADER],
            json!({"sponsor_id": "ABC", "attempt": 1})
        );
    }

    #[test]
    fn auth_header_omitted_when_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, requests) = test_client(dir.path(), vec![r#"{"status":200}"#.into()]);

        client
            .make_http_request_with_retry("GET", "/prices", false, &Value::Null)
            .unwrap();

        let sent = request(&requests.lock().unwrap()[0]);
        assert!(!sent.headers.contains_key(AUTH_HEADER));
    }

    #[test]
    fn retries_server_errors_then_returns_last() {
        let dir = tempfile::tempdir().unwrap();
        let responses = vec![
            r#"{"status":500}"#.to_string(),
            r#"{"status":503}"#.to_string(),
            r#"{"status":502,"body":"last"}"#.to_string(),
            r#"{"status":200}"#.to_string(),
        ];
        let (mut client, requests) = test_client(dir.path(), responses);

        let result = client
            .make_http_request_with_retry("POST", "/transaction", true, &Value::Null)
            .unwrap();

        assert_eq!(result.status, 502);
        assert_eq!(result.body.as_deref(), Some("last"));
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        let attempts: Vec<Value> = requests
            .iter()
            .map(|r| request(r).headers[METADATA_HEADER]["attempt"].clone())
            .collect();
        assert_eq!(attempts, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, requests) = test_client(
            dir.path(),
            vec![r#"{"status":500}"#.into(), r#"{"status":404}"#.into()],
        );

        let result = client
            .make_http_request_with_retry("GET", "/x", false, &Value::Null)
            .unwrap();

        assert_eq!(result.status, 404);
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn empty_transport_response_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, requests) = test_client(dir.path(), vec![]);

        let err = client
            .make_http_request_with_retry("GET", "/x", false, &Value::Null)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn transport_error_is_not_retried_but_still_updates_skew() {
        let dir = tempfile::tempdir().unwrap();
        let server_now = Utc::now() + chrono::TimeDelta::hours(2);
        let response = json!({
            "status": -1,
            "error": "tls handshake failed",
            "date": server_now.to_rfc2822(),
        })
        .to_string();
        let (mut client, requests) = test_client(dir.path(), vec![response]);

        let err = client
            .make_http_request_with_retry("GET", "/x", false, &Value::Null)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("tls handshake failed"));
        assert_eq!(requests.lock().unwrap().len(), 1);
        let diff = client.user_data().server_time_diff();
        assert!((diff - chrono::TimeDelta::hours(2)).num_seconds().abs() <= 2);
    }

    #[test]
    fn status_minus_one_without_error_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _) = test_client(dir.path(), vec![r#"{"status":-1}"#.into()]);

        let err = client
            .make_http_request_with_retry("GET", "/x", false, &Value::Null)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn unparsable_envelope_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _) = test_client(dir.path(), vec!["<html>".into()]);

        let err = client
            .make_http_request_with_retry("GET", "/x", false, &Value::Null)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(err.message().contains("<html>"));
    }

    #[test]
    fn skew_updates_on_retried_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let server_now = Utc::now() - chrono::TimeDelta::minutes(30);
        let responses = vec![
            json!({"status": 500, "date": server_now.to_rfc2822()}).to_string(),
            r#"{"status":200,"date":"not a date"}"#.to_string(),
        ];
        let (mut client, _) = test_client(dir.path(), responses);

        let result = client
            .make_http_request_with_retry("GET", "/x", false, &Value::Null)
            .unwrap();

        assert_eq!(result.status, 200);
        let diff = client.user_data().server_time_diff();
        assert!((diff + chrono::TimeDelta::minutes(30)).num_seconds().abs() <= 2);
    }

    #[test]
    fn landing_page_uses_fragment_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _) = test_client(dir.path(), vec![]);
        let tokens: AuthTokens = [(TokenType::Earner, "e1".to_string())].into_iter().collect();
        client
            .user_data_mut()
            .set_auth_tokens(tokens, TokenSetMode::Merge, false)
            .unwrap();

        let modified = Url::parse(&client.modify_landing_page("https://psi.cash/landing").unwrap()).unwrap();
        let fragment = modified.fragment().unwrap();
        assert!(fragment.starts_with("psicash="));
        let decoded: String = form_urlencoded::parse(fragment.as_bytes())
            .find(|(k, _)| k == "psicash")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let payload: Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(payload, json!({"v": 1, "tokens": "e1", "metadata": {}}));

        let modified =
            Url::parse(&client.modify_landing_page("https://psi.cash/landing?a=b#top").unwrap()).unwrap();
        assert_eq!(modified.fragment(), Some("top"));
        let (_, value) = modified
            .query_pairs()
            .find(|(k, _)| k == "psicash")
            .unwrap();
        let payload: Value = serde_json::from_str(&value).unwrap();
        assert_eq!(payload["tokens"], "e1");

        assert!(client.modify_landing_page("not a url").is_err());
    }

    #[test]
    fn landing_page_without_tokens_has_null_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _) = test_client(dir.path(), vec![]);

        let modified = Url::parse(&client.modify_landing_page("https://psi.cash/").unwrap()).unwrap();
        let fragment = modified.fragment().unwrap();
        let (_, value) = form_urlencoded::parse(fragment.as_bytes()).next().unwrap();
        let payload: Value = serde_json::from_str(&value).unwrap();
        assert!(payload["tokens"].is_null());
    }

    #[test]
    fn rewarded_activity_data_requires_earner() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _) = test_client(dir.path(), vec![]);
        assert_eq!(
            client.rewarded_activity_data().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let tokens: AuthTokens = [(TokenType::Earner, "e1".to_string())].into_iter().collect();
        client
            .user_data_mut()
            .set_auth_tokens(tokens, TokenSetMode::Merge, false)
            .unwrap();
        client.set_request_metadata_item("client_region", "CA").unwrap();

        let encoded = client.rewarded_activity_data().unwrap();
        let decoded = BASE64_STANDARD.decode(encoded).unwrap();
        let payload: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(
            payload,
            json!({"v": 1, "tokens": "e1", "metadata": {"client_region": "CA"}})
        );
    }

    #[test]
    fn diagnostic_info_hides_purchase_details() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _) = test_client(dir.path(), vec![]);
        client
            .user_data_mut()
            .add_purchase(&Purchase {
                id: "secret-id".into(),
                transaction_class: "speed-boost".into(),
                distinguisher: "1hr".into(),
                authorization: Some("secret-auth".into()),
                server_time_expiry: None,
                local_time_expiry: None,
            })
            .unwrap();
        client.user_data_mut().set_balance(12).unwrap();

        let info = client.diagnostic_info();
        assert_eq!(info["balance"], 12);
        assert_eq!(info["isAccount"], false);
        assert_eq!(
            info["purchases"],
            json!([{"class": "speed-boost", "distinguisher": "1hr"}])
        );
        assert!(!info.to_string().contains("secret"));
    }

    #[test]
    fn empty_store_root_is_rejected() {
        let transport: MakeHttpRequestFn = Box::new(|_: &str| String::new());
        let err = Client::new(ClientOptions::default(), transport).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
