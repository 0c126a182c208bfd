//! C2: the REST client.
//!
//! Kept deliberately thin: typed get/post/patch/delete over [`reqwest`],
//! array/object query encoding, a per-call deadline, an optional bounded
//! 5xx retry policy, and a bearer token. Nothing here understands the AV
//! domain — that lives in `roomctl-core`.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;

/// How many times a 5xx response is retried before giving up.
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Retry policy applied to 5xx responses. 4xx other than 403 is returned
/// as-is so the caller can inspect it; 403 always short-circuits.
#[derive(Debug, Clone, Copy)]
pub enum RetryPolicy {
    Disabled,
    Enabled { max_attempts: u32 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Disabled
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn enabled() -> Self {
        Self::Enabled {
            max_attempts: DEFAULT_MAX_RETRIES,
        }
    }

    #[must_use]
    pub fn enabled_with(max_attempts: u32) -> Self {
        Self::Enabled { max_attempts }
    }
}

/// A callback invoked with `true` when a request starts and `false` when
/// it completes, success or failure, so a caller can drive a busy
/// indicator without polling.
pub type PendingCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Per-call overrides layered on top of the client's defaults.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub query: Option<Value>,
    pub deadline: Option<Duration>,
    pub retry: RetryPolicy,
    pub on_pending: Option<PendingCallback>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_query(mut self, query: Value) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Client-wide configuration.
#[derive(Clone)]
pub struct RestClientConfig {
    pub base_url: String,
    pub bearer_token: Option<SecretString>,
    pub default_timeout: Duration,
}

impl RestClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: None,
            default_timeout: Duration::from_millis(1000),
        }
    }
}

/// Typed HTTP client over a controller's REST surface.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    config: RestClientConfig,
}

impl RestClient {
    #[must_use]
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    #[must_use]
    pub fn with_client(http: reqwest::Client, config: RestClientConfig) -> Self {
        Self { http, config }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions,
    ) -> Result<T, Error> {
        let url = self.build_url(path, opts.query.as_ref())?;
        let builder = self.http.get(url);
        self.send(builder, opts).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        opts: RequestOptions,
    ) -> Result<T, Error> {
        let url = self.build_url(path, None)?;
        let builder = self.http.post(url).json(body);
        self.send(builder, opts).await
    }

    pub async fn patch<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        opts: RequestOptions,
    ) -> Result<T, Error> {
        let url = self.build_url(path, None)?;
        let builder = self.http.patch(url).json(body);
        self.send(builder, opts).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions,
    ) -> Result<T, Error> {
        let url = self.build_url(path, opts.query.as_ref())?;
        let builder = self.http.delete(url);
        self.send(builder, opts).await
    }

    fn build_url(&self, path: &str, query: Option<&Value>) -> Result<url::Url, Error> {
        let joined = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = url::Url::parse(&joined)?;
        if let Some(query) = query {
            let pairs = encode_query(query);
            if !pairs.is_empty() {
                let mut serializer = url.query_pairs_mut();
                for (k, v) in pairs {
                    serializer.append_pair(&k, &v);
                }
            }
        }
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        opts: RequestOptions,
    ) -> Result<T, Error> {
        let mut builder = builder.header("content-type", "application/json; charset=utf-8");
        if let Some(token) = &self.config.bearer_token {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let max_attempts = match opts.retry {
            RetryPolicy::Disabled => 1,
            RetryPolicy::Enabled { max_attempts } => max_attempts.max(1),
        };
        let deadline = opts.deadline.unwrap_or(self.config.default_timeout);

        if let Some(on_pending) = &opts.on_pending {
            on_pending(true);
        }
        let result = self.send_with_retry(&builder, max_attempts, deadline).await;
        if let Some(on_pending) = &opts.on_pending {
            on_pending(false);
        }
        result.and_then(|bytes| decode(&bytes))
    }

    async fn send_with_retry(
        &self,
        builder: &reqwest::RequestBuilder,
        max_attempts: u32,
        deadline: Duration,
    ) -> Result<Vec<u8>, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = builder
                .try_clone()
                .ok_or(Error::ChannelNotOpen)?
                .build()?;
            let outcome = self.send_once_request(request, deadline).await;
            match outcome {
                Ok(bytes) => return Ok(bytes),
                Err(Error::Status { status, body }) if status == 403 => {
                    return Err(Error::Status { status, body });
                }
                Err(Error::Status { status, body }) if (500..600).contains(&status) => {
                    if attempt >= max_attempts {
                        warn!(status, attempt, "rest retry budget exhausted");
                        return Err(Error::Status { status, body });
                    }
                    debug!(status, attempt, "retrying request after 5xx");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn send_once_request(
        &self,
        request: reqwest::Request,
        deadline: Duration,
    ) -> Result<Vec<u8>, Error> {
        let response = tokio::time::timeout(deadline, self.http.execute(request))
            .await
            .map_err(|_| Error::Timeout)??;
        let status = response.status();
        if status.as_u16() == 403 {
            return Err(Error::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(Error::Decode)
}

/// Encode a JSON value into query pairs: arrays become `k[i]`, nested
/// objects become `k[sub]` with the inner value JSON-stringified,
/// scalars are stringified directly.
fn encode_query(value: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Value::Object(map) = value {
        for (key, inner) in map {
            encode_query_value(key, inner, &mut pairs);
        }
    }
    pairs
}

fn encode_query_value(key: &str, value: &Value, pairs: &mut Vec<(String, String)>) {
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                pairs.push((format!("{key}[{i}]"), scalar_or_json(item)));
            }
        }
        Value::Object(map) => {
            for (sub, inner) in map {
                pairs.push((format!("{key}[{sub}]"), scalar_or_json(inner)));
            }
        }
        other => pairs.push((key.to_owned(), scalar_or_json(other))),
    }
}

fn scalar_or_json(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Deserialize, PartialEq, Debug)]
    struct Echo {
        ok: bool,
    }

    fn client_for(server: &MockServer) -> RestClient {
        RestClient::new(RestClientConfig::new(server.uri()))
    }

    #[test]
    fn encode_query_handles_arrays_and_objects() {
        let pairs = encode_query(&json!({
            "ids": ["a", "b"],
            "filter": {"status": "on"},
            "flag": true,
        }));
        assert!(pairs.contains(&("ids[0]".to_owned(), "a".to_owned())));
        assert!(pairs.contains(&("ids[1]".to_owned(), "b".to_owned())));
        assert!(pairs.contains(&("filter[status]".to_owned(), "on".to_owned())));
        assert!(pairs.contains(&("flag".to_owned(), "true".to_owned())));
    }

    #[tokio::test]
    async fn get_decodes_success_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let body: Echo = client
            .get("devices", RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(body, Echo { ok: true });
    }

    #[tokio::test]
    async fn retry_policy_resolves_after_two_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let opts = RequestOptions::default().with_retry(RetryPolicy::enabled());
        let body: Echo = client.get("flaky", opts).await.unwrap();
        assert_eq!(body, Echo { ok: true });
    }

    #[tokio::test]
    async fn forbidden_short_circuits_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secure"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let opts = RequestOptions::default().with_retry(RetryPolicy::enabled());
        let result: Result<Echo, Error> = client.get("secure", opts).await;
        assert!(matches!(result, Err(Error::Unauthorized)));
    }

    #[tokio::test]
    async fn pending_callback_fires_start_and_end() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let on_pending: PendingCallback = Arc::new(move |_state| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let client = client_for(&server);
        let opts = RequestOptions {
            on_pending: Some(on_pending),
            ..Default::default()
        };
        let _body: Echo = client.get("devices", opts).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
