//! Remote content API client.
//!
//! All backend payload-shape handling happens here, once, in
//! [`normalize_payload`]. Downstream code only ever sees a flattened
//! record with its `meta` object at the top level.

use crate::content::ContentRecord;
use crate::error::{ContentError, Result};
use chrono::Utc;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Path of the backend job-trigger endpoint; the cron key is appended.
pub const CRON_PATH: &str = "/v2/translate/cron";

/// Wrapper fields checked, in order, when the body is not an `ok` envelope.
const PAYLOAD_FIELDS: [&str; 3] = ["payload", "translation", "data"];

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ContentError::Network {
                url: base_url.to_string(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        Url::parse(&raw).map_err(|e| ContentError::Network {
            url: raw.clone(),
            message: format!("invalid URL: {}", e),
        })
    }

    /// GET `path` and normalize the body. `Ok(None)` means the response
    /// carried no usable payload.
    pub async fn get_payload(&self, path: &str) -> Result<Option<ContentRecord>> {
        let url = self.url_for(path)?;
        self.fetch(self.client.get(url.clone()), &url).await
    }

    /// Like [`get_payload`](Self::get_payload), but defeats intermediary
    /// caches with no-cache headers and a timestamp query parameter.
    pub async fn get_fresh_payload(&self, path: &str) -> Result<Option<ContentRecord>> {
        let mut url = self.url_for(path)?;
        url.query_pairs_mut()
            .append_pair("_ts", &Utc::now().timestamp_millis().to_string());

        let request = self
            .client
            .get(url.clone())
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache");
        self.fetch(request, &url).await
    }

    async fn fetch(&self, request: reqwest::RequestBuilder, url: &Url) -> Result<Option<ContentRecord>> {
        let response = request.send().await.map_err(|e| ContentError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ContentError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body: Value = response.json().await.map_err(|e| ContentError::Network {
            url: url.to_string(),
            message: format!("Failed to parse response body: {}", e),
        })?;

        Ok(normalize_payload(body).map(ContentRecord::new))
    }

    /// Ask the backend to advance the translation job behind `cron_key`.
    pub async fn nudge(&self, cron_key: &str) -> Result<()> {
        let mut url = self.url_for(CRON_PATH)?;
        url.path_segments_mut()
            .map_err(|_| ContentError::Network {
                url: self.base_url.clone(),
                message: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .push(cron_key);

        debug!("Nudging translation job at {}", url);
        let response = self
            .client
            .get(url.clone())
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| ContentError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ContentError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

/// Build an absolute API path from raw segments, percent-encoding each
/// one so `/`, `?` or `#` inside an identity cannot change the route.
pub fn encoded_path(segments: &[&str]) -> Result<String> {
    let mut url = Url::parse("http://localhost/").map_err(|e| ContentError::Network {
        url: segments.join("/"),
        message: format!("invalid URL: {}", e),
    })?;
    url.path_segments_mut()
        .map_err(|_| ContentError::Network {
            url: segments.join("/"),
            message: "path cannot be built".to_string(),
        })?
        .clear()
        .extend(segments);
    Ok(url.path().to_string())
}

/// Flatten a backend body into a content record.
///
/// 1. `{status: "ok", data: {...}, meta?}` envelopes flatten to `data`,
///    inheriting the envelope `meta` when `data` has none. Envelopes with
///    any other status carry no payload.
/// 2. Otherwise the first object under `payload`, `translation` or `data`.
/// 3. Otherwise the root object itself.
///
/// Non-object bodies carry no payload.
pub fn normalize_payload(body: Value) -> Option<Value> {
    let Value::Object(mut root) = body else {
        return None;
    };

    let is_envelope = root.get("status").is_some_and(Value::is_string)
        && root.get("data").is_some_and(Value::is_object);
    if is_envelope {
        if root.get("status").and_then(Value::as_str) != Some("ok") {
            return None;
        }
        let envelope_meta = root.remove("meta");
        let Some(Value::Object(mut data)) = root.remove("data") else {
            return None;
        };
        if !data.contains_key("meta") {
            if let Some(meta @ Value::Object(_)) = envelope_meta {
                data.insert("meta".to_string(), meta);
            }
        }
        return Some(Value::Object(data));
    }

    for field in PAYLOAD_FIELDS {
        if root.get(field).is_some_and(Value::is_object) {
            return root.remove(field);
        }
    }

    Some(Value::Object(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    // ==================== Normalization ====================

    #[test]
    fn test_normalize_plain_object() {
        let body = json!({"greeting": "hi", "meta": {"complete": true}});
        assert_eq!(normalize_payload(body.clone()), Some(body));
    }

    #[test]
    fn test_normalize_ok_envelope_attaches_meta() {
        let body = json!({
            "status": "ok",
            "data": {"greeting": "hi"},
            "meta": {"complete": false, "cronKey": "k1"}
        });
        assert_eq!(
            normalize_payload(body),
            Some(json!({"greeting": "hi", "meta": {"complete": false, "cronKey": "k1"}}))
        );
    }

    #[test]
    fn test_normalize_ok_envelope_keeps_inner_meta() {
        let body = json!({
            "status": "ok",
            "data": {"greeting": "hi", "meta": {"complete": true}},
            "meta": {"traceId": "t"}
        });
        assert_eq!(
            normalize_payload(body),
            Some(json!({"greeting": "hi", "meta": {"complete": true}}))
        );
    }

    #[test]
    fn test_normalize_error_envelope_is_none() {
        let body = json!({"status": "error", "data": {"greeting": "hi"}});
        assert_eq!(normalize_payload(body), None);
    }

    #[test]
    fn test_normalize_wrapper_precedence() {
        let body = json!({
            "payload": {"from": "payload"},
            "translation": {"from": "translation"},
            "data": {"from": "data"}
        });
        assert_eq!(normalize_payload(body), Some(json!({"from": "payload"})));

        let body = json!({"translation": {"from": "translation"}, "data": {"from": "data"}});
        assert_eq!(normalize_payload(body), Some(json!({"from": "translation"})));

        let body = json!({"data": {"from": "data"}});
        assert_eq!(normalize_payload(body), Some(json!({"from": "data"})));
    }

    #[test]
    fn test_normalize_ignores_non_object_wrappers() {
        let body = json!({"data": "just a string", "meta": {"complete": true}});
        assert_eq!(normalize_payload(body.clone()), Some(body));
    }

    #[test]
    fn test_normalize_non_objects() {
        assert_eq!(normalize_payload(Value::Null), None);
        assert_eq!(normalize_payload(json!([1, 2])), None);
        assert_eq!(normalize_payload(json!("text")), None);
    }

    // ==================== HTTP ====================

    #[tokio::test]
    async fn test_get_payload_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/translate/text/interface/eng00"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"greeting": "hi", "meta": {"complete": true}}
            })))
            .mount(&mock_server)
            .await;

        let api = ApiClient::with_client(reqwest::Client::new(), &mock_server.uri());
        let record = api
            .get_payload("/v2/translate/text/interface/eng00")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.as_value(), &json!({"greeting": "hi", "meta": {"complete": true}}));
    }

    #[tokio::test]
    async fn test_get_payload_http_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let api = ApiClient::with_client(reqwest::Client::new(), &mock_server.uri());
        let result = api.get_payload("/v2/anything").await;

        assert!(matches!(result, Err(ContentError::HttpStatus { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_get_payload_invalid_json_is_network_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&mock_server)
            .await;

        let api = ApiClient::with_client(reqwest::Client::new(), &mock_server.uri());
        let result = api.get_payload("/v2/anything").await;

        assert!(matches!(result, Err(ContentError::Network { .. })));
    }

    #[tokio::test]
    async fn test_fresh_payload_sends_cache_busting() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/x"))
            .and(header("cache-control", "no-cache"))
            .and(header("pragma", "no-cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": "b"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let api = ApiClient::with_client(reqwest::Client::new(), &mock_server.uri());
        api.get_fresh_payload("/v2/x").await.unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        assert!(requests[0].url.query().unwrap_or("").contains("_ts="));
    }

    #[tokio::test]
    async fn test_fresh_payload_keeps_existing_query() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/translate/lessonContent/eng00/dbs/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": "b"})))
            .mount(&mock_server)
            .await;

        let api = ApiClient::with_client(reqwest::Client::new(), &mock_server.uri());
        api.get_fresh_payload("/v2/translate/lessonContent/eng00/dbs/3?jf=529")
            .await
            .unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        let query = requests[0].url.query().unwrap_or("").to_string();
        assert!(query.contains("jf=529"));
        assert!(query.contains("_ts="));
    }

    #[test]
    fn test_encoded_path_keeps_identities_in_one_segment() {
        assert_eq!(
            encoded_path(&["v2", "translate", "text", "interface", "eng00"]).unwrap(),
            "/v2/translate/text/interface/eng00"
        );
        assert_eq!(
            encoded_path(&["v2", "interface", "a/b?c#d"]).unwrap(),
            "/v2/interface/a%2Fb%3Fc%23d"
        );
    }

    #[tokio::test]
    async fn test_nudge_encodes_cron_key() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/translate/cron/a%2Fb%20c"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let api = ApiClient::with_client(reqwest::Client::new(), &mock_server.uri());
        tokio_test::assert_ok!(api.nudge("a/b c").await);
    }

    #[tokio::test]
    async fn test_nudge_failure_is_reported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let api = ApiClient::with_client(reqwest::Client::new(), &mock_server.uri());
        tokio_test::assert_err!(api.nudge("k1").await);
    }
}
