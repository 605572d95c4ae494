//! HTTP transport used by the [`Dispatcher`](crate::Dispatcher).
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use url::Url;

use crate::{Result, Settings};

/// Status and (for unsuccessful requests) body of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body. Only read for non-200 responses, where it is useful for diagnosis.
    pub body: Option<String>,
}

impl TransportResponse {
    /// HTTP 200 is the only status treated as success by the ingestion API.
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }
}

/// Something that can POST a JSON body to the ingestion API.
///
/// The client owns exactly one transport, constructs it lazily on the first send, and calls
/// [`Transport::close`] once when it stops.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` as JSON to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error when no response was received (connection refused, timeout, DNS
    /// failure). Non-200 responses are not errors.
    async fn post(&self, url: &Url, body: &Value) -> Result<TransportResponse>;

    /// Release held resources (connection pool).
    async fn close(&self) {}
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn post(&self, url: &Url, body: &Value) -> Result<TransportResponse> {
        (**self).post(url, body).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// [`Transport`] backed by an async `reqwest` client.
///
/// Every request carries `Authorization: Bearer <api_key>`, `Accept: application/json` and
/// `Content-Type: application/json`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    api_key: String,
}

impl HttpTransport {
    /// Build a transport from settings (API key, timeout, pool size).
    pub fn new(settings: &Settings) -> Result<HttpTransport> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.client_timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .build()?;

        Ok(HttpTransport {
            client,
            api_key: settings.api_key.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &Url, body: &Value) -> Result<TransportResponse> {
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let body = if status == StatusCode::OK {
            None
        } else {
            // A body we cannot read is still a failed response; keep the status.
            Some(response.text().await.unwrap_or_default())
        };

        Ok(TransportResponse {
            status: status.as_u16(),
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn settings() -> Settings {
        Settings {
            api_key: Some("phc_test".to_owned()),
            client_timeout: Duration::from_secs(5),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn posts_json_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/capture"))
            .and(header("authorization", "Bearer phc_test"))
            .and(header("accept", "application/json"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({"event": "clicked"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/capture", server.uri())).unwrap();

        let response = transport.post(&url, &json!({"event": "clicked"})).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.body, None);
    }

    #[tokio::test]
    async fn non_200_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&settings()).unwrap();
        let url = Url::parse(&format!("{}/batch", server.uri())).unwrap();

        let response = transport.post(&url, &json!({})).await.unwrap();

        assert!(!response.is_success());
        assert_eq!(response.status, 400);
        assert_eq!(response.body.as_deref(), Some("invalid api key"));
    }

    #[tokio::test]
    async fn connection_failure_is_network_error() {
        let transport = HttpTransport::new(&settings()).unwrap();
        // Port 9 (discard) is expected to be closed on test machines.
        let url = Url::parse("http://127.0.0.1:9/capture").unwrap();

        let result = transport.post(&url, &json!({})).await;

        assert!(matches!(result, Err(crate::Error::Network(_))));
    }
}
