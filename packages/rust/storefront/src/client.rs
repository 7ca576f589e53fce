//! Storefront GraphQL client.

use std::time::Duration;

use async_trait::async_trait;
use catalogsync_shared::{CatalogError, ProductLookupRequest, Result, StorefrontSettings};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::query::{BatchQuery, ResolvedProduct, build_batch_query, demultiplex};
use crate::scheduler::BatchExecutor;

/// Header carrying the storefront access token.
const ACCESS_TOKEN_HEADER: &str = "x-shopify-storefront-access-token";

/// Base delay between transport retries; multiplied by the attempt number.
const RETRY_BACKOFF_MS: u64 = 250;

const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: Option<String>,
}

/// Executes aggregated product queries against a storefront endpoint.
pub struct StorefrontClient {
    client: Client,
    settings: StorefrontSettings,
}

impl StorefrontClient {
    pub fn new(settings: StorefrontSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| CatalogError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, settings })
    }

    /// Issue one batch query for `origin` and return its `data` object.
    ///
    /// A non-200 status or a non-empty `errors` list fails the whole batch.
    /// Transport failures, timeouts, 429 and 5xx responses are retried up to
    /// `max_retries` times.
    #[instrument(skip_all, fields(origin = %origin, size = query.variables.len()))]
    pub async fn execute(&self, origin: &str, query: &BatchQuery) -> Result<Value> {
        let endpoint = self.settings.endpoint_for(origin);
        debug!(%endpoint, "sending batch");
        debug!(query = %query.query, "batch query");

        let mut attempt = 0;
        let body = loop {
            match self.post(&endpoint, query).await {
                Ok(body) => break body,
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    warn!(%endpoint, attempt, error = %e, "retrying batch request");
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt)))
                        .await;
                }
                Err(e) => return Err(e),
            }
        };

        let response: GraphQlResponse = serde_json::from_str(&body)
            .map_err(|e| CatalogError::Query(format!("{endpoint}: malformed response: {e}")))?;

        if let Some(first) = response.errors.as_deref().and_then(|errors| errors.first()) {
            let message = first.message.as_deref().unwrap_or("Unknown");
            return Err(CatalogError::Query(format!("GraphQL batch error: {message}")));
        }

        Ok(response.data.unwrap_or(Value::Null))
    }

    async fn post(&self, endpoint: &str, query: &BatchQuery) -> Result<String> {
        let response = self
            .client
            .post(endpoint)
            .header(ACCESS_TOKEN_HEADER, &self.settings.access_token)
            .json(query)
            .send()
            .await
            .map_err(|e| CatalogError::Network(format!("{endpoint}: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(CatalogError::Network(format!("{endpoint}: GraphQL status {status}")));
        }
        if status != StatusCode::OK {
            return Err(CatalogError::Query(format!("{endpoint}: GraphQL status {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| CatalogError::Network(format!("{endpoint}: failed to read body: {e}")))
    }
}

#[async_trait]
impl BatchExecutor for StorefrontClient {
    async fn resolve(
        &self,
        origin: &str,
        requests: &[ProductLookupRequest],
    ) -> Result<Vec<ResolvedProduct>> {
        let query = build_batch_query(requests);
        let data = self.execute(origin, &query).await?;
        demultiplex(&data, requests)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::scheduler::{BatchHandler, HostBatchScheduler, SchedulerSettings};

    fn settings(shop_domain: Option<String>) -> StorefrontSettings {
        StorefrontSettings {
            api_version: "2024-07".into(),
            access_token: "secret".into(),
            shop_domain,
            batch_size: 10,
            flush_interval: Duration::from_millis(300),
            per_host_concurrency: 2,
            request_timeout: Duration::from_secs(5),
            max_retries: 1,
        }
    }

    fn request(origin: &str, handle: &str) -> ProductLookupRequest {
        ProductLookupRequest {
            origin: origin.into(),
            handle: handle.into(),
            source_url: format!("{origin}/products/{handle}"),
        }
    }

    #[tokio::test]
    async fn resolves_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2024-07/graphql.json"))
            .and(header(ACCESS_TOKEN_HEADER, "secret"))
            .and(body_partial_json(json!({"variables": {"h0": "a", "h1": "b"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "p0": {"id": "gid://shopify/Product/1", "title": "A"},
                    "p1": null
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = StorefrontClient::new(settings(None)).unwrap();
        let origin = server.uri();
        let resolved = client
            .resolve(&origin, &[request(&origin, "a"), request(&origin, "b")])
            .await
            .unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].product.id, "1");
        assert_eq!(resolved[0].request.handle, "a");
    }

    #[tokio::test]
    async fn graphql_errors_fail_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{"message": "boom"}]
            })))
            .mount(&server)
            .await;

        let client = StorefrontClient::new(settings(None)).unwrap();
        let origin = server.uri();
        let err = client
            .resolve(&origin, &[request(&origin, "a")])
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Query(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn shop_domain_overrides_origin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2024-07/graphql.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let client = StorefrontClient::new(settings(Some(format!("{}/", server.uri())))).unwrap();
        let resolved = client
            .resolve("https://unreachable.invalid", &[request("https://unreachable.invalid", "a")])
            .await
            .unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn retries_server_errors_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let client = StorefrontClient::new(settings(None)).unwrap();
        let origin = server.uri();
        let err = client
            .resolve(&origin, &[request(&origin, "a")])
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = StorefrontClient::new(settings(None)).unwrap();
        let origin = server.uri();
        let err = client
            .resolve(&origin, &[request(&origin, "a")])
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Query(_)));
    }

    #[tokio::test]
    async fn timed_out_requests_are_retried_then_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {}}))
                    .set_delay(Duration::from_secs(2)),
            )
            .expect(2)
            .mount(&server)
            .await;

        let mut slow = settings(None);
        slow.request_timeout = Duration::from_millis(200);
        let client = StorefrontClient::new(slow).unwrap();
        let origin = server.uri();
        let err = client
            .resolve(&origin, &[request(&origin, "a")])
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchHandler for CountingHandler {
        async fn handle(&self, _origin: &str, _products: Vec<ResolvedProduct>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn timed_out_batch_is_counted_as_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .expect(2)
            .mount(&server)
            .await;

        let mut slow = settings(None);
        slow.request_timeout = Duration::from_millis(200);
        slow.flush_interval = Duration::from_millis(20);
        let handler = Arc::new(CountingHandler::default());
        let scheduler = HostBatchScheduler::new(
            SchedulerSettings::from(&slow),
            Arc::new(StorefrontClient::new(slow).unwrap()),
            handler.clone(),
        );

        let origin = server.uri();
        scheduler.enqueue(request(&origin, "a"));
        let stats = scheduler.finish().await;

        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.batches_succeeded, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
