use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tracing::{debug, instrument};
use webext_storage_core::{StorageBackend, StorageError};

/// Public Cloudflare API v4 endpoint.
pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Storage area backed by a Cloudflare KV namespace, over the REST API.
///
/// Values are stored as raw text under the cell key. KV is eventually
/// consistent across locations, so a write may take a while to be visible
/// to readers elsewhere.
#[derive(Clone)]
pub struct KvStorage {
    http_client: HttpClient,
    api_base: String,
    account_id: String,
    namespace_id: String,
    api_token: String,
}

impl std::fmt::Debug for KvStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStorage")
            .field("api_base", &self.api_base)
            .field("account_id", &self.account_id)
            .field("namespace_id", &self.namespace_id)
            .finish_non_exhaustive()
    }
}

impl KvStorage {
    /// Create a new KV storage area.
    pub fn new(account_id: String, namespace_id: String, api_token: String) -> Self {
        Self {
            http_client: HttpClient::new(),
            api_base: CLOUDFLARE_API_BASE.to_string(),
            account_id,
            namespace_id,
            api_token,
        }
    }

    /// Point the client at another API endpoint.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Base URL for the namespace.
    fn base_url(&self) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}",
            self.api_base, self.account_id, self.namespace_id
        )
    }

    fn value_url(&self, key: &str) -> String {
        format!("{}/values/{}", self.base_url(), urlencoding::encode(key))
    }
}

#[async_trait]
impl StorageBackend for KvStorage {
    fn backend_name(&self) -> &'static str {
        "kv"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let response = self
            .http_client
            .get(self.value_url(key))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| StorageError::Io(format!("KV GET request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!("KV key not found: {}", key);
            return Ok(None);
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StorageError::Io(format!(
                "KV GET failed with status {}: {}",
                status, text
            )));
        }

        // KV GET returns raw value, not JSON-wrapped
        let value = response
            .text()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to read KV response: {}", e)))?;

        debug!("KV GET {} ({} bytes)", key, value.len());
        Ok(Some(value))
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let response = self
            .http_client
            .put(self.value_url(key))
            .bearer_auth(&self.api_token)
            .header("Content-Type", "text/plain")
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| StorageError::Io(format!("KV PUT request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StorageError::Io(format!(
                "KV PUT failed with status {}: {}",
                status, text
            )));
        }

        debug!("KV PUT {} ({} bytes)", key, value.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let response = self
            .http_client
            .delete(self.value_url(key))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| StorageError::Io(format!("KV DELETE request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StorageError::Io(format!(
                "KV DELETE failed with status {}: {}",
                status, text
            )));
        }

        debug!("KV DELETE {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALUE_PATH: &str = "/accounts/acc/storage/kv/namespaces/ns/values/webext-demo";

    fn mock_storage(server: &MockServer) -> KvStorage {
        KvStorage::new("acc".into(), "ns".into(), "secret".into()).with_api_base(server.uri())
    }

    #[tokio::test]
    async fn test_get_existing_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(VALUE_PATH))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"Storage Demo\""))
            .expect(1)
            .mount(&server)
            .await;

        let storage = mock_storage(&server);
        assert_eq!(
            storage.get("webext-demo").await.unwrap(),
            Some("\"Storage Demo\"".to_string())
        );
    }

    #[tokio::test]
    async fn test_get_missing_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(VALUE_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let storage = mock_storage(&server);
        assert_eq!(storage.get("webext-demo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(VALUE_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let storage = mock_storage(&server);
        let err = storage.get("webext-demo").await.unwrap_err();
        assert!(matches!(err, StorageError::Io(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_put_sends_raw_text() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(VALUE_PATH))
            .and(header("Authorization", "Bearer secret"))
            .and(header("Content-Type", "text/plain"))
            .and(body_string("42"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let storage = mock_storage(&server);
        storage.set("webext-demo", "42").await.unwrap();
    }

    #[tokio::test]
    async fn test_put_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(VALUE_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let storage = mock_storage(&server);
        assert!(storage.set("webext-demo", "42").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(VALUE_PATH))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let storage = mock_storage(&server);
        storage.remove("webext-demo").await.unwrap();
    }

    #[test]
    fn test_value_url_encodes_key() {
        let storage = KvStorage::new("acc".into(), "ns".into(), "t".into());
        assert_eq!(
            storage.value_url("a/b c"),
            "https://api.cloudflare.com/client/v4/accounts/acc/storage/kv/namespaces/ns/values/a%2Fb%20c"
        );
    }
}
