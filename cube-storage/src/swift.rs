//! OpenStack Swift backend
//!
//! Talks to a single Swift container over the object-store HTTP API. The
//! authenticated connection is established on first use and cached; a 401
//! answer drops it so the next attempt authenticates again.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::SwiftConfig;
use crate::error::{Result, StorageError};
use crate::retry::RetryPolicy;
use crate::{StorageBackend, is_under, normalize_path};

/// Objects returned per container listing request
const LISTING_PAGE_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
struct SwiftConnection {
    storage_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
}

/// Storage backend backed by a Swift container
pub struct SwiftStorage {
    config: SwiftConfig,
    client: Client,
    retry: RetryPolicy,
    connection: Mutex<Option<SwiftConnection>>,
}

impl SwiftStorage {
    pub fn new(config: SwiftConfig) -> Self {
        Self::with_client(config, Client::new())
    }

    /// Create a backend with a custom HTTP client (timeouts, TLS, proxies)
    pub fn with_client(config: SwiftConfig, client: Client) -> Self {
        Self {
            config,
            client,
            retry: RetryPolicy::default(),
            connection: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn container(&self) -> &str {
        &self.config.container_name
    }

    /// Create the container if it does not exist yet
    pub async fn ensure_container(&self) -> Result<()> {
        self.retry
            .run("create container", || async {
                let conn = self.connection().await?;
                let url = format!("{}/{}", conn.storage_url, self.config.container_name);
                let response = self
                    .authorized(Method::PUT, &url, &conn)
                    .send()
                    .await?;
                self.check(response, &self.config.container_name).await?;
                Ok(())
            })
            .await
    }

    // =============================================================================
    // Connection
    // =============================================================================

    async fn connection(&self) -> Result<SwiftConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        // Not retried here: every caller runs inside the operation's retry
        let conn = self.authenticate().await?;
        info!("Connected to swift storage at {}", conn.storage_url);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Version 1 authentication: credentials in, storage URL and token out
    async fn authenticate(&self) -> Result<SwiftConnection> {
        let response = self
            .client
            .get(&self.config.auth_url)
            .header("X-Auth-User", &self.config.username)
            .header("X-Auth-Key", &self.config.key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StorageError::api_error(status.as_u16(), message));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_end_matches('/').to_string())
                .ok_or_else(|| StorageError::ParseError(format!("missing {} header", name)))
        };

        Ok(SwiftConnection {
            storage_url: header("X-Storage-Url")?,
            token: header("X-Auth-Token")?,
        })
    }

    async fn reset_connection(&self) {
        *self.connection.lock().await = None;
    }

    // =============================================================================
    // Request Helpers
    // =============================================================================

    fn object_url(&self, conn: &SwiftConnection, path: &str) -> String {
        format!(
            "{}/{}/{}",
            conn.storage_url,
            self.config.container_name,
            encode_key(&normalize_path(path))
        )
    }

    fn authorized(&self, method: Method, url: &str, conn: &SwiftConnection) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("X-Auth-Token", &conn.token)
    }

    /// Turn an error status into a `StorageError`; 404 becomes `NotFound`
    async fn check(&self, response: Response, path: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(path.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            self.reset_connection().await;
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(StorageError::api_error(status.as_u16(), message))
    }

    async fn list_page(&self, prefix: &str, marker: &str) -> Result<Vec<String>> {
        let conn = self.connection().await?;
        let url = format!("{}/{}", conn.storage_url, self.config.container_name);
        let limit = LISTING_PAGE_SIZE.to_string();
        let response = self
            .authorized(Method::GET, &url, &conn)
            .query(&[
                ("format", "json"),
                ("prefix", prefix),
                ("marker", marker),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;
        let response = self.check(response, &self.config.container_name).await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let objects: Vec<ListedObject> = response
            .json()
            .await
            .map_err(|e| StorageError::ParseError(format!("invalid container listing: {}", e)))?;
        Ok(objects.into_iter().map(|o| o.name).collect())
    }
}

#[async_trait]
impl StorageBackend for SwiftStorage {
    fn name(&self) -> &'static str {
        "swift"
    }

    async fn ls(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = normalize_path(prefix);
        let mut objects = Vec::new();
        let mut marker = String::new();

        loop {
            let page = self
                .retry
                .run("swift listing", || self.list_page(&prefix, &marker))
                .await?;
            let Some(last) = page.last().cloned() else {
                break;
            };
            let full_page = page.len() >= LISTING_PAGE_SIZE;
            objects.extend(page.into_iter().filter(|o| is_under(o, &prefix)));
            if !full_page {
                break;
            }
            marker = last;
        }

        Ok(objects)
    }

    async fn path_exists(&self, prefix: &str) -> Result<bool> {
        Ok(!self.ls(prefix).await?.is_empty())
    }

    async fn obj_exists(&self, path: &str) -> Result<bool> {
        let result = self
            .retry
            .run("swift head", || async {
                let conn = self.connection().await?;
                let response = self
                    .authorized(Method::HEAD, &self.object_url(&conn, path), &conn)
                    .send()
                    .await?;
                self.check(response, path).await
            })
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn upload(&self, path: &str, contents: Vec<u8>) -> Result<()> {
        self.retry
            .run("swift upload", || async {
                let conn = self.connection().await?;
                let response = self
                    .authorized(Method::PUT, &self.object_url(&conn, path), &conn)
                    .body(contents.clone())
                    .send()
                    .await?;
                self.check(response, path).await?;
                Ok(())
            })
            .await?;
        debug!("Uploaded {} to swift", path);
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.retry
            .run("swift download", || async {
                let conn = self.connection().await?;
                let response = self
                    .authorized(Method::GET, &self.object_url(&conn, path), &conn)
                    .send()
                    .await?;
                let response = self.check(response, path).await?;
                Ok(response.bytes().await?.to_vec())
            })
            .await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let copy_from = format!(
            "/{}/{}",
            self.config.container_name,
            encode_key(&normalize_path(src))
        );
        self.retry
            .run("swift copy", || async {
                let conn = self.connection().await?;
                let response = self
                    .authorized(Method::PUT, &self.object_url(&conn, dst), &conn)
                    .header("X-Copy-From", &copy_from)
                    .header(reqwest::header::CONTENT_LENGTH, 0)
                    .send()
                    .await?;
                // A 404 here refers to the source object
                self.check(response, src).await?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.retry
            .run("swift delete", || async {
                let conn = self.connection().await?;
                let response = self
                    .authorized(Method::DELETE, &self.object_url(&conn, path), &conn)
                    .send()
                    .await?;
                self.check(response, path).await?;
                Ok(())
            })
            .await
    }
}

/// Percent-encode every segment of an object key, keeping the `/` separators
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn swift_server() -> (MockServer, SwiftStorage) {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/auth/v1.0"))
            .and(header("X-Auth-User", "chris:chris1234"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Storage-Url", format!("{}/v1/AUTH_test", server.uri()))
                    .insert_header("X-Auth-Token", "tok"),
            )
            .mount(&server)
            .await;

        let storage = SwiftStorage::new(SwiftConfig {
            auth_url: format!("{}/auth/v1.0", server.uri()),
            username: "chris:chris1234".to_string(),
            key: "testing".to_string(),
            container_name: "users".to_string(),
        })
        .with_retry_policy(RetryPolicy::new(5, Duration::from_millis(1)));

        (server, storage)
    }

    #[tokio::test]
    async fn test_obj_exists_maps_404_to_false() {
        let (server, storage) = swift_server().await;

        Mock::given(method("HEAD"))
            .and(path("/v1/AUTH_test/users/home/jane/a.txt"))
            .and(header("X-Auth-Token", "tok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/v1/AUTH_test/users/home/jane/missing.txt"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        assert!(storage.obj_exists("home/jane/a.txt").await.unwrap());
        assert!(!storage.obj_exists("home/jane/missing.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_retries_server_errors() {
        let (server, storage) = swift_server().await;

        Mock::given(method("GET"))
            .and(path("/v1/AUTH_test/users/home/jane/a.txt"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/AUTH_test/users/home/jane/a.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let bytes = storage.download("home/jane/a.txt").await.unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn test_upload_gives_up_after_five_attempts() {
        let (server, storage) = swift_server().await;

        Mock::given(method("PUT"))
            .and(path("/v1/AUTH_test/users/home/jane/a.txt"))
            .respond_with(ResponseTemplate::new(500))
            .expect(5)
            .mount(&server)
            .await;

        let err = storage
            .upload("home/jane/a.txt", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ApiError { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_ls_filters_sibling_prefixes() {
        let (server, storage) = swift_server().await;

        Mock::given(method("GET"))
            .and(path("/v1/AUTH_test/users"))
            .and(query_param("prefix", "home/jane/feeds/feed_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "home/jane/feeds/feed_1/pl-dircopy_1/data/a.txt"},
                {"name": "home/jane/feeds/feed_10/pl-dircopy_9/data/b.txt"}
            ])))
            .mount(&server)
            .await;

        let objects = storage.ls("/home/jane/feeds/feed_1/").await.unwrap();
        assert_eq!(objects, vec!["home/jane/feeds/feed_1/pl-dircopy_1/data/a.txt"]);
    }

    #[tokio::test]
    async fn test_copy_uses_server_side_copy() {
        let (server, storage) = swift_server().await;

        Mock::given(method("PUT"))
            .and(path("/v1/AUTH_test/users/dst/a.txt"))
            .and(header("X-Copy-From", "/users/src/a.txt"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        storage.copy("src/a.txt", "dst/a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_authentication_retried_once_per_attempt() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/auth/v1.0"))
            .respond_with(ResponseTemplate::new(503))
            .expect(5)
            .mount(&server)
            .await;

        let storage = SwiftStorage::new(SwiftConfig {
            auth_url: format!("{}/auth/v1.0", server.uri()),
            username: "chris:chris1234".to_string(),
            key: "testing".to_string(),
            container_name: "users".to_string(),
        })
        .with_retry_policy(RetryPolicy::new(5, Duration::from_millis(1)));

        let err = storage.download("home/jane/a.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::ApiError { status: 503, .. }));
    }

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("a b/c?d#e%f"), "a%20b/c%3Fd%23e%25f");
        assert_eq!(encode_key("dir/a\\b"), "dir/a%5Cb");
        assert_eq!(encode_key("x/\"<q>\"/é"), "x/%22%3Cq%3E%22/%C3%A9");
        assert_eq!(encode_key("home/jane/pl-dircopy_1/data.v2~"), "home/jane/pl-dircopy_1/data.v2~");
    }
}
