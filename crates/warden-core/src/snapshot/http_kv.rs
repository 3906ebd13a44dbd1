//! Remote key/value backend speaking the Consul KV HTTP API.
//!
//! | operation       | request                            |
//! |-----------------|------------------------------------|
//! | `get`           | `GET /v1/kv/<key>?raw`             |
//! | `put`           | `PUT /v1/kv/<key>` (raw body)      |
//! | `delete_prefix` | `DELETE /v1/kv/<prefix>?recurse`   |
//! | `keys`          | `GET /v1/kv/<prefix>?keys`         |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};

use crate::error::{Result, WardenError};
use crate::snapshot::KvClient;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Clone)]
pub struct HttpKvClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpKvClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| WardenError::Snapshot(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn request(&self, method: Method, key: &str, query: &str) -> RequestBuilder {
        let mut url = format!("{}/v1/kv/{}", self.base_url, key.trim_start_matches('/'));
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    async fn send(&self, what: &str, key: &str, req: RequestBuilder) -> Result<Response> {
        req.send()
            .await
            .map_err(|e| WardenError::Snapshot(format!("{what} {key}: {e}")))
    }
}

async fn failure(what: &str, key: &str, response: Response) -> WardenError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    WardenError::Snapshot(format!("{what} {key} failed ({status}): {}", body.trim()))
}

#[async_trait]
impl KvClient for HttpKvClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .send("get", key, self.request(Method::GET, key, "raw"))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| WardenError::Snapshot(format!("get {key}: {e}")))?;
                Ok(Some(body.to_vec()))
            }
            _ => Err(failure("get", key, response).await),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let response = self
            .send("put", key, self.request(Method::PUT, key, "").body(value))
            .await?;
        if !response.status().is_success() {
            return Err(failure("put", key, response).await);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let response = self
            .send("delete", prefix, self.request(Method::DELETE, prefix, "recurse"))
            .await?;
        if !response.status().is_success() {
            return Err(failure("delete", prefix, response).await);
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .send("keys", prefix, self.request(Method::GET, prefix, "keys"))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            s if s.is_success() => {
                let mut keys: Vec<String> = response
                    .json()
                    .await
                    .map_err(|e| WardenError::Snapshot(format!("keys {prefix}: {e}")))?;
                keys.sort();
                Ok(keys)
            }
            _ => Err(failure("keys", prefix, response).await),
        }
    }

    fn describe(&self) -> String {
        format!("consul:{}", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{conformance, KvSnapshotStore, SnapshotStore};
    use mockito::Matcher;

    #[tokio::test]
    async fn get_returns_raw_value_or_none() {
        let mut server = mockito::Server::new_async().await;
        let found = server
            .mock("GET", "/v1/kv/warden/g1/state")
            .match_query(Matcher::Exact("raw".into()))
            .with_status(200)
            .with_body("install:\n  package: ok\n")
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/v1/kv/warden/g2/state")
            .match_query(Matcher::Exact("raw".into()))
            .with_status(404)
            .create_async()
            .await;

        let kv = HttpKvClient::new(&server.url(), None).unwrap();
        assert_eq!(
            kv.get("warden/g1/state").await.unwrap().as_deref(),
            Some(&b"install:\n  package: ok\n"[..])
        );
        assert_eq!(kv.get("warden/g2/state").await.unwrap(), None);
        found.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn put_sends_token_and_body() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("PUT", "/v1/kv/warden/g1/data")
            .match_header("x-consul-token", "s3cret")
            .match_body("port: 80\n")
            .with_status(200)
            .with_body("true")
            .create_async()
            .await;

        let kv = HttpKvClient::new(&format!("{}/", server.url()), Some("s3cret".into())).unwrap();
        kv.put("warden/g1/data", b"port: 80\n".to_vec()).await.unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn keys_and_recursive_delete() {
        let mut server = mockito::Server::new_async().await;
        let keys = server
            .mock("GET", "/v1/kv/warden/")
            .match_query(Matcher::Exact("keys".into()))
            .with_status(200)
            .with_body(r#"["warden/g2/service","warden/g1/service","warden/g1/state"]"#)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/v1/kv/warden/g1/")
            .match_query(Matcher::Exact("recurse".into()))
            .with_status(200)
            .with_body("true")
            .create_async()
            .await;

        let kv = HttpKvClient::new(&server.url(), None).unwrap();
        assert_eq!(
            kv.keys("warden/").await.unwrap(),
            ["warden/g1/service", "warden/g1/state", "warden/g2/service"]
        );
        kv.delete_prefix("warden/g1/").await.unwrap();
        keys.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn empty_prefix_lists_nothing() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/kv/warden/")
            .match_query(Matcher::Exact("keys".into()))
            .with_status(404)
            .create_async()
            .await;
        let store = KvSnapshotStore::new(HttpKvClient::new(&server.url(), None).unwrap(), "warden");
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_errors_surface_as_snapshot_errors() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("PUT", Matcher::Any)
            .with_status(500)
            .with_body("rpc error: no leader")
            .create_async()
            .await;
        let store = KvSnapshotStore::new(HttpKvClient::new(&server.url(), None).unwrap(), "warden");
        let err = store
            .save(&conformance::snapshot("svc1", "g1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Snapshot(_)));
        assert!(err.to_string().contains("no leader"), "{err}");
    }
}
