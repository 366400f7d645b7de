//! HTTP access for EPG sources

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;

use crate::epg::error::EpgError;

/// Raw response from a source
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// GET with a per-request timeout. Non-2xx statuses are returned, not errors.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, EpgError>;
}

/// reqwest-backed client with compression support
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, EpgError> {
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                EpgError::NetworkTimeout { url: url.to_string() }
            } else {
                EpgError::network(url, e)
            }
        };

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_err)?;

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    const GUIDE: &str = r#"<tv><channel id="bbc1"/></tv>"#;

    async fn spawn_test_server() -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new()
            .route("/guide.xml", get(|| async { GUIDE }))
            .route("/missing.xml", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route(
                "/slow.xml",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    GUIDE
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let address = listener.local_addr().expect("local addr should exist");
        let join_handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server should run");
        });
        (format!("http://{address}"), join_handle)
    }

    #[tokio::test]
    async fn test_reqwest_client_statuses_and_timeout() {
        let (base, server_task) = spawn_test_server().await;
        let client = ReqwestClient::new("ynotv-epg-test").unwrap();
        let timeout = Duration::from_millis(300);

        let ok = client.get(&format!("{base}/guide.xml"), timeout).await.unwrap();
        assert!(ok.is_success());
        assert_eq!(&ok.body[..], GUIDE.as_bytes());

        let missing = client.get(&format!("{base}/missing.xml"), timeout).await.unwrap();
        assert_eq!(missing.status, 404);
        assert!(!missing.is_success());

        let slow = client.get(&format!("{base}/slow.xml"), timeout).await;
        assert!(matches!(slow, Err(EpgError::NetworkTimeout { .. })));

        server_task.abort();
    }

    #[tokio::test]
    async fn test_reqwest_client_transport_error() {
        let client = ReqwestClient::new("ynotv-epg-test").unwrap();

        // Port 9 (discard) on loopback is almost never listening
        let result = client
            .get("http://127.0.0.1:9/guide.xml", Duration::from_secs(2))
            .await;
        assert!(matches!(
            result,
            Err(EpgError::Network { .. }) | Err(EpgError::NetworkTimeout { .. })
        ));
    }
}
