//! Scripted HTTP client for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::epg::client::{HttpClient, HttpResponse};
use crate::epg::error::EpgError;

#[derive(Debug, Clone)]
pub(crate) enum StubReply {
    Body(u16, String),
    Timeout,
    Error,
}

/// Replies by URL; unknown URLs fail with a transport error
#[derive(Default)]
pub(crate) struct StubClient {
    replies: Mutex<HashMap<String, StubReply>>,
    delay: Duration,
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl StubClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn reply(&self, url: &str, reply: StubReply) {
        self.replies.lock().insert(url.to_string(), reply);
    }

    pub(crate) fn ok(&self, url: &str, body: &str) {
        self.reply(url, StubReply::Body(200, body.to_string()));
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn requested_urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

/// Decrements the in-flight counter even when the request future is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpClient for StubClient {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse, EpgError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = self.replies.lock().get(url).cloned();
        match reply {
            Some(StubReply::Body(status, body)) => Ok(HttpResponse {
                status,
                body: Bytes::from(body),
            }),
            Some(StubReply::Timeout) => {
                // Longer than any timeout used in tests
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(EpgError::NetworkTimeout { url: url.to_string() })
            }
            Some(StubReply::Error) | None => Err(EpgError::network(url, "connection refused")),
        }
    }
}

/// Minimal XMLTV document with one programme per `(start, stop, title)`
pub(crate) fn guide(channel_id: &str, programmes: &[(&str, &str, &str)]) -> String {
    let mut xml = format!("<tv><channel id=\"{}\"/>", channel_id);
    for (start, stop, title) in programmes {
        xml.push_str(&format!(
            "<programme channel=\"{}\" start=\"{} +0000\" stop=\"{} +0000\"><title>{}</title></programme>",
            channel_id, start, stop, title
        ));
    }
    xml.push_str("</tv>");
    xml
}
