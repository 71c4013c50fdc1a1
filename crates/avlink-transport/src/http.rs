//! HTTP channel.
//!
//! Switchers with a web API take commands as GET requests. [`HttpChannel`]
//! appends each payload to a base URL, issues the request on a spawned task,
//! and returns at once. The reply arrives later on the link's [`EventSink`]
//! as [`ChannelEvent::Response`], tagged with the ticket assigned at send
//! time. Responses are complete bodies, so they bypass the stream framer.

use std::time::Duration;

use async_trait::async_trait;
use avlink_core::error::{Error, Result};
use avlink_core::{Channel, ChannelEvent, ConnectionKind, EventSink};
use tokio::task::JoinHandle;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP GET channel.
pub struct HttpChannel {
    base_url: String,
    timeout: Duration,
    client: Option<reqwest::Client>,
    sink: Option<EventSink>,
    next_ticket: u64,
    in_flight: Vec<JoinHandle<()>>,
}

impl HttpChannel {
    /// Create a closed channel. Payloads are appended to `base_url` verbatim.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        HttpChannel {
            base_url: base_url.into(),
            timeout,
            client: None,
            sink: None,
            next_ticket: 1,
            in_flight: Vec::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Number of requests still outstanding.
    pub fn pending(&mut self) -> usize {
        self.in_flight.retain(|h| !h.is_finished());
        self.in_flight.len()
    }
}

#[async_trait]
impl Channel for HttpChannel {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Url
    }

    async fn connect(&mut self, sink: EventSink) -> Result<()> {
        self.disconnect().await?;

        // Control endpoints live on the local network.
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        tracing::info!(base_url = %self.base_url, "HTTP channel ready");
        self.client = Some(client);
        sink.online();
        self.sink = Some(sink);
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let (Some(client), Some(sink)) = (self.client.clone(), self.sink.clone()) else {
            return Err(Error::NotConnected);
        };

        let url = format!("{}{}", self.base_url, String::from_utf8_lossy(payload));
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        tracing::trace!(ticket, url = %url, "issuing request");

        self.in_flight.retain(|h| !h.is_finished());
        self.in_flight.push(tokio::spawn(async move {
            match fetch(&client, &url).await {
                Ok((status, body)) => {
                    tracing::debug!(ticket, status, bytes = body.len(), "response received");
                    sink.emit(ChannelEvent::Response {
                        ticket,
                        status,
                        body,
                    });
                }
                Err(e) => tracing::warn!(ticket, url = %url, error = %e, "request failed"),
            }
        }));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
        self.client = None;
        self.sink = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.sink.is_some()
    }
}

impl Drop for HttpChannel {
    fn drop(&mut self) {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<(u16, bytes::Bytes)> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;
    Ok((status, body))
}
