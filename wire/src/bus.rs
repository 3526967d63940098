//! Bus client wrapper.
//!
//! Thin JSON layer over the NATS client: every request carries an explicit
//! deadline, every reply path tolerates a missing reply inbox.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),

    #[error("bus request timed out after {0:?}")]
    Timeout(Duration),

    #[error("bus request failed: {0}")]
    Request(String),

    #[error("bus publish failed: {0}")]
    Publish(String),

    #[error("bus subscribe failed: {0}")]
    Subscribe(String),

    #[error("bad message body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Shared NATS handle. Cheap to clone.
#[derive(Clone)]
pub struct BusClient {
    client: async_nats::Client,
}

impl BusClient {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn inner(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    /// Request/reply with a JSON body and an explicit deadline.
    pub async fn request_json<Req, Resp>(
        &self,
        subject: &str,
        req: &Req,
        timeout: Duration,
    ) -> Result<Resp, BusError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = Bytes::from(serde_json::to_vec(req)?);
        let msg = tokio::time::timeout(timeout, self.client.request(subject.to_string(), payload))
            .await
            .map_err(|_| BusError::Timeout(timeout))?
            .map_err(|e| BusError::Request(e.to_string()))?;
        Ok(serde_json::from_slice(&msg.payload)?)
    }

    pub async fn publish_json<T: Serialize>(&self, subject: &str, msg: &T) -> Result<(), BusError> {
        let payload = Bytes::from(serde_json::to_vec(msg)?);
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    /// Answer a request if it carried a reply inbox; log and move on if not.
    pub async fn reply_json<T: Serialize>(
        &self,
        reply: Option<async_nats::Subject>,
        msg: &T,
    ) -> Result<(), BusError> {
        let Some(subject) = reply else {
            warn!("request had no reply inbox, dropping response");
            return Ok(());
        };
        let payload = Bytes::from(serde_json::to_vec(msg)?);
        self.client
            .publish(subject, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber, BusError> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))
    }

    pub async fn flush(&self) {
        let _ = self.client.flush().await;
    }
}
