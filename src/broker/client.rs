//! Broker connection lifecycle and publish retry policy.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};
use tracing::{debug, error, info, warn};

use super::{BrokerError, Connector, Delivery, Result, Session};
use crate::config::ConnectionParams;

/// Observable state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport yet, or closed.
    Disconnected,
    /// Connected, authenticated, channel open.
    Open,
    /// The last open or publish failed; the transport was discarded.
    Error,
}

enum Link {
    Disconnected,
    Open(Box<dyn Session>),
    Error,
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Tries it took, starting at 1.
    pub attempts: u32,
    /// Correlation id of the try that succeeded.
    pub correlation_id: String,
}

/// Owns at most one broker connection and publishes records over it.
///
/// The connection is opened lazily and kept across publishes. Any failure
/// discards it entirely; the next try reconnects from scratch.
pub struct BrokerClient<C> {
    params: Arc<ConnectionParams>,
    connector: C,
    link: Link,
}

impl<C: Connector> BrokerClient<C> {
    pub fn new(params: Arc<ConnectionParams>, connector: C) -> Self {
        Self {
            params,
            connector,
            link: Link::Disconnected,
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn state(&self) -> ConnectionState {
        match self.link {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Open(_) => ConnectionState::Open,
            Link::Error => ConnectionState::Error,
        }
    }

    /// Open the connection unless it is already open.
    pub async fn open(&mut self) -> Result<()> {
        if matches!(self.link, Link::Open(_)) {
            return Ok(());
        }

        debug!(host = %self.params.host, ip = %self.params.ip, port = self.params.port, "Opening broker connection");
        match self.connector.open(&self.params).await {
            Ok(session) => {
                info!(
                    ip = %self.params.ip,
                    port = self.params.port,
                    vhost = %self.params.vhost,
                    "Connected to broker"
                );
                self.link = Link::Open(session);
                Ok(())
            }
            Err(e) => {
                self.link = Link::Error;
                Err(e)
            }
        }
    }

    /// Publish one payload, retrying up to the configured attempt count.
    ///
    /// Every try gets a fresh correlation id. Tries are separated by the
    /// configured delay, so `attempts` tries sleep `attempts - 1` times.
    /// When all tries fail the payload is dropped.
    #[tracing::instrument(name = "broker.publish", skip_all, fields(exchange = %self.params.exchange, routing_key = %self.params.routing_key))]
    pub async fn publish(&mut self, payload: &[u8]) -> Result<PublishReceipt> {
        let attempts = self.params.attempts.max(1);
        let delays = ConstantBuilder::default()
            .with_delay(self.params.retry_delay)
            .with_max_times((attempts - 1) as usize)
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(delays).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            let attempt = attempt as u32 + 1;

            if let Err(e) = self.open().await {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Broker connection failed, retrying..."
                );
                last_error = Some(e);
                continue;
            }

            let correlation_id = uuid::Uuid::new_v4().to_string();
            let delivery = Delivery {
                exchange: &self.params.exchange,
                routing_key: &self.params.routing_key,
                payload,
                correlation_id: &correlation_id,
            };

            let outcome = match &mut self.link {
                Link::Open(session) => session.publish(&delivery).await,
                _ => Err(BrokerError::Channel("connection not open".to_string())),
            };

            match outcome {
                Ok(()) => {
                    debug!(attempt, correlation_id = %correlation_id, "Published record");
                    return Ok(PublishReceipt {
                        attempts: attempt,
                        correlation_id,
                    });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        correlation_id = %correlation_id,
                        error = %e,
                        "Publish failed, dropping connection and retrying..."
                    );
                    self.link = Link::Error;
                    last_error = Some(e);
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        error!(attempts, last = %last, "Giving up on record");
        Err(BrokerError::Exhausted { attempts, last })
    }

    /// Close the connection if there is one. Safe to call repeatedly.
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.link, Link::Disconnected) {
            Link::Open(session) => {
                session.close().await?;
                info!("Broker connection closed");
                Ok(())
            }
            Link::Disconnected | Link::Error => Ok(()),
        }
    }
}
