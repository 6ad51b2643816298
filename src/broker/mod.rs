//! Broker client for audit records.
//!
//! This module contains:
//! - `Connector` / `Session` traits: the transport seam
//! - `BrokerClient`: connection lifecycle and publish retry policy
//! - Implementations: AMQP (RabbitMQ), Mock

use async_trait::async_trait;

use crate::config::ConnectionParams;

pub mod amqp;
mod client;
pub mod mock;

pub use amqp::AmqpConnector;
pub use client::{BrokerClient, ConnectionState, PublishReceipt};
pub use mock::MockConnector;

/// Content type of every published record.
pub const CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT: u8 = 2;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur while talking to the broker.
///
/// Every variant is retried the same way; the classification only
/// serves logging.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Channel failed: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publish gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// One message on its way to the broker.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub payload: &'a [u8],
    /// Transport metadata only, never part of the payload.
    pub correlation_id: &'a str,
}

/// Opens transport sessions to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, authenticate and open one logical channel.
    ///
    /// Never retries internally.
    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Session>>;
}

/// An open connection with one logical channel.
#[async_trait]
pub trait Session: Send {
    /// Send one message and wait for the transport to accept it.
    async fn publish(&mut self, delivery: &Delivery<'_>) -> Result<()>;

    /// Close the channel and the connection.
    async fn close(self: Box<Self>) -> Result<()>;
}
