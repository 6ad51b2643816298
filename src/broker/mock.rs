//! Scripted broker transport for testing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{BrokerError, Connector, Delivery, Result, Session};
use crate::config::ConnectionParams;

/// A message the mock transport accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub correlation_id: String,
}

#[derive(Debug, Default)]
struct MockState {
    failing_opens: u32,
    failing_publishes: u32,
    fail_always: bool,
    open_calls: usize,
    publish_calls: usize,
    close_calls: usize,
    attempted_ids: Vec<String>,
    published: Vec<PublishedMessage>,
}

/// Mock connector. Clones share state, so a test can keep one clone for
/// inspection while the client owns another.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` opens.
    pub fn fail_opens(self, n: u32) -> Self {
        self.lock().failing_opens = n;
        self
    }

    /// Fail the next `n` publishes.
    pub fn fail_publishes(self, n: u32) -> Self {
        self.lock().failing_publishes = n;
        self
    }

    /// Fail every open.
    pub fn always_fail(self) -> Self {
        self.lock().fail_always = true;
        self
    }

    pub fn open_calls(&self) -> usize {
        self.lock().open_calls
    }

    pub fn publish_calls(&self) -> usize {
        self.lock().publish_calls
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    /// Correlation ids of every publish attempt, failed ones included.
    pub fn attempted_correlation_ids(&self) -> Vec<String> {
        self.lock().attempted_ids.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _params: &ConnectionParams) -> Result<Box<dyn Session>> {
        let mut state = self.lock();
        state.open_calls += 1;
        if state.fail_always {
            return Err(BrokerError::Connection("Mock open failure".to_string()));
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(BrokerError::Connection("Mock open failure".to_string()));
        }
        Ok(Box::new(MockSession {
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Session for MockSession {
    async fn publish(&mut self, delivery: &Delivery<'_>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.publish_calls += 1;
        state
            .attempted_ids
            .push(delivery.correlation_id.to_string());
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::Publish("Mock publish failure".to_string()));
        }
        state.published.push(PublishedMessage {
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            payload: delivery.payload.to_vec(),
            correlation_id: delivery.correlation_id.to_string(),
        });
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_published_messages() {
        let mock = MockConnector::new();
        let mut session = mock.open(&ConnectionParams::for_test()).await.unwrap();

        session
            .publish(&Delivery {
                exchange: "audit",
                routing_key: "files",
                payload: b"{}",
                correlation_id: "c-1",
            })
            .await
            .unwrap();
        session.close().await.unwrap();

        assert_eq!(mock.published()[0].correlation_id, "c-1");
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_fails_scripted_opens_then_recovers() {
        let mock = MockConnector::new().fail_opens(1);
        let params = ConnectionParams::for_test();

        assert!(mock.open(&params).await.is_err());
        assert!(mock.open(&params).await.is_ok());
        assert_eq!(mock.open_calls(), 2);
    }
}
