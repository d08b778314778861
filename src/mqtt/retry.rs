//! Retry-then-reconnect policy around every transport operation.
//!
//! 1. Not connected: force a reconnect first and give up if that fails.
//! 2. Attempt once, bounded by the operation timeout.
//! 3. On error or timeout: force one reconnect and attempt exactly once more.
//! 4. A second failure becomes [`PepeunitError::OperationFailed`].
//!
//! Reconnects carry the session epoch the caller saw, so concurrent callers
//! failing on the same session share one reconnect.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use crate::error::{Operation, PepeunitError, Result};

#[derive(Clone)]
pub struct RetryingExecutor {
    connection: Arc<ConnectionManager>,
}

impl RetryingExecutor {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    async fn attempt(&self, operation: Operation, topic: &str, payload: &[u8]) -> Result<(), String> {
        let transport = self.connection.transport();
        let call = async {
            match operation {
                Operation::Subscribe => transport.subscribe(topic).await,
                Operation::Unsubscribe => transport.unsubscribe(topic).await,
                Operation::Publish => transport.publish(topic, payload).await,
            }
        };
        let limit = self.connection.operation_timeout();
        match timeout(limit, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", limit)),
        }
    }

    async fn execute(&self, operation: Operation, topic: &str, payload: &[u8]) -> Result<()> {
        if !self.connection.is_connected() {
            debug!("{} on {} while disconnected, reconnecting first", operation, topic);
            let seen = self.connection.session_epoch();
            self.connection.reconnect_after(seen).await?;
        }
        let epoch = self.connection.session_epoch();

        let first = match self.attempt(operation, topic, payload).await {
            Ok(()) => return Ok(()),
            Err(cause) => cause,
        };
        warn!("{} on {} failed ({}), reconnecting and retrying", operation, topic, first);

        let cause = match self.connection.reconnect_after(epoch).await {
            Ok(()) => match self.attempt(operation, topic, payload).await {
                Ok(()) => return Ok(()),
                Err(cause) => cause,
            },
            Err(e) => format!("{}; reconnect failed: {}", first, e),
        };
        Err(PepeunitError::OperationFailed {
            operation,
            topic: topic.to_string(),
            cause,
        })
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.execute(Operation::Subscribe, topic, &[]).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.execute(Operation::Unsubscribe, topic, &[]).await
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.execute(Operation::Publish, topic, payload).await
    }

    /// Journals the whole batch, then subscribes topic by topic.
    ///
    /// Every topic is attempted; the first failure is returned at the end.
    pub async fn subscribe_topics(&self, topics: &[String]) -> Result<()> {
        self.connection.journal_add(topics.iter().cloned());
        self.each(Operation::Subscribe, topics).await
    }

    pub async fn unsubscribe_topics(&self, topics: &[String]) -> Result<()> {
        self.connection.journal_remove(topics);
        self.each(Operation::Unsubscribe, topics).await
    }

    async fn each(&self, operation: Operation, topics: &[String]) -> Result<()> {
        let mut first_error = None;
        for topic in topics {
            if let Err(e) = self.execute(operation, topic, &[]).await {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::MqttTuning;
    use crate::mqtt::testing::{Call, FakeTransport};
    use crate::settings::{Settings, SettingsStore};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn executor(fake: &Arc<FakeTransport>) -> RetryingExecutor {
        let store = Arc::new(SettingsStore::from_settings("env.json", Settings::default()));
        let (conn, _rx) = ConnectionManager::new(fake.clone(), store, MqttTuning::default());
        RetryingExecutor::new(conn)
    }

    #[tokio::test]
    async fn publish_on_disconnected_session_reconnects_once() {
        let fake = Arc::new(FakeTransport::new());
        let exec = executor(&fake);

        exec.publish("out/topic", b"42").await.unwrap();

        let calls = fake.calls();
        assert_eq!(fake.connects(), 1);
        assert!(matches!(calls[calls.len() - 2], Call::Connect(_)));
        assert_eq!(
            calls.last(),
            Some(&Call::Publish("out/topic".into(), b"42".to_vec()))
        );
    }

    #[tokio::test]
    async fn failed_attempt_is_retried_after_one_reconnect() {
        let fake = Arc::new(FakeTransport::new());
        let exec = executor(&fake);
        exec.connection().connect().await.unwrap();
        fake.failing_publishes.store(1, Ordering::SeqCst);

        exec.publish("out/topic", b"1").await.unwrap();
        assert_eq!(fake.connects(), 2);
        assert_eq!(fake.published().len(), 2);
    }

    #[tokio::test]
    async fn second_failure_is_reported() {
        let fake = Arc::new(FakeTransport::new());
        let exec = executor(&fake);
        exec.connection().connect().await.unwrap();
        fake.failing_publishes.store(2, Ordering::SeqCst);

        let err = exec.publish("out/topic", b"1").await.unwrap_err();
        match err {
            PepeunitError::OperationFailed {
                operation, topic, ..
            } => {
                assert_eq!(operation, Operation::Publish);
                assert_eq!(topic, "out/topic");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.published().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_publishes_share_one_reconnect() {
        let fake = Arc::new(FakeTransport::new());
        fake.set_connect_delay(Duration::from_millis(10));
        fake.set_publish_delay(Duration::from_millis(20));
        let exec = executor(&fake);

        let mut tasks = Vec::new();
        for i in 0..5u8 {
            let exec = exec.clone();
            tasks.push(tokio::spawn(async move {
                exec.publish("out/topic", &[i]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(fake.connects(), 1);
        assert_eq!(fake.published().len(), 5);
    }

    #[tokio::test]
    async fn reconnect_failure_is_returned_immediately() {
        let fake = Arc::new(FakeTransport::new());
        fake.refuse_connect.store(true, Ordering::SeqCst);
        let exec = executor(&fake);

        assert!(matches!(
            exec.subscribe("in/topic").await,
            Err(PepeunitError::ConnectFailed(_))
        ));
        assert!(fake.subscribed().is_empty());
    }

    #[tokio::test]
    async fn batch_attempts_every_topic_and_returns_first_failure() {
        let fake = Arc::new(FakeTransport::new());
        let exec = executor(&fake);
        exec.connection().connect().await.unwrap();
        fake.fail_topic("b");

        let topics = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let err = exec.subscribe_topics(&topics).await.unwrap_err();
        assert!(matches!(err, PepeunitError::OperationFailed { topic, .. } if topic == "b"));

        let subscribed = fake.subscribed();
        assert!(subscribed.contains(&"c".to_string()));
        assert_eq!(exec.connection().journal().len(), 3);

        exec.unsubscribe_topics(&topics[..1]).await.unwrap();
        assert!(!exec.connection().journal().contains("a"));
    }
}
