//! tokio adapters
//!
//! Drive a [`ConnectionAttempt`] or an outstanding request from async code
//! by polling in non-blocking mode and sleeping one poll interval between
//! attempts. Each poll blocks the calling task for at most one interval.

use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};
use tracing::debug;

use lodestar_core::{ClientConfig, Entry, Error, MessageId, Result, Stage};

use crate::budget;
use crate::connect::ConnectionAttempt;
use crate::connection::{Connection, OperationResult};
use crate::engine::ConnectionInitializer;

/// Open and bind a connection without blocking the runtime for long
pub async fn connect(
    config: ClientConfig,
    initializer: Arc<dyn ConnectionInitializer>,
) -> Result<Connection> {
    let interval = config.connection.poll_interval();
    let mut attempt = ConnectionAttempt::start(Arc::new(config), initializer)?;
    drive(&mut attempt, interval).await
}

/// Advance an attempt until it is bound or fails
pub async fn drive(attempt: &mut ConnectionAttempt, interval: Duration) -> Result<Connection> {
    loop {
        match attempt.advance(false)? {
            Poll::Ready(connection) => return Ok(connection),
            Poll::Pending => tokio::time::sleep(interval).await,
        }
    }
}

/// Wait for a non-commit operation; abandoned when `timeout` runs out
pub async fn complete(
    connection: &mut Connection,
    handle: MessageId,
    timeout: Option<Duration>,
) -> Result<OperationResult> {
    let interval = connection.config().connection.poll_interval();
    let deadline = budget::deadline_after(timeout);
    loop {
        if let Poll::Ready(result) = connection.poll(handle)? {
            return Ok(result);
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            debug!(handle, "Operation timed out");
            connection.abandon(handle)?;
            return Err(Error::Timeout {
                stage: Stage::Operation,
            });
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait for an `add`/`modify`; on timeout it is abandoned and rolled back
pub async fn complete_commit(
    connection: &mut Connection,
    handle: MessageId,
    entry: &mut Entry,
    timeout: Option<Duration>,
) -> Result<()> {
    let interval = connection.config().connection.poll_interval();
    let deadline = budget::deadline_after(timeout);
    loop {
        if let Poll::Ready(()) = connection.poll_commit(handle, entry)? {
            return Ok(());
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            debug!(handle, dn = %entry.dn(), "Commit timed out");
            connection.abandon_commit(handle, entry)?;
            return Err(Error::Timeout {
                stage: Stage::Operation,
            });
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LdapOutcome;
    use crate::mock::{self, MockInitializer};

    #[tokio::test]
    async fn test_connect_and_complete() {
        let script = mock::script();
        let initializer = MockInitializer::new(&script).delay(Duration::from_millis(20));

        let mut connection = connect(mock::config(Some(1_000)), Arc::new(initializer))
            .await
            .unwrap();
        let handle = connection.whoami().unwrap();
        let result = complete(&mut connection, handle, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(matches!(result, OperationResult::Extended { .. }));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let script = mock::script();
        let initializer = MockInitializer::new(&script).delay(Duration::from_millis(300));

        let start = Instant::now();
        let err = connect(mock::config(Some(50)), Arc::new(initializer))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                stage: Stage::Initialize
            }
        ));
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_complete_commit_rolls_back_on_rejection() {
        let script = mock::script();
        script
            .lock()
            .commit_outcomes
            .push_back(LdapOutcome::with_code(19, "constraint violation"));
        let mut connection = mock::bound(&script);

        let mut entry = Entry::from_search("cn=Bob,dc=example,dc=com", [("cn", vec!["Bob"])]);
        entry.get_mut("cn").unwrap().remove("Bob").unwrap();
        let handle = connection.modify(&mut entry).unwrap().unwrap();

        let err = complete_commit(&mut connection, handle, &mut entry, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { code: 19, .. }));
        assert_eq!(entry.get("cn").unwrap().removed(), ["Bob"]);
    }

    #[tokio::test]
    async fn test_complete_times_out() {
        let script = mock::script();
        let mut connection = mock::bound(&script);
        script.lock().silent = true;

        let handle = connection.delete("cn=Slow,dc=example,dc=com").unwrap();
        let err = complete(&mut connection, handle, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(connection.pending(), 0);
    }
}
