//! Assignment publisher
//!
//! The single write path to the coordination service. Writes are conditional
//! on the version token of the view that produced them; a conflicting write
//! re-runs the whole cycle from a fresh view, with exponential backoff
//! between attempts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::{AssignmentError, Result};
use crate::metadata::{ClusterView, TableRecord, Version};

/// Retry schedule of a planning cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Conditional writer of table records
pub struct AssignmentPublisher {
    coordinator: Arc<dyn Coordinator>,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl AssignmentPublisher {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            coordinator,
            request_timeout,
            retry,
        }
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Read a fresh view of a table
    pub async fn load_view(&self, table: &str) -> Result<ClusterView> {
        ClusterView::load(self.coordinator.as_ref(), table, self.request_timeout).await
    }

    /// Write `record` if the table is still at version `expected`
    pub async fn publish(
        &self,
        table: &str,
        record: TableRecord,
        expected: Version,
    ) -> Result<Version> {
        let write = self.coordinator.write_table(table, record, expected);
        let version = tokio::time::timeout(self.request_timeout, write)
            .await
            .map_err(|_| {
                AssignmentError::InstanceUnavailable(format!(
                    "write of table {} timed out after {:?}",
                    table, self.request_timeout
                ))
            })??;

        debug!("Published table {}: version {} -> {}", table, expected, version);
        Ok(version)
    }

    /// Run a planning cycle until it succeeds or fails for good
    ///
    /// `cycle` gets a fresh view on every attempt. Transient errors are
    /// retried up to `max_attempts` times; anything else is returned as is.
    pub async fn run_cycle<T, F, Fut>(&self, table: &str, mut cycle: F) -> Result<T>
    where
        F: FnMut(ClusterView) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = match self.load_view(table).await {
                Ok(view) => cycle(view).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!("Cycle for table {} succeeded on attempt {}", table, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        "Cycle for table {} failed on attempt {}/{}: {}, retrying in {:?}",
                        table, attempt, self.retry.max_attempts, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LocalCoordinator;
    use crate::metadata::SegmentState;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn publisher(coordinator: Arc<LocalCoordinator>) -> AssignmentPublisher {
        AssignmentPublisher::new(
            coordinator,
            Duration::from_secs(1),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
        )
    }

    fn record_with(segment: &str, instance: &str) -> TableRecord {
        let mut record = TableRecord::default();
        record
            .assignment
            .set_state(segment, instance, SegmentState::Online);
        record
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_stale_token_conflicts() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let publisher = publisher(coordinator.clone());

        let view = publisher.load_view("events").await.unwrap();
        // someone else writes in between
        coordinator
            .write_table("events", record_with("seg_0", "server_x"), 0)
            .await
            .unwrap();

        let err = publisher
            .publish("events", record_with("seg_1", "server_a"), view.version)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AssignmentError::Conflict {
                table: "events".to_string(),
                expected: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_cycle_retries_from_fresh_view() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let publisher = publisher(coordinator.clone());
        let attempts = AtomicU32::new(0);

        let version = publisher
            .run_cycle("events", |view| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let coordinator = coordinator.clone();
                let publisher = &publisher;
                async move {
                    if attempt == 0 {
                        // a concurrent writer gets there first
                        coordinator
                            .write_table("events", record_with("seg_0", "server_x"), view.version)
                            .await?;
                    }
                    let mut record = view.record.clone();
                    record
                        .assignment
                        .set_state("seg_1", "server_a", SegmentState::Online);
                    publisher.publish("events", record, view.version).await
                }
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(version, 2);
        let stored = coordinator.read_table("events").await.unwrap();
        assert_eq!(stored.version, 2);
        assert!(stored.record.assignment.contains_segment("seg_0"));
        assert!(stored.record.assignment.contains_segment("seg_1"));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let publisher = publisher(coordinator);
        let attempts = AtomicU32::new(0);

        let err = publisher
            .run_cycle("events", |_view| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AssignmentError::TableNotFound("events".to_string())) }
            })
            .await
            .unwrap_err();
        assert_eq!(err, AssignmentError::TableNotFound("events".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let publisher = publisher(coordinator);
        let attempts = AtomicU32::new(0);

        let err = publisher
            .run_cycle("events", |view| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err::<(), _>(AssignmentError::Conflict {
                        table: "events".to_string(),
                        expected: view.version,
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
