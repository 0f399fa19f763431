use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::accumulator::Accumulator;
use crate::error::CollectionError;

/// Runs one request per target concurrently within a collection cycle.
///
/// All targets run to completion. Failures are collected per target rather than aborting
/// siblings, since partial success is the normal case for sources that probe many remote
/// endpoints.
///
/// # Example
///
/// ```
/// use sluice_pipeline::{CollectionError, FanOut};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let nodes = ["node-1", "node-2"];
/// let report = FanOut::new(4)
///     .run(nodes, &CancellationToken::new(), |node| async move {
///         match node {
///             "node-1" => Ok(()),
///             _ => Err(CollectionError::new("connection refused")),
///         }
///     })
///     .await;
///
/// assert_eq!(report.succeeded, 1);
/// assert_eq!(report.errors.len(), 1);
/// # }
/// ```
#[derive(Clone, Copy, Debug)]
pub struct FanOut {
    concurrency: usize,
    timeout: Option<Duration>,
}

impl FanOut {
    /// Creates a fan-out with at most `concurrency` targets in flight.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            timeout: None,
        }
    }

    /// Limits the time each target may take.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs `f` for every target and waits for all of them.
    ///
    /// Targets still running when `cancel` fires return [`CollectionError::Cancelled`]. Other
    /// errors are labelled with the target they occurred for.
    pub async fn run<T, I, F, Fut>(
        &self,
        targets: I,
        cancel: &CancellationToken,
        f: F,
    ) -> FanOutReport
    where
        I: IntoIterator<Item = T>,
        T: fmt::Display,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<(), CollectionError>>,
    {
        let timeout = self.timeout;

        let results = stream::iter(targets)
            .map(|target| {
                let label = target.to_string();
                let future = f(target);
                async move {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(CollectionError::Cancelled),
                        result = with_timeout(future, timeout) => result,
                    };
                    result.map_err(|error| label_error(label, error))
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut report = FanOutReport::default();
        for result in results {
            match result {
                Ok(()) => report.succeeded += 1,
                Err(error) if error.is_cancelled() => report.cancelled += 1,
                Err(error) => report.errors.push(error),
            }
        }
        report
    }
}

async fn with_timeout<Fut>(future: Fut, timeout: Option<Duration>) -> Result<(), CollectionError>
where
    Fut: Future<Output = Result<(), CollectionError>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future)
            .await
            .unwrap_or(Err(CollectionError::Timeout(timeout))),
        None => future.await,
    }
}

fn label_error(label: String, error: CollectionError) -> CollectionError {
    match error {
        CollectionError::Cancelled | CollectionError::Target { .. } => error,
        other => CollectionError::target(label, other),
    }
}

/// The outcome of a [`FanOut`] run.
#[derive(Debug, Default)]
pub struct FanOutReport {
    /// Number of targets that completed successfully.
    pub succeeded: usize,
    /// Number of targets interrupted by cancellation.
    pub cancelled: usize,
    /// Errors of all failed targets.
    pub errors: Vec<CollectionError>,
}

impl FanOutReport {
    /// Returns `true` if every target succeeded.
    pub fn is_success(&self) -> bool {
        self.cancelled == 0 && self.errors.is_empty()
    }

    /// Reports every error to the accumulator.
    pub fn report(self, acc: &Accumulator) {
        for error in self.errors {
            acc.add_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_errors_collected_per_target() {
        let report = FanOut::new(2)
            .run(1..=4, &CancellationToken::new(), |node| async move {
                tokio::time::sleep(Duration::from_millis(10 * node)).await;
                match node % 2 {
                    0 => Err(CollectionError::new(format!("node {node} unreachable"))),
                    _ => Ok(()),
                }
            })
            .await;

        assert_eq!(report.succeeded, 2);
        assert!(!report.is_success());

        let mut messages: Vec<String> = report
            .errors
            .iter()
            .map(|error| format!("{error}: {}", error.source().unwrap().source().unwrap()))
            .collect();
        messages.sort();

        similar_asserts::assert_eq!(
            messages,
            vec![
                "failed to collect from 2: node 2 unreachable".to_owned(),
                "failed to collect from 4: node 4 unreachable".to_owned(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = FanOut::new(3)
            .run(0..10, &CancellationToken::new(), |_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.succeeded, 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let report = FanOut::new(2)
            .with_timeout(Duration::from_secs(5))
            .run(["fast", "slow"], &CancellationToken::new(), |node| async move {
                if node == "slow" {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(())
            })
            .await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            report.errors[0].source().unwrap().to_string(),
            "collection timed out after 5s"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let report = FanOut::new(4)
            .run(0..3, &cancel, |node| async move {
                if node > 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(())
            })
            .await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.cancelled, 2);
        assert!(report.errors.is_empty());
    }
}
