use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request sent by the [`Controller`] to all subscribed tasks.
///
/// A task has to ensure that it doesn't take longer than `timeout` to finish. Ideally, open work
/// is flushed in an orderly manner but no new work is accepted anymore. After the timeout the
/// pipeline stops regardless of what the tasks do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Coordinates the graceful shutdown of a pipeline.
///
/// Tasks obtain a [`ShutdownHandle`] via [`Controller::handle`] and wait on it. Calling
/// [`Controller::shutdown`] notifies all handles at once. Signal handling is left to the embedding
/// process, which calls `shutdown` when it decides to stop.
///
/// ### Example
///
/// ```
/// use std::time::Duration;
/// use sluice_system::Controller;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let controller = Controller::new();
/// let mut handle = controller.handle();
///
/// controller.shutdown(Some(Duration::from_secs(5)));
/// let shutdown = handle.notified().await;
/// assert_eq!(shutdown.timeout, Some(Duration::from_secs(5)));
/// # }
/// ```
#[derive(Debug)]
pub struct Controller {
    tx: watch::Sender<Option<Shutdown>>,
}

impl Controller {
    /// Creates a new controller that has not been shut down.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Returns a handle to wait for the shutdown signal of this controller.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.tx.subscribe())
    }

    /// Notifies all handles to shut down within the given timeout.
    ///
    /// Subsequent calls replace the timeout, which allows to escalate a graceful shutdown into a
    /// forced one.
    pub fn shutdown(&self, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => sluice_log::info!("shutting down gracefully within {timeout:?}"),
            None => sluice_log::info!("shutting down immediately"),
        }
        self.tx.send_replace(Some(Shutdown { timeout }));
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to wait for the shutdown of a [`Controller`].
#[derive(Clone, Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Returns the shutdown request if the controller has already been shut down.
    pub fn get(&self) -> Option<Shutdown> {
        *self.0.borrow()
    }

    /// Waits until the controller shuts down.
    ///
    /// If the controller is dropped without a shutdown request, this resolves to an immediate
    /// forced shutdown.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = *self.0.borrow_and_update() {
                return shutdown;
            }

            if self.0.changed().await.is_err() {
                return Shutdown { timeout: None };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_resolves_after_shutdown() {
        sluice_test::setup();

        let controller = Controller::new();
        let mut handle = controller.handle();
        assert_eq!(handle.get(), None);

        let waiter = tokio::spawn(async move { handle.notified().await });
        controller.shutdown(Some(Duration::from_secs(3)));

        let shutdown = waiter.await.unwrap();
        assert_eq!(shutdown.timeout, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_handle_created_after_shutdown() {
        let controller = Controller::new();
        controller.shutdown(None);

        let mut handle = controller.handle();
        assert_eq!(handle.notified().await, Shutdown { timeout: None });
    }

    #[tokio::test]
    async fn test_dropped_controller_forces_shutdown() {
        let controller = Controller::new();
        let mut handle = controller.handle();
        drop(controller);

        assert_eq!(handle.notified().await.timeout, None);
    }
}
