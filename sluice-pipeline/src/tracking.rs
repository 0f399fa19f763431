//! Delivery acknowledgment for tracked data points.
//!
//! A producer that wants to learn when its points have been delivered creates a
//! [`delivery_channel`] and hands the notifier to [`TrackingRegistry::track`]. The router later
//! declares how many sinks received the point with [`TrackingRegistry::register_obligations`],
//! and every sink reports its outcome with [`TrackingRegistry::report_outcome`]. Once all
//! outcomes are in, exactly one [`DeliveryInfo`] is sent to the producer.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sluice_statsd::metric;
use tokio::sync::mpsc;

use crate::error::TrackingProtocolError;
use crate::point::DataPoint;
use crate::statsd::{PipelineCounters, PipelineGauges};

/// Opaque identity of a tracked point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackingId(u64);

impl TrackingId {
    /// Creates an id from its raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value of this id.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The final outcome of a tracked point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// The point this outcome belongs to.
    pub id: TrackingId,
    /// `true` if every sink that received the point accepted it.
    pub delivered: bool,
}

/// Sending half of a delivery channel.
///
/// Cloning the notifier is cheap, all clones deliver into the same receiver.
#[derive(Clone, Debug)]
pub struct DeliveryNotifier(mpsc::UnboundedSender<DeliveryInfo>);

impl DeliveryNotifier {
    fn notify(&self, info: DeliveryInfo) {
        // The producer may have gone away, which is fine.
        if self.0.send(info).is_err() {
            sluice_log::trace!(id = %info.id, "delivery receiver dropped");
        }
    }
}

/// Creates a channel that receives [`DeliveryInfo`] for all points tracked with the notifier.
pub fn delivery_channel() -> (DeliveryNotifier, mpsc::UnboundedReceiver<DeliveryInfo>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliveryNotifier(tx), rx)
}

#[derive(Debug, Default)]
struct Obligations {
    registered: Option<usize>,
    succeeded: usize,
    failed: usize,
    resolved: bool,
}

impl Obligations {
    fn reported(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug)]
struct Entry {
    notifier: DeliveryNotifier,
    state: Mutex<Obligations>,
}

/// Book-keeping of outstanding obligations per tracked point.
///
/// Entries live in a concurrent map and carry their own lock, so outcomes for different points
/// never contend. Protocol violations are logged, counted and forwarded to the optional error
/// channel. They never panic.
#[derive(Debug)]
pub struct TrackingRegistry {
    entries: papaya::HashMap<TrackingId, Arc<Entry>>,
    next_id: AtomicU64,
    errors: Option<mpsc::UnboundedSender<TrackingProtocolError>>,
}

impl TrackingRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: papaya::HashMap::new(),
            next_id: AtomicU64::new(1),
            errors: None,
        }
    }

    /// Creates an empty registry that forwards protocol errors to a channel.
    pub fn with_error_channel(errors: mpsc::UnboundedSender<TrackingProtocolError>) -> Self {
        Self {
            errors: Some(errors),
            ..Self::new()
        }
    }

    /// Starts tracking a point.
    ///
    /// Returns the assigned id along with the tracked point. The outcome is sent to `notifier`
    /// once the point resolves.
    pub fn track(
        &self,
        mut point: DataPoint,
        notifier: &DeliveryNotifier,
    ) -> (TrackingId, DataPoint) {
        let id = TrackingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(Entry {
            notifier: notifier.clone(),
            state: Mutex::new(Obligations::default()),
        });

        self.entries.pin().insert(id, entry);
        self.emit_pending();

        point.set_tracking(id);
        (id, point)
    }

    /// Declares that the point was forwarded to `count` sinks.
    ///
    /// A count of zero resolves the point immediately as delivered. Obligations must be
    /// registered exactly once and before any outcome is reported.
    pub fn register_obligations(
        &self,
        id: TrackingId,
        count: usize,
    ) -> Result<(), TrackingProtocolError> {
        let entry = self.entry(id)?;

        let resolved = {
            let mut state = entry.state.lock();
            if state.registered.is_some() {
                return Err(self.protocol_error(TrackingProtocolError::AlreadyRegistered(id)));
            }

            state.registered = Some(count);
            if count == 0 {
                state.resolved = true;
            }
            state.resolved
        };

        if resolved {
            self.resolve(id, &entry, true);
        }

        Ok(())
    }

    /// Reports the outcome of one obligation.
    ///
    /// When the last outstanding obligation reports, the producer is notified. The point counts as
    /// delivered only if all outcomes were successful.
    pub fn report_outcome(&self, id: TrackingId, success: bool) -> Result<(), TrackingProtocolError> {
        let entry = self.entry(id)?;

        let delivered = {
            let mut state = entry.state.lock();
            let Some(registered) = state.registered else {
                return Err(self.protocol_error(TrackingProtocolError::NotRegistered(id)));
            };

            if state.resolved || state.reported() >= registered {
                return Err(self.protocol_error(TrackingProtocolError::TooManyOutcomes {
                    id,
                    registered,
                }));
            }

            if success {
                state.succeeded += 1;
            } else {
                state.failed += 1;
            }

            if state.reported() < registered {
                return Ok(());
            }

            state.resolved = true;
            state.failed == 0
        };

        self.resolve(id, &entry, delivered);
        Ok(())
    }

    /// Returns the number of tracked points that have not resolved yet.
    pub fn pending(&self) -> usize {
        self.entries.pin().len()
    }

    fn entry(&self, id: TrackingId) -> Result<Arc<Entry>, TrackingProtocolError> {
        match self.entries.pin().get(&id) {
            Some(entry) => Ok(Arc::clone(entry)),
            None => Err(self.protocol_error(TrackingProtocolError::UnknownId(id))),
        }
    }

    /// Removes the entry and notifies the producer. Called once per entry, outside its lock.
    fn resolve(&self, id: TrackingId, entry: &Entry, delivered: bool) {
        self.entries.pin().remove(&id);
        self.emit_pending();

        metric!(
            counter(PipelineCounters::DeliveryResolved) += 1,
            delivered = if delivered { "true" } else { "false" },
        );

        entry.notifier.notify(DeliveryInfo { id, delivered });
    }

    fn protocol_error(&self, error: TrackingProtocolError) -> TrackingProtocolError {
        sluice_log::error!(
            error = &error as &dyn std::error::Error,
            "delivery tracking protocol violated"
        );

        let kind = match error {
            TrackingProtocolError::UnknownId(_) => "unknown_id",
            TrackingProtocolError::NotRegistered(_) => "not_registered",
            TrackingProtocolError::AlreadyRegistered(_) => "already_registered",
            TrackingProtocolError::TooManyOutcomes { .. } => "too_many_outcomes",
        };
        metric!(
            counter(PipelineCounters::TrackingProtocolError) += 1,
            kind = kind
        );

        if let Some(ref errors) = self.errors {
            let _ = errors.send(error);
        }

        error
    }

    fn emit_pending(&self) {
        metric!(gauge(PipelineGauges::TrackingPending) = self.pending() as u64);
    }
}

impl Default for TrackingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::point::FieldValue;

    fn point() -> DataPoint {
        DataPoint::new(
            "queue",
            BTreeMap::new(),
            BTreeMap::from([("value".to_owned(), FieldValue::Int(1))]),
            Utc.timestamp_opt(0, 0).unwrap(),
        )
    }

    #[test]
    fn test_fan_out_any_order() {
        let registry = TrackingRegistry::new();
        let (notifier, mut rx) = delivery_channel();

        let (id, tracked) = registry.track(point(), &notifier);
        assert_eq!(tracked.tracking_id(), Some(id));

        registry.register_obligations(id, 3).unwrap();
        registry.report_outcome(id, true).unwrap();
        registry.report_outcome(id, true).unwrap();
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        registry.report_outcome(id, true).unwrap();
        assert_eq!(
            rx.try_recv(),
            Ok(DeliveryInfo {
                id,
                delivered: true
            })
        );
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_single_failure_fails_delivery() {
        let registry = TrackingRegistry::new();
        let (notifier, mut rx) = delivery_channel();

        let (id, _) = registry.track(point(), &notifier);
        registry.register_obligations(id, 3).unwrap();
        registry.report_outcome(id, false).unwrap();
        registry.report_outcome(id, true).unwrap();
        registry.report_outcome(id, true).unwrap();

        assert_eq!(
            rx.try_recv(),
            Ok(DeliveryInfo {
                id,
                delivered: false
            })
        );
    }

    #[test]
    fn test_zero_obligations_resolve_immediately() {
        let registry = TrackingRegistry::new();
        let (notifier, mut rx) = delivery_channel();

        let (id, _) = registry.track(point(), &notifier);
        assert_eq!(registry.pending(), 1);

        registry.register_obligations(id, 0).unwrap();
        assert_eq!(
            rx.try_recv(),
            Ok(DeliveryInfo {
                id,
                delivered: true
            })
        );
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_protocol_errors() {
        sluice_test::setup();

        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        let registry = TrackingRegistry::with_error_channel(errors_tx);
        let (notifier, mut rx) = delivery_channel();

        let (id, _) = registry.track(point(), &notifier);
        assert_eq!(
            registry.report_outcome(id, true),
            Err(TrackingProtocolError::NotRegistered(id))
        );

        registry.register_obligations(id, 1).unwrap();
        assert_eq!(
            registry.register_obligations(id, 1),
            Err(TrackingProtocolError::AlreadyRegistered(id))
        );

        registry.report_outcome(id, true).unwrap();
        assert_eq!(
            registry.report_outcome(id, true),
            Err(TrackingProtocolError::UnknownId(id))
        );

        let unknown = TrackingId::new(999);
        assert_eq!(
            registry.register_obligations(unknown, 1),
            Err(TrackingProtocolError::UnknownId(unknown))
        );

        // Only the single valid resolution reaches the producer.
        assert!(rx.try_recv().unwrap().delivered);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        let mut reported = Vec::new();
        while let Ok(error) = errors_rx.try_recv() {
            reported.push(error);
        }
        assert_eq!(
            reported,
            vec![
                TrackingProtocolError::NotRegistered(id),
                TrackingProtocolError::AlreadyRegistered(id),
                TrackingProtocolError::UnknownId(id),
                TrackingProtocolError::UnknownId(unknown),
            ]
        );
    }

    #[test]
    fn test_dropped_receiver_is_tolerated() {
        let registry = TrackingRegistry::new();
        let (notifier, rx) = delivery_channel();
        drop(rx);

        let (id, _) = registry.track(point(), &notifier);
        registry.register_obligations(id, 1).unwrap();
        registry.report_outcome(id, true).unwrap();
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_protocol_error_metric() {
        let registry = TrackingRegistry::new();
        let captures = sluice_statsd::with_capturing_test_client(|| {
            let _ = registry.report_outcome(TrackingId::new(1), true);
        });

        insta::assert_debug_snapshot!(captures, @r###"
        [
            "pipeline.tracking.protocol_error:1|c|#kind:unknown_id",
        ]
        "###);
    }

    #[test]
    fn test_concurrent_outcomes_resolve_once() {
        let registry = Arc::new(TrackingRegistry::new());
        let (notifier, mut rx) = delivery_channel();

        let (id, _) = registry.track(point(), &notifier);
        registry.register_obligations(id, 8).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.report_outcome(id, true))
            })
            .collect();

        for thread in threads {
            thread.join().unwrap().unwrap();
        }

        assert_eq!(
            rx.try_recv(),
            Ok(DeliveryInfo {
                id,
                delivered: true
            })
        );
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }
}
