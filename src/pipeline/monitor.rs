//! Observability channel between running segments and whoever watches them.
//!
//! The invoker and every segment thread hold a cloned [`Monitor`] and push
//! [`PipelineEvent`]s through a bounded crossbeam channel. Events are sent with
//! `try_send`, so a slow or absent observer never stalls the pipeline; excess
//! events are dropped.

use crate::pipeline::id::SegmentId;
use crate::pipeline::rate::RateAdjustment;
use crate::pipeline::segment::SegmentState;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Channel capacity for monitor events.
/// 10,000 events is several minutes of state changes and rate adjustments.
const EVENT_CHANNEL_CAPACITY: usize = 10_000;

/// Events emitted while a pipeline runs.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A segment moved to a new lifecycle state.
    SegmentState {
        segment: SegmentId,
        name: String,
        state: SegmentState,
    },

    /// The root governor changed its target rate.
    RateAdjusted {
        segment: SegmentId,
        adjustment: RateAdjustment,
    },

    /// A segment failed; its sinks have been closed.
    SegmentError {
        segment: SegmentId,
        name: String,
        message: String,
    },

    /// Every started segment has been joined.
    Finished { failed: bool },
}

/// Sending side, cloned into each segment thread.
#[derive(Debug, Clone)]
pub struct Monitor {
    tx: Sender<PipelineEvent>,
}

impl Monitor {
    /// Create a monitor pair: `(monitor_for_pipeline, receiver_for_observer)`.
    pub fn new() -> (Self, MonitorReceiver) {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, MonitorReceiver) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, MonitorReceiver { rx })
    }

    /// Publish an event without blocking.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// Observer-side handle.
pub struct MonitorReceiver {
    rx: Receiver<PipelineEvent>,
}

impl MonitorReceiver {
    /// Drain all pending events.
    pub fn drain(&self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Try to receive a single event without blocking.
    pub fn try_recv(&self) -> Option<PipelineEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PipelineEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Iterate until every `Monitor` clone is dropped.
    pub fn iter(&self) -> impl Iterator<Item = PipelineEvent> + '_ {
        self.rx.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_returns_in_order() {
        let (monitor, receiver) = Monitor::new();
        monitor.emit(PipelineEvent::Finished { failed: false });
        monitor.emit(PipelineEvent::Finished { failed: true });
        assert_eq!(
            receiver.drain(),
            vec![
                PipelineEvent::Finished { failed: false },
                PipelineEvent::Finished { failed: true },
            ]
        );
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn test_full_monitor_drops_instead_of_blocking() {
        let (monitor, receiver) = Monitor::with_capacity(1);
        monitor.emit(PipelineEvent::Finished { failed: false });
        monitor.emit(PipelineEvent::Finished { failed: true });
        assert_eq!(receiver.drain().len(), 1);
    }

    #[test]
    fn test_iter_ends_when_monitor_dropped() {
        let (monitor, receiver) = Monitor::new();
        monitor.emit(PipelineEvent::Finished { failed: false });
        drop(monitor);
        assert_eq!(receiver.iter().count(), 1);
        assert!(receiver.recv_timeout(Duration::from_millis(1)).is_none());
    }
}
