//! Metric helpers for `btpwire`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. Without the
//! `metrics` feature the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::status::Status;

/// Name of the counter tracking frames handed to the dispatcher.
pub const FRAMES_DECODED: &str = "btpwire_frames_decoded_total";
/// Name of the counter tracking discarded frames, labelled by reason.
pub const FRAMES_DROPPED: &str = "btpwire_frames_dropped_total";
/// Name of the counter tracking replies, labelled by status.
pub const REPLIES_SENT: &str = "btpwire_replies_total";
/// Name of the counter tracking emitted events.
pub const EVENTS_SENT: &str = "btpwire_events_total";

/// Reason an inbound frame never reached the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The declared length exceeded the maximum payload.
    Oversized,
    /// No command slot was free.
    Overflow,
}

impl DropReason {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            DropReason::Oversized => "oversized",
            DropReason::Overflow => "overflow",
        }
    }
}

/// Record a frame handed to the dispatch queue.
pub fn inc_decoded() {
    #[cfg(feature = "metrics")]
    counter!(FRAMES_DECODED).increment(1);
}

/// Record a discarded inbound frame.
pub fn inc_dropped(reason: DropReason) {
    #[cfg(feature = "metrics")]
    counter!(FRAMES_DROPPED, "reason" => reason.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = reason;
}

/// Record a reply sent with `status`.
pub fn inc_replies(status: Status) {
    #[cfg(feature = "metrics")]
    counter!(REPLIES_SENT, "status" => status.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = status;
}

/// Record an emitted event.
pub fn inc_events() {
    #[cfg(feature = "metrics")]
    counter!(EVENTS_SENT).increment(1);
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use metrics_util::{
        CompositeKey,
        MetricKind,
        debugging::{DebugValue, DebuggingRecorder},
    };

    use super::*;

    type Snapshot = Vec<(
        CompositeKey,
        Option<metrics::Unit>,
        Option<metrics::SharedString>,
        DebugValue,
    )>;

    fn counter_value(
        snapshot: &Snapshot,
        name: &str,
        label: Option<(&str, &str)>,
    ) -> u64 {
        snapshot
            .iter()
            .filter(|(key, ..)| key.kind() == MetricKind::Counter && key.key().name() == name)
            .filter(|(key, ..)| {
                label.is_none_or(|(k, v)| {
                    key.key()
                        .labels()
                        .any(|l| l.key() == k && l.value() == v)
                })
            })
            .map(|(.., value)| match value {
                DebugValue::Counter(n) => *n,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn counters_are_labelled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            inc_decoded();
            inc_dropped(DropReason::Overflow);
            inc_replies(Status::Failed);
            inc_replies(Status::Failed);
            inc_events();
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(counter_value(&snapshot, FRAMES_DECODED, None), 1);
        assert_eq!(
            counter_value(&snapshot, FRAMES_DROPPED, Some(("reason", "overflow"))),
            1
        );
        assert_eq!(
            counter_value(&snapshot, REPLIES_SENT, Some(("status", "failed"))),
            2
        );
        assert_eq!(counter_value(&snapshot, EVENTS_SENT, None), 1);
    }
}
