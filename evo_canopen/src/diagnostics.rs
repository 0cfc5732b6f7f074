//! Loop diagnostics counters.
//!
//! Counters are plain relaxed atomics incremented from the loops and read
//! as a [`DiagnosticsSnapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    /// Frames handed to the transport.
    FramesSent,
    /// Frames received by the listener.
    FramesReceived,
    /// Transport send failures.
    SendErrors,
    /// SYNC ticks executed.
    SyncTicks,
    /// Ticks that overran the SYNC interval.
    TimingViolations,
    /// SDO upload responses dispatched to a handler.
    SdoUploads,
    /// SDO aborts received.
    SdoAborts,
    /// TPDO frames applied.
    PdoFeedback,
    /// Guarding replies (including boot-up) received.
    GuardReplies,
    /// Guarding replies repeating the previous toggle bit.
    ToggleRepeats,
    /// Nodes declared unresponsive.
    LivenessExpirations,
    /// Emergency messages received.
    Emergencies,
    /// Frames with a shape not matching their class.
    MalformedFrames,
    /// Frames with no handler.
    UnrecognizedFrames,
}

const COUNTER_COUNT: usize = Counter::UnrecognizedFrames as usize + 1;

/// Shared counters.
#[derive(Debug, Default)]
pub struct Diagnostics {
    counters: [AtomicU64; COUNTER_COUNT],
}

impl Diagnostics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    #[inline]
    pub fn record(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a counter.
    #[inline]
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Copy of all counters.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_sent: self.get(Counter::FramesSent),
            frames_received: self.get(Counter::FramesReceived),
            send_errors: self.get(Counter::SendErrors),
            sync_ticks: self.get(Counter::SyncTicks),
            timing_violations: self.get(Counter::TimingViolations),
            sdo_uploads: self.get(Counter::SdoUploads),
            sdo_aborts: self.get(Counter::SdoAborts),
            pdo_feedback: self.get(Counter::PdoFeedback),
            guard_replies: self.get(Counter::GuardReplies),
            toggle_repeats: self.get(Counter::ToggleRepeats),
            liveness_expirations: self.get(Counter::LivenessExpirations),
            emergencies: self.get(Counter::Emergencies),
            malformed_frames: self.get(Counter::MalformedFrames),
            unrecognized_frames: self.get(Counter::UnrecognizedFrames),
        }
    }
}

/// Point-in-time copy of [`Diagnostics`]. Serialized as one flat JSON
/// object when the binary logs in JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub send_errors: u64,
    pub sync_ticks: u64,
    pub timing_violations: u64,
    pub sdo_uploads: u64,
    pub sdo_aborts: u64,
    pub pdo_feedback: u64,
    pub guard_replies: u64,
    pub toggle_repeats: u64,
    pub liveness_expirations: u64,
    pub emergencies: u64,
    pub malformed_frames: u64,
    pub unrecognized_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let diag = Diagnostics::new();
        diag.record(Counter::SyncTicks);
        diag.record(Counter::SyncTicks);
        diag.record(Counter::UnrecognizedFrames);

        let snap = diag.snapshot();
        assert_eq!(snap.sync_ticks, 2);
        assert_eq!(snap.unrecognized_frames, 1);
        assert_eq!(snap.frames_sent, 0);
        assert_eq!(diag.get(Counter::SyncTicks), 2);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let diag = Diagnostics::new();
        diag.record(Counter::LivenessExpirations);
        let json = serde_json::to_value(diag.snapshot()).unwrap();

        assert_eq!(json["liveness_expirations"], 1);
        assert_eq!(json["frames_sent"], 0);
        assert_eq!(json.as_object().unwrap().len(), 14);
    }
}
