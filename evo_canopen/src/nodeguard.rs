//! Heartbeat supervision by node guarding.
//!
//! The master probes each node with a remote frame; the node answers with
//! its NMT state and an alternating toggle bit. A node silent for longer
//! than `guard time × life-time factor` is marked unresponsive and its NMT
//! state forced to `Unknown` until it answers again.

use evo_common::canopen::config::NetworkConfig;
use evo_common::canopen::state::{NmtState, NodeId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::codec::{decode_guard_reply, encode_guard_request};
use crate::diagnostics::{Counter, Diagnostics};
use crate::error::CanopenResult;
use crate::frame::CanFrame;
use crate::nmt;
use crate::registry::{Device, DeviceRegistry};

/// Liveness timing derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    guard_time: Duration,
    life_time_factor: u8,
}

impl LivenessPolicy {
    /// Policy with explicit values.
    pub fn new(guard_time: Duration, life_time_factor: u8) -> Self {
        Self {
            guard_time,
            life_time_factor,
        }
    }

    /// Policy from the network configuration (effective guard time and
    /// life-time factor).
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            Duration::from_millis(config.effective_guard_time_ms()),
            config.effective_life_time_factor(),
        )
    }

    /// Probe period.
    pub fn guard_time(&self) -> Duration {
        self.guard_time
    }

    /// Number of guard periods a node may stay silent.
    pub fn life_time_factor(&self) -> u8 {
        self.life_time_factor
    }

    /// Maximum tolerated silence.
    pub fn tolerance(&self) -> Duration {
        self.guard_time * self.life_time_factor as u32
    }

    /// True if `silence` strictly exceeds the tolerance.
    pub fn is_expired(&self, silence: Duration) -> bool {
        silence > self.tolerance()
    }
}

/// Send one guarding probe.
pub fn send_probe(bus: &Bus, node: NodeId) -> CanopenResult<()> {
    bus.send(&encode_guard_request(node))
}

/// Apply a guarding reply or boot-up message from `device`.
pub(crate) fn handle_reply(device: &Device, frame: &CanFrame, now: Instant, diagnostics: &Diagnostics) -> CanopenResult<()> {
    let reply = decode_guard_reply(frame)?;
    diagnostics.record(Counter::GuardReplies);

    let recovered = device.update(|s| {
        let recovered = s.unresponsive;
        s.unresponsive = false;
        s.last_guard_reply = Some(now);
        recovered
    });
    if recovered {
        info!("Node {}: responding again", device.id());
    }

    if reply.is_boot_up() {
        nmt::on_boot_up(device);
        return Ok(());
    }

    let Some(reported) = reply.nmt_state() else {
        debug!("Node {}: guard reply with unknown state {}", device.id(), reply.state);
        return Ok(());
    };

    let (recorded, repeated) = device.update(|s| {
        let recorded = s.nmt_state;
        let repeated = s.last_toggle == Some(reply.toggle);
        s.last_toggle = Some(reply.toggle);
        s.nmt_state = reported;
        (recorded, repeated)
    });

    if repeated {
        diagnostics.record(Counter::ToggleRepeats);
        debug!("Node {}: toggle bit repeated ({})", device.id(), reply.toggle as u8);
    }
    if recorded != reported && recorded != NmtState::Unknown {
        debug!("Node {}: recorded {:?}, node reports {:?}", device.id(), recorded, reported);
    }
    Ok(())
}

/// Mark every device silent for longer than the tolerance as
/// unresponsive. Devices that never replied are measured from `since`.
///
/// Returns the nodes that became unresponsive in this check; a warning is
/// logged once per episode.
pub fn check_liveness(
    registry: &DeviceRegistry,
    policy: &LivenessPolicy,
    since: Instant,
    now: Instant,
    diagnostics: &Diagnostics,
) -> Vec<NodeId> {
    let mut expired = Vec::new();
    for device in registry.devices() {
        let newly = device.update(|s| {
            let reference = s.last_guard_reply.unwrap_or(since);
            let silence = now.saturating_duration_since(reference);
            if !policy.is_expired(silence) || s.unresponsive {
                return None;
            }
            s.unresponsive = true;
            s.nmt_state = NmtState::Unknown;
            Some(silence)
        });
        if let Some(silence) = newly {
            diagnostics.record(Counter::LivenessExpirations);
            warn!(
                "Node {} ({}) unresponsive: silent for {}ms (tolerance {}ms)",
                device.id(),
                device.name(),
                silence.as_millis(),
                policy.tolerance().as_millis()
            );
            expired.push(device.id());
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_boot_up, encode_guard_reply};
    use evo_common::config::ConfigLoader;

    fn three_nodes() -> NetworkConfig {
        NetworkConfig::parse(
            r#"
[shared]
service_name = "t"

[[nodes]]
id = 1
name = "a"

[[nodes]]
id = 2
name = "b"

[[nodes]]
id = 3
name = "c"
"#,
        )
        .unwrap()
    }

    #[test]
    fn tolerance_for_three_nodes() {
        let policy = LivenessPolicy::from_config(&three_nodes());
        assert_eq!(policy.guard_time(), Duration::from_millis(500));
        assert_eq!(policy.life_time_factor(), 6);
        assert_eq!(policy.tolerance(), Duration::from_millis(3000));
        assert!(policy.is_expired(Duration::from_millis(3001)));
        assert!(!policy.is_expired(Duration::from_millis(3000)));
        assert!(!policy.is_expired(Duration::from_millis(2999)));
    }

    #[test]
    fn reply_records_state_and_toggle() {
        let dev = Device::new(1, "a", "", "can0");
        let diag = Diagnostics::new();
        let now = Instant::now();

        handle_reply(&dev, &encode_guard_reply(1, false, NmtState::Operational), now, &diag).unwrap();
        let state = dev.snapshot();
        assert_eq!(state.nmt_state, NmtState::Operational);
        assert_eq!(state.last_toggle, Some(false));
        assert_eq!(state.last_guard_reply, Some(now));

        handle_reply(&dev, &encode_guard_reply(1, true, NmtState::Operational), now, &diag).unwrap();
        assert_eq!(diag.snapshot().toggle_repeats, 0);
        handle_reply(&dev, &encode_guard_reply(1, true, NmtState::Operational), now, &diag).unwrap();
        assert_eq!(diag.snapshot().toggle_repeats, 1);
        assert_eq!(diag.snapshot().guard_replies, 3);
    }

    #[test]
    fn boot_up_moves_to_pre_operational() {
        let dev = Device::new(1, "a", "", "can0");
        handle_reply(&dev, &encode_boot_up(1), Instant::now(), &Diagnostics::new()).unwrap();
        assert_eq!(dev.nmt_state(), NmtState::PreOperational);
    }

    #[test]
    fn remote_frame_is_malformed_reply() {
        let dev = Device::new(1, "a", "", "can0");
        let result = handle_reply(&dev, &encode_guard_request(1), Instant::now(), &Diagnostics::new());
        assert!(result.is_err());
        assert_eq!(dev.snapshot().last_guard_reply, None);
    }

    #[test]
    fn silence_beyond_tolerance_marks_unresponsive_once() {
        let registry = DeviceRegistry::from_config(&three_nodes()).unwrap();
        let policy = LivenessPolicy::from_config(&three_nodes());
        let diag = Diagnostics::new();
        let start = Instant::now();

        // Node 2 answered 2999 ms before the check, the others never did
        registry
            .device(2)
            .unwrap()
            .update(|s| s.last_guard_reply = Some(start + Duration::from_millis(2)));
        let now = start + Duration::from_millis(3001);

        let expired = check_liveness(&registry, &policy, start, now, &diag);
        assert_eq!(expired, vec![1, 3]);
        assert_eq!(registry.device(1).unwrap().nmt_state(), NmtState::Unknown);
        assert_ne!(registry.device(2).unwrap().nmt_state(), NmtState::Unknown);

        let again = check_liveness(&registry, &policy, start, now + Duration::from_millis(500), &diag);
        assert!(again.is_empty());
        assert_eq!(diag.snapshot().liveness_expirations, 2);
    }

    #[test]
    fn reply_after_expiry_restores_reported_state() {
        let registry = DeviceRegistry::from_config(&three_nodes()).unwrap();
        let policy = LivenessPolicy::new(Duration::from_millis(10), 1);
        let diag = Diagnostics::new();
        let start = Instant::now();

        check_liveness(&registry, &policy, start, start + Duration::from_millis(11), &diag);
        let dev = registry.device(3).unwrap();
        assert!(dev.snapshot().unresponsive);

        handle_reply(dev, &encode_guard_reply(3, false, NmtState::PreOperational), Instant::now(), &diag).unwrap();
        let state = dev.snapshot();
        assert!(!state.unresponsive);
        assert_eq!(state.nmt_state, NmtState::PreOperational);
    }
}
