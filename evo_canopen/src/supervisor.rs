//! Liveness supervision loop.
//!
//! Each round probes every node in registration order, waits one guard
//! time, then checks which nodes have been silent beyond the tolerance.

use evo_common::canopen::state::NodeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::bus::Bus;
use crate::diagnostics::Diagnostics;
use crate::error::CanopenResult;
use crate::nodeguard::{self, LivenessPolicy};
use crate::registry::DeviceRegistry;

/// Longest uninterrupted sleep, bounds shutdown latency.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// One probe round. Returns the nodes that became unresponsive.
///
/// `since` is the reference instant for nodes that never replied.
pub fn round(
    bus: &Bus,
    registry: &DeviceRegistry,
    policy: &LivenessPolicy,
    since: Instant,
    diagnostics: &Diagnostics,
    running: &AtomicBool,
) -> CanopenResult<Vec<NodeId>> {
    for id in registry.node_ids() {
        nodeguard::send_probe(bus, id)?;
    }
    sleep_while_running(policy.guard_time(), running);
    Ok(nodeguard::check_liveness(registry, policy, since, Instant::now(), diagnostics))
}

/// Run probe rounds until `running` is cleared.
///
/// # Errors
/// A failed probe send ends the loop and is returned.
pub fn run(
    bus: &Bus,
    registry: &DeviceRegistry,
    policy: LivenessPolicy,
    diagnostics: &Diagnostics,
    running: &AtomicBool,
) -> CanopenResult<()> {
    info!(
        "Supervisor started: guard time {}ms, life-time factor {}, tolerance {}ms",
        policy.guard_time().as_millis(),
        policy.life_time_factor(),
        policy.tolerance().as_millis()
    );
    let since = Instant::now();
    while running.load(Ordering::SeqCst) {
        let expired = round(bus, registry, &policy, since, diagnostics, running)?;
        if !expired.is_empty() {
            warn!("Unresponsive nodes: {:?}", expired);
        }
    }
    info!("Supervisor stopped");
    Ok(())
}

fn sleep_while_running(total: Duration, running: &AtomicBool) {
    let end = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= end || !running.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep((end - now).min(SLEEP_SLICE));
    }
}
