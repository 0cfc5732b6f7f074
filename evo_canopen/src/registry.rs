//! Device registry: per-node state shared between the engine loops and
//! callers.
//!
//! Every mutable field of a device lives behind that device's own mutex.
//! The paired condition variable is notified on every update so callers can
//! block until a confirmation (status word, boot-up, upload) arrives.

use evo_common::canopen::config::NetworkConfig;
use evo_common::canopen::state::{MotorState, NmtState, NodeId, OperationMode};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::codec::{SdoData, SdoKey};
use crate::error::{CanopenError, CanopenResult};
use crate::motor::{StatusBits, decode_status_word};

/// Mutable state of one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    /// Recorded NMT state.
    pub nmt_state: NmtState,
    /// Recorded CiA 402 state (from the last decodable status word).
    pub motor_state: MotorState,
    /// Last reported mode of operation.
    pub operation_mode: OperationMode,
    /// Last received status word.
    pub status_word: u16,
    /// Number of status words received.
    pub status_updates: u64,
    /// Bring-up complete; setpoints are streamed.
    pub initialized: bool,
    /// Last control word the master wrote. Setpoints carry it so the
    /// stream holds the drive in the commanded state.
    pub control_word: u16,
    /// Status word bit 4.
    pub voltage_enabled: bool,
    /// Homing completed since start.
    pub referenced: bool,
    /// Setpoint position (rad).
    pub desired_position: f64,
    /// Feedback position (rad).
    pub actual_position: f64,
    /// Setpoint velocity (rad/s).
    pub desired_velocity: f64,
    /// Velocity derived from consecutive feedback frames (rad/s).
    pub actual_velocity: f64,
    /// Transport timestamp of the last feedback frame.
    pub feedback_stamp: Option<Duration>,
    /// Local time the last feedback frame was processed.
    pub feedback_at: Option<Instant>,
    /// Number of feedback frames received.
    pub feedback_count: u64,
    /// Local time of the last guarding reply.
    pub last_guard_reply: Option<Instant>,
    /// Toggle bit of the last guarding reply.
    pub last_toggle: Option<bool>,
    /// Liveness supervision expired and no reply since.
    pub unresponsive: bool,
    /// Error code of the last emergency message.
    pub last_emergency: Option<u16>,
    /// Captured upload values.
    pub uploads: BTreeMap<SdoKey, SdoData>,
}

impl DeviceState {
    /// Record a status word. Returns the previous motor state if the
    /// decoded state changed.
    pub(crate) fn record_status_word(&mut self, word: u16) -> Option<MotorState> {
        self.status_word = word;
        self.status_updates += 1;
        self.voltage_enabled = StatusBits::from_bits_truncate(word).contains(StatusBits::VOLTAGE_ENABLED);
        match decode_status_word(word) {
            Some(state) if state != self.motor_state => {
                let previous = self.motor_state;
                self.motor_state = state;
                Some(previous)
            }
            _ => None,
        }
    }
}

/// One node on the bus.
#[derive(Debug)]
pub struct Device {
    id: NodeId,
    name: String,
    group: String,
    bus: String,
    state: Mutex<DeviceState>,
    changed: Condvar,
}

impl Device {
    /// Create a device in its power-on state.
    pub fn new(id: NodeId, name: impl Into<String>, group: impl Into<String>, bus: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            group: group.into(),
            bus: bus.into(),
            state: Mutex::new(DeviceState::default()),
            changed: Condvar::new(),
        }
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group tag (empty if ungrouped).
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Bus identifier.
    pub fn bus(&self) -> &str {
        &self.bus
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> DeviceState {
        self.state.lock().clone()
    }

    /// Recorded NMT state.
    pub fn nmt_state(&self) -> NmtState {
        self.state.lock().nmt_state
    }

    /// Recorded motor state.
    pub fn motor_state(&self) -> MotorState {
        self.state.lock().motor_state
    }

    /// True once bring-up completed.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Feedback position (rad).
    pub fn actual_position(&self) -> f64 {
        self.state.lock().actual_position
    }

    /// Feedback velocity (rad/s).
    pub fn actual_velocity(&self) -> f64 {
        self.state.lock().actual_velocity
    }

    /// Setpoint position (rad).
    pub fn desired_position(&self) -> f64 {
        self.state.lock().desired_position
    }

    /// Setpoint velocity (rad/s).
    pub fn desired_velocity(&self) -> f64 {
        self.state.lock().desired_velocity
    }

    /// Set the setpoint velocity integrated by the scheduler.
    ///
    /// # Errors
    /// `NonFinite` for NaN or infinite input; nothing is written.
    pub fn set_desired_velocity(&self, velocity: f64) -> CanopenResult<()> {
        self.check_finite(velocity, "desired velocity")?;
        self.update(|s| s.desired_velocity = velocity);
        Ok(())
    }

    /// Set the setpoint position directly.
    ///
    /// # Errors
    /// `NonFinite` for NaN or infinite input; nothing is written.
    pub fn set_desired_position(&self, position: f64) -> CanopenResult<()> {
        self.check_finite(position, "desired position")?;
        self.update(|s| s.desired_position = position);
        Ok(())
    }

    fn check_finite(&self, value: f64, field: &'static str) -> CanopenResult<()> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(CanopenError::NonFinite {
                node: self.id,
                field,
            })
        }
    }

    /// Mutate the state and wake every waiter.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let result = f(&mut self.state.lock());
        self.changed.notify_all();
        result
    }

    /// Block until `pred` holds or `deadline` passes. Returns the final
    /// value of `pred`.
    pub fn wait_until(&self, deadline: Instant, mut pred: impl FnMut(&DeviceState) -> bool) -> bool {
        let mut guard = self.state.lock();
        loop {
            if pred(&guard) {
                return true;
            }
            if self.changed.wait_until(&mut guard, deadline).timed_out() {
                return pred(&guard);
            }
        }
    }

    /// Integrate the setpoint over one tick and hand it, with the
    /// commanded control word, to `send`. The new position is kept only
    /// if `send` succeeds. `Ok(false)` unless initialized.
    pub(crate) fn advance_setpoint<E>(
        &self,
        dt_secs: f64,
        send: impl FnOnce(f64, u16) -> Result<(), E>,
    ) -> Result<bool, E> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Ok(false);
        }
        let position = state.desired_position + state.desired_velocity * dt_secs;
        send(position, state.control_word)?;
        state.desired_position = position;
        Ok(true)
    }
}

/// Named, ordered set of devices moved together.
#[derive(Debug, Clone)]
pub struct DeviceGroup {
    name: String,
    devices: Vec<Arc<Device>>,
    names: Vec<String>,
}

impl DeviceGroup {
    /// Create a group. `names` must be index-aligned with `devices`.
    ///
    /// # Errors
    /// `GroupSizeMismatch` if the lengths differ.
    pub fn new(name: impl Into<String>, devices: Vec<Arc<Device>>, names: Vec<String>) -> CanopenResult<Self> {
        let name = name.into();
        if devices.len() != names.len() {
            return Err(CanopenError::GroupSizeMismatch {
                group: name,
                expected: devices.len(),
                actual: names.len(),
            });
        }
        Ok(Self {
            name,
            devices,
            names,
        })
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if the group has no members.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Member node ids in group order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.devices.iter().map(|d| d.id()).collect()
    }

    /// Member display names in group order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Members in group order.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Feedback positions (rad).
    pub fn actual_positions(&self) -> Vec<f64> {
        self.devices.iter().map(|d| d.actual_position()).collect()
    }

    /// Feedback velocities (rad/s).
    pub fn actual_velocities(&self) -> Vec<f64> {
        self.devices.iter().map(|d| d.actual_velocity()).collect()
    }

    /// Setpoint positions (rad).
    pub fn desired_positions(&self) -> Vec<f64> {
        self.devices.iter().map(|d| d.desired_position()).collect()
    }

    /// Setpoint velocities (rad/s).
    pub fn desired_velocities(&self) -> Vec<f64> {
        self.devices.iter().map(|d| d.desired_velocity()).collect()
    }

    /// Set every member's setpoint velocity.
    ///
    /// # Errors
    /// `GroupSizeMismatch` or `NonFinite`; nothing is written on error.
    pub fn set_desired_velocities(&self, velocities: &[f64]) -> CanopenResult<()> {
        self.check_values(velocities, "desired velocity")?;
        for (device, v) in self.devices.iter().zip(velocities) {
            device.set_desired_velocity(*v)?;
        }
        Ok(())
    }

    /// Set every member's setpoint position.
    ///
    /// # Errors
    /// `GroupSizeMismatch` or `NonFinite`; nothing is written on error.
    pub fn set_desired_positions(&self, positions: &[f64]) -> CanopenResult<()> {
        self.check_values(positions, "desired position")?;
        for (device, p) in self.devices.iter().zip(positions) {
            device.set_desired_position(*p)?;
        }
        Ok(())
    }

    fn check_values(&self, values: &[f64], field: &'static str) -> CanopenResult<()> {
        if values.len() != self.devices.len() {
            return Err(CanopenError::GroupSizeMismatch {
                group: self.name.clone(),
                expected: self.devices.len(),
                actual: values.len(),
            });
        }
        if let Some((device, _)) = self.devices.iter().zip(values).find(|(_, v)| !v.is_finite()) {
            return Err(CanopenError::NonFinite {
                node: device.id(),
                field,
            });
        }
        Ok(())
    }
}

/// All devices and groups of one network. Built once, never shrinks.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
    by_id: HashMap<NodeId, usize>,
    groups: Vec<DeviceGroup>,
}

impl DeviceRegistry {
    /// Build the registry from a validated configuration.
    pub fn from_config(config: &NetworkConfig) -> CanopenResult<Self> {
        let mut devices = Vec::with_capacity(config.nodes.len());
        let mut by_id = HashMap::with_capacity(config.nodes.len());

        for node in &config.nodes {
            let device = Device::new(node.id, node.name.clone(), node.group.clone(), config.node_bus(node));
            by_id.insert(node.id, devices.len());
            devices.push(Arc::new(device));
        }

        let mut groups = Vec::new();
        for (name, members) in config.groups() {
            let mut group_devices = Vec::with_capacity(members.len());
            let mut names = Vec::with_capacity(members.len());
            for member in members {
                let idx = by_id
                    .get(&member.id)
                    .copied()
                    .ok_or(CanopenError::UnknownNode(member.id))?;
                group_devices.push(Arc::clone(&devices[idx]));
                names.push(member.name.clone());
            }
            info!("Group '{}': nodes {:?}", name, members_ids(&group_devices));
            groups.push(DeviceGroup::new(name, group_devices, names)?);
        }

        Ok(Self {
            devices,
            by_id,
            groups,
        })
    }

    /// Device by node id.
    pub fn device(&self, id: NodeId) -> CanopenResult<&Arc<Device>> {
        self.by_id
            .get(&id)
            .map(|&idx| &self.devices[idx])
            .ok_or(CanopenError::UnknownNode(id))
    }

    /// True if the node id is registered.
    pub fn contains(&self, id: NodeId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Devices in registration order.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Node ids in registration order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.devices.iter().map(|d| d.id()).collect()
    }

    /// Group by name.
    pub fn group(&self, name: &str) -> CanopenResult<&DeviceGroup> {
        self.groups
            .iter()
            .find(|g| g.name() == name)
            .ok_or_else(|| CanopenError::UnknownGroup(name.to_string()))
    }

    /// Groups in order of first appearance.
    pub fn groups(&self) -> &[DeviceGroup] {
        &self.groups
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no device is registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn members_ids(devices: &[Arc<Device>]) -> Vec<NodeId> {
    devices.iter().map(|d| d.id()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo_common::config::ConfigLoader;

    fn registry() -> DeviceRegistry {
        let config = NetworkConfig::parse(
            r#"
[shared]
service_name = "test"

[[nodes]]
id = 1
name = "shoulder"
group = "arm"

[[nodes]]
id = 2
name = "elbow"
group = "arm"

[[nodes]]
id = 7
name = "gripper"
"#,
        )
        .unwrap();
        DeviceRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn builds_devices_and_groups() {
        let reg = registry();
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.node_ids(), vec![1, 2, 7]);
        assert_eq!(reg.device(7).unwrap().name(), "gripper");
        assert_eq!(reg.device(7).unwrap().bus(), "can0");
        assert!(matches!(reg.device(9), Err(CanopenError::UnknownNode(9))));

        let arm = reg.group("arm").unwrap();
        assert_eq!(arm.node_ids(), vec![1, 2]);
        assert_eq!(arm.names(), &["shoulder".to_string(), "elbow".to_string()]);
        assert!(matches!(reg.group("leg"), Err(CanopenError::UnknownGroup(_))));
    }

    #[test]
    fn device_starts_in_power_on_state() {
        let reg = registry();
        let state = reg.device(1).unwrap().snapshot();
        assert_eq!(state.nmt_state, NmtState::Initialisation);
        assert_eq!(state.motor_state, MotorState::NotReadyToSwitchOn);
        assert!(!state.initialized);
        assert_eq!(state.desired_position, 0.0);
    }

    #[test]
    fn non_finite_setpoints_are_rejected() {
        let reg = registry();
        let dev = reg.device(1).unwrap();
        dev.set_desired_velocity(0.5).unwrap();
        assert!(matches!(
            dev.set_desired_velocity(f64::NAN),
            Err(CanopenError::NonFinite { node: 1, .. })
        ));
        assert!(dev.set_desired_position(f64::INFINITY).is_err());
        assert_eq!(dev.desired_velocity(), 0.5);
    }

    #[test]
    fn group_setters_check_length_before_writing() {
        let reg = registry();
        let arm = reg.group("arm").unwrap();

        assert!(matches!(
            arm.set_desired_velocities(&[1.0]),
            Err(CanopenError::GroupSizeMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
        assert!(arm.set_desired_velocities(&[1.0, f64::NAN]).is_err());
        assert_eq!(arm.desired_velocities(), vec![0.0, 0.0]);

        arm.set_desired_velocities(&[1.0, -2.0]).unwrap();
        assert_eq!(arm.desired_velocities(), vec![1.0, -2.0]);
        arm.set_desired_positions(&[0.1, 0.2]).unwrap();
        assert_eq!(arm.desired_positions(), vec![0.1, 0.2]);
    }

    #[test]
    fn group_construction_checks_alignment() {
        let dev = Arc::new(Device::new(1, "a", "g", "can0"));
        let result = DeviceGroup::new("g", vec![dev], vec![]);
        assert!(matches!(result, Err(CanopenError::GroupSizeMismatch { .. })));
    }

    #[test]
    fn setpoint_advances_only_when_initialized() {
        let dev = Device::new(1, "a", "", "can0");
        dev.set_desired_velocity(2.0).unwrap();
        let sent = dev.advance_setpoint(0.01, |_, _| Ok::<_, ()>(()));
        assert_eq!(sent, Ok(false));

        dev.update(|s| {
            s.initialized = true;
            s.control_word = 0x0F;
        });
        let mut streamed = None;
        let sent = dev.advance_setpoint(0.01, |p, cw| {
            streamed = Some((p, cw));
            Ok::<_, ()>(())
        });
        assert_eq!(sent, Ok(true));
        let (p, cw) = streamed.unwrap();
        assert!((p - 0.02).abs() < 1e-12);
        assert_eq!(cw, 0x0F);
        assert!((dev.desired_position() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn failed_send_keeps_setpoint() {
        let dev = Device::new(1, "a", "", "can0");
        dev.update(|s| s.initialized = true);
        dev.set_desired_velocity(1.0).unwrap();

        assert_eq!(dev.advance_setpoint(0.01, |_, _| Err("bus-off")), Err("bus-off"));
        assert_eq!(dev.desired_position(), 0.0);
    }

    #[test]
    fn status_word_updates_motor_state() {
        let dev = Device::new(1, "a", "", "can0");
        let previous = dev.update(|s| s.record_status_word(0x0237));
        assert_eq!(previous, Some(MotorState::NotReadyToSwitchOn));
        let state = dev.snapshot();
        assert_eq!(state.motor_state, MotorState::OperationEnabled);
        assert!(state.voltage_enabled);
        assert_eq!(state.status_updates, 1);

        // Same state again: no change reported
        assert_eq!(dev.update(|s| s.record_status_word(0x0237)), None);
    }

    #[test]
    fn wait_until_wakes_on_update() {
        let dev = Arc::new(Device::new(1, "a", "", "can0"));
        let writer = Arc::clone(&dev);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.update(|s| s.nmt_state = NmtState::Operational);
        });
        let ok = dev.wait_until(Instant::now() + Duration::from_secs(2), |s| {
            s.nmt_state == NmtState::Operational
        });
        handle.join().unwrap();
        assert!(ok);

        let timed_out = dev.wait_until(Instant::now() + Duration::from_millis(10), |s| s.referenced);
        assert!(!timed_out);
    }
}
