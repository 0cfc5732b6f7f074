//! CanopenCore: engine orchestration.
//!
//! Owns the device registry, the handler tables and the transport, and
//! manages the listener, scheduler and supervisor threads. Caller threads
//! use it to bring nodes up, drive state machines and set setpoints while
//! the loops run.

use evo_common::canopen::config::NetworkConfig;
use evo_common::canopen::state::{MotorState, NmtState, NodeId, OperationMode};
use evo_common::config::ConfigError;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::error::{CanopenError, CanopenResult};
use crate::listener::{self, Dispatcher};
use crate::motor::{self, CW_OPERATION_MODE_SPECIFIC, MotorTiming, StatusBits};
use crate::nmt::{self, NmtCommand};
use crate::nodeguard::LivenessPolicy;
use crate::registry::{Device, DeviceGroup, DeviceRegistry, DeviceState};
use crate::scheduler;
use crate::sdo::{self, SdoData, SdoHandler, SdoHandlerTable, SdoKey, SdoValue, od};
use crate::supervisor;
use crate::transport::{CanTransport, TransportRegistry};

/// Interpolation time index for milliseconds (10^-3 s).
const IP_TIME_INDEX_MS: i8 = -3;

/// A configured value that does not fit its object dictionary entry.
fn out_of_range(what: &str, value: u128) -> CanopenError {
    CanopenError::Config(ConfigError::ValidationError(format!("{what} {value} ms does not fit the drive object")))
}

struct LoopHandle {
    name: &'static str,
    handle: JoinHandle<CanopenResult<()>>,
}

/// CANopen master engine.
pub struct CanopenCore {
    config: NetworkConfig,
    registry: Arc<DeviceRegistry>,
    sdo_handlers: SdoHandlerTable,
    diagnostics: Arc<Diagnostics>,
    bus: Option<Arc<Bus>>,
    running: Arc<AtomicBool>,
    loops: Vec<LoopHandle>,
    timing: MotorTiming,
}

impl CanopenCore {
    /// Engine with the mandatory SDO handlers.
    ///
    /// # Errors
    /// Returns `Config` if validation fails.
    pub fn new(config: NetworkConfig) -> CanopenResult<Self> {
        Self::new_with_handlers(config, [])
    }

    /// Engine with extra SDO handlers. The table is fixed from here on.
    pub fn new_with_handlers(
        config: NetworkConfig,
        extra: impl IntoIterator<Item = (SdoKey, SdoHandler)>,
    ) -> CanopenResult<Self> {
        config.validate()?;
        let registry = Arc::new(DeviceRegistry::from_config(&config)?);

        let mut sdo_handlers = SdoHandlerTable::new();
        sdo_handlers.extend(extra);

        let timing = MotorTiming {
            transition_timeout: config.motor.transition_timeout(),
            poll_interval: config.motor.status_poll_interval(),
        };

        info!(
            "{} engine created: {} nodes, {} groups, sync interval {}ms",
            config.shared.service_name,
            registry.len(),
            registry.groups().len(),
            config.bus.sync_interval_ms
        );

        Ok(Self {
            config,
            registry,
            sdo_handlers,
            diagnostics: Arc::new(Diagnostics::new()),
            bus: None,
            running: Arc::new(AtomicBool::new(false)),
            loops: Vec::new(),
            timing,
        })
    }

    /// Load and validate a network configuration file.
    pub fn load_config(path: &Path) -> CanopenResult<NetworkConfig> {
        info!("Loading configuration from {:?}", path);
        let config = NetworkConfig::load_validated(path)?;
        info!(
            "Loaded config: driver={}, device={}, {} nodes",
            config.bus.driver,
            config.bus.device,
            config.nodes.len()
        );
        Ok(config)
    }

    /// Open `driver` from `transports` and attach it.
    ///
    /// # Errors
    /// `Transport(Open)` for an unknown driver or a failed open.
    pub fn open(&mut self, transports: &TransportRegistry, driver: &str) -> CanopenResult<()> {
        info!("Opening transport '{}' on {}", driver, self.config.bus.device);
        let transport = transports.open(driver, &self.config)?;
        self.attach(transport);
        Ok(())
    }

    /// Attach an already opened transport.
    pub fn attach(&mut self, transport: Arc<dyn CanTransport>) {
        debug!("Transport '{}' attached", transport.name());
        self.bus = Some(Arc::new(Bus::new(transport, Arc::clone(&self.diagnostics))));
    }

    /// Spawn the listener, scheduler and supervisor threads.
    ///
    /// # Errors
    /// `AlreadyRunning` on a second call, `NotRunning` if no transport is
    /// attached, `LoopPanicked` if a thread cannot be spawned.
    pub fn start(&mut self) -> CanopenResult<()> {
        if !self.loops.is_empty() {
            return Err(CanopenError::AlreadyRunning);
        }
        let bus = self.bus.clone().ok_or(CanopenError::NotRunning)?;
        sdo::log_table(&self.sdo_handlers);
        self.running.store(true, Ordering::SeqCst);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.registry),
            self.sdo_handlers.clone(),
            Arc::clone(&self.diagnostics),
        );
        let listener = {
            let (bus, running) = (Arc::clone(&bus), Arc::clone(&self.running));
            move || listener::run(&bus, &dispatcher, &running)
        };
        self.spawn("canopen-listener", listener)?;

        let interval = self.config.bus.sync_interval();
        let cpu = self.config.bus.scheduler_cpu;
        let scheduler = {
            let (bus, registry) = (Arc::clone(&bus), Arc::clone(&self.registry));
            let (diagnostics, running) = (Arc::clone(&self.diagnostics), Arc::clone(&self.running));
            move || scheduler::run(&bus, &registry, interval, cpu, &diagnostics, &running).map(|_| ())
        };
        self.spawn("canopen-scheduler", scheduler)?;

        let policy = LivenessPolicy::from_config(&self.config);
        let supervisor = {
            let (bus, registry) = (Arc::clone(&bus), Arc::clone(&self.registry));
            let (diagnostics, running) = (Arc::clone(&self.diagnostics), Arc::clone(&self.running));
            move || supervisor::run(&bus, &registry, policy, &diagnostics, &running)
        };
        self.spawn("canopen-supervisor", supervisor)?;

        info!("{} engine started on '{}'", self.config.shared.service_name, bus.name());
        Ok(())
    }

    fn spawn<F>(&mut self, name: &'static str, body: F) -> CanopenResult<()>
    where
        F: FnOnce() -> CanopenResult<()> + Send + 'static,
    {
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = body();
                // A failed loop stops the others and wakes the owner
                if let Err(e) = &result {
                    if running.swap(false, Ordering::SeqCst) {
                        error!("{} stopped: {}", name, e);
                    }
                }
                result
            })
            .map_err(|e| {
                error!("Failed to spawn {}: {}", name, e);
                self.running.store(false, Ordering::SeqCst);
                CanopenError::LoopPanicked(name)
            })?;
        self.loops.push(LoopHandle { name, handle });
        Ok(())
    }

    /// Stop the loops and join them.
    ///
    /// # Errors
    /// The first loop error, or `LoopPanicked` if a loop thread panicked.
    pub fn shutdown(&mut self) -> CanopenResult<()> {
        info!("Shutdown requested");
        self.running.store(false, Ordering::SeqCst);

        let mut first_error = None;
        for LoopHandle { name, handle } in self.loops.drain(..) {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(CanopenError::LoopPanicked(name)),
            };
            if let Err(e) = outcome {
                warn!("{} ended with error: {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        let snapshot = self.diagnostics.snapshot();
        info!(
            "{} engine stopped: {} frames sent, {} received, {} SYNC ticks",
            self.config.shared.service_name, snapshot.frames_sent, snapshot.frames_received, snapshot.sync_ticks
        );
        first_error.map_or(Ok(()), Err)
    }

    // ─── Bring-up & state machines ──────────────────────────────────

    /// Bring every node into cyclic interpolated-position operation.
    ///
    /// Per node, in registration order: communication reset, start,
    /// guarding and interpolation parameters, IP mode, OperationEnabled,
    /// then desired position := first fresh actual position.
    ///
    /// # Errors
    /// `NotRunning` before `start()`; otherwise the first failing node's
    /// error. Nodes handled before the failure stay initialized.
    pub fn bring_up(&self) -> CanopenResult<()> {
        let bus = self.running_bus()?;
        info!("Bringing up {} nodes", self.registry.len());

        for device in self.registry.devices() {
            nmt::send_command(bus, device, NmtCommand::ResetCommunication)?;
        }
        thread::sleep(self.config.bus.boot_wait());

        for device in self.registry.devices() {
            self.bring_up_node(bus, device)?;
        }
        info!("All {} nodes operational", self.registry.len());
        Ok(())
    }

    fn bring_up_node(&self, bus: &Bus, device: &Device) -> CanopenResult<()> {
        let id = device.id();
        device.update(|s| s.initialized = false);
        nmt::send_command(bus, device, NmtCommand::Start)?;

        let policy = LivenessPolicy::from_config(&self.config);
        let guard_ms = u16::try_from(policy.guard_time().as_millis())
            .map_err(|_| out_of_range("guard time", policy.guard_time().as_millis()))?;
        let tick_ms = u8::try_from(self.config.bus.sync_interval_ms)
            .map_err(|_| out_of_range("interpolation period", self.config.bus.sync_interval_ms.into()))?;
        sdo::send_write(bus, id, od::GUARD_TIME, SdoValue::U16(guard_ms))?;
        sdo::send_write(bus, id, od::LIFE_TIME_FACTOR, SdoValue::U8(policy.life_time_factor()))?;
        sdo::send_write(bus, id, od::SYNC_TIMEOUT_FACTOR, SdoValue::U8(0))?;
        sdo::send_write(bus, id, od::IP_TIME_UNITS, SdoValue::U8(tick_ms))?;
        sdo::send_write(bus, id, od::IP_TIME_INDEX, SdoValue::I8(IP_TIME_INDEX_MS))?;
        self.set_operation_mode(bus, device, OperationMode::InterpolatedPosition)?;

        self.refresh_motor_state(bus, device)?;
        motor::set_motor_state(bus, device, MotorState::OperationEnabled, &self.timing)?;
        self.hold_position(device)?;
        device.update(|s| s.initialized = true);
        info!("Node {} ({}) initialized at {:.4} rad", id, device.name(), device.actual_position());
        Ok(())
    }

    /// Run the drive's homing procedure, then return to IP mode.
    ///
    /// Setpoint streaming for the node is paused while homing.
    ///
    /// # Errors
    /// `ProtocolTimeout` if homing is not attained within the homing
    /// timeout, `HomingFailed` if the drive reports a homing error.
    pub fn home(&self, node: NodeId) -> CanopenResult<()> {
        let bus = self.running_bus()?;
        let device = self.registry.device(node)?;
        info!("Node {}: homing", node);

        let was_initialized = device.is_initialized();
        device.update(|s| {
            s.initialized = false;
            s.referenced = false;
        });

        self.set_operation_mode(bus, device, OperationMode::Homing)?;
        motor::set_motor_state(bus, device, MotorState::OperationEnabled, &self.timing)?;

        let enable = motor::ControlCommand::EnableOperation.control_word();
        motor::write_control_word(bus, device, enable)?;
        motor::write_control_word(bus, device, enable | CW_OPERATION_MODE_SPECIFIC)?;
        let started = device.snapshot().status_updates;

        motor::await_status(
            bus,
            device,
            self.config.motor.homing_timeout(),
            self.timing.poll_interval,
            "homing",
            |s| {
                let bits = StatusBits::from_bits_truncate(s.status_word);
                s.status_updates > started
                    && bits.intersects(StatusBits::OPERATION_MODE_SPECIFIC | StatusBits::HOMING_ERROR)
            },
        )?;
        if StatusBits::from_bits_truncate(device.snapshot().status_word).contains(StatusBits::HOMING_ERROR) {
            warn!("Node {}: homing error", node);
            return Err(CanopenError::HomingFailed(node));
        }

        motor::write_control_word(bus, device, enable)?;
        self.set_operation_mode(bus, device, OperationMode::InterpolatedPosition)?;
        self.hold_position(device)?;
        device.update(|s| {
            s.referenced = true;
            s.initialized = was_initialized;
        });
        info!("Node {}: reference established", node);
        Ok(())
    }

    /// Drive a node's CiA 402 state machine to `target`.
    ///
    /// Setpoint streaming for the node is paused during the handshake so
    /// the RPDO control word cannot race the SDO control words. Once
    /// resumed, setpoints carry the last control word written, which
    /// holds the drive at `target`.
    pub fn set_motor_state(&self, node: NodeId, target: MotorState) -> CanopenResult<()> {
        let bus = self.running_bus()?;
        let device = self.registry.device(node)?;
        let was_initialized = device.update(|s| std::mem::replace(&mut s.initialized, false));
        let result = motor::set_motor_state(bus, device, target, &self.timing);
        device.update(|s| s.initialized = was_initialized);
        result
    }

    /// Send the NMT command for `target` to a node.
    pub fn set_nmt_state(&self, node: NodeId, target: NmtState) -> CanopenResult<()> {
        let bus = self.attached_bus()?;
        nmt::set_nmt_state(bus, self.registry.device(node)?, target)
    }

    fn set_operation_mode(&self, bus: &Bus, device: &Device, mode: OperationMode) -> CanopenResult<()> {
        sdo::send_write(bus, device.id(), od::MODES_OF_OPERATION, SdoValue::I8(mode as i8))?;
        sdo::send_read(bus, device.id(), od::MODES_OF_OPERATION_DISPLAY)?;
        self.wait_for(device, self.timing.transition_timeout, &format!("{mode:?} mode"), |s| {
            s.operation_mode == mode
        })
    }

    fn refresh_motor_state(&self, bus: &Bus, device: &Device) -> CanopenResult<()> {
        let before = device.snapshot().status_updates;
        sdo::send_read(bus, device.id(), od::STATUSWORD)?;
        self.wait_for(device, self.timing.transition_timeout, "status word", |s| {
            s.status_updates > before
        })
    }

    /// Wait for a feedback frame newer than now, then hold its position.
    fn hold_position(&self, device: &Device) -> CanopenResult<()> {
        let before = device.snapshot().feedback_count;
        self.wait_for(device, self.timing.transition_timeout, "position feedback", |s| {
            s.feedback_count > before
        })?;
        device.update(|s| {
            s.desired_position = s.actual_position;
            s.desired_velocity = 0.0;
        });
        Ok(())
    }

    fn wait_for(
        &self,
        device: &Device,
        timeout: Duration,
        operation: &str,
        pred: impl FnMut(&DeviceState) -> bool,
    ) -> CanopenResult<()> {
        if device.wait_until(Instant::now() + timeout, pred) {
            return Ok(());
        }
        warn!("Node {}: {} not received within {}ms", device.id(), operation, timeout.as_millis());
        Err(CanopenError::ProtocolTimeout {
            node: device.id(),
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    // ─── SDO ────────────────────────────────────────────────────────

    /// Request an object value. The response is routed to its handler.
    pub fn send_read(&self, node: NodeId, key: SdoKey) -> CanopenResult<()> {
        let bus = self.attached_bus()?;
        self.registry.device(node)?;
        sdo::send_read(bus, node, key)
    }

    /// Write an object value; the variant fixes the width.
    pub fn send_write(&self, node: NodeId, key: SdoKey, value: SdoValue) -> CanopenResult<()> {
        let bus = self.attached_bus()?;
        self.registry.device(node)?;
        sdo::send_write(bus, node, key, value)
    }

    /// Wait until a captured upload for `key` is present and return it.
    pub fn wait_upload(&self, node: NodeId, key: SdoKey, timeout: Duration) -> CanopenResult<SdoData> {
        let device = self.registry.device(node)?;
        let mut value = None;
        let found = device.wait_until(Instant::now() + timeout, |s| {
            value = s.uploads.get(&key).copied();
            value.is_some()
        });
        match value.filter(|_| found) {
            Some(data) => Ok(data),
            None => Err(CanopenError::ProtocolTimeout {
                node,
                operation: format!("upload of {key}"),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Read an object with a `Capture` handler: drop any stale capture,
    /// request the value and wait for the response.
    pub fn read(&self, node: NodeId, key: SdoKey, timeout: Duration) -> CanopenResult<SdoData> {
        let device = self.registry.device(node)?;
        device.update(|s| {
            s.uploads.remove(&key);
        });
        self.send_read(node, key)?;
        self.wait_upload(node, key, timeout)
    }

    // ─── Setpoints ──────────────────────────────────────────────────

    /// Set a node's desired velocity (rad/s).
    pub fn set_desired_velocity(&self, node: NodeId, velocity: f64) -> CanopenResult<()> {
        self.registry.device(node)?.set_desired_velocity(velocity)
    }

    /// Set a node's desired position (rad).
    pub fn set_desired_position(&self, node: NodeId, position: f64) -> CanopenResult<()> {
        self.registry.device(node)?.set_desired_position(position)
    }

    // ─── Accessors ──────────────────────────────────────────────────

    /// Device by node id.
    pub fn device(&self, node: NodeId) -> CanopenResult<&Arc<Device>> {
        self.registry.device(node)
    }

    /// Group by name.
    pub fn group(&self, name: &str) -> CanopenResult<&DeviceGroup> {
        self.registry.group(name)
    }

    /// The device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The loaded configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Loop counters.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Running flag for signal handlers.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// True between `start()` and `shutdown()`.
    pub fn is_running(&self) -> bool {
        !self.loops.is_empty() && self.running.load(Ordering::SeqCst)
    }

    fn attached_bus(&self) -> CanopenResult<&Bus> {
        self.bus.as_deref().ok_or(CanopenError::NotRunning)
    }

    fn running_bus(&self) -> CanopenResult<&Bus> {
        if !self.is_running() {
            return Err(CanopenError::NotRunning);
        }
        self.attached_bus()
    }
}

impl Drop for CanopenCore {
    fn drop(&mut self) {
        if !self.loops.is_empty() {
            let _ = self.shutdown();
        }
    }
}
