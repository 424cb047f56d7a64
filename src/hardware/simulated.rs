//! Simulated bus for development and tests.
//!
//! Registers that were written read back what was written; all other
//! registers return a slowly varying synthetic waveform. Input pins follow a
//! square wave unless a level was forced with [`SimulatedBus::set_input`].
//!
//! The handle is cheap to clone: keep one clone for fault injection while the
//! other is owned by the [`BusTransport`](super::BusTransport).
//!
//! The operation log keeps only the most recent
//! [`DEFAULT_LOG_CAPACITY`] entries so a long simulated run stays bounded.

use super::bus::{BusDriver, PinMode, Pull};
use crate::error::{BusError, BusErrorKind, BusResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Operations kept in the log unless changed with
/// [`SimulatedBus::set_log_capacity`].
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// Kind of one recorded bus operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOpKind {
    /// Register read.
    Read,
    /// Register write.
    Write,
    /// Pin setup.
    SetupPin,
    /// Pin read.
    ReadPin,
    /// Pin write.
    WritePin,
}

/// One entry of the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusOp {
    /// What was done.
    pub kind: BusOpKind,
    /// Device address (register operations only).
    pub address: Option<u8>,
    /// Register or pin number.
    pub target: u8,
}

#[derive(Debug, Clone, Copy)]
struct PinState {
    mode: PinMode,
    level: bool,
}

struct SimState {
    registers: HashMap<(u8, u8), u8>,
    absent: HashSet<u8>,
    fail_next: u32,
    pins: HashMap<u8, PinState>,
    forced_inputs: HashMap<u8, bool>,
    log: VecDeque<BusOp>,
    log_capacity: usize,
    in_flight: u32,
    max_in_flight: u32,
    op_delay: Duration,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            registers: HashMap::new(),
            absent: HashSet::new(),
            fail_next: 0,
            pins: HashMap::new(),
            forced_inputs: HashMap::new(),
            log: VecDeque::new(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            in_flight: 0,
            max_in_flight: 0,
            op_delay: Duration::ZERO,
        }
    }
}

/// Software bus double.
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
    started: Instant,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// Creates an empty simulated bus; every address answers.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            started: Instant::now(),
        }
    }

    // =========================================================================
    // Fault injection and inspection
    // =========================================================================

    /// Makes `address` stop (or resume) acknowledging.
    pub fn set_absent(&self, address: u8, absent: bool) {
        let mut state = self.state.lock();
        if absent {
            state.absent.insert(address);
        } else {
            state.absent.remove(&address);
        }
    }

    /// Fails the next `count` register operations with an I/O error.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Presets register contents.
    pub fn set_registers(&self, address: u8, register: u8, values: &[u8]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state
                .registers
                .insert((address, register.wrapping_add(offset as u8)), *value);
        }
    }

    /// Last value written to (or preset in) a register.
    pub fn register(&self, address: u8, register: u8) -> Option<u8> {
        self.state.lock().registers.get(&(address, register)).copied()
    }

    /// Forces the level reported by an input pin.
    pub fn set_input(&self, pin: u8, level: bool) {
        self.state.lock().forced_inputs.insert(pin, level);
    }

    /// Last level driven on an output pin.
    pub fn output_level(&self, pin: u8) -> Option<bool> {
        self.state
            .lock()
            .pins
            .get(&pin)
            .filter(|p| p.mode == PinMode::Output)
            .map(|p| p.level)
    }

    /// Adds a per-operation latency.
    pub fn set_op_delay(&self, delay: Duration) {
        self.state.lock().op_delay = delay;
    }

    /// Most recent operations, oldest first.
    pub fn operations(&self) -> Vec<BusOp> {
        self.state.lock().log.iter().copied().collect()
    }

    /// Limits how many operations the log keeps; `0` disables logging.
    pub fn set_log_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.log_capacity = capacity;
        let excess = state.log.len().saturating_sub(capacity);
        state.log.drain(..excess);
    }

    /// Clears the operation log.
    pub fn clear_operations(&self) {
        self.state.lock().log.clear();
    }

    /// Largest number of operations that were ever in progress at once.
    pub fn max_concurrency(&self) -> u32 {
        self.state.lock().max_in_flight
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Synthetic byte for an unwritten register.
    fn waveform(&self, offset: usize) -> u8 {
        let t = self.started.elapsed().as_secs_f64() + offset as f64;
        let value = (0.2 + t.sin() * (0.1 * t).tan() / 13.0) * 255.0;
        value.clamp(0.0, 255.0) as u8
    }

    /// Registers the start of an operation and applies injected faults.
    fn begin(&self, op: BusOp) -> BusResult<Duration> {
        let mut state = self.state.lock();
        if state.log_capacity > 0 {
            if state.log.len() == state.log_capacity {
                state.log.pop_front();
            }
            state.log.push_back(op);
        }
        if let Some(address) = op.address {
            if state.absent.contains(&address) {
                return Err(BusError::at(
                    BusErrorKind::NoAcknowledge,
                    address,
                    "device did not acknowledge",
                ));
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(BusError::at(BusErrorKind::Io, address, "injected failure"));
            }
        }
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        Ok(state.op_delay)
    }

    fn operate<T>(
        &self,
        op: BusOp,
        body: impl FnOnce(&mut SimState) -> BusResult<T>,
    ) -> BusResult<T> {
        let delay = self.begin(op)?;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            body(&mut *state)
        };
        trace!(?op, ok = result.is_ok(), "Simulated bus operation");
        result
    }
}

impl BusDriver for SimulatedBus {
    fn name(&self) -> &str {
        "simulated"
    }

    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> BusResult<()> {
        let op = BusOp {
            kind: BusOpKind::Read,
            address: Some(address),
            target: register,
        };
        let synthetic: Vec<u8> = (0..buf.len()).map(|i| self.waveform(i)).collect();
        self.operate(op, |state| {
            for (offset, slot) in buf.iter_mut().enumerate() {
                let key = (address, register.wrapping_add(offset as u8));
                *slot = state.registers.get(&key).copied().unwrap_or(synthetic[offset]);
            }
            Ok(())
        })
    }

    fn write_block(&mut self, address: u8, register: u8, payload: &[u8]) -> BusResult<()> {
        if payload.is_empty() {
            return Err(BusError::at(
                BusErrorKind::InvalidArgument,
                address,
                "empty write",
            ));
        }
        let op = BusOp {
            kind: BusOpKind::Write,
            address: Some(address),
            target: register,
        };
        self.operate(op, |state| {
            for (offset, value) in payload.iter().enumerate() {
                state
                    .registers
                    .insert((address, register.wrapping_add(offset as u8)), *value);
            }
            Ok(())
        })
    }

    fn setup_pin(&mut self, pin: u8, mode: PinMode, _pull: Pull) -> BusResult<()> {
        let op = BusOp {
            kind: BusOpKind::SetupPin,
            address: None,
            target: pin,
        };
        self.operate(op, |state| {
            state.pins.insert(pin, PinState { mode, level: false });
            Ok(())
        })
    }

    fn read_pin(&mut self, pin: u8) -> BusResult<bool> {
        let op = BusOp {
            kind: BusOpKind::ReadPin,
            address: None,
            target: pin,
        };
        let square = self.started.elapsed().as_secs_f64().sin().round() > 0.0;
        self.operate(op, |state| {
            let Some(config) = state.pins.get(&pin).copied() else {
                return Err(BusError::new(
                    BusErrorKind::InvalidArgument,
                    format!("pin {} is not configured", pin),
                ));
            };
            Ok(match config.mode {
                PinMode::Output => config.level,
                PinMode::Input => state.forced_inputs.get(&pin).copied().unwrap_or(square),
            })
        })
    }

    fn write_pin(&mut self, pin: u8, level: bool) -> BusResult<()> {
        let op = BusOp {
            kind: BusOpKind::WritePin,
            address: None,
            target: pin,
        };
        self.operate(op, |state| match state.pins.get_mut(&pin) {
            Some(config) if config.mode == PinMode::Output => {
                config.level = level;
                Ok(())
            }
            _ => Err(BusError::new(
                BusErrorKind::InvalidArgument,
                format!("pin {} is not an output", pin),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_registers_read_back() {
        let mut bus = SimulatedBus::new();
        bus.write_block(0x55, 2, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 3];
        bus.read_block(0x55, 2, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(bus.register(0x55, 4), Some(3));
    }

    #[test]
    fn test_absent_device_does_not_acknowledge() {
        let mut bus = SimulatedBus::new();
        bus.set_absent(0x5C, true);

        let mut buf = [0u8; 1];
        let err = bus.read_block(0x5C, 0x28, &mut buf).unwrap_err();
        assert_eq!(err.kind, BusErrorKind::NoAcknowledge);

        bus.set_absent(0x5C, false);
        assert!(bus.read_block(0x5C, 0x28, &mut buf).is_ok());
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let mut bus = SimulatedBus::new();
        bus.fail_next(1);

        let mut buf = [0u8; 1];
        assert!(bus.read_block(0x10, 0, &mut buf).is_err());
        assert!(bus.read_block(0x10, 0, &mut buf).is_ok());
    }

    #[test]
    fn test_pins() {
        let mut bus = SimulatedBus::new();
        bus.setup_pin(6, PinMode::Output, Pull::None).unwrap();
        bus.setup_pin(18, PinMode::Input, Pull::Down).unwrap();

        bus.write_pin(6, true).unwrap();
        assert_eq!(bus.output_level(6), Some(true));
        assert!(bus.read_pin(6).unwrap());

        bus.set_input(18, true);
        assert!(bus.read_pin(18).unwrap());
        assert!(bus.write_pin(18, true).is_err());
        assert!(bus.read_pin(3).is_err());
    }

    #[test]
    fn test_operation_log() {
        let mut bus = SimulatedBus::new();
        bus.write_block(0x55, 2, &[0]).unwrap();
        bus.write_block(0x55, 0, &[1]).unwrap();

        let ops = bus.operations();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, BusOpKind::Write);
        assert_eq!(ops[1].target, 0);
    }

    #[test]
    fn test_operation_log_is_bounded() {
        let mut bus = SimulatedBus::new();
        let mut buf = [0u8; 1];
        for _ in 0..DEFAULT_LOG_CAPACITY + 100 {
            bus.read_block(0x10, 0, &mut buf).unwrap();
        }
        assert_eq!(bus.operations().len(), DEFAULT_LOG_CAPACITY);

        bus.set_log_capacity(2);
        bus.write_block(0x55, 7, &[1]).unwrap();
        let ops = bus.operations();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, BusOpKind::Read);
        assert_eq!(ops[1].target, 7);

        bus.set_log_capacity(0);
        bus.read_block(0x10, 0, &mut buf).unwrap();
        assert!(bus.operations().is_empty());
    }
}
