use super::alarm::{AlarmEdge, AlarmKind, AlarmTimers, OVERLOAD_FLOW_LPH};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_USAGE_M3: f64 = 123.456;
pub const DEFAULT_TEMPERATURE_C: f64 = 15.0;
pub const DEFAULT_VOLTAGE_V: f64 = 3.6;
pub const MAX_VOLTAGE_V: f64 = 3.7;

// L/h * ms -> m3
const LPH_MS_PER_M3: f64 = 3_600_000_000.0;

const BATTERY_CODE_MAX: u8 = 31;
const BATTERY_FLOOR_V: f64 = 0.7;

// Per-reading status bytes
const STATUS1_OVERLOAD: u8 = 0x80;
const STATUS1_BACKFLOW: u8 = 0x40;
const STATUS1_LEAK: u8 = 0x20;
const STATUS1_BATTERY_MASK: u8 = 0x1F;
const STATUS2_MAGNET: u8 = 0x80;
const STATUS2_FREEZE: u8 = 0x40;
const STATUS2_UNIT_M3: u8 = 0x08;
const STATUS2_DECIMALS: u8 = 0x03;

// Meter block status byte of the uplink packet
const METER_STATUS_OVERLOAD: u8 = 0x80;
const METER_STATUS_BACKFLOW: u8 = 0x40;
const METER_STATUS_LEAK: u8 = 0x20;
const METER_STATUS_MAGNET: u8 = 0x10;
const METER_STATUS_FREEZE: u8 = 0x08;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterState {
    pub usage_m3: f64,
    pub flow_lph: f64,
    pub temp_c: f64,
    pub voltage_v: f64,
    pub magnet_detected: bool,
    pub leak_detected: bool,
    pub alarms: AlarmTimers,
}

impl MeterState {
    pub fn is_alarm_active(&self, kind: AlarmKind) -> bool {
        self.alarms.is_active(kind)
    }

    /// Battery code carried in the low five bits of `status1`.
    ///
    /// Zero at full charge; otherwise one step per 0.1 V below 3.7 V, pinned
    /// to 31 once the cell is flat.
    pub fn battery_code(&self) -> u8 {
        if self.voltage_v >= MAX_VOLTAGE_V {
            return 0;
        }
        if self.voltage_v < BATTERY_FLOOR_V {
            return BATTERY_CODE_MAX;
        }
        let steps = ((MAX_VOLTAGE_V - self.voltage_v) * 10.0).floor() as u8;
        steps.saturating_add(1).min(BATTERY_CODE_MAX)
    }

    pub fn status1(&self) -> u8 {
        let mut status = 0;
        if self.is_alarm_active(AlarmKind::Overload) {
            status |= STATUS1_OVERLOAD;
        }
        if self.is_alarm_active(AlarmKind::Backflow) {
            status |= STATUS1_BACKFLOW;
        }
        if self.leak_detected {
            status |= STATUS1_LEAK;
        }
        status | (self.battery_code() & STATUS1_BATTERY_MASK)
    }

    pub fn status2(&self) -> u8 {
        let mut status = STATUS2_UNIT_M3 | STATUS2_DECIMALS;
        if self.is_alarm_active(AlarmKind::Magnet) {
            status |= STATUS2_MAGNET;
        }
        if self.is_alarm_active(AlarmKind::Freeze) {
            status |= STATUS2_FREEZE;
        }
        status
    }

    /// Status byte of the packet's meter block. Deliberately a different bit
    /// layout from `status1`/`status2`.
    pub fn packet_status(&self) -> u8 {
        let mut status = 0;
        if self.is_alarm_active(AlarmKind::Overload) {
            status |= METER_STATUS_OVERLOAD;
        }
        if self.is_alarm_active(AlarmKind::Backflow) {
            status |= METER_STATUS_BACKFLOW;
        }
        if self.leak_detected {
            status |= METER_STATUS_LEAK;
        }
        if self.is_alarm_active(AlarmKind::Magnet) {
            status |= METER_STATUS_MAGNET;
        }
        if self.is_alarm_active(AlarmKind::Freeze) {
            status |= METER_STATUS_FREEZE;
        }
        status
    }
}

impl Default for MeterState {
    fn default() -> Self {
        Self {
            usage_m3: DEFAULT_USAGE_M3,
            flow_lph: 0.0,
            temp_c: DEFAULT_TEMPERATURE_C,
            voltage_v: DEFAULT_VOLTAGE_V,
            magnet_detected: false,
            leak_detected: false,
            alarms: AlarmTimers::new(),
        }
    }
}

/// Environmental inputs pushed in by the control panel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeterInput {
    Flow(f64),
    Temperature(f64),
    Voltage(f64),
    Magnet(bool),
    Leak(bool),
}

pub type AlarmTransitions = Vec<(AlarmKind, AlarmEdge), 4>;

#[derive(Debug)]
pub struct MeterModel {
    state: MeterState,
}

impl MeterModel {
    pub fn new() -> Self {
        Self::with_state(MeterState::default())
    }

    pub fn with_state(state: MeterState) -> Self {
        Self { state }
    }

    pub fn apply(&mut self, input: MeterInput) {
        match input {
            MeterInput::Flow(lph) => self.state.flow_lph = lph,
            MeterInput::Temperature(celsius) => self.state.temp_c = celsius,
            MeterInput::Voltage(volts) => self.state.voltage_v = volts,
            MeterInput::Magnet(detected) => self.state.magnet_detected = detected,
            MeterInput::Leak(detected) => self.state.leak_detected = detected,
        }
    }

    /// Integrates usage over `dt_ms` and steps the alarm timers. Returns only
    /// the alarms whose active level changed on this call.
    pub fn advance(&mut self, dt_ms: i64) -> AlarmTransitions {
        let dt_ms = dt_ms.max(0);
        let state = &mut self.state;

        if state.flow_lph != 0.0 {
            state.usage_m3 += state.flow_lph * dt_ms as f64 / LPH_MS_PER_M3;
        }

        let mut transitions = AlarmTransitions::new();
        for kind in AlarmKind::ALL {
            let condition = match kind {
                AlarmKind::Freeze => state.temp_c <= 0.0,
                AlarmKind::Overload => state.flow_lph > OVERLOAD_FLOW_LPH,
                AlarmKind::Backflow => state.flow_lph < 0.0,
                AlarmKind::Magnet => state.magnet_detected,
            };

            let edge = state.alarms.get_mut(kind).update(condition, dt_ms);
            if edge != AlarmEdge::Unchanged {
                debug!("Meter alarm {} -> {:?}", kind, edge);
                // Capacity equals the number of alarm kinds.
                let _ = transitions.push((kind, edge));
            }
        }

        transitions
    }

    pub fn state(&self) -> &MeterState {
        &self.state
    }

    pub fn get_state(&self) -> MeterState {
        self.state.clone()
    }
}

impl Default for MeterModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_code_steps() {
        let mut state = MeterState::default();

        state.voltage_v = 3.7;
        assert_eq!(state.battery_code(), 0);

        state.voltage_v = 3.65;
        assert_eq!(state.battery_code(), 1);

        state.voltage_v = 3.0;
        assert_eq!(state.battery_code(), 8);

        state.voltage_v = 0.5;
        assert_eq!(state.battery_code(), 31);
    }
}
