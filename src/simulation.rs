//! The simulation driver.
//!
//! [`SimulationContext`] owns the clock, meter and modem. External inputs are
//! queued and applied at the start of the next tick, so a tick always sees a
//! consistent set of inputs. Each tick runs clock, meter and modem in that
//! order and returns the notifications it produced.

use crate::clock::{SpeedLevel, VirtualClock};
use crate::config::{ConfigError, SimulationConfig};
use crate::device::alarm::AlarmEdge;
use crate::device::meter::{MeterInput, MeterModel, MeterState};
use crate::device::modem::{self, ModemController, ModemEvent, ModemInput, ModemStatus, Schedule, TickInput};
use crate::events::{EventCategory, EventLog, EventSink, LogEvent, PacketRecord};
use crate::packet::PacketTime;
use crate::protocol::CommandType;
use chrono::FixedOffset;
use heapless::spsc::Queue;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

// Holds MAX_PENDING_INPUTS - 1 entries.
const MAX_PENDING_INPUTS: usize = 33;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    #[error("input queue full")]
    InputQueueFull,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("command cannot be queued: {0}")]
    NotAnInput(&'static str),
}

/// A write from outside the loop, applied at the start of the next tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimulationInput {
    Meter(MeterInput),
    Modem(ModemInput),
    SetPeriods { read_hours: u8, report_hours: u8 },
    ForceReport,
    SetSpeed(SpeedLevel),
}

impl TryFrom<&CommandType> for SimulationInput {
    type Error = SimulationError;

    fn try_from(command: &CommandType) -> Result<Self, Self::Error> {
        Ok(match *command {
            CommandType::SetFlow { lph } => SimulationInput::Meter(MeterInput::Flow(lph)),
            CommandType::SetTemperature { celsius } => SimulationInput::Meter(MeterInput::Temperature(celsius)),
            CommandType::SetVoltage { volts } => SimulationInput::Meter(MeterInput::Voltage(volts)),
            CommandType::SetMagnet { detected } => SimulationInput::Meter(MeterInput::Magnet(detected)),
            CommandType::SetLeak { detected } => SimulationInput::Meter(MeterInput::Leak(detected)),
            CommandType::SetRsrp { dbm } => SimulationInput::Modem(ModemInput::Rsrp(dbm)),
            CommandType::SetAckFail { fail } => SimulationInput::Modem(ModemInput::AckFail(fail)),
            CommandType::SetPeriods { read_hours, report_hours } => SimulationInput::SetPeriods {
                read_hours,
                report_hours,
            },
            CommandType::ForceReport => SimulationInput::ForceReport,
            CommandType::SetSpeed { level } => SimulationInput::SetSpeed(level),
            CommandType::Ping => return Err(SimulationError::NotAnInput("Ping")),
            CommandType::Status => return Err(SimulationError::NotAnInput("Status")),
            CommandType::ClearLogs => return Err(SimulationError::NotAnInput("ClearLogs")),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SimulationStats {
    pub ticks: u64,
    pub readings_taken: u32,
    pub packets_sent: u32,
    pub acks_received: u32,
    pub ack_failures: u32,
    pub reports_abandoned: u32,
    pub emergency_reports: u32,
}

/// Notifications produced by one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub virtual_time_ms: i64,
    pub dt_ms: i64,
    pub logs: alloc::vec::Vec<LogEvent>,
    pub packets: alloc::vec::Vec<PacketRecord>,
}

/// Immutable view of the simulation taken between ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub virtual_time_ms: i64,
    pub virtual_time: alloc::string::String,
    pub speed: SpeedLevel,
    pub meter: MeterState,
    pub modem: ModemStatus,
    pub stats: SimulationStats,
}

pub struct SimulationContext {
    clock: VirtualClock,
    meter: MeterModel,
    modem: ModemController,
    utc_offset: FixedOffset,
    pending: Queue<SimulationInput, MAX_PENDING_INPUTS>,
    history: EventLog,
    sinks: alloc::vec::Vec<Box<dyn EventSink + Send>>,
    stats: SimulationStats,
    // The startup event goes out with the first tick, once sinks are attached.
    announced: bool,
}

impl SimulationContext {
    pub fn new(config: &SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let utc_offset = config.utc_offset()?;
        let start_ms = config
            .start_time_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let schedule = Schedule::aligned(start_ms, config.read_period_hours, config.report_period_hours)?;
        let meter = MeterModel::with_state(MeterState {
            usage_m3: config.initial_meter.usage_m3,
            flow_lph: config.initial_meter.flow_lph,
            temp_c: config.initial_meter.temp_c,
            voltage_v: config.initial_meter.voltage_v,
            ..MeterState::default()
        });

        let mut context = Self {
            clock: VirtualClock::new(start_ms, config.speed),
            meter,
            modem: ModemController::new(schedule, config.rsrp_dbm, utc_offset),
            utc_offset,
            pending: Queue::new(),
            history: EventLog::new(),
            sinks: alloc::vec::Vec::new(),
            stats: SimulationStats::default(),
            announced: false,
        };

        info!(
            "Simulation initialized at {} (next read {}, next report {})",
            context.format_time(start_ms),
            schedule.next_read_at,
            schedule.next_report_at
        );

        Ok(context)
    }

    pub fn add_sink(&mut self, sink: Box<dyn EventSink + Send>) {
        self.sinks.push(sink);
    }

    /// Queues an input for the next tick. Period changes are validated here
    /// so a bad request is refused before anything is queued.
    pub fn submit(&mut self, input: SimulationInput) -> Result<(), SimulationError> {
        if let SimulationInput::SetPeriods { read_hours, report_hours } = input {
            modem::validate_periods(read_hours, report_hours)?;
        }
        self.pending
            .enqueue(input)
            .map_err(|_| SimulationError::InputQueueFull)
    }

    pub fn submit_command(&mut self, command: &CommandType) -> Result<(), SimulationError> {
        let input = SimulationInput::try_from(command)?;
        self.submit(input)
    }

    pub fn pending_inputs(&self) -> usize {
        self.pending.len()
    }

    /// Runs one iteration against the wall clock.
    pub fn tick(&mut self) -> TickReport {
        let mut report = self.begin_tick();
        let dt_ms = self.clock.advance();
        self.step(&mut report, dt_ms);
        report
    }

    /// Runs one iteration as if `real_elapsed` had passed on the wall clock.
    pub fn tick_with(&mut self, real_elapsed: Duration) -> TickReport {
        let mut report = self.begin_tick();
        let dt_ms = self.clock.advance_by(real_elapsed);
        self.step(&mut report, dt_ms);
        report
    }

    fn begin_tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if !self.announced {
            self.announced = true;
            self.emit(&mut report, EventCategory::Info, "System initialized");
        }
        self.apply_pending(&mut report);
        report
    }

    fn apply_pending(&mut self, report: &mut TickReport) {
        while let Some(input) = self.pending.dequeue() {
            debug!("Applying input {:?}", input);
            match input {
                SimulationInput::Meter(meter_input) => self.meter.apply(meter_input),
                SimulationInput::Modem(modem_input) => self.modem.apply(modem_input),
                SimulationInput::SetPeriods { read_hours, report_hours } => {
                    let now = self.clock.now_ms();
                    match self.modem.set_periods(read_hours, report_hours, now) {
                        Ok(()) => self.emit(
                            report,
                            EventCategory::Info,
                            alloc::format!("[CONFIG] Read {}h / report {}h", read_hours, report_hours),
                        ),
                        Err(e) => self.emit(report, EventCategory::Error, alloc::format!("[CONFIG] {}", e)),
                    }
                }
                SimulationInput::ForceReport => {
                    if self.modem.force_report() {
                        self.emit(report, EventCategory::Info, "[USER] Forced report requested");
                    }
                }
                SimulationInput::SetSpeed(level) => {
                    self.clock.set_speed(level);
                    info!("Speed set to {}", level);
                }
            }
        }
    }

    fn step(&mut self, report: &mut TickReport, dt_ms: i64) {
        let now = self.clock.now_ms();
        report.virtual_time_ms = now;
        report.dt_ms = dt_ms;

        if dt_ms <= 0 {
            return;
        }
        self.stats.ticks += 1;

        for (kind, edge) in self.meter.advance(dt_ms) {
            match edge {
                AlarmEdge::Entered => {
                    self.emit(report, EventCategory::Alarm, alloc::format!("[METER] {} alarm raised", kind));
                }
                AlarmEdge::Cleared => {
                    self.emit(report, EventCategory::Info, alloc::format!("[METER] {} alarm cleared", kind));
                }
                AlarmEdge::Unchanged => {}
            }
        }

        let events = self.modem.tick(&TickInput {
            now_ms: now,
            dt_ms,
            meter: self.meter.state(),
            pacing_delay_ms: self.clock.pacing_delay_ms(),
        });

        for event in events {
            self.record(report, event);
        }
    }

    fn record(&mut self, report: &mut TickReport, event: ModemEvent) {
        match event {
            ModemEvent::EmergencyWake => {
                self.stats.emergency_reports += 1;
                self.emit(report, EventCategory::Alarm, "[MODEM] Emergency event -> immediate report");
            }
            ModemEvent::ReadingStored { buffered, dropped_oldest } => {
                self.stats.readings_taken += 1;
                let message = if dropped_oldest {
                    alloc::format!("[METER] Reading stored (buffer: {}, oldest reading lost)", buffered)
                } else {
                    alloc::format!("[METER] Reading stored (buffer: {})", buffered)
                };
                self.emit(report, EventCategory::MeterRead, message);
            }
            ModemEvent::Transmitted { packet, readings } => {
                self.stats.packets_sent += 1;
                self.emit(
                    report,
                    EventCategory::Transmit,
                    alloc::format!("[TX] 1 packet sent ({} readings)", readings),
                );
                let record = PacketRecord::new(report.virtual_time_ms, readings, packet);
                self.history.on_packet(&record);
                for sink in &mut self.sinks {
                    sink.on_packet(&record);
                }
                report.packets.push(record);
            }
            ModemEvent::AckReceived { rsrp_dbm } => {
                self.stats.acks_received += 1;
                self.emit(report, EventCategory::Receive, alloc::format!("[RX] ACK received (RSRP {}dBm)", rsrp_dbm));
            }
            ModemEvent::AckFailed { retry } => {
                self.stats.ack_failures += 1;
                self.emit(report, EventCategory::Error, alloc::format!("[NET] ACK failed (retry {})", retry));
            }
            ModemEvent::Abandoned => {
                self.stats.reports_abandoned += 1;
                self.emit(report, EventCategory::Error, "[MODEM] Transmission failed, back to sleep");
            }
        }
    }

    fn emit(
        &mut self,
        report: &mut TickReport,
        category: EventCategory,
        message: impl Into<alloc::string::String>,
    ) {
        let event = LogEvent::new(self.clock.now_ms(), category, message);
        self.history.on_log(&event);
        for sink in &mut self.sinks {
            sink.on_log(&event);
        }
        report.logs.push(event);
    }

    pub fn format_time(&self, timestamp_ms: i64) -> alloc::string::String {
        PacketTime::from_millis(timestamp_ms, self.utc_offset).to_string()
    }

    pub fn snapshot(&self) -> SimulationSnapshot {
        let now = self.clock.now_ms();
        SimulationSnapshot {
            virtual_time_ms: now,
            virtual_time: self.format_time(now),
            speed: self.clock.speed(),
            meter: self.meter.get_state(),
            modem: self.modem.get_status(),
            stats: self.stats,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    pub fn meter(&self) -> &MeterModel {
        &self.meter
    }

    pub fn modem(&self) -> &ModemController {
        &self.modem
    }

    pub fn history(&self) -> &EventLog {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }
}
