use super::alarm::AlarmKind;
use super::meter::MeterState;
use crate::config::ConfigError;
use crate::packet::{self, UplinkFrame, UplinkPacket, MAX_READINGS_PER_PACKET};
use chrono::FixedOffset;
use heapless::{Deque, Vec};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const MS_PER_HOUR: i64 = 3_600_000;
pub const MAX_RETRIES: u8 = 3;
pub const DEFAULT_RSRP_DBM: i32 = -90;
pub const DEFAULT_READ_PERIOD_HOURS: u8 = 1;
pub const DEFAULT_REPORT_PERIOD_HOURS: u8 = 6;

// Three weeks of hourly readings.
pub const MAX_BUFFERED_READINGS: usize = 512;

pub type ReadingBuffer = Deque<ReadingRecord, MAX_BUFFERED_READINGS>;
pub type TransmitWindow = Vec<ReadingRecord, MAX_READINGS_PER_PACKET>;
pub type ModemEvents = Vec<ModemEvent, 4>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadingRecord {
    pub timestamp_ms: i64,
    pub usage_m3: f64,
    pub status1: u8,
    pub status2: u8,
}

/// Communication mode. `Wait` remembers how many readings the packet
/// it is waiting on carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModemMode {
    Sleep,
    Wake,
    Read,
    Connect,
    Send,
    Wait { sent: u8 },
}

impl ModemMode {
    pub fn name(&self) -> &'static str {
        match self {
            ModemMode::Sleep => "SLEEP",
            ModemMode::Wake => "WAKE",
            ModemMode::Read => "READ",
            ModemMode::Connect => "CONNECT",
            ModemMode::Send => "SEND",
            ModemMode::Wait { .. } => "WAIT",
        }
    }
}

impl core::fmt::Display for ModemMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Effects produced by a single tick, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ModemEvent {
    EmergencyWake,
    ReadingStored { buffered: usize, dropped_oldest: bool },
    Transmitted { packet: UplinkPacket, readings: u8 },
    AckReceived { rsrp_dbm: i32 },
    AckFailed { retry: u8 },
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModemInput {
    Rsrp(i32),
    AckFail(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmSnapshot {
    pub magnet: bool,
    pub freeze: bool,
}

/// Read/report timetable in absolute virtual milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub read_period_ms: i64,
    pub report_period_ms: i64,
    pub next_read_at: i64,
    pub next_report_at: i64,
}

impl Schedule {
    /// Startup timetable: first read on the next hour boundary, first report
    /// on the following multiple of the report period.
    pub fn aligned(now_ms: i64, read_hours: u8, report_hours: u8) -> Result<Self, ConfigError> {
        validate_periods(read_hours, report_hours)?;
        let read_period_ms = i64::from(read_hours) * MS_PER_HOUR;
        let report_period_ms = i64::from(report_hours) * MS_PER_HOUR;

        let first_read = -(-now_ms).div_euclid(MS_PER_HOUR) * MS_PER_HOUR;
        let first_report =
            first_read + (report_period_ms - first_read.rem_euclid(report_period_ms));

        Ok(Self {
            read_period_ms,
            report_period_ms,
            next_read_at: first_read,
            next_report_at: first_report,
        })
    }

    /// Timetable after a period change: both anchors move to the next
    /// multiple of their period after `now_ms`.
    pub fn realigned(now_ms: i64, read_hours: u8, report_hours: u8) -> Result<Self, ConfigError> {
        validate_periods(read_hours, report_hours)?;
        let read_period_ms = i64::from(read_hours) * MS_PER_HOUR;
        let report_period_ms = i64::from(report_hours) * MS_PER_HOUR;

        Ok(Self {
            read_period_ms,
            report_period_ms,
            next_read_at: now_ms + (read_period_ms - now_ms.rem_euclid(read_period_ms)),
            next_report_at: now_ms + (report_period_ms - now_ms.rem_euclid(report_period_ms)),
        })
    }

    pub fn read_period_hours(&self) -> u8 {
        (self.read_period_ms / MS_PER_HOUR) as u8
    }

    pub fn report_period_hours(&self) -> u8 {
        (self.report_period_ms / MS_PER_HOUR) as u8
    }
}

pub fn validate_periods(read_hours: u8, report_hours: u8) -> Result<(), ConfigError> {
    if read_hours == 0 {
        return Err(ConfigError::ZeroReadPeriod);
    }
    if report_hours < read_hours {
        return Err(ConfigError::ReportShorterThanRead {
            read_hours,
            report_hours,
        });
    }
    Ok(())
}

/// Per-tick inputs the modem reads but does not own.
#[derive(Debug, Clone, Copy)]
pub struct TickInput<'a> {
    pub now_ms: i64,
    pub dt_ms: i64,
    pub meter: &'a MeterState,
    pub pacing_delay_ms: i64,
}

/// Read-only view for displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemStatus {
    pub mode: ModemMode,
    pub rsrp_dbm: i32,
    pub ack_fail: bool,
    pub read_period_hours: u8,
    pub report_period_hours: u8,
    pub next_read_at: i64,
    pub next_report_at: i64,
    pub buffer_size: usize,
    pub retry_count: u8,
    pub force_report: bool,
    pub delay_ms: i64,
}

#[derive(Debug)]
pub struct ModemController {
    mode: ModemMode,
    schedule: Schedule,
    buffer: ReadingBuffer,
    retry_count: u8,
    force_report: bool,
    rsrp_dbm: i32,
    ack_fail: bool,
    delay_ms: i64,
    last_alarms: AlarmSnapshot,
    utc_offset: FixedOffset,
}

impl ModemController {
    pub fn new(schedule: Schedule, rsrp_dbm: i32, utc_offset: FixedOffset) -> Self {
        Self {
            mode: ModemMode::Sleep,
            schedule,
            buffer: Deque::new(),
            retry_count: 0,
            force_report: false,
            rsrp_dbm,
            ack_fail: false,
            delay_ms: 0,
            last_alarms: AlarmSnapshot {
                magnet: false,
                freeze: false,
            },
            utc_offset,
        }
    }

    pub fn apply(&mut self, input: ModemInput) {
        match input {
            ModemInput::Rsrp(dbm) => self.rsrp_dbm = dbm,
            ModemInput::AckFail(fail) => self.ack_fail = fail,
        }
    }

    /// Changes both periods and realigns the timetable. The buffer is kept.
    /// On error nothing changes.
    pub fn set_periods(&mut self, read_hours: u8, report_hours: u8, now_ms: i64) -> Result<(), ConfigError> {
        self.schedule = Schedule::realigned(now_ms, read_hours, report_hours)?;
        info!(
            "Periods changed: read {}h, report {}h (next read {}, next report {})",
            read_hours, report_hours, self.schedule.next_read_at, self.schedule.next_report_at
        );
        Ok(())
    }

    /// Requests an out-of-schedule report. Returns true when the modem was
    /// idle and will act on it at the next read.
    pub fn force_report(&mut self) -> bool {
        self.force_report = true;
        self.mode == ModemMode::Sleep
    }

    pub fn tick(&mut self, input: &TickInput<'_>) -> ModemEvents {
        let mut events = ModemEvents::new();

        // Critical alarms cut into whatever the cycle is doing.
        let alarms = AlarmSnapshot {
            magnet: input.meter.is_alarm_active(AlarmKind::Magnet),
            freeze: input.meter.is_alarm_active(AlarmKind::Freeze),
        };
        if (alarms.magnet && !self.last_alarms.magnet) || (alarms.freeze && !self.last_alarms.freeze) {
            warn!("Critical alarm raised in {}, forcing immediate report", self.mode);
            self.mode = ModemMode::Wake;
            self.force_report = true;
            push_event(&mut events, ModemEvent::EmergencyWake);
        }
        self.last_alarms = alarms;

        if self.delay_ms > 0 {
            self.delay_ms = (self.delay_ms - input.dt_ms.max(0)).max(0);
            return events;
        }

        let next = match self.mode {
            ModemMode::Sleep => self.on_sleep(input),
            ModemMode::Wake => ModemMode::Read,
            ModemMode::Read => self.on_read(input, &mut events),
            ModemMode::Connect => self.on_connect(input),
            ModemMode::Send => self.on_send(input, &mut events),
            ModemMode::Wait { sent } => self.on_wait(sent, &mut events),
        };

        if next != self.mode {
            debug!("Modem {} -> {}", self.mode, next);
        }
        self.mode = next;

        debug_assert!(self.retry_count < MAX_RETRIES, "Retry count {} out of range", self.retry_count);

        events
    }

    fn on_sleep(&self, input: &TickInput<'_>) -> ModemMode {
        if input.now_ms >= self.schedule.next_read_at {
            ModemMode::Wake
        } else {
            ModemMode::Sleep
        }
    }

    fn on_read(&mut self, input: &TickInput<'_>, events: &mut ModemEvents) -> ModemMode {
        let record = ReadingRecord {
            timestamp_ms: self.schedule.next_read_at,
            usage_m3: input.meter.usage_m3,
            status1: input.meter.status1(),
            status2: input.meter.status2(),
        };

        let dropped_oldest = self.buffer.is_full();
        if dropped_oldest {
            warn!("Reading buffer full ({}), oldest unsent reading lost", MAX_BUFFERED_READINGS);
            self.buffer.pop_front();
        }
        // Room was made above.
        let _ = self.buffer.push_back(record);

        push_event(
            events,
            ModemEvent::ReadingStored {
                buffered: self.buffer.len(),
                dropped_oldest,
            },
        );

        self.schedule.next_read_at += self.schedule.read_period_ms;

        if input.now_ms >= self.schedule.next_report_at || self.force_report {
            ModemMode::Connect
        } else {
            ModemMode::Sleep
        }
    }

    fn on_connect(&mut self, input: &TickInput<'_>) -> ModemMode {
        self.delay_ms = input.pacing_delay_ms.max(0);
        ModemMode::Send
    }

    fn on_send(&mut self, input: &TickInput<'_>, events: &mut ModemEvents) -> ModemMode {
        let window = self.transmit_window();
        let sent = window.len() as u8;

        let packet = packet::encode(&UplinkFrame {
            readings: &window,
            meter: input.meter,
            rsrp_dbm: self.rsrp_dbm,
            read_period_ms: self.schedule.read_period_ms,
            report_period_ms: self.schedule.report_period_ms,
            timestamp_ms: input.now_ms,
            utc_offset: self.utc_offset,
        });
        info!("Uplink sent: {} bytes, {} readings", packet.len(), sent);
        push_event(events, ModemEvent::Transmitted { packet, readings: sent });

        // A forced report leaves the regular timetable alone.
        if !self.force_report {
            self.schedule.next_report_at += self.schedule.report_period_ms;
        }
        self.force_report = false;

        self.delay_ms = input.pacing_delay_ms.max(0);
        ModemMode::Wait { sent }
    }

    fn on_wait(&mut self, sent: u8, events: &mut ModemEvents) -> ModemMode {
        if self.ack_fail {
            self.retry_count += 1;
            warn!("No acknowledgement (retry {})", self.retry_count);
            push_event(events, ModemEvent::AckFailed { retry: self.retry_count });

            if self.retry_count >= MAX_RETRIES {
                warn!("Giving up after {} attempts, {} readings kept", MAX_RETRIES, self.buffer.len());
                self.retry_count = 0;
                push_event(events, ModemEvent::Abandoned);
                return ModemMode::Sleep;
            }
            return ModemMode::Connect;
        }

        let acknowledged = usize::from(sent).min(self.buffer.len());
        for _ in 0..acknowledged {
            self.buffer.pop_front();
        }
        self.retry_count = 0;
        push_event(events, ModemEvent::AckReceived { rsrp_dbm: self.rsrp_dbm });

        ModemMode::Sleep
    }

    /// Oldest buffered readings, up to one packet's worth. The same entries
    /// are removed from the front once acknowledged.
    pub fn transmit_window(&self) -> TransmitWindow {
        self.buffer
            .iter()
            .take(MAX_READINGS_PER_PACKET)
            .copied()
            .collect()
    }

    pub fn mode(&self) -> ModemMode {
        self.mode
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn buffer(&self) -> &ReadingBuffer {
        &self.buffer
    }

    pub fn buffered_readings(&self) -> usize {
        self.buffer.len()
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn is_report_forced(&self) -> bool {
        self.force_report
    }

    pub fn rsrp_dbm(&self) -> i32 {
        self.rsrp_dbm
    }

    pub fn ack_fail(&self) -> bool {
        self.ack_fail
    }

    pub fn delay_ms(&self) -> i64 {
        self.delay_ms
    }

    pub fn last_alarms(&self) -> AlarmSnapshot {
        self.last_alarms
    }

    pub fn get_status(&self) -> ModemStatus {
        ModemStatus {
            mode: self.mode,
            rsrp_dbm: self.rsrp_dbm,
            ack_fail: self.ack_fail,
            read_period_hours: self.schedule.read_period_hours(),
            report_period_hours: self.schedule.report_period_hours(),
            next_read_at: self.schedule.next_read_at,
            next_report_at: self.schedule.next_report_at,
            buffer_size: self.buffer.len(),
            retry_count: self.retry_count,
            force_report: self.force_report,
            delay_ms: self.delay_ms,
        }
    }
}

fn push_event(events: &mut ModemEvents, event: ModemEvent) {
    // A tick produces at most three events.
    let pushed = events.push(event).is_ok();
    debug_assert!(pushed, "Modem event list overflow");
}
