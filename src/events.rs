use crate::packet::UplinkPacket;
use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub const LOG_HISTORY_SIZE: usize = 100;
pub const PACKET_HISTORY_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventCategory {
    Info,
    Transmit,
    Receive,
    Error,
    Alarm,
    MeterRead,
}

impl EventCategory {
    pub fn tag(self) -> &'static str {
        match self {
            EventCategory::Info => "INFO",
            EventCategory::Transmit => "TX",
            EventCategory::Receive => "RX",
            EventCategory::Error => "ERR",
            EventCategory::Alarm => "ALARM",
            EventCategory::MeterRead => "METER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp_ms: i64,
    pub category: EventCategory,
    pub message: alloc::string::String,
}

impl LogEvent {
    pub fn new(timestamp_ms: i64, category: EventCategory, message: impl Into<alloc::string::String>) -> Self {
        Self {
            timestamp_ms,
            category,
            message: message.into(),
        }
    }
}

/// A completed uplink as handed to displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub timestamp_ms: i64,
    pub readings: u8,
    pub packet: UplinkPacket,
    pub hex: alloc::string::String,
}

impl PacketRecord {
    pub fn new(timestamp_ms: i64, readings: u8, packet: UplinkPacket) -> Self {
        let hex = packet.to_hex();
        Self {
            timestamp_ms,
            readings,
            packet,
            hex,
        }
    }
}

/// Consumer of core notifications. Sinks only observe; they never reach back
/// into simulation state.
pub trait EventSink {
    fn on_log(&mut self, event: &LogEvent);
    fn on_packet(&mut self, record: &PacketRecord);
}

/// Bounded history of the most recent events and packets.
#[derive(Debug)]
pub struct EventLog {
    logs: HistoryBuffer<LogEvent, LOG_HISTORY_SIZE>,
    packets: HistoryBuffer<PacketRecord, PACKET_HISTORY_SIZE>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            logs: HistoryBuffer::new(),
            packets: HistoryBuffer::new(),
        }
    }

    /// Retained log events, newest first.
    pub fn recent_logs(&self) -> alloc::vec::Vec<LogEvent> {
        let mut logs: alloc::vec::Vec<LogEvent> = self.logs.oldest_ordered().cloned().collect();
        logs.reverse();
        logs
    }

    /// Retained packets, newest first.
    pub fn recent_packets(&self) -> alloc::vec::Vec<PacketRecord> {
        let mut packets: alloc::vec::Vec<PacketRecord> = self.packets.oldest_ordered().cloned().collect();
        packets.reverse();
        packets
    }

    pub fn log_count(&self) -> usize {
        self.logs.len()
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn clear(&mut self) {
        self.logs = HistoryBuffer::new();
        self.packets = HistoryBuffer::new();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventLog {
    fn on_log(&mut self, event: &LogEvent) {
        self.logs.write(event.clone());
    }

    fn on_packet(&mut self, record: &PacketRecord) {
        self.packets.write(record.clone());
    }
}

/// Mirrors the event stream into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_log(&mut self, event: &LogEvent) {
        match event.category {
            EventCategory::Error => error!(at = event.timestamp_ms, "[{}] {}", event.category.tag(), event.message),
            EventCategory::Alarm => warn!(at = event.timestamp_ms, "[{}] {}", event.category.tag(), event.message),
            _ => info!(at = event.timestamp_ms, "[{}] {}", event.category.tag(), event.message),
        }
    }

    fn on_packet(&mut self, record: &PacketRecord) {
        info!(at = record.timestamp_ms, readings = record.readings, "📡 {}", record.hex);
    }
}
