//! NB-IoT uplink packet (protocol V2.0, id `0xB1`).
//!
//! Layout, byte offsets from the start of the packet:
//!
//! | Offset | Size | Field |
//! |-------:|-----:|-------|
//! | 0 | 1 | protocol id `0xB1` |
//! | 1 | 1 | total length including checksum |
//! | 2 | 1 | version/type `0x70` |
//! | 3 | 8 | device id (BCD) |
//! | 11 | 8 | network id (BCD) |
//! | 19 | 12 | wireless block, `|rsrp|` at offset 26 |
//! | 31 | 8 | terminal serial (BCD, 5), type, reserved, voltage tenths |
//! | 39 | 12 | meter id (BCD, 4), type, caliper, status, manufacturer, temperature, 3 reserved |
//! | 51 | 9 | schedule flag, read hours, report hours, yy mm dd hh mi ss |
//! | 60 | 3 | data type, reading count, reserved |
//! | 63 | 4·max(n,1) | readings, little-endian `round(m3·1000)`, newest first |
//! | end | 1 | checksum: 8-bit sum of bytes `1..end` |

use crate::device::meter::MeterState;
use crate::device::modem::ReadingRecord;
use arrayvec::ArrayVec;
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

pub const PROTOCOL_ID: u8 = 0xB1;
pub const PROTOCOL_VERSION: u8 = 0x70;

pub const DEVICE_ID: &str = "861921031229508F";
pub const NETWORK_ID: &str = "450012345678901F";
pub const TERMINAL_SERIAL: &str = "0001234501";
pub const METER_ID: &str = "11223344";

const WIRELESS_MARKER: u8 = 0x55;
const WIRELESS_TRAILER: [u8; 2] = [0xFC, 0xFF];
const TERMINAL_TYPE: u8 = 0x02;
const METER_TYPE: u8 = 0x02;
const METER_CALIPER: u8 = 0x13;
const MANUFACTURER_CODE: u8 = 0x53;
const SCHEDULE_FLAG: u8 = 0x01;
const DATA_TYPE_CUMULATIVE: u8 = 0x01;

pub const MAX_READINGS_PER_PACKET: usize = 24;
pub const READING_SIZE: usize = 4;
pub const HEADER_SIZE: usize = 63;
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + READING_SIZE + 1;
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + READING_SIZE * MAX_READINGS_PER_PACKET + 1;

// The length field is a single byte.
const_assert!(MAX_PACKET_SIZE <= u8::MAX as usize);

const OFFSET_LENGTH: usize = 1;
const OFFSET_DEVICE_ID: usize = 3;
const OFFSET_NETWORK_ID: usize = 11;
const OFFSET_RSRP: usize = 26;
const OFFSET_SERIAL: usize = 31;
const OFFSET_VOLTAGE: usize = 38;
const OFFSET_METER_ID: usize = 39;
const OFFSET_METER_STATUS: usize = 45;
const OFFSET_TEMPERATURE: usize = 47;
const OFFSET_READ_HOURS: usize = 52;
const OFFSET_REPORT_HOURS: usize = 53;
const OFFSET_TIME: usize = 54;
const OFFSET_COUNT: usize = 61;

const MS_PER_HOUR: i64 = 3_600_000;

pub type PacketBytes = ArrayVec<u8, MAX_PACKET_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unexpected protocol id {0:#04X}")]
    BadHeader(u8),
    #[error("length field {declared} does not match packet size {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch: expected {expected:#04X}, found {found:#04X}")]
    ChecksumMismatch { expected: u8, found: u8 },
    #[error("reading count {0} exceeds {max}", max = MAX_READINGS_PER_PACKET)]
    TooManyReadings(usize),
    #[error("invalid hex digit in packet text")]
    InvalidHex,
}

/// Everything the encoder reads. `readings` is the transmit window in
/// chronological order, oldest first.
#[derive(Debug, Clone, Copy)]
pub struct UplinkFrame<'a> {
    pub readings: &'a [ReadingRecord],
    pub meter: &'a MeterState,
    pub rsrp_dbm: i32,
    pub read_period_ms: i64,
    pub report_period_ms: i64,
    pub timestamp_ms: i64,
    pub utc_offset: FixedOffset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkPacket {
    #[serde(with = "serde_bytes")]
    bytes: alloc::vec::Vec<u8>,
}

impl UplinkPacket {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn checksum(&self) -> u8 {
        self.bytes.last().copied().unwrap_or(0)
    }

    /// Uppercase hex pairs joined by single spaces.
    pub fn to_hex(&self) -> alloc::string::String {
        to_hex(&self.bytes)
    }

    pub fn decode(&self) -> Result<DecodedPacket, PacketError> {
        decode(&self.bytes)
    }
}

impl From<PacketBytes> for UplinkPacket {
    fn from(bytes: PacketBytes) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl PacketTime {
    pub fn from_millis(timestamp_ms: i64, offset: FixedOffset) -> Self {
        let local = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
            .unwrap_or_default()
            .with_timezone(&offset);

        Self {
            year: u16::try_from(local.year()).unwrap_or(2000),
            month: local.month() as u8,
            day: local.day() as u8,
            hour: local.hour() as u8,
            minute: local.minute() as u8,
            second: local.second() as u8,
        }
    }

    fn to_bytes(self) -> [u8; 6] {
        [
            self.year.saturating_sub(2000).min(u16::from(u8::MAX)) as u8,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
        ]
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            year: 2000 + u16::from(bytes[0]),
            month: bytes[1],
            day: bytes[2],
            hour: bytes[3],
            minute: bytes[4],
            second: bytes[5],
        }
    }
}

impl core::fmt::Display for PacketTime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Field values recovered from a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedPacket {
    pub length: usize,
    pub device_id: alloc::string::String,
    pub network_id: alloc::string::String,
    pub rsrp_magnitude: u8,
    pub terminal_serial: alloc::string::String,
    pub voltage_tenths: u8,
    pub meter_id: alloc::string::String,
    pub meter_status: u8,
    pub temperature_c: i8,
    pub read_period_hours: u8,
    pub report_period_hours: u8,
    pub time: PacketTime,
    pub reading_count: usize,
    /// Raw fixed-point readings (litres), newest first.
    pub readings_raw: alloc::vec::Vec<u32>,
    pub checksum: u8,
}

impl DecodedPacket {
    pub fn rsrp_dbm(&self) -> i32 {
        -i32::from(self.rsrp_magnitude)
    }

    pub fn voltage_v(&self) -> f64 {
        f64::from(self.voltage_tenths) / 10.0
    }

    /// Readings in m3, newest first.
    pub fn readings_m3(&self) -> alloc::vec::Vec<f64> {
        self.readings_raw
            .iter()
            .map(|&raw| f64::from(raw as i32) / 1000.0)
            .collect()
    }
}

fn push_bcd(packet: &mut PacketBytes, digits: &str) {
    let nibbles: ArrayVec<u8, 32> = digits
        .chars()
        .take(32)
        .map(|c| c.to_digit(16).map_or(0x0F, |d| d as u8))
        .collect();

    for pair in nibbles.chunks(2) {
        let low = pair.get(1).copied().unwrap_or(0x0F);
        packet.push((pair[0] << 4) | low);
    }
}

fn bcd_to_string(bytes: &[u8]) -> alloc::string::String {
    bytes.iter().map(|b| alloc::format!("{:02X}", b)).collect()
}

// Halves round toward positive infinity, as the meter firmware does.
fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

fn fixed_point(usage_m3: f64) -> u32 {
    // Wraps modulo 2^32 like the meter's register.
    round_half_up(usage_m3 * 1000.0) as i64 as u32
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .skip(1)
        .fold(0u8, |sum, &b| sum.wrapping_add(b))
}

fn period_hours(period_ms: i64) -> u8 {
    (period_ms / MS_PER_HOUR).clamp(0, i64::from(u8::MAX)) as u8
}

/// Builds the uplink packet for a transmit window.
pub fn encode(frame: &UplinkFrame<'_>) -> UplinkPacket {
    debug_assert!(
        frame.readings.len() <= MAX_READINGS_PER_PACKET,
        "Transmit window {} exceeds {}",
        frame.readings.len(),
        MAX_READINGS_PER_PACKET
    );
    let readings = &frame.readings[..frame.readings.len().min(MAX_READINGS_PER_PACKET)];
    let meter = frame.meter;
    let mut p = PacketBytes::new();

    // Header
    p.push(PROTOCOL_ID);
    p.push(0x00);
    p.push(PROTOCOL_VERSION);

    push_bcd(&mut p, DEVICE_ID);
    push_bcd(&mut p, NETWORK_ID);

    // Wireless
    let rsrp = frame.rsrp_dbm.unsigned_abs().min(u32::from(u8::MAX)) as u8;
    p.push(WIRELESS_MARKER);
    p.extend([0, 0, 0, 0, 0, 0]);
    p.push(rsrp);
    p.extend([0, 0]);
    p.extend(WIRELESS_TRAILER);

    // Terminal
    push_bcd(&mut p, TERMINAL_SERIAL);
    p.push(TERMINAL_TYPE);
    p.push(0x00);
    p.push(round_half_up(meter.voltage_v * 10.0).clamp(0.0, 255.0) as u8);

    // Meter
    push_bcd(&mut p, METER_ID);
    p.push(METER_TYPE);
    p.push(METER_CALIPER);
    p.push(meter.packet_status());
    p.push(MANUFACTURER_CODE);
    let temp = round_half_up(meter.temp_c).clamp(f64::from(i8::MIN), f64::from(i8::MAX)) as i8;
    p.push(temp as u8);
    p.extend([0, 0, 0]);

    // Schedule
    p.push(SCHEDULE_FLAG);
    p.push(period_hours(frame.read_period_ms));
    p.push(period_hours(frame.report_period_ms));
    p.extend(PacketTime::from_millis(frame.timestamp_ms, frame.utc_offset).to_bytes());

    // Data
    p.push(DATA_TYPE_CUMULATIVE);
    p.push(readings.len() as u8);
    p.push(0x00);
    if readings.is_empty() {
        p.extend([0, 0, 0, 0]);
    } else {
        for reading in readings.iter().rev() {
            p.extend(fixed_point(reading.usage_m3).to_le_bytes());
        }
    }

    // Finalize
    p[OFFSET_LENGTH] = (p.len() + 1) as u8;
    let sum = checksum(&p);
    p.push(sum);

    debug_assert_eq!(
        p.len(),
        HEADER_SIZE + READING_SIZE * readings.len().max(1) + 1
    );

    UplinkPacket::from(p)
}

pub fn decode(bytes: &[u8]) -> Result<DecodedPacket, PacketError> {
    if bytes.len() < MIN_PACKET_SIZE {
        return Err(PacketError::TooShort(bytes.len()));
    }
    if bytes[0] != PROTOCOL_ID {
        return Err(PacketError::BadHeader(bytes[0]));
    }

    let declared = usize::from(bytes[OFFSET_LENGTH]);
    if declared != bytes.len() {
        return Err(PacketError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 1);
    let expected = checksum(body);
    if expected != trailer[0] {
        return Err(PacketError::ChecksumMismatch {
            expected,
            found: trailer[0],
        });
    }

    let count = usize::from(bytes[OFFSET_COUNT]);
    if count > MAX_READINGS_PER_PACKET {
        return Err(PacketError::TooManyReadings(count));
    }
    let data_len = HEADER_SIZE + READING_SIZE * count.max(1) + 1;
    if data_len != bytes.len() {
        return Err(PacketError::LengthMismatch {
            declared: data_len,
            actual: bytes.len(),
        });
    }

    let readings_raw = bytes[HEADER_SIZE..HEADER_SIZE + READING_SIZE * count]
        .chunks_exact(READING_SIZE)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(DecodedPacket {
        length: declared,
        device_id: bcd_to_string(&bytes[OFFSET_DEVICE_ID..OFFSET_DEVICE_ID + 8]),
        network_id: bcd_to_string(&bytes[OFFSET_NETWORK_ID..OFFSET_NETWORK_ID + 8]),
        rsrp_magnitude: bytes[OFFSET_RSRP],
        terminal_serial: bcd_to_string(&bytes[OFFSET_SERIAL..OFFSET_SERIAL + 5]),
        voltage_tenths: bytes[OFFSET_VOLTAGE],
        meter_id: bcd_to_string(&bytes[OFFSET_METER_ID..OFFSET_METER_ID + 4]),
        meter_status: bytes[OFFSET_METER_STATUS],
        temperature_c: bytes[OFFSET_TEMPERATURE] as i8,
        read_period_hours: bytes[OFFSET_READ_HOURS],
        report_period_hours: bytes[OFFSET_REPORT_HOURS],
        time: PacketTime::from_bytes(&bytes[OFFSET_TIME..OFFSET_TIME + 6]),
        reading_count: count,
        readings_raw,
        checksum: trailer[0],
    })
}

pub fn to_hex(bytes: &[u8]) -> alloc::string::String {
    let mut out = alloc::string::String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&alloc::format!("{:02X}", b));
    }
    out
}

/// Parses hex text with or without whitespace between byte pairs.
pub fn from_hex(text: &str) -> Result<alloc::vec::Vec<u8>, PacketError> {
    let digits: alloc::vec::Vec<u8> = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_digit(16).map(|d| d as u8).ok_or(PacketError::InvalidHex))
        .collect::<Result<_, _>>()?;

    if digits.len() % 2 != 0 {
        return Err(PacketError::InvalidHex);
    }

    Ok(digits.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}
