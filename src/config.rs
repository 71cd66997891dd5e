use crate::clock::SpeedLevel;
use crate::device::meter::{DEFAULT_TEMPERATURE_C, DEFAULT_USAGE_M3, DEFAULT_VOLTAGE_V};
use crate::device::modem::{
    self, DEFAULT_READ_PERIOD_HOURS, DEFAULT_REPORT_PERIOD_HOURS, DEFAULT_RSRP_DBM,
};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("report period ({report_hours}h) must not be shorter than read period ({read_hours}h)")]
    ReportShorterThanRead { read_hours: u8, report_hours: u8 },
    #[error("read period must be at least one hour")]
    ZeroReadPeriod,
    #[error("UTC offset of {0} seconds is out of range")]
    InvalidUtcOffset(i32),
    #[error("failed to read config file: {0}")]
    Io(String),
    #[error("invalid config file: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialMeter {
    pub usage_m3: f64,
    pub flow_lph: f64,
    pub temp_c: f64,
    pub voltage_v: f64,
}

impl Default for InitialMeter {
    fn default() -> Self {
        Self {
            usage_m3: DEFAULT_USAGE_M3,
            flow_lph: 0.0,
            temp_c: DEFAULT_TEMPERATURE_C,
            voltage_v: DEFAULT_VOLTAGE_V,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Initial virtual time; wall clock when absent.
    pub start_time_ms: Option<i64>,
    pub speed: SpeedLevel,
    pub read_period_hours: u8,
    pub report_period_hours: u8,
    /// Offset used for the calendar fields of uplink timestamps.
    pub utc_offset_seconds: i32,
    pub rsrp_dbm: i32,
    pub initial_meter: InitialMeter,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_time_ms: None,
            speed: SpeedLevel::X1,
            read_period_hours: DEFAULT_READ_PERIOD_HOURS,
            report_period_hours: DEFAULT_REPORT_PERIOD_HOURS,
            utc_offset_seconds: 0,
            rsrp_dbm: DEFAULT_RSRP_DBM,
            initial_meter: InitialMeter::default(),
        }
    }
}

impl SimulationConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        modem::validate_periods(self.read_period_hours, self.report_period_hours)?;
        self.utc_offset()?;
        Ok(())
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_seconds)
            .ok_or(ConfigError::InvalidUtcOffset(self.utc_offset_seconds))
    }
}
